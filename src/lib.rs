#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! modemd library — the serial command core and CDMA helpers behind the
//! daemon binary.
//!
//! Key building blocks:
//! - `serial` — reference-counted port, sequential command queue, response
//!   demultiplexing, the V.250 parser
//! - `flow` — the generic step-machine pattern driving multi-step modem
//!   operations
//! - `cdma` — registration checking and the SMS PDU codec
//! - `config` — configuration loading
//! - `error` — the crate-wide error taxonomy

pub mod cdma;
pub mod config;
pub mod error;
pub mod flow;
pub mod serial;
pub mod util;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::Error;
pub use serial::{AtChannel, CommandOptions, PortConfig, PortEvent, PortTarget, SerialPort};
