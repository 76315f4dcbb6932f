//! Serial port abstraction: a reference-counted, force-closable port over a
//! TTY, Unix socket, or pre-supplied descriptor, with a strictly sequential
//! command queue on top.
//!
//! Each [`SerialPort`] spawns one task that owns the descriptor, the command
//! FIFO, the response buffer, and the reply cache. The public handle is a
//! cheap clone that talks to the task over a channel — no mutex, no shared
//! buffer. Unsolicited indications, forced-close and timeout notifications
//! come back out through a broadcast channel ([`PortEvent`]).

pub mod parser;
mod queue;
mod tty;

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
pub use parser::{AtParser, Notification, ResponseOutcome, ResponseParser};
use queue::Ctl;

/// Default AT command timeout.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Line parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Line discipline parameters applied when the target is a real TTY.
#[derive(Debug, Clone)]
pub struct LineSettings {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    /// Hardware RTS/CTS flow control.
    pub rts_cts: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            rts_cts: false,
        }
    }
}

/// What the port actually talks to.
#[derive(Debug)]
pub enum PortTarget {
    /// A character device path (`/dev/ttyUSB2`).
    Device(PathBuf),
    /// A Unix-domain socket path (virtual/proxied ports).
    Socket(PathBuf),
    /// A pre-supplied descriptor; dup'd on each open so reopen works.
    Fd(OwnedFd),
}

/// Per-port configuration, handed over at construction time by whatever
/// discovered the port.
#[derive(Debug)]
pub struct PortConfig {
    /// Short name used in logs (`ttyUSB2`).
    pub name: String,
    pub target: PortTarget,
    pub line: LineSettings,
    /// Inter-byte pacing for devices that drop bytes sent too fast.
    /// Zero means whole-command writes.
    pub send_delay: Duration,
    /// Whether the zero-baud flash sequence may touch this device.
    pub flash_allowed: bool,
}

impl PortConfig {
    pub fn new(name: impl Into<String>, target: PortTarget) -> Self {
        Self {
            name: name.into(),
            target,
            line: LineSettings::default(),
            send_delay: Duration::ZERO,
            flash_allowed: true,
        }
    }
}

/// Notifications emitted by the port task.
#[derive(Debug, Clone)]
pub enum PortEvent {
    /// The port was force-closed (hangup, fatal I/O error, or explicit
    /// request). Emitted exactly once per port lifetime.
    ForcedClose,
    /// A command timed out; carries the consecutive-timeout count. Upstream
    /// uses a run of these to decide the modem is dead.
    ResponseTimeouts(u32),
    /// An unsolicited message was demultiplexed out of the stream.
    Unsolicited(Notification),
    /// The response buffer exceeded its high-water mark and was trimmed.
    BufferOverrun { dropped: usize },
}

/// Per-command options for [`SerialPort::queue_command`].
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub timeout: Duration,
    /// Serve the response from the reply cache when possible; a fresh
    /// exchange refreshes the cache. `false` invalidates any cached entry.
    pub allow_cached: bool,
    pub cancel: Option<CancellationToken>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            allow_cached: false,
            cancel: None,
        }
    }
}

/// Cloneable handle to a port task.
#[derive(Clone)]
pub struct SerialPort {
    ctl: mpsc::UnboundedSender<Ctl>,
    events: broadcast::Sender<PortEvent>,
    flash_busy: Arc<AtomicBool>,
    reopen_busy: Arc<AtomicBool>,
    name: Arc<str>,
}

impl SerialPort {
    /// Create a port with the generic V.250 parser.
    pub fn new(config: PortConfig) -> Self {
        Self::with_parser(config, Box::new(AtParser::new()))
    }

    /// Create a port with a custom response parser.
    pub fn with_parser(config: PortConfig, parser: Box<dyn ResponseParser>) -> Self {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let name: Arc<str> = config.name.clone().into();
        tokio::spawn(queue::run(config, parser, ctl_rx, events.clone()));
        Self {
            ctl: ctl_tx,
            events,
            flash_busy: Arc::new(AtomicBool::new(false)),
            reopen_busy: Arc::new(AtomicBool::new(false)),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to port notifications (unsolicited messages, forced close,
    /// timeout counts, buffer overruns).
    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.events.subscribe()
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Ctl) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.ctl.send(make(tx)).map_err(|_| Error::PortGone)?;
        rx.await.map_err(|_| Error::PortGone)
    }

    /// Open the port (or take another reference to an already-open port).
    /// The first open allocates and configures the descriptor.
    pub async fn open(&self) -> Result<(), Error> {
        self.call(|reply| Ctl::Open { reply }).await?
    }

    /// Drop one open reference. The last close restores line settings and
    /// releases the descriptor, failing any still-queued commands.
    pub async fn close(&self) -> Result<(), Error> {
        self.call(|reply| Ctl::Close { reply }).await?
    }

    /// Unconditionally invalidate the port regardless of the reference
    /// count. Repeated calls are no-ops after the first.
    pub async fn force_close(&self) -> Result<(), Error> {
        self.call(|reply| Ctl::ForceClose { reply }).await
    }

    pub async fn is_open(&self) -> bool {
        self.call(|reply| Ctl::IsOpen { reply })
            .await
            .unwrap_or(false)
    }

    /// Close all balanced opens, wait `delay`, then restore the same number
    /// of opens. Only one reopen may be in flight.
    pub async fn reopen(&self, delay: Duration) -> Result<(), Error> {
        if self.reopen_busy.swap(true, Ordering::SeqCst) {
            return Err(Error::InProgress("reopen"));
        }
        let result = self.call(|reply| Ctl::Reopen { delay, reply }).await;
        self.reopen_busy.store(false, Ordering::SeqCst);
        result?
    }

    /// Drive the line to zero baud for `duration`, then restore the prior
    /// speed. Only one flash may be in flight. On a non-TTY target this is a
    /// timed no-op.
    pub async fn flash(&self, duration: Duration, ignore_errors: bool) -> Result<(), Error> {
        if self.flash_busy.swap(true, Ordering::SeqCst) {
            return Err(Error::InProgress("flash"));
        }
        let result = self
            .call(|reply| Ctl::Flash {
                duration,
                ignore_errors,
                reply,
            })
            .await;
        self.flash_busy.store(false, Ordering::SeqCst);
        result?
    }

    /// Toggle data-session ownership of the byte stream. While connected the
    /// port drops its exclusive lock, stops reading, and rejects commands.
    pub async fn set_connected(&self, connected: bool) -> Result<(), Error> {
        self.call(|reply| Ctl::SetConnected { connected, reply })
            .await?
    }

    /// Queue raw command bytes behind any in-flight command and await the
    /// response payload.
    pub async fn queue_command(
        &self,
        command: impl Into<Vec<u8>>,
        opts: CommandOptions,
    ) -> Result<Vec<u8>, Error> {
        self.call(|reply| Ctl::Command {
            bytes: command.into(),
            opts,
            reply,
        })
        .await?
    }

    /// Register a prefix whose lines are dispatched as unsolicited events
    /// instead of being treated as response data.
    pub async fn register_unsolicited(&self, prefix: &str) -> Result<(), Error> {
        self.call(|reply| Ctl::RegisterUnsolicited {
            prefix: prefix.to_string(),
            reply,
        })
        .await
    }

    /// Current consecutive-timeout count (resets on each success).
    pub async fn consecutive_timeouts(&self) -> u32 {
        self.call(|reply| Ctl::TimeoutCount { reply })
            .await
            .unwrap_or(0)
    }

    /// AT convenience wrapper: appends `\r`, decodes lossily, drops control
    /// garbage and residual echo lines.
    pub async fn at_command(&self, command: &str, timeout: Duration) -> Result<String, Error> {
        let mut bytes = command.as_bytes().to_vec();
        bytes.push(b'\r');
        let payload = self
            .queue_command(
                bytes,
                CommandOptions {
                    timeout,
                    ..CommandOptions::default()
                },
            )
            .await?;
        let text = String::from_utf8_lossy(&payload);
        Ok(parser::strip_echo(&parser::sanitize_response(&text)))
    }
}

/// Anything that can run an AT exchange. Lets step machines run against a
/// real [`SerialPort`] or a scripted stand-in in tests.
pub trait AtChannel: Send + Sync {
    fn at_command(
        &self,
        command: &str,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<String, Error>> + Send;
}

impl AtChannel for SerialPort {
    async fn at_command(&self, command: &str, timeout: Duration) -> Result<String, Error> {
        SerialPort::at_command(self, command, timeout).await
    }
}
