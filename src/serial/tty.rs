//! Descriptor-level primitives: open, termios configuration, exclusive
//! locking, closing-wait adjustment, and the zero-baud "flash" used by some
//! modems as a reset/attention trigger.
//!
//! Everything here is synchronous and runs on the port task. The descriptor
//! is opened `O_NONBLOCK` and stays that way; read readiness is handled by
//! the caller through `AsyncFd`, writes are attempted non-blocking with the
//! queue engine accounting for `EAGAIN`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, SetArg, Termios,
};
use tracing::{debug, warn};

use crate::error::Error;
use crate::serial::{LineSettings, Parity};

/// `closing_wait` value that tells the driver not to wait for pending
/// output on close (ASYNC_CLOSING_WAIT_NONE).
const CLOSING_WAIT_NONE: libc::c_ushort = 0xffff;

/// Open a character device read/write, non-blocking, without becoming its
/// controlling terminal. `ENOENT`/`ENXIO`/`ENODEV` map to the distinguished
/// device-not-present kind so callers can choose to retry.
pub fn open_device(path: &Path) -> Result<OwnedFd, Error> {
    let device = path.display().to_string();
    match fcntl::open(
        path,
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
        Mode::empty(),
    ) {
        // SAFETY: open() returned a fresh descriptor we now own.
        Ok(fd) => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
        Err(Errno::ENOENT | Errno::ENXIO | Errno::ENODEV) => {
            Err(Error::DeviceNotPresent(device))
        }
        Err(e) => Err(Error::OpenFailed {
            device,
            reason: e.to_string(),
        }),
    }
}

/// Connect a Unix-domain socket (virtual ports) and switch it non-blocking.
pub fn connect_socket(path: &Path) -> Result<OwnedFd, Error> {
    let device = path.display().to_string();
    let stream = UnixStream::connect(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::DeviceNotPresent(device.clone())
        } else {
            Error::OpenFailed {
                device: device.clone(),
                reason: e.to_string(),
            }
        }
    })?;
    stream.set_nonblocking(true).map_err(|e| Error::OpenFailed {
        device,
        reason: format!("set_nonblocking: {e}"),
    })?;
    Ok(stream.into())
}

/// Duplicate a pre-supplied descriptor and switch the copy non-blocking.
///
/// Each open dups the original so balanced close/reopen cycles work the same
/// way they do for path-backed ports.
pub fn dup_fd(fd: &OwnedFd, device: &str) -> Result<OwnedFd, Error> {
    let copy = nix::unistd::dup(fd.as_raw_fd()).map_err(|e| Error::OpenFailed {
        device: device.to_string(),
        reason: format!("dup: {e}"),
    })?;
    // SAFETY: dup() returned a fresh descriptor we now own.
    let owned = unsafe { OwnedFd::from_raw_fd(copy) };
    let flags = fcntl::fcntl(owned.as_raw_fd(), fcntl::FcntlArg::F_GETFL).map_err(|e| {
        Error::OpenFailed {
            device: device.to_string(),
            reason: format!("F_GETFL: {e}"),
        }
    })?;
    let oflags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl::fcntl(owned.as_raw_fd(), fcntl::FcntlArg::F_SETFL(oflags)).map_err(|e| {
        Error::OpenFailed {
            device: device.to_string(),
            reason: format!("F_SETFL: {e}"),
        }
    })?;
    Ok(owned)
}

fn map_baud(baud: u32) -> Result<BaudRate, Error> {
    Ok(match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        460_800 => BaudRate::B460800,
        921_600 => BaudRate::B921600,
        other => {
            return Err(Error::ConfigFailed {
                device: String::new(),
                reason: format!("unsupported baud rate {other}"),
            })
        }
    })
}

/// Apply line settings to a TTY: raw mode, baud, character size, parity,
/// stop bits, `CLOCAL|CREAD`, RTS/CTS per config.
///
/// Returns the original termios so [`restore`] can undo everything on the
/// final close.
pub fn configure(fd: &OwnedFd, settings: &LineSettings, device: &str) -> Result<Termios, Error> {
    let cfg_err = |reason: String| Error::ConfigFailed {
        device: device.to_string(),
        reason,
    };

    let original = termios::tcgetattr(fd).map_err(|e| cfg_err(format!("tcgetattr: {e}")))?;
    let mut tio = original.clone();

    termios::cfmakeraw(&mut tio);

    let baud = map_baud(settings.baud).map_err(|e| match e {
        Error::ConfigFailed { reason, .. } => cfg_err(reason),
        other => other,
    })?;
    termios::cfsetispeed(&mut tio, baud).map_err(|e| cfg_err(format!("cfsetispeed: {e}")))?;
    termios::cfsetospeed(&mut tio, baud).map_err(|e| cfg_err(format!("cfsetospeed: {e}")))?;

    tio.control_flags &= !ControlFlags::CSIZE;
    tio.control_flags |= match settings.data_bits {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        8 => ControlFlags::CS8,
        n => return Err(cfg_err(format!("unsupported character size {n}"))),
    };

    match settings.parity {
        Parity::None => {
            tio.control_flags &= !(ControlFlags::PARENB | ControlFlags::PARODD);
        }
        Parity::Even => {
            tio.control_flags |= ControlFlags::PARENB;
            tio.control_flags &= !ControlFlags::PARODD;
        }
        Parity::Odd => {
            tio.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD;
        }
    }

    match settings.stop_bits {
        1 => tio.control_flags &= !ControlFlags::CSTOPB,
        2 => tio.control_flags |= ControlFlags::CSTOPB,
        n => return Err(cfg_err(format!("unsupported stop bits {n}"))),
    }

    // Ignore modem control lines, enable the receiver.
    tio.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
    if settings.rts_cts {
        tio.control_flags |= ControlFlags::CRTSCTS;
    } else {
        tio.control_flags &= !ControlFlags::CRTSCTS;
    }

    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)
        .map_err(|e| cfg_err(format!("tcsetattr: {e}")))?;

    Ok(original)
}

/// Restore saved termios and flush both directions. Best-effort; the port is
/// going away regardless.
pub fn restore(fd: &OwnedFd, original: &Termios, device: &str) {
    if let Err(e) = termios::tcsetattr(fd, SetArg::TCSANOW, original) {
        debug!("{device}: restore termios failed: {e}");
    }
    if let Err(e) = termios::tcflush(fd, termios::FlushArg::TCIOFLUSH) {
        debug!("{device}: tcflush failed: {e}");
    }
}

/// Take or drop the kernel exclusive-use lock (`TIOCEXCL`/`TIOCNXCL`).
/// Best-effort: a failure is logged, never fatal.
pub fn set_exclusive(fd: &OwnedFd, exclusive: bool, device: &str) {
    let req = if exclusive {
        libc::TIOCEXCL
    } else {
        libc::TIOCNXCL
    };
    // SAFETY: plain ioctl with no argument on a descriptor we own.
    let rc = unsafe { libc::ioctl(fd.as_raw_fd(), req) };
    if rc < 0 {
        warn!(
            "{device}: could not {} exclusive lock: {}",
            if exclusive { "take" } else { "drop" },
            std::io::Error::last_os_error()
        );
    }
}

/// Linux `struct serial_struct`, used only to neuter `closing_wait`.
#[repr(C)]
#[derive(Clone, Copy)]
struct SerialStruct {
    type_: libc::c_int,
    line: libc::c_int,
    port: libc::c_uint,
    irq: libc::c_int,
    flags: libc::c_int,
    xmit_fifo_size: libc::c_int,
    custom_divisor: libc::c_int,
    baud_base: libc::c_int,
    close_delay: libc::c_ushort,
    io_type: libc::c_char,
    reserved_char: [libc::c_char; 1],
    hub6: libc::c_int,
    closing_wait: libc::c_ushort,
    closing_wait2: libc::c_ushort,
    iomem_base: *mut libc::c_uchar,
    iomem_reg_shift: libc::c_ushort,
    port_high: libc::c_uint,
    iomap_base: libc::c_ulong,
}

/// Tell the driver not to block close(2) waiting for the UART to drain.
/// Some drivers wait up to 30s here when a device wedges. Best-effort;
/// `ENOTTY` is normal on sockets and USB ACM devices.
pub fn disable_closing_wait(fd: &OwnedFd, device: &str) {
    let mut info: SerialStruct = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGSERIAL fills the struct; TIOCSSERIAL reads it back.
    unsafe {
        if libc::ioctl(fd.as_raw_fd(), libc::TIOCGSERIAL, &mut info) < 0 {
            debug!("{device}: TIOCGSERIAL not supported, leaving closing_wait alone");
            return;
        }
        if info.closing_wait == CLOSING_WAIT_NONE {
            return;
        }
        info.closing_wait = CLOSING_WAIT_NONE;
        if libc::ioctl(fd.as_raw_fd(), libc::TIOCSSERIAL, &info) < 0 {
            debug!(
                "{device}: TIOCSSERIAL failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Saved input/output speeds captured before a flash drops the line to B0.
pub struct SavedSpeed {
    ispeed: BaudRate,
    ospeed: BaudRate,
}

/// Drop the line to zero baud (the "flash" condition). Returns the previous
/// speeds for [`restore_speed`].
pub fn drop_to_zero_baud(fd: &OwnedFd, device: &str) -> Result<SavedSpeed, Error> {
    let flash_err = |reason: String| Error::FlashFailed(format!("{device}: {reason}"));

    let mut tio = termios::tcgetattr(fd).map_err(|e| flash_err(format!("tcgetattr: {e}")))?;
    let saved = SavedSpeed {
        ispeed: termios::cfgetispeed(&tio),
        ospeed: termios::cfgetospeed(&tio),
    };
    termios::cfsetispeed(&mut tio, BaudRate::B0)
        .map_err(|e| flash_err(format!("cfsetispeed: {e}")))?;
    termios::cfsetospeed(&mut tio, BaudRate::B0)
        .map_err(|e| flash_err(format!("cfsetospeed: {e}")))?;
    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)
        .map_err(|e| flash_err(format!("tcsetattr: {e}")))?;
    Ok(saved)
}

/// Restore the speeds saved by [`drop_to_zero_baud`].
pub fn restore_speed(fd: &OwnedFd, saved: &SavedSpeed, device: &str) -> Result<(), Error> {
    let flash_err = |reason: String| Error::FlashFailed(format!("{device}: {reason}"));

    let mut tio = termios::tcgetattr(fd).map_err(|e| flash_err(format!("tcgetattr: {e}")))?;
    termios::cfsetispeed(&mut tio, saved.ispeed)
        .map_err(|e| flash_err(format!("cfsetispeed: {e}")))?;
    termios::cfsetospeed(&mut tio, saved.ospeed)
        .map_err(|e| flash_err(format!("cfsetospeed: {e}")))?;
    termios::tcsetattr(fd, SetArg::TCSANOW, &tio)
        .map_err(|e| flash_err(format!("tcsetattr: {e}")))?;
    Ok(())
}
