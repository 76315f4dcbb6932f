//! The per-port task: reference-counted open/close, the sequential command
//! queue, response demultiplexing, timeouts, cancellation, and the reply
//! cache.
//!
//! One task owns everything — descriptor, FIFO, response buffer, cache — and
//! callers reach it through [`Ctl`] messages with oneshot replies. At most
//! one command is ever in flight: the next queued command is not touched
//! until the current one has completed (response, timeout, cancellation, or
//! port closure) and its consumed bytes have been drained from the buffer.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::termios::{self, Termios};
use tokio::io::unix::AsyncFd;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::serial::parser::{ResponseOutcome, ResponseParser};
use crate::serial::{tty, CommandOptions, PortConfig, PortEvent, PortTarget};
use crate::util::printable;

/// Read chunk size (command responses are small).
const READ_BUF_SIZE: usize = 1024;

/// Retry tick for would-block writes when no inter-byte delay is configured.
const EAGAIN_RETRY_TICK: Duration = Duration::from_millis(10);

/// Response-buffer high-water mark. A hung or chatty device can flood the
/// buffer while no command is outstanding; past this point the oldest bytes
/// are dropped and listeners are told.
const BUFFER_HIGH_WATER: usize = 16 * 1024;

/// Control messages from the [`super::SerialPort`] handle.
pub(crate) enum Ctl {
    Open {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Close {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    ForceClose {
        reply: oneshot::Sender<()>,
    },
    IsOpen {
        reply: oneshot::Sender<bool>,
    },
    SetConnected {
        connected: bool,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Reopen {
        delay: Duration,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Flash {
        duration: Duration,
        ignore_errors: bool,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Command {
        bytes: Vec<u8>,
        opts: CommandOptions,
        reply: oneshot::Sender<Result<Vec<u8>, Error>>,
    },
    RegisterUnsolicited {
        prefix: String,
        reply: oneshot::Sender<()>,
    },
    TimeoutCount {
        reply: oneshot::Sender<u32>,
    },
}

/// One pending request.
struct Entry {
    bytes: Vec<u8>,
    opts: CommandOptions,
    reply: oneshot::Sender<Result<Vec<u8>, Error>>,
}

/// The command currently being written or awaiting its response.
struct Inflight {
    entry: Entry,
    cursor: usize,
    started: bool,
    eagain_left: u32,
    next_write: Instant,
    /// Set once the command is fully on the wire; the response timer.
    deadline: Option<Instant>,
}

/// Live descriptor state while the port is open.
struct OpenIo {
    fd: AsyncFd<OwnedFd>,
    /// Saved termios, restored on the final close (TTYs only).
    original: Option<Termios>,
    is_tty: bool,
}

enum ReadEvent {
    Data(Vec<u8>),
    Closed,
    Fatal(String),
}

enum SendStep {
    Progress,
    FullyWritten,
    WouldBlock,
    BudgetExhausted,
    Fatal(String),
}

enum Wake {
    Ctl(Option<Ctl>),
    Read(ReadEvent),
    WriteTick,
    ResponseDeadline,
    Cancelled,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn cancelled_opt(token: Option<tokio_util::sync::CancellationToken>) {
    match token {
        Some(t) => t.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Wait for readable and pull one chunk. Returns `pending` forever when the
/// port is closed or connected, so the select arm simply never fires.
async fn read_some(io: Option<&AsyncFd<OwnedFd>>, enabled: bool) -> ReadEvent {
    let Some(open) = io else {
        return std::future::pending().await;
    };
    if !enabled {
        return std::future::pending().await;
    }
    loop {
        let mut guard = match open.readable().await {
            Ok(g) => g,
            Err(e) => return ReadEvent::Fatal(e.to_string()),
        };
        let mut chunk = vec![0u8; READ_BUF_SIZE];
        match guard.try_io(|inner| {
            nix::unistd::read(inner.get_ref().as_raw_fd(), &mut chunk)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
        }) {
            Ok(Ok(0)) => return ReadEvent::Closed,
            Ok(Ok(n)) => {
                chunk.truncate(n);
                return ReadEvent::Data(chunk);
            }
            Ok(Err(e)) => return ReadEvent::Fatal(e.to_string()),
            // Readiness was stale; wait again.
            Err(_would_block) => {}
        }
    }
}

pub(crate) async fn run(
    config: PortConfig,
    parser: Box<dyn ResponseParser>,
    ctl_rx: mpsc::UnboundedReceiver<Ctl>,
    events: broadcast::Sender<PortEvent>,
) {
    Actor {
        config,
        parser,
        ctl_rx,
        events,
        open_count: 0,
        io: None,
        forced: false,
        connected: false,
        queue: VecDeque::new(),
        inflight: None,
        buffer: Vec::new(),
        cache: HashMap::new(),
        consecutive_timeouts: 0,
    }
    .run()
    .await;
}

struct Actor {
    config: PortConfig,
    parser: Box<dyn ResponseParser>,
    ctl_rx: mpsc::UnboundedReceiver<Ctl>,
    events: broadcast::Sender<PortEvent>,
    open_count: u32,
    io: Option<OpenIo>,
    forced: bool,
    connected: bool,
    queue: VecDeque<Entry>,
    inflight: Option<Inflight>,
    buffer: Vec<u8>,
    cache: HashMap<Vec<u8>, Vec<u8>>,
    consecutive_timeouts: u32,
}

impl Actor {
    async fn run(mut self) {
        loop {
            self.maybe_dispatch();

            let read_enabled = !self.connected;
            let write_tick = self
                .inflight
                .as_ref()
                .filter(|i| i.deadline.is_none())
                .map(|i| i.next_write);
            let deadline = self.inflight.as_ref().and_then(|i| i.deadline);
            let cancel = self
                .inflight
                .as_ref()
                .and_then(|i| i.entry.opts.cancel.clone());

            let wake = tokio::select! {
                msg = self.ctl_rx.recv() => Wake::Ctl(msg),
                ev = read_some(self.io.as_ref().map(|o| &o.fd), read_enabled) => Wake::Read(ev),
                () = sleep_until_opt(write_tick) => Wake::WriteTick,
                () = sleep_until_opt(deadline) => Wake::ResponseDeadline,
                () = cancelled_opt(cancel) => Wake::Cancelled,
            };

            match wake {
                Wake::Ctl(None) => break,
                Wake::Ctl(Some(ctl)) => self.handle_ctl(ctl).await,
                Wake::Read(ev) => self.handle_read(ev),
                Wake::WriteTick => self.continue_send(),
                Wake::ResponseDeadline => self.fail_inflight_timeout(Error::ResponseTimeout),
                Wake::Cancelled => self.complete_inflight(Err(Error::Cancelled)),
            }
        }

        // All handles dropped; release everything.
        self.teardown(Error::PortClosed);
    }

    async fn handle_ctl(&mut self, ctl: Ctl) {
        match ctl {
            Ctl::Open { reply } => {
                let _ = reply.send(self.do_open());
            }
            Ctl::Close { reply } => {
                let _ = reply.send(self.do_close());
            }
            Ctl::ForceClose { reply } => {
                self.do_force_close();
                let _ = reply.send(());
            }
            Ctl::IsOpen { reply } => {
                let _ = reply.send(self.io.is_some());
            }
            Ctl::SetConnected { connected, reply } => {
                let _ = reply.send(self.do_set_connected(connected));
            }
            Ctl::Reopen { delay, reply } => {
                let result = self.do_reopen(delay).await;
                let _ = reply.send(result);
            }
            Ctl::Flash {
                duration,
                ignore_errors,
                reply,
            } => {
                let result = self.do_flash(duration, ignore_errors).await;
                let _ = reply.send(result);
            }
            Ctl::Command { bytes, opts, reply } => {
                self.enqueue(Entry { bytes, opts, reply });
            }
            Ctl::RegisterUnsolicited { prefix, reply } => {
                self.parser.register_unsolicited(&prefix);
                let _ = reply.send(());
            }
            Ctl::TimeoutCount { reply } => {
                let _ = reply.send(self.consecutive_timeouts);
            }
        }
    }

    // ── Open / close ─────────────────────────────────────────────────

    fn do_open(&mut self) -> Result<(), Error> {
        if self.forced {
            return Err(Error::OpenFailed {
                device: self.config.name.clone(),
                reason: "port was force-closed".into(),
            });
        }
        if self.io.is_some() {
            self.open_count += 1;
            return Ok(());
        }

        let fd = match &self.config.target {
            PortTarget::Device(path) => tty::open_device(path)?,
            PortTarget::Socket(path) => tty::connect_socket(path)?,
            PortTarget::Fd(master) => tty::dup_fd(master, &self.config.name)?,
        };

        let is_tty = nix::unistd::isatty(fd.as_raw_fd()).unwrap_or(false);
        let mut original = None;
        if is_tty {
            original = Some(tty::configure(&fd, &self.config.line, &self.config.name)?);
            tty::set_exclusive(&fd, true, &self.config.name);
            tty::disable_closing_wait(&fd, &self.config.name);
            // Clear stale bytes left over from whoever held the line before.
            if let Err(e) = termios::tcflush(&fd, termios::FlushArg::TCIOFLUSH) {
                debug!("{}: tcflush on open failed: {e}", self.config.name);
            }
        }

        let fd = AsyncFd::new(fd).map_err(|e| Error::OpenFailed {
            device: self.config.name.clone(),
            reason: format!("reactor registration: {e}"),
        })?;

        self.io = Some(OpenIo {
            fd,
            original,
            is_tty,
        });
        self.open_count = 1;
        self.buffer.clear();
        info!(
            "{}: opened ({}){}",
            self.config.name,
            if is_tty { "tty" } else { "socket" },
            if is_tty {
                format!(" {} baud", self.config.line.baud)
            } else {
                String::new()
            }
        );
        Ok(())
    }

    fn do_close(&mut self) -> Result<(), Error> {
        if self.io.is_none() {
            return Err(Error::NotOpen);
        }
        self.open_count = self.open_count.saturating_sub(1);
        if self.open_count == 0 {
            self.teardown(Error::PortClosed);
            info!("{}: closed", self.config.name);
        }
        Ok(())
    }

    fn do_force_close(&mut self) {
        if self.forced {
            return;
        }
        self.forced = true;
        self.open_count = 0;
        self.teardown(Error::PortClosed);
        warn!("{}: force-closed", self.config.name);
        let _ = self.events.send(PortEvent::ForcedClose);
    }

    /// Release the descriptor and fail every outstanding command with `err`.
    fn teardown(&mut self, err: Error) {
        if let Some(open) = self.io.take() {
            let fd = open.fd.into_inner();
            if open.is_tty {
                if let Some(original) = &open.original {
                    tty::restore(&fd, original, &self.config.name);
                }
                tty::set_exclusive(&fd, false, &self.config.name);
            }
            drop(fd);
        }
        self.connected = false;
        if let Some(inflight) = self.inflight.take() {
            let _ = inflight.entry.reply.send(Err(err.clone()));
        }
        while let Some(entry) = self.queue.pop_front() {
            let _ = entry.reply.send(Err(err.clone()));
        }
        self.buffer.clear();
    }

    fn do_set_connected(&mut self, connected: bool) -> Result<(), Error> {
        let Some(open) = &self.io else {
            return Err(Error::NotOpen);
        };
        if connected == self.connected {
            return Ok(());
        }
        // Hand the line over: the data session needs the lock gone and the
        // port must stop stealing its bytes (read arm keys off `connected`).
        if open.is_tty {
            tty::set_exclusive(open.fd.get_ref(), !connected, &self.config.name);
        }
        self.connected = connected;
        info!(
            "{}: {}",
            self.config.name,
            if connected {
                "connected, data session owns the stream"
            } else {
                "disconnected, back in command mode"
            }
        );
        Ok(())
    }

    async fn do_reopen(&mut self, delay: Duration) -> Result<(), Error> {
        if self.io.is_none() {
            return Err(Error::NotOpen);
        }
        let opens = self.open_count;
        self.open_count = 0;
        self.teardown(Error::PortClosed);
        info!("{}: reopening ({} refs)", self.config.name, opens);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        for _ in 0..opens {
            self.do_open()?;
        }
        Ok(())
    }

    async fn do_flash(&mut self, duration: Duration, ignore_errors: bool) -> Result<(), Error> {
        let Some(open) = &self.io else {
            return Err(Error::NotOpen);
        };
        if !self.config.flash_allowed {
            debug!("{}: flash not allowed on this port, skipping", self.config.name);
            return Ok(());
        }
        if !open.is_tty {
            tokio::time::sleep(duration).await;
            return Ok(());
        }

        let saved = match tty::drop_to_zero_baud(open.fd.get_ref(), &self.config.name) {
            Ok(saved) => saved,
            Err(e) if ignore_errors => {
                debug!("{}: {e} (ignored)", self.config.name);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        tokio::time::sleep(duration).await;
        // The port may have been torn down while we slept.
        let Some(open) = &self.io else {
            return Err(Error::PortClosed);
        };
        match tty::restore_speed(open.fd.get_ref(), &saved, &self.config.name) {
            Ok(()) => Ok(()),
            Err(e) if ignore_errors => {
                debug!("{}: {e} (ignored)", self.config.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ── Command queue ────────────────────────────────────────────────

    fn enqueue(&mut self, entry: Entry) {
        if self.io.is_none() {
            let _ = entry.reply.send(Err(Error::NotOpen));
            return;
        }
        if self.connected {
            let _ = entry.reply.send(Err(Error::Connected));
            return;
        }
        // Issuing a command uncached invalidates whatever was stored for it.
        if !entry.opts.allow_cached {
            self.cache.remove(&entry.bytes);
        }
        self.queue.push_back(entry);
    }

    /// Promote the next queued entry to in-flight. Cache hits and
    /// already-cancelled entries complete here without touching the wire.
    fn maybe_dispatch(&mut self) {
        while self.inflight.is_none() {
            let Some(entry) = self.queue.pop_front() else {
                return;
            };
            if let Some(token) = &entry.opts.cancel {
                if token.is_cancelled() {
                    let _ = entry.reply.send(Err(Error::Cancelled));
                    continue;
                }
            }
            if entry.opts.allow_cached {
                if let Some(cached) = self.cache.get(&entry.bytes) {
                    debug!(
                        "{}: <-- (cached) '{}'",
                        self.config.name,
                        printable(cached, 120)
                    );
                    let _ = entry.reply.send(Ok(cached.clone()));
                    continue;
                }
            }

            let tick = self.send_tick();
            // Bound total would-block waiting by the command timeout.
            let budget = (entry.opts.timeout.as_millis() / tick.as_millis().max(1)).max(1) as u32;
            self.inflight = Some(Inflight {
                entry,
                cursor: 0,
                started: false,
                eagain_left: budget,
                next_write: Instant::now(),
                deadline: None,
            });
        }
    }

    fn send_tick(&self) -> Duration {
        let per_byte = self
            .io
            .as_ref()
            .is_some_and(|o| o.is_tty && !self.config.send_delay.is_zero());
        if per_byte {
            self.config.send_delay
        } else {
            EAGAIN_RETRY_TICK
        }
    }

    /// One write attempt: a single byte when inter-byte pacing applies,
    /// the whole remainder otherwise.
    fn continue_send(&mut self) {
        let tick = self.send_tick();
        let step = {
            let (Some(inflight), Some(open)) = (self.inflight.as_mut(), self.io.as_ref()) else {
                return;
            };
            if !inflight.started {
                debug!(
                    "{}: --> '{}'",
                    self.config.name,
                    printable(&inflight.entry.bytes, 120)
                );
                inflight.started = true;
            }
            let per_byte = open.is_tty && !self.config.send_delay.is_zero();
            let end = if per_byte {
                inflight.cursor + 1
            } else {
                inflight.entry.bytes.len()
            };
            match nix::unistd::write(open.fd.get_ref(), &inflight.entry.bytes[inflight.cursor..end])
            {
                Ok(n) => {
                    inflight.cursor += n;
                    if inflight.cursor >= inflight.entry.bytes.len() {
                        inflight.deadline = Some(Instant::now() + inflight.entry.opts.timeout);
                        SendStep::FullyWritten
                    } else {
                        inflight.next_write = Instant::now() + if per_byte { tick } else { Duration::ZERO };
                        SendStep::Progress
                    }
                }
                Err(Errno::EAGAIN) => {
                    if inflight.eagain_left == 0 {
                        SendStep::BudgetExhausted
                    } else {
                        inflight.eagain_left -= 1;
                        inflight.next_write = Instant::now() + tick;
                        SendStep::WouldBlock
                    }
                }
                Err(e) => SendStep::Fatal(e.to_string()),
            }
        };

        match step {
            SendStep::Progress | SendStep::FullyWritten | SendStep::WouldBlock => {}
            SendStep::BudgetExhausted => {
                warn!("{}: send stalled, would-block budget exhausted", self.config.name);
                self.fail_inflight_timeout(Error::SendTimeout);
            }
            SendStep::Fatal(e) => {
                warn!("{}: write failed: {e}", self.config.name);
                self.do_force_close();
            }
        }
    }

    // ── Read path ────────────────────────────────────────────────────

    fn handle_read(&mut self, ev: ReadEvent) {
        match ev {
            ReadEvent::Data(chunk) => {
                self.buffer.extend_from_slice(&chunk);
                self.process_buffer();
            }
            ReadEvent::Closed => {
                warn!("{}: hangup", self.config.name);
                self.do_force_close();
            }
            ReadEvent::Fatal(e) => {
                warn!("{}: read failed: {e}", self.config.name);
                self.do_force_close();
            }
        }
    }

    /// Runs on every buffer append: unsolicited extraction first, then
    /// response completion, then the high-water check.
    fn process_buffer(&mut self) {
        for note in self.parser.extract_unsolicited(&mut self.buffer) {
            debug!("{}: unsolicited '{}'", self.config.name, note.line);
            let _ = self.events.send(PortEvent::Unsolicited(note));
        }

        let awaiting = self
            .inflight
            .as_ref()
            .is_some_and(|i| i.deadline.is_some());
        if awaiting {
            match self.parser.try_parse_response(&self.buffer) {
                ResponseOutcome::Incomplete => {}
                ResponseOutcome::Success { consumed, payload } => {
                    self.buffer.drain(..consumed);
                    self.complete_inflight(Ok(payload));
                }
                ResponseOutcome::Failure { consumed, error } => {
                    self.buffer.drain(..consumed);
                    self.complete_inflight(Err(error));
                }
            }
        }

        if self.buffer.len() > BUFFER_HIGH_WATER {
            let dropped = self.buffer.len() - BUFFER_HIGH_WATER / 2;
            self.buffer.drain(..dropped);
            warn!(
                "{}: response buffer over high-water mark, dropped {dropped} bytes",
                self.config.name
            );
            let _ = self.events.send(PortEvent::BufferOverrun { dropped });
        }
    }

    // ── Completion ───────────────────────────────────────────────────

    /// Deliver the result for the in-flight command and let the dispatch
    /// loop pick up the next one. A success resets the consecutive-timeout
    /// counter and refreshes the reply cache.
    fn complete_inflight(&mut self, result: Result<Vec<u8>, Error>) {
        let Some(inflight) = self.inflight.take() else {
            return;
        };
        if let Ok(payload) = &result {
            self.consecutive_timeouts = 0;
            debug!("{}: <-- '{}'", self.config.name, printable(payload, 120));
            self.cache
                .insert(inflight.entry.bytes.clone(), payload.clone());
        }
        let _ = inflight.entry.reply.send(result);
    }

    /// Timeout-flavored completion: bumps the consecutive-timeout counter
    /// and notifies listeners before delivering the error.
    fn fail_inflight_timeout(&mut self, error: Error) {
        self.consecutive_timeouts += 1;
        warn!(
            "{}: {} ({} consecutive)",
            self.config.name, error, self.consecutive_timeouts
        );
        let _ = self
            .events
            .send(PortEvent::ResponseTimeouts(self.consecutive_timeouts));
        self.complete_inflight(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    use crate::error::Error;
    use crate::serial::{CommandOptions, PortConfig, PortEvent, PortTarget, SerialPort};

    /// A port wired to one end of a socketpair; the other end plays the
    /// modem. Exercises the real descriptor path, no mocks.
    async fn pair_port() -> (SerialPort, tokio::net::UnixStream) {
        let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        theirs.set_nonblocking(true).unwrap();
        let peer = tokio::net::UnixStream::from_std(theirs).unwrap();
        let port = SerialPort::new(PortConfig::new("test", PortTarget::Fd(ours.into())));
        port.open().await.unwrap();
        (port, peer)
    }

    fn opts(timeout_ms: u64) -> CommandOptions {
        CommandOptions {
            timeout: Duration::from_millis(timeout_ms),
            ..CommandOptions::default()
        }
    }

    async fn read_exact_string(peer: &mut tokio::net::UnixStream, len: usize) -> String {
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order_one_at_a_time() {
        let (port, mut peer) = pair_port().await;

        let driver = tokio::spawn(async move {
            for i in 0..3 {
                // Reading exactly one command before answering proves the
                // next command was not written early.
                let cmd = read_exact_string(&mut peer, 5).await;
                assert_eq!(cmd, format!("CMD{i}\r"));
                peer.write_all(format!("\r\nRESP{i}\r\nOK\r\n").as_bytes())
                    .await
                    .unwrap();
            }
            peer
        });

        let (r0, r1, r2) = tokio::join!(
            port.queue_command(b"CMD0\r".to_vec(), opts(2000)),
            port.queue_command(b"CMD1\r".to_vec(), opts(2000)),
            port.queue_command(b"CMD2\r".to_vec(), opts(2000)),
        );
        assert_eq!(r0.unwrap(), b"RESP0");
        assert_eq!(r1.unwrap(), b"RESP1");
        assert_eq!(r2.unwrap(), b"RESP2");
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_cached_response_skips_wire() {
        let (port, mut peer) = pair_port().await;

        let send = CommandOptions {
            allow_cached: true,
            ..opts(2000)
        };

        let driver = tokio::spawn(async move {
            let _ = read_exact_string(&mut peer, 8).await;
            peer.write_all(b"\r\n+GCAP: +CGSM\r\nOK\r\n").await.unwrap();
            peer
        });
        let first = port
            .queue_command(b"AT+GCAP\r".to_vec(), send.clone())
            .await
            .unwrap();
        let mut peer = driver.await.unwrap();

        // Second exchange must come from the cache, byte-identical, with
        // nothing hitting the wire.
        let second = port
            .queue_command(b"AT+GCAP\r".to_vec(), send)
            .await
            .unwrap();
        assert_eq!(first, second);

        let mut probe = [0u8; 16];
        assert!(matches!(
            peer.try_read(&mut probe),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));
    }

    #[tokio::test]
    async fn test_uncached_command_invalidates_cache() {
        let (port, mut peer) = pair_port().await;

        let cached = CommandOptions {
            allow_cached: true,
            ..opts(2000)
        };

        let driver = tokio::spawn(async move {
            let _ = read_exact_string(&mut peer, 8).await;
            peer.write_all(b"\r\nFIRST\r\nOK\r\n").await.unwrap();
            // The uncached re-issue must hit the wire again.
            let _ = read_exact_string(&mut peer, 8).await;
            peer.write_all(b"\r\nSECOND\r\nOK\r\n").await.unwrap();
        });

        let first = port
            .queue_command(b"AT+GCAP\r".to_vec(), cached.clone())
            .await
            .unwrap();
        assert_eq!(first, b"FIRST");

        let fresh = port
            .queue_command(b"AT+GCAP\r".to_vec(), opts(2000))
            .await
            .unwrap();
        assert_eq!(fresh, b"SECOND");

        // Cache now holds the refreshed response.
        let third = port
            .queue_command(b"AT+GCAP\r".to_vec(), cached)
            .await
            .unwrap();
        assert_eq!(third, b"SECOND");
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_response_timeout_and_counter() {
        let (port, mut peer) = pair_port().await;

        let start = Instant::now();
        let err = port
            .queue_command(b"AT\r".to_vec(), opts(100))
            .await
            .unwrap_err();
        assert_eq!(err, Error::ResponseTimeout);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(port.consecutive_timeouts().await, 1);

        // A success resets the counter.
        let driver = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(b"\r\nOK\r\n").await.unwrap();
            peer
        });
        port.queue_command(b"AT\r".to_vec(), opts(2000))
            .await
            .unwrap();
        assert_eq!(port.consecutive_timeouts().await, 0);
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_mid_flight() {
        // Nothing ever answers; the 5s command must complete early with a
        // cancellation error and leave the timeout counter alone.
        let (port, _peer) = pair_port().await;

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let start = Instant::now();
        let err = port
            .queue_command(
                b"AT\r".to_vec(),
                CommandOptions {
                    timeout: Duration::from_secs(5),
                    allow_cached: false,
                    cancel: Some(token),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, Error::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(port.consecutive_timeouts().await, 0);
    }

    #[tokio::test]
    async fn test_forced_close_drains_queue_once() {
        let (port, _peer) = pair_port().await;
        let mut events = port.subscribe();

        let c0 = port.queue_command(b"CMD0\r".to_vec(), opts(5000));
        let c1 = port.queue_command(b"CMD1\r".to_vec(), opts(5000));
        let c2 = port.queue_command(b"CMD2\r".to_vec(), opts(5000));
        let force = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            port.force_close().await.unwrap();
            // Repeat is a no-op and must not emit a second notification.
            port.force_close().await.unwrap();
        };

        let (r0, r1, r2, ()) = tokio::join!(c0, c1, c2, force);
        assert_eq!(r0.unwrap_err(), Error::PortClosed);
        assert_eq!(r1.unwrap_err(), Error::PortClosed);
        assert_eq!(r2.unwrap_err(), Error::PortClosed);

        assert!(matches!(events.try_recv(), Ok(PortEvent::ForcedClose)));
        assert!(events.try_recv().is_err());

        assert!(!port.is_open().await);
        // A force-closed port stays dead.
        assert!(matches!(
            port.open().await.unwrap_err(),
            Error::OpenFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_eagain_budget_exhaustion() {
        // The peer never reads, so the socket buffer fills and writes start
        // returning would-block. The retry budget must bound the stall.
        let (port, _peer) = pair_port().await;

        let start = Instant::now();
        let err = port
            .queue_command(vec![b'A'; 4 * 1024 * 1024], opts(300))
            .await
            .unwrap_err();
        assert_eq!(err, Error::SendTimeout);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(port.consecutive_timeouts().await, 1);
    }

    #[tokio::test]
    async fn test_unsolicited_interleaved_with_response() {
        let (port, mut peer) = pair_port().await;
        port.register_unsolicited("+CREG:").await.unwrap();
        let mut events = port.subscribe();

        let driver = tokio::spawn(async move {
            let _ = read_exact_string(&mut peer, 3).await;
            // Status indication lands in the middle of the reply.
            peer.write_all(b"\r\n+CREG: 2\r\n\r\nDATA\r\nOK\r\n")
                .await
                .unwrap();
        });

        let payload = port
            .queue_command(b"AT\r".to_vec(), opts(2000))
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&payload).contains("DATA"));

        let event = events.recv().await.unwrap();
        match event {
            PortEvent::Unsolicited(note) => assert_eq!(note.line, "+CREG: 2"),
            other => panic!("expected unsolicited, got {other:?}"),
        }
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_command_requires_open_port() {
        let (ours, _theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let port = SerialPort::new(PortConfig::new("test", PortTarget::Fd(ours.into())));
        let err = port
            .queue_command(b"AT\r".to_vec(), opts(1000))
            .await
            .unwrap_err();
        assert_eq!(err, Error::NotOpen);
    }

    #[tokio::test]
    async fn test_connected_port_rejects_commands() {
        let (port, mut peer) = pair_port().await;

        port.set_connected(true).await.unwrap();
        let err = port
            .queue_command(b"AT\r".to_vec(), opts(1000))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Connected);

        port.set_connected(false).await.unwrap();
        let driver = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(b"\r\nOK\r\n").await.unwrap();
        });
        port.queue_command(b"AT\r".to_vec(), opts(2000))
            .await
            .unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_flash_in_progress() {
        let (port, _peer) = pair_port().await;

        let long = port.flash(Duration::from_millis(300), false);
        let short = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            port.flash(Duration::from_millis(10), false).await
        };
        let (first, second) = tokio::join!(long, short);
        first.unwrap();
        assert_eq!(second.unwrap_err(), Error::InProgress("flash"));

        // Finished flash releases the guard.
        port.flash(Duration::from_millis(10), false).await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_in_progress_and_recovery() {
        let (port, _peer) = pair_port().await;

        let slow = port.reopen(Duration::from_millis(300));
        let concurrent = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            port.reopen(Duration::from_millis(10)).await
        };
        let (first, second) = tokio::join!(slow, concurrent);
        first.unwrap();
        assert_eq!(second.unwrap_err(), Error::InProgress("reopen"));

        assert!(port.is_open().await);
    }

    #[tokio::test]
    async fn test_reopen_requires_open_port() {
        let (ours, _theirs) = std::os::unix::net::UnixStream::pair().unwrap();
        let port = SerialPort::new(PortConfig::new("test", PortTarget::Fd(ours.into())));
        assert_eq!(
            port.reopen(Duration::ZERO).await.unwrap_err(),
            Error::NotOpen
        );
    }

    #[tokio::test]
    async fn test_buffer_overrun_trims_and_notifies() {
        let (port, mut peer) = pair_port().await;
        let mut events = port.subscribe();

        // Flood with garbage while no command is outstanding.
        let junk = vec![b'x'; 24 * 1024];
        peer.write_all(&junk).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let PortEvent::BufferOverrun { dropped } = events.recv().await.unwrap() {
                    return dropped;
                }
            }
        })
        .await
        .expect("no overrun event");
        assert!(event > 0);
    }

    #[tokio::test]
    async fn test_at_command_strips_echo_and_noise() {
        let (port, mut peer) = pair_port().await;

        let driver = tokio::spawn(async move {
            let _ = read_exact_string(&mut peer, 7).await;
            // Echo still on, plus a stray NUL from a stale buffer.
            peer.write_all(b"\x00AT+CSQ\r\n+CSQ: 15,99\r\nOK\r\n")
                .await
                .unwrap();
        });

        let response = port
            .at_command("AT+CSQ", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response, "+CSQ: 15,99");
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_balanced_close_tears_down_on_last() {
        let (port, _peer) = pair_port().await;

        port.open().await.unwrap(); // second reference
        port.close().await.unwrap();
        assert!(port.is_open().await);
        port.close().await.unwrap();
        assert!(!port.is_open().await);
        assert_eq!(port.close().await.unwrap_err(), Error::NotOpen);

        // Not forced: a fresh open works again.
        port.open().await.unwrap();
        assert!(port.is_open().await);
    }
}
