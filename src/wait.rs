//! The operator wait: key press, interrupt or timeout, whichever comes first.

use async_trait::async_trait;
use crossterm::event::{Event, EventStream, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use futures::StreamExt;
use std::io::{self, IsTerminal};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Longest allowed gap between two checks of the operator input.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Why the wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Cancelled,
    TimedOut,
}

/// Something the operator can use to end the wait early.
#[async_trait]
pub trait CancelSource: Send {
    /// Wait at most `window` for the operator; true if they signalled.
    ///
    /// Input that arrived before the call counts.
    async fn ready_within(&mut self, window: Duration) -> bool;

    /// Resolves when the operator asks the whole run to stop.
    ///
    /// Raced against the work done before the wait. Sources that cannot be
    /// interrupted never resolve.
    async fn interrupted(&mut self) {
        std::future::pending::<()>().await
    }

    /// Called once when the wait is over.
    fn release(&mut self) {}
}

/// Block until `source` signals or `timeout` has elapsed.
///
/// The source is checked in slices of at most `poll_interval`, and the last
/// slice is clipped to the deadline, so a silent operator is timed out after
/// exactly `timeout`.
pub async fn wait_for_cancellation_or_timeout<S>(
    source: &mut S,
    timeout: Duration,
    poll_interval: Duration,
) -> WaitOutcome
where
    S: CancelSource + ?Sized,
{
    let poll_interval = poll_interval.clamp(Duration::from_millis(1), MAX_POLL_INTERVAL);
    let started = Instant::now();

    let outcome = loop {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            break WaitOutcome::TimedOut;
        }
        let window = poll_interval.min(timeout - elapsed);
        if source.ready_within(window).await {
            break WaitOutcome::Cancelled;
        }
    };

    source.release();
    debug!(?outcome, elapsed = ?started.elapsed(), "Wait finished");
    outcome
}

/// The operator at the controlling terminal.
///
/// SIGINT and SIGTERM are captured from construction on. Before the wait they
/// resolve [`CancelSource::interrupted`]; during it they end the wait like a
/// key press. The terminal is left alone until that first
/// check, then put in raw mode (any single key counts) until
/// [`CancelSource::release`]. When stdin is not a terminal, any byte on it
/// counts; end of input does not.
pub struct OperatorInput {
    input: Option<Input>,
    interrupts: Option<Interrupts>,
    interrupted: bool,
}

impl OperatorInput {
    /// Must be called from within the tokio runtime.
    pub fn new() -> Self {
        Self {
            input: None,
            interrupts: Interrupts::install()
                .map_err(|e| warn!("Failed to capture interrupt signals: {}", e))
                .ok(),
            interrupted: false,
        }
    }
}

impl Default for OperatorInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CancelSource for OperatorInput {
    async fn ready_within(&mut self, window: Duration) -> bool {
        let Self {
            input,
            interrupts,
            interrupted,
        } = self;
        let input = input.get_or_insert_with(Input::open);

        tokio::select! {
            _ = input.next() => true,
            _ = recv_interrupt(interrupts.as_mut()) => {
                *interrupted = true;
                true
            }
            _ = tokio::time::sleep(window) => false,
        }
    }

    async fn interrupted(&mut self) {
        recv_interrupt(self.interrupts.as_mut()).await;
        self.interrupted = true;
    }

    fn release(&mut self) {
        // Restores cooked mode before anything else is printed.
        self.input = None;
        if self.interrupted {
            warn!("Interrupted; revoking the provisioner now");
        }
    }
}

enum Input {
    Terminal {
        events: EventStream,
        _raw: RawMode,
    },
    Stream {
        stdin: tokio::io::Stdin,
        closed: bool,
    },
}

impl Input {
    fn open() -> Self {
        if io::stdin().is_terminal() {
            match RawMode::enable() {
                Ok(raw) => {
                    return Self::Terminal {
                        events: EventStream::new(),
                        _raw: raw,
                    }
                }
                Err(e) => warn!("Cannot switch terminal to raw mode, press Enter instead: {}", e),
            }
        }
        Self::Stream {
            stdin: tokio::io::stdin(),
            closed: false,
        }
    }

    /// Resolves on the next operator input; never resolves if none can come.
    async fn next(&mut self) {
        match self {
            Self::Terminal { events, .. } => loop {
                match events.next().await {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => return,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Terminal read failed: {}", e);
                        return;
                    }
                    None => return,
                }
            },
            Self::Stream { stdin, closed } => {
                if !*closed {
                    let mut byte = [0u8; 1];
                    match stdin.read(&mut byte).await {
                        Ok(0) => {
                            debug!("stdin closed, waiting for the timeout");
                            *closed = true;
                        }
                        Ok(_) => return,
                        Err(e) => {
                            warn!("stdin read failed, waiting for the timeout: {}", e);
                            *closed = true;
                        }
                    }
                }
                std::future::pending::<()>().await
            }
        }
    }
}

/// Raw terminal mode for as long as the guard lives.
struct RawMode;

impl RawMode {
    fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

#[cfg(unix)]
struct Interrupts {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Interrupts {
    fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {}
            _ = self.terminate.recv() => {}
        }
    }
}

#[cfg(not(unix))]
struct Interrupts;

#[cfg(not(unix))]
impl Interrupts {
    fn install() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn recv_interrupt(interrupts: Option<&mut Interrupts>) {
    match interrupts {
        Some(interrupts) => interrupts.recv().await,
        None => std::future::pending().await,
    }
}
