//! Signal-driven shutdown.
//!
//! Termination signals come from a [`SignalSource`], so tests can inject them
//! without touching the process. The graceful-then-forced sequence runs
//! against anything implementing [`GracefulClose`]. The result is a typed
//! [`ShutdownOutcome`]; deciding whether and how to exit the process is left to
//! the binary.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::ShutdownError;

/// Exit status for a clean shutdown.
pub const EXIT_OK: u8 = 0;

/// Exit status when the forced close itself failed.
pub const EXIT_CLOSE_FAILED: u8 = 1;

/// Exit status when the server could not be configured or started.
pub const EXIT_STARTUP_FAILED: u8 = 2;

/// Exit status for a termination signal that arrived while not serving.
pub const EXIT_SIGNAL_WHILE_IDLE: u8 = 255;

/// How a shutdown ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// In-flight requests drained within the grace period
    Graceful,
    /// The grace period elapsed and the listener was torn down
    Forced,
    /// A termination signal arrived while the server was not running
    SignalWhileIdle,
    /// Tearing the listener down failed
    CloseFailed(ShutdownError),
}

impl ShutdownOutcome {
    /// The process exit status the binary reports for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownOutcome::Graceful | ShutdownOutcome::Forced => EXIT_OK,
            ShutdownOutcome::SignalWhileIdle => EXIT_SIGNAL_WHILE_IDLE,
            ShutdownOutcome::CloseFailed(_) => EXIT_CLOSE_FAILED,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.exit_code() == EXIT_OK
    }
}

/// Process-level termination signals the server reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGINT / Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationSignal::Interrupt => write!(f, "SIGINT"),
            TerminationSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Source of termination signals.
#[async_trait]
pub trait SignalSource: Send {
    /// Wait for the next signal. `None` means no more signals will arrive.
    async fn recv(&mut self) -> Option<TerminationSignal>;
}

#[async_trait]
impl SignalSource for mpsc::Receiver<TerminationSignal> {
    async fn recv(&mut self) -> Option<TerminationSignal> {
        mpsc::Receiver::recv(self).await
    }
}

#[async_trait]
impl SignalSource for mpsc::UnboundedReceiver<TerminationSignal> {
    async fn recv(&mut self) -> Option<TerminationSignal> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}

/// Signals delivered to this process by the operating system.
///
/// SIGINT and SIGTERM on Unix; Ctrl-C elsewhere.
pub struct OsSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl OsSignals {
    /// Register the signal handlers. Must be called inside a Tokio runtime.
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }
}

impl OsSignals {
    #[cfg(unix)]
    async fn next_signal(&mut self) -> Option<TerminationSignal> {
        tokio::select! {
            received = self.interrupt.recv() => received.map(|_| TerminationSignal::Interrupt),
            received = self.terminate.recv() => received.map(|_| TerminationSignal::Terminate),
        }
    }

    #[cfg(not(unix))]
    async fn next_signal(&mut self) -> Option<TerminationSignal> {
        tokio::signal::ctrl_c()
            .await
            .ok()
            .map(|_| TerminationSignal::Interrupt)
    }
}

#[async_trait]
impl SignalSource for OsSignals {
    async fn recv(&mut self) -> Option<TerminationSignal> {
        self.next_signal().await
    }
}

/// A listener that can be drained or torn down.
#[async_trait]
pub trait GracefulClose: Send {
    /// Stop accepting connections and wait for in-flight requests to finish.
    ///
    /// Must be safe to cancel: the caller bounds it with the grace period.
    async fn drain(&mut self);

    /// Close the listener and every remaining connection immediately.
    async fn force_close(&mut self) -> Result<(), ShutdownError>;
}

/// Drain `target` within `grace_period`, forcing the close if it overruns.
///
/// `force_close` is called at most once.
pub async fn shutdown_gracefully<T>(target: &mut T, grace_period: Duration) -> ShutdownOutcome
where
    T: GracefulClose + ?Sized,
{
    let drained = tokio::time::timeout(grace_period, target.drain()).await;
    if drained.is_ok() {
        tracing::info!("In-flight requests drained");
        return ShutdownOutcome::Graceful;
    }

    let elapsed = ShutdownError::GracePeriodElapsed(grace_period);
    tracing::warn!(error = %elapsed, "Forcing callback server to close");

    match target.force_close().await {
        Ok(()) => ShutdownOutcome::Forced,
        Err(e) => {
            tracing::error!(error = %e, "Forced close failed");
            ShutdownOutcome::CloseFailed(e)
        }
    }
}
