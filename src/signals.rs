/// Termination signal intake.
///
/// SIGINT, SIGUSR1, SIGUSR2 and SIGTERM all request the same shutdown;
/// they differ only in the log line naming them.
use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

pub const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGTERM,
];

/// Something that delivers termination signals.
#[allow(async_fn_in_trait)]
pub trait SignalSource {
    /// Next signal; `None` once the source can deliver no more.
    async fn recv(&mut self) -> Option<Signal>;
}

/// Process signal handlers installed through tokio.
pub struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    user1: tokio::signal::unix::Signal,
    user2: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

impl SignalListener {
    /// Install handlers for every termination signal.
    pub fn install() -> std::io::Result<Self> {
        let listener = Self {
            interrupt: signal(SignalKind::interrupt())?,
            user1: signal(SignalKind::user_defined1())?,
            user2: signal(SignalKind::user_defined2())?,
            terminate: signal(SignalKind::terminate())?,
        };
        tracing::debug!(
            signals = ?TERMINATION_SIGNALS.map(Signal::as_str),
            "signal handlers installed"
        );
        Ok(listener)
    }
}

impl SignalSource for SignalListener {
    async fn recv(&mut self) -> Option<Signal> {
        tokio::select! {
            Some(()) = self.interrupt.recv() => Some(Signal::SIGINT),
            Some(()) = self.user1.recv() => Some(Signal::SIGUSR1),
            Some(()) = self.user2.recv() => Some(Signal::SIGUSR2),
            Some(()) = self.terminate.recv() => Some(Signal::SIGTERM),
            else => None,
        }
    }
}

impl SignalSource for mpsc::UnboundedReceiver<Signal> {
    async fn recv(&mut self) -> Option<Signal> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}
