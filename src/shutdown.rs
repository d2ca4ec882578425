/// Shutdown coordination: runs teardown once, exits only when every
/// registered resource has been released.
use crate::notifier::{Notifier, WatchHandle};
use nix::sys::signal::Signal;
use std::cell::Cell;

/// Completion of each teardown request. Each flag flips at most once.
#[derive(Debug, Default)]
pub struct CleanupFlags {
    unsubscribed: Cell<bool>,
    watch_deleted: Cell<bool>,
}

impl CleanupFlags {
    pub fn unsubscribed(&self) -> bool {
        self.unsubscribed.get()
    }

    pub fn watch_deleted(&self) -> bool {
        self.watch_deleted.get()
    }

    pub fn all_done(&self) -> bool {
        self.unsubscribed() && self.watch_deleted()
    }
}

/// What the caller should do after a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// A shutdown is already underway.
    Ignored,
    /// Every resource released; exit with success.
    Exit,
    /// A teardown request failed; stay up so the stuck state is visible.
    Stuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Armed,
    CleaningUp,
    Exited,
}

pub struct ShutdownCoordinator {
    watch: WatchHandle,
    subscription: String,
    /// Latched by the first signal.
    cleaning_up: bool,
    flags: CleanupFlags,
}

impl ShutdownCoordinator {
    pub fn new(watch: WatchHandle, subscription: impl Into<String>) -> Self {
        Self {
            watch,
            subscription: subscription.into(),
            cleaning_up: false,
            flags: CleanupFlags::default(),
        }
    }

    pub fn flags(&self) -> &CleanupFlags {
        &self.flags
    }

    pub fn phase(&self) -> ShutdownPhase {
        match (self.cleaning_up, self.flags.all_done()) {
            (false, _) => ShutdownPhase::Armed,
            (true, false) => ShutdownPhase::CleaningUp,
            (true, true) => ShutdownPhase::Exited,
        }
    }

    /// React to a termination signal.
    ///
    /// Only the first call issues teardown: unsubscribe and delete-all run
    /// concurrently and may finish in either order. A failed request
    /// leaves its flag unset.
    pub async fn handle_signal<N: Notifier>(&mut self, notifier: &N, signal: Signal) -> ShutdownStep {
        if self.cleaning_up {
            tracing::info!(signal = signal.as_str(), "cleanup already in progress, ignoring signal");
            return ShutdownStep::Ignored;
        }
        self.cleaning_up = true;
        tracing::info!("{} fired, cleaning up", signal.as_str());

        let flags = &self.flags;
        let unsubscribe = async {
            match notifier.unsubscribe(&self.watch, &self.subscription).await {
                Ok(ack) => {
                    tracing::info!(
                        subscription = %ack.subscription,
                        deleted = ack.deleted,
                        "unsubscribed"
                    );
                    flags.unsubscribed.set(true);
                    log_progress(flags);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to unsubscribe");
                }
            }
        };
        let delete = async {
            match notifier.watch_del_all().await {
                Ok(roots) => {
                    tracing::info!(roots = ?roots, "watch deleted");
                    flags.watch_deleted.set(true);
                    log_progress(flags);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to delete watch");
                }
            }
        };
        tokio::join!(unsubscribe, delete);

        if self.flags.all_done() {
            ShutdownStep::Exit
        } else {
            tracing::warn!(
                unsubscribed = self.flags.unsubscribed(),
                watch_deleted = self.flags.watch_deleted(),
                "cleanup incomplete, not exiting"
            );
            ShutdownStep::Stuck
        }
    }
}

fn log_progress(flags: &CleanupFlags) {
    if flags.all_done() {
        tracing::info!("all cleanup complete");
    } else {
        tracing::debug!(
            unsubscribed = flags.unsubscribed(),
            watch_deleted = flags.watch_deleted(),
            "cleanup step complete"
        );
    }
}
