//! The supervision loop: registration, subscription, then a single
//! cooperative `select!` over signals, child events, change batches and
//! the debounce deadline.
use crate::coalescer::{CoalescePolicy, Coalescer, Trigger};
use crate::config::DevloopConfig;
use crate::console::Console;
use crate::notifier::{ChangeEvent, EntryType, Notifier, SubscriptionBatch};
use crate::registrar::{self, RegistrarError};
use crate::shutdown::{ShutdownCoordinator, ShutdownStep};
use crate::signals::SignalSource;
use crate::status::{LoopState, StatusTracker};
use crate::subscription::{self, BatchStream};
use crate::supervisor::{ChildCommand, StartOutcome, Supervisor};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every resource was released.
    Clean,
    /// Cleanup never finished and the configured grace period ran out.
    ForcedExit,
}

#[derive(Debug)]
pub enum RunError {
    Registrar(RegistrarError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Registrar(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Registrar(e) => Some(e),
        }
    }
}

impl From<RegistrarError> for RunError {
    fn from(e: RegistrarError) -> Self {
        RunError::Registrar(e)
    }
}

async fn next_batch(stream: &mut Option<BatchStream>) -> Option<SubscriptionBatch> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn format_mtime(mtime_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(mtime_ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| mtime_ms.to_string())
}

/// Operator listing of the changed files, one per line.
///
/// Directories and other non-file entries are left out. A deleted entry
/// can no longer be stat'ed for its type, so it is listed as deleted.
pub fn describe_changes(changes: &[ChangeEvent]) -> String {
    let mut out = String::from("Changed:");
    for change in changes {
        let name = change.name.display();
        match (change.exists, change.kind) {
            (false, _) => out.push_str(&format!("\n  {name} (deleted)")),
            (true, EntryType::File) => {
                out.push_str(&format!("\n  {name} ({})", format_mtime(change.mtime_ms)))
            }
            (true, _) => {}
        }
    }
    out
}

fn apply_trigger<C: Console>(
    trigger: Trigger,
    supervisor: &mut Supervisor<C>,
    console: &C,
    subtree: &Path,
) {
    match trigger {
        Trigger::Initial => {
            console.notice(&format!(
                "Subscribed to file changes in ./{}, starting",
                subtree.display()
            ));
        }
        Trigger::Changed(changes) => {
            tracing::debug!(count = changes.len(), "change burst settled");
            console.notice(&describe_changes(&changes));
        }
    }
    if supervisor.request_start() == StartOutcome::Queued {
        console.notice("Restart queued until the running process exits");
    }
}

fn loop_state<C: Console>(supervisor: &Supervisor<C>) -> LoopState {
    if supervisor.child_pid().is_some() {
        LoopState::ChildRunning
    } else if supervisor.starts() == 0 {
        LoopState::Watching
    } else {
        LoopState::Idle
    }
}

fn report_status<C: Console>(status: &mut StatusTracker, supervisor: &Supervisor<C>, state: LoopState) {
    status.update(
        state,
        supervisor.child_pid(),
        supervisor.starts(),
        supervisor.last_exit().and_then(|e| e.exit_code),
    );
}

/// Run until a termination signal has been fully handled.
///
/// Registration failures are fatal; everything after that degrades in
/// place rather than aborting.
pub async fn run<N, C, S>(
    config: &DevloopConfig,
    command: ChildCommand,
    notifier: &N,
    console: C,
    signals: &mut S,
) -> Result<RunOutcome, RunError>
where
    N: Notifier,
    C: Console + Clone,
    S: SignalSource,
{
    let registration = registrar::register_root(
        notifier,
        &config.watch.root,
        &console,
        config.display.clear_on_start,
    )
    .await?;

    let mut stream = match subscription::subscribe(notifier, &registration, &config.watch, &console).await {
        Some(_) => match notifier.take_events() {
            Some(rx) => Some(BatchStream::new(config.watch.subscription.clone(), rx)),
            None => {
                tracing::warn!("notifier event channel already taken, changes will not be seen");
                None
            }
        },
        None => None,
    };

    let mut coalescer = Coalescer::new(CoalescePolicy::from(&config.coalesce));
    let mut supervisor = Supervisor::new(command, console.clone());
    let mut shutdown = ShutdownCoordinator::new(
        registration.watch.clone(),
        config.watch.subscription.clone(),
    );
    let mut status = StatusTracker::new(config.status.file.clone());
    let mut signals_open = true;

    loop {
        report_status(&mut status, &supervisor, loop_state(&supervisor));
        let deadline = coalescer.deadline();

        tokio::select! {
            biased;

            signal = signals.recv(), if signals_open => {
                let Some(signal) = signal else {
                    tracing::debug!("signal source closed");
                    signals_open = false;
                    continue;
                };
                console.notice(&format!("\n{} fired, cleaning up", signal.as_str()));
                supervisor.halt();
                report_status(&mut status, &supervisor, LoopState::ShuttingDown);

                match shutdown.handle_signal(notifier, signal).await {
                    ShutdownStep::Exit => {
                        finish(config, &mut supervisor, &status);
                        return Ok(RunOutcome::Clean);
                    }
                    ShutdownStep::Stuck => {
                        console.error("Cleanup incomplete; waiting (see log for the failed step)");
                        let outcome = wait_stuck(config, notifier, &mut supervisor, &mut shutdown, signals, signals_open).await;
                        if config.shutdown.kill_child {
                            supervisor.terminate();
                        }
                        return Ok(outcome);
                    }
                    ShutdownStep::Ignored => {}
                }
            }

            event = supervisor.next_event() => {
                if let Some(StartOutcome::Started { pid }) = supervisor.handle_event(event) {
                    tracing::debug!(pid, "queued restart applied");
                }
                tracing::trace!(
                    state = ?supervisor.state(),
                    restart_pending = supervisor.restart_pending(),
                    "child event handled"
                );
            }

            batch = next_batch(&mut stream), if stream.is_some() => match batch {
                Some(batch) => {
                    if let Some(trigger) = coalescer.offer(batch, Instant::now()) {
                        apply_trigger(trigger, &mut supervisor, &console, &config.watch.subtree);
                    }
                }
                None => {
                    tracing::warn!("notifier event channel closed, no further changes will be seen");
                    stream = None;
                }
            },

            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(trigger) = coalescer.fire(Instant::now()) {
                    tracing::debug!(superseded = coalescer.superseded(), "debounce window elapsed");
                    apply_trigger(trigger, &mut supervisor, &console, &config.watch.subtree);
                }
            }
        }
    }
}

fn finish<C: Console>(config: &DevloopConfig, supervisor: &mut Supervisor<C>, status: &StatusTracker) {
    if config.shutdown.kill_child {
        supervisor.terminate();
    } else if let Some(pid) = supervisor.child_pid() {
        tracing::info!(pid, "leaving child running");
    }
    status.remove();
}

/// Stay alive after a failed teardown. Further signals are absorbed by
/// the coordinator; the child's pipes keep draining so it never blocks.
async fn wait_stuck<N, C, S>(
    config: &DevloopConfig,
    notifier: &N,
    supervisor: &mut Supervisor<C>,
    shutdown: &mut ShutdownCoordinator,
    signals: &mut S,
    mut signals_open: bool,
) -> RunOutcome
where
    N: Notifier,
    C: Console,
    S: SignalSource,
{
    let force_after = config.shutdown.force_exit_after_secs.map(Duration::from_secs);
    let deadline = force_after.map(|d| Instant::now() + d);

    loop {
        tokio::select! {
            signal = signals.recv(), if signals_open => match signal {
                Some(signal) => {
                    let step = shutdown.handle_signal(notifier, signal).await;
                    tracing::debug!(?step, phase = ?shutdown.phase(), "signal during stalled cleanup");
                }
                None => signals_open = false,
            },
            event = supervisor.next_event() => {
                supervisor.handle_event(event);
            }
            () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                tracing::error!(
                    after_secs = force_after.map(|d| d.as_secs()),
                    unsubscribed = shutdown.flags().unsubscribed(),
                    watch_deleted = shutdown.flags().watch_deleted(),
                    "cleanup did not finish, forcing exit"
                );
                return RunOutcome::ForcedExit;
            }
        }
    }
}
