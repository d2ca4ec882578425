use crate::config::{CoalesceConfig, CoalesceMode};
use crate::notifier::{ChangeEvent, SubscriptionBatch};
use std::time::Duration;
use tokio::time::Instant;

/// How bursts of batches turn into restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoalescePolicy {
    /// Act on the last batch once no other has arrived for the window.
    Debounce(Duration),
    /// Act on every non-empty batch.
    Immediate,
}

impl From<&CoalesceConfig> for CoalescePolicy {
    fn from(config: &CoalesceConfig) -> Self {
        match config.mode {
            CoalesceMode::Debounce => CoalescePolicy::Debounce(config.window()),
            CoalesceMode::Immediate => CoalescePolicy::Immediate,
        }
    }
}

/// A decision to (re)start the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The subscription just came up.
    Initial,
    /// Entries changed since the last run.
    Changed(Vec<ChangeEvent>),
}

#[derive(Debug)]
struct Pending {
    changes: Vec<ChangeEvent>,
    deadline: Instant,
}

/// Trailing-edge debouncer over subscription batches.
///
/// Only one trigger is ever pending; a newer batch replaces it and
/// pushes its deadline out.
#[derive(Debug)]
pub struct Coalescer {
    policy: CoalescePolicy,
    pending: Option<Pending>,
    superseded: u64,
}

impl Coalescer {
    pub fn new(policy: CoalescePolicy) -> Self {
        Self {
            policy,
            pending: None,
            superseded: 0,
        }
    }

    /// Feed one batch. Returns a trigger when it should fire right away.
    pub fn offer(&mut self, batch: SubscriptionBatch, now: Instant) -> Option<Trigger> {
        if batch.is_fresh_instance {
            if self.pending.take().is_some() {
                self.superseded += 1;
            }
            return Some(Trigger::Initial);
        }
        if batch.changes.is_empty() {
            tracing::debug!("dropping empty batch");
            return None;
        }
        match self.policy {
            CoalescePolicy::Immediate => Some(Trigger::Changed(batch.changes)),
            CoalescePolicy::Debounce(window) => {
                if self.pending.is_some() {
                    self.superseded += 1;
                    tracing::debug!(superseded = self.superseded, "pending restart superseded");
                }
                self.pending = Some(Pending {
                    changes: batch.changes,
                    deadline: now + window,
                });
                None
            }
        }
    }

    /// When the pending trigger is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.deadline)
    }

    /// Take the pending trigger if its deadline has passed.
    pub fn fire(&mut self, now: Instant) -> Option<Trigger> {
        match &self.pending {
            Some(p) if p.deadline <= now => self
                .pending
                .take()
                .map(|p| Trigger::Changed(p.changes)),
            _ => None,
        }
    }

    /// Count of pending triggers replaced before they fired.
    pub fn superseded(&self) -> u64 {
        self.superseded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::EntryType;
    use std::path::PathBuf;

    const WINDOW: Duration = Duration::from_millis(1000);

    fn change(name: &str) -> ChangeEvent {
        ChangeEvent {
            name: PathBuf::from(name),
            size: 10,
            mtime_ms: 1_700_000_000_000,
            exists: true,
            kind: EntryType::File,
        }
    }

    fn batch(fresh: bool, names: &[&str]) -> SubscriptionBatch {
        SubscriptionBatch {
            subscription: "dev".to_string(),
            is_fresh_instance: fresh,
            changes: names.iter().map(|n| change(n)).collect(),
        }
    }

    #[test]
    fn test_fresh_instance_fires_immediately() {
        let mut c = Coalescer::new(CoalescePolicy::Debounce(WINDOW));
        let now = Instant::now();
        assert_eq!(c.offer(batch(true, &[]), now), Some(Trigger::Initial));
        assert!(c.deadline().is_none());
    }

    #[test]
    fn test_fresh_instance_with_files_still_initial() {
        let mut c = Coalescer::new(CoalescePolicy::Debounce(WINDOW));
        let got = c.offer(batch(true, &["src/index.ts"]), Instant::now());
        assert_eq!(got, Some(Trigger::Initial));
    }

    #[test]
    fn test_empty_batch_never_triggers() {
        let mut c = Coalescer::new(CoalescePolicy::Debounce(WINDOW));
        let now = Instant::now();
        assert!(c.offer(batch(false, &[]), now).is_none());
        assert!(c.deadline().is_none());
        assert!(c.fire(now + WINDOW * 2).is_none());

        let mut immediate = Coalescer::new(CoalescePolicy::Immediate);
        assert!(immediate.offer(batch(false, &[]), now).is_none());
    }

    #[test]
    fn test_burst_fires_once_with_last_batch() {
        let mut c = Coalescer::new(CoalescePolicy::Debounce(WINDOW));
        let start = Instant::now();
        for (i, name) in ["a.ts", "b.ts", "c.ts", "d.ts"].iter().enumerate() {
            let at = start + Duration::from_millis(200 * i as u64);
            assert!(c.offer(batch(false, &[name]), at).is_none());
        }
        let last = start + Duration::from_millis(600);
        assert_eq!(c.deadline(), Some(last + WINDOW));

        // Not yet quiet for a full window since the last batch.
        assert!(c.fire(start + WINDOW).is_none());

        let fired = c.fire(last + WINDOW).unwrap();
        assert_eq!(fired, Trigger::Changed(vec![change("d.ts")]));
        assert!(c.fire(last + WINDOW * 3).is_none());
        assert_eq!(c.superseded(), 3);
    }

    #[test]
    fn test_separate_bursts_fire_separately() {
        let mut c = Coalescer::new(CoalescePolicy::Debounce(WINDOW));
        let start = Instant::now();
        c.offer(batch(false, &["a.ts"]), start);
        assert!(c.fire(start + WINDOW).is_some());

        let later = start + WINDOW * 5;
        c.offer(batch(false, &["b.ts"]), later);
        assert_eq!(
            c.fire(later + WINDOW),
            Some(Trigger::Changed(vec![change("b.ts")]))
        );
    }

    #[test]
    fn test_empty_batch_does_not_extend_window() {
        let mut c = Coalescer::new(CoalescePolicy::Debounce(WINDOW));
        let start = Instant::now();
        c.offer(batch(false, &["a.ts"]), start);
        c.offer(batch(false, &[]), start + Duration::from_millis(900));
        assert_eq!(c.deadline(), Some(start + WINDOW));
    }

    #[test]
    fn test_fresh_instance_cancels_pending() {
        let mut c = Coalescer::new(CoalescePolicy::Debounce(WINDOW));
        let start = Instant::now();
        c.offer(batch(false, &["a.ts"]), start);
        assert_eq!(c.offer(batch(true, &[]), start), Some(Trigger::Initial));
        assert!(c.deadline().is_none());
        assert!(c.fire(start + WINDOW).is_none());
    }

    #[test]
    fn test_immediate_policy_fires_every_batch() {
        let mut c = Coalescer::new(CoalescePolicy::Immediate);
        let now = Instant::now();
        assert_eq!(
            c.offer(batch(false, &["a.ts"]), now),
            Some(Trigger::Changed(vec![change("a.ts")]))
        );
        assert_eq!(
            c.offer(batch(false, &["b.ts"]), now),
            Some(Trigger::Changed(vec![change("b.ts")]))
        );
        assert!(c.deadline().is_none());
    }

    #[test]
    fn test_policy_from_config() {
        let config = CoalesceConfig::default();
        assert_eq!(CoalescePolicy::from(&config), CoalescePolicy::Debounce(WINDOW));
        let config = CoalesceConfig {
            mode: CoalesceMode::Immediate,
            ..Default::default()
        };
        assert_eq!(CoalescePolicy::from(&config), CoalescePolicy::Immediate);
    }
}
