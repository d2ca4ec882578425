//! Notifier backed by the platform file watcher (`notify`).
//!
//! Each subscription owns one recursive watcher on its subtree. Batches
//! from every subscription share a single channel and carry the
//! subscription name so consumers can tell them apart.
use super::{
    ChangeEvent, EntryType, Expression, Notifier, NotifierError, SubscribeAck, SubscriptionBatch,
    SubscriptionSpec, UnsubscribeAck, WatchHandle, WatchResponse,
};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::UNIX_EPOCH;
use tokio::sync::mpsc;

const CAPABILITIES: &[&str] = &[
    "relative_root",
    "defer",
    "dirname",
    "field-name",
    "field-size",
    "field-mtime_ms",
    "field-exists",
    "field-type",
];

/// Files or directories marking the top of a project.
const PROJECT_MARKERS: &[&str] = &[".watchmanconfig", ".git", ".hg"];

pub struct FsNotifier {
    roots: Mutex<HashMap<PathBuf, RootState>>,
    events_tx: mpsc::UnboundedSender<SubscriptionBatch>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SubscriptionBatch>>>,
}

#[derive(Default)]
struct RootState {
    /// States currently asserted on this root.
    asserted: HashSet<String>,
    subscriptions: HashMap<String, ActiveSubscription>,
}

struct ActiveSubscription {
    _watcher: RecommendedWatcher,
    gate: Arc<Mutex<DeferGate>>,
}

/// Holds back a subscription's changes while one of its defer states is asserted.
#[derive(Debug)]
struct DeferGate {
    subscription: String,
    defer: Vec<String>,
    active: HashSet<String>,
    buffered: Vec<ChangeEvent>,
}

impl DeferGate {
    fn new(subscription: &str, defer: &[String]) -> Self {
        Self {
            subscription: subscription.to_string(),
            defer: defer.to_vec(),
            active: HashSet::new(),
            buffered: Vec::new(),
        }
    }

    fn deferring(&self) -> bool {
        !self.active.is_empty()
    }

    fn enter(&mut self, state: &str) {
        if self.defer.iter().any(|d| d == state) {
            self.active.insert(state.to_string());
        }
    }

    /// Returns the buffered batch once the last deferring state is left.
    fn leave(&mut self, state: &str) -> Option<SubscriptionBatch> {
        if !self.active.remove(state) || self.deferring() {
            return None;
        }
        let buffered = std::mem::take(&mut self.buffered);
        Some(self.batch(buffered, false))
    }

    fn deliver(&mut self, changes: Vec<ChangeEvent>) -> Option<SubscriptionBatch> {
        if self.deferring() {
            self.buffered.extend(changes);
            return None;
        }
        Some(self.batch(changes, false))
    }

    fn batch(&self, changes: Vec<ChangeEvent>, is_fresh_instance: bool) -> SubscriptionBatch {
        SubscriptionBatch {
            subscription: self.subscription.clone(),
            is_fresh_instance,
            changes,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FsNotifier {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            roots: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Assert a named state on a watched root.
    ///
    /// These are notifier-side hooks for whatever owns the state (a build
    /// step sharing this process, for instance); the supervision loop only
    /// names the states it defers on and never asserts one itself. While a
    /// deferred state is held, the subscription's changes are buffered.
    pub fn state_enter(&self, watch: &WatchHandle, state: &str) -> Result<(), NotifierError> {
        let mut roots = lock(&self.roots);
        let root = roots
            .get_mut(watch.root())
            .ok_or_else(|| NotifierError::UnknownWatch {
                watch: watch.clone(),
            })?;
        root.asserted.insert(state.to_string());
        for sub in root.subscriptions.values() {
            lock(&sub.gate).enter(state);
        }
        tracing::debug!(%watch, state, "state asserted");
        Ok(())
    }

    /// Release a named state, flushing changes it held back.
    pub fn state_leave(&self, watch: &WatchHandle, state: &str) -> Result<(), NotifierError> {
        let mut roots = lock(&self.roots);
        let root = roots
            .get_mut(watch.root())
            .ok_or_else(|| NotifierError::UnknownWatch {
                watch: watch.clone(),
            })?;
        root.asserted.remove(state);
        for sub in root.subscriptions.values() {
            if let Some(batch) = lock(&sub.gate).leave(state) {
                let _ = self.events_tx.send(batch);
            }
        }
        tracing::debug!(%watch, state, "state released");
        Ok(())
    }
}

impl Default for FsNotifier {
    fn default() -> Self {
        Self::new()
    }
}

fn find_project_root(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .find(|d| PROJECT_MARKERS.iter().any(|m| d.join(m).exists()))
        .map(Path::to_path_buf)
}

/// Stat `path` into a change entry named relative to `base`.
fn describe(path: &Path, base: &Path) -> Option<ChangeEvent> {
    let name = path.strip_prefix(base).ok()?.to_path_buf();
    if name.as_os_str().is_empty() {
        return None;
    }
    let event = match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            let file_type = meta.file_type();
            let kind = if file_type.is_file() {
                EntryType::File
            } else if file_type.is_dir() {
                EntryType::Dir
            } else if file_type.is_symlink() {
                EntryType::Symlink
            } else {
                EntryType::Other
            };
            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            ChangeEvent {
                name,
                size: meta.len(),
                mtime_ms,
                exists: true,
                kind,
            }
        }
        Err(_) => ChangeEvent {
            name,
            size: 0,
            mtime_ms: 0,
            exists: false,
            kind: EntryType::Other,
        },
    };
    Some(event)
}

/// Every entry currently below `dir`.
fn snapshot(dir: &Path, base: &Path) -> Vec<ChangeEvent> {
    let pattern = format!("{}/**/*", glob::Pattern::escape(&dir.to_string_lossy()));
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(error = %e, dir = %dir.display(), "failed to enumerate subtree");
            return Vec::new();
        }
    };
    paths
        .filter_map(Result::ok)
        .filter_map(|p| describe(&p, base))
        .collect()
}

fn changes_for(event: &Event, base: &Path) -> Vec<ChangeEvent> {
    let mut seen = HashSet::new();
    event
        .paths
        .iter()
        .filter(|p| seen.insert(p.as_path()))
        .filter_map(|p| describe(p, base))
        .collect()
}

impl Notifier for FsNotifier {
    async fn capability_check(
        &self,
        required: &[&str],
        optional: &[&str],
    ) -> Result<Vec<String>, NotifierError> {
        let missing: Vec<String> = required
            .iter()
            .filter(|name| !CAPABILITIES.contains(name))
            .map(|name| name.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(NotifierError::MissingCapabilities { names: missing });
        }
        Ok(optional
            .iter()
            .filter(|name| CAPABILITIES.contains(name))
            .map(|name| name.to_string())
            .collect())
    }

    async fn watch_project(&self, root: &Path) -> Result<WatchResponse, NotifierError> {
        let canonical = std::fs::canonicalize(root).map_err(|e| NotifierError::Watch {
            path: root.to_path_buf(),
            source: e,
        })?;
        if !canonical.is_dir() {
            return Err(NotifierError::Watch {
                path: root.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            });
        }

        let (watch_root, relative_path, warning) = match find_project_root(&canonical) {
            Some(project) => {
                let relative = canonical
                    .strip_prefix(&project)
                    .ok()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(Path::to_path_buf);
                (project, relative, None)
            }
            None => {
                let warning = format!(
                    "no project root marker ({}) found above {}; watching it directly",
                    PROJECT_MARKERS.join(", "),
                    canonical.display()
                );
                (canonical, None, Some(warning))
            }
        };

        lock(&self.roots).entry(watch_root.clone()).or_default();
        tracing::debug!(root = %watch_root.display(), ?relative_path, "watch registered");

        Ok(WatchResponse {
            watch: WatchHandle::new(watch_root),
            relative_path,
            warning,
        })
    }

    async fn subscribe(
        &self,
        watch: &WatchHandle,
        name: &str,
        spec: &SubscriptionSpec,
    ) -> Result<SubscribeAck, NotifierError> {
        let mut roots = lock(&self.roots);
        let root = roots
            .get_mut(watch.root())
            .ok_or_else(|| NotifierError::UnknownWatch {
                watch: watch.clone(),
            })?;

        let base = match &spec.relative_root {
            Some(rel) => watch.root().join(rel),
            None => watch.root().to_path_buf(),
        };
        let Expression::Dirname(subtree) = &spec.expression;
        let dir = base.join(subtree);

        let mut gate = DeferGate::new(name, &spec.defer);
        for state in &root.asserted {
            gate.enter(state);
        }
        let gate = Arc::new(Mutex::new(gate));

        // Hold the gate until the fresh instance is queued so that no
        // change batch can overtake it.
        let held = lock(&gate);

        let tx = self.events_tx.clone();
        let callback_gate = Arc::clone(&gate);
        let callback_base = base.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "file watcher error");
                    return;
                }
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            let changes = changes_for(&event, &callback_base);
            if changes.is_empty() {
                return;
            }
            if let Some(batch) = lock(&callback_gate).deliver(changes) {
                let _ = tx.send(batch);
            }
        })?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;

        let _ = self.events_tx.send(held.batch(snapshot(&dir, &base), true));
        drop(held);

        root.subscriptions.insert(
            name.to_string(),
            ActiveSubscription {
                _watcher: watcher,
                gate,
            },
        );
        tracing::debug!(subscription = name, dir = %dir.display(), "subscription registered");

        Ok(SubscribeAck {
            subscription: name.to_string(),
        })
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SubscriptionBatch>> {
        lock(&self.events_rx).take()
    }

    async fn unsubscribe(
        &self,
        watch: &WatchHandle,
        name: &str,
    ) -> Result<UnsubscribeAck, NotifierError> {
        let mut roots = lock(&self.roots);
        let root = roots
            .get_mut(watch.root())
            .ok_or_else(|| NotifierError::UnknownWatch {
                watch: watch.clone(),
            })?;
        let deleted = root.subscriptions.remove(name).is_some();
        Ok(UnsubscribeAck {
            subscription: name.to_string(),
            deleted,
        })
    }

    async fn watch_del_all(&self) -> Result<Vec<PathBuf>, NotifierError> {
        let mut roots: Vec<PathBuf> = lock(&self.roots).drain().map(|(root, _)| root).collect();
        roots.sort();
        Ok(roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{Field, RELATIVE_ROOT};
    use std::time::Duration;

    fn spec(subtree: &str, relative_root: Option<PathBuf>) -> SubscriptionSpec {
        SubscriptionSpec {
            expression: Expression::Dirname(PathBuf::from(subtree)),
            fields: Field::ALL.to_vec(),
            relative_root,
            defer: vec!["build".to_string()],
        }
    }

    /// A project dir with a `.git` marker and a populated `src/`.
    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/index.ts"), "console.log(1)").unwrap();
        std::fs::write(dir.path().join("src/nested/a.ts"), "export {}").unwrap();
        dir
    }

    async fn recv_until(
        rx: &mut mpsc::UnboundedReceiver<SubscriptionBatch>,
        name: &str,
    ) -> SubscriptionBatch {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let batch = rx.recv().await.expect("channel closed");
                if batch
                    .changes
                    .iter()
                    .any(|c| c.name == Path::new(name))
                {
                    return batch;
                }
            }
        })
        .await
        .expect("timed out waiting for change")
    }

    #[test]
    fn test_gate_passes_changes_when_not_deferring() {
        let mut gate = DeferGate::new("sub", &["build".to_string()]);
        let batch = gate.deliver(vec![]).unwrap();
        assert_eq!(batch.subscription, "sub");
        assert!(!batch.is_fresh_instance);
    }

    #[test]
    fn test_gate_buffers_until_state_left() {
        let mut gate = DeferGate::new("sub", &["build".to_string()]);
        gate.enter("build");
        let change = ChangeEvent {
            name: PathBuf::from("a.ts"),
            size: 1,
            mtime_ms: 1,
            exists: true,
            kind: EntryType::File,
        };
        assert!(gate.deliver(vec![change.clone()]).is_none());
        assert!(gate.deliver(vec![change.clone()]).is_none());

        let flushed = gate.leave("build").unwrap();
        assert_eq!(flushed.changes.len(), 2);
        assert!(gate.deliver(vec![change]).is_some());
    }

    #[test]
    fn test_gate_ignores_unrelated_states() {
        let mut gate = DeferGate::new("sub", &["build".to_string()]);
        gate.enter("deploy");
        assert!(gate.deliver(vec![]).is_some());
        assert!(gate.leave("deploy").is_none());
    }

    #[test]
    fn test_gate_flushes_empty_batch() {
        let mut gate = DeferGate::new("sub", &["build".to_string()]);
        gate.enter("build");
        let flushed = gate.leave("build").unwrap();
        assert!(flushed.changes.is_empty());
    }

    #[tokio::test]
    async fn test_capability_check() {
        let notifier = FsNotifier::new();
        let supported = notifier
            .capability_check(&[RELATIVE_ROOT], &["defer", "wildmatch"])
            .await
            .unwrap();
        assert_eq!(supported, vec!["defer"]);

        let err = notifier
            .capability_check(&[RELATIVE_ROOT, "wildmatch", "suffix-set"], &[])
            .await
            .unwrap_err();
        match err {
            NotifierError::MissingCapabilities { names } => {
                assert_eq!(names, vec!["wildmatch", "suffix-set"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_watch_project_resolves_relative_path() {
        let dir = project();
        std::fs::create_dir(dir.path().join("app")).unwrap();
        let notifier = FsNotifier::new();

        let resp = notifier.watch_project(&dir.path().join("app")).await.unwrap();
        assert_eq!(resp.watch.root(), dir.path().canonicalize().unwrap());
        assert_eq!(resp.relative_path, Some(PathBuf::from("app")));
        assert!(resp.warning.is_none());
    }

    #[tokio::test]
    async fn test_watch_project_at_project_root_has_no_relative_path() {
        let dir = project();
        let notifier = FsNotifier::new();
        let resp = notifier.watch_project(dir.path()).await.unwrap();
        assert!(resp.relative_path.is_none());
    }

    #[tokio::test]
    async fn test_watch_project_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = FsNotifier::new();
        let err = notifier
            .watch_project(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifierError::Watch { .. }));
    }

    #[tokio::test]
    async fn test_watch_project_rejects_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let notifier = FsNotifier::new();
        assert!(notifier.watch_project(&file).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_delivers_fresh_instance_first() {
        let dir = project();
        filetime::set_file_mtime(
            dir.path().join("src/index.ts"),
            filetime::FileTime::from_unix_time(1_700_000_000, 0),
        )
        .unwrap();
        let notifier = FsNotifier::new();
        let mut rx = notifier.take_events().unwrap();
        assert!(notifier.take_events().is_none());

        let resp = notifier.watch_project(dir.path()).await.unwrap();
        let ack = notifier
            .subscribe(&resp.watch, "dev", &spec("src", None))
            .await
            .unwrap();
        assert_eq!(ack.subscription, "dev");

        let fresh = rx.recv().await.unwrap();
        assert!(fresh.is_fresh_instance);
        assert_eq!(fresh.subscription, "dev");
        let index = fresh
            .changes
            .iter()
            .find(|c| c.name == Path::new("src/index.ts"))
            .unwrap();
        assert_eq!(index.kind, EntryType::File);
        assert_eq!(index.size, 14);
        assert_eq!(index.mtime_ms, 1_700_000_000_000);
        assert!(index.exists);
        assert!(fresh
            .changes
            .iter()
            .any(|c| c.name == Path::new("src/nested") && c.kind == EntryType::Dir));
    }

    #[tokio::test]
    async fn test_subscribe_names_relative_to_relative_root() {
        let dir = project();
        std::fs::create_dir_all(dir.path().join("app/src")).unwrap();
        std::fs::write(dir.path().join("app/src/main.ts"), "").unwrap();
        let notifier = FsNotifier::new();
        let mut rx = notifier.take_events().unwrap();

        let resp = notifier.watch_project(&dir.path().join("app")).await.unwrap();
        notifier
            .subscribe(&resp.watch, "dev", &spec("src", resp.relative_path.clone()))
            .await
            .unwrap();

        let fresh = rx.recv().await.unwrap();
        let names: Vec<_> = fresh.changes.iter().map(|c| c.name.clone()).collect();
        assert_eq!(names, vec![PathBuf::from("src/main.ts")]);
    }

    #[tokio::test]
    async fn test_subscribe_missing_subtree_fails() {
        let dir = project();
        let notifier = FsNotifier::new();
        let resp = notifier.watch_project(dir.path()).await.unwrap();
        let err = notifier
            .subscribe(&resp.watch, "dev", &spec("does-not-exist", None))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_unknown_watch_fails() {
        let notifier = FsNotifier::new();
        let err = notifier
            .subscribe(&WatchHandle::new("/nowhere"), "dev", &spec("src", None))
            .await
            .unwrap_err();
        assert!(matches!(err, NotifierError::UnknownWatch { .. }));
    }

    #[tokio::test]
    async fn test_change_is_delivered_after_fresh_instance() {
        let dir = project();
        let notifier = FsNotifier::new();
        let mut rx = notifier.take_events().unwrap();
        let resp = notifier.watch_project(dir.path()).await.unwrap();
        notifier
            .subscribe(&resp.watch, "dev", &spec("src", None))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_fresh_instance);

        std::fs::write(dir.path().join("src/new.ts"), "let x = 1;").unwrap();

        let batch = recv_until(&mut rx, "src/new.ts").await;
        assert!(!batch.is_fresh_instance);
        assert_eq!(batch.subscription, "dev");
    }

    #[tokio::test]
    async fn test_deferred_state_holds_changes() {
        let dir = project();
        let notifier = FsNotifier::new();
        let mut rx = notifier.take_events().unwrap();
        let resp = notifier.watch_project(dir.path()).await.unwrap();
        notifier
            .subscribe(&resp.watch, "dev", &spec("src", None))
            .await
            .unwrap();
        assert!(rx.recv().await.unwrap().is_fresh_instance);

        notifier.state_enter(&resp.watch, "build").unwrap();
        std::fs::write(dir.path().join("src/held.ts"), "1").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());

        notifier.state_leave(&resp.watch, "build").unwrap();
        let batch = recv_until(&mut rx, "src/held.ts").await;
        assert!(!batch.is_fresh_instance);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let dir = project();
        let notifier = FsNotifier::new();
        let resp = notifier.watch_project(dir.path()).await.unwrap();
        notifier
            .subscribe(&resp.watch, "dev", &spec("src", None))
            .await
            .unwrap();

        let first = notifier.unsubscribe(&resp.watch, "dev").await.unwrap();
        assert!(first.deleted);
        let second = notifier.unsubscribe(&resp.watch, "dev").await.unwrap();
        assert!(!second.deleted);
        assert_eq!(second.subscription, "dev");
    }

    #[tokio::test]
    async fn test_watch_del_all_removes_roots() {
        let dir = project();
        let notifier = FsNotifier::new();
        let resp = notifier.watch_project(dir.path()).await.unwrap();

        let roots = notifier.watch_del_all().await.unwrap();
        assert_eq!(roots, vec![resp.watch.root().to_path_buf()]);
        assert!(notifier.watch_del_all().await.unwrap().is_empty());

        let err = notifier.unsubscribe(&resp.watch, "dev").await.unwrap_err();
        assert!(matches!(err, NotifierError::UnknownWatch { .. }));
    }
}
