//! The notifier protocol: root registration, named subscriptions and the
//! batch stream they feed.

pub mod fs;
#[cfg(test)]
pub mod scripted;

use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

pub use fs::FsNotifier;

/// Capability every session needs: scoping a subscription to a sub-path.
pub const RELATIVE_ROOT: &str = "relative_root";

/// Opaque token for a registered watch root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchHandle(PathBuf);

impl WatchHandle {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WatchHandle(root.into())
    }

    pub fn root(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Response to a watch-project request.
#[derive(Debug, Clone)]
pub struct WatchResponse {
    pub watch: WatchHandle,
    /// Requested directory relative to the watched project root, if different.
    pub relative_path: Option<PathBuf>,
    pub warning: Option<String>,
}

/// Per-entry fields a subscription asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Size,
    MtimeMs,
    Exists,
    Type,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::Name,
        Field::Size,
        Field::MtimeMs,
        Field::Exists,
        Field::Type,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Size => "size",
            Field::MtimeMs => "mtime_ms",
            Field::Exists => "exists",
            Field::Type => "type",
        }
    }
}

/// What a subscription matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// Everything below the given directory.
    Dirname(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    pub expression: Expression,
    pub fields: Vec<Field>,
    pub relative_root: Option<PathBuf>,
    pub defer: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Other,
}

/// One modified filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub name: PathBuf,
    pub size: u64,
    pub mtime_ms: i64,
    pub exists: bool,
    pub kind: EntryType,
}

/// One delivery on the subscription channel.
#[derive(Debug, Clone)]
pub struct SubscriptionBatch {
    pub subscription: String,
    pub is_fresh_instance: bool,
    pub changes: Vec<ChangeEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAck {
    pub subscription: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeAck {
    pub subscription: String,
    pub deleted: bool,
}

/// Errors reported by a notifier.
#[derive(Debug)]
pub enum NotifierError {
    MissingCapabilities { names: Vec<String> },
    Watch { path: PathBuf, source: std::io::Error },
    UnknownWatch { watch: WatchHandle },
    Backend(notify::Error),
    /// Failure reported by a notifier that has no richer error to offer.
    Rejected(String),
}

impl std::fmt::Display for NotifierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifierError::MissingCapabilities { names } => {
                write!(f, "notifier lacks required capabilities: {}", names.join(", "))
            }
            NotifierError::Watch { path, source } => {
                write!(f, "cannot watch {}: {}", path.display(), source)
            }
            NotifierError::UnknownWatch { watch } => write!(f, "{watch} is not watched"),
            NotifierError::Backend(e) => write!(f, "file watcher error: {e}"),
            NotifierError::Rejected(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for NotifierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifierError::Watch { source, .. } => Some(source),
            NotifierError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<notify::Error> for NotifierError {
    fn from(e: notify::Error) -> Self {
        NotifierError::Backend(e)
    }
}

/// A file-change notification service.
///
/// Requests take `&self` so that teardown can issue unsubscribe and
/// delete-all concurrently on one task.
#[allow(async_fn_in_trait)]
pub trait Notifier {
    /// Fails with `MissingCapabilities` when any `required` name is absent.
    /// Returns the subset of `optional` the notifier supports.
    async fn capability_check(
        &self,
        required: &[&str],
        optional: &[&str],
    ) -> Result<Vec<String>, NotifierError>;

    async fn watch_project(&self, root: &Path) -> Result<WatchResponse, NotifierError>;

    async fn subscribe(
        &self,
        watch: &WatchHandle,
        name: &str,
        spec: &SubscriptionSpec,
    ) -> Result<SubscribeAck, NotifierError>;

    /// The channel every subscription's batches are multiplexed on.
    /// Can be taken once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SubscriptionBatch>>;

    async fn unsubscribe(
        &self,
        watch: &WatchHandle,
        name: &str,
    ) -> Result<UnsubscribeAck, NotifierError>;

    /// Drops every watch; returns the roots that were removed.
    async fn watch_del_all(&self) -> Result<Vec<PathBuf>, NotifierError>;
}
