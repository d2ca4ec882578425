/// Watch root registration: capability negotiation, then watch-project.
use crate::console::Console;
use crate::notifier::{Notifier, NotifierError, WatchHandle, RELATIVE_ROOT};
use std::path::{Path, PathBuf};

/// An active watch root.
#[derive(Debug, Clone)]
pub struct Registration {
    pub watch: WatchHandle,
    /// Qualifier to scope subscriptions when the root sits below the project root.
    pub relative_path: Option<PathBuf>,
}

/// Fatal startup errors: the supervisor never enters its main loop.
#[derive(Debug)]
pub enum RegistrarError {
    Capabilities { source: NotifierError },
    Watch { root: PathBuf, source: NotifierError },
}

impl std::fmt::Display for RegistrarError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrarError::Capabilities { source } => {
                write!(f, "capability check failed: {}", source)
            }
            RegistrarError::Watch { root, source } => {
                write!(f, "watch failed for {}: {}", root.display(), source)
            }
        }
    }
}

impl std::error::Error for RegistrarError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RegistrarError::Capabilities { source } => Some(source),
            RegistrarError::Watch { source, .. } => Some(source),
        }
    }
}

/// Check capabilities and register `root` with the notifier.
///
/// A warning returned with the watch is shown but does not stop startup.
/// The terminal is cleared once the watch is active when `clear` is set.
pub async fn register_root<N: Notifier, C: Console>(
    notifier: &N,
    root: &Path,
    console: &C,
    clear: bool,
) -> Result<Registration, RegistrarError> {
    notifier
        .capability_check(&[RELATIVE_ROOT], &[])
        .await
        .map_err(|e| RegistrarError::Capabilities { source: e })?;

    let resp = notifier
        .watch_project(root)
        .await
        .map_err(|e| RegistrarError::Watch {
            root: root.to_path_buf(),
            source: e,
        })?;

    if clear {
        console.clear();
    }
    if let Some(warning) = &resp.warning {
        tracing::warn!(warning = %warning, "notifier warning");
        console.warning(&format!("Warning: {warning}"));
    }
    console.notice(&format!("Watch added: {}", resp.watch));
    tracing::info!(
        watch = %resp.watch,
        relative_path = ?resp.relative_path,
        "watch established"
    );

    Ok(Registration {
        watch: resp.watch,
        relative_path: resp.relative_path,
    })
}
