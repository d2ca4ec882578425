//! In-memory notifier for tests: records requests, injects batches and failures.
use super::{
    Notifier, NotifierError, SubscribeAck, SubscriptionBatch, SubscriptionSpec, UnsubscribeAck,
    WatchHandle, WatchResponse,
};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    CapabilityCheck,
    WatchProject(PathBuf),
    Subscribe(String),
    Unsubscribe(String),
    WatchDelAll,
}

#[derive(Debug, Default)]
pub struct Failures {
    pub capability: bool,
    pub watch: bool,
    pub subscribe: bool,
    pub unsubscribe: bool,
    pub watch_del: bool,
}

pub struct ScriptedNotifier {
    pub requests: RefCell<Vec<Request>>,
    pub failures: RefCell<Failures>,
    pub warning: Option<String>,
    pub relative_path: Option<PathBuf>,
    pub last_spec: RefCell<Option<SubscriptionSpec>>,
    /// Teardown requests in the order they answered.
    pub completions: RefCell<Vec<&'static str>>,
    tx: mpsc::UnboundedSender<SubscriptionBatch>,
    rx: RefCell<Option<mpsc::UnboundedReceiver<SubscriptionBatch>>>,
}

impl ScriptedNotifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            requests: RefCell::new(Vec::new()),
            failures: RefCell::new(Failures::default()),
            warning: None,
            relative_path: None,
            last_spec: RefCell::new(None),
            completions: RefCell::new(Vec::new()),
            tx,
            rx: RefCell::new(Some(rx)),
        }
    }

    /// Sender for pushing batches as if the notifier emitted them.
    pub fn sender(&self) -> mpsc::UnboundedSender<SubscriptionBatch> {
        self.tx.clone()
    }

    pub fn count(&self, request: &Request) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|r| *r == request)
            .count()
    }

    fn record(&self, request: Request) {
        self.requests.borrow_mut().push(request);
    }
}

impl Notifier for ScriptedNotifier {
    async fn capability_check(
        &self,
        required: &[&str],
        _optional: &[&str],
    ) -> Result<Vec<String>, NotifierError> {
        self.record(Request::CapabilityCheck);
        if self.failures.borrow().capability {
            return Err(NotifierError::MissingCapabilities {
                names: required.iter().map(|s| s.to_string()).collect(),
            });
        }
        Ok(Vec::new())
    }

    async fn watch_project(&self, root: &Path) -> Result<WatchResponse, NotifierError> {
        self.record(Request::WatchProject(root.to_path_buf()));
        if self.failures.borrow().watch {
            return Err(NotifierError::Rejected("watch refused".to_string()));
        }
        Ok(WatchResponse {
            watch: WatchHandle::new(root),
            relative_path: self.relative_path.clone(),
            warning: self.warning.clone(),
        })
    }

    async fn subscribe(
        &self,
        _watch: &WatchHandle,
        name: &str,
        spec: &SubscriptionSpec,
    ) -> Result<SubscribeAck, NotifierError> {
        self.record(Request::Subscribe(name.to_string()));
        *self.last_spec.borrow_mut() = Some(spec.clone());
        if self.failures.borrow().subscribe {
            return Err(NotifierError::Rejected("subscribe refused".to_string()));
        }
        Ok(SubscribeAck {
            subscription: name.to_string(),
        })
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SubscriptionBatch>> {
        self.rx.borrow_mut().take()
    }

    async fn unsubscribe(
        &self,
        _watch: &WatchHandle,
        name: &str,
    ) -> Result<UnsubscribeAck, NotifierError> {
        self.record(Request::Unsubscribe(name.to_string()));
        tokio::task::yield_now().await;
        self.completions.borrow_mut().push("unsubscribe");
        if self.failures.borrow().unsubscribe {
            return Err(NotifierError::Rejected("unsubscribe refused".to_string()));
        }
        Ok(UnsubscribeAck {
            subscription: name.to_string(),
            deleted: true,
        })
    }

    async fn watch_del_all(&self) -> Result<Vec<PathBuf>, NotifierError> {
        self.record(Request::WatchDelAll);
        self.completions.borrow_mut().push("watch-del-all");
        if self.failures.borrow().watch_del {
            return Err(NotifierError::Rejected("watch-del-all refused".to_string()));
        }
        Ok(vec![PathBuf::from("/project")])
    }
}
