/// Session subscription: registration and the filtered batch stream.
use crate::config::WatchConfig;
use crate::console::Console;
use crate::notifier::{
    Expression, Field, Notifier, SubscribeAck, SubscriptionBatch, SubscriptionSpec,
};
use crate::registrar::Registration;
use tokio::sync::mpsc;

/// Build the subscription request for this session.
pub fn subscription_spec(registration: &Registration, watch: &WatchConfig) -> SubscriptionSpec {
    SubscriptionSpec {
        expression: Expression::Dirname(watch.subtree.clone()),
        fields: Field::ALL.to_vec(),
        relative_root: registration.relative_path.clone(),
        defer: watch.defer.clone(),
    }
}

/// Register the session subscription.
///
/// Failure is reported and yields `None`: the supervisor stays up but
/// never sees a change.
pub async fn subscribe<N: Notifier, C: Console>(
    notifier: &N,
    registration: &Registration,
    watch: &WatchConfig,
    console: &C,
) -> Option<SubscribeAck> {
    let spec = subscription_spec(registration, watch);
    match notifier
        .subscribe(&registration.watch, &watch.subscription, &spec)
        .await
    {
        Ok(ack) => {
            tracing::info!(
                subscription = %ack.subscription,
                subtree = %watch.subtree.display(),
                fields = ?spec.fields.iter().map(Field::as_str).collect::<Vec<_>>(),
                "subscription added"
            );
            console.notice(&format!("Subscription added: {}", ack.subscription));
            Some(ack)
        }
        Err(e) => {
            tracing::error!(error = %e, subscription = %watch.subscription, "failed to subscribe");
            console.error(&format!("Failed to subscribe: {e}"));
            None
        }
    }
}

/// Batches for one subscription, read off the notifier's shared channel.
pub struct BatchStream {
    name: String,
    rx: mpsc::UnboundedReceiver<SubscriptionBatch>,
}

impl BatchStream {
    pub fn new(name: impl Into<String>, rx: mpsc::UnboundedReceiver<SubscriptionBatch>) -> Self {
        Self {
            name: name.into(),
            rx,
        }
    }

    /// Next batch addressed to this subscription; `None` once the channel closes.
    pub async fn next(&mut self) -> Option<SubscriptionBatch> {
        loop {
            let batch = self.rx.recv().await?;
            if batch.subscription == self.name {
                return Some(batch);
            }
            tracing::debug!(
                subscription = %batch.subscription,
                "ignoring batch for another subscription"
            );
        }
    }
}
