//! Persistent (competing-consumer) subscription handle and group settings.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use strom_wire::Credentials;
use strom_wire::proto;

pub use strom_wire::proto::{ConsumerStrategy, NakAction};

use crate::client::driver::DriverCommand;
use crate::error::{OperationError, SubscriptionDropReason};
use crate::types::ResolvedEvent;

/// Server-side group configuration used by create and update.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistentSubscriptionSettings {
    pub resolve_link_tos: bool,
    /// Event number to start from; -1 subscribes from the end of the stream.
    pub start_from: i64,
    pub message_timeout: Duration,
    pub max_retry_count: i32,
    pub live_buffer_size: i32,
    pub read_batch_size: i32,
    pub history_buffer_size: i32,
    pub checkpoint_after: Duration,
    pub checkpoint_min_count: i32,
    pub checkpoint_max_count: i32,
    /// 0 means unlimited.
    pub max_subscriber_count: i32,
    pub consumer_strategy: ConsumerStrategy,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: -1,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 500,
            live_buffer_size: 500,
            read_batch_size: 10,
            history_buffer_size: 20,
            checkpoint_after: Duration::from_secs(2),
            checkpoint_min_count: 10,
            checkpoint_max_count: 1000,
            max_subscriber_count: 0,
            consumer_strategy: ConsumerStrategy::RoundRobin,
        }
    }
}

impl PersistentSubscriptionSettings {
    pub(crate) fn to_wire(&self, stream: &str, group: &str) -> proto::PersistentSubscriptionParams {
        proto::PersistentSubscriptionParams {
            subscription_group_name: group.to_string(),
            event_stream_id: stream.to_string(),
            resolve_link_tos: self.resolve_link_tos,
            start_from: self.start_from,
            message_timeout_millis: self.message_timeout.as_millis() as i32,
            live_buffer_size: self.live_buffer_size,
            read_batch_size: self.read_batch_size,
            history_buffer_size: self.history_buffer_size,
            max_retry_count: self.max_retry_count,
            checkpoint_after_millis: self.checkpoint_after.as_millis() as i32,
            checkpoint_min_count: self.checkpoint_min_count,
            checkpoint_max_count: self.checkpoint_max_count,
            subscriber_max_count: self.max_subscriber_count,
            consumer_strategy: self.consumer_strategy,
        }
    }
}

/// Callbacks for a persistent subscription. Events arrive strictly
/// serialized; a failed handler naks the event instead of dropping the
/// subscription.
pub trait PersistentSubscriptionListener: Send + Sync + 'static {
    fn on_event(
        &self,
        subscription: &PersistentSubscription,
        event: ResolvedEvent,
        retry_count: i32,
    ) -> anyhow::Result<()>;

    fn on_close(
        &self,
        subscription: &PersistentSubscription,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        let _ = (subscription, reason, error);
    }

    /// NAK action applied when `on_event` returns an error and auto-ack is
    /// enabled.
    fn failure_action(&self) -> NakAction {
        NakAction::Unknown
    }
}

pub(crate) struct PersistentShared {
    pub(crate) subscription_id: Uuid,
    pub(crate) stream: String,
    pub(crate) group: String,
    pub(crate) driver: mpsc::UnboundedSender<DriverCommand>,
}

/// Handle to a connected persistent subscription; acks and naks are keyed by
/// the pushed event's id.
#[derive(Clone)]
pub struct PersistentSubscription {
    pub(crate) shared: Arc<PersistentShared>,
}

impl PersistentSubscription {
    pub fn stream_id(&self) -> &str {
        &self.shared.stream
    }

    pub fn group(&self) -> &str {
        &self.shared.group
    }

    pub fn acknowledge(&self, event: &ResolvedEvent) {
        if let Some(record) = event.original_event() {
            self.acknowledge_ids(vec![record.event_id]);
        }
    }

    pub fn acknowledge_ids(&self, event_ids: Vec<Uuid>) {
        let _ = self.shared.driver.send(DriverCommand::AckEvents {
            subscription_id: self.shared.subscription_id,
            event_ids,
        });
    }

    pub fn fail(&self, event: &ResolvedEvent, action: NakAction, message: impl Into<String>) {
        if let Some(record) = event.original_event() {
            self.fail_ids(vec![record.event_id], action, message);
        }
    }

    pub fn fail_ids(&self, event_ids: Vec<Uuid>, action: NakAction, message: impl Into<String>) {
        let _ = self.shared.driver.send(DriverCommand::NakEvents {
            subscription_id: self.shared.subscription_id,
            event_ids,
            action,
            message: message.into(),
        });
    }

    /// Detach from the group. Parked and in-flight messages stay with the
    /// server for other consumers.
    pub fn stop(&self) {
        let _ = self.shared.driver.send(DriverCommand::Unsubscribe {
            subscription_id: self.shared.subscription_id,
        });
    }
}

/// Request to connect to a persistent subscription group.
pub(crate) struct StartPersistent {
    pub(crate) stream: String,
    pub(crate) group: String,
    pub(crate) buffer_size: i32,
    pub(crate) auto_ack: bool,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) listener: Arc<dyn PersistentSubscriptionListener>,
    pub(crate) result: oneshot::Sender<Result<PersistentSubscription, OperationError>>,
}
