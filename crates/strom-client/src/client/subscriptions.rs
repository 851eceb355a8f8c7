//! Server-push subscription registry: confirmation-first protocol, strictly
//! serialized user callbacks, drop-once semantics, and transparent
//! re-establishment after reconnect at the recorded position.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use strom_transport::PackageWriter;
use strom_wire::proto::{self, NakAction};
use strom_wire::{Command, Credentials, Package};

use crate::client::driver::DriverCommand;
use crate::client::persistent::{
    PersistentShared, PersistentSubscription, PersistentSubscriptionListener, StartPersistent,
};
use crate::config::Settings;
use crate::error::{OperationError, SubscriptionDropReason};
use crate::types::{Position, ResolvedEvent};

/// Callbacks for a volatile subscription. `on_event` returning an error drops
/// the subscription with `EventHandlerException`.
pub trait SubscriptionListener: Send + Sync + 'static {
    fn on_event(&self, subscription: &Subscription, event: ResolvedEvent) -> anyhow::Result<()>;

    fn on_close(
        &self,
        subscription: &Subscription,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        let _ = (subscription, reason, error);
    }
}

pub(crate) struct SubscriptionShared {
    pub(crate) subscription_id: Uuid,
    pub(crate) stream: String,
    last_commit_position: AtomicI64,
    last_event_number: AtomicI64,
    driver: mpsc::UnboundedSender<DriverCommand>,
}

/// Handle to a live volatile subscription.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub(crate) fn id(&self) -> Uuid {
        self.shared.subscription_id
    }

    /// The subscribed stream; empty for the all-streams log.
    pub fn stream_id(&self) -> &str {
        &self.shared.stream
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.shared.stream.is_empty()
    }

    /// Last commit position the server reported at confirmation.
    pub fn last_commit_position(&self) -> i64 {
        self.shared.last_commit_position.load(Ordering::Acquire)
    }

    /// Last event number the server reported at confirmation (stream
    /// subscriptions only).
    pub fn last_event_number(&self) -> Option<i64> {
        match self.shared.last_event_number.load(Ordering::Acquire) {
            -1 => None,
            number => Some(number),
        }
    }

    pub fn unsubscribe(&self) {
        let _ = self.shared.driver.send(DriverCommand::Unsubscribe {
            subscription_id: self.shared.subscription_id,
        });
    }
}

/// Request to open a volatile subscription.
pub(crate) struct StartSubscription {
    pub(crate) stream: String,
    pub(crate) resolve_link_tos: bool,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) listener: Arc<dyn SubscriptionListener>,
    pub(crate) result: oneshot::Sender<Result<Subscription, OperationError>>,
}

enum SubscriptionKind {
    Volatile {
        listener: Arc<dyn SubscriptionListener>,
    },
    Persistent {
        group: String,
        buffer_size: i32,
        auto_ack: bool,
        listener: Arc<dyn PersistentSubscriptionListener>,
        outstanding: HashSet<Uuid>,
    },
}

enum PendingResult {
    Volatile(oneshot::Sender<Result<Subscription, OperationError>>),
    Persistent(oneshot::Sender<Result<PersistentSubscription, OperationError>>),
}

enum EntryState {
    /// Sent, awaiting the first confirmation; the caller is still blocked.
    PendingFirst { result: PendingResult, since: Instant },
    /// Re-sent after a reconnect, awaiting re-confirmation.
    PendingResubscribe { since: Instant },
    Live,
}

enum SubscriptionNotice {
    Event(ResolvedEvent, i32),
    Dropped(SubscriptionDropReason, Option<anyhow::Error>),
}

enum SharedHandle {
    Volatile(Arc<SubscriptionShared>),
    Persistent(Arc<PersistentShared>),
}

struct DispatchChannel {
    tx: mpsc::UnboundedSender<SubscriptionNotice>,
    shared: SharedHandle,
}

struct SubscriptionItem {
    /// Identity the user observes; survives resubscription.
    stable_id: Uuid,
    /// Correlation id of the current wire subscription.
    correlation_id: Uuid,
    stream: String,
    resolve_link_tos: bool,
    credentials: Option<Credentials>,
    kind: SubscriptionKind,
    state: EntryState,
    retry_count: i32,
    channel: Option<DispatchChannel>,
    last_event_number: Option<i64>,
    last_position: Option<Position>,
}

pub(crate) struct SubscriptionRegistry {
    active: HashMap<Uuid, SubscriptionItem>,
    waiting: Vec<SubscriptionItem>,
    max_retries: i32,
    operation_timeout: Duration,
    driver: mpsc::UnboundedSender<DriverCommand>,
}

impl SubscriptionRegistry {
    pub(crate) fn new(settings: &Settings, driver: mpsc::UnboundedSender<DriverCommand>) -> Self {
        Self {
            active: HashMap::new(),
            waiting: Vec::new(),
            max_retries: settings.max_operation_retries,
            operation_timeout: settings.operation_timeout,
            driver,
        }
    }

    pub(crate) fn enqueue_volatile(&mut self, request: StartSubscription) {
        self.waiting.push(SubscriptionItem {
            stable_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            stream: request.stream,
            resolve_link_tos: request.resolve_link_tos,
            credentials: request.credentials,
            kind: SubscriptionKind::Volatile {
                listener: request.listener,
            },
            state: EntryState::PendingFirst {
                result: PendingResult::Volatile(request.result),
                since: Instant::now(),
            },
            retry_count: 0,
            channel: None,
            last_event_number: None,
            last_position: None,
        });
    }

    pub(crate) fn enqueue_persistent(&mut self, request: StartPersistent) {
        self.waiting.push(SubscriptionItem {
            stable_id: Uuid::new_v4(),
            correlation_id: Uuid::new_v4(),
            stream: request.stream,
            resolve_link_tos: false,
            credentials: request.credentials,
            kind: SubscriptionKind::Persistent {
                group: request.group,
                buffer_size: request.buffer_size,
                auto_ack: request.auto_ack,
                listener: request.listener,
                outstanding: HashSet::new(),
            },
            state: EntryState::PendingFirst {
                result: PendingResult::Persistent(request.result),
                since: Instant::now(),
            },
            retry_count: 0,
            channel: None,
            last_event_number: None,
            last_position: None,
        });
    }

    /// Send every waiting subscription with a fresh correlation id. Entries
    /// that were live before a reconnect carry their recorded position so the
    /// server resumes where the old channel left off.
    pub(crate) async fn schedule_waiting(
        &mut self,
        writer: &mut PackageWriter,
        default_credentials: &Option<Credentials>,
    ) -> Result<(), strom_transport::Error> {
        while let Some(mut item) = self.waiting.pop() {
            item.correlation_id = Uuid::new_v4();
            let credentials = item
                .credentials
                .clone()
                .or_else(|| default_credentials.clone());
            let package = match subscribe_package(&item) {
                Ok(package) => package.with_credentials(credentials),
                Err(err) => {
                    warn!(stream = %item.stream, error = %err, "subscribe encode failed");
                    self.finish_item(item, SubscriptionDropReason::ServerError, Some(err.into()));
                    continue;
                }
            };
            if let Err(err) = writer.write_package(&package).await {
                self.waiting.push(item);
                return Err(err);
            }
            debug!(
                stream = %item.stream,
                correlation = %item.correlation_id,
                "subscription request sent"
            );
            if matches!(item.state, EntryState::Live) {
                item.state = EntryState::PendingResubscribe {
                    since: Instant::now(),
                };
            }
            self.active.insert(item.correlation_id, item);
        }
        Ok(())
    }

    /// Route a server-pushed package by correlation id. Returns `false` when
    /// no subscription claims it.
    pub(crate) fn handle_package(&mut self, package: Package) -> bool {
        let correlation_id = package.correlation_id;
        if !self.active.contains_key(&correlation_id) {
            return false;
        }
        match package.command {
            Command::SubscriptionConfirmation => {
                match proto::SubscriptionConfirmation::decode(package.payload) {
                    Ok(confirmation) => self.confirm(
                        correlation_id,
                        confirmation.last_commit_position,
                        confirmation.last_event_number,
                    ),
                    Err(err) => self.drop_by_correlation(
                        correlation_id,
                        SubscriptionDropReason::ServerError,
                        Some(anyhow::Error::new(err)),
                    ),
                }
            }
            Command::PersistentSubscriptionConfirmation => {
                match proto::PersistentSubscriptionConfirmation::decode(package.payload) {
                    Ok(confirmation) => self.confirm(
                        correlation_id,
                        confirmation.last_commit_position,
                        confirmation.last_event_number,
                    ),
                    Err(err) => self.drop_by_correlation(
                        correlation_id,
                        SubscriptionDropReason::ServerError,
                        Some(anyhow::Error::new(err)),
                    ),
                }
            }
            Command::StreamEventAppeared => {
                match proto::StreamEventAppeared::decode(package.payload) {
                    Ok(appeared) => self.deliver(correlation_id, appeared.event.into(), 0),
                    Err(err) => self.drop_by_correlation(
                        correlation_id,
                        SubscriptionDropReason::ServerError,
                        Some(anyhow::Error::new(err)),
                    ),
                }
            }
            Command::PersistentSubscriptionStreamEventAppeared => {
                match proto::PersistentSubscriptionStreamEventAppeared::decode(package.payload) {
                    Ok(appeared) => {
                        self.deliver(correlation_id, appeared.event.into(), appeared.retry_count)
                    }
                    Err(err) => self.drop_by_correlation(
                        correlation_id,
                        SubscriptionDropReason::ServerError,
                        Some(anyhow::Error::new(err)),
                    ),
                }
            }
            Command::SubscriptionDropped => {
                let reason = match proto::SubscriptionDropped::decode(package.payload) {
                    Ok(dropped) => dropped.reason.into(),
                    Err(_) => SubscriptionDropReason::ServerError,
                };
                self.drop_by_correlation(correlation_id, reason, None);
            }
            Command::NotAuthenticated => {
                let text = proto::text_payload(&package.payload);
                self.drop_by_correlation(
                    correlation_id,
                    SubscriptionDropReason::AccessDenied,
                    Some(anyhow::Error::new(OperationError::NotAuthenticated(text))),
                );
            }
            Command::BadRequest => {
                let text = proto::text_payload(&package.payload);
                self.drop_by_correlation(
                    correlation_id,
                    SubscriptionDropReason::ServerError,
                    Some(anyhow::Error::new(OperationError::BadRequest(text))),
                );
            }
            Command::NotHandled => {
                // Not subscribable right now; retry through the waiting queue.
                if let Some(item) = self.active.remove(&correlation_id) {
                    self.waiting.push(item);
                }
            }
            other => {
                debug!(command = ?other, "unexpected command on subscription correlation");
            }
        }
        true
    }

    fn confirm(&mut self, correlation_id: Uuid, last_commit_position: i64, last_event_number: i64) {
        let Some(item) = self.active.get_mut(&correlation_id) else {
            return;
        };
        match std::mem::replace(
            &mut item.state,
            EntryState::Live,
        ) {
            EntryState::PendingFirst { result, .. } => {
                let (tx, rx) = mpsc::unbounded_channel();
                // Kind and result are created together; a mismatch cannot be
                // built through the registry API.
                match result {
                    PendingResult::Volatile(sender) => {
                        let listener = match &item.kind {
                            SubscriptionKind::Volatile { listener } => Arc::clone(listener),
                            SubscriptionKind::Persistent { .. } => {
                                unreachable!("volatile result on persistent entry")
                            }
                        };
                        let shared = Arc::new(SubscriptionShared {
                            subscription_id: item.stable_id,
                            stream: item.stream.clone(),
                            last_commit_position: AtomicI64::new(last_commit_position),
                            last_event_number: AtomicI64::new(last_event_number),
                            driver: self.driver.clone(),
                        });
                        tokio::spawn(run_volatile_dispatch(Arc::clone(&shared), listener, rx));
                        item.channel = Some(DispatchChannel {
                            tx,
                            shared: SharedHandle::Volatile(Arc::clone(&shared)),
                        });
                        let _ = sender.send(Ok(Subscription { shared }));
                    }
                    PendingResult::Persistent(sender) => {
                        let (group, auto_ack, listener) = match &item.kind {
                            SubscriptionKind::Persistent {
                                group,
                                auto_ack,
                                listener,
                                ..
                            } => (group.clone(), *auto_ack, Arc::clone(listener)),
                            SubscriptionKind::Volatile { .. } => {
                                unreachable!("persistent result on volatile entry")
                            }
                        };
                        let shared = Arc::new(PersistentShared {
                            subscription_id: item.stable_id,
                            stream: item.stream.clone(),
                            group,
                            driver: self.driver.clone(),
                        });
                        tokio::spawn(run_persistent_dispatch(
                            Arc::clone(&shared),
                            listener,
                            rx,
                            auto_ack,
                        ));
                        item.channel = Some(DispatchChannel {
                            tx,
                            shared: SharedHandle::Persistent(Arc::clone(&shared)),
                        });
                        let _ = sender.send(Ok(PersistentSubscription { shared }));
                    }
                }
                debug!(stream = %item.stream, "subscription confirmed");
            }
            EntryState::PendingResubscribe { .. } => {
                if let Some(channel) = &item.channel
                    && let SharedHandle::Volatile(shared) = &channel.shared
                {
                    shared
                        .last_commit_position
                        .store(last_commit_position, Ordering::Release);
                    shared
                        .last_event_number
                        .store(last_event_number, Ordering::Release);
                }
                debug!(stream = %item.stream, "subscription re-established");
            }
            EntryState::Live => {}
        }
    }

    fn deliver(&mut self, correlation_id: Uuid, event: ResolvedEvent, retry_count: i32) {
        let Some(item) = self.active.get_mut(&correlation_id) else {
            return;
        };
        if item.stream.is_empty() {
            item.last_position = event.original_position().or(item.last_position);
        } else {
            item.last_event_number = Some(event.original_event_number());
        }
        if let SubscriptionKind::Persistent { outstanding, .. } = &mut item.kind
            && let Some(record) = event.original_event()
        {
            outstanding.insert(record.event_id);
        }
        if let Some(channel) = &item.channel {
            let _ = channel.tx.send(SubscriptionNotice::Event(event, retry_count));
        }
    }

    fn drop_by_correlation(
        &mut self,
        correlation_id: Uuid,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        if let Some(item) = self.active.remove(&correlation_id) {
            self.finish_item(item, reason, error);
        }
    }

    fn finish_item(
        &mut self,
        item: SubscriptionItem,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        metrics::counter!("strom_client_subscriptions_dropped_total").increment(1);
        match item.state {
            EntryState::PendingFirst { result, .. } => {
                let failure = subscribe_failure(reason, error);
                match result {
                    PendingResult::Volatile(sender) => {
                        let _ = sender.send(Err(failure));
                    }
                    PendingResult::Persistent(sender) => {
                        let _ = sender.send(Err(failure));
                    }
                }
            }
            EntryState::PendingResubscribe { .. } | EntryState::Live => {
                if let Some(channel) = item.channel {
                    let _ = channel.tx.send(SubscriptionNotice::Dropped(reason, error));
                }
            }
        }
    }

    /// User-initiated unsubscribe by stable id. Returns the package to send
    /// to the server, when the subscription is currently on the wire.
    pub(crate) fn unsubscribe(&mut self, stable_id: Uuid) -> Option<Package> {
        let correlation_id = self
            .active
            .values()
            .find(|item| item.stable_id == stable_id)
            .map(|item| item.correlation_id);
        if let Some(correlation_id) = correlation_id {
            let item = self.active.remove(&correlation_id)?;
            let package = Package::new(Command::UnsubscribeFromStream, correlation_id);
            self.finish_item(item, SubscriptionDropReason::UserInitiated, None);
            return Some(package);
        }
        if let Some(index) = self
            .waiting
            .iter()
            .position(|item| item.stable_id == stable_id)
        {
            let item = self.waiting.remove(index);
            self.finish_item(item, SubscriptionDropReason::UserInitiated, None);
        }
        None
    }

    /// Ack package for a connected persistent subscription, using its current
    /// wire correlation id.
    pub(crate) fn ack_package(&mut self, stable_id: Uuid, event_ids: Vec<Uuid>) -> Option<Package> {
        let item = self
            .active
            .values_mut()
            .find(|item| item.stable_id == stable_id)?;
        let SubscriptionKind::Persistent {
            group, outstanding, ..
        } = &mut item.kind
        else {
            return None;
        };
        for event_id in &event_ids {
            if !outstanding.remove(event_id) {
                debug!(%event_id, "ack for event that is not outstanding");
            }
        }
        let payload = proto::PersistentSubscriptionAckEvents {
            subscription_id: group.clone(),
            processed_event_ids: event_ids,
        }
        .encode()
        .ok()?;
        Some(
            Package::new(Command::PersistentSubscriptionAckEvents, item.correlation_id)
                .with_payload(payload),
        )
    }

    pub(crate) fn nak_package(
        &mut self,
        stable_id: Uuid,
        event_ids: Vec<Uuid>,
        action: NakAction,
        message: String,
    ) -> Option<Package> {
        let item = self
            .active
            .values_mut()
            .find(|item| item.stable_id == stable_id)?;
        let SubscriptionKind::Persistent {
            group, outstanding, ..
        } = &mut item.kind
        else {
            return None;
        };
        for event_id in &event_ids {
            outstanding.remove(event_id);
        }
        let payload = proto::PersistentSubscriptionNakEvents {
            subscription_id: group.clone(),
            processed_event_ids: event_ids,
            action,
            message,
        }
        .encode()
        .ok()?;
        Some(
            Package::new(Command::PersistentSubscriptionNakEvents, item.correlation_id)
                .with_payload(payload),
        )
    }

    /// On channel loss every active subscription moves to waiting, keeping
    /// its dispatch channel and recorded position; user-visible ids survive.
    pub(crate) fn on_disconnected(&mut self) {
        for (_, item) in self.active.drain() {
            self.waiting.push(item);
        }
    }

    /// Pending confirmations that outlived the operation timeout either retry
    /// or give up.
    pub(crate) fn check_timeouts(&mut self, now: Instant) {
        let stale: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, item)| match &item.state {
                EntryState::PendingFirst { since, .. }
                | EntryState::PendingResubscribe { since } => {
                    now.duration_since(*since) > self.operation_timeout
                }
                EntryState::Live => false,
            })
            .map(|(id, _)| *id)
            .collect();
        for correlation_id in stale {
            let Some(mut item) = self.active.remove(&correlation_id) else {
                continue;
            };
            item.retry_count += 1;
            if self.max_retries >= 0 && item.retry_count > self.max_retries {
                self.finish_item(
                    item,
                    SubscriptionDropReason::ServerError,
                    Some(anyhow::anyhow!("subscription confirmation timed out")),
                );
            } else {
                self.waiting.push(item);
            }
        }
    }

    pub(crate) fn drop_all(&mut self, reason: SubscriptionDropReason) {
        let items: Vec<SubscriptionItem> = self
            .active
            .drain()
            .map(|(_, item)| item)
            .chain(self.waiting.drain(..))
            .collect();
        for item in items {
            self.finish_item(item, reason, None);
        }
    }

    pub(crate) fn active_len(&self) -> usize {
        self.active.len()
    }
}

fn subscribe_package(item: &SubscriptionItem) -> strom_wire::Result<Package> {
    match &item.kind {
        SubscriptionKind::Volatile { .. } => {
            let (resume_commit, resume_prepare) = item
                .last_position
                .map(|position| (position.commit, position.prepare))
                .unwrap_or((-1, -1));
            let payload = proto::SubscribeToStream {
                event_stream_id: item.stream.clone(),
                resolve_link_tos: item.resolve_link_tos,
                resume_after_event_number: item.last_event_number.unwrap_or(-1),
                resume_after_commit_position: resume_commit,
                resume_after_prepare_position: resume_prepare,
            }
            .encode()?;
            Ok(Package::new(Command::SubscribeToStream, item.correlation_id).with_payload(payload))
        }
        SubscriptionKind::Persistent {
            group, buffer_size, ..
        } => {
            let payload = proto::ConnectToPersistentSubscription {
                subscription_id: group.clone(),
                event_stream_id: item.stream.clone(),
                allowed_in_flight_messages: *buffer_size,
            }
            .encode()?;
            Ok(
                Package::new(Command::ConnectToPersistentSubscription, item.correlation_id)
                    .with_payload(payload),
            )
        }
    }
}

fn subscribe_failure(
    reason: SubscriptionDropReason,
    error: Option<anyhow::Error>,
) -> OperationError {
    match reason {
        SubscriptionDropReason::AccessDenied => {
            OperationError::AccessDenied("subscription access denied".to_string())
        }
        SubscriptionDropReason::NotFound => {
            OperationError::InvalidArgument("subscription target not found".to_string())
        }
        SubscriptionDropReason::PersistentSubscriptionDeleted => {
            OperationError::PersistentSubscriptionDeleted
        }
        SubscriptionDropReason::SubscriberMaxCountReached => {
            OperationError::MaximumSubscribersReached
        }
        SubscriptionDropReason::ConnectionClosed => OperationError::ConnectionClosed,
        _ => OperationError::ServerError(
            error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "subscription failed".to_string()),
        ),
    }
}

// Single dispatch task per subscription: callbacks are strictly serialized
// and run off the socket read path.
async fn run_volatile_dispatch(
    shared: Arc<SubscriptionShared>,
    listener: Arc<dyn SubscriptionListener>,
    mut rx: mpsc::UnboundedReceiver<SubscriptionNotice>,
) {
    let handle = Subscription {
        shared: Arc::clone(&shared),
    };
    while let Some(notice) = rx.recv().await {
        match notice {
            SubscriptionNotice::Event(event, _) => {
                if let Err(error) = listener.on_event(&handle, event) {
                    warn!(stream = %shared.stream, error = %error, "event handler failed");
                    handle.unsubscribe();
                    listener.on_close(
                        &handle,
                        SubscriptionDropReason::EventHandlerException,
                        Some(error),
                    );
                    return;
                }
            }
            SubscriptionNotice::Dropped(reason, error) => {
                debug!(stream = %shared.stream, ?reason, "subscription dropped");
                listener.on_close(&handle, reason, error);
                return;
            }
        }
    }
}

async fn run_persistent_dispatch(
    shared: Arc<PersistentShared>,
    listener: Arc<dyn PersistentSubscriptionListener>,
    mut rx: mpsc::UnboundedReceiver<SubscriptionNotice>,
    auto_ack: bool,
) {
    let handle = PersistentSubscription {
        shared: Arc::clone(&shared),
    };
    while let Some(notice) = rx.recv().await {
        match notice {
            SubscriptionNotice::Event(event, retry_count) => {
                let event_id = event.original_event().map(|record| record.event_id);
                match listener.on_event(&handle, event, retry_count) {
                    Ok(()) => {
                        if auto_ack && let Some(event_id) = event_id {
                            handle.acknowledge_ids(vec![event_id]);
                        }
                    }
                    Err(error) => {
                        warn!(
                            group = %shared.group,
                            error = %error,
                            "persistent event handler failed"
                        );
                        if auto_ack && let Some(event_id) = event_id {
                            handle.fail_ids(
                                vec![event_id],
                                listener.failure_action(),
                                "handler-exception",
                            );
                        }
                    }
                }
            }
            SubscriptionNotice::Dropped(reason, error) => {
                debug!(group = %shared.group, ?reason, "persistent subscription dropped");
                listener.on_close(&handle, reason, error);
                return;
            }
        }
    }
}
