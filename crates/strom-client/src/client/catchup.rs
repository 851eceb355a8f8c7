//! Catch-up subscription: a bounded historical read loop, a volatile
//! subscribe, a second read up to the confirmation point, then live tailing
//! from a push queue. A position filter makes the hand-off exactly-once, and
//! a reconnection hook restarts the whole sequence from the last delivered
//! event.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::client::Client;
use crate::client::driver::ClientEvent;
use crate::client::subscriptions::{Subscription, SubscriptionListener};
use crate::error::{OperationError, SubscriptionDropReason};
use crate::types::{Position, ResolvedEvent, SliceReadStatus};

/// Tuning for a catch-up subscription.
#[derive(Debug, Clone)]
pub struct CatchUpSettings {
    pub resolve_link_tos: bool,
    /// Events per historical read; must stay below the server read ceiling.
    pub read_batch_size: i32,
    /// Bound of the live push queue; overflowing drops the subscription.
    pub max_push_queue_size: usize,
}

impl Default for CatchUpSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            read_batch_size: 500,
            max_push_queue_size: 10_000,
        }
    }
}

/// Callbacks for a catch-up subscription. Invocations are strictly
/// serialized, in order, without duplicates.
pub trait CatchUpSubscriptionListener: Send + Sync + 'static {
    fn on_event(
        &self,
        subscription: &CatchUpSubscription,
        event: ResolvedEvent,
    ) -> anyhow::Result<()>;

    /// Fired once the historical phase has caught up and pushed events flow
    /// directly.
    fn on_live_processing_started(&self, subscription: &CatchUpSubscription) {
        let _ = subscription;
    }

    fn on_close(
        &self,
        subscription: &CatchUpSubscription,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        let _ = (subscription, reason, error);
    }
}

/// Where the subscription starts and what it has delivered so far.
pub(crate) enum TrackedPosition {
    Stream(Option<i64>),
    All(Option<Position>),
}

enum LiveItem {
    Event(ResolvedEvent),
    /// Sentinel enqueued by drops, overflow and stop.
    Drop,
}

struct DropData {
    reason: SubscriptionDropReason,
    error: Option<anyhow::Error>,
}

enum RunError {
    Read(OperationError),
    Handler(anyhow::Error),
}

pub(crate) struct CatchUpState {
    client: Client,
    stream: String,
    settings: CatchUpSettings,
    listener: Arc<dyn CatchUpSubscriptionListener>,
    live_queue: Mutex<VecDeque<LiveItem>>,
    is_processing: AtomicBool,
    allow_processing: AtomicBool,
    should_stop: AtomicBool,
    is_dropped: AtomicBool,
    drop_data: Mutex<Option<DropData>>,
    tracked: Mutex<TrackedPosition>,
    subscription: Mutex<Option<Subscription>>,
    stopped: watch::Sender<bool>,
    hook: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running catch-up subscription.
#[derive(Clone)]
pub struct CatchUpSubscription {
    state: Arc<CatchUpState>,
}

impl CatchUpSubscription {
    /// The subscribed stream; empty for the all-streams log.
    pub fn stream_id(&self) -> &str {
        &self.state.stream
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.state.stream.is_empty()
    }

    /// Number of the last event handed to the listener (stream mode).
    pub fn last_processed_event_number(&self) -> Option<i64> {
        match *self.state.tracked.lock().unwrap() {
            TrackedPosition::Stream(last) => last,
            TrackedPosition::All(_) => None,
        }
    }

    /// Position of the last event handed to the listener (all-streams mode).
    pub fn last_processed_position(&self) -> Option<Position> {
        match *self.state.tracked.lock().unwrap() {
            TrackedPosition::All(last) => last,
            TrackedPosition::Stream(_) => None,
        }
    }

    /// Request a stop. The close callback fires with `UserInitiated` once the
    /// in-flight work winds down.
    pub fn stop(&self) {
        debug!(stream = %display_stream(&self.state.stream), "catch-up stop requested");
        CatchUpState::detach_hook(&self.state);
        self.state.should_stop.store(true, Ordering::SeqCst);
        CatchUpState::enqueue_drop_notification(
            &self.state,
            SubscriptionDropReason::UserInitiated,
            None,
        );
    }

    /// Stop and wait for the close callback to complete.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<(), OperationError> {
        self.stop();
        let mut stopped = self.state.stopped.subscribe();
        tokio::time::timeout(timeout, stopped.wait_for(|stopped| *stopped))
            .await
            .map_err(|_| OperationError::OperationTimedOut {
                operation: "StopCatchUpSubscription",
            })?
            .map_err(|_| OperationError::ConnectionClosed)?;
        Ok(())
    }
}

pub(crate) fn start(
    client: Client,
    stream: String,
    from: TrackedPosition,
    settings: CatchUpSettings,
    listener: Arc<dyn CatchUpSubscriptionListener>,
) -> CatchUpSubscription {
    let (stopped, _) = watch::channel(false);
    let state = Arc::new(CatchUpState {
        client,
        stream,
        settings,
        listener,
        live_queue: Mutex::new(VecDeque::new()),
        is_processing: AtomicBool::new(false),
        allow_processing: AtomicBool::new(false),
        should_stop: AtomicBool::new(false),
        is_dropped: AtomicBool::new(false),
        drop_data: Mutex::new(None),
        tracked: Mutex::new(from),
        subscription: Mutex::new(None),
        stopped,
        hook: Mutex::new(None),
    });
    debug!(stream = %display_stream(&state.stream), "catch-up subscription starting");
    CatchUpState::run(Arc::clone(&state));
    CatchUpSubscription { state }
}

impl CatchUpState {
    fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    /// One full pass: historical read, subscribe, gap read, then live mode.
    /// Also the recovery entry point after a reconnect.
    fn run(state: Arc<Self>) {
        tokio::spawn(async move {
            state.stopped.send_replace(false);
            // Processing stays paused until this pass reaches the live phase
            // again; the queue keeps absorbing pushes meanwhile.
            state.allow_processing.store(false, Ordering::SeqCst);
            let stale = state.subscription.lock().unwrap().take();
            if let Some(stale) = stale {
                stale.unsubscribe();
            }

            if let Err(error) = Self::run_phases(&state).await {
                let (reason, error) = match error {
                    RunError::Read(error) => (
                        SubscriptionDropReason::CatchUpError,
                        anyhow::Error::new(error),
                    ),
                    RunError::Handler(error) => {
                        (SubscriptionDropReason::EventHandlerException, error)
                    }
                };
                Self::drop_subscription(&state, reason, Some(error));
                return;
            }

            if state.should_stop() {
                Self::drop_subscription(&state, SubscriptionDropReason::UserInitiated, None);
                return;
            }

            debug!(
                stream = %display_stream(&state.stream),
                "catch-up subscription switching to live"
            );
            let handle = CatchUpSubscription {
                state: Arc::clone(&state),
            };
            state.listener.on_live_processing_started(&handle);
            Self::attach_hook(&state);
            state.allow_processing.store(true, Ordering::SeqCst);
            Self::ensure_processing(&state);
        });
    }

    async fn run_phases(state: &Arc<Self>) -> Result<(), RunError> {
        if !state.should_stop() {
            trace!(stream = %display_stream(&state.stream), "catch-up pulling history");
            Self::read_events_till(state, None, None).await?;
        }
        if !state.should_stop() {
            trace!(stream = %display_stream(&state.stream), "catch-up subscribing");
            let forwarder = Arc::new(LiveForwarder {
                state: Arc::downgrade(state),
            });
            let subscription = if state.stream.is_empty() {
                state
                    .client
                    .subscribe_to_all(state.settings.resolve_link_tos, forwarder)
                    .await
            } else {
                state
                    .client
                    .subscribe_to_stream(&state.stream, state.settings.resolve_link_tos, forwarder)
                    .await
            }
            .map_err(RunError::Read)?;

            let till_event = subscription.last_event_number();
            let till_position = Some(subscription.last_commit_position());
            *state.subscription.lock().unwrap() = Some(subscription);

            // Pick up whatever was appended between the first read and the
            // subscription confirmation.
            trace!(stream = %display_stream(&state.stream), "catch-up pulling remaining history");
            Self::read_events_till(state, till_event, till_position).await?;
        }
        Ok(())
    }

    async fn read_events_till(
        state: &Arc<Self>,
        till_event: Option<i64>,
        till_position: Option<i64>,
    ) -> Result<(), RunError> {
        let is_all = state.stream.is_empty();
        if is_all {
            Self::read_all_till(state, till_position.map(|commit| Position::new(commit, commit)))
                .await
        } else {
            Self::read_stream_till(state, till_event).await
        }
    }

    async fn read_stream_till(state: &Arc<Self>, till: Option<i64>) -> Result<(), RunError> {
        let mut next_read = match &*state.tracked.lock().unwrap() {
            TrackedPosition::Stream(last) => last.map(|last| last + 1).unwrap_or(0),
            TrackedPosition::All(_) => unreachable!("stream read in all mode"),
        };
        loop {
            if state.should_stop() {
                return Ok(());
            }
            let slice = state
                .client
                .read_stream_events_forward(
                    &state.stream,
                    next_read,
                    state.settings.read_batch_size,
                    state.settings.resolve_link_tos,
                )
                .await
                .map_err(RunError::Read)?;
            let mut reached_end = false;
            let done = match slice.status {
                SliceReadStatus::Success => {
                    reached_end = slice.is_end_of_stream;
                    let next = slice.next_event_number;
                    for event in slice.events {
                        Self::try_process(state, event).map_err(RunError::Handler)?;
                    }
                    next_read = next;
                    match till {
                        Some(till) => next > till,
                        None => reached_end,
                    }
                }
                SliceReadStatus::StreamNotFound => {
                    if let Some(till) = till
                        && till != -1
                    {
                        return Err(RunError::Read(OperationError::ServerError(format!(
                            "stream {} disappeared during catch-up",
                            state.stream
                        ))));
                    }
                    true
                }
                SliceReadStatus::StreamDeleted => {
                    return Err(RunError::Read(OperationError::StreamDeleted(
                        state.stream.clone(),
                    )));
                }
            };
            if done {
                return Ok(());
            }
            if reached_end {
                // The write that moves the stream past `till` has not landed
                // yet; give the server a moment.
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    async fn read_all_till(state: &Arc<Self>, till: Option<Position>) -> Result<(), RunError> {
        let mut next_read = match &*state.tracked.lock().unwrap() {
            TrackedPosition::All(last) => last.unwrap_or(Position::START),
            TrackedPosition::Stream(_) => unreachable!("all read in stream mode"),
        };
        loop {
            if state.should_stop() {
                return Ok(());
            }
            let slice = state
                .client
                .read_all_events_forward(
                    next_read,
                    state.settings.read_batch_size,
                    state.settings.resolve_link_tos,
                )
                .await
                .map_err(RunError::Read)?;
            let end_of_stream = slice.is_end_of_stream();
            for event in slice.events {
                Self::try_process(state, event).map_err(RunError::Handler)?;
            }
            next_read = slice.next_position;
            let done = match till {
                Some(till) => slice.next_position > till,
                None => end_of_stream,
            };
            if done {
                return Ok(());
            }
            if end_of_stream {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
    }

    /// Deliver an event unless it is at or before the last delivered
    /// position; the filter is what makes the read/live hand-off exactly
    /// once.
    fn try_process(state: &Arc<Self>, event: ResolvedEvent) -> anyhow::Result<()> {
        let deliver = {
            let tracked = state.tracked.lock().unwrap();
            match &*tracked {
                TrackedPosition::Stream(last) => {
                    last.is_none_or(|last| event.original_event_number() > last)
                }
                TrackedPosition::All(last) => match event.original_position() {
                    Some(position) => last.is_none_or(|last| position > last),
                    None => false,
                },
            }
        };
        if !deliver {
            trace!(
                stream = %display_stream(&state.stream),
                number = event.original_event_number(),
                "skipping already processed event"
            );
            return Ok(());
        }
        let number = event.original_event_number();
        let position = event.original_position();
        let handle = CatchUpSubscription {
            state: Arc::clone(state),
        };
        state.listener.on_event(&handle, event)?;
        let mut tracked = state.tracked.lock().unwrap();
        match &mut *tracked {
            TrackedPosition::Stream(last) => *last = Some(number),
            TrackedPosition::All(last) => *last = position.or(*last),
        }
        Ok(())
    }

    fn enqueue_live(state: &Arc<Self>, event: ResolvedEvent) {
        let overflowed = {
            let mut queue = state.live_queue.lock().unwrap();
            if queue.len() >= state.settings.max_push_queue_size {
                true
            } else {
                queue.push_back(LiveItem::Event(event));
                false
            }
        };
        if overflowed {
            warn!(
                stream = %display_stream(&state.stream),
                "live push queue overflowed"
            );
            Self::enqueue_drop_notification(
                state,
                SubscriptionDropReason::ProcessingQueueOverflow,
                None,
            );
            if let Some(subscription) = state.subscription.lock().unwrap().as_ref() {
                subscription.unsubscribe();
            }
            return;
        }
        if state.allow_processing.load(Ordering::SeqCst) {
            Self::ensure_processing(state);
        }
    }

    /// Record the drop at most once and park the sentinel on the queue so it
    /// is observed in order.
    fn enqueue_drop_notification(
        state: &Arc<Self>,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        {
            let mut slot = state.drop_data.lock().unwrap();
            if slot.is_some() {
                return;
            }
            *slot = Some(DropData { reason, error });
        }
        state.live_queue.lock().unwrap().push_back(LiveItem::Drop);
        if state.allow_processing.load(Ordering::SeqCst) {
            Self::ensure_processing(state);
        }
    }

    fn ensure_processing(state: &Arc<Self>) {
        if state
            .is_processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let state = Arc::clone(state);
            tokio::spawn(async move { Self::process_live_queue(state) });
        }
    }

    /// Single-writer drain. After emptying the queue the processor clears its
    /// flag and re-checks: an enqueue that slipped in between is picked up
    /// here, while an enqueuer that saw the flag already cleared starts the
    /// next drain itself.
    fn process_live_queue(state: Arc<Self>) {
        loop {
            loop {
                let item = state.live_queue.lock().unwrap().pop_front();
                let Some(item) = item else { break };
                match item {
                    LiveItem::Drop => {
                        let data = state.drop_data.lock().unwrap().take().unwrap_or(DropData {
                            reason: SubscriptionDropReason::ServerError,
                            error: Some(anyhow::anyhow!("drop reason not specified")),
                        });
                        Self::drop_subscription(&state, data.reason, data.error);
                        let _ = state.is_processing.compare_exchange(
                            true,
                            false,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        );
                        return;
                    }
                    LiveItem::Event(event) => {
                        if let Err(error) = Self::try_process(&state, event) {
                            Self::drop_subscription(
                                &state,
                                SubscriptionDropReason::EventHandlerException,
                                Some(error),
                            );
                            let _ = state.is_processing.compare_exchange(
                                true,
                                false,
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                            );
                            return;
                        }
                    }
                }
            }
            let _ = state.is_processing.compare_exchange(
                true,
                false,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if state.live_queue.lock().unwrap().is_empty() {
                return;
            }
            if state
                .is_processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
        }
    }

    fn attach_hook(state: &Arc<Self>) {
        let mut events = state.client.events();
        let weak: Weak<Self> = Arc::downgrade(state);
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Connected(_)) => {
                        let Some(state) = weak.upgrade() else { return };
                        debug!(
                            stream = %display_stream(&state.stream),
                            "catch-up subscription recovering after reconnection"
                        );
                        *state.hook.lock().unwrap() = None;
                        Self::run(state);
                        return;
                    }
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        *state.hook.lock().unwrap() = Some(handle);
    }

    fn detach_hook(state: &Arc<Self>) {
        if let Some(hook) = state.hook.lock().unwrap().take() {
            hook.abort();
        }
    }

    fn drop_subscription(
        state: &Arc<Self>,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        if state
            .is_dropped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!(
            stream = %display_stream(&state.stream),
            ?reason,
            "catch-up subscription dropped"
        );
        Self::detach_hook(state);
        if let Some(subscription) = state.subscription.lock().unwrap().take() {
            subscription.unsubscribe();
        }
        let handle = CatchUpSubscription {
            state: Arc::clone(state),
        };
        state.listener.on_close(&handle, reason, error);
        state.stopped.send_replace(true);
    }
}

/// Bridges the underlying volatile subscription into the live queue. Holds
/// only a weak reference so a forgotten catch-up can be reclaimed.
struct LiveForwarder {
    state: Weak<CatchUpState>,
}

impl SubscriptionListener for LiveForwarder {
    fn on_event(&self, _subscription: &Subscription, event: ResolvedEvent) -> anyhow::Result<()> {
        if let Some(state) = self.state.upgrade() {
            CatchUpState::enqueue_live(&state, event);
        }
        Ok(())
    }

    fn on_close(
        &self,
        subscription: &Subscription,
        reason: SubscriptionDropReason,
        error: Option<anyhow::Error>,
    ) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        // A restart disposes the previous live subscription; its close must
        // not tear down the catch-up that replaced it.
        let is_current = state
            .subscription
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|current| current.id() == subscription.id());
        if !is_current {
            trace!(
                stream = %display_stream(&state.stream),
                ?reason,
                "ignoring close of a superseded live subscription"
            );
            return;
        }
        CatchUpState::enqueue_drop_notification(&state, reason, error);
    }
}

fn display_stream(stream: &str) -> &str {
    if stream.is_empty() { "<all>" } else { stream }
}
