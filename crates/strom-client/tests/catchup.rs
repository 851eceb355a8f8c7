// Catch-up subscription behavior: history-then-live hand-off, checkpoint
// resume, reconnect recovery, queue overflow and stop semantics.
mod common;

use std::sync::Arc;
use std::time::Duration;

use strom_client::{
    CatchUpSettings, CatchUpSubscription, CatchUpSubscriptionListener, EventData, ExpectedVersion,
    Position, ResolvedEvent, SubscriptionDropReason,
};
use tokio::sync::mpsc;

use common::{node_and_client, recv_many, recv_one};

fn event(index: usize) -> EventData {
    EventData::json("numbered", &serde_json::json!({ "index": index })).expect("event")
}

struct Recorder {
    events: mpsc::UnboundedSender<i64>,
    positions: mpsc::UnboundedSender<Position>,
    live: mpsc::UnboundedSender<()>,
    closes: mpsc::UnboundedSender<SubscriptionDropReason>,
    handler_delay: Option<Duration>,
}

impl CatchUpSubscriptionListener for Recorder {
    fn on_event(
        &self,
        _subscription: &CatchUpSubscription,
        event: ResolvedEvent,
    ) -> anyhow::Result<()> {
        if let Some(delay) = self.handler_delay {
            std::thread::sleep(delay);
        }
        let _ = self.events.send(event.original_event_number());
        if let Some(position) = event.original_position() {
            let _ = self.positions.send(position);
        }
        Ok(())
    }

    fn on_live_processing_started(&self, _subscription: &CatchUpSubscription) {
        let _ = self.live.send(());
    }

    fn on_close(
        &self,
        _subscription: &CatchUpSubscription,
        reason: SubscriptionDropReason,
        _error: Option<anyhow::Error>,
    ) {
        let _ = self.closes.send(reason);
    }
}

struct Channels {
    events: mpsc::UnboundedReceiver<i64>,
    positions: mpsc::UnboundedReceiver<Position>,
    live: mpsc::UnboundedReceiver<()>,
    closes: mpsc::UnboundedReceiver<SubscriptionDropReason>,
}

fn recorder(handler_delay: Option<Duration>) -> (Arc<Recorder>, Channels) {
    let (events_tx, events) = mpsc::unbounded_channel();
    let (positions_tx, positions) = mpsc::unbounded_channel();
    let (live_tx, live) = mpsc::unbounded_channel();
    let (closes_tx, closes) = mpsc::unbounded_channel();
    (
        Arc::new(Recorder {
            events: events_tx,
            positions: positions_tx,
            live: live_tx,
            closes: closes_tx,
            handler_delay,
        }),
        Channels {
            events,
            positions,
            live,
            closes,
        },
    )
}

fn assert_strictly_increasing(numbers: &[i64]) {
    for window in numbers.windows(2) {
        assert!(
            window[1] > window[0],
            "delivery order violated: {numbers:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn replays_history_then_switches_to_live() {
    let (_node, client) = node_and_client().await;
    for index in 0..5 {
        client
            .append_to_stream("cu-1", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }

    let (listener, mut channels) = recorder(None);
    let subscription = client
        .subscribe_to_stream_from("cu-1", None, CatchUpSettings::default(), listener)
        .expect("subscribe from");

    let history = recv_many(&mut channels.events, 5).await;
    assert_eq!(history, vec![0, 1, 2, 3, 4]);
    recv_one(&mut channels.live).await;

    for index in 5..8 {
        client
            .append_to_stream("cu-1", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }
    let live = recv_many(&mut channels.events, 3).await;
    assert_eq!(live, vec![5, 6, 7]);
    assert_eq!(subscription.last_processed_event_number(), Some(7));
}

#[tokio::test(flavor = "multi_thread")]
async fn checkpoint_resume_skips_already_processed_events() {
    let (_node, client) = node_and_client().await;
    for index in 0..5 {
        client
            .append_to_stream("cu-2", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }

    let (listener, mut channels) = recorder(None);
    let _subscription = client
        .subscribe_to_stream_from("cu-2", Some(1), CatchUpSettings::default(), listener)
        .expect("subscribe from");

    let delivered = recv_many(&mut channels.events, 3).await;
    assert_eq!(delivered, vec![2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn recovers_across_a_server_disconnect_without_gaps_or_duplicates() {
    let (node, client) = node_and_client().await;
    for index in 0..3 {
        client
            .append_to_stream("cu-3", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }

    let (listener, mut channels) = recorder(None);
    let _subscription = client
        .subscribe_to_stream_from("cu-3", None, CatchUpSettings::default(), listener)
        .expect("subscribe from");
    let mut delivered = recv_many(&mut channels.events, 3).await;
    recv_one(&mut channels.live).await;

    node.drop_connections();

    for index in 3..6 {
        client
            .append_to_stream("cu-3", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }
    delivered.extend(recv_many(&mut channels.events, 3).await);
    assert_eq!(delivered, vec![0, 1, 2, 3, 4, 5]);
    assert_strictly_increasing(&delivered);
}

#[tokio::test(flavor = "multi_thread")]
async fn all_streams_catch_up_delivers_in_position_order() {
    let (node, client) = node_and_client().await;
    client
        .append_to_stream("cu-4a", ExpectedVersion::Any, vec![event(0), event(1)])
        .await
        .expect("append");
    client
        .append_to_stream("cu-4b", ExpectedVersion::Any, vec![event(0)])
        .await
        .expect("append");

    let (listener, mut channels) = recorder(None);
    let _subscription = client
        .subscribe_to_all_from(None, CatchUpSettings::default(), listener)
        .expect("subscribe from all");

    recv_many(&mut channels.events, 3).await;
    recv_one(&mut channels.live).await;
    client
        .append_to_stream("cu-4a", ExpectedVersion::Any, vec![event(2)])
        .await
        .expect("append");
    recv_one(&mut channels.events).await;

    let collected = recv_many(&mut channels.positions, 4).await;
    let mut sorted = collected.clone();
    sorted.sort();
    assert_eq!(collected, sorted);
    assert_eq!(node.all_len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn push_queue_overflow_drops_the_subscription() {
    let (_node, client) = node_and_client().await;

    let (listener, mut channels) = recorder(Some(Duration::from_millis(500)));
    let settings = CatchUpSettings {
        max_push_queue_size: 1,
        ..CatchUpSettings::default()
    };
    let _subscription = client
        .subscribe_to_stream_from("cu-5", None, settings, listener)
        .expect("subscribe from");
    recv_one(&mut channels.live).await;

    for index in 0..5 {
        client
            .append_to_stream("cu-5", ExpectedVersion::Any, vec![event(index)])
            .await
            .expect("append");
    }

    let reason = recv_one(&mut channels.closes).await;
    assert_eq!(reason, SubscriptionDropReason::ProcessingQueueOverflow);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_fires_user_initiated_close_and_releases_the_latch() {
    let (_node, client) = node_and_client().await;

    let (listener, mut channels) = recorder(None);
    let subscription = client
        .subscribe_to_stream_from("cu-6", None, CatchUpSettings::default(), listener)
        .expect("subscribe from");
    recv_one(&mut channels.live).await;

    subscription
        .stop_with_timeout(Duration::from_secs(5))
        .await
        .expect("stop");
    let reason = recv_one(&mut channels.closes).await;
    assert_eq!(reason, SubscriptionDropReason::UserInitiated);
    common::expect_silence(&mut channels.closes).await;
}
