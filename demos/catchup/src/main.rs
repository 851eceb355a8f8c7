// Demo: spin up an in-process node, pre-fill a stream, then run a catch-up
// subscription through the historical replay into live tailing.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use strom_client::{
    CatchUpSettings, CatchUpSubscription, CatchUpSubscriptionListener, Client, EventData,
    ExpectedVersion, ResolvedEvent, Settings, SubscriptionDropReason,
};
use strom_test_harness::HarnessNode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "catchup-demo")]
#[command(about = "Catch-up subscription demo against an in-process node")]
struct Args {
    /// Stream to subscribe to
    #[arg(long, default_value = "demo-stream")]
    stream: String,

    /// Events appended before the subscription starts
    #[arg(long, default_value = "25")]
    historical: usize,

    /// Events appended while the subscription is live
    #[arg(long, default_value = "5")]
    live: usize,
}

struct PrintingListener;

impl CatchUpSubscriptionListener for PrintingListener {
    fn on_event(
        &self,
        _subscription: &CatchUpSubscription,
        event: ResolvedEvent,
    ) -> anyhow::Result<()> {
        info!(
            number = event.original_event_number(),
            stream = event.original_stream_id(),
            "event"
        );
        Ok(())
    }

    fn on_live_processing_started(&self, _subscription: &CatchUpSubscription) {
        info!("caught up, now live");
    }

    fn on_close(
        &self,
        _subscription: &CatchUpSubscription,
        reason: SubscriptionDropReason,
        _error: Option<anyhow::Error>,
    ) {
        info!(?reason, "subscription closed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let node = HarnessNode::start().await?;
    info!(addr = %node.addr(), "harness node listening");

    let settings = Settings::builder().single_node(node.addr()).build()?;
    let client = Client::new(settings);
    client.connect()?;

    for index in 0..args.historical {
        let event = EventData::json("demo-event", &serde_json::json!({ "index": index }))?;
        client
            .append_to_stream(&args.stream, ExpectedVersion::Any, vec![event])
            .await?;
    }
    info!(count = args.historical, "historical events appended");

    let subscription = client.subscribe_to_stream_from(
        &args.stream,
        None,
        CatchUpSettings::default(),
        Arc::new(PrintingListener),
    )?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    for index in args.historical..args.historical + args.live {
        let event = EventData::json("demo-event", &serde_json::json!({ "index": index }))?;
        client
            .append_to_stream(&args.stream, ExpectedVersion::Any, vec![event])
            .await?;
    }
    info!(count = args.live, "live events appended");

    tokio::time::sleep(Duration::from_millis(500)).await;
    subscription.stop_with_timeout(Duration::from_secs(5)).await?;
    client.close().await;
    Ok(())
}
