//! Async client for an append-only event-store server speaking a framed
//! binary protocol over TCP (optionally TLS).
//!
//! The client hides connection lifecycle, endpoint discovery,
//! authentication, heartbeating, retries and reconnection, and delivers
//! live or catch-up event streams to subscription listeners.
//!
//! ```no_run
//! use std::sync::Arc;
//! use strom_client::{Client, EventData, ExpectedVersion, Settings};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::builder()
//!         .single_node("127.0.0.1:1113".parse()?)
//!         .build()?;
//!     let client = Client::new(settings);
//!     client.connect()?;
//!
//!     let event = EventData::json("order-placed", &serde_json::json!({"qty": 1}))?;
//!     client
//!         .append_to_stream("orders-1", ExpectedVersion::NoStream, vec![event])
//!         .await?;
//!     let slice = client
//!         .read_stream_events_forward("orders-1", 0, 100, false)
//!         .await?;
//!     assert_eq!(slice.events.len(), 1);
//!     Ok(())
//! }
//! ```
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metadata;
pub mod types;

pub use client::catchup::{CatchUpSettings, CatchUpSubscription, CatchUpSubscriptionListener};
pub use client::client::Client;
pub use client::driver::ClientEvent;
pub use client::persistent::{
    ConsumerStrategy, NakAction, PersistentSubscription, PersistentSubscriptionListener,
    PersistentSubscriptionSettings,
};
pub use client::subscriptions::{Subscription, SubscriptionListener};
pub use client::transaction::Transaction;
pub use config::{NodeSettings, Settings, SettingsBuilder};
pub use error::{BuildError, OperationError, SubscriptionDropReason};
pub use metadata::{StreamAcl, StreamMetadata, StreamMetadataResult};
pub use types::{
    AllEventsSlice, DeleteResult, EventData, EventReadResult, EventReadStatus, ExpectedVersion,
    Position, ReadDirection, RecordedEvent, ResolvedEvent, SliceReadStatus, StreamEventsSlice,
    WriteResult,
};

pub use strom_transport::TlsMode;
pub use strom_wire::Credentials;
pub use strom_wire::MAX_READ_SIZE;
