//! Public facade: validates synchronously, builds an operation with its
//! completion sink, hands it to the driver and awaits the result.
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use strom_wire::{Credentials, MAX_READ_SIZE};

use crate::client::catchup::{
    self, CatchUpSettings, CatchUpSubscription, CatchUpSubscriptionListener, TrackedPosition,
};
use crate::client::driver::{ClientEvent, DriverCommand, spawn_driver};
use crate::client::ops::{
    AppendToStream, ClientOperation, CreatePersistentOp, DeletePersistentOp, DeleteStreamOp,
    ReadAllOp, ReadEventOp, ReadStreamOp, ResponseSender, StartTransactionOp, TransactionCommitOp,
    TransactionWriteOp, UpdatePersistentOp,
};
use crate::client::persistent::{
    PersistentSubscription, PersistentSubscriptionListener, PersistentSubscriptionSettings,
    StartPersistent,
};
use crate::client::subscriptions::{StartSubscription, Subscription, SubscriptionListener};
use crate::client::transaction::Transaction;
use crate::config::Settings;
use crate::error::OperationError;
use crate::metadata::{
    METADATA_EVENT_TYPE, StreamMetadata, StreamMetadataResult, metadata_stream_of,
};
use crate::types::{
    AllEventsSlice, DeleteResult, EventData, EventReadResult, EventReadStatus, ExpectedVersion,
    Position, ReadDirection, StreamEventsSlice, WriteResult,
};

struct ClientInner {
    settings: Settings,
    tx: mpsc::UnboundedSender<DriverCommand>,
    events: broadcast::Sender<ClientEvent>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let _ = self.tx.send(DriverCommand::Close { done: None });
    }
}

/// Event-store client. Cheap to clone; all clones share one connection,
/// operation registry and subscription registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    credentials: Option<Credentials>,
}

impl Client {
    /// Create a client from validated settings. No connection is attempted
    /// until [`Client::connect`].
    pub fn new(settings: Settings) -> Self {
        let (events, _) = broadcast::channel(64);
        let tx = spawn_driver(settings.clone(), events.clone());
        Self {
            inner: Arc::new(ClientInner {
                settings,
                tx,
                events,
            }),
            credentials: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// A handle whose operations authenticate with these credentials instead
    /// of the configured defaults.
    pub fn with_credentials(&self, credentials: Credentials) -> Client {
        Client {
            inner: Arc::clone(&self.inner),
            credentials: Some(credentials),
        }
    }

    /// Subscribe to connection lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Start the discovery/connect sequence in the background. Operations
    /// issued before the connection is up queue until it is.
    pub fn connect(&self) -> Result<(), OperationError> {
        self.send(DriverCommand::Connect)
    }

    /// Close the connection: pending operations fail with
    /// `ConnectionClosed` and subscriptions drop with the same reason.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(DriverCommand::Close { done: Some(done) }).is_ok() {
            let _ = wait.await;
        }
    }

    pub async fn append_to_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    ) -> Result<WriteResult, OperationError> {
        validate_stream_name(stream)?;
        let (result, wait) = oneshot::channel();
        let operation = AppendToStream {
            stream: stream.to_string(),
            expected_version: validate_expected_version(expected_version)?,
            events: events.into_iter().map(EventData::into_wire).collect(),
            require_master: self.inner.settings.require_master,
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    pub async fn delete_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        hard_delete: bool,
    ) -> Result<DeleteResult, OperationError> {
        validate_stream_name(stream)?;
        let (result, wait) = oneshot::channel();
        let operation = DeleteStreamOp {
            stream: stream.to_string(),
            expected_version: validate_expected_version(expected_version)?,
            hard_delete,
            require_master: self.inner.settings.require_master,
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    pub async fn start_transaction(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
    ) -> Result<Transaction, OperationError> {
        validate_stream_name(stream)?;
        let (result, wait) = oneshot::channel();
        let operation = StartTransactionOp {
            stream: stream.to_string(),
            expected_version: validate_expected_version(expected_version)?,
            require_master: self.inner.settings.require_master,
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        let transaction_id = self.run(Box::new(operation), wait).await?;
        Ok(Transaction::new(transaction_id, self.clone()))
    }

    /// Re-attach to a transaction started elsewhere (or earlier) by id.
    pub fn continue_transaction(&self, transaction_id: u64) -> Transaction {
        Transaction::new(transaction_id, self.clone())
    }

    pub(crate) async fn transaction_write(
        &self,
        transaction_id: u64,
        events: Vec<EventData>,
    ) -> Result<(), OperationError> {
        let (result, wait) = oneshot::channel();
        let operation = TransactionWriteOp {
            transaction_id,
            events: events.into_iter().map(EventData::into_wire).collect(),
            require_master: self.inner.settings.require_master,
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    pub(crate) async fn transaction_commit(
        &self,
        transaction_id: u64,
    ) -> Result<WriteResult, OperationError> {
        let (result, wait) = oneshot::channel();
        let operation = TransactionCommitOp {
            transaction_id,
            require_master: self.inner.settings.require_master,
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    /// Read one event; -1 addresses the last event of the stream.
    pub async fn read_event(
        &self,
        stream: &str,
        event_number: i64,
        resolve_link_tos: bool,
    ) -> Result<EventReadResult, OperationError> {
        validate_stream_name(stream)?;
        if event_number < -1 {
            return Err(OperationError::InvalidArgument(
                "event number is out of range".to_string(),
            ));
        }
        let (result, wait) = oneshot::channel();
        let operation = ReadEventOp {
            stream: stream.to_string(),
            event_number,
            resolve_link_tos,
            require_master: self.inner.settings.require_master,
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    pub async fn read_stream_events_forward(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: i32,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice, OperationError> {
        validate_stream_name(stream)?;
        if from_event_number < 0 {
            return Err(OperationError::InvalidArgument(
                "from event number must not be negative".to_string(),
            ));
        }
        validate_read_count(max_count)?;
        self.read_stream(
            stream,
            from_event_number,
            max_count,
            resolve_link_tos,
            ReadDirection::Forward,
        )
        .await
    }

    /// Read backwards; -1 starts from the end of the stream.
    pub async fn read_stream_events_backward(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: i32,
        resolve_link_tos: bool,
    ) -> Result<StreamEventsSlice, OperationError> {
        validate_stream_name(stream)?;
        if from_event_number < -1 {
            return Err(OperationError::InvalidArgument(
                "from event number is out of range".to_string(),
            ));
        }
        validate_read_count(max_count)?;
        self.read_stream(
            stream,
            from_event_number,
            max_count,
            resolve_link_tos,
            ReadDirection::Backward,
        )
        .await
    }

    async fn read_stream(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: i32,
        resolve_link_tos: bool,
        direction: ReadDirection,
    ) -> Result<StreamEventsSlice, OperationError> {
        let (result, wait) = oneshot::channel();
        let operation = ReadStreamOp {
            stream: stream.to_string(),
            from_event_number,
            max_count,
            resolve_link_tos,
            direction,
            require_master: self.inner.settings.require_master,
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    pub async fn read_all_events_forward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice, OperationError> {
        validate_read_count(max_count)?;
        self.read_all(position, max_count, resolve_link_tos, ReadDirection::Forward)
            .await
    }

    pub async fn read_all_events_backward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
    ) -> Result<AllEventsSlice, OperationError> {
        validate_read_count(max_count)?;
        self.read_all(
            position,
            max_count,
            resolve_link_tos,
            ReadDirection::Backward,
        )
        .await
    }

    async fn read_all(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
        direction: ReadDirection,
    ) -> Result<AllEventsSlice, OperationError> {
        let (result, wait) = oneshot::channel();
        let operation = ReadAllOp {
            position,
            max_count,
            resolve_link_tos,
            direction,
            require_master: self.inner.settings.require_master,
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    /// Live tail of one stream; no historical replay.
    pub async fn subscribe_to_stream(
        &self,
        stream: &str,
        resolve_link_tos: bool,
        listener: Arc<dyn SubscriptionListener>,
    ) -> Result<Subscription, OperationError> {
        validate_stream_name(stream)?;
        self.subscribe(stream.to_string(), resolve_link_tos, listener)
            .await
    }

    /// Live tail of the all-streams log.
    pub async fn subscribe_to_all(
        &self,
        resolve_link_tos: bool,
        listener: Arc<dyn SubscriptionListener>,
    ) -> Result<Subscription, OperationError> {
        self.subscribe(String::new(), resolve_link_tos, listener)
            .await
    }

    async fn subscribe(
        &self,
        stream: String,
        resolve_link_tos: bool,
        listener: Arc<dyn SubscriptionListener>,
    ) -> Result<Subscription, OperationError> {
        let (result, wait) = oneshot::channel();
        let request = StartSubscription {
            stream,
            resolve_link_tos,
            credentials: self.credentials.clone(),
            listener,
            result,
        };
        self.send(DriverCommand::StartSubscription(request))?;
        wait.await.map_err(|_| OperationError::ConnectionClosed)?
    }

    /// Catch-up subscription on a stream. `from` is the number of the last
    /// event already handled; `None` starts from the very beginning.
    pub fn subscribe_to_stream_from(
        &self,
        stream: &str,
        from: Option<i64>,
        settings: CatchUpSettings,
        listener: Arc<dyn CatchUpSubscriptionListener>,
    ) -> Result<CatchUpSubscription, OperationError> {
        validate_stream_name(stream)?;
        if let Some(from) = from
            && from < 0
        {
            return Err(OperationError::InvalidArgument(
                "from event number must not be negative".to_string(),
            ));
        }
        validate_catch_up_settings(&settings)?;
        Ok(catchup::start(
            self.clone(),
            stream.to_string(),
            TrackedPosition::Stream(from),
            settings,
            listener,
        ))
    }

    /// Catch-up subscription on the all-streams log. `from` is the position
    /// of the last event already handled; `None` starts from the very
    /// beginning.
    pub fn subscribe_to_all_from(
        &self,
        from: Option<Position>,
        settings: CatchUpSettings,
        listener: Arc<dyn CatchUpSubscriptionListener>,
    ) -> Result<CatchUpSubscription, OperationError> {
        validate_catch_up_settings(&settings)?;
        Ok(catchup::start(
            self.clone(),
            String::new(),
            TrackedPosition::All(from),
            settings,
            listener,
        ))
    }

    pub async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
    ) -> Result<(), OperationError> {
        validate_stream_name(stream)?;
        validate_group_name(group)?;
        let (result, wait) = oneshot::channel();
        let operation = CreatePersistentOp {
            params: settings.to_wire(stream, group),
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    pub async fn update_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
    ) -> Result<(), OperationError> {
        validate_stream_name(stream)?;
        validate_group_name(group)?;
        let (result, wait) = oneshot::channel();
        let operation = UpdatePersistentOp {
            params: settings.to_wire(stream, group),
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    pub async fn delete_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<(), OperationError> {
        validate_stream_name(stream)?;
        validate_group_name(group)?;
        let (result, wait) = oneshot::channel();
        let operation = DeletePersistentOp {
            stream: stream.to_string(),
            group: group.to_string(),
            credentials: self.credentials.clone(),
            result: ResponseSender::new(result),
        };
        self.run(Box::new(operation), wait).await
    }

    /// Join a persistent subscription group with the configured buffer size
    /// and auto-ack behavior.
    pub async fn connect_to_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        listener: Arc<dyn PersistentSubscriptionListener>,
    ) -> Result<PersistentSubscription, OperationError> {
        let buffer_size = self.inner.settings.persistent_subscription_buffer_size;
        let auto_ack = self.inner.settings.persistent_subscription_auto_ack;
        self.connect_to_persistent_subscription_with(stream, group, buffer_size, auto_ack, listener)
            .await
    }

    pub async fn connect_to_persistent_subscription_with(
        &self,
        stream: &str,
        group: &str,
        buffer_size: i32,
        auto_ack: bool,
        listener: Arc<dyn PersistentSubscriptionListener>,
    ) -> Result<PersistentSubscription, OperationError> {
        validate_stream_name(stream)?;
        validate_group_name(group)?;
        if buffer_size <= 0 {
            return Err(OperationError::InvalidArgument(
                "buffer size should be positive".to_string(),
            ));
        }
        let (result, wait) = oneshot::channel();
        let request = StartPersistent {
            stream: stream.to_string(),
            group: group.to_string(),
            buffer_size,
            auto_ack,
            credentials: self.credentials.clone(),
            listener,
            result,
        };
        self.send(DriverCommand::StartPersistent(request))?;
        wait.await.map_err(|_| OperationError::ConnectionClosed)?
    }

    pub async fn set_stream_metadata(
        &self,
        stream: &str,
        expected_metastream_version: ExpectedVersion,
        metadata: StreamMetadata,
    ) -> Result<WriteResult, OperationError> {
        validate_metadata_target(stream)?;
        let payload = serde_json::to_vec(&metadata).map_err(|err| {
            OperationError::InvalidArgument(format!("metadata serialization failed: {err}"))
        })?;
        let event = EventData {
            event_id: Uuid::new_v4(),
            event_type: METADATA_EVENT_TYPE.to_string(),
            is_json: true,
            data: payload.into(),
            metadata: bytes::Bytes::new(),
        };
        self.append_to_stream(
            &metadata_stream_of(stream),
            expected_metastream_version,
            vec![event],
        )
        .await
    }

    pub async fn get_stream_metadata(
        &self,
        stream: &str,
    ) -> Result<StreamMetadataResult, OperationError> {
        validate_metadata_target(stream)?;
        let read = self
            .read_event(&metadata_stream_of(stream), -1, false)
            .await?;
        match read.status {
            EventReadStatus::Success => {
                let record = read
                    .event
                    .as_ref()
                    .and_then(|resolved| resolved.event.as_ref());
                let Some(record) = record else {
                    return Ok(empty_metadata(stream, false));
                };
                let metadata: StreamMetadata =
                    serde_json::from_slice(&record.data).map_err(|err| {
                        OperationError::ServerError(format!("malformed stream metadata: {err}"))
                    })?;
                Ok(StreamMetadataResult {
                    stream: stream.to_string(),
                    is_stream_deleted: false,
                    meta_stream_version: record.event_number,
                    metadata,
                })
            }
            EventReadStatus::NotFound | EventReadStatus::NoStream => {
                Ok(empty_metadata(stream, false))
            }
            EventReadStatus::StreamDeleted => Ok(empty_metadata(stream, true)),
        }
    }

    async fn run<T>(
        &self,
        operation: Box<dyn ClientOperation>,
        wait: oneshot::Receiver<Result<T, OperationError>>,
    ) -> Result<T, OperationError> {
        self.send(DriverCommand::StartOperation(operation))?;
        wait.await.map_err(|_| OperationError::ConnectionClosed)?
    }

    fn send(&self, command: DriverCommand) -> Result<(), OperationError> {
        self.inner
            .tx
            .send(command)
            .map_err(|_| OperationError::ConnectionClosed)
    }
}

fn empty_metadata(stream: &str, deleted: bool) -> StreamMetadataResult {
    StreamMetadataResult {
        stream: stream.to_string(),
        is_stream_deleted: deleted,
        meta_stream_version: -1,
        metadata: StreamMetadata::default(),
    }
}

fn validate_stream_name(stream: &str) -> Result<(), OperationError> {
    if stream.is_empty() {
        return Err(OperationError::InvalidArgument(
            "stream name must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_group_name(group: &str) -> Result<(), OperationError> {
    if group.is_empty() {
        return Err(OperationError::InvalidArgument(
            "group name must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_metadata_target(stream: &str) -> Result<(), OperationError> {
    validate_stream_name(stream)?;
    if stream.starts_with("$$") {
        return Err(OperationError::InvalidArgument(
            "metadata streams have no metadata of their own".to_string(),
        ));
    }
    Ok(())
}

fn validate_expected_version(expected_version: ExpectedVersion) -> Result<i64, OperationError> {
    if let ExpectedVersion::Exact(version) = expected_version
        && version < 0
    {
        return Err(OperationError::InvalidArgument(
            "exact expected version must not be negative".to_string(),
        ));
    }
    Ok(expected_version.wire_value())
}

fn validate_read_count(max_count: i32) -> Result<(), OperationError> {
    if max_count <= 0 {
        return Err(OperationError::InvalidArgument(
            "count should be positive".to_string(),
        ));
    }
    if max_count > MAX_READ_SIZE {
        return Err(OperationError::InvalidArgument(format!(
            "count should be less than or equal to {MAX_READ_SIZE}"
        )));
    }
    Ok(())
}

fn validate_catch_up_settings(settings: &CatchUpSettings) -> Result<(), OperationError> {
    if settings.read_batch_size <= 0 {
        return Err(OperationError::InvalidArgument(
            "read batch size should be positive".to_string(),
        ));
    }
    if settings.read_batch_size >= MAX_READ_SIZE {
        return Err(OperationError::InvalidArgument(format!(
            "read batch size should be less than {MAX_READ_SIZE}"
        )));
    }
    if settings.max_push_queue_size == 0 {
        return Err(OperationError::InvalidArgument(
            "max push queue size should be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        let settings = Settings::builder()
            .single_node("127.0.0.1:1113".parse().unwrap())
            .build()
            .unwrap();
        Client::new(settings)
    }

    struct NopListener;

    impl CatchUpSubscriptionListener for NopListener {
        fn on_event(
            &self,
            _subscription: &CatchUpSubscription,
            _event: crate::types::ResolvedEvent,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_stream_name_is_rejected() {
        let client = client();
        let result = client
            .append_to_stream("", ExpectedVersion::Any, Vec::new())
            .await;
        assert!(matches!(result, Err(OperationError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn negative_exact_version_is_rejected() {
        let client = client();
        let result = client
            .append_to_stream("orders-1", ExpectedVersion::Exact(-3), Vec::new())
            .await;
        assert!(matches!(result, Err(OperationError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn read_count_over_ceiling_is_rejected() {
        let client = client();
        let result = client
            .read_stream_events_forward("orders-1", 0, MAX_READ_SIZE + 1, false)
            .await;
        assert!(matches!(result, Err(OperationError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn catch_up_batch_size_must_stay_below_ceiling() {
        let client = client();
        let settings = CatchUpSettings {
            read_batch_size: MAX_READ_SIZE,
            ..CatchUpSettings::default()
        };
        let result =
            client.subscribe_to_stream_from("orders-1", None, settings, Arc::new(NopListener));
        assert!(matches!(result, Err(OperationError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn metadata_of_metadata_stream_is_rejected() {
        let client = client();
        let result = client.get_stream_metadata("$$orders-1").await;
        assert!(matches!(result, Err(OperationError::InvalidArgument(_))));
    }
}
