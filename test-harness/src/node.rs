//! The mock node: an in-memory event store behind a real TCP accept loop.
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use strom_transport::{PackageWriter, split_package_io};
use strom_wire::proto::{self, NakAction, OperationResult};
use strom_wire::{Command, Package};

struct StreamState {
    event_indexes: Vec<usize>,
    /// Some(true) = hard delete, Some(false) = soft delete.
    deleted: Option<bool>,
}

struct GroupState {
    stream: String,
    /// Next stream event number to hand to a connecting consumer.
    cursor: i64,
}

struct TxState {
    stream: String,
    expected_version: i64,
    events: Vec<proto::NewEvent>,
}

#[derive(Default)]
struct Store {
    all: Vec<proto::EventRecord>,
    by_event_id: HashMap<Uuid, usize>,
    streams: HashMap<String, StreamState>,
    groups: HashMap<String, GroupState>,
    next_transaction_id: u64,
    transactions: HashMap<u64, TxState>,
}

impl Store {
    fn last_event_number(&self, stream: &str) -> i64 {
        self.streams
            .get(stream)
            .and_then(|state| state.event_indexes.last())
            .map(|index| self.all[*index].event_number)
            .unwrap_or(-1)
    }

    fn is_hard_deleted(&self, stream: &str) -> bool {
        self.streams
            .get(stream)
            .is_some_and(|state| state.deleted == Some(true))
    }

    fn check_expected(&self, stream: &str, expected: i64) -> Result<(), OperationResult> {
        if self.is_hard_deleted(stream) {
            return Err(OperationResult::StreamDeleted);
        }
        let last = self.last_event_number(stream);
        let ok = match expected {
            proto::EXPECTED_VERSION_ANY => true,
            proto::EXPECTED_VERSION_NO_STREAM => last == -1,
            proto::EXPECTED_VERSION_STREAM_EXISTS => last >= 0,
            exact => exact >= 0 && last == exact,
        };
        if ok {
            Ok(())
        } else {
            Err(OperationResult::WrongExpectedVersion)
        }
    }

    /// Appends and returns (first, last, appended log indexes).
    fn append(&mut self, stream: &str, events: Vec<proto::NewEvent>) -> (i64, i64, Vec<usize>) {
        let mut last = self.last_event_number(stream);
        if events.is_empty() {
            return (-1, last, Vec::new());
        }
        let first = last + 1;
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        let mut indexes = Vec::with_capacity(events.len());
        for event in events {
            last += 1;
            let index = self.all.len();
            self.all.push(proto::EventRecord {
                event_stream_id: stream.to_string(),
                event_number: last,
                event_id: event.event_id,
                event_type: event.event_type,
                is_json: event.is_json,
                data: event.data,
                metadata: event.metadata,
                created_epoch_millis: created,
            });
            self.by_event_id.insert(event.event_id, index);
            let state = self.streams.entry(stream.to_string()).or_insert(StreamState {
                event_indexes: Vec::new(),
                deleted: None,
            });
            state.deleted = None;
            state.event_indexes.push(index);
            indexes.push(index);
        }
        (first, last, indexes)
    }

    fn end_position(&self) -> i64 {
        self.all.len() as i64 - 1
    }
}

struct Control {
    store: Mutex<Store>,
    feed: broadcast::Sender<usize>,
    drop_signal: broadcast::Sender<()>,
    mute_heartbeats: AtomicBool,
    reject_auth: AtomicBool,
}

/// A mock node listening on a loopback port.
///
/// Fault injection: [`HarnessNode::drop_connections`] severs every live
/// channel, [`HarnessNode::mute_heartbeats`] makes the node swallow
/// heartbeat requests, [`HarnessNode::reject_auth`] refuses authentication.
pub struct HarnessNode {
    addr: SocketAddr,
    control: Arc<Control>,
    accept_task: JoinHandle<()>,
}

impl HarnessNode {
    pub async fn start() -> anyhow::Result<Self> {
        Self::start_inner(None).await
    }

    /// A node that requires TLS; its self-signed certificate carries the
    /// given subject common name.
    pub async fn start_tls(common_name: &str) -> anyhow::Result<Self> {
        let acceptor = crate::tls::acceptor(common_name)?;
        Self::start_inner(Some(acceptor)).await
    }

    async fn start_inner(acceptor: Option<tokio_rustls::TlsAcceptor>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (feed, _) = broadcast::channel(4096);
        let (drop_signal, _) = broadcast::channel(8);
        let control = Arc::new(Control {
            store: Mutex::new(Store::default()),
            feed,
            drop_signal,
            mute_heartbeats: AtomicBool::new(false),
            reject_auth: AtomicBool::new(false),
        });
        let accept_control = Arc::clone(&control);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "harness node accepted connection");
                        let control = Arc::clone(&accept_control);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            let io: strom_transport::BoxedIo = match acceptor {
                                None => Box::new(stream),
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls) => Box::new(tls),
                                    Err(err) => {
                                        trace!(error = %err, "harness tls accept failed");
                                        return;
                                    }
                                },
                            };
                            if let Err(err) = serve_connection(io, control).await {
                                trace!(error = %err, "harness connection ended");
                            }
                        });
                    }
                    Err(err) => {
                        debug!(error = %err, "harness accept failed");
                        break;
                    }
                }
            }
        });
        Ok(Self {
            addr,
            control,
            accept_task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sever every live channel; the listener keeps accepting, so clients can
    /// reconnect.
    pub fn drop_connections(&self) {
        let _ = self.control.drop_signal.send(());
    }

    pub fn mute_heartbeats(&self, mute: bool) {
        self.control.mute_heartbeats.store(mute, Ordering::SeqCst);
    }

    pub fn reject_auth(&self, reject: bool) {
        self.control.reject_auth.store(reject, Ordering::SeqCst);
    }

    pub fn stream_len(&self, stream: &str) -> usize {
        self.control
            .store
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .map(|state| state.event_indexes.len())
            .unwrap_or(0)
    }

    pub fn all_len(&self) -> usize {
        self.control.store.lock().unwrap().all.len()
    }
}

impl Drop for HarnessNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

enum ServerSub {
    Stream {
        correlation: Uuid,
        stream: String,
        next_index: usize,
    },
    All {
        correlation: Uuid,
        next_index: usize,
    },
    Persistent {
        correlation: Uuid,
        stream: String,
        next_index: usize,
        in_flight: HashSet<Uuid>,
    },
}

async fn serve_connection(io: strom_transport::BoxedIo, control: Arc<Control>) -> anyhow::Result<()> {
    let (mut reader, mut writer) = split_package_io(io);
    let mut feed = control.feed.subscribe();
    let mut drop_signal = control.drop_signal.subscribe();
    let mut subs: Vec<ServerSub> = Vec::new();

    loop {
        tokio::select! {
            package = reader.read_package() => {
                let Some(package) = package? else {
                    return Ok(());
                };
                handle_package(&control, &mut writer, &mut subs, package).await?;
            }
            index = feed.recv() => {
                let Ok(index) = index else { continue };
                forward_live_event(&control, &mut writer, &mut subs, index).await?;
            }
            _ = drop_signal.recv() => {
                debug!("harness dropping connection on request");
                return Ok(());
            }
        }
    }
}

async fn forward_live_event(
    control: &Control,
    writer: &mut PackageWriter,
    subs: &mut [ServerSub],
    index: usize,
) -> anyhow::Result<()> {
    let record = control.store.lock().unwrap().all[index].clone();
    for sub in subs.iter_mut() {
        match sub {
            ServerSub::Stream {
                correlation,
                stream,
                next_index,
            } if *stream == record.event_stream_id && index >= *next_index => {
                *next_index = index + 1;
                send_stream_event(writer, *correlation, &record, index).await?;
            }
            ServerSub::All {
                correlation,
                next_index,
            } if index >= *next_index => {
                *next_index = index + 1;
                send_stream_event(writer, *correlation, &record, index).await?;
            }
            ServerSub::Persistent {
                correlation,
                stream,
                next_index,
                in_flight,
            } if *stream == record.event_stream_id && index >= *next_index => {
                *next_index = index + 1;
                in_flight.insert(record.event_id);
                send_persistent_event(writer, *correlation, &record, 0).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

async fn send(
    writer: &mut PackageWriter,
    command: Command,
    correlation: Uuid,
    payload: Bytes,
) -> anyhow::Result<()> {
    let package = Package::new(command, correlation).with_payload(payload);
    writer.write_package(&package).await?;
    Ok(())
}

async fn send_stream_event(
    writer: &mut PackageWriter,
    correlation: Uuid,
    record: &proto::EventRecord,
    index: usize,
) -> anyhow::Result<()> {
    let payload = proto::StreamEventAppeared {
        event: proto::ResolvedEventWire {
            event: Some(record.clone()),
            link: None,
            commit_position: index as i64,
            prepare_position: index as i64,
        },
    }
    .encode()?;
    send(writer, Command::StreamEventAppeared, correlation, payload).await
}

async fn send_persistent_event(
    writer: &mut PackageWriter,
    correlation: Uuid,
    record: &proto::EventRecord,
    retry_count: i32,
) -> anyhow::Result<()> {
    let payload = proto::PersistentSubscriptionStreamEventAppeared {
        event: proto::ResolvedIndexedEvent {
            event: Some(record.clone()),
            link: None,
        },
        retry_count,
    }
    .encode()?;
    send(
        writer,
        Command::PersistentSubscriptionStreamEventAppeared,
        correlation,
        payload,
    )
    .await
}

fn group_key(stream: &str, group: &str) -> String {
    format!("{stream}::{group}")
}

async fn handle_package(
    control: &Control,
    writer: &mut PackageWriter,
    subs: &mut Vec<ServerSub>,
    package: Package,
) -> anyhow::Result<()> {
    let correlation = package.correlation_id;
    match package.command {
        Command::HeartbeatRequest => {
            if !control.mute_heartbeats.load(Ordering::SeqCst) {
                send(writer, Command::HeartbeatResponse, correlation, Bytes::new()).await?;
            }
        }
        Command::HeartbeatResponse => {}
        Command::Ping => {
            send(writer, Command::Pong, correlation, package.payload).await?;
        }
        Command::Authenticate => {
            if control.reject_auth.load(Ordering::SeqCst) {
                send(
                    writer,
                    Command::NotAuthenticated,
                    correlation,
                    proto::encode_text_payload("invalid credentials"),
                )
                .await?;
            } else {
                send(writer, Command::Authenticated, correlation, Bytes::new()).await?;
            }
        }
        Command::WriteEvents => {
            let request = proto::WriteEvents::decode(package.payload)?;
            let (completed, indexes) = {
                let mut store = control.store.lock().unwrap();
                match store.check_expected(&request.event_stream_id, request.expected_version) {
                    Err(result) => (write_failure(result), Vec::new()),
                    Ok(()) => {
                        let (first, last, indexes) =
                            store.append(&request.event_stream_id, request.events);
                        let position = store.end_position();
                        (
                            proto::WriteEventsCompleted {
                                result: OperationResult::Success,
                                message: String::new(),
                                first_event_number: first,
                                last_event_number: last,
                                prepare_position: position,
                                commit_position: position,
                            },
                            indexes,
                        )
                    }
                }
            };
            send(
                writer,
                Command::WriteEventsCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
            for index in indexes {
                let _ = control.feed.send(index);
            }
        }
        Command::DeleteStream => {
            let request = proto::DeleteStream::decode(package.payload)?;
            let completed = {
                let mut store = control.store.lock().unwrap();
                match store.check_expected(&request.event_stream_id, request.expected_version) {
                    Err(result) => proto::DeleteStreamCompleted {
                        result,
                        message: String::new(),
                        prepare_position: -1,
                        commit_position: -1,
                    },
                    Ok(()) => {
                        let state = store
                            .streams
                            .entry(request.event_stream_id.clone())
                            .or_insert(StreamState {
                                event_indexes: Vec::new(),
                                deleted: None,
                            });
                        state.deleted = Some(request.hard_delete);
                        let position = store.end_position();
                        proto::DeleteStreamCompleted {
                            result: OperationResult::Success,
                            message: String::new(),
                            prepare_position: position,
                            commit_position: position,
                        }
                    }
                }
            };
            send(
                writer,
                Command::DeleteStreamCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::TransactionStart => {
            let request = proto::TransactionStart::decode(package.payload)?;
            let completed = {
                let mut store = control.store.lock().unwrap();
                if store.is_hard_deleted(&request.event_stream_id) {
                    proto::TransactionStartCompleted {
                        transaction_id: 0,
                        result: OperationResult::StreamDeleted,
                        message: String::new(),
                    }
                } else {
                    // Expectations are validated at commit time.
                    let transaction_id = store.next_transaction_id;
                    store.next_transaction_id += 1;
                    store.transactions.insert(
                        transaction_id,
                        TxState {
                            stream: request.event_stream_id.clone(),
                            expected_version: request.expected_version,
                            events: Vec::new(),
                        },
                    );
                    proto::TransactionStartCompleted {
                        transaction_id,
                        result: OperationResult::Success,
                        message: String::new(),
                    }
                }
            };
            send(
                writer,
                Command::TransactionStartCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::TransactionWrite => {
            let request = proto::TransactionWrite::decode(package.payload)?;
            let completed = {
                let mut store = control.store.lock().unwrap();
                match store.transactions.get_mut(&request.transaction_id) {
                    None => proto::TransactionWriteCompleted {
                        transaction_id: request.transaction_id,
                        result: OperationResult::InvalidTransaction,
                        message: String::new(),
                    },
                    Some(tx) => {
                        tx.events.extend(request.events);
                        proto::TransactionWriteCompleted {
                            transaction_id: request.transaction_id,
                            result: OperationResult::Success,
                            message: String::new(),
                        }
                    }
                }
            };
            send(
                writer,
                Command::TransactionWriteCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::TransactionCommit => {
            let request = proto::TransactionCommit::decode(package.payload)?;
            let (completed, indexes) = {
                let mut store = control.store.lock().unwrap();
                match store.transactions.remove(&request.transaction_id) {
                    None => (
                        commit_failure(request.transaction_id, OperationResult::InvalidTransaction),
                        Vec::new(),
                    ),
                    Some(tx) => match store.check_expected(&tx.stream, tx.expected_version) {
                        Err(result) => (commit_failure(request.transaction_id, result), Vec::new()),
                        Ok(()) => {
                            let (first, last, indexes) = store.append(&tx.stream, tx.events);
                            let position = store.end_position();
                            (
                                proto::TransactionCommitCompleted {
                                    transaction_id: request.transaction_id,
                                    result: OperationResult::Success,
                                    message: String::new(),
                                    first_event_number: first,
                                    last_event_number: last,
                                    prepare_position: position,
                                    commit_position: position,
                                },
                                indexes,
                            )
                        }
                    },
                }
            };
            send(
                writer,
                Command::TransactionCommitCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
            for index in indexes {
                let _ = control.feed.send(index);
            }
        }
        Command::ReadEvent => {
            let request = proto::ReadEvent::decode(package.payload)?;
            let completed = {
                let store = control.store.lock().unwrap();
                read_event_response(&store, &request)
            };
            send(
                writer,
                Command::ReadEventCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::ReadStreamEventsForward => {
            let request = proto::ReadStreamEvents::decode(package.payload)?;
            let completed = {
                let store = control.store.lock().unwrap();
                read_stream_forward(&store, &request)
            };
            send(
                writer,
                Command::ReadStreamEventsForwardCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::ReadStreamEventsBackward => {
            let request = proto::ReadStreamEvents::decode(package.payload)?;
            let completed = {
                let store = control.store.lock().unwrap();
                read_stream_backward(&store, &request)
            };
            send(
                writer,
                Command::ReadStreamEventsBackwardCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::ReadAllEventsForward => {
            let request = proto::ReadAllEvents::decode(package.payload)?;
            let completed = {
                let store = control.store.lock().unwrap();
                read_all_forward(&store, &request)
            };
            send(
                writer,
                Command::ReadAllEventsForwardCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::ReadAllEventsBackward => {
            let request = proto::ReadAllEvents::decode(package.payload)?;
            let completed = {
                let store = control.store.lock().unwrap();
                read_all_backward(&store, &request)
            };
            send(
                writer,
                Command::ReadAllEventsBackwardCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::SubscribeToStream => {
            let request = proto::SubscribeToStream::decode(package.payload)?;
            subscribe(control, writer, subs, correlation, request).await?;
        }
        Command::UnsubscribeFromStream => {
            subs.retain(|sub| sub_correlation(sub) != correlation);
            let payload = proto::SubscriptionDropped {
                reason: proto::DropReason::Unsubscribed,
            }
            .encode()?;
            send(writer, Command::SubscriptionDropped, correlation, payload).await?;
        }
        Command::ConnectToPersistentSubscription => {
            let request = proto::ConnectToPersistentSubscription::decode(package.payload)?;
            connect_persistent(control, writer, subs, correlation, request).await?;
        }
        Command::PersistentSubscriptionAckEvents => {
            let request = proto::PersistentSubscriptionAckEvents::decode(package.payload)?;
            for sub in subs.iter_mut() {
                if let ServerSub::Persistent {
                    correlation: sub_correlation,
                    in_flight,
                    ..
                } = sub
                    && *sub_correlation == correlation
                {
                    for event_id in &request.processed_event_ids {
                        in_flight.remove(event_id);
                    }
                }
            }
        }
        Command::PersistentSubscriptionNakEvents => {
            let request = proto::PersistentSubscriptionNakEvents::decode(package.payload)?;
            let records: Vec<proto::EventRecord> = {
                let store = control.store.lock().unwrap();
                request
                    .processed_event_ids
                    .iter()
                    .filter_map(|event_id| store.by_event_id.get(event_id).copied())
                    .map(|index| store.all[index].clone())
                    .collect()
            };
            if request.action == NakAction::Retry {
                for record in records {
                    send_persistent_event(writer, correlation, &record, 1).await?;
                }
            } else {
                for sub in subs.iter_mut() {
                    if let ServerSub::Persistent {
                        correlation: sub_correlation,
                        in_flight,
                        ..
                    } = sub
                        && *sub_correlation == correlation
                    {
                        for event_id in &request.processed_event_ids {
                            in_flight.remove(event_id);
                        }
                    }
                }
            }
        }
        Command::CreatePersistentSubscription => {
            let request = proto::PersistentSubscriptionParams::decode(package.payload)?;
            let completed = {
                let mut store = control.store.lock().unwrap();
                let key = group_key(&request.event_stream_id, &request.subscription_group_name);
                if store.groups.contains_key(&key) {
                    proto::CreatePersistentSubscriptionCompleted {
                        result: proto::CreatePersistentResult::AlreadyExists,
                        reason: "group already exists".to_string(),
                    }
                } else {
                    let cursor = if request.start_from < 0 {
                        store.last_event_number(&request.event_stream_id) + 1
                    } else {
                        request.start_from
                    };
                    store.groups.insert(
                        key,
                        GroupState {
                            stream: request.event_stream_id.clone(),
                            cursor,
                        },
                    );
                    proto::CreatePersistentSubscriptionCompleted {
                        result: proto::CreatePersistentResult::Success,
                        reason: String::new(),
                    }
                }
            };
            send(
                writer,
                Command::CreatePersistentSubscriptionCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::UpdatePersistentSubscription => {
            let request = proto::PersistentSubscriptionParams::decode(package.payload)?;
            let completed = {
                let mut store = control.store.lock().unwrap();
                let key = group_key(&request.event_stream_id, &request.subscription_group_name);
                if let Some(group) = store.groups.get_mut(&key) {
                    if request.start_from >= 0 {
                        group.cursor = request.start_from;
                    }
                    proto::UpdatePersistentSubscriptionCompleted {
                        result: proto::UpdatePersistentResult::Success,
                        reason: String::new(),
                    }
                } else {
                    proto::UpdatePersistentSubscriptionCompleted {
                        result: proto::UpdatePersistentResult::DoesNotExist,
                        reason: "group does not exist".to_string(),
                    }
                }
            };
            send(
                writer,
                Command::UpdatePersistentSubscriptionCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        Command::DeletePersistentSubscription => {
            let request = proto::DeletePersistentSubscription::decode(package.payload)?;
            let completed = {
                let mut store = control.store.lock().unwrap();
                let key = group_key(&request.event_stream_id, &request.subscription_group_name);
                if store.groups.remove(&key).is_some() {
                    proto::DeletePersistentSubscriptionCompleted {
                        result: proto::DeletePersistentResult::Success,
                        reason: String::new(),
                    }
                } else {
                    proto::DeletePersistentSubscriptionCompleted {
                        result: proto::DeletePersistentResult::DoesNotExist,
                        reason: "group does not exist".to_string(),
                    }
                }
            };
            send(
                writer,
                Command::DeletePersistentSubscriptionCompleted,
                correlation,
                completed.encode()?,
            )
            .await?;
        }
        other => {
            trace!(command = ?other, "harness ignoring command");
        }
    }
    Ok(())
}

fn sub_correlation(sub: &ServerSub) -> Uuid {
    match sub {
        ServerSub::Stream { correlation, .. }
        | ServerSub::All { correlation, .. }
        | ServerSub::Persistent { correlation, .. } => *correlation,
    }
}

fn write_failure(result: OperationResult) -> proto::WriteEventsCompleted {
    proto::WriteEventsCompleted {
        result,
        message: String::new(),
        first_event_number: -1,
        last_event_number: -1,
        prepare_position: -1,
        commit_position: -1,
    }
}

fn commit_failure(transaction_id: u64, result: OperationResult) -> proto::TransactionCommitCompleted {
    proto::TransactionCommitCompleted {
        transaction_id,
        result,
        message: String::new(),
        first_event_number: -1,
        last_event_number: -1,
        prepare_position: -1,
        commit_position: -1,
    }
}

fn read_event_response(store: &Store, request: &proto::ReadEvent) -> proto::ReadEventCompleted {
    let empty = proto::ResolvedIndexedEvent {
        event: None,
        link: None,
    };
    if store.is_hard_deleted(&request.event_stream_id) {
        return proto::ReadEventCompleted {
            result: proto::ReadEventStatus::StreamDeleted,
            event: empty,
            error: String::new(),
        };
    }
    let Some(state) = store.streams.get(&request.event_stream_id) else {
        return proto::ReadEventCompleted {
            result: proto::ReadEventStatus::NoStream,
            event: empty,
            error: String::new(),
        };
    };
    if state.deleted.is_some() || state.event_indexes.is_empty() {
        return proto::ReadEventCompleted {
            result: proto::ReadEventStatus::NoStream,
            event: empty,
            error: String::new(),
        };
    }
    let number = if request.event_number == -1 {
        store.last_event_number(&request.event_stream_id)
    } else {
        request.event_number
    };
    let record = state
        .event_indexes
        .iter()
        .map(|index| &store.all[*index])
        .find(|record| record.event_number == number);
    match record {
        Some(record) => proto::ReadEventCompleted {
            result: proto::ReadEventStatus::Success,
            event: proto::ResolvedIndexedEvent {
                event: Some(record.clone()),
                link: None,
            },
            error: String::new(),
        },
        None => proto::ReadEventCompleted {
            result: proto::ReadEventStatus::NotFound,
            event: empty,
            error: String::new(),
        },
    }
}

fn read_stream_forward(
    store: &Store,
    request: &proto::ReadStreamEvents,
) -> proto::ReadStreamEventsCompleted {
    if store.is_hard_deleted(&request.event_stream_id) {
        return stream_read_status(proto::ReadStreamStatus::StreamDeleted);
    }
    let Some(state) = store.streams.get(&request.event_stream_id) else {
        return stream_read_status(proto::ReadStreamStatus::NoStream);
    };
    if state.deleted.is_some() {
        return stream_read_status(proto::ReadStreamStatus::NoStream);
    }
    let last = store.last_event_number(&request.event_stream_id);
    let from = request.from_event_number;
    let events: Vec<proto::ResolvedIndexedEvent> = state
        .event_indexes
        .iter()
        .map(|index| &store.all[*index])
        .filter(|record| record.event_number >= from)
        .take(request.max_count as usize)
        .map(|record| proto::ResolvedIndexedEvent {
            event: Some(record.clone()),
            link: None,
        })
        .collect();
    let next = events
        .last()
        .and_then(|resolved| resolved.event.as_ref())
        .map(|record| record.event_number + 1)
        .unwrap_or(from);
    proto::ReadStreamEventsCompleted {
        result: proto::ReadStreamStatus::Success,
        events,
        next_event_number: next,
        last_event_number: last,
        is_end_of_stream: next > last,
        last_commit_position: store.end_position(),
        error: String::new(),
    }
}

fn read_stream_backward(
    store: &Store,
    request: &proto::ReadStreamEvents,
) -> proto::ReadStreamEventsCompleted {
    if store.is_hard_deleted(&request.event_stream_id) {
        return stream_read_status(proto::ReadStreamStatus::StreamDeleted);
    }
    let Some(state) = store.streams.get(&request.event_stream_id) else {
        return stream_read_status(proto::ReadStreamStatus::NoStream);
    };
    if state.deleted.is_some() {
        return stream_read_status(proto::ReadStreamStatus::NoStream);
    }
    let last = store.last_event_number(&request.event_stream_id);
    let from = if request.from_event_number == -1 {
        last
    } else {
        request.from_event_number
    };
    let events: Vec<proto::ResolvedIndexedEvent> = state
        .event_indexes
        .iter()
        .rev()
        .map(|index| &store.all[*index])
        .filter(|record| record.event_number <= from)
        .take(request.max_count as usize)
        .map(|record| proto::ResolvedIndexedEvent {
            event: Some(record.clone()),
            link: None,
        })
        .collect();
    let next = events
        .last()
        .and_then(|resolved| resolved.event.as_ref())
        .map(|record| record.event_number - 1)
        .unwrap_or(-1);
    proto::ReadStreamEventsCompleted {
        result: proto::ReadStreamStatus::Success,
        events,
        next_event_number: next,
        last_event_number: last,
        is_end_of_stream: next < 0,
        last_commit_position: store.end_position(),
        error: String::new(),
    }
}

fn stream_read_status(result: proto::ReadStreamStatus) -> proto::ReadStreamEventsCompleted {
    proto::ReadStreamEventsCompleted {
        result,
        events: Vec::new(),
        next_event_number: -1,
        last_event_number: -1,
        is_end_of_stream: true,
        last_commit_position: -1,
        error: String::new(),
    }
}

fn read_all_forward(store: &Store, request: &proto::ReadAllEvents) -> proto::ReadAllEventsCompleted {
    let from = request.commit_position.max(0) as usize;
    let to = (from + request.max_count as usize).min(store.all.len());
    let events: Vec<proto::ResolvedEventWire> = (from..to)
        .map(|index| proto::ResolvedEventWire {
            event: Some(store.all[index].clone()),
            link: None,
            commit_position: index as i64,
            prepare_position: index as i64,
        })
        .collect();
    proto::ReadAllEventsCompleted {
        result: proto::ReadAllStatus::Success,
        commit_position: request.commit_position,
        prepare_position: request.prepare_position,
        events,
        next_commit_position: to as i64,
        next_prepare_position: to as i64,
        error: String::new(),
    }
}

fn read_all_backward(
    store: &Store,
    request: &proto::ReadAllEvents,
) -> proto::ReadAllEventsCompleted {
    let end = if request.commit_position < 0 {
        store.all.len() as i64
    } else {
        request.commit_position
    };
    let from = (end - request.max_count as i64).max(0) as usize;
    let events: Vec<proto::ResolvedEventWire> = (from..end.max(0) as usize)
        .rev()
        .map(|index| proto::ResolvedEventWire {
            event: Some(store.all[index].clone()),
            link: None,
            commit_position: index as i64,
            prepare_position: index as i64,
        })
        .collect();
    proto::ReadAllEventsCompleted {
        result: proto::ReadAllStatus::Success,
        commit_position: end,
        prepare_position: end,
        events,
        next_commit_position: from as i64 - 1,
        next_prepare_position: from as i64 - 1,
        error: String::new(),
    }
}

async fn subscribe(
    control: &Control,
    writer: &mut PackageWriter,
    subs: &mut Vec<ServerSub>,
    correlation: Uuid,
    request: proto::SubscribeToStream,
) -> anyhow::Result<()> {
    let (confirmation, backlog, next_index) = {
        let store = control.store.lock().unwrap();
        let last_event_number = if request.event_stream_id.is_empty() {
            -1
        } else {
            store.last_event_number(&request.event_stream_id)
        };
        let confirmation = proto::SubscriptionConfirmation {
            last_commit_position: store.end_position(),
            last_event_number,
        };
        // Resume-after fields replay the gap a reconnecting subscriber missed.
        let mut backlog: Vec<(proto::EventRecord, usize)> = Vec::new();
        if request.event_stream_id.is_empty() {
            if request.resume_after_commit_position >= 0 {
                for (index, record) in store.all.iter().enumerate() {
                    if (index as i64) > request.resume_after_commit_position {
                        backlog.push((record.clone(), index));
                    }
                }
            }
        } else if request.resume_after_event_number >= 0
            && let Some(state) = store.streams.get(&request.event_stream_id)
        {
            for index in &state.event_indexes {
                let record = &store.all[*index];
                if record.event_number > request.resume_after_event_number {
                    backlog.push((record.clone(), *index));
                }
            }
        }
        (confirmation, backlog, store.all.len())
    };
    send(
        writer,
        Command::SubscriptionConfirmation,
        correlation,
        confirmation.encode()?,
    )
    .await?;
    for (record, index) in backlog {
        send_stream_event(writer, correlation, &record, index).await?;
    }
    if request.event_stream_id.is_empty() {
        subs.push(ServerSub::All {
            correlation,
            next_index,
        });
    } else {
        subs.push(ServerSub::Stream {
            correlation,
            stream: request.event_stream_id,
            next_index,
        });
    }
    Ok(())
}

async fn connect_persistent(
    control: &Control,
    writer: &mut PackageWriter,
    subs: &mut Vec<ServerSub>,
    correlation: Uuid,
    request: proto::ConnectToPersistentSubscription,
) -> anyhow::Result<()> {
    let key = group_key(&request.event_stream_id, &request.subscription_id);
    let outcome = {
        let mut store = control.store.lock().unwrap();
        if !store.groups.contains_key(&key) {
            None
        } else {
            let last_event_number = store.last_event_number(&request.event_stream_id);
            let end_position = store.end_position();
            let all_len = store.all.len();
            let group = store.groups.get(&key).unwrap();
            let cursor = group.cursor;
            let group_stream = group.stream.clone();
            let mut backlog: Vec<proto::EventRecord> = Vec::new();
            if let Some(state) = store.streams.get(&group_stream) {
                for index in &state.event_indexes {
                    let record = &store.all[*index];
                    if record.event_number >= cursor {
                        backlog.push(record.clone());
                    }
                }
            }
            if let Some(group) = store.groups.get_mut(&key) {
                group.cursor = last_event_number + 1;
            }
            Some((
                proto::PersistentSubscriptionConfirmation {
                    last_commit_position: end_position,
                    subscription_id: request.subscription_id.clone(),
                    last_event_number,
                },
                backlog,
                all_len,
            ))
        }
    };
    let Some((confirmation, backlog, next_index)) = outcome else {
        let payload = proto::SubscriptionDropped {
            reason: proto::DropReason::NotFound,
        }
        .encode()?;
        send(writer, Command::SubscriptionDropped, correlation, payload).await?;
        return Ok(());
    };
    send(
        writer,
        Command::PersistentSubscriptionConfirmation,
        correlation,
        confirmation.encode()?,
    )
    .await?;
    let mut in_flight = HashSet::new();
    for record in &backlog {
        in_flight.insert(record.event_id);
        send_persistent_event(writer, correlation, record, 0).await?;
    }
    subs.push(ServerSub::Persistent {
        correlation,
        stream: request.event_stream_id,
        next_index,
        in_flight,
    });
    Ok(())
}
