//! One type per wire operation: each builds its request package and inspects
//! the correlated response, completing its oneshot sink with a typed result.
use std::net::{IpAddr, SocketAddr};

use tokio::sync::oneshot;
use uuid::Uuid;

use strom_wire::proto::{
    self, NotHandledReason, OperationResult, ReadAllStatus, ReadEventStatus, ReadStreamStatus,
};
use strom_wire::{Command, Credentials, Package};

use crate::error::OperationError;
use crate::types::{
    AllEventsSlice, DeleteResult, EventReadResult, EventReadStatus, Position, ReadDirection,
    ResolvedEvent, SliceReadStatus, StreamEventsSlice, WriteResult,
};

/// What the registry should do with an operation after it saw a response.
#[derive(Debug)]
pub(crate) enum Inspection {
    /// Terminal; the completion sink has been resolved.
    Completed,
    /// Keep the operation active and wait for further frames.
    Continue,
    /// Re-enqueue for another attempt.
    Retry(&'static str),
    /// The server redirected us; reconnect there and re-enqueue.
    Reconnect(SocketAddr),
    /// Terminal failure; the registry resolves the sink via `fail`.
    Fail(OperationError),
}

pub(crate) trait ClientOperation: Send {
    fn name(&self) -> &'static str;

    /// Per-operation credentials override; the driver injects the configured
    /// default when this is `None`.
    fn credentials(&self) -> Option<Credentials>;

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package>;

    fn inspect(&mut self, package: Package) -> Inspection;

    fn fail(&mut self, error: OperationError);
}

/// Owns an operation's completion sink; resolves it at most once.
pub(crate) struct ResponseSender<T>(Option<oneshot::Sender<Result<T, OperationError>>>);

impl<T> ResponseSender<T> {
    pub(crate) fn new(sender: oneshot::Sender<Result<T, OperationError>>) -> Self {
        Self(Some(sender))
    }

    fn send(&mut self, result: Result<T, OperationError>) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(result);
        }
    }
}

/// Shared handling for every response that is not the expected completion:
/// authentication failures, bad requests and not-handled redirects.
fn expect_command(expected: Command, package: Package) -> Result<bytes::Bytes, Inspection> {
    if package.command == expected {
        return Ok(package.payload);
    }
    Err(match package.command {
        Command::NotAuthenticated => Inspection::Fail(OperationError::NotAuthenticated(
            proto::text_payload(&package.payload),
        )),
        Command::BadRequest => Inspection::Fail(OperationError::BadRequest(proto::text_payload(
            &package.payload,
        ))),
        Command::NotHandled => match proto::NotHandled::decode(package.payload) {
            Ok(message) => match message.reason {
                NotHandledReason::NotReady => Inspection::Retry("server not ready"),
                NotHandledReason::TooBusy => Inspection::Retry("server too busy"),
                NotHandledReason::NotMaster => match resolve_master(&message) {
                    Some(address) => Inspection::Reconnect(address),
                    None => Inspection::Retry("not master"),
                },
            },
            Err(err) => Inspection::Fail(err.into()),
        },
        other => Inspection::Fail(OperationError::CommandNotExpected {
            expected: format!("{expected:?}"),
            actual: format!("{other:?}"),
        }),
    })
}

// The redirect carries a host string; only literal addresses are usable here
// since name resolution cannot happen on the driver task.
fn resolve_master(message: &proto::NotHandled) -> Option<SocketAddr> {
    let endpoint = message.master_endpoint.as_ref()?;
    let ip: IpAddr = endpoint.host.parse().ok()?;
    Some(SocketAddr::new(ip, endpoint.port))
}

enum WriteClass {
    Success,
    Retry(&'static str),
    Fail(OperationError),
}

fn classify_write_result(result: OperationResult, stream: &str, expected_version: i64) -> WriteClass {
    match result {
        OperationResult::Success => WriteClass::Success,
        OperationResult::PrepareTimeout => WriteClass::Retry("prepare timeout"),
        OperationResult::CommitTimeout => WriteClass::Retry("commit timeout"),
        OperationResult::ForwardTimeout => WriteClass::Retry("forward timeout"),
        OperationResult::WrongExpectedVersion => {
            WriteClass::Fail(OperationError::WrongExpectedVersion {
                stream: stream.to_string(),
                expected: expected_version,
            })
        }
        OperationResult::StreamDeleted => {
            WriteClass::Fail(OperationError::StreamDeleted(stream.to_string()))
        }
        OperationResult::InvalidTransaction => WriteClass::Fail(OperationError::InvalidTransaction),
        OperationResult::AccessDenied => WriteClass::Fail(OperationError::AccessDenied(format!(
            "write access denied for stream {stream}"
        ))),
    }
}

pub(crate) struct AppendToStream {
    pub stream: String,
    pub expected_version: i64,
    pub events: Vec<proto::NewEvent>,
    pub require_master: bool,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<WriteResult>,
}

impl ClientOperation for AppendToStream {
    fn name(&self) -> &'static str {
        "AppendToStream"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = proto::WriteEvents {
            event_stream_id: self.stream.clone(),
            expected_version: self.expected_version,
            require_master: self.require_master,
            events: self.events.clone(),
        }
        .encode()?;
        Ok(Package::new(Command::WriteEvents, correlation_id).with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::WriteEventsCompleted, package) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::WriteEventsCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        match classify_write_result(completed.result, &self.stream, self.expected_version) {
            WriteClass::Success => {
                self.result.send(Ok(WriteResult {
                    next_expected_version: completed.last_event_number,
                    log_position: Position::new(
                        completed.commit_position,
                        completed.prepare_position,
                    ),
                }));
                Inspection::Completed
            }
            WriteClass::Retry(reason) => Inspection::Retry(reason),
            WriteClass::Fail(error) => Inspection::Fail(error),
        }
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct DeleteStreamOp {
    pub stream: String,
    pub expected_version: i64,
    pub hard_delete: bool,
    pub require_master: bool,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<DeleteResult>,
}

impl ClientOperation for DeleteStreamOp {
    fn name(&self) -> &'static str {
        "DeleteStream"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = proto::DeleteStream {
            event_stream_id: self.stream.clone(),
            expected_version: self.expected_version,
            require_master: self.require_master,
            hard_delete: self.hard_delete,
        }
        .encode()?;
        Ok(Package::new(Command::DeleteStream, correlation_id).with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::DeleteStreamCompleted, package) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::DeleteStreamCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        match classify_write_result(completed.result, &self.stream, self.expected_version) {
            WriteClass::Success => {
                self.result.send(Ok(DeleteResult {
                    log_position: Position::new(
                        completed.commit_position,
                        completed.prepare_position,
                    ),
                }));
                Inspection::Completed
            }
            WriteClass::Retry(reason) => Inspection::Retry(reason),
            WriteClass::Fail(error) => Inspection::Fail(error),
        }
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct StartTransactionOp {
    pub stream: String,
    pub expected_version: i64,
    pub require_master: bool,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<u64>,
}

impl ClientOperation for StartTransactionOp {
    fn name(&self) -> &'static str {
        "StartTransaction"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = proto::TransactionStart {
            event_stream_id: self.stream.clone(),
            expected_version: self.expected_version,
            require_master: self.require_master,
        }
        .encode()?;
        Ok(Package::new(Command::TransactionStart, correlation_id).with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::TransactionStartCompleted, package) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::TransactionStartCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        match classify_write_result(completed.result, &self.stream, self.expected_version) {
            WriteClass::Success => {
                self.result.send(Ok(completed.transaction_id));
                Inspection::Completed
            }
            WriteClass::Retry(reason) => Inspection::Retry(reason),
            WriteClass::Fail(error) => Inspection::Fail(error),
        }
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct TransactionWriteOp {
    pub transaction_id: u64,
    pub events: Vec<proto::NewEvent>,
    pub require_master: bool,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<()>,
}

impl ClientOperation for TransactionWriteOp {
    fn name(&self) -> &'static str {
        "TransactionWrite"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = proto::TransactionWrite {
            transaction_id: self.transaction_id,
            require_master: self.require_master,
            events: self.events.clone(),
        }
        .encode()?;
        Ok(Package::new(Command::TransactionWrite, correlation_id).with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::TransactionWriteCompleted, package) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::TransactionWriteCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        let label = format!("transaction {}", self.transaction_id);
        match classify_write_result(completed.result, &label, -1) {
            WriteClass::Success => {
                self.result.send(Ok(()));
                Inspection::Completed
            }
            WriteClass::Retry(reason) => Inspection::Retry(reason),
            WriteClass::Fail(error) => Inspection::Fail(error),
        }
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct TransactionCommitOp {
    pub transaction_id: u64,
    pub require_master: bool,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<WriteResult>,
}

impl ClientOperation for TransactionCommitOp {
    fn name(&self) -> &'static str {
        "TransactionCommit"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = proto::TransactionCommit {
            transaction_id: self.transaction_id,
            require_master: self.require_master,
        }
        .encode()?;
        Ok(Package::new(Command::TransactionCommit, correlation_id).with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::TransactionCommitCompleted, package) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::TransactionCommitCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        let label = format!("transaction {}", self.transaction_id);
        match classify_write_result(completed.result, &label, -1) {
            WriteClass::Success => {
                self.result.send(Ok(WriteResult {
                    next_expected_version: completed.last_event_number,
                    log_position: Position::new(
                        completed.commit_position,
                        completed.prepare_position,
                    ),
                }));
                Inspection::Completed
            }
            WriteClass::Retry(reason) => Inspection::Retry(reason),
            WriteClass::Fail(error) => Inspection::Fail(error),
        }
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct ReadEventOp {
    pub stream: String,
    pub event_number: i64,
    pub resolve_link_tos: bool,
    pub require_master: bool,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<EventReadResult>,
}

impl ClientOperation for ReadEventOp {
    fn name(&self) -> &'static str {
        "ReadEvent"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = proto::ReadEvent {
            event_stream_id: self.stream.clone(),
            event_number: self.event_number,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        }
        .encode()?;
        Ok(Package::new(Command::ReadEvent, correlation_id).with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::ReadEventCompleted, package) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::ReadEventCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        let status = match completed.result {
            ReadEventStatus::Success => EventReadStatus::Success,
            ReadEventStatus::NotFound => EventReadStatus::NotFound,
            ReadEventStatus::NoStream => EventReadStatus::NoStream,
            ReadEventStatus::StreamDeleted => EventReadStatus::StreamDeleted,
            ReadEventStatus::Error => {
                return Inspection::Fail(OperationError::ServerError(completed.error));
            }
            ReadEventStatus::AccessDenied => {
                return Inspection::Fail(OperationError::AccessDenied(format!(
                    "read access denied for stream {}",
                    self.stream
                )));
            }
        };
        let event = (status == EventReadStatus::Success)
            .then(|| ResolvedEvent::from(completed.event));
        self.result.send(Ok(EventReadResult {
            status,
            stream: self.stream.clone(),
            event_number: self.event_number,
            event,
        }));
        Inspection::Completed
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct ReadStreamOp {
    pub stream: String,
    pub from_event_number: i64,
    pub max_count: i32,
    pub resolve_link_tos: bool,
    pub direction: ReadDirection,
    pub require_master: bool,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<StreamEventsSlice>,
}

impl ClientOperation for ReadStreamOp {
    fn name(&self) -> &'static str {
        match self.direction {
            ReadDirection::Forward => "ReadStreamEventsForward",
            ReadDirection::Backward => "ReadStreamEventsBackward",
        }
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let command = match self.direction {
            ReadDirection::Forward => Command::ReadStreamEventsForward,
            ReadDirection::Backward => Command::ReadStreamEventsBackward,
        };
        let payload = proto::ReadStreamEvents {
            event_stream_id: self.stream.clone(),
            from_event_number: self.from_event_number,
            max_count: self.max_count,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        }
        .encode()?;
        Ok(Package::new(command, correlation_id).with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let expected = match self.direction {
            ReadDirection::Forward => Command::ReadStreamEventsForwardCompleted,
            ReadDirection::Backward => Command::ReadStreamEventsBackwardCompleted,
        };
        let payload = match expect_command(expected, package) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::ReadStreamEventsCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        let status = match completed.result {
            ReadStreamStatus::Success | ReadStreamStatus::NotModified => SliceReadStatus::Success,
            ReadStreamStatus::NoStream => SliceReadStatus::StreamNotFound,
            ReadStreamStatus::StreamDeleted => SliceReadStatus::StreamDeleted,
            ReadStreamStatus::Error => {
                return Inspection::Fail(OperationError::ServerError(completed.error));
            }
            ReadStreamStatus::AccessDenied => {
                return Inspection::Fail(OperationError::AccessDenied(format!(
                    "read access denied for stream {}",
                    self.stream
                )));
            }
        };
        self.result.send(Ok(StreamEventsSlice {
            status,
            stream: self.stream.clone(),
            from_event_number: self.from_event_number,
            direction: self.direction,
            events: completed
                .events
                .into_iter()
                .map(ResolvedEvent::from)
                .collect(),
            next_event_number: completed.next_event_number,
            last_event_number: completed.last_event_number,
            is_end_of_stream: completed.is_end_of_stream,
        }));
        Inspection::Completed
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct ReadAllOp {
    pub position: Position,
    pub max_count: i32,
    pub resolve_link_tos: bool,
    pub direction: ReadDirection,
    pub require_master: bool,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<AllEventsSlice>,
}

impl ClientOperation for ReadAllOp {
    fn name(&self) -> &'static str {
        match self.direction {
            ReadDirection::Forward => "ReadAllEventsForward",
            ReadDirection::Backward => "ReadAllEventsBackward",
        }
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let command = match self.direction {
            ReadDirection::Forward => Command::ReadAllEventsForward,
            ReadDirection::Backward => Command::ReadAllEventsBackward,
        };
        let payload = proto::ReadAllEvents {
            commit_position: self.position.commit,
            prepare_position: self.position.prepare,
            max_count: self.max_count,
            resolve_link_tos: self.resolve_link_tos,
            require_master: self.require_master,
        }
        .encode()?;
        Ok(Package::new(command, correlation_id).with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let expected = match self.direction {
            ReadDirection::Forward => Command::ReadAllEventsForwardCompleted,
            ReadDirection::Backward => Command::ReadAllEventsBackwardCompleted,
        };
        let payload = match expect_command(expected, package) {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::ReadAllEventsCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        match completed.result {
            ReadAllStatus::Success | ReadAllStatus::NotModified => {}
            ReadAllStatus::Error => {
                return Inspection::Fail(OperationError::ServerError(completed.error));
            }
            ReadAllStatus::AccessDenied => {
                return Inspection::Fail(OperationError::AccessDenied(
                    "read access denied for $all".to_string(),
                ));
            }
        }
        self.result.send(Ok(AllEventsSlice {
            direction: self.direction,
            from_position: Position::new(completed.commit_position, completed.prepare_position),
            next_position: Position::new(
                completed.next_commit_position,
                completed.next_prepare_position,
            ),
            events: completed
                .events
                .into_iter()
                .map(ResolvedEvent::from)
                .collect(),
        }));
        Inspection::Completed
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct CreatePersistentOp {
    pub params: proto::PersistentSubscriptionParams,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<()>,
}

impl ClientOperation for CreatePersistentOp {
    fn name(&self) -> &'static str {
        "CreatePersistentSubscription"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = self.params.encode()?;
        Ok(Package::new(Command::CreatePersistentSubscription, correlation_id)
            .with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::CreatePersistentSubscriptionCompleted, package)
        {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::CreatePersistentSubscriptionCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        use proto::CreatePersistentResult::*;
        match completed.result {
            Success => {
                self.result.send(Ok(()));
                Inspection::Completed
            }
            AlreadyExists => Inspection::Fail(OperationError::PersistentSubscriptionAlreadyExists {
                stream: self.params.event_stream_id.clone(),
                group: self.params.subscription_group_name.clone(),
            }),
            Fail => Inspection::Fail(OperationError::ServerError(completed.reason)),
            AccessDenied => Inspection::Fail(OperationError::AccessDenied(completed.reason)),
        }
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct UpdatePersistentOp {
    pub params: proto::PersistentSubscriptionParams,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<()>,
}

impl ClientOperation for UpdatePersistentOp {
    fn name(&self) -> &'static str {
        "UpdatePersistentSubscription"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = self.params.encode()?;
        Ok(Package::new(Command::UpdatePersistentSubscription, correlation_id)
            .with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::UpdatePersistentSubscriptionCompleted, package)
        {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::UpdatePersistentSubscriptionCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        use proto::UpdatePersistentResult::*;
        match completed.result {
            Success => {
                self.result.send(Ok(()));
                Inspection::Completed
            }
            DoesNotExist => Inspection::Fail(OperationError::PersistentSubscriptionDoesNotExist {
                stream: self.params.event_stream_id.clone(),
                group: self.params.subscription_group_name.clone(),
            }),
            Fail => Inspection::Fail(OperationError::ServerError(completed.reason)),
            AccessDenied => Inspection::Fail(OperationError::AccessDenied(completed.reason)),
        }
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}

pub(crate) struct DeletePersistentOp {
    pub stream: String,
    pub group: String,
    pub credentials: Option<Credentials>,
    pub result: ResponseSender<()>,
}

impl ClientOperation for DeletePersistentOp {
    fn name(&self) -> &'static str {
        "DeletePersistentSubscription"
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }

    fn request(&self, correlation_id: Uuid) -> strom_wire::Result<Package> {
        let payload = proto::DeletePersistentSubscription {
            subscription_group_name: self.group.clone(),
            event_stream_id: self.stream.clone(),
        }
        .encode()?;
        Ok(Package::new(Command::DeletePersistentSubscription, correlation_id)
            .with_payload(payload))
    }

    fn inspect(&mut self, package: Package) -> Inspection {
        let payload = match expect_command(Command::DeletePersistentSubscriptionCompleted, package)
        {
            Ok(payload) => payload,
            Err(outcome) => return outcome,
        };
        let completed = match proto::DeletePersistentSubscriptionCompleted::decode(payload) {
            Ok(completed) => completed,
            Err(err) => return Inspection::Fail(err.into()),
        };
        use proto::DeletePersistentResult::*;
        match completed.result {
            Success => {
                self.result.send(Ok(()));
                Inspection::Completed
            }
            DoesNotExist => Inspection::Fail(OperationError::PersistentSubscriptionDoesNotExist {
                stream: self.stream.clone(),
                group: self.group.clone(),
            }),
            Fail => Inspection::Fail(OperationError::ServerError(completed.reason)),
            AccessDenied => Inspection::Fail(OperationError::AccessDenied(completed.reason)),
        }
    }

    fn fail(&mut self, error: OperationError) {
        self.result.send(Err(error));
    }
}
