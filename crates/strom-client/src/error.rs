// Error taxonomy. Synchronous validation failures surface on the calling
// method; asynchronous outcomes arrive exactly once through an operation's
// completion future or a subscription's close callback.

/// Settings and builder validation failures, rejected at build time.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("missing node settings")]
    MissingNodeSettings,
    #[error("static and cluster node settings cannot be combined")]
    ConflictingNodeSettings,
    #[error("{name} should be positive")]
    NotPositive { name: &'static str },
    #[error("{name} value {value} is out of range, allowed range: [-1, infinity)")]
    OutOfRange { name: &'static str, value: i64 },
}

/// Failure of a single client operation.
#[derive(thiserror::Error, Debug)]
pub enum OperationError {
    // Protocol-level fatal outcomes reported by the server.
    #[error("expected version {expected} does not match on stream {stream}")]
    WrongExpectedVersion { stream: String, expected: i64 },
    #[error("stream {0} has been deleted")]
    StreamDeleted(String),
    #[error("invalid transaction")]
    InvalidTransaction,
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),
    #[error("server error: {0}")]
    ServerError(String),
    #[error("unexpected command: expected {expected}, got {actual}")]
    CommandNotExpected { expected: String, actual: String },
    #[error("persistent subscription has been deleted")]
    PersistentSubscriptionDeleted,
    #[error("maximum number of subscribers reached")]
    MaximumSubscribersReached,
    #[error("persistent subscription group {group} on stream {stream} already exists")]
    PersistentSubscriptionAlreadyExists { stream: String, group: String },
    #[error("persistent subscription group {group} on stream {stream} does not exist")]
    PersistentSubscriptionDoesNotExist { stream: String, group: String },
    #[error("bad request: {0}")]
    BadRequest(String),

    // Operational failures raised by the client runtime.
    #[error("operation {operation} timed out")]
    OperationTimedOut { operation: &'static str },
    #[error("operation {operation} reached its retry limit of {retries}")]
    RetryLimitReached {
        operation: &'static str,
        retries: i32,
    },
    #[error("operation queue is full ({max} entries)")]
    OperationQueueOverflow { max: usize },
    #[error("connection closed")]
    ConnectionClosed,

    // Local failures.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed server response: {0}")]
    Wire(#[from] strom_wire::Error),
}

/// Why a subscription terminated. The close callback receives exactly one of
/// these, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDropReason {
    Unsubscribed,
    AccessDenied,
    NotFound,
    PersistentSubscriptionDeleted,
    SubscriberMaxCountReached,
    ConnectionClosed,
    CatchUpError,
    ProcessingQueueOverflow,
    EventHandlerException,
    ServerError,
    UserInitiated,
}

impl From<strom_wire::proto::DropReason> for SubscriptionDropReason {
    fn from(reason: strom_wire::proto::DropReason) -> Self {
        use strom_wire::proto::DropReason;
        match reason {
            DropReason::Unsubscribed => SubscriptionDropReason::Unsubscribed,
            DropReason::AccessDenied => SubscriptionDropReason::AccessDenied,
            DropReason::NotFound => SubscriptionDropReason::NotFound,
            DropReason::PersistentSubscriptionDeleted => {
                SubscriptionDropReason::PersistentSubscriptionDeleted
            }
            DropReason::SubscriberMaxCountReached => {
                SubscriptionDropReason::SubscriberMaxCountReached
            }
        }
    }
}
