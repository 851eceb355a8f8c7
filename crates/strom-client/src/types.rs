//! Core value types: events, positions, expected versions, read results.
use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use strom_wire::proto::{
    self, EXPECTED_VERSION_ANY, EXPECTED_VERSION_NO_STREAM, EXPECTED_VERSION_STREAM_EXISTS,
};

/// A point in the all-streams log. Ordering compares commit first, prepare
/// second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub commit: i64,
    pub prepare: i64,
}

impl Position {
    pub const START: Position = Position {
        commit: 0,
        prepare: 0,
    };
    pub const END: Position = Position {
        commit: -1,
        prepare: -1,
    };

    pub fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }
}

/// Optimistic concurrency token supplied by a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The stream must not exist yet.
    NoStream,
    /// No concurrency check.
    Any,
    /// The stream must exist, at any version.
    StreamExists,
    /// The stream's last event number must equal this value.
    Exact(i64),
}

impl ExpectedVersion {
    pub(crate) fn wire_value(self) -> i64 {
        match self {
            ExpectedVersion::NoStream => EXPECTED_VERSION_NO_STREAM,
            ExpectedVersion::Any => EXPECTED_VERSION_ANY,
            ExpectedVersion::StreamExists => EXPECTED_VERSION_STREAM_EXISTS,
            ExpectedVersion::Exact(version) => version,
        }
    }
}

/// An event to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventData {
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl EventData {
    /// A JSON event serialized from any `Serialize` value.
    pub fn json<T: Serialize>(event_type: impl Into<String>, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: true,
            data: Bytes::from(serde_json::to_vec(data)?),
            metadata: Bytes::new(),
        })
    }

    /// An opaque binary event.
    pub fn binary(event_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json: false,
            data: data.into(),
            metadata: Bytes::new(),
        }
    }

    pub fn with_id(mut self, event_id: Uuid) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = metadata.into();
        self
    }

    pub fn with_json_metadata<T: Serialize>(mut self, metadata: &T) -> serde_json::Result<Self> {
        self.metadata = Bytes::from(serde_json::to_vec(metadata)?);
        Ok(self)
    }

    pub(crate) fn into_wire(self) -> proto::NewEvent {
        proto::NewEvent {
            event_id: self.event_id,
            event_type: self.event_type,
            is_json: self.is_json,
            data: self.data,
            metadata: self.metadata,
        }
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub stream_id: String,
    pub event_number: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
    pub created_epoch_millis: i64,
}

impl From<proto::EventRecord> for RecordedEvent {
    fn from(record: proto::EventRecord) -> Self {
        Self {
            stream_id: record.event_stream_id,
            event_number: record.event_number,
            event_id: record.event_id,
            event_type: record.event_type,
            is_json: record.is_json,
            data: record.data,
            metadata: record.metadata,
            created_epoch_millis: record.created_epoch_millis,
        }
    }
}

/// An event possibly dereferenced through a link pointer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEvent {
    pub event: Option<RecordedEvent>,
    pub link: Option<RecordedEvent>,
    pub position: Option<Position>,
}

impl ResolvedEvent {
    /// The event as it appeared in the stream that was read or subscribed.
    pub fn original_event(&self) -> Option<&RecordedEvent> {
        self.link.as_ref().or(self.event.as_ref())
    }

    pub fn original_stream_id(&self) -> &str {
        self.original_event()
            .map(|event| event.stream_id.as_str())
            .unwrap_or("")
    }

    pub fn original_event_number(&self) -> i64 {
        self.original_event()
            .map(|event| event.event_number)
            .unwrap_or(-1)
    }

    pub fn original_position(&self) -> Option<Position> {
        self.position
    }

    pub fn is_resolved(&self) -> bool {
        self.link.is_some() && self.event.is_some()
    }
}

impl From<proto::ResolvedIndexedEvent> for ResolvedEvent {
    fn from(resolved: proto::ResolvedIndexedEvent) -> Self {
        Self {
            event: resolved.event.map(RecordedEvent::from),
            link: resolved.link.map(RecordedEvent::from),
            position: None,
        }
    }
}

impl From<proto::ResolvedEventWire> for ResolvedEvent {
    fn from(resolved: proto::ResolvedEventWire) -> Self {
        Self {
            event: resolved.event.map(RecordedEvent::from),
            link: resolved.link.map(RecordedEvent::from),
            position: Some(Position::new(
                resolved.commit_position,
                resolved.prepare_position,
            )),
        }
    }
}

/// Result of a successful append or transaction commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub next_expected_version: i64,
    pub log_position: Position,
}

/// Result of a successful stream deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub log_position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceReadStatus {
    Success,
    StreamNotFound,
    StreamDeleted,
}

/// A bounded window of a single stream.
#[derive(Debug, Clone)]
pub struct StreamEventsSlice {
    pub status: SliceReadStatus,
    pub stream: String,
    pub from_event_number: i64,
    pub direction: ReadDirection,
    pub events: Vec<ResolvedEvent>,
    pub next_event_number: i64,
    pub last_event_number: i64,
    pub is_end_of_stream: bool,
}

/// A bounded window of the all-streams log.
#[derive(Debug, Clone)]
pub struct AllEventsSlice {
    pub direction: ReadDirection,
    pub from_position: Position,
    pub next_position: Position,
    pub events: Vec<ResolvedEvent>,
}

impl AllEventsSlice {
    pub fn is_end_of_stream(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventReadStatus {
    Success,
    NotFound,
    NoStream,
    StreamDeleted,
}

/// Result of reading a single event.
#[derive(Debug, Clone)]
pub struct EventReadResult {
    pub status: EventReadStatus,
    pub stream: String,
    pub event_number: i64,
    pub event: Option<ResolvedEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_version_wire_values() {
        assert_eq!(ExpectedVersion::NoStream.wire_value(), -1);
        assert_eq!(ExpectedVersion::Any.wire_value(), -2);
        assert_eq!(ExpectedVersion::StreamExists.wire_value(), -4);
        assert_eq!(ExpectedVersion::Exact(42).wire_value(), 42);
    }

    #[test]
    fn positions_order_by_commit_then_prepare() {
        assert!(Position::new(1, 0) > Position::new(0, 5));
        assert!(Position::new(1, 2) > Position::new(1, 1));
        assert!(Position::START < Position::new(0, 1));
    }

    #[test]
    fn original_event_prefers_the_link() {
        let target = RecordedEvent {
            stream_id: "orders-1".into(),
            event_number: 4,
            event_id: Uuid::new_v4(),
            event_type: "order-placed".into(),
            is_json: true,
            data: Bytes::new(),
            metadata: Bytes::new(),
            created_epoch_millis: 0,
        };
        let link = RecordedEvent {
            stream_id: "$by-category".into(),
            event_number: 9,
            ..target.clone()
        };
        let resolved = ResolvedEvent {
            event: Some(target),
            link: Some(link),
            position: None,
        };
        assert!(resolved.is_resolved());
        assert_eq!(resolved.original_stream_id(), "$by-category");
        assert_eq!(resolved.original_event_number(), 9);
    }
}
