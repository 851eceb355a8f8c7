//! Payload message schemas for every operation the protocol carries.
//!
//! All encodings are little-endian: strings are u16-length-prefixed UTF-8,
//! byte blobs u32-length-prefixed, vectors u32-count-prefixed, options
//! flagged by a presence byte.
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::{
    get_blob, get_bool, get_i32, get_i64, get_string, get_u8, get_u16, get_u32, get_u64, get_uuid,
    put_blob, put_bool, put_string, put_uuid,
};
use crate::{Error, Result};

/// Expected-version sentinels as they appear on the wire.
pub const EXPECTED_VERSION_NO_STREAM: i64 = -1;
pub const EXPECTED_VERSION_ANY: i64 = -2;
pub const EXPECTED_VERSION_STREAM_EXISTS: i64 = -4;

/// Position sentinels for the all-streams log.
pub const POSITION_START: (i64, i64) = (0, 0);
pub const POSITION_END: (i64, i64) = (-1, -1);

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn as_u8(self) -> u8 {
                self as u8
            }

            pub fn parse(raw: u8) -> Result<Self> {
                match raw {
                    $($value => Ok($name::$variant),)+
                    value => Err(Error::UnknownEnumValue {
                        what: stringify!($name),
                        value,
                    }),
                }
            }
        }
    };
}

wire_enum! {
    /// Outcome of a write-shaped operation. The three timeout variants are
    /// retriable; the rest are terminal.
    OperationResult {
        Success = 0,
        PrepareTimeout = 1,
        CommitTimeout = 2,
        ForwardTimeout = 3,
        WrongExpectedVersion = 4,
        StreamDeleted = 5,
        InvalidTransaction = 6,
        AccessDenied = 7,
    }
}

wire_enum! {
    ReadEventStatus {
        Success = 0,
        NotFound = 1,
        NoStream = 2,
        StreamDeleted = 3,
        Error = 4,
        AccessDenied = 5,
    }
}

wire_enum! {
    ReadStreamStatus {
        Success = 0,
        NoStream = 1,
        StreamDeleted = 2,
        NotModified = 3,
        Error = 4,
        AccessDenied = 5,
    }
}

wire_enum! {
    ReadAllStatus {
        Success = 0,
        NotModified = 1,
        Error = 2,
        AccessDenied = 3,
    }
}

wire_enum! {
    DropReason {
        Unsubscribed = 0,
        AccessDenied = 1,
        NotFound = 2,
        PersistentSubscriptionDeleted = 3,
        SubscriberMaxCountReached = 4,
    }
}

wire_enum! {
    NotHandledReason {
        NotReady = 0,
        TooBusy = 1,
        NotMaster = 2,
    }
}

wire_enum! {
    NakAction {
        Unknown = 0,
        Park = 1,
        Retry = 2,
        Skip = 3,
        Stop = 4,
    }
}

wire_enum! {
    CreatePersistentResult {
        Success = 0,
        AlreadyExists = 1,
        Fail = 2,
        AccessDenied = 3,
    }
}

wire_enum! {
    UpdatePersistentResult {
        Success = 0,
        DoesNotExist = 1,
        Fail = 2,
        AccessDenied = 3,
    }
}

wire_enum! {
    DeletePersistentResult {
        Success = 0,
        DoesNotExist = 1,
        Fail = 2,
        AccessDenied = 3,
    }
}

wire_enum! {
    ConsumerStrategy {
        DispatchToSingle = 0,
        RoundRobin = 1,
        Pinned = 2,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
}

impl NewEvent {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        put_uuid(buf, &self.event_id);
        put_string(buf, &self.event_type)?;
        put_bool(buf, self.is_json);
        put_blob(buf, &self.data)?;
        put_blob(buf, &self.metadata)
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            event_id: get_uuid(buf)?,
            event_type: get_string(buf)?,
            is_json: get_bool(buf)?,
            data: get_blob(buf)?,
            metadata: get_blob(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event_stream_id: String,
    pub event_number: i64,
    pub event_id: Uuid,
    pub event_type: String,
    pub is_json: bool,
    pub data: Bytes,
    pub metadata: Bytes,
    pub created_epoch_millis: i64,
}

impl EventRecord {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        put_string(buf, &self.event_stream_id)?;
        buf.put_i64_le(self.event_number);
        put_uuid(buf, &self.event_id);
        put_string(buf, &self.event_type)?;
        put_bool(buf, self.is_json);
        put_blob(buf, &self.data)?;
        put_blob(buf, &self.metadata)?;
        buf.put_i64_le(self.created_epoch_millis);
        Ok(())
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            event_stream_id: get_string(buf)?,
            event_number: get_i64(buf)?,
            event_id: get_uuid(buf)?,
            event_type: get_string(buf)?,
            is_json: get_bool(buf)?,
            data: get_blob(buf)?,
            metadata: get_blob(buf)?,
            created_epoch_millis: get_i64(buf)?,
        })
    }
}

fn write_optional_record(buf: &mut BytesMut, record: &Option<EventRecord>) -> Result<()> {
    match record {
        Some(record) => {
            buf.put_u8(1);
            record.write(buf)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn read_optional_record(buf: &mut Bytes) -> Result<Option<EventRecord>> {
    if get_bool(buf)? {
        Ok(Some(EventRecord::read(buf)?))
    } else {
        Ok(None)
    }
}

/// A possibly link-resolved event as returned by stream reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIndexedEvent {
    pub event: Option<EventRecord>,
    pub link: Option<EventRecord>,
}

impl ResolvedIndexedEvent {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_optional_record(buf, &self.event)?;
        write_optional_record(buf, &self.link)
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            event: read_optional_record(buf)?,
            link: read_optional_record(buf)?,
        })
    }
}

/// A resolved event carrying its position in the all-streams log; used by
/// all-streams reads and subscription pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEventWire {
    pub event: Option<EventRecord>,
    pub link: Option<EventRecord>,
    pub commit_position: i64,
    pub prepare_position: i64,
}

impl ResolvedEventWire {
    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_optional_record(buf, &self.event)?;
        write_optional_record(buf, &self.link)?;
        buf.put_i64_le(self.commit_position);
        buf.put_i64_le(self.prepare_position);
        Ok(())
    }

    fn read(buf: &mut Bytes) -> Result<Self> {
        Ok(Self {
            event: read_optional_record(buf)?,
            link: read_optional_record(buf)?,
            commit_position: get_i64(buf)?,
            prepare_position: get_i64(buf)?,
        })
    }
}

fn write_events(buf: &mut BytesMut, events: &[NewEvent]) -> Result<()> {
    buf.put_u32_le(events.len() as u32);
    for event in events {
        event.write(buf)?;
    }
    Ok(())
}

fn read_events(buf: &mut Bytes) -> Result<Vec<NewEvent>> {
    let count = get_u32(buf)? as usize;
    let mut events = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        events.push(NewEvent::read(buf)?);
    }
    Ok(events)
}

macro_rules! message {
    ($(#[$meta:meta])* $name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub struct $name {
            $(pub $field: $ty),*
        }
    };
}

message! {
    WriteEvents {
        event_stream_id: String,
        expected_version: i64,
        require_master: bool,
        events: Vec<NewEvent>,
    }
}

impl WriteEvents {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.event_stream_id)?;
        buf.put_i64_le(self.expected_version);
        put_bool(&mut buf, self.require_master);
        write_events(&mut buf, &self.events)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            event_stream_id: get_string(&mut input)?,
            expected_version: get_i64(&mut input)?,
            require_master: get_bool(&mut input)?,
            events: read_events(&mut input)?,
        })
    }
}

message! {
    WriteEventsCompleted {
        result: OperationResult,
        message: String,
        first_event_number: i64,
        last_event_number: i64,
        prepare_position: i64,
        commit_position: i64,
    }
}

impl WriteEventsCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.result.as_u8());
        put_string(&mut buf, &self.message)?;
        buf.put_i64_le(self.first_event_number);
        buf.put_i64_le(self.last_event_number);
        buf.put_i64_le(self.prepare_position);
        buf.put_i64_le(self.commit_position);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            result: OperationResult::parse(get_u8(&mut input)?)?,
            message: get_string(&mut input)?,
            first_event_number: get_i64(&mut input)?,
            last_event_number: get_i64(&mut input)?,
            prepare_position: get_i64(&mut input)?,
            commit_position: get_i64(&mut input)?,
        })
    }
}

message! {
    DeleteStream {
        event_stream_id: String,
        expected_version: i64,
        require_master: bool,
        hard_delete: bool,
    }
}

impl DeleteStream {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.event_stream_id)?;
        buf.put_i64_le(self.expected_version);
        put_bool(&mut buf, self.require_master);
        put_bool(&mut buf, self.hard_delete);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            event_stream_id: get_string(&mut input)?,
            expected_version: get_i64(&mut input)?,
            require_master: get_bool(&mut input)?,
            hard_delete: get_bool(&mut input)?,
        })
    }
}

message! {
    DeleteStreamCompleted {
        result: OperationResult,
        message: String,
        prepare_position: i64,
        commit_position: i64,
    }
}

impl DeleteStreamCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.result.as_u8());
        put_string(&mut buf, &self.message)?;
        buf.put_i64_le(self.prepare_position);
        buf.put_i64_le(self.commit_position);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            result: OperationResult::parse(get_u8(&mut input)?)?,
            message: get_string(&mut input)?,
            prepare_position: get_i64(&mut input)?,
            commit_position: get_i64(&mut input)?,
        })
    }
}

message! {
    TransactionStart {
        event_stream_id: String,
        expected_version: i64,
        require_master: bool,
    }
}

impl TransactionStart {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.event_stream_id)?;
        buf.put_i64_le(self.expected_version);
        put_bool(&mut buf, self.require_master);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            event_stream_id: get_string(&mut input)?,
            expected_version: get_i64(&mut input)?,
            require_master: get_bool(&mut input)?,
        })
    }
}

message! {
    TransactionStartCompleted {
        transaction_id: u64,
        result: OperationResult,
        message: String,
    }
}

impl TransactionStartCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.transaction_id);
        buf.put_u8(self.result.as_u8());
        put_string(&mut buf, &self.message)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            transaction_id: get_u64(&mut input)?,
            result: OperationResult::parse(get_u8(&mut input)?)?,
            message: get_string(&mut input)?,
        })
    }
}

message! {
    TransactionWrite {
        transaction_id: u64,
        require_master: bool,
        events: Vec<NewEvent>,
    }
}

impl TransactionWrite {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.transaction_id);
        put_bool(&mut buf, self.require_master);
        write_events(&mut buf, &self.events)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            transaction_id: get_u64(&mut input)?,
            require_master: get_bool(&mut input)?,
            events: read_events(&mut input)?,
        })
    }
}

message! {
    TransactionWriteCompleted {
        transaction_id: u64,
        result: OperationResult,
        message: String,
    }
}

impl TransactionWriteCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.transaction_id);
        buf.put_u8(self.result.as_u8());
        put_string(&mut buf, &self.message)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            transaction_id: get_u64(&mut input)?,
            result: OperationResult::parse(get_u8(&mut input)?)?,
            message: get_string(&mut input)?,
        })
    }
}

message! {
    TransactionCommit {
        transaction_id: u64,
        require_master: bool,
    }
}

impl TransactionCommit {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.transaction_id);
        put_bool(&mut buf, self.require_master);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            transaction_id: get_u64(&mut input)?,
            require_master: get_bool(&mut input)?,
        })
    }
}

message! {
    TransactionCommitCompleted {
        transaction_id: u64,
        result: OperationResult,
        message: String,
        first_event_number: i64,
        last_event_number: i64,
        prepare_position: i64,
        commit_position: i64,
    }
}

impl TransactionCommitCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(self.transaction_id);
        buf.put_u8(self.result.as_u8());
        put_string(&mut buf, &self.message)?;
        buf.put_i64_le(self.first_event_number);
        buf.put_i64_le(self.last_event_number);
        buf.put_i64_le(self.prepare_position);
        buf.put_i64_le(self.commit_position);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            transaction_id: get_u64(&mut input)?,
            result: OperationResult::parse(get_u8(&mut input)?)?,
            message: get_string(&mut input)?,
            first_event_number: get_i64(&mut input)?,
            last_event_number: get_i64(&mut input)?,
            prepare_position: get_i64(&mut input)?,
            commit_position: get_i64(&mut input)?,
        })
    }
}

message! {
    ReadEvent {
        event_stream_id: String,
        event_number: i64,
        resolve_link_tos: bool,
        require_master: bool,
    }
}

impl ReadEvent {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.event_stream_id)?;
        buf.put_i64_le(self.event_number);
        put_bool(&mut buf, self.resolve_link_tos);
        put_bool(&mut buf, self.require_master);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            event_stream_id: get_string(&mut input)?,
            event_number: get_i64(&mut input)?,
            resolve_link_tos: get_bool(&mut input)?,
            require_master: get_bool(&mut input)?,
        })
    }
}

message! {
    ReadEventCompleted {
        result: ReadEventStatus,
        event: ResolvedIndexedEvent,
        error: String,
    }
}

impl ReadEventCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.result.as_u8());
        self.event.write(&mut buf)?;
        put_string(&mut buf, &self.error)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            result: ReadEventStatus::parse(get_u8(&mut input)?)?,
            event: ResolvedIndexedEvent::read(&mut input)?,
            error: get_string(&mut input)?,
        })
    }
}

message! {
    /// Shared by the forward and backward stream reads; the direction lives
    /// in the command tag.
    ReadStreamEvents {
        event_stream_id: String,
        from_event_number: i64,
        max_count: i32,
        resolve_link_tos: bool,
        require_master: bool,
    }
}

impl ReadStreamEvents {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.event_stream_id)?;
        buf.put_i64_le(self.from_event_number);
        buf.put_i32_le(self.max_count);
        put_bool(&mut buf, self.resolve_link_tos);
        put_bool(&mut buf, self.require_master);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            event_stream_id: get_string(&mut input)?,
            from_event_number: get_i64(&mut input)?,
            max_count: get_i32(&mut input)?,
            resolve_link_tos: get_bool(&mut input)?,
            require_master: get_bool(&mut input)?,
        })
    }
}

message! {
    ReadStreamEventsCompleted {
        result: ReadStreamStatus,
        events: Vec<ResolvedIndexedEvent>,
        next_event_number: i64,
        last_event_number: i64,
        is_end_of_stream: bool,
        last_commit_position: i64,
        error: String,
    }
}

impl ReadStreamEventsCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.result.as_u8());
        buf.put_u32_le(self.events.len() as u32);
        for event in &self.events {
            event.write(&mut buf)?;
        }
        buf.put_i64_le(self.next_event_number);
        buf.put_i64_le(self.last_event_number);
        put_bool(&mut buf, self.is_end_of_stream);
        buf.put_i64_le(self.last_commit_position);
        put_string(&mut buf, &self.error)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        let result = ReadStreamStatus::parse(get_u8(&mut input)?)?;
        let count = get_u32(&mut input)? as usize;
        let mut events = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            events.push(ResolvedIndexedEvent::read(&mut input)?);
        }
        Ok(Self {
            result,
            events,
            next_event_number: get_i64(&mut input)?,
            last_event_number: get_i64(&mut input)?,
            is_end_of_stream: get_bool(&mut input)?,
            last_commit_position: get_i64(&mut input)?,
            error: get_string(&mut input)?,
        })
    }
}

message! {
    ReadAllEvents {
        commit_position: i64,
        prepare_position: i64,
        max_count: i32,
        resolve_link_tos: bool,
        require_master: bool,
    }
}

impl ReadAllEvents {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_i64_le(self.commit_position);
        buf.put_i64_le(self.prepare_position);
        buf.put_i32_le(self.max_count);
        put_bool(&mut buf, self.resolve_link_tos);
        put_bool(&mut buf, self.require_master);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            commit_position: get_i64(&mut input)?,
            prepare_position: get_i64(&mut input)?,
            max_count: get_i32(&mut input)?,
            resolve_link_tos: get_bool(&mut input)?,
            require_master: get_bool(&mut input)?,
        })
    }
}

message! {
    ReadAllEventsCompleted {
        result: ReadAllStatus,
        commit_position: i64,
        prepare_position: i64,
        events: Vec<ResolvedEventWire>,
        next_commit_position: i64,
        next_prepare_position: i64,
        error: String,
    }
}

impl ReadAllEventsCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.result.as_u8());
        buf.put_i64_le(self.commit_position);
        buf.put_i64_le(self.prepare_position);
        buf.put_u32_le(self.events.len() as u32);
        for event in &self.events {
            event.write(&mut buf)?;
        }
        buf.put_i64_le(self.next_commit_position);
        buf.put_i64_le(self.next_prepare_position);
        put_string(&mut buf, &self.error)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        let result = ReadAllStatus::parse(get_u8(&mut input)?)?;
        let commit_position = get_i64(&mut input)?;
        let prepare_position = get_i64(&mut input)?;
        let count = get_u32(&mut input)? as usize;
        let mut events = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            events.push(ResolvedEventWire::read(&mut input)?);
        }
        Ok(Self {
            result,
            commit_position,
            prepare_position,
            events,
            next_commit_position: get_i64(&mut input)?,
            next_prepare_position: get_i64(&mut input)?,
            error: get_string(&mut input)?,
        })
    }
}

message! {
    /// An empty stream id subscribes to the all-streams log. The resume-after
    /// fields let a re-established subscription continue where the previous
    /// channel left off; fresh subscriptions send the -1 sentinels.
    SubscribeToStream {
        event_stream_id: String,
        resolve_link_tos: bool,
        resume_after_event_number: i64,
        resume_after_commit_position: i64,
        resume_after_prepare_position: i64,
    }
}

impl SubscribeToStream {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.event_stream_id)?;
        put_bool(&mut buf, self.resolve_link_tos);
        buf.put_i64_le(self.resume_after_event_number);
        buf.put_i64_le(self.resume_after_commit_position);
        buf.put_i64_le(self.resume_after_prepare_position);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            event_stream_id: get_string(&mut input)?,
            resolve_link_tos: get_bool(&mut input)?,
            resume_after_event_number: get_i64(&mut input)?,
            resume_after_commit_position: get_i64(&mut input)?,
            resume_after_prepare_position: get_i64(&mut input)?,
        })
    }
}

message! {
    SubscriptionConfirmation {
        last_commit_position: i64,
        last_event_number: i64,
    }
}

impl SubscriptionConfirmation {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_i64_le(self.last_commit_position);
        buf.put_i64_le(self.last_event_number);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            last_commit_position: get_i64(&mut input)?,
            last_event_number: get_i64(&mut input)?,
        })
    }
}

message! {
    StreamEventAppeared {
        event: ResolvedEventWire,
    }
}

impl StreamEventAppeared {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.event.write(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            event: ResolvedEventWire::read(&mut input)?,
        })
    }
}

message! {
    SubscriptionDropped {
        reason: DropReason,
    }
}

impl SubscriptionDropped {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.reason.as_u8());
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            reason: DropReason::parse(get_u8(&mut input)?)?,
        })
    }
}

message! {
    ConnectToPersistentSubscription {
        subscription_id: String,
        event_stream_id: String,
        allowed_in_flight_messages: i32,
    }
}

impl ConnectToPersistentSubscription {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.subscription_id)?;
        put_string(&mut buf, &self.event_stream_id)?;
        buf.put_i32_le(self.allowed_in_flight_messages);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            subscription_id: get_string(&mut input)?,
            event_stream_id: get_string(&mut input)?,
            allowed_in_flight_messages: get_i32(&mut input)?,
        })
    }
}

message! {
    PersistentSubscriptionConfirmation {
        last_commit_position: i64,
        subscription_id: String,
        last_event_number: i64,
    }
}

impl PersistentSubscriptionConfirmation {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_i64_le(self.last_commit_position);
        put_string(&mut buf, &self.subscription_id)?;
        buf.put_i64_le(self.last_event_number);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            last_commit_position: get_i64(&mut input)?,
            subscription_id: get_string(&mut input)?,
            last_event_number: get_i64(&mut input)?,
        })
    }
}

message! {
    PersistentSubscriptionStreamEventAppeared {
        event: ResolvedIndexedEvent,
        retry_count: i32,
    }
}

impl PersistentSubscriptionStreamEventAppeared {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.event.write(&mut buf)?;
        buf.put_i32_le(self.retry_count);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            event: ResolvedIndexedEvent::read(&mut input)?,
            retry_count: get_i32(&mut input)?,
        })
    }
}

fn write_uuids(buf: &mut BytesMut, ids: &[Uuid]) {
    buf.put_u32_le(ids.len() as u32);
    for id in ids {
        put_uuid(buf, id);
    }
}

fn read_uuids(buf: &mut Bytes) -> Result<Vec<Uuid>> {
    let count = get_u32(buf)? as usize;
    let mut ids = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        ids.push(get_uuid(buf)?);
    }
    Ok(ids)
}

message! {
    PersistentSubscriptionAckEvents {
        subscription_id: String,
        processed_event_ids: Vec<Uuid>,
    }
}

impl PersistentSubscriptionAckEvents {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.subscription_id)?;
        write_uuids(&mut buf, &self.processed_event_ids);
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            subscription_id: get_string(&mut input)?,
            processed_event_ids: read_uuids(&mut input)?,
        })
    }
}

message! {
    PersistentSubscriptionNakEvents {
        subscription_id: String,
        processed_event_ids: Vec<Uuid>,
        action: NakAction,
        message: String,
    }
}

impl PersistentSubscriptionNakEvents {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.subscription_id)?;
        write_uuids(&mut buf, &self.processed_event_ids);
        buf.put_u8(self.action.as_u8());
        put_string(&mut buf, &self.message)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            subscription_id: get_string(&mut input)?,
            processed_event_ids: read_uuids(&mut input)?,
            action: NakAction::parse(get_u8(&mut input)?)?,
            message: get_string(&mut input)?,
        })
    }
}

message! {
    /// Server-side group configuration, shared by create and update.
    PersistentSubscriptionParams {
        subscription_group_name: String,
        event_stream_id: String,
        resolve_link_tos: bool,
        start_from: i64,
        message_timeout_millis: i32,
        live_buffer_size: i32,
        read_batch_size: i32,
        history_buffer_size: i32,
        max_retry_count: i32,
        checkpoint_after_millis: i32,
        checkpoint_min_count: i32,
        checkpoint_max_count: i32,
        subscriber_max_count: i32,
        consumer_strategy: ConsumerStrategy,
    }
}

impl PersistentSubscriptionParams {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.subscription_group_name)?;
        put_string(&mut buf, &self.event_stream_id)?;
        put_bool(&mut buf, self.resolve_link_tos);
        buf.put_i64_le(self.start_from);
        buf.put_i32_le(self.message_timeout_millis);
        buf.put_i32_le(self.live_buffer_size);
        buf.put_i32_le(self.read_batch_size);
        buf.put_i32_le(self.history_buffer_size);
        buf.put_i32_le(self.max_retry_count);
        buf.put_i32_le(self.checkpoint_after_millis);
        buf.put_i32_le(self.checkpoint_min_count);
        buf.put_i32_le(self.checkpoint_max_count);
        buf.put_i32_le(self.subscriber_max_count);
        buf.put_u8(self.consumer_strategy.as_u8());
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            subscription_group_name: get_string(&mut input)?,
            event_stream_id: get_string(&mut input)?,
            resolve_link_tos: get_bool(&mut input)?,
            start_from: get_i64(&mut input)?,
            message_timeout_millis: get_i32(&mut input)?,
            live_buffer_size: get_i32(&mut input)?,
            read_batch_size: get_i32(&mut input)?,
            history_buffer_size: get_i32(&mut input)?,
            max_retry_count: get_i32(&mut input)?,
            checkpoint_after_millis: get_i32(&mut input)?,
            checkpoint_min_count: get_i32(&mut input)?,
            checkpoint_max_count: get_i32(&mut input)?,
            subscriber_max_count: get_i32(&mut input)?,
            consumer_strategy: ConsumerStrategy::parse(get_u8(&mut input)?)?,
        })
    }
}

message! {
    CreatePersistentSubscriptionCompleted {
        result: CreatePersistentResult,
        reason: String,
    }
}

impl CreatePersistentSubscriptionCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.result.as_u8());
        put_string(&mut buf, &self.reason)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            result: CreatePersistentResult::parse(get_u8(&mut input)?)?,
            reason: get_string(&mut input)?,
        })
    }
}

message! {
    UpdatePersistentSubscriptionCompleted {
        result: UpdatePersistentResult,
        reason: String,
    }
}

impl UpdatePersistentSubscriptionCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.result.as_u8());
        put_string(&mut buf, &self.reason)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            result: UpdatePersistentResult::parse(get_u8(&mut input)?)?,
            reason: get_string(&mut input)?,
        })
    }
}

message! {
    DeletePersistentSubscription {
        subscription_group_name: String,
        event_stream_id: String,
    }
}

impl DeletePersistentSubscription {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.subscription_group_name)?;
        put_string(&mut buf, &self.event_stream_id)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            subscription_group_name: get_string(&mut input)?,
            event_stream_id: get_string(&mut input)?,
        })
    }
}

message! {
    DeletePersistentSubscriptionCompleted {
        result: DeletePersistentResult,
        reason: String,
    }
}

impl DeletePersistentSubscriptionCompleted {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.result.as_u8());
        put_string(&mut buf, &self.reason)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        Ok(Self {
            result: DeletePersistentResult::parse(get_u8(&mut input)?)?,
            reason: get_string(&mut input)?,
        })
    }
}

message! {
    /// Why the server refused to handle an operation. A NotMaster refusal
    /// carries the endpoint the client must reconnect to.
    NotHandled {
        reason: NotHandledReason,
        master_endpoint: Option<MasterEndpoint>,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterEndpoint {
    pub host: String,
    pub port: u16,
}

impl NotHandled {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.reason.as_u8());
        match &self.master_endpoint {
            Some(endpoint) => {
                buf.put_u8(1);
                put_string(&mut buf, &endpoint.host)?;
                buf.put_u16_le(endpoint.port);
            }
            None => buf.put_u8(0),
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut input: Bytes) -> Result<Self> {
        let reason = NotHandledReason::parse(get_u8(&mut input)?)?;
        let master_endpoint = if get_bool(&mut input)? {
            Some(MasterEndpoint {
                host: get_string(&mut input)?,
                port: get_u16(&mut input)?,
            })
        } else {
            None
        };
        Ok(Self {
            reason,
            master_endpoint,
        })
    }
}

/// BadRequest and NotAuthenticated payloads are plain UTF-8 text.
pub fn text_payload(input: &Bytes) -> String {
    String::from_utf8_lossy(input).into_owned()
}

pub fn encode_text_payload(text: &str) -> Bytes {
    Bytes::copy_from_slice(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stream: &str, number: i64) -> EventRecord {
        EventRecord {
            event_stream_id: stream.to_string(),
            event_number: number,
            event_id: Uuid::new_v4(),
            event_type: "order-placed".to_string(),
            is_json: true,
            data: Bytes::from_static(b"{\"qty\":1}"),
            metadata: Bytes::new(),
            created_epoch_millis: 1_700_000_000_000,
        }
    }

    #[test]
    fn write_events_round_trip() {
        let message = WriteEvents {
            event_stream_id: "orders-1".to_string(),
            expected_version: EXPECTED_VERSION_NO_STREAM,
            require_master: true,
            events: vec![NewEvent {
                event_id: Uuid::new_v4(),
                event_type: "order-placed".to_string(),
                is_json: true,
                data: Bytes::from_static(b"{}"),
                metadata: Bytes::from_static(b"meta"),
            }],
        };
        let decoded = WriteEvents::decode(message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn read_stream_completed_round_trip() {
        let message = ReadStreamEventsCompleted {
            result: ReadStreamStatus::Success,
            events: vec![ResolvedIndexedEvent {
                event: Some(record("orders-1", 0)),
                link: None,
            }],
            next_event_number: 1,
            last_event_number: 0,
            is_end_of_stream: true,
            last_commit_position: 128,
            error: String::new(),
        };
        let decoded = ReadStreamEventsCompleted::decode(message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn read_all_completed_round_trip() {
        let message = ReadAllEventsCompleted {
            result: ReadAllStatus::Success,
            commit_position: 256,
            prepare_position: 256,
            events: vec![ResolvedEventWire {
                event: Some(record("orders-1", 3)),
                link: Some(record("index-a", 7)),
                commit_position: 256,
                prepare_position: 256,
            }],
            next_commit_position: 384,
            next_prepare_position: 384,
            error: String::new(),
        };
        let decoded = ReadAllEventsCompleted::decode(message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn not_handled_round_trip_with_master() {
        let message = NotHandled {
            reason: NotHandledReason::NotMaster,
            master_endpoint: Some(MasterEndpoint {
                host: "10.0.0.7".to_string(),
                port: 1113,
            }),
        };
        let decoded = NotHandled::decode(message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn nak_events_round_trip() {
        let message = PersistentSubscriptionNakEvents {
            subscription_id: "orders::workers".to_string(),
            processed_event_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            action: NakAction::Retry,
            message: "handler failed".to_string(),
        };
        let decoded = PersistentSubscriptionNakEvents::decode(message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn unknown_enum_value_is_an_error() {
        let err = OperationResult::parse(42).unwrap_err();
        assert!(matches!(err, Error::UnknownEnumValue { .. }));
    }

    #[test]
    fn truncated_completed_is_incomplete() {
        let message = WriteEventsCompleted {
            result: OperationResult::Success,
            message: String::new(),
            first_event_number: 0,
            last_event_number: 0,
            prepare_position: 10,
            commit_position: 10,
        };
        let encoded = message.encode().unwrap();
        let truncated = encoded.slice(0..encoded.len() - 4);
        assert!(matches!(
            WriteEventsCompleted::decode(truncated),
            Err(Error::Incomplete)
        ));
    }
}
