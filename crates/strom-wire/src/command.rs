// Closed set of one-byte command tags.
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    HeartbeatRequest = 0x01,
    HeartbeatResponse = 0x02,
    Ping = 0x03,
    Pong = 0x04,

    WriteEvents = 0x82,
    WriteEventsCompleted = 0x83,
    TransactionStart = 0x84,
    TransactionStartCompleted = 0x85,
    TransactionWrite = 0x86,
    TransactionWriteCompleted = 0x87,
    TransactionCommit = 0x88,
    TransactionCommitCompleted = 0x89,
    DeleteStream = 0x8A,
    DeleteStreamCompleted = 0x8B,

    ReadEvent = 0xB0,
    ReadEventCompleted = 0xB1,
    ReadStreamEventsForward = 0xB2,
    ReadStreamEventsForwardCompleted = 0xB3,
    ReadStreamEventsBackward = 0xB4,
    ReadStreamEventsBackwardCompleted = 0xB5,
    ReadAllEventsForward = 0xB6,
    ReadAllEventsForwardCompleted = 0xB7,
    ReadAllEventsBackward = 0xB8,
    ReadAllEventsBackwardCompleted = 0xB9,

    SubscribeToStream = 0xC0,
    SubscriptionConfirmation = 0xC1,
    StreamEventAppeared = 0xC2,
    UnsubscribeFromStream = 0xC3,
    SubscriptionDropped = 0xC4,
    ConnectToPersistentSubscription = 0xC5,
    PersistentSubscriptionConfirmation = 0xC6,
    PersistentSubscriptionStreamEventAppeared = 0xC7,
    CreatePersistentSubscription = 0xC8,
    CreatePersistentSubscriptionCompleted = 0xC9,
    DeletePersistentSubscription = 0xCA,
    DeletePersistentSubscriptionCompleted = 0xCB,
    PersistentSubscriptionAckEvents = 0xCC,
    PersistentSubscriptionNakEvents = 0xCD,
    UpdatePersistentSubscription = 0xCE,
    UpdatePersistentSubscriptionCompleted = 0xCF,

    BadRequest = 0xF0,
    NotHandled = 0xF1,
    Authenticate = 0xF2,
    Authenticated = 0xF3,
    NotAuthenticated = 0xF4,
}

impl Command {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn parse(raw: u8) -> Result<Self, Error> {
        let command = match raw {
            0x01 => Command::HeartbeatRequest,
            0x02 => Command::HeartbeatResponse,
            0x03 => Command::Ping,
            0x04 => Command::Pong,
            0x82 => Command::WriteEvents,
            0x83 => Command::WriteEventsCompleted,
            0x84 => Command::TransactionStart,
            0x85 => Command::TransactionStartCompleted,
            0x86 => Command::TransactionWrite,
            0x87 => Command::TransactionWriteCompleted,
            0x88 => Command::TransactionCommit,
            0x89 => Command::TransactionCommitCompleted,
            0x8A => Command::DeleteStream,
            0x8B => Command::DeleteStreamCompleted,
            0xB0 => Command::ReadEvent,
            0xB1 => Command::ReadEventCompleted,
            0xB2 => Command::ReadStreamEventsForward,
            0xB3 => Command::ReadStreamEventsForwardCompleted,
            0xB4 => Command::ReadStreamEventsBackward,
            0xB5 => Command::ReadStreamEventsBackwardCompleted,
            0xB6 => Command::ReadAllEventsForward,
            0xB7 => Command::ReadAllEventsForwardCompleted,
            0xB8 => Command::ReadAllEventsBackward,
            0xB9 => Command::ReadAllEventsBackwardCompleted,
            0xC0 => Command::SubscribeToStream,
            0xC1 => Command::SubscriptionConfirmation,
            0xC2 => Command::StreamEventAppeared,
            0xC3 => Command::UnsubscribeFromStream,
            0xC4 => Command::SubscriptionDropped,
            0xC5 => Command::ConnectToPersistentSubscription,
            0xC6 => Command::PersistentSubscriptionConfirmation,
            0xC7 => Command::PersistentSubscriptionStreamEventAppeared,
            0xC8 => Command::CreatePersistentSubscription,
            0xC9 => Command::CreatePersistentSubscriptionCompleted,
            0xCA => Command::DeletePersistentSubscription,
            0xCB => Command::DeletePersistentSubscriptionCompleted,
            0xCC => Command::PersistentSubscriptionAckEvents,
            0xCD => Command::PersistentSubscriptionNakEvents,
            0xCE => Command::UpdatePersistentSubscription,
            0xCF => Command::UpdatePersistentSubscriptionCompleted,
            0xF0 => Command::BadRequest,
            0xF1 => Command::NotHandled,
            0xF2 => Command::Authenticate,
            0xF3 => Command::Authenticated,
            0xF4 => Command::NotAuthenticated,
            other => return Err(Error::UnknownCommand(other)),
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tag_parses_back() {
        for raw in 0u8..=0xFF {
            if let Ok(command) = Command::parse(raw) {
                assert_eq!(command.as_u8(), raw);
            }
        }
        assert_eq!(Command::parse(0x82).unwrap(), Command::WriteEvents);
        assert!(Command::parse(0x7F).is_err());
    }
}
