// Byte-exact wire vectors. A mismatch here means an incompatible protocol
// change, not a refactor.
use bytes::Bytes;
use strom_wire::proto::{
    EXPECTED_VERSION_ANY, EXPECTED_VERSION_NO_STREAM, EXPECTED_VERSION_STREAM_EXISTS,
    POSITION_END, POSITION_START, SubscriptionConfirmation, WriteEvents,
};
use strom_wire::{Command, Credentials, FLAG_AUTHENTICATED, Package, frame_body};
use uuid::Uuid;

fn fixed_uuid() -> Uuid {
    Uuid::from_bytes([
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
        0x0F,
    ])
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len() % 2 == 0, "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| (from_hex_char(pair[0]) << 4) | from_hex_char(pair[1]))
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}

#[test]
fn heartbeat_package_bytes() {
    let package = Package::new(Command::HeartbeatRequest, fixed_uuid());
    let encoded = package.encode().expect("encode");
    // command, flags, then the 16 correlation bytes verbatim
    assert_eq!(
        encoded.as_ref(),
        hex_to_bytes("0100000102030405060708090a0b0c0d0e0f").as_slice()
    );
}

#[test]
fn authenticated_package_bytes() {
    let package = Package::new(Command::Authenticate, fixed_uuid())
        .with_credentials(Some(Credentials::new("admin", "changeit")));
    let encoded = package.encode().expect("encode");
    let expected = hex_to_bytes(concat!(
        "f2",                               // command
        "01",                               // auth flag
        "000102030405060708090a0b0c0d0e0f", // correlation id
        "0561646d696e",                     // len + "admin"
        "086368616e67656974",               // len + "changeit"
    ));
    assert_eq!(encoded[1], FLAG_AUTHENTICATED);
    assert_eq!(encoded.as_ref(), expected.as_slice());
}

#[test]
fn framed_package_prepends_little_endian_length() {
    let package = Package::new(Command::Ping, fixed_uuid());
    let body = package.encode().expect("encode");
    let framed = frame_body(body.clone()).expect("frame");
    assert_eq!(&framed[..4], (body.len() as u32).to_le_bytes());
    assert_eq!(&framed[4..], body.as_ref());
}

#[test]
fn expected_version_sentinels() {
    assert_eq!(EXPECTED_VERSION_NO_STREAM, -1);
    assert_eq!(EXPECTED_VERSION_ANY, -2);
    assert_eq!(EXPECTED_VERSION_STREAM_EXISTS, -4);
    assert_eq!(POSITION_START, (0, 0));
    assert_eq!(POSITION_END, (-1, -1));
}

#[test]
fn write_events_header_bytes() {
    let message = WriteEvents {
        event_stream_id: "s".to_string(),
        expected_version: EXPECTED_VERSION_ANY,
        require_master: true,
        events: Vec::new(),
    };
    let encoded = message.encode().expect("encode");
    let expected = hex_to_bytes(concat!(
        "010073",             // u16 len 1, "s"
        "feffffffffffffff",   // expected version -2, i64 LE
        "01",                 // require master
        "00000000",           // zero events
    ));
    assert_eq!(encoded.as_ref(), expected.as_slice());
}

#[test]
fn subscription_confirmation_bytes() {
    let message = SubscriptionConfirmation {
        last_commit_position: 1,
        last_event_number: -1,
    };
    let encoded = message.encode().expect("encode");
    let expected = hex_to_bytes("0100000000000000ffffffffffffffff");
    assert_eq!(encoded.as_ref(), expected.as_slice());
    let decoded = SubscriptionConfirmation::decode(Bytes::from(expected)).expect("decode");
    assert_eq!(decoded, message);
}
