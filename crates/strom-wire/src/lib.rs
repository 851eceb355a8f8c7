// Wire format for framing correlated packages on the network.
use bytes::{BufMut, Bytes, BytesMut};

mod codec;
pub mod command;
pub mod package;
pub mod proto;

pub use command::Command;
pub use package::{Credentials, FLAG_AUTHENTICATED, FLAG_NONE, Package};

/// Hard ceiling for any single frame body, imposed by the server.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub const FRAME_PREFIX_LEN: usize = 4;

/// Largest read slice a server will serve in one response.
pub const MAX_READ_SIZE: i32 = 4096;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame too large: {got} bytes (cap {max})")]
    FrameTooLarge { max: usize, got: usize },
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown command tag 0x{0:02X}")]
    UnknownCommand(u8),
    #[error("unknown {what} value {value}")]
    UnknownEnumValue { what: &'static str, value: u8 },
    #[error("string field exceeds u16 length prefix")]
    StringTooLong,
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("credential field exceeds 255 bytes")]
    CredentialsTooLong,
}

/// Prepend the little-endian length prefix to an encoded package body.
///
/// ```
/// use strom_wire::{frame_body, FRAME_PREFIX_LEN};
///
/// let framed = frame_body(bytes::Bytes::from_static(b"abc")).expect("frame");
/// assert_eq!(&framed[..FRAME_PREFIX_LEN], &3u32.to_le_bytes());
/// assert_eq!(&framed[FRAME_PREFIX_LEN..], b"abc");
/// ```
pub fn frame_body(body: Bytes) -> Result<Bytes> {
    if body.len() > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge {
            max: MAX_FRAME_BYTES,
            got: body.len(),
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

/// Read the length prefix of the next frame. Validate before trusting it.
pub fn decode_frame_len(prefix: [u8; FRAME_PREFIX_LEN]) -> Result<usize> {
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge {
            max: MAX_FRAME_BYTES,
            got: len,
        });
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let framed = frame_body(Bytes::from_static(b"hello")).expect("frame");
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        prefix.copy_from_slice(&framed[..FRAME_PREFIX_LEN]);
        let len = decode_frame_len(prefix).expect("len");
        assert_eq!(len, 5);
        assert_eq!(&framed[FRAME_PREFIX_LEN..], b"hello");
    }

    #[test]
    fn oversize_length_prefix_is_rejected() {
        let prefix = ((MAX_FRAME_BYTES + 1) as u32).to_le_bytes();
        let err = decode_frame_len(prefix).expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge { .. }));
    }
}
