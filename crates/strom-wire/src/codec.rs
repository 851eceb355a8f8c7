// Little-endian primitive codecs shared by package and payload encoders.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::{Error, Result};

pub(crate) fn ensure(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Incomplete);
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(get_u8(buf)? != 0)
}

pub(crate) fn get_u16(buf: &mut Bytes) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub(crate) fn get_i64(buf: &mut Bytes) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub(crate) fn get_uuid(buf: &mut Bytes) -> Result<Uuid> {
    ensure(buf, 16)?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_u16(buf)? as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8)
}

pub(crate) fn get_blob(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    ensure(buf, len)?;
    Ok(buf.split_to(len))
}

pub(crate) fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(value as u8);
}

pub(crate) fn put_uuid(buf: &mut BytesMut, value: &Uuid) {
    buf.put_slice(value.as_bytes());
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| Error::StringTooLong)?;
    buf.put_u16_le(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_blob(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| Error::FrameTooLarge {
        max: crate::MAX_FRAME_BYTES,
        got: value.len(),
    })?;
    buf.put_u32_le(len);
    buf.put_slice(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "stream-a").unwrap();
        let mut bytes = buf.freeze();
        assert_eq!(get_string(&mut bytes).unwrap(), "stream-a");
        assert!(bytes.is_empty());
    }

    #[test]
    fn truncated_blob_is_incomplete() {
        let mut buf = BytesMut::new();
        put_blob(&mut buf, b"payload").unwrap();
        let mut truncated = buf.freeze().slice(0..6);
        assert!(matches!(get_blob(&mut truncated), Err(Error::Incomplete)));
    }
}
