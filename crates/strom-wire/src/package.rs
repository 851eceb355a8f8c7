// A package is one unit of correlated wire traffic.
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::{ensure, get_u8, get_uuid, put_uuid};
use crate::{Command, Error, Result};

pub const FLAG_NONE: u8 = 0x00;
pub const FLAG_AUTHENTICATED: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

/// Package body: {command, flags, correlation id, optional credentials, payload}.
///
/// ```
/// use strom_wire::{Command, Package};
/// use uuid::Uuid;
///
/// let package = Package::new(Command::Ping, Uuid::new_v4());
/// let decoded = Package::decode(package.encode().expect("encode")).expect("decode");
/// assert_eq!(decoded.command, Command::Ping);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub command: Command,
    pub correlation_id: Uuid,
    pub credentials: Option<Credentials>,
    pub payload: Bytes,
}

impl Package {
    pub fn new(command: Command, correlation_id: Uuid) -> Self {
        Self {
            command,
            correlation_id,
            credentials: None,
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Encode the package body (without the frame length prefix).
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(18 + self.payload.len());
        buf.put_u8(self.command.as_u8());
        buf.put_u8(if self.credentials.is_some() {
            FLAG_AUTHENTICATED
        } else {
            FLAG_NONE
        });
        put_uuid(&mut buf, &self.correlation_id);
        if let Some(credentials) = &self.credentials {
            put_credential_field(&mut buf, &credentials.login)?;
            put_credential_field(&mut buf, &credentials.password)?;
        }
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode a package body. The remainder after the header is the payload.
    pub fn decode(mut input: Bytes) -> Result<Self> {
        let command = Command::parse(get_u8(&mut input)?)?;
        let flags = get_u8(&mut input)?;
        let correlation_id = get_uuid(&mut input)?;
        let credentials = if flags & FLAG_AUTHENTICATED != 0 {
            let login = get_credential_field(&mut input)?;
            let password = get_credential_field(&mut input)?;
            Some(Credentials { login, password })
        } else {
            None
        };
        Ok(Self {
            command,
            correlation_id,
            credentials,
            payload: input,
        })
    }
}

// Credential fields carry a one-byte length prefix.
fn put_credential_field(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| Error::CredentialsTooLong)?;
    buf.put_u8(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_credential_field(buf: &mut Bytes) -> Result<String> {
    let len = get_u8(buf)? as usize;
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8)
}
