// TCP transport with optional TLS for the strom wire protocol.
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use strom_wire::{FRAME_PREFIX_LEN, Package, decode_frame_len, frame_body};

mod tls;

pub use tls::TlsMode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },
    #[error("invalid tls server name {0:?}")]
    InvalidServerName(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("wire error: {0}")]
    Wire(#[from] strom_wire::Error),
}

/// Transport knobs below the connection state machine.
///
/// ```
/// use strom_transport::TransportSettings;
///
/// let settings = TransportSettings::default();
/// assert!(settings.connect_timeout.as_millis() > 0);
/// ```
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub no_delay: bool,
    pub keep_alive: bool,
    pub tls: Option<TlsMode>,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            no_delay: true,
            keep_alive: true,
            tls: None,
        }
    }
}

/// Stable connection identifier used for correlating channel events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
}

pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedIo = Box<dyn AsyncStream>;

/// Connects a TCP (optionally TLS) channel to a node.
pub struct TcpConnector {
    settings: TransportSettings,
    next_id: AtomicU64,
}

impl TcpConnector {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn connect(&self, addr: SocketAddr) -> Result<NodeConnection> {
        let stream = tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::ConnectTimeout {
                addr,
                timeout: self.settings.connect_timeout,
            })??;
        stream.set_nodelay(self.settings.no_delay)?;

        let io: BoxedIo = match &self.settings.tls {
            None => Box::new(stream),
            Some(mode) => {
                let config = tls::client_config(mode);
                let server_name = server_name_for(mode, addr)?;
                let connector = TlsConnector::from(Arc::new(config));
                Box::new(connector.connect(server_name, stream).await?)
            }
        };

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(connection = id.0, peer = %addr, "transport channel established");
        let (reader, writer) = split_package_io(io);
        Ok(NodeConnection {
            info: ConnectionInfo {
                id,
                peer_addr: addr,
            },
            reader,
            writer,
        })
    }
}

fn server_name_for(mode: &TlsMode, addr: SocketAddr) -> Result<ServerName<'static>> {
    match mode {
        TlsMode::CommonName(name) => ServerName::try_from(name.clone())
            .map_err(|_| Error::InvalidServerName(name.clone())),
        TlsMode::TrustAll => Ok(ServerName::IpAddress(addr.ip().into())),
    }
}

/// An established channel, split into framed package halves.
#[derive(Debug)]
pub struct NodeConnection {
    pub info: ConnectionInfo,
    pub reader: PackageReader,
    pub writer: PackageWriter,
}

impl NodeConnection {
    pub fn split(self) -> (ConnectionInfo, PackageReader, PackageWriter) {
        (self.info, self.reader, self.writer)
    }
}

/// Wrap any byte stream (e.g. an accepted server socket) in package halves.
pub fn split_package_io(io: BoxedIo) -> (PackageReader, PackageWriter) {
    let (read, write) = tokio::io::split(io);
    (PackageReader { io: read }, PackageWriter { io: write })
}

pub struct PackageReader {
    io: ReadHalf<BoxedIo>,
}

impl std::fmt::Debug for PackageReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageReader").finish_non_exhaustive()
    }
}

impl PackageReader {
    /// Read the next framed package. `Ok(None)` means the peer closed the
    /// channel cleanly between frames.
    pub async fn read_package(&mut self) -> Result<Option<Package>> {
        let mut prefix = [0u8; FRAME_PREFIX_LEN];
        match self.io.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        // Validate the length before allocating for the body.
        let len = decode_frame_len(prefix)?;
        let mut body = vec![0u8; len];
        self.io.read_exact(&mut body).await?;
        Ok(Some(Package::decode(bytes::Bytes::from(body))?))
    }
}

pub struct PackageWriter {
    io: WriteHalf<BoxedIo>,
}

impl std::fmt::Debug for PackageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageWriter").finish_non_exhaustive()
    }
}

impl PackageWriter {
    pub async fn write_package(&mut self, package: &Package) -> Result<()> {
        let framed = frame_body(package.encode()?)?;
        self.io.write_all(&framed).await?;
        self.io.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.io.shutdown().await?;
        Ok(())
    }
}
