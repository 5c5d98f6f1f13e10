//! ADB transport connections.
//!
//! A [`Connection`] wraps one byte stream to a device (TCP, or anything that
//! is [`AdbStream`]), performs the CNXN handshake, and then hands the socket
//! to two background tasks:
//!
//! - a reader task that owns the read half and decodes frames, and
//! - a dispatch task ([`Multiplexer`](crate::mux)) that owns the write half
//!   and all logical stream state.
//!
//! Callers open logical streams with [`Connection::open`] and never touch the
//! socket directly.
//!
//! # Example
//!
//! ```no_run
//! use droidmux_core::transport::{Connection, ConnectionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = Connection::connect_tcp("192.168.1.20:5555", &ConnectionConfig::default()).await?;
//! let mut stream = conn.open("shell:getprop ro.product.model").await?;
//! let model = stream.read_to_end().await?;
//! println!("{}", String::from_utf8_lossy(&model));
//! conn.close();
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, Instrument};

use crate::mux::{
    await_open, LogicalStream, MuxRequest, Multiplexer, StreamError, StreamHandle, StreamState,
};
use crate::protocol::{
    decode_text, read_frame, write_frame, ChecksumPolicy, Command, DeviceBanner, Frame,
    FrameError, WireError, MAX_PAYLOAD, MAX_PAYLOAD_LEGACY, VERSION_SKIP_CHECKSUM,
};

/// Frames buffered between the reader task and the dispatch task.
const FRAME_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// AdbStream trait
// ---------------------------------------------------------------------------

/// A bidirectional async byte stream an ADB connection can run over.
pub trait AdbStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AdbStream for T {}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Parameters for establishing a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Protocol version advertised in CNXN.
    pub version: u32,
    /// Largest payload we accept (advertised in CNXN).
    pub max_payload: u32,
    /// Host system-identity string sent in CNXN.
    pub system_identity: String,
    /// How long to wait for the device's CNXN.
    pub handshake_timeout: Duration,
    /// How long to wait for a device to answer OPEN.
    pub rpc_timeout: Duration,
    /// TCP dial timeout for [`Connection::connect_tcp`].
    pub connect_timeout: Duration,
    /// TCP keep-alive idle time and probe interval.
    pub keepalive: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            version: VERSION_SKIP_CHECKSUM,
            max_payload: MAX_PAYLOAD,
            system_identity: "host::droidmux".to_string(),
            handshake_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            keepalive: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors / state
// ---------------------------------------------------------------------------

/// Errors that can occur while establishing a connection.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// The device did not send CNXN within the handshake timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The TCP dial did not complete within the connect timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The device demanded AUTH; this host does not sign tokens.
    #[error("device requires authorization")]
    AuthRequired,

    /// The device sent a malformed frame during the handshake.
    #[error("framing error during handshake: {0}")]
    Framing(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectError {
    /// Whether retrying the connection later may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConnectError::HandshakeTimeout | ConnectError::ConnectTimeout | ConnectError::Io(_) => {
                true
            }
            ConnectError::AuthRequired | ConnectError::Framing(_) => false,
        }
    }
}

impl From<WireError> for ConnectError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => ConnectError::Io(e),
            WireError::Frame(e) => ConnectError::Framing(e),
        }
    }
}

/// Lifecycle of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// An established ADB connection to one device.
pub struct Connection {
    requests: mpsc::UnboundedSender<MuxRequest>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    next_local_id: AtomicU32,
    system_identity: String,
    banner: DeviceBanner,
    version: u32,
    max_payload: u32,
    rpc_timeout: Duration,
}

impl Connection {
    /// Perform the CNXN handshake over `stream` and start the connection's
    /// background tasks.
    pub async fn connect<S: AdbStream>(
        stream: S,
        config: &ConnectionConfig,
    ) -> Result<Self, ConnectError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (mut reader, mut writer) = tokio::io::split(stream);

        state_tx.send_replace(ConnectionState::Connecting);
        let hello = Frame::text(
            Command::Cnxn,
            config.version,
            config.max_payload,
            &config.system_identity,
        );
        write_frame(&mut writer, &hello).await?;

        let peer = timeout(config.handshake_timeout, await_peer_cnxn(&mut reader, config))
            .await
            .map_err(|_| ConnectError::HandshakeTimeout)??;

        let system_identity = decode_text(&peer);
        let banner = DeviceBanner::parse(&system_identity);
        let version = config.version.min(peer.arg0());
        let max_payload = match peer.arg1() {
            0 => MAX_PAYLOAD_LEGACY.min(config.max_payload),
            peer_max => config.max_payload.min(peer_max),
        };
        info!(
            identity = %system_identity,
            version = %format!("{version:#010x}"),
            max_payload,
            "connected"
        );

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let read_limit = config.max_payload.max(max_payload);
        let policy = ChecksumPolicy::for_version(version);
        let reader_task = tokio::spawn(
            read_loop(reader, frame_tx, read_limit, policy).instrument(tracing::Span::current()),
        );

        state_tx.send_replace(ConnectionState::Connected);
        let mux = Multiplexer::new(writer, state_tx, config.rpc_timeout);
        let dispatch_cancel = cancel.clone();
        tokio::spawn(
            async move {
                mux.run(frame_rx, req_rx, dispatch_cancel).await;
                reader_task.abort();
            }
            .instrument(tracing::Span::current()),
        );

        Ok(Self {
            requests: req_tx,
            state: state_rx,
            cancel,
            next_local_id: AtomicU32::new(1),
            system_identity,
            banner,
            version,
            max_payload,
            rpc_timeout: config.rpc_timeout,
        })
    }

    /// Dial `addr` over TCP, enable keep-alive, and handshake.
    pub async fn connect_tcp(addr: &str, config: &ConnectionConfig) -> Result<Self, ConnectError> {
        debug!(%addr, "dialing device");
        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectError::ConnectTimeout)??;
        stream.set_nodelay(true)?;
        enable_keepalive(&stream, config.keepalive)?;
        Self::connect(stream, config).await
    }

    /// Open a logical stream to `service` (e.g. `shell:ls`).
    pub async fn open(&self, service: &str) -> Result<StreamHandle, StreamError> {
        let local_id = self.next_local_id.fetch_add(1, Ordering::Relaxed);
        let (state_tx, state_rx) = watch::channel(StreamState::Closed);
        let (reply, rx) = oneshot::channel();

        self.requests
            .send(MuxRequest::Open {
                local_id,
                service: service.to_string(),
                state: state_tx,
                reply,
            })
            .map_err(|_| StreamError::ConnectionLost("connection closed".to_string()))?;

        let remote_id = await_open(&self.requests, local_id, rx, self.rpc_timeout).await?;
        Ok(StreamHandle::new(
            local_id,
            remote_id,
            service.to_string(),
            self.max_payload as usize,
            self.requests.clone(),
            state_rx,
        ))
    }

    /// Snapshot of the streams the dispatch task is tracking.
    pub async fn streams(&self) -> Vec<LogicalStream> {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(MuxRequest::Snapshot { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Shut the connection down. Every open stream fails with
    /// [`StreamError::ConnectionLost`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the dispatch task is gone, which is also closed.
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// The device's CNXN identity string.
    pub fn system_identity(&self) -> &str {
        &self.system_identity
    }

    pub fn banner(&self) -> &DeviceBanner {
        &self.banner
    }

    /// Negotiated protocol version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Negotiated max payload.
    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("system_identity", &self.system_identity)
            .field("state", &self.state())
            .field("max_payload", &self.max_payload)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

async fn await_peer_cnxn<R>(reader: &mut R, config: &ConnectionConfig) -> Result<Frame, ConnectError>
where
    R: AsyncRead + Unpin,
{
    let policy = ChecksumPolicy::for_version(config.version);
    loop {
        let frame = read_frame(reader, config.max_payload, policy).await?;
        match frame.command() {
            Command::Cnxn => return Ok(frame),
            Command::Auth => return Err(ConnectError::AuthRequired),
            other => debug!(command = %other, "ignoring frame before CNXN"),
        }
    }
}

async fn read_loop<S>(
    mut reader: ReadHalf<S>,
    frames: mpsc::Sender<Result<Frame, WireError>>,
    max_payload: u32,
    policy: ChecksumPolicy,
) where
    S: AsyncRead + AsyncWrite,
{
    loop {
        let result = read_frame(&mut reader, max_payload, policy).await;
        let failed = result.is_err();
        if let Err(e) = &result {
            trace!(error = %e, "reader stopping");
        }
        if frames.send(result).await.is_err() || failed {
            break;
        }
    }
}

fn enable_keepalive(stream: &TcpStream, interval: Duration) -> std::io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(interval)
        .with_interval(interval);
    socket.set_tcp_keepalive(&keepalive)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ConnectionConfig::default();
        assert_eq!(config.version, VERSION_SKIP_CHECKSUM);
        assert_eq!(config.max_payload, MAX_PAYLOAD);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(config.system_identity, "host::droidmux");
    }

    #[test]
    fn recoverable_errors() {
        assert!(ConnectError::HandshakeTimeout.is_recoverable());
        assert!(ConnectError::ConnectTimeout.is_recoverable());
        assert!(ConnectError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))
            .is_recoverable());
        assert!(!ConnectError::AuthRequired.is_recoverable());
        assert!(!ConnectError::Framing(FrameError::UnknownCommand(7)).is_recoverable());
    }

    #[test]
    fn wire_error_conversion() {
        let err: ConnectError = WireError::Frame(FrameError::UnknownCommand(1)).into();
        assert!(matches!(err, ConnectError::Framing(_)));

        let err: ConnectError =
            WireError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)).into();
        assert!(matches!(err, ConnectError::Io(_)));
    }

    #[tokio::test]
    async fn handshake_negotiates_smaller_payload() {
        let (host, mut device) = tokio::io::duplex(64 * 1024);

        let device_side = tokio::spawn(async move {
            let hello = read_frame(&mut device, MAX_PAYLOAD, ChecksumPolicy::Verify)
                .await
                .unwrap();
            assert_eq!(hello.command(), Command::Cnxn);
            assert_eq!(decode_text(&hello), "host::droidmux");
            let reply = Frame::text(
                Command::Cnxn,
                crate::protocol::VERSION,
                4096,
                "device::ro.product.model=Pixel;features=shell_v2,cmd",
            );
            write_frame(&mut device, &reply).await.unwrap();
            device
        });

        let conn = Connection::connect(host, &ConnectionConfig::default())
            .await
            .unwrap();
        let _device = device_side.await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.max_payload(), 4096);
        assert_eq!(conn.version(), crate::protocol::VERSION);
        assert_eq!(conn.banner().kind, "device");
        assert!(conn.banner().has_feature("shell_v2"));

        conn.close();
        conn.closed().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn auth_is_reported() {
        let (host, mut device) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let _ = read_frame(&mut device, MAX_PAYLOAD, ChecksumPolicy::Verify).await;
            let auth = Frame::new(Command::Auth, 1, 0, vec![0u8; 20]);
            let _ = write_frame(&mut device, &auth).await;
            device
        });

        let err = Connection::connect(host, &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::AuthRequired));
    }
}
