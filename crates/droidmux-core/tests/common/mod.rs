//! Shared test helpers for droidmux-core integration tests.
//!
//! [`FakeDevice`] is the device end of an in-memory duplex pipe. Tests either
//! drive it frame by frame, or hand it a [`Reply`] script with
//! [`FakeDevice::serve`] so it answers OPENs on its own.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::DuplexStream;

use droidmux_core::discovery::{
    Connector, DeviceDiscovery, DeviceEndpoint, DiscoveredDevice, DiscoveryError, GetpropReader,
    ReportedState,
};
use droidmux_core::gateway::{Gateway, GatewayConfig};
use droidmux_core::protocol::{
    decode_text, read_frame, write_frame, ChecksumPolicy, Command, Frame, MAX_PAYLOAD, VERSION,
};
use droidmux_core::registry::{DeviceRegistry, RegistryConfig};
use droidmux_core::transport::{ConnectError, Connection, ConnectionConfig};

pub const PLAIN_BANNER: &str = "device::ro.product.name=sdk_phone;ro.product.model=Pixel;features=cmd";
pub const SHELL_V2_BANNER: &str =
    "device::ro.product.name=sdk_phone;ro.product.model=Pixel;features=shell_v2,cmd";

pub const GETPROP_OUTPUT: &str = "[ro.product.model]: [Pixel]\n[ro.build.version.sdk]: [34]\n";

// ---------------------------------------------------------------------------
// FakeDevice
// ---------------------------------------------------------------------------

/// How the fake device answers an OPEN.
#[derive(Clone)]
pub enum Reply {
    /// Answer with CLSE.
    Reject,
    /// Accept, send each chunk as one WRTE (waiting for OKAY), then CLSE.
    Chunks(Vec<Vec<u8>>),
    /// Accept, send each chunk, then keep the stream open.
    Hold(Vec<Vec<u8>>),
    /// Never answer.
    Ignore,
}

impl Reply {
    pub fn text(text: &str) -> Self {
        Reply::Chunks(vec![text.as_bytes().to_vec()])
    }
}

pub type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// The device side of an ADB connection.
pub struct FakeDevice {
    io: DuplexStream,
    next_remote_id: u32,
}

impl FakeDevice {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            io,
            next_remote_id: 100,
        }
    }

    /// Read the next frame from the host.
    pub async fn recv(&mut self) -> Frame {
        read_frame(&mut self.io, MAX_PAYLOAD, ChecksumPolicy::Verify)
            .await
            .expect("host frame")
    }

    /// Read the next frame, or `None` if the host sends nothing in time.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Frame> {
        tokio::time::timeout(wait, read_frame(&mut self.io, MAX_PAYLOAD, ChecksumPolicy::Verify))
            .await
            .ok()
            .and_then(Result::ok)
    }

    pub async fn expect(&mut self, command: Command) -> Frame {
        let frame = self.recv().await;
        assert_eq!(frame.command(), command, "unexpected frame {:?}", frame.header());
        frame
    }

    pub async fn send(&mut self, frame: Frame) {
        write_frame(&mut self.io, &frame).await.expect("device write");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.io.write_all(bytes).await.expect("device write");
    }

    /// Answer the host's CNXN.
    pub async fn handshake(&mut self, banner: &str, max_payload: u32) {
        self.expect(Command::Cnxn).await;
        self.send(Frame::text(Command::Cnxn, VERSION, max_payload, banner))
            .await;
    }

    /// Wait for OPEN and accept it. Returns `(service, local_id, remote_id)`.
    pub async fn accept_open(&mut self) -> (String, u32, u32) {
        let open = self.expect(Command::Open).await;
        let remote_id = self.allocate_id();
        self.send(Frame::new(Command::Okay, remote_id, open.arg0(), Vec::new()))
            .await;
        (decode_text(&open), open.arg0(), remote_id)
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_remote_id;
        self.next_remote_id += 1;
        id
    }

    /// Answer OPENs according to `handler` until the host goes away.
    pub async fn serve(mut self, handler: Handler) {
        loop {
            let Ok(frame) = read_frame(&mut self.io, MAX_PAYLOAD, ChecksumPolicy::Verify).await
            else {
                return;
            };
            if frame.command() != Command::Open {
                continue;
            }

            let local_id = frame.arg0();
            let service = decode_text(&frame);
            match handler(&service) {
                Reply::Reject => {
                    self.send(Frame::new(Command::Clse, 0, local_id, Vec::new()))
                        .await
                }
                Reply::Ignore => {}
                Reply::Chunks(chunks) => {
                    let remote_id = self.allocate_id();
                    if !self.stream_chunks(local_id, remote_id, chunks).await {
                        return;
                    }
                    self.send(Frame::new(Command::Clse, remote_id, local_id, Vec::new()))
                        .await;
                }
                Reply::Hold(chunks) => {
                    let remote_id = self.allocate_id();
                    if !self.stream_chunks(local_id, remote_id, chunks).await {
                        return;
                    }
                }
            }
        }
    }

    async fn stream_chunks(&mut self, local_id: u32, remote_id: u32, chunks: Vec<Vec<u8>>) -> bool {
        self.send(Frame::new(Command::Okay, remote_id, local_id, Vec::new()))
            .await;
        for chunk in chunks {
            self.send(Frame::new(Command::Wrte, remote_id, local_id, chunk))
                .await;
            // Wait for the host to acknowledge before the next WRTE.
            loop {
                let Ok(frame) =
                    read_frame(&mut self.io, MAX_PAYLOAD, ChecksumPolicy::Verify).await
                else {
                    return false;
                };
                match frame.command() {
                    Command::Okay if frame.arg1() == remote_id => break,
                    Command::Clse if frame.arg1() == remote_id => return true,
                    _ => {}
                }
            }
        }
        true
    }
}

/// Connect a host [`Connection`] to a fresh [`FakeDevice`].
pub async fn connected_pair(banner: &str, max_payload: u32) -> (Connection, FakeDevice) {
    let (host, device) = tokio::io::duplex(1024 * 1024);
    let mut device = FakeDevice::new(device);
    let config = ConnectionConfig::default();
    let (conn, ()) = tokio::join!(
        Connection::connect(host, &config),
        device.handshake(banner, max_payload)
    );
    (conn.expect("handshake"), device)
}

// ---------------------------------------------------------------------------
// Registry collaborators
// ---------------------------------------------------------------------------

/// Discovery whose result tests can change between passes.
pub struct ScriptedDiscovery {
    devices: Mutex<Vec<DiscoveredDevice>>,
}

impl ScriptedDiscovery {
    pub fn new(devices: Vec<DiscoveredDevice>) -> Arc<Self> {
        Arc::new(Self {
            devices: Mutex::new(devices),
        })
    }

    pub fn set(&self, devices: Vec<DiscoveredDevice>) {
        *self.devices.lock().unwrap() = devices;
    }
}

#[async_trait]
impl DeviceDiscovery for ScriptedDiscovery {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        Ok(self.devices.lock().unwrap().clone())
    }
}

pub fn online(serial: &str) -> DiscoveredDevice {
    DiscoveredDevice {
        serial: serial.to_string(),
        endpoint: DeviceEndpoint::Tcp(format!("{serial}:5555")),
        state: ReportedState::Device,
    }
}

/// Connector that spins up a [`FakeDevice`] per connect.
///
/// `shell:getprop` is answered with [`GETPROP_OUTPUT`] unless `props_fail`
/// is set; every other service goes to `handler`.
pub struct FakeConnector {
    pub banner: String,
    pub handler: Handler,
    pub props_fail: std::sync::atomic::AtomicBool,
    pub connects: AtomicU32,
}

impl FakeConnector {
    pub fn new(banner: &str, handler: Handler) -> Arc<Self> {
        Arc::new(Self {
            banner: banner.to_string(),
            handler,
            props_fail: std::sync::atomic::AtomicBool::new(false),
            connects: AtomicU32::new(0),
        })
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _endpoint: &DeviceEndpoint) -> Result<Connection, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (host, device) = tokio::io::duplex(1024 * 1024);

        let banner = self.banner.clone();
        let handler = self.handler.clone();
        let props_fail = self.props_fail.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let mut device = FakeDevice::new(device);
            device.handshake(&banner, MAX_PAYLOAD).await;
            let wrapped: Handler = Arc::new(move |service: &str| match service {
                "shell:getprop" if props_fail => Reply::Reject,
                "shell:getprop" => Reply::text(GETPROP_OUTPUT),
                other => handler(other),
            });
            device.serve(wrapped).await;
        });

        Connection::connect(host, &ConnectionConfig::default()).await
    }
}

pub fn registry_with(
    discovery: Arc<ScriptedDiscovery>,
    connector: Arc<FakeConnector>,
) -> Arc<DeviceRegistry> {
    Arc::new(DeviceRegistry::new(
        discovery,
        Arc::new(GetpropReader),
        connector,
        RegistryConfig::default(),
    ))
}

/// A gateway over one connected fake device named `fake-1`.
pub async fn gateway_with(banner: &str, handler: Handler, rpc_timeout: Duration) -> Gateway {
    let discovery = ScriptedDiscovery::new(vec![online("fake-1")]);
    let registry = registry_with(discovery, FakeConnector::new(banner, handler));
    registry.update(true).await.expect("registry pass");

    let config = GatewayConfig {
        rpc_timeout,
        ..GatewayConfig::default()
    };
    Gateway::new(registry, config)
}

pub fn props(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
