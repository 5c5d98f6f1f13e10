//! Device registry: reconciles discovered devices with live connections.
//!
//! Each [`DeviceRegistry::update`] pass:
//!
//! 1. asks the [`DeviceDiscovery`] collaborator which devices are visible,
//! 2. connects devices reported as `device` that have no live transport
//!    (respecting per-device backoff unless forced),
//! 3. probes newly connected devices for their properties,
//! 4. applies all additions, state changes and evictions under one write
//!    lock, and broadcasts the resulting [`DeviceChangeSet`].
//!
//! Discovery, connects and probes run outside the record lock. Passes are
//! serialized.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use droidmux_core::discovery::{GetpropReader, StaticDiscovery, TcpConnector};
//! use droidmux_core::registry::{DeviceRegistry, RegistryConfig, RegistryPoller};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(DeviceRegistry::new(
//!     Arc::new(StaticDiscovery::new(vec!["127.0.0.1:5555".into()])),
//!     Arc::new(GetpropReader),
//!     Arc::new(TcpConnector::default()),
//!     RegistryConfig::default(),
//! ));
//!
//! let mut changes = registry.subscribe();
//! let poller = RegistryPoller::spawn(registry.clone(), std::time::Duration::from_secs(2));
//! let first = changes.recv().await?;
//! println!("added: {:?}", first.added);
//! poller.stop().await;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, warn, Instrument};

use crate::discovery::{
    Connector, DeviceDiscovery, DeviceEndpoint, DiscoveryError, PropertyReader, ReportedState,
};
use crate::transport::{ConnectError, Connection};

/// Capacity of the change-set broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Upper bound for the poller's backoff after failed passes.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum RegistryError {
    /// The discovery collaborator failed; the pass was abandoned.
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
}

/// Tunables for reconciliation.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Consecutive passes a device may be missing before it is evicted.
    pub eviction_threshold: u32,
    /// Timeout for one property probe.
    pub probe_timeout: Duration,
    /// Delay before the first reconnect attempt after a failure.
    pub backoff_base: Duration,
    /// Ceiling for the reconnect delay.
    pub backoff_max: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            eviction_threshold: 3,
            probe_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    /// Reconnect delay after `failures` consecutive connect failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Offline,
    Unauthorized,
    Device,
    Bootloader,
    Connecting,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceState::Offline => "offline",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Device => "device",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Connecting => "connecting",
        };
        f.write_str(name)
    }
}

/// What the registry knows about one device.
///
/// Records handed out by the registry are snapshots; the transport is shared.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub state: DeviceState,
    pub endpoint: DeviceEndpoint,
    /// Live connection. Always `Some` when `state` is [`DeviceState::Device`].
    #[serde(skip)]
    pub transport: Option<Arc<Connection>>,
    /// Properties from the last successful probe.
    pub properties: BTreeMap<String, String>,
    pub missed_scans: u32,
    pub last_seen: DateTime<Utc>,
    pub last_error: Option<String>,
    pub connect_failures: u32,
    /// Earliest time the next connect may be attempted.
    #[serde(skip)]
    pub retry_at: Option<Instant>,
}

impl DeviceRecord {
    fn new(device_id: String, endpoint: DeviceEndpoint, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            state: DeviceState::Offline,
            endpoint,
            transport: None,
            properties: BTreeMap::new(),
            missed_scans: 0,
            last_seen: now,
            last_error: None,
            connect_failures: 0,
            retry_at: None,
        }
    }

    fn live_transport(&self) -> Option<&Arc<Connection>> {
        self.transport.as_ref().filter(|t| !t.is_closed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub device_id: String,
    pub from: DeviceState,
    pub to: DeviceState,
}

/// Differences produced by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceChangeSet {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub state_changed: Vec<StateChange>,
}

impl DeviceChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.state_changed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DeviceRegistry
// ---------------------------------------------------------------------------

pub struct DeviceRegistry {
    discovery: Arc<dyn DeviceDiscovery>,
    properties: Arc<dyn PropertyReader>,
    connector: Arc<dyn Connector>,
    config: RegistryConfig,
    records: RwLock<BTreeMap<String, DeviceRecord>>,
    pass_lock: Mutex<()>,
    event_tx: broadcast::Sender<DeviceChangeSet>,
}

type ProbeResult = Result<BTreeMap<String, String>, String>;

impl DeviceRegistry {
    pub fn new(
        discovery: Arc<dyn DeviceDiscovery>,
        properties: Arc<dyn PropertyReader>,
        connector: Arc<dyn Connector>,
        config: RegistryConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            discovery,
            properties,
            connector,
            config,
            records: RwLock::new(BTreeMap::new()),
            pass_lock: Mutex::new(()),
            event_tx,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Run one reconciliation pass.
    ///
    /// `force` ignores reconnect backoff and re-probes every connected
    /// device. Only a failure of discovery itself fails the pass.
    pub async fn update(&self, force: bool) -> Result<DeviceChangeSet, RegistryError> {
        let _pass = self.pass_lock.lock().await;
        let span = debug_span!("registry_update", force);
        async {
            let discovered = self.discovery.discover().await?;
            let now = Instant::now();

            // Plan from a snapshot; the record lock is not held across I/O.
            let mut to_connect = Vec::new();
            let mut to_probe = Vec::new();
            {
                let records = self.records.read().await;
                for device in &discovered {
                    if device.state != ReportedState::Device {
                        continue;
                    }
                    let record = records.get(&device.serial);
                    match record.and_then(DeviceRecord::live_transport) {
                        Some(conn) => {
                            let degraded = record.is_some_and(|r| r.state != DeviceState::Device
                                && r.state != DeviceState::Bootloader);
                            if force || degraded {
                                to_probe.push((device.serial.clone(), conn.clone()));
                            }
                        }
                        None => {
                            let due = record
                                .and_then(|r| r.retry_at)
                                .map_or(true, |at| now >= at);
                            if force || due {
                                to_connect.push((device.serial.clone(), device.endpoint.clone()));
                            } else {
                                debug!(device_id = %device.serial, "reconnect suppressed by backoff");
                            }
                        }
                    }
                }
            }

            let mut connects = self.connect_all(to_connect).await;
            for (serial, result) in &connects {
                if let Ok(conn) = result {
                    to_probe.push((serial.clone(), conn.clone()));
                }
            }
            let mut probes = self.probe_all(to_probe).await;

            let changes = self
                .apply(&discovered, &mut connects, &mut probes, now)
                .await;

            if !changes.is_empty() {
                // No subscribers is fine.
                let _ = self.event_tx.send(changes.clone());
            }
            Ok(changes)
        }
        .instrument(span)
        .await
    }

    async fn connect_all(
        &self,
        targets: Vec<(String, DeviceEndpoint)>,
    ) -> HashMap<String, Result<Arc<Connection>, ConnectError>> {
        let mut set = JoinSet::new();
        for (serial, endpoint) in targets {
            let connector = self.connector.clone();
            set.spawn(async move {
                debug!(device_id = %serial, %endpoint, "connecting");
                let result = connector.connect(&endpoint).await.map(Arc::new);
                (serial, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((serial, result)) => {
                    results.insert(serial, result);
                }
                Err(e) => warn!(error = %e, "connect task failed"),
            }
        }
        results
    }

    async fn probe_all(&self, targets: Vec<(String, Arc<Connection>)>) -> HashMap<String, ProbeResult> {
        let mut set = JoinSet::new();
        for (serial, conn) in targets {
            let reader = self.properties.clone();
            let probe_timeout = self.config.probe_timeout;
            set.spawn(async move {
                let result = match timeout(probe_timeout, reader.read_properties(&conn)).await {
                    Ok(Ok(props)) => Ok(props),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("property probe timed out".to_string()),
                };
                (serial, result)
            });
        }

        let mut results = HashMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((serial, result)) => {
                    results.insert(serial, result);
                }
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }
        results
    }

    async fn apply(
        &self,
        discovered: &[crate::discovery::DiscoveredDevice],
        connects: &mut HashMap<String, Result<Arc<Connection>, ConnectError>>,
        probes: &mut HashMap<String, ProbeResult>,
        now: Instant,
    ) -> DeviceChangeSet {
        let wall_clock = Utc::now();
        let mut changes = DeviceChangeSet::default();
        let mut records = self.records.write().await;
        let mut seen = HashSet::new();

        for device in discovered {
            seen.insert(device.serial.clone());
            let is_new = !records.contains_key(&device.serial);
            let record = records.entry(device.serial.clone()).or_insert_with(|| {
                DeviceRecord::new(device.serial.clone(), device.endpoint.clone(), wall_clock)
            });
            if is_new {
                info!(device_id = %device.serial, endpoint = %device.endpoint, "device added");
                changes.added.push(device.serial.clone());
            }

            let previous = record.state;
            record.missed_scans = 0;
            record.last_seen = wall_clock;
            record.endpoint = device.endpoint.clone();

            match &device.state {
                ReportedState::Device => {
                    self.reconcile_connected(record, connects, probes, now);
                }
                ReportedState::Unauthorized => record.state = DeviceState::Unauthorized,
                ReportedState::Bootloader => record.state = DeviceState::Bootloader,
                ReportedState::Offline | ReportedState::Other(_) => {
                    record.state = DeviceState::Offline;
                }
            }

            if !is_new && previous != record.state {
                info!(device_id = %record.device_id, from = %previous, to = %record.state, "device state changed");
                changes.state_changed.push(StateChange {
                    device_id: record.device_id.clone(),
                    from: previous,
                    to: record.state,
                });
            }
        }

        let absent: Vec<String> = records
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for device_id in absent {
            let Some(record) = records.get_mut(&device_id) else {
                continue;
            };
            record.missed_scans += 1;
            if record.state != DeviceState::Offline {
                changes.state_changed.push(StateChange {
                    device_id: device_id.clone(),
                    from: record.state,
                    to: DeviceState::Offline,
                });
                record.state = DeviceState::Offline;
            }
            if record.missed_scans >= self.config.eviction_threshold {
                if let Some(record) = records.remove(&device_id) {
                    if let Some(conn) = record.transport {
                        conn.close();
                    }
                }
                info!(%device_id, "device evicted");
                changes.removed.push(device_id);
            } else {
                debug!(%device_id, missed_scans = record.missed_scans, "device missing");
            }
        }

        changes
    }

    fn reconcile_connected(
        &self,
        record: &mut DeviceRecord,
        connects: &mut HashMap<String, Result<Arc<Connection>, ConnectError>>,
        probes: &mut HashMap<String, ProbeResult>,
        now: Instant,
    ) {
        if record.transport.as_ref().is_some_and(|t| t.is_closed()) {
            info!(device_id = %record.device_id, "transport closed, dropping it");
            record.transport = None;
        }

        if let Some(result) = connects.remove(&record.device_id) {
            match result {
                Ok(conn) => {
                    info!(device_id = %record.device_id, identity = conn.system_identity(), "device connected");
                    if let Some(old) = record.transport.replace(conn) {
                        old.close();
                    }
                    record.connect_failures = 0;
                    record.retry_at = None;
                    record.last_error = None;
                }
                Err(e) => {
                    record.connect_failures += 1;
                    let delay = self.config.backoff(record.connect_failures);
                    record.retry_at = Some(now + delay);
                    record.last_error = Some(e.to_string());
                    record.state = match e {
                        ConnectError::AuthRequired => DeviceState::Unauthorized,
                        _ => DeviceState::Connecting,
                    };
                    warn!(
                        device_id = %record.device_id,
                        error = %e,
                        failures = record.connect_failures,
                        retry_in = ?delay,
                        "connect failed"
                    );
                    return;
                }
            }
        }

        let Some(conn) = record.transport.clone() else {
            if record.state != DeviceState::Unauthorized {
                record.state = DeviceState::Connecting;
            }
            return;
        };

        match probes.remove(&record.device_id) {
            Some(Ok(props)) => {
                record.properties = props;
                record.last_error = None;
                record.state = if conn.banner().kind == "bootloader" {
                    DeviceState::Bootloader
                } else {
                    DeviceState::Device
                };
            }
            Some(Err(e)) => {
                warn!(device_id = %record.device_id, error = %e, "property probe failed");
                record.last_error = Some(e);
                record.state = DeviceState::Offline;
            }
            None => {
                if !matches!(record.state, DeviceState::Device | DeviceState::Bootloader) {
                    record.state = DeviceState::Offline;
                }
            }
        }
    }

    /// Snapshot of one device.
    pub async fn get(&self, device_id: &str) -> Option<DeviceRecord> {
        self.records.read().await.get(device_id).cloned()
    }

    /// Snapshot of all devices, sorted by id.
    pub async fn devices(&self) -> Vec<DeviceRecord> {
        self.records.read().await.values().cloned().collect()
    }

    /// Subscribe to non-empty change sets.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceChangeSet> {
        self.event_tx.subscribe()
    }

    /// Close every transport and forget all devices.
    pub async fn shutdown(&self) {
        let mut records = self.records.write().await;
        for record in records.values() {
            if let Some(conn) = &record.transport {
                conn.close();
            }
        }
        info!(devices = records.len(), "registry shut down");
        records.clear();
    }
}

// ---------------------------------------------------------------------------
// RegistryPoller
// ---------------------------------------------------------------------------

/// Handle for a running [`RegistryPoller`].
pub struct PollerHandle {
    cancel_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

impl PollerHandle {
    /// Stops the poller and waits for it to finish.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        let _ = self.join_handle.await;
    }

    /// Cancels the poller without waiting.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.join_handle.is_finished()
    }
}

/// Runs [`DeviceRegistry::update`] periodically.
pub struct RegistryPoller;

impl RegistryPoller {
    pub fn spawn(registry: Arc<DeviceRegistry>, interval: Duration) -> PollerHandle {
        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        let join_handle = tokio::spawn(async move {
            Self::run_loop(registry, interval, token_clone).await;
        });

        PollerHandle {
            cancel_token,
            join_handle,
        }
    }

    async fn run_loop(registry: Arc<DeviceRegistry>, interval: Duration, cancel_token: CancellationToken) {
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                result = registry.update(false) => {
                    match result {
                        Ok(_) => {
                            if consecutive_errors > 0 {
                                debug!("poller recovered from backoff");
                            }
                            consecutive_errors = 0;
                        }
                        Err(e) => {
                            consecutive_errors = consecutive_errors.saturating_add(1);
                            warn!(error = %e, consecutive_errors, "registry pass failed");
                        }
                    }
                }
            }

            let sleep_duration = Self::backoff_interval(interval, consecutive_errors);
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = tokio::time::sleep(sleep_duration) => {}
            }
        }
        debug!("registry poller stopped");
    }

    /// Base interval doubled per consecutive failure, capped at 30 s.
    fn backoff_interval(base: Duration, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return base;
        }
        let multiplier = 1u32 << consecutive_errors.min(5);
        std::cmp::min(base.saturating_mul(multiplier), MAX_POLL_BACKOFF)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
