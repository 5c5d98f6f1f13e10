//! Registry reconciliation against fake devices that speak the wire protocol.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{online, props, registry_with, FakeConnector, Reply, ScriptedDiscovery, PLAIN_BANNER};

use droidmux_core::registry::{DeviceState, StateChange};

fn silent() -> common::Handler {
    Arc::new(|_: &str| Reply::Reject)
}

#[tokio::test]
async fn test_new_device_is_connected_and_probed() {
    let discovery = ScriptedDiscovery::new(vec![online("emu-1")]);
    let connector = FakeConnector::new(PLAIN_BANNER, silent());
    let registry = registry_with(discovery, connector.clone());

    let changes = registry.update(false).await.unwrap();
    assert_eq!(changes.added, vec!["emu-1".to_string()]);

    let record = registry.get("emu-1").await.unwrap();
    assert_eq!(record.state, DeviceState::Device);
    assert!(record.transport.is_some());
    assert_eq!(
        record.properties,
        props(&[("ro.build.version.sdk", "34"), ("ro.product.model", "Pixel")])
    );
    assert_eq!(record.missed_scans, 0);
    assert!(record.last_error.is_none());
    assert_eq!(connector.connect_count(), 1);

    // A steady device is not reconnected.
    let changes = registry.update(false).await.unwrap();
    assert!(changes.is_empty());
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn test_bootloader_banner_is_recorded() {
    let discovery = ScriptedDiscovery::new(vec![online("fb-1")]);
    let connector = FakeConnector::new("bootloader::", silent());
    let registry = registry_with(discovery, connector);

    registry.update(false).await.unwrap();
    assert_eq!(
        registry.get("fb-1").await.unwrap().state,
        DeviceState::Bootloader
    );
}

#[tokio::test]
async fn test_probe_failure_degrades_device() {
    let discovery = ScriptedDiscovery::new(vec![online("emu-1")]);
    let connector = FakeConnector::new(PLAIN_BANNER, silent());
    connector.props_fail.store(true, Ordering::SeqCst);
    let registry = registry_with(discovery, connector.clone());

    registry.update(false).await.unwrap();
    let record = registry.get("emu-1").await.unwrap();
    assert_eq!(record.state, DeviceState::Offline);
    assert!(record.last_error.is_some());
    assert!(record.transport.is_some(), "transport is kept while degraded");
}

#[tokio::test]
async fn test_closed_transport_is_replaced() {
    let discovery = ScriptedDiscovery::new(vec![online("emu-1")]);
    let connector = FakeConnector::new(PLAIN_BANNER, silent());
    let registry = registry_with(discovery, connector.clone());
    registry.update(false).await.unwrap();

    let first = registry.get("emu-1").await.unwrap().transport.unwrap();
    first.close();
    first.closed().await;

    registry.update(false).await.unwrap();
    let record = registry.get("emu-1").await.unwrap();
    assert_eq!(connector.connect_count(), 2);
    assert_eq!(record.state, DeviceState::Device);
    let second = record.transport.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_closed());
}

#[tokio::test]
async fn test_eviction_closes_transport() {
    let discovery = ScriptedDiscovery::new(vec![online("emu-1")]);
    let connector = FakeConnector::new(PLAIN_BANNER, silent());
    let registry = registry_with(discovery.clone(), connector);
    registry.update(false).await.unwrap();
    let transport = registry.get("emu-1").await.unwrap().transport.unwrap();

    discovery.set(Vec::new());
    let first = registry.update(false).await.unwrap();
    assert_eq!(
        first.state_changed,
        vec![StateChange {
            device_id: "emu-1".into(),
            from: DeviceState::Device,
            to: DeviceState::Offline,
        }]
    );
    let record = registry.get("emu-1").await.unwrap();
    assert_eq!(record.missed_scans, 1);
    assert!(!transport.is_closed(), "transport survives until eviction");

    registry.update(false).await.unwrap();
    let last = registry.update(false).await.unwrap();
    assert_eq!(last.removed, vec!["emu-1".to_string()]);
    assert!(registry.get("emu-1").await.is_none());

    tokio::time::timeout(Duration::from_secs(1), transport.closed())
        .await
        .expect("transport closed on eviction");
}

#[tokio::test]
async fn test_device_returning_within_threshold_recovers() {
    let discovery = ScriptedDiscovery::new(vec![online("emu-1")]);
    let connector = FakeConnector::new(PLAIN_BANNER, silent());
    let registry = registry_with(discovery.clone(), connector.clone());
    registry.update(false).await.unwrap();

    discovery.set(Vec::new());
    registry.update(false).await.unwrap();

    discovery.set(vec![online("emu-1")]);
    let changes = registry.update(false).await.unwrap();
    assert!(changes.added.is_empty());
    assert_eq!(
        changes.state_changed,
        vec![StateChange {
            device_id: "emu-1".into(),
            from: DeviceState::Offline,
            to: DeviceState::Device,
        }]
    );

    let record = registry.get("emu-1").await.unwrap();
    assert_eq!(record.missed_scans, 0);
    // The original transport was still alive; no reconnect needed.
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn test_shutdown_closes_transports() {
    let discovery = ScriptedDiscovery::new(vec![online("a"), online("b")]);
    let connector = FakeConnector::new(PLAIN_BANNER, silent());
    let registry = registry_with(discovery, connector);
    registry.update(false).await.unwrap();

    let transports: Vec<_> = registry
        .devices()
        .await
        .into_iter()
        .filter_map(|r| r.transport)
        .collect();
    assert_eq!(transports.len(), 2);

    registry.shutdown().await;
    for transport in transports {
        transport.closed().await;
    }
    assert!(registry.devices().await.is_empty());
}
