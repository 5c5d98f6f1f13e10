//! Gateway operations end to end: registry, connection, stream, device.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{
    gateway_with, online, registry_with, FakeConnector, Handler, Reply, ScriptedDiscovery,
    PLAIN_BANNER, SHELL_V2_BANNER,
};
use tokio_util::sync::CancellationToken;

use droidmux_core::gateway::{ElementSummary, Gateway, GatewayConfig, GatewayError};
use droidmux_core::hierarchy::ParseError;
use droidmux_core::registry::DeviceState;
use droidmux_core::shell::{encode_packet, ID_EXIT, ID_STDERR, ID_STDOUT};

const RPC: Duration = Duration::from_secs(5);

const LOGIN_DUMP: &str = concat!(
    "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>",
    "<hierarchy rotation=\"0\">",
    "<node index=\"0\" text=\"\" resource-id=\"\" class=\"android.widget.FrameLayout\" ",
    "package=\"com.example\" content-desc=\"\" bounds=\"[0,0][1080,1920]\">",
    "<node index=\"0\" text=\"Welcome back\" resource-id=\"com.example:id/title\" ",
    "class=\"android.widget.TextView\" package=\"com.example\" content-desc=\"\" ",
    "bounds=\"[0,100][1080,200]\" />",
    "<node index=\"1\" text=\"Login\" resource-id=\"com.example:id/login_button\" ",
    "class=\"android.widget.Button\" package=\"com.example\" content-desc=\"\" ",
    "bounds=\"[100,800][980,900]\" />",
    "</node>",
    "</hierarchy>",
    "UI hierchary dumped to: /dev/tty\n",
);

fn handler(f: impl Fn(&str) -> Reply + Send + Sync + 'static) -> Handler {
    Arc::new(f)
}

fn dump_handler(output: &'static str) -> Handler {
    handler(move |service| {
        if service.starts_with("shell:uiautomator dump") {
            // Split mid-document to exercise reassembly.
            let (head, tail) = output.as_bytes().split_at(output.len() / 2);
            Reply::Chunks(vec![head.to_vec(), tail.to_vec()])
        } else {
            Reply::Reject
        }
    })
}

// =============================================================================
// Shell
// =============================================================================

#[tokio::test]
async fn test_shell_without_v2_returns_merged_output() {
    let gateway = gateway_with(
        PLAIN_BANNER,
        handler(|service| match service {
            "shell:echo hello" => Reply::text("hello\n"),
            _ => Reply::Reject,
        }),
        RPC,
    )
    .await;

    let output = gateway
        .run_shell("fake-1", "echo hello", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.stdout, "hello\n");
    assert_eq!(output.stderr, "");
    assert_eq!(output.exit_code, None);
}

#[tokio::test]
async fn test_shell_v2_separates_streams_and_reports_exit() {
    let gateway = gateway_with(
        SHELL_V2_BANNER,
        handler(|service| {
            if service != "shell,v2,raw:ls /missing" {
                return Reply::Reject;
            }
            let mut bytes = encode_packet(ID_STDOUT, b"partial\n");
            bytes.extend(encode_packet(ID_STDERR, b"ls: /missing: No such file\n"));
            bytes.extend(encode_packet(ID_EXIT, &[1]));
            // Packet boundaries do not line up with WRTE boundaries.
            let (a, rest) = bytes.split_at(3);
            let (b, c) = rest.split_at(10);
            Reply::Chunks(vec![a.to_vec(), b.to_vec(), c.to_vec()])
        }),
        RPC,
    )
    .await;

    let output = gateway
        .run_shell("fake-1", "ls /missing", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output.stdout, "partial\n");
    assert_eq!(output.stderr, "ls: /missing: No such file\n");
    assert_eq!(output.exit_code, Some(1));
    assert!(!output.success());
}

#[tokio::test]
async fn test_shell_v2_oversized_packet_is_protocol_error() {
    let gateway = gateway_with(
        SHELL_V2_BANNER,
        handler(|service| {
            if !service.starts_with("shell,v2,raw:") {
                return Reply::Reject;
            }
            let mut header = vec![ID_STDOUT];
            header.extend_from_slice(&u32::MAX.to_le_bytes());
            Reply::Chunks(vec![header])
        }),
        RPC,
    )
    .await;

    let err = gateway
        .run_shell("fake-1", "cat /dev/zero", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Protocol(ref reason) if reason.contains("limit")));
}

#[tokio::test]
async fn test_shell_rejected_service() {
    let gateway = gateway_with(PLAIN_BANNER, handler(|_| Reply::Reject), RPC).await;

    let err = gateway
        .run_shell("fake-1", "reboot", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::ServiceRejected("shell:reboot".into()));
}

#[tokio::test]
async fn test_unknown_device() {
    let gateway = gateway_with(PLAIN_BANNER, handler(|_| Reply::Reject), RPC).await;

    let err = gateway
        .run_shell("nope", "id", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::DeviceNotFound("nope".into()));
}

#[tokio::test]
async fn test_forgotten_device_is_not_found() {
    let gateway = gateway_with(PLAIN_BANNER, handler(|_| Reply::Reject), RPC).await;
    assert_eq!(
        gateway.registry().get("fake-1").await.unwrap().state,
        DeviceState::Device
    );

    gateway.registry().shutdown().await;
    let err = gateway
        .run_shell("fake-1", "id", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::DeviceNotFound("fake-1".into()));
}

#[tokio::test]
async fn test_degraded_device_is_unavailable() {
    let connector = FakeConnector::new(PLAIN_BANNER, handler(|_| Reply::text("ok\n")));
    connector.props_fail.store(true, Ordering::SeqCst);
    let registry = registry_with(ScriptedDiscovery::new(vec![online("fake-1")]), connector);
    registry.update(true).await.unwrap();
    let gateway = Gateway::new(registry, GatewayConfig::default());

    let err = gateway
        .run_shell("fake-1", "id", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::DeviceUnavailable {
            device_id: "fake-1".into(),
            state: DeviceState::Offline,
        }
    );
}

#[tokio::test]
async fn test_shell_times_out() {
    let gateway = gateway_with(
        PLAIN_BANNER,
        handler(|_| Reply::Ignore),
        Duration::from_millis(200),
    )
    .await;

    let err = gateway
        .run_shell("fake-1", "sleep 100", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Timeout);
}

#[tokio::test]
async fn test_shell_cancelled() {
    let gateway = gateway_with(PLAIN_BANNER, handler(|_| Reply::Ignore), RPC).await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = gateway
        .run_shell("fake-1", "sleep 100", &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Cancelled);
}

// =============================================================================
// Logcat
// =============================================================================

#[tokio::test]
async fn test_logcat_assembles_lines_across_chunks() {
    let gateway = gateway_with(
        PLAIN_BANNER,
        handler(|service| match service {
            "logcat:" => Reply::Chunks(vec![
                b"I/first: one\r\nI/sec".to_vec(),
                b"ond: two\nI/third".to_vec(),
                b": three".to_vec(),
            ]),
            _ => Reply::Reject,
        }),
        RPC,
    )
    .await;

    let mut tail = gateway
        .tail_logcat("fake-1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("I/first: one"));
    assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("I/second: two"));
    // Unterminated final line is flushed when the device closes.
    assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("I/third: three"));
    assert_eq!(tail.next_line().await.unwrap(), None);
}

#[tokio::test]
async fn test_logcat_runs_past_rpc_timeout_until_cancelled() {
    let gateway = gateway_with(
        PLAIN_BANNER,
        handler(|service| match service {
            "logcat:" => Reply::Hold(vec![b"I/boot: ready\n".to_vec()]),
            _ => Reply::Reject,
        }),
        Duration::from_millis(100),
    )
    .await;

    let cancel = CancellationToken::new();
    let mut tail = gateway.tail_logcat("fake-1", &cancel).await.unwrap();
    assert_eq!(tail.next_line().await.unwrap().as_deref(), Some("I/boot: ready"));

    // Idle for longer than the RPC timeout; the tail is still alive.
    let idle = tokio::time::timeout(Duration::from_millis(300), tail.next_line()).await;
    assert!(idle.is_err());

    cancel.cancel();
    assert_eq!(tail.next_line().await.unwrap_err(), GatewayError::Cancelled);
}

// =============================================================================
// UI hierarchy
// =============================================================================

#[tokio::test]
async fn test_page_source_strips_trailer() {
    let gateway = gateway_with(PLAIN_BANNER, dump_handler(LOGIN_DUMP), RPC).await;

    let page = gateway
        .get_page_source("fake-1", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(page.rotation, 0);
    assert_eq!(page.len(), 4);
    let texts: Vec<&str> = page.iter().map(|n| n.text.as_str()).collect();
    assert_eq!(texts, vec!["", "", "Welcome back", "Login"]);
}

#[tokio::test]
async fn test_find_element_by_natural_language() {
    let gateway = gateway_with(PLAIN_BANNER, dump_handler(LOGIN_DUMP), RPC).await;

    let node = gateway
        .find_element("fake-1", "Login button", &CancellationToken::new())
        .await
        .unwrap()
        .expect("login node");
    assert_eq!(node.resource_id, "com.example:id/login_button");

    let summary = ElementSummary::from(&node);
    assert_eq!(summary.center, (540, 850));

    let missing = gateway
        .find_element("fake-1", "Settings", &CancellationToken::new())
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn test_dump_without_hierarchy_is_parse_error() {
    let gateway = gateway_with(
        PLAIN_BANNER,
        dump_handler("ERROR: null root node returned by UiTestAutomationBridge.\n"),
        RPC,
    )
    .await;

    let err = gateway
        .get_page_source("fake-1", &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Parse(ParseError::MissingRoot));
}
