//! Proxy gateway: device operations exposed to remote callers.
//!
//! Every operation resolves the device through the [`DeviceRegistry`], opens
//! one logical stream on its connection, and is bounded by the RPC timeout
//! and a caller-supplied [`CancellationToken`]. Log tails are the exception:
//! they run until cancelled or closed.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::hierarchy::{PageSource, PageSourceNode, ParseError};
use crate::mux::{StreamError, StreamHandle};
use crate::registry::{DeviceRegistry, DeviceState};
use crate::shell::{LineAssembler, ShellError, ShellOutput, ShellPacket, ShellV2Decoder};
use crate::transport::Connection;

/// Errors returned by gateway operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device is known but not usable right now.
    #[error("device {device_id} is {state}")]
    DeviceUnavailable { device_id: String, state: DeviceState },

    #[error("service rejected by device: {0}")]
    ServiceRejected(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<StreamError> for GatewayError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::ServiceRejected(service) => GatewayError::ServiceRejected(service),
            StreamError::ConnectionLost(reason) => GatewayError::ConnectionLost(reason),
            StreamError::Closed => GatewayError::ConnectionLost("stream closed".to_string()),
            StreamError::Timeout => GatewayError::Timeout,
            StreamError::ProtocolViolation(reason) => GatewayError::Protocol(reason),
        }
    }
}

impl From<ShellError> for GatewayError {
    fn from(err: ShellError) -> Self {
        GatewayError::Protocol(err.to_string())
    }
}

/// Gateway tunables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Upper bound for every bounded operation.
    pub rpc_timeout: Duration,
    /// Service opened by [`Gateway::tail_logcat`].
    pub logcat_service: String,
    /// Service that prints the UI hierarchy XML.
    pub ui_dump_service: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
            logcat_service: "logcat:".to_string(),
            ui_dump_service: "shell:uiautomator dump /dev/tty".to_string(),
        }
    }
}

pub struct Gateway {
    registry: Arc<DeviceRegistry>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(registry: Arc<DeviceRegistry>, config: GatewayConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Run `command` on the device and collect its output.
    ///
    /// Devices advertising `shell_v2` report separate stdout/stderr and an
    /// exit code; others return merged output with `exit_code: None`.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn run_shell(
        &self,
        device_id: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, GatewayError> {
        let conn = self.connection(device_id).await?;
        let shell_v2 = conn.banner().has_feature("shell_v2");
        debug!(shell_v2, "running shell command");

        self.bounded(cancel, async {
            if shell_v2 {
                let mut stream = conn.open(&format!("shell,v2,raw:{command}")).await?;
                collect_shell_v2(&mut stream).await
            } else {
                let mut stream = conn.open(&format!("shell:{command}")).await?;
                let output = stream.read_to_end().await?;
                Ok(ShellOutput {
                    exit_code: None,
                    stdout: String::from_utf8_lossy(&output).into_owned(),
                    stderr: String::new(),
                })
            }
        })
        .await
    }

    /// Start streaming the device log.
    ///
    /// Only opening the stream is bounded by the RPC timeout; the tail
    /// itself runs until `cancel` fires or it is closed.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn tail_logcat(
        &self,
        device_id: &str,
        cancel: &CancellationToken,
    ) -> Result<LogcatTail, GatewayError> {
        let conn = self.connection(device_id).await?;
        let service = self.config.logcat_service.clone();
        let stream = self
            .bounded(cancel, async { Ok::<_, GatewayError>(conn.open(&service).await?) })
            .await?;
        Ok(LogcatTail {
            stream,
            lines: LineAssembler::new(),
            cancel: cancel.clone(),
            ended: false,
        })
    }

    /// Dump and parse the device's current UI hierarchy.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn get_page_source(
        &self,
        device_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PageSource, GatewayError> {
        let conn = self.connection(device_id).await?;
        let service = self.config.ui_dump_service.clone();
        let output = self
            .bounded(cancel, async {
                let mut stream = conn.open(&service).await?;
                Ok::<_, GatewayError>(stream.read_to_end().await?)
            })
            .await?;

        let text = String::from_utf8_lossy(&output);
        let xml = extract_hierarchy(&text).ok_or(ParseError::MissingRoot)?;
        Ok(PageSource::parse(xml)?)
    }

    /// Dump the page and return the best node matching `query`.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn find_element(
        &self,
        device_id: &str,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<PageSourceNode>, GatewayError> {
        let page = self.get_page_source(device_id, cancel).await?;
        Ok(crate::query::find_best(&page, query).and_then(|m| page.node(m.node).cloned()))
    }

    async fn connection(&self, device_id: &str) -> Result<Arc<Connection>, GatewayError> {
        let record = self
            .registry
            .get(device_id)
            .await
            .ok_or_else(|| GatewayError::DeviceNotFound(device_id.to_string()))?;

        match (record.state, record.transport) {
            (DeviceState::Device, Some(conn)) if !conn.is_closed() => Ok(conn),
            (DeviceState::Device, Some(_)) => Err(GatewayError::ConnectionLost(format!(
                "transport to {device_id} is closed"
            ))),
            (state, _) => Err(GatewayError::DeviceUnavailable {
                device_id: device_id.to_string(),
                state,
            }),
        }
    }

    async fn bounded<T, F>(&self, cancel: &CancellationToken, fut: F) -> Result<T, GatewayError>
    where
        F: std::future::Future<Output = Result<T, GatewayError>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            result = tokio::time::timeout(self.config.rpc_timeout, fut) => {
                result.map_err(|_| GatewayError::Timeout)?
            }
        }
    }
}

/// A running `logcat` stream.
#[derive(Debug)]
pub struct LogcatTail {
    stream: StreamHandle,
    lines: LineAssembler,
    cancel: CancellationToken,
    ended: bool,
}

impl LogcatTail {
    /// The next log line, or `None` once the device closes the stream.
    ///
    /// A final unterminated line is returned before `None`.
    pub async fn next_line(&mut self) -> Result<Option<String>, GatewayError> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            if self.ended {
                return Ok(self.lines.finish());
            }

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.stream.close();
                    return Err(GatewayError::Cancelled);
                }
                chunk = self.stream.read() => chunk?,
            };
            match chunk {
                Some(bytes) => self.lines.push(&bytes),
                None => self.ended = true,
            }
        }
    }

    /// Stop tailing. Lines already buffered stay readable.
    pub fn close(&mut self) {
        self.stream.close();
    }
}

async fn collect_shell_v2(stream: &mut StreamHandle) -> Result<ShellOutput, GatewayError> {
    let mut decoder = ShellV2Decoder::new();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    'read: while let Some(chunk) = stream.read().await? {
        decoder.push(&chunk);
        while let Some(packet) = decoder.next_packet()? {
            match packet {
                ShellPacket::Stdout(data) => stdout.extend_from_slice(&data),
                ShellPacket::Stderr(data) => stderr.extend_from_slice(&data),
                ShellPacket::Exit(code) => {
                    exit_code = Some(i32::from(code));
                    break 'read;
                }
                ShellPacket::Other { id, .. } => debug!(id, "ignoring shell packet"),
            }
        }
    }

    if exit_code.is_none() && decoder.pending() > 0 {
        return Err(GatewayError::Protocol(format!(
            "stream ended inside a shell packet ({} bytes pending)",
            decoder.pending()
        )));
    }

    Ok(ShellOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Cut the `<hierarchy>` document out of `uiautomator dump` output.
///
/// The dump is usually followed by a trailer such as
/// `UI hierchary dumped to: /dev/tty`.
pub fn extract_hierarchy(output: &str) -> Option<&str> {
    let start = output
        .find("<?xml")
        .filter(|xml| output[*xml..].contains("<hierarchy"))
        .or_else(|| output.find("<hierarchy"))?;

    const CLOSE: &str = "</hierarchy>";
    if let Some(end) = output.rfind(CLOSE) {
        if end > start {
            return Some(&output[start..end + CLOSE.len()]);
        }
    }

    // Self-closing root: `<hierarchy rotation="0"/>`.
    let root = start + output[start..].find("<hierarchy")?;
    let end = root + output[root..].find("/>")?;
    Some(&output[start..end + 2])
}

/// Display summary used by consumers listing search results.
#[derive(Debug, Clone, Serialize)]
pub struct ElementSummary {
    pub class_name: String,
    pub text: String,
    pub content_description: String,
    pub resource_id: String,
    pub bounds: crate::hierarchy::Rect,
    pub center: (i32, i32),
}

impl From<&PageSourceNode> for ElementSummary {
    fn from(node: &PageSourceNode) -> Self {
        Self {
            class_name: node.class_name.clone(),
            text: node.text.clone(),
            content_description: node.content_description.clone(),
            resource_id: node.resource_id.clone(),
            bounds: node.bounds,
            center: node.bounds.center(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_with_trailer() {
        let output = "<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation=\"0\"><node/></hierarchy>UI hierchary dumped to: /dev/tty\n";
        let xml = extract_hierarchy(output).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.ends_with("</hierarchy>"));
        assert!(PageSource::parse(xml).is_ok());
    }

    #[test]
    fn test_extract_with_leading_noise() {
        let output = "WARNING: linker: something\n<hierarchy rotation=\"0\"></hierarchy>\n";
        assert_eq!(
            extract_hierarchy(output),
            Some("<hierarchy rotation=\"0\"></hierarchy>")
        );
    }

    #[test]
    fn test_extract_self_closing() {
        let output = "<hierarchy rotation=\"0\"/>UI hierchary dumped to: /dev/tty";
        assert_eq!(extract_hierarchy(output), Some("<hierarchy rotation=\"0\"/>"));
    }

    #[test]
    fn test_extract_missing() {
        assert!(extract_hierarchy("ERROR: could not get idle state.").is_none());
    }

    #[test]
    fn test_stream_error_mapping() {
        assert_eq!(
            GatewayError::from(StreamError::ServiceRejected("logcat:".into())),
            GatewayError::ServiceRejected("logcat:".into())
        );
        assert_eq!(GatewayError::from(StreamError::Timeout), GatewayError::Timeout);
        assert!(matches!(
            GatewayError::from(StreamError::ProtocolViolation("x".into())),
            GatewayError::Protocol(_)
        ));
    }

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(config.logcat_service, "logcat:");
        assert_eq!(config.ui_dump_service, "shell:uiautomator dump /dev/tty");
    }
}
