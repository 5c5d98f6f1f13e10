//! Command line front end for the droidmux ADB proxy engine.
//!
//! Every device command runs one registry pass over the configured
//! endpoints, then a single gateway operation against the named device.
//!
//! # Usage
//!
//! ```bash
//! # List devices reachable at the given endpoints
//! droidmux -e 192.168.1.20:5555 devices
//!
//! # Run a shell command
//! droidmux -e 192.168.1.20:5555 shell 192.168.1.20:5555 getprop ro.product.model
//!
//! # Follow the device log until Ctrl-C
//! droidmux logcat 192.168.1.20:5555
//!
//! # Dump the UI hierarchy as JSON
//! droidmux --format json dump 192.168.1.20:5555
//!
//! # Find the element a tester would call "Login button"
//! droidmux find 192.168.1.20:5555 "Login button"
//!
//! # Endpoints can come from the environment
//! DROIDMUX_ENDPOINTS=10.0.0.5:5555,10.0.0.6:5555 droidmux devices
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use droidmux_core::config::{ConfigError, DroidmuxConfig};
use droidmux_core::discovery::{GetpropReader, StaticDiscovery, TcpConnector};
use droidmux_core::gateway::{ElementSummary, Gateway, GatewayError};
use droidmux_core::hierarchy::PageSource;
use droidmux_core::query::clean_query;
use droidmux_core::registry::{DeviceRegistry, RegistryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Talk to Android devices over the ADB wire protocol.
#[derive(Parser, Debug)]
#[command(name = "droidmux")]
#[command(about = "Proxy shell, logcat and UI dump operations to Android devices over ADB")]
#[command(version)]
struct Cli {
    /// adbd endpoint (host:port); repeatable, overrides the config file
    #[arg(
        short,
        long = "endpoint",
        env = "DROIDMUX_ENDPOINTS",
        value_delimiter = ','
    )]
    endpoints: Vec<String>,

    /// Config file (default: ~/.droidmux/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List known devices and their state
    Devices,

    /// Run a shell command on a device
    Shell {
        /// Device serial
        serial: String,
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Stream the device log until interrupted
    Logcat {
        /// Device serial
        serial: String,
    },

    /// Dump the current UI hierarchy
    Dump {
        /// Device serial
        serial: String,
    },

    /// Find the element best matching a natural-language query
    Find {
        /// Device serial
        serial: String,
        /// Query such as "Sign in button"
        query: String,
    },

    /// Show how a query is normalized before matching
    CleanQuery {
        /// Query text
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code();
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

/// Logs go to stderr (`RUST_LOG`, default `warn`) and optionally to a file.
fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    let Some(path) = log_file else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };

    let file_name = path
        .file_name()
        .ok_or_else(|| CliError::Operation(format!("invalid log file: {}", path.display())))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .map_err(|e| CliError::Operation(format!("cannot create {}: {}", dir.display(), e)))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(Some(guard))
}

#[derive(Debug)]
enum CliError {
    /// The device answered but the operation did not succeed.
    Operation(String),
    /// Device missing, unreachable or not ready.
    Device(String),
    /// Malformed data from the device.
    Protocol(String),
}

impl CliError {
    fn code(&self) -> u8 {
        match self {
            CliError::Operation(_) => 1,
            CliError::Device(_) => 2,
            CliError::Protocol(_) => 3,
        }
    }

    fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Operation(msg) => write!(f, "Operation failed: {}", msg),
            CliError::Device(msg) => write!(f, "Device error: {}", msg),
            CliError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl From<GatewayError> for CliError {
    fn from(err: GatewayError) -> Self {
        let msg = err.to_string();
        match err {
            GatewayError::DeviceNotFound(_)
            | GatewayError::DeviceUnavailable { .. }
            | GatewayError::ConnectionLost(_) => CliError::Device(msg),
            GatewayError::ServiceRejected(_) | GatewayError::Timeout | GatewayError::Cancelled => {
                CliError::Operation(msg)
            }
            GatewayError::Parse(_) | GatewayError::Protocol(_) => CliError::Protocol(msg),
        }
    }
}

impl From<RegistryError> for CliError {
    fn from(err: RegistryError) -> Self {
        CliError::Device(err.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::Operation(err.to_string())
    }
}

fn load_config(cli: &Cli) -> Result<DroidmuxConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => DroidmuxConfig::load_from(path)?,
        None => DroidmuxConfig::load(),
    };
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }
    Ok(config)
}

/// Build the registry, run one forced pass and wrap it in a gateway.
async fn connect(config: &DroidmuxConfig) -> Result<Gateway, CliError> {
    if config.endpoints.is_empty() {
        return Err(CliError::Device(
            "no endpoints configured (use --endpoint or DROIDMUX_ENDPOINTS)".to_string(),
        ));
    }

    let registry = Arc::new(DeviceRegistry::new(
        Arc::new(StaticDiscovery::new(config.endpoints.clone())),
        Arc::new(GetpropReader),
        Arc::new(TcpConnector::new(config.connection_config())),
        config.registry_config(),
    ));
    let changes = registry.update(true).await?;
    debug!(added = changes.added.len(), "initial registry pass");

    Ok(Gateway::new(registry, config.gateway_config()))
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            trigger.cancel();
        }
    });
    token
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    // No device needed
    if let Command::CleanQuery { text } = &cli.command {
        let cleaned = clean_query(text);
        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::json!({ "query": cleaned })),
            OutputFormat::Text => println!("{}", cleaned),
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&cli)?;
    let gateway = connect(&config).await?;
    let cancel = cancel_on_ctrl_c();

    let result = execute(&cli, &gateway, &cancel).await;
    gateway.registry().shutdown().await;
    result
}

async fn execute(cli: &Cli, gateway: &Gateway, cancel: &CancellationToken) -> Result<ExitCode, CliError> {
    match &cli.command {
        Command::Devices => {
            let devices = gateway.registry().devices().await;
            if cli.format == OutputFormat::Json {
                println!("{}", to_json(&devices)?);
            } else if devices.is_empty() {
                eprintln!("No devices found");
            } else {
                for device in &devices {
                    let model = device
                        .properties
                        .get("ro.product.model")
                        .map(String::as_str)
                        .unwrap_or("-");
                    match &device.last_error {
                        Some(error) => println!("{}\t{}\t{}\t({})", device.device_id, device.state, model, error),
                        None => println!("{}\t{}\t{}", device.device_id, device.state, model),
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Shell { serial, command } => {
            let output = gateway.run_shell(serial, &command.join(" "), cancel).await?;
            if cli.format == OutputFormat::Json {
                println!("{}", to_json(&output)?);
            } else {
                print!("{}", output.stdout);
                eprint!("{}", output.stderr);
            }
            // Mirror the remote exit status when the device reports one.
            Ok(match output.exit_code {
                Some(0) | None => ExitCode::SUCCESS,
                Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
            })
        }
        Command::Logcat { serial } => {
            let mut tail = gateway.tail_logcat(serial, cancel).await?;
            loop {
                match tail.next_line().await {
                    Ok(Some(line)) => match cli.format {
                        OutputFormat::Json => println!("{}", serde_json::json!({ "line": line })),
                        OutputFormat::Text => println!("{}", line),
                    },
                    Ok(None) | Err(GatewayError::Cancelled) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Dump { serial } => {
            let page = gateway.get_page_source(serial, cancel).await?;
            if cli.format == OutputFormat::Json {
                println!("{}", to_json(&page)?);
            } else {
                print!("{}", format_tree(&page));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Find { serial, query } => {
            let node = gateway
                .find_element(serial, query, cancel)
                .await?
                .ok_or_else(|| CliError::Operation(format!("no element matches '{}'", query)))?;
            let summary = ElementSummary::from(&node);
            if cli.format == OutputFormat::Json {
                println!("{}", to_json(&summary)?);
            } else {
                println!("{}", format_summary(&summary));
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::CleanQuery { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, CliError> {
    serde_json::to_string_pretty(value).map_err(|e| CliError::Protocol(e.to_string()))
}

fn format_summary(summary: &ElementSummary) -> String {
    let mut out = short_class(&summary.class_name).to_string();
    if !summary.text.is_empty() {
        out.push_str(&format!(" \"{}\"", summary.text));
    }
    if !summary.content_description.is_empty() {
        out.push_str(&format!(" desc=\"{}\"", summary.content_description));
    }
    if !summary.resource_id.is_empty() {
        out.push_str(&format!(" id={}", summary.resource_id));
    }
    let b = summary.bounds;
    out.push_str(&format!(
        " [{},{}][{},{}] center=({},{})",
        b.left, b.top, b.right, b.bottom, summary.center.0, summary.center.1
    ));
    out
}

/// Indented one-line-per-node rendering of a page.
fn format_tree(page: &PageSource) -> String {
    let mut out = String::new();
    for node in page.iter() {
        let indent = "  ".repeat(node.depth);
        if node.parent.is_none() {
            out.push_str(&format!("{}{} rotation={}\n", indent, node.tag, page.rotation));
            continue;
        }
        out.push_str(&indent);
        out.push_str(&format_summary(&ElementSummary::from(node)));
        out.push('\n');
    }
    out
}

/// `android.widget.Button` -> `Button`.
fn short_class(class_name: &str) -> &str {
    match class_name.rsplit_once('.') {
        Some((_, short)) => short,
        None if class_name.is_empty() => "?",
        None => class_name,
    }
}
