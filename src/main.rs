//! TideMQ - exact-topic MQTT v3.1.1 broker
//!
//! Usage:
//!   tidemq [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>        Configuration file path
//!   -b, --bind <ADDR>          Bind address (default: 0.0.0.0:1883)
//!   --ws-bind <ADDR>           WebSocket bind address
//!   --tls-bind <ADDR>          TLS bind address
//!   --cert <FILE>              TLS certificate (PEM)
//!   --key <FILE>               TLS private key (PEM)
//!   --max-connections <N>      Maximum connections (default: 100000)
//!   -l, --log-level <LEVEL>    Log level (error, warn, info, debug, trace)
//!   -h, --help                 Print help

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tidemq::broker::{Broker, BrokerConfig, TlsConfig};
use tidemq::config::Config;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// TideMQ - exact-topic MQTT broker
#[derive(Parser, Debug)]
#[command(name = "tidemq")]
#[command(version)]
#[command(about = "Exact-topic MQTT v3.1.1 broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// WebSocket bind address (enables MQTT over WebSocket)
    #[arg(long)]
    ws_bind: Option<SocketAddr>,

    /// TLS bind address (requires a certificate and key)
    #[arg(long)]
    tls_bind: Option<SocketAddr>,

    /// TLS certificate chain (PEM)
    #[arg(long, requires = "key")]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<String>,

    /// Maximum connections (0 = unbounded)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    /// CLI flags win over the config file
    fn apply(&self, config: &mut BrokerConfig) {
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(ws_bind) = self.ws_bind {
            config.ws_bind_addr = Some(ws_bind);
        }
        if let Some(tls_bind) = self.tls_bind {
            config.tls_bind_addr = Some(tls_bind);
        }
        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            let tls = config.tls.get_or_insert_with(TlsConfig::default);
            tls.cert_path = cert.clone();
            tls.key_path = key.clone();
        }
        if let Some(max_connections) = self.max_connections {
            config.max_connections = max_connections;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let mut broker_config = BrokerConfig::from_config(&file_config);
    args.apply(&mut broker_config);

    if broker_config.tls_bind_addr.is_some() && broker_config.tls.is_none() {
        eprintln!("--tls-bind requires --cert and --key (or a [server.tls] section)");
        std::process::exit(1);
    }

    info!("Starting TideMQ MQTT Broker");
    info!("  Bind address: {}", broker_config.bind_addr);
    if let Some(addr) = &broker_config.tls_bind_addr {
        info!("  TLS address: {}", addr);
    }
    if let Some(addr) = &broker_config.ws_bind_addr {
        info!("  WebSocket address: {}", addr);
    }
    if let Some(addr) = &broker_config.wss_bind_addr {
        info!("  WebSocket/TLS address: {}", addr);
    }
    info!("  Max connections: {}", broker_config.max_connections);
    info!("  Max packet size: {} bytes", broker_config.max_packet_size);
    info!(
        "  Subscriptions: resubscribe={:?}, unsubscribe_scope={:?}",
        broker_config.subscription_policy.resubscribe,
        broker_config.subscription_policy.unsubscribe_scope
    );

    let broker = Broker::new(broker_config);

    let run = broker.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => {
            if let Err(e) = result {
                error!("Broker failed: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            broker.shutdown();
            run.await?;
        }
    }

    Ok(())
}
