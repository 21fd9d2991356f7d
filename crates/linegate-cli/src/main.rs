//! linegate - expose a stdio JSON-lines process over WebSocket.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use linegate::config::{DEFAULT_HEALTH_PORT, DEFAULT_MESSAGE_PATH, DEFAULT_PORT};
use linegate::{Bridge, BridgeConfig, shutdown_signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    #[value(name = "none")]
    Off,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Off => "off",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "linegate", version, about)]
struct Cli {
    /// Command line of the child process (run through the shell)
    #[arg(long, env = "LINEGATE_STDIO", value_name = "CMD")]
    stdio: String,

    /// WebSocket listen port
    #[arg(long, env = "LINEGATE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Public base URL; its hostname is used as the bind host
    #[arg(long, env = "LINEGATE_BASE_URL")]
    base_url: Option<String>,

    /// Path clients connect on
    #[arg(long, env = "LINEGATE_MESSAGE_PATH", default_value = DEFAULT_MESSAGE_PATH)]
    message_path: String,

    /// Allow cross-origin requests
    #[arg(long, env = "LINEGATE_CORS")]
    cors: bool,

    /// Health check path; may be repeated
    #[arg(
        long = "health-endpoint",
        env = "LINEGATE_HEALTH_ENDPOINTS",
        value_name = "PATH",
        value_delimiter = ','
    )]
    health_endpoints: Vec<String>,

    /// Health server port
    #[arg(long, env = "LINEGATE_HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    health_port: u16,

    /// Log verbosity; RUST_LOG takes precedence
    #[arg(long, env = "LINEGATE_LOG_LEVEL", value_enum, default_value = "info")]
    log_level: LogLevel,
}

impl Cli {
    fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            command: self.stdio.clone(),
            port: self.port,
            base_url: self.base_url.clone(),
            message_path: self.message_path.clone(),
            cors: self.cors,
            health_endpoints: self.health_endpoints.clone(),
            health_port: self.health_port,
        }
    }
}

/// Logs go to stderr; stdout is left alone.
fn init_tracing(level: LogLevel) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(level.directive())
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = cli.bridge_config();
    config.validate().context("invalid configuration")?;

    tracing::info!("linegate {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        command = %config.command,
        port = config.port,
        message_path = %config.message_path,
        cors = config.cors,
        health_endpoints = ?config.health_endpoints,
        health_port = config.health_port,
        "Starting bridge"
    );

    let bridge = Bridge::new(config);
    let shutdown = bridge.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let exit = bridge.run().await;
    Ok(exit.code)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            1
        }
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_library() {
        let cli = Cli::try_parse_from(["linegate", "--stdio", "node server.js"]).unwrap();
        let config = cli.bridge_config();
        assert_eq!(config, BridgeConfig::new("node server.js"));
        assert_eq!(cli.log_level, LogLevel::Info);
    }

    #[test]
    fn all_flags_parse() {
        let cli = Cli::try_parse_from([
            "linegate",
            "--stdio",
            "python server.py",
            "--port",
            "9000",
            "--base-url",
            "http://127.0.0.1:9000",
            "--message-path",
            "/ws",
            "--cors",
            "--health-endpoint",
            "/healthz",
            "--health-endpoint",
            "/ready",
            "--health-port",
            "9001",
            "--log-level",
            "none",
        ])
        .unwrap();

        assert_eq!(cli.log_level, LogLevel::Off);
        let config = cli.bridge_config();
        assert_eq!(config.port, 9000);
        assert_eq!(config.base_url.as_deref(), Some("http://127.0.0.1:9000"));
        assert_eq!(config.message_path, "/ws");
        assert!(config.cors);
        assert_eq!(config.health_endpoints, vec!["/healthz", "/ready"]);
        assert_eq!(config.health_port, 9001);
    }

    #[test]
    fn stdio_is_required() {
        assert!(Cli::try_parse_from(["linegate"]).is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(
            Cli::try_parse_from(["linegate", "--stdio", "cat", "--log-level", "loud"]).is_err()
        );
    }
}
