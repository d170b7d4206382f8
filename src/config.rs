use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use fanrelay_logging::{LogFormat, LoggingConfig};
use fanrelay_server::{AckPolicy, ServerConfig};
use tracing::Level;

/// Device session and command relay.
#[derive(Parser, Debug)]
#[command(name = "fanrelay", about = "Device session and command relay")]
pub struct Cli {
    /// Host to bind.
    #[arg(long, env = "FANRELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Path to the SQLite database. Defaults to `~/.fanrelay/fanrelay.db`.
    #[arg(long, env = "FANRELAY_DATABASE")]
    pub database: Option<PathBuf>,

    #[arg(long, env = "FANRELAY_LOG_LEVEL", default_value = "info")]
    pub log_level: Level,

    /// Per-module override, e.g. `fanrelay_store=debug`. Repeatable.
    #[arg(long = "log-module", value_parser = parse_module_level)]
    pub log_modules: Vec<(String, Level)>,

    /// `json` or `pretty`.
    #[arg(long, env = "FANRELAY_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Persist warn+ logs to this SQLite file.
    #[arg(long, env = "FANRELAY_LOG_DB")]
    pub log_db: Option<PathBuf>,

    /// `on-send` marks commands delivered when written to the socket;
    /// `on-ack` waits for the device to confirm.
    #[arg(long, env = "FANRELAY_ACK_POLICY", default_value = "on-send")]
    pub ack_policy: AckPolicy,

    /// Outbound frames buffered per connection.
    #[arg(long, default_value_t = 256)]
    pub max_send_queue: usize,

    /// Seconds between pings.
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_secs: u64,

    /// Seconds without a pong before a session is closed.
    #[arg(long, default_value_t = 90, value_parser = clap::value_parser!(u64).range(1..))]
    pub client_timeout_secs: u64,
}

impl Cli {
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(default_db_path)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            max_send_queue: self.max_send_queue,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            client_timeout: Duration::from_secs(self.client_timeout_secs),
            ack_policy: self.ack_policy,
        }
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            log_level: self.log_level,
            module_levels: self.log_modules.clone(),
            format: self.log_format,
            log_db_path: self.log_db.clone(),
        }
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".fanrelay").join("fanrelay.db")
}

fn parse_module_level(s: &str) -> Result<(String, Level), String> {
    let (module, level) = s
        .split_once('=')
        .ok_or_else(|| format!("expected MODULE=LEVEL, got `{s}`"))?;
    let level = level
        .parse::<Level>()
        .map_err(|e| format!("bad level for {module}: {e}"))?;
    Ok((module.to_string(), level))
}
