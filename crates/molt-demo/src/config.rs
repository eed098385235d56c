//! Demo configuration, from command-line flags or environment variables.
//!
//! A successor is spawned with the same arguments and environment as its
//! parent, so both generations resolve the same listener set.
//!
//! # Environment Variables
//!
//! - `MOLT_HTTP_ADDRS`: Comma-separated HTTP listen addresses. Default: `:8080`
//! - `MOLT_UDP_ADDRS`: Comma-separated UDP echo addresses. Default: none
//! - `MOLT_DRAIN_TIMEOUT_SECS`: Seconds to wait for servers to drain. Default: `30`
//! - `MOLT_LOG_FORMAT`: `text` or `json`. Default: `text`

use std::fmt;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// molt demo - HTTP and UDP echo servers that survive `SIGHUP` restarts
#[derive(Debug, Clone, Parser)]
#[command(name = "molt-demo")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// HTTP listen address (repeatable)
    #[arg(long = "http", env = "MOLT_HTTP_ADDRS", value_delimiter = ',', default_value = ":8080")]
    pub http: Vec<String>,

    /// UDP echo listen address (repeatable)
    #[arg(long = "udp", env = "MOLT_UDP_ADDRS", value_delimiter = ',')]
    pub udp: Vec<String>,

    /// Seconds to wait for servers to drain on shutdown
    #[arg(long, env = "MOLT_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    pub drain_timeout_secs: u64,

    /// Log output format
    #[arg(long, env = "MOLT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Config {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            http = ?self.http,
            udp = ?self.udp,
            drain_timeout_secs = self.drain_timeout_secs,
            log_format = %self.log_format,
            "Demo configuration"
        );
    }
}
