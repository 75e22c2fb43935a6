//! CLI + env + TOML configuration (spec.md §6), mirroring the teacher's
//! `Config`/`ConfigFile` split: `clap::Parser` for CLI/env, a parallel
//! `serde`-derived struct for an optional TOML file whose values are
//! injected as env vars ahead of CLI parsing (so precedence stays
//! CLI > env > file).

use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Public tunnel hub: exposes private HTTP services behind NAT on unique
/// subdomains of `domain`.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address:port the public HTTP (and tunnel-creation) server binds to.
    #[arg(long, env = "TUNNELHUB_BIND_ADDR", default_value = "0.0.0.0:80")]
    pub bind_addr: String,

    /// Base domain that client subdomains are carved from (e.g. lt.example.com).
    #[arg(long, env = "TUNNELHUB_DOMAIN")]
    pub domain: String,

    /// Advertise `https://` URLs to clients instead of `http://`.
    #[arg(long, env = "TUNNELHUB_SECURE", default_value_t = false)]
    pub secure: bool,

    /// Optional URL to redirect bare-domain requests to.
    #[arg(long, env = "TUNNELHUB_LANDING")]
    pub landing: Option<String>,

    /// Per-client ceiling on simultaneous tunnel sockets.
    #[arg(long, env = "TUNNELHUB_MAX_TCP_SOCKETS", default_value_t = 10)]
    pub max_tcp_sockets: usize,

    /// Per-tunnel-socket idle timeout, in milliseconds.
    #[arg(long, env = "TUNNELHUB_SOCKET_TIMEOUT_MS", default_value_t = 60_000)]
    pub socket_timeout_ms: u64,

    /// Optional global cap on simultaneous live clients.
    #[arg(long, env = "TUNNELHUB_MAX_CLIENTS")]
    pub max_clients: Option<usize>,

    /// Best-effort public-IP lookup timeout, in milliseconds.
    #[arg(long, env = "TUNNELHUB_PUBLIC_IP_TIMEOUT_MS", default_value_t = 2_000)]
    pub public_ip_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TUNNELHUB_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "TUNNELHUB_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Validate cross-field invariants not expressible via `clap` alone.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.domain.trim().is_empty() {
            anyhow::bail!("domain must not be empty");
        }
        if self.max_tcp_sockets == 0 {
            anyhow::bail!("max_tcp_sockets must be at least 1");
        }
        if self.socket_timeout_ms == 0 {
            anyhow::bail!("socket_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn url_scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Serializable config for TOML file persistence. All fields are optional —
/// only populated values are written, and only populated values override
/// the environment when loaded.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landing: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tcp_sockets: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_clients: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
}

impl ConfigFile {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Inject values as environment variables so clap picks them up.
    /// Only sets variables that are **not** already present in the
    /// environment, preserving the precedence: CLI > env > config file.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("TUNNELHUB_BIND_ADDR", self.bind_addr);
        set!("TUNNELHUB_DOMAIN", self.domain);
        set!("TUNNELHUB_SECURE", self.secure);
        set!("TUNNELHUB_LANDING", self.landing);
        set!("TUNNELHUB_MAX_TCP_SOCKETS", self.max_tcp_sockets);
        set!("TUNNELHUB_SOCKET_TIMEOUT_MS", self.socket_timeout_ms);
        set!("TUNNELHUB_MAX_CLIENTS", self.max_clients);
        set!("TUNNELHUB_LOG_LEVEL", self.log_level);
        set!("TUNNELHUB_LOG_JSON", self.log_json);
    }
}
