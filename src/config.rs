//! Ambient: `ProxyConfig` (SPEC_FULL.md §3.2). Loaded from an optional
//! TOML file and overridable by CLI flags/env vars via clap, the same
//! shape as the teacher's `Args`/`Command` with `env = "..."` attrs.

use std::net::SocketAddr;

use clap::Args;
use serde::{Deserialize, Serialize};

fn default_max_buffered_bytes() -> usize {
    1024 * 1024
}

fn default_max_frame_size() -> u32 {
    100 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Args)]
pub struct ProxyConfig {
    /// Address the proxy listens for client connections on.
    #[arg(long, env = "KAFKA_FILTER_PROXY_LISTEN_ADDR")]
    pub listen_addr: SocketAddr,

    /// Bound (in bytes) on frames buffered before `Forwarding` is
    /// reached (SPEC_FULL.md §4(b)).
    #[arg(long, env = "KAFKA_FILTER_PROXY_MAX_BUFFERED_BYTES", default_value_t = default_max_buffered_bytes())]
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes_before_forwarding: usize,

    /// Hard cap on a single Kafka frame's size.
    #[arg(long, env = "KAFKA_FILTER_PROXY_MAX_FRAME_SIZE", default_value_t = default_max_frame_size())]
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size_bytes: u32,

    /// Answer `ApiVersions` locally and skip contacting the broker for
    /// it; does not implement SASL itself.
    #[arg(long, env = "KAFKA_FILTER_PROXY_SASL_OFFLOAD")]
    #[serde(default)]
    pub sasl_authentication_offload: bool,

    #[arg(long, env = "KAFKA_FILTER_PROXY_LOG_NETWORK")]
    #[serde(default)]
    pub log_network: bool,

    #[arg(long, env = "KAFKA_FILTER_PROXY_LOG_FRAMES")]
    #[serde(default)]
    pub log_frames: bool,

    #[arg(long, env = "KAFKA_FILTER_PROXY_TCP_NODELAY", default_value_t = true)]
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    #[arg(long, env = "KAFKA_FILTER_PROXY_INITIAL_AUTOREAD", default_value_t = true)]
    #[serde(default = "default_true")]
    pub initial_autoread: bool,
}

impl ProxyConfig {
    /// Loads overrides from a TOML file, falling back to each field's
    /// default where the file is silent. CLI/env values set via clap
    /// take precedence over the file when both are present (callers
    /// merge by preferring the clap-parsed struct's non-default
    /// fields, the way the teacher's `Args` already layers over env
    /// vars).
    pub fn from_toml_str(contents: &str) -> anyhow::Result<ProxyConfig> {
        Ok(toml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_omits_fields() {
        let config = ProxyConfig::from_toml_str("listen_addr = \"0.0.0.0:9092\"").unwrap();
        assert_eq!(
            config.max_buffered_bytes_before_forwarding,
            default_max_buffered_bytes()
        );
        assert!(config.tcp_nodelay);
        assert!(config.initial_autoread);
    }
}
