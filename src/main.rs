use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kafka_filter_proxy::config::ProxyConfig;
use kafka_filter_proxy::filter::KafkaFilter;
use kafka_filter_proxy::filters::topic_prefix::TopicPrefixFilter;
use kafka_filter_proxy::listener;
use kafka_filter_proxy::metrics::TracingMetricsSink;
use kafka_filter_proxy::net_filter::{HostPort, StaticNetFilter};

/// Starts the proxy, forwarding every connection to a single configured
/// upstream broker.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(flatten)]
    config: ProxyConfig,

    /// Load `config` from this TOML file instead of CLI flags/env vars.
    #[arg(long, env = "KAFKA_FILTER_PROXY_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Upstream broker every connection is routed to.
    #[arg(long, env = "KAFKA_FILTER_PROXY_UPSTREAM")]
    upstream: String,

    /// Label attached to every connection's route (spec §4.7 decision).
    #[arg(long, env = "KAFKA_FILTER_PROXY_VIRTUAL_CLUSTER", default_value = "default")]
    virtual_cluster: String,

    /// Enables the reference `topic_prefix` filter, rejecting
    /// `CreateTopics` requests for topics missing this prefix.
    #[arg(long, env = "KAFKA_FILTER_PROXY_REQUIRED_TOPIC_PREFIX")]
    required_topic_prefix: Option<String>,
}

fn load_config(cli: &Cli) -> Result<ProxyConfig> {
    match &cli.config_file {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            ProxyConfig::from_toml_str(&contents)
        }
        None => Ok(cli.config.clone()),
    }
}

fn parse_upstream(raw: &str) -> Result<HostPort> {
    let (host, port) = raw
        .rsplit_once(':')
        .with_context(|| format!("upstream address {raw} is not in host:port form"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("upstream port {port} is not a valid u16"))?;
    Ok(HostPort::new(host, port))
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(load_config(&cli)?);
    let upstream = parse_upstream(&cli.upstream)?;

    let mut filters: Vec<Arc<dyn KafkaFilter>> = Vec::new();
    if let Some(prefix) = &cli.required_topic_prefix {
        filters.push(TopicPrefixFilter::new(prefix.clone()));
    }

    let net_filter = Arc::new(StaticNetFilter::new(upstream, filters, cli.virtual_cluster));
    let metrics = Arc::new(TracingMetricsSink);

    listener::run(config, net_filter, metrics).await
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    run(Cli::parse())
}
