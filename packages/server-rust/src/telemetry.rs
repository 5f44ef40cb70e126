//! Log sink and metrics exporter installation.

use std::net::SocketAddr;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::Level;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{ConfigError, LogConfig, LogFormat};

/// Transport internals that would otherwise drown call logs at debug level.
const QUIET_TARGETS: &[&str] = &["h2=warn", "hyper=warn", "tower=warn"];

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG`, when set, replaces the configured level entirely.
///
/// # Errors
///
/// Fails on an invalid level or if a global subscriber is already set.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = env_filter(config)?;

    tracing_subscriber::registry()
        .with(fmt_layer(config))
        .with(filter)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

fn env_filter(config: &LogConfig) -> Result<EnvFilter, ConfigError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::new(default_directives(config.level()?)))
}

fn default_directives(level: Level) -> String {
    let mut directives = vec![level.as_str().to_ascii_lowercase()];
    directives.extend(QUIET_TARGETS.iter().map(|target| (*target).to_string()));
    directives.join(",")
}

fn fmt_layer(config: &LogConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let timer = config.log_time_format.clone().map(ChronoUtc::new);
    match (config.log_format, timer) {
        (LogFormat::Json, Some(timer)) => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_timer(timer)
            .boxed(),
        (LogFormat::Json, None) => fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        (LogFormat::Text, Some(timer)) => fmt::layer().with_target(true).with_timer(timer).boxed(),
        (LogFormat::Text, None) => fmt::layer().with_target(true).boxed(),
    }
}

/// Starts the Prometheus scrape endpoint on `host:port`.
///
/// # Errors
///
/// Fails if the address is invalid or a metrics recorder is already set.
pub fn install_metrics_exporter(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid metrics address {host}:{port}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    tracing::info!(%addr, "metrics exporter listening");
    Ok(addr)
}
