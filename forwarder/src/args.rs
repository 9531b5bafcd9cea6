//! Command-line and environment configuration for the forwarder binary.

use crate::config::{Config, RateLimit};
use crate::duration::Timeout;
use crate::Forwarder;
use anyhow::{Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[clap(
    name = "forwarder",
    about = "Transparent header-propagation sidecar proxy"
)]
pub struct Args {
    /// Legacy comma-separated header-name list.
    #[clap(long, env = "HEADERS_TO_PROPAGATE")]
    headers_to_propagate: Option<String>,

    /// Structured JSON rule array; takes precedence over the simple list.
    #[clap(long, env = "HEADER_RULES")]
    header_rules: Option<String>,

    /// The co-located application's address.
    #[clap(long, env = "TARGET_HOST", default_value = "localhost:8080")]
    target_host: String,

    /// Port shared by the reverse-proxy and forward-proxy roles.
    #[clap(long, env = "PROXY_PORT", default_value = "9090")]
    proxy_port: u16,

    /// Admin (health + metrics) port; must differ from the proxy port.
    #[clap(long, env = "METRICS_PORT", default_value = "9091")]
    metrics_port: u16,

    #[clap(long, env = "READ_TIMEOUT", default_value = "30s")]
    read_timeout: Timeout,

    #[clap(long, env = "READ_HEADER_TIMEOUT", default_value = "10s")]
    read_header_timeout: Timeout,

    #[clap(long, env = "WRITE_TIMEOUT", default_value = "30s")]
    write_timeout: Timeout,

    #[clap(long, env = "IDLE_TIMEOUT", default_value = "120s")]
    idle_timeout: Timeout,

    #[clap(long, env = "TARGET_DIAL_TIMEOUT", default_value = "10s")]
    target_dial_timeout: Timeout,

    #[clap(
        long,
        env = "RATE_LIMIT_ENABLED",
        action = clap::ArgAction::Set,
        default_value_t = false
    )]
    rate_limit_enabled: bool,

    #[clap(long, env = "RATE_LIMIT_RPS", default_value = "100.0")]
    rate_limit_rps: f64,

    #[clap(long, env = "RATE_LIMIT_BURST", default_value = "200")]
    rate_limit_burst: u32,

    #[clap(long, env = "LOG_LEVEL", value_enum, default_value = "info")]
    log_level: LogLevel,

    #[clap(long, env = "LOG_FORMAT", value_enum, default_value = "console")]
    log_format: LogFormat,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogFormat {
    Console,
    Json,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        self.init_tracing();

        let config = self.into_config().context("invalid configuration")?;

        let mut registry = Registry::default();
        let forwarder = Forwarder::bind(config, &mut registry).await?;
        let registry = Arc::new(registry);
        info!(
            proxy = %forwarder.proxy_addr(),
            admin = %forwarder.admin_addr(),
            "forwarder listening"
        );

        let (signal, watch) = drain::channel();
        let serve = tokio::spawn(forwarder.run(watch, registry));

        shutdown_signal().await?;
        info!("shutdown signal received; draining connections");
        signal.drain().await;
        serve.await.context("forwarder task panicked")?;
        Ok(())
    }

    fn init_tracing(&self) {
        let filter = tracing_subscriber::EnvFilter::new(match self.log_level {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        });
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match self.log_format {
            LogFormat::Console => builder.init(),
            LogFormat::Json => builder.json().init(),
        }
    }

    fn into_config(self) -> Result<Config> {
        let rules = ctxforge_header_rules::Engine::from_sources(
            self.headers_to_propagate.as_deref(),
            self.header_rules.as_deref(),
        )
        .map(|engine| engine.rules().to_vec())?;

        let config = Config {
            rules,
            target_host: self.target_host,
            proxy_port: self.proxy_port,
            metrics_port: self.metrics_port,
            read_timeout: self.read_timeout.into(),
            read_header_timeout: self.read_header_timeout.into(),
            write_timeout: self.write_timeout.into(),
            idle_timeout: self.idle_timeout.into(),
            target_dial_timeout: self.target_dial_timeout.into(),
            rate_limit: self.rate_limit_enabled.then_some(RateLimit {
                requests_per_second: self.rate_limit_rps,
                burst: self.rate_limit_burst,
            }),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_match_the_documented_surface() {
        let args = Args::parse_from(["forwarder", "--headers-to-propagate", "x-request-id"]);
        let config = args.into_config().unwrap();
        assert_eq!(config.target_host, "localhost:8080");
        assert_eq!(config.proxy_port, 9090);
        assert_eq!(config.metrics_port, 9091);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.read_header_timeout, Duration::from_secs(10));
        assert_eq!(config.write_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.target_dial_timeout, Duration::from_secs(10));
        assert!(config.rate_limit.is_none());
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].name(), "X-Request-Id");
    }

    #[test]
    fn structured_rules_override_the_simple_list() {
        let args = Args::parse_from([
            "forwarder",
            "--headers-to-propagate",
            "x-ignored",
            "--header-rules",
            r#"[{"name":"x-request-id","generate":true}]"#,
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].name(), "X-Request-Id");
        assert!(config.rules[0].generates());
    }

    #[test]
    fn rate_limit_flags_build_the_limiter_config() {
        let args = Args::parse_from([
            "forwarder",
            "--headers-to-propagate",
            "x-a",
            "--rate-limit-enabled",
            "true",
            "--rate-limit-rps",
            "5.5",
            "--rate-limit-burst",
            "10",
        ]);
        let config = args.into_config().unwrap();
        let limit = config.rate_limit.expect("rate limit enabled");
        assert_eq!(limit.requests_per_second, 5.5);
        assert_eq!(limit.burst, 10);
    }

    #[test]
    fn missing_rules_are_a_config_error() {
        let args = Args::parse_from(["forwarder"]);
        assert!(args.into_config().is_err());
    }

    #[test]
    fn malformed_durations_are_rejected_at_parse_time() {
        let result = Args::try_parse_from([
            "forwarder",
            "--headers-to-propagate",
            "x-a",
            "--read-timeout",
            "soon",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn port_collisions_are_a_config_error() {
        let args = Args::parse_from([
            "forwarder",
            "--headers-to-propagate",
            "x-a",
            "--proxy-port",
            "9090",
            "--metrics-port",
            "9090",
        ]);
        assert!(args.into_config().is_err());
    }
}
