//! Process-wide forwarder configuration.
//!
//! Built once at startup from the environment and immutable thereafter.
//! Violated invariants are fatal before either listener binds.

use ctxforge_header_rules::HeaderRule;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    /// Ordered propagation rules. Never empty.
    pub rules: Vec<HeaderRule>,

    /// The co-located application's address, `host:port`.
    pub target_host: String,

    /// Port shared by the reverse-proxy and forward-proxy roles.
    pub proxy_port: u16,

    /// Admin listener port (health + metrics).
    pub metrics_port: u16,

    pub read_timeout: Duration,
    pub read_header_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub target_dial_timeout: Duration,

    pub rate_limit: Option<RateLimit>,
}

#[derive(Copy, Clone, Debug)]
pub struct RateLimit {
    pub requests_per_second: f64,
    pub burst: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidConfig {
    #[error("header rules: {0}")]
    Rules(#[from] ctxforge_header_rules::ParseError),

    #[error("TARGET_HOST {0:?} is not a host:port address")]
    TargetHost(String),

    #[error("METRICS_PORT must differ from PROXY_PORT ({0})")]
    PortCollision(u16),

    #[error("{name} must be strictly positive")]
    NonPositiveTimeout { name: &'static str },

    #[error("RATE_LIMIT_RPS must be strictly positive")]
    RateLimitRps,

    #[error("RATE_LIMIT_BURST must be at least 1")]
    RateLimitBurst,
}

impl Config {
    /// Checks the configuration invariants, returning the first violation.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if !valid_host_port(&self.target_host) {
            return Err(InvalidConfig::TargetHost(self.target_host.clone()));
        }
        // Port 0 asks the OS for an ephemeral port and cannot collide.
        if self.proxy_port == self.metrics_port && self.proxy_port != 0 {
            return Err(InvalidConfig::PortCollision(self.proxy_port));
        }
        for (name, timeout) in [
            ("READ_TIMEOUT", self.read_timeout),
            ("READ_HEADER_TIMEOUT", self.read_header_timeout),
            ("WRITE_TIMEOUT", self.write_timeout),
            ("IDLE_TIMEOUT", self.idle_timeout),
            ("TARGET_DIAL_TIMEOUT", self.target_dial_timeout),
        ] {
            if timeout.is_zero() {
                return Err(InvalidConfig::NonPositiveTimeout { name });
            }
        }
        if let Some(limit) = &self.rate_limit {
            if !(limit.requests_per_second > 0.0) {
                return Err(InvalidConfig::RateLimitRps);
            }
            if limit.burst == 0 {
                return Err(InvalidConfig::RateLimitBurst);
            }
        }
        Ok(())
    }
}

fn valid_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            !host.is_empty() && port.parse::<u16>().map(|p| p > 0).unwrap_or(false)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_header_rules::parse_simple_list;

    fn base() -> Config {
        Config {
            rules: parse_simple_list("x-request-id").unwrap(),
            target_host: "localhost:8080".to_string(),
            proxy_port: 9090,
            metrics_port: 9091,
            read_timeout: Duration::from_secs(30),
            read_header_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            target_dial_timeout: Duration::from_secs(10),
            rate_limit: None,
        }
    }

    #[test]
    fn accepts_defaults() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_port_collision() {
        let mut config = base();
        config.metrics_port = config.proxy_port;
        assert!(matches!(
            config.validate(),
            Err(InvalidConfig::PortCollision(9090))
        ));
    }

    #[test]
    fn rejects_zero_timeouts() {
        let mut config = base();
        config.idle_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("IDLE_TIMEOUT"));
    }

    #[test]
    fn rejects_bad_target() {
        for target in ["localhost", "localhost:0", ":8080", "localhost:http"] {
            let mut config = base();
            config.target_host = target.to_string();
            assert!(config.validate().is_err(), "{target} should be rejected");
        }
    }

    #[test]
    fn rejects_degenerate_rate_limits() {
        let mut config = base();
        config.rate_limit = Some(RateLimit {
            requests_per_second: 0.0,
            burst: 10,
        });
        assert!(config.validate().is_err());

        config.rate_limit = Some(RateLimit {
            requests_per_second: 5.0,
            burst: 0,
        });
        assert!(config.validate().is_err());
    }
}
