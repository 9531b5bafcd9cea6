//! The ctxforge sidecar forwarder.
//!
//! A single HTTP/1.x listener plays two roles at once: a reverse proxy in
//! front of the co-located application container (origin-form requests) and
//! a forward proxy for the application's own outbound calls (absolute-form
//! and CONNECT requests). Declared headers are extracted or synthesized per
//! request, carried in a request-scoped [`scope::RequestScope`], and
//! re-attached to the forwarded request. A second listener serves health and
//! metrics endpoints.

#![forbid(unsafe_code)]

pub mod admin;
pub mod args;
pub mod config;
pub mod duration;
pub mod metrics;
pub mod proxy;
pub mod ratelimit;
pub mod scope;

mod io;

pub use self::args::Args;
pub use self::config::Config;

use anyhow::{Context, Result};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// The bound forwarder: both listeners open, ports resolved, not yet
/// serving.
pub struct Forwarder {
    proxy: proxy::Server,
    admin: admin::Server,
}

impl Forwarder {
    /// Binds the proxy and admin listeners and wires up shared state.
    /// Configuration errors and bind failures are fatal; nothing is served
    /// until [`Forwarder::run`].
    pub async fn bind(config: Config, registry: &mut Registry) -> Result<Self> {
        let metrics = metrics::Metrics::register(registry);

        let proxy_addr = SocketAddr::from(([0, 0, 0, 0], config.proxy_port));
        let proxy_listener = TcpListener::bind(proxy_addr)
            .await
            .with_context(|| format!("failed to bind proxy listener on {proxy_addr}"))?;

        let admin_addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
        let admin_listener = TcpListener::bind(admin_addr)
            .await
            .with_context(|| format!("failed to bind admin listener on {admin_addr}"))?;

        let admin = admin::Server::new(admin_listener, config.target_host.clone());
        let proxy = proxy::Server::new(proxy_listener, config, metrics);

        Ok(Self { proxy, admin })
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy.local_addr()
    }

    pub fn admin_addr(&self) -> SocketAddr {
        self.admin.local_addr()
    }

    /// Serves both listeners until the drain watch fires, then lets
    /// in-flight connections finish.
    pub async fn run(self, drain: drain::Watch, registry: Arc<Registry>) {
        let Self { proxy, admin } = self;
        let admin = tokio::spawn(admin.run(drain.clone(), registry));
        proxy.run(drain).await;
        let _ = admin.await;
    }
}
