use crate::admission::{Admission, FailurePolicy};
use crate::inject::InjectorConfig;
use anyhow::{bail, Result};
use clap::Parser;
use ctxforge_k8s_api as k8s;
use ctxforge_k8s_status as status;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "controller", about = "The ctxforge injection controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "ctxforge=info,warn",
        env = "CTXFORGE_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// The forwarder image injected into opted-in pods.
    #[clap(
        long,
        env = "FORWARDER_IMAGE",
        default_value = "ghcr.io/ctxforge/forwarder:latest"
    )]
    forwarder_image: String,

    /// Log level handed to injected forwarders.
    #[clap(long, default_value = "info")]
    forwarder_log_level: String,

    /// What to do when the injection patch cannot be built.
    #[clap(long, value_enum, default_value = "fail")]
    failure_policy: FailurePolicy,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            forwarder_image,
            forwarder_log_level,
            failure_policy,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let prom = <Registry>::default();
        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // The status index watches policies and pods and enqueues
        // reconciliation work for the controller task.
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let status_index = status::Index::shared(updates_tx);

        let policies = runtime
            .watch_all::<k8s::policy::HeaderPropagationPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(status_index.clone(), policies)
                .instrument(info_span!("headerpropagationpolicies")),
        );

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(status_index.clone(), pods).instrument(info_span!("pods")),
        );

        tokio::spawn(
            status::Index::run(status_index.clone(), status::SWEEP_PERIOD)
                .instrument(info_span!("sweep")),
        );

        let controller = status::Controller::new(runtime.client(), updates_rx);
        tokio::spawn(controller.run().instrument(info_span!("status_controller")));

        let injector = Arc::new(InjectorConfig {
            image: forwarder_image,
            log_level: forwarder_log_level,
        });
        let runtime =
            runtime.spawn_server(move || Admission::new(injector.clone(), failure_policy));

        // Block on the shutdown signal; background tasks drain with the
        // runtime.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}
