use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints};
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf};
use tracing::{info, info_span, Instrument};
use xds_controller_bootstrap::{Snapshot, SnapshotProxy};
use xds_controller_core::{Node, SnapshotDocument};
use xds_controller_http::{Metrics, XdsHandler};
use xds_controller_index::{
    split_object_name, Config, ConfigMetrics, ConfigStore, EndpointIndex,
};

#[derive(Debug, Parser)]
#[clap(name = "xds-controller", about = "An xDS configuration control plane", version)]
pub struct Args {
    #[clap(
        long,
        default_value = "xds_controller=info,warn",
        env = "XDS_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile cluster configuration into discovery responses.
    Server(ServerArgs),

    /// Serve a previously captured snapshot, forwarding to the live
    /// control plane as each resource class is consumed.
    Proxy(ProxyArgs),

    /// Capture a bootstrap snapshot from a live control plane.
    Bootstrap(FetchArgs),

    /// Validate a configuration object without installing it.
    Validate(ValidateArgs),
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            command,
        } = self;
        match command {
            // The kubert runtime initializes logging itself.
            Command::Server(args) => args.run(log_level, log_format).await,
            Command::Proxy(args) => {
                log_format.try_init(log_level).expect("must configure logging");
                args.run().await
            }
            Command::Bootstrap(args) => {
                log_format.try_init(log_level).expect("must configure logging");
                args.run().await
            }
            Command::Validate(args) => {
                log_format.try_init(log_level).expect("must configure logging");
                args.run()
            }
        }
    }
}

#[derive(Debug, clap::Args)]
struct ServerArgs {
    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// `namespace/name` of the ConfigMap holding the desired configuration.
    #[clap(long, env = "XDS_CONFIGMAP", default_value = "default/xds")]
    config_name: String,

    /// Listen address of the discovery server.
    #[clap(long, env = "XDS_LISTEN", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,
}

// === impl ServerArgs ===

impl ServerArgs {
    async fn run(self, log_level: kubert::LogFilter, log_format: kubert::LogFormat) -> Result<()> {
        let (namespace, name) = split_object_name(&self.config_name)
            .ok_or_else(|| anyhow!("--config-name must be of the form namespace/name"))?;

        let mut prom = <Registry>::default();
        let xds_registry = prom.sub_registry_with_prefix("xds");
        let metrics = Metrics::register(xds_registry);
        let config_metrics = ConfigMetrics::register(xds_registry);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(self.admin.into_builder().with_prometheus(prom))
            .with_client(self.client)
            .build()
            .await?;

        // Both stores are populated synchronously before anything is
        // served: a process with no usable snapshot must not start.
        let config_store = ConfigStore::shared(namespace, name, config_metrics);
        ConfigStore::init(&config_store, runtime.client())
            .await
            .context("failed to load the initial configuration")?;
        info!(
            version = %config_store.read().snapshot().version(),
            "loaded initial configuration"
        );

        let (endpoint_cache, endpoint_index) =
            EndpointIndex::shared(namespace, config_store.clone());
        EndpointIndex::init(&endpoint_index, runtime.client())
            .await
            .context("failed to index initial endpoints")?;

        let configmaps =
            runtime.watch_namespaced::<ConfigMap>(namespace.to_string(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(config_store.clone(), configmaps)
                .instrument(info_span!("configmaps")),
        );

        let endpoints =
            runtime.watch_namespaced::<Endpoints>(namespace.to_string(), watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(endpoint_index, endpoints).instrument(info_span!("endpoints")),
        );

        let handler = XdsHandler::new(config_store, endpoint_cache, metrics);
        let addr = self.listen_addr;
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            if let Err(error) = crate::serve(addr, handler, drain).await {
                tracing::error!(%error, "discovery server failed");
            }
        });

        if runtime.run().await.is_err() {
            bail!("aborted");
        }
        Ok(())
    }
}

#[derive(Debug, clap::Args)]
struct ProxyArgs {
    /// Address of the live upstream control plane.
    #[clap(long)]
    upstream: http::uri::Authority,

    /// Directory holding the captured bootstrap data.
    #[clap(long)]
    bootstrap_data: PathBuf,

    /// Listen address of the snapshot proxy.
    #[clap(long, env = "XDS_LISTEN", default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,
}

// === impl ProxyArgs ===

impl ProxyArgs {
    async fn run(self) -> Result<()> {
        let path = self.bootstrap_data.join("bootstrap.json");
        let raw = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let doc: SnapshotDocument =
            serde_json::from_slice(&raw).context("invalid snapshot document")?;
        let proxy = SnapshotProxy::new(self.upstream, Snapshot::from_document(doc)?);

        let (close, watch) = drain::channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                close.drain().await;
            }
        });
        crate::serve(self.listen_addr, proxy, watch).await
    }
}

#[derive(Debug, clap::Args)]
struct FetchArgs {
    /// Address of the live upstream control plane.
    #[clap(long)]
    upstream: http::uri::Authority,

    /// Directory the snapshot is written into.
    #[clap(long)]
    bootstrap_data: PathBuf,

    /// Node id presented to the control plane.
    #[clap(long)]
    id: String,

    /// Cluster name presented to the control plane.
    #[clap(long)]
    cluster: String,
}

// === impl FetchArgs ===

impl FetchArgs {
    async fn run(self) -> Result<()> {
        let node = Node {
            id: self.id,
            cluster: self.cluster,
        };
        let body = xds_controller_bootstrap::fetch(&self.upstream, &node).await?;
        std::fs::create_dir_all(&self.bootstrap_data).with_context(|| {
            format!("failed to create {}", self.bootstrap_data.display())
        })?;
        let path = self.bootstrap_data.join("bootstrap.json");
        std::fs::write(&path, &body)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), bytes = body.len(), "wrote bootstrap snapshot");
        Ok(())
    }
}

#[derive(Debug, clap::Args)]
struct ValidateArgs {
    /// Path to the configuration object; `-` reads from stdin.
    path: String,
}

// === impl ValidateArgs ===

impl ValidateArgs {
    fn run(self) -> Result<()> {
        let raw = if self.path == "-" {
            std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?
        } else {
            std::fs::read_to_string(&self.path)
                .with_context(|| format!("failed to read {}", self.path))?
        };
        let cm: ConfigMap = serde_yaml::from_str(&raw).context("not a configuration object")?;
        let config = Config::load(&cm)?;
        info!(version = %config.version(), "configuration is valid");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn object_names_split() {
        assert_eq!(split_object_name("default/xds"), Some(("default", "xds")));
        assert_eq!(split_object_name("xds"), None);
    }
}
