use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gatex_core::{AnnotationKeys, DEFAULT_DOMAIN_KEY, DEFAULT_INGRESS_CLASS, DEFAULT_PATH_KEY};
use gatex_kubehub::{KubeIngressStore, ServiceEventHandler, DEFAULT_MANAGER_PLANE_NAME};
use gatex_reconcile::{Reconciler, ReconcilerConfig, RetryPolicy};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod http;

#[derive(Parser, Debug)]
#[command(name = "gateway-extension", version, about = "Derive gateway Ingresses from annotated Services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch Services and keep one Ingress per (namespace, domain)
    Ingress(IngressArgs),
}

#[derive(Args, Debug, Clone)]
struct IngressArgs {
    /// Client identity; also the field manager on every write
    #[arg(long = "manager-plane-name", alias = "manager_plane_name", env = "GATEX_MANAGER_PLANE_NAME", default_value = DEFAULT_MANAGER_PLANE_NAME)]
    manager_plane_name: String,

    /// Port of the metrics and probe listener
    #[arg(long = "http-port", env = "GATEX_HTTP_PORT", default_value_t = 8080)]
    http_port: u16,

    /// Restrict the watch to one namespace (default: all)
    #[arg(long = "namespace", env = "GATEX_NAMESPACE")]
    namespace: Option<String>,

    /// Service annotation carrying the domain host.
    /// Defaults to the legacy `ingressDomain0` key already set on existing Services
    #[arg(long = "domain-annotation", env = "GATEX_DOMAIN_ANNOTATION", default_value = DEFAULT_DOMAIN_KEY)]
    domain_annotation: String,

    /// Service annotation carrying the route path.
    /// Defaults to the legacy `ingressPath` key already set on existing Services
    #[arg(long = "path-annotation", env = "GATEX_PATH_ANNOTATION", default_value = DEFAULT_PATH_KEY)]
    path_annotation: String,

    /// Value of the ingress class annotation on derived Ingresses
    #[arg(long = "ingress-class", env = "GATEX_INGRESS_CLASS", default_value = DEFAULT_INGRESS_CLASS)]
    ingress_class: String,

    /// Attempts per event on write conflicts, including the first
    #[arg(long = "retry-steps", env = "GATEX_RETRY_STEPS", default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..))]
    retry_steps: u32,

    /// Delay before the first retry, in milliseconds
    #[arg(long = "retry-initial-ms", env = "GATEX_RETRY_INITIAL_MS", default_value_t = 10)]
    retry_initial_ms: u64,

    /// Backoff multiplier between retries
    #[arg(long = "retry-factor", env = "GATEX_RETRY_FACTOR", default_value_t = 5.0)]
    retry_factor: f64,
}

impl IngressArgs {
    fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            keys: AnnotationKeys { domain: self.domain_annotation.clone(), path: self.path_annotation.clone() },
            ingress_class: self.ingress_class.clone(),
            retry: RetryPolicy {
                steps: self.retry_steps,
                initial: Duration::from_millis(self.retry_initial_ms),
                factor: self.retry_factor,
            },
        }
    }
}

fn init_tracing() {
    let env = std::env::var("GATEX_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "failed to install metrics recorder");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Ingress(args) => run_ingress(args).await,
    }
}

async fn run_ingress(args: IngressArgs) -> Result<()> {
    let metrics = init_metrics();
    let cfg = args.reconciler_config();
    info!(
        identity = %args.manager_plane_name, ns = ?args.namespace, domain_key = %cfg.keys.domain,
        path_key = %cfg.keys.path, class = %cfg.ingress_class, "starting ingress controller"
    );

    let client = gatex_kubehub::connect(&args.manager_plane_name).await?;
    let store = Arc::new(KubeIngressStore::new(client.clone(), args.manager_plane_name.clone()));
    let handler: Arc<dyn ServiceEventHandler> = Arc::new(Reconciler::new(store, cfg));

    let listener = TcpListener::bind(("0.0.0.0", args.http_port))
        .await
        .with_context(|| format!("bind http listener on port {}", args.http_port))?;

    let cancel = CancellationToken::new();
    let (ready_tx, ready_rx) = tokio::sync::watch::channel(false);
    let http_task = tokio::spawn(http::serve(listener, http::Probes::new(metrics, ready_rx), cancel.clone()));
    let mut watch_task = tokio::spawn(gatex_kubehub::run_service_watcher(
        client,
        args.namespace.clone(),
        handler,
        ready_tx,
        cancel.clone(),
    ));

    let watcher_done = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            None
        }
        res = &mut watch_task => Some(res),
    };
    cancel.cancel();

    let watch_res = match watcher_done {
        Some(res) => res,
        None => watch_task.await,
    };
    match http_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "http listener failed"),
        Err(e) => warn!(error = %e, "http task panicked"),
    }
    match watch_res {
        Ok(Ok(())) => {
            info!("ingress controller stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "service watcher failed");
            Err(e)
        }
        Err(e) => Err(anyhow::anyhow!("service watcher task: {}", e)),
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> IngressArgs {
        let mut argv = vec!["gateway-extension", "ingress"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Ingress(a) => a,
        }
    }

    #[test]
    fn defaults() {
        let a = parse(&[]);
        assert_eq!(a.manager_plane_name, "gateway-extension-manager-plane");
        assert_eq!(a.http_port, 8080);
        assert!(a.namespace.is_none());
        let cfg = a.reconciler_config();
        assert_eq!(cfg.keys, AnnotationKeys::default());
        assert_eq!(cfg.ingress_class, "apisix");
        assert_eq!(cfg.retry, RetryPolicy::default());
    }

    #[test]
    fn overrides() {
        let a = parse(&[
            "--manager_plane_name", "edge",
            "--namespace", "web",
            "--domain-annotation", "gw/domain",
            "--path-annotation", "gw/path",
            "--ingress-class", "nginx",
            "--retry-steps", "2",
            "--retry-initial-ms", "0",
        ]);
        assert_eq!(a.manager_plane_name, "edge");
        assert_eq!(a.namespace.as_deref(), Some("web"));
        let cfg = a.reconciler_config();
        assert_eq!(cfg.keys.domain, "gw/domain");
        assert_eq!(cfg.keys.path, "gw/path");
        assert_eq!(cfg.ingress_class, "nginx");
        assert_eq!(cfg.retry.steps, 2);
        assert_eq!(cfg.retry.initial, Duration::ZERO);
    }

    #[test]
    fn annotation_help_names_legacy_defaults() {
        use clap::CommandFactory;
        let mut cmd = Cli::command();
        let ingress = cmd.find_subcommand_mut("ingress").unwrap();
        let help = ingress.render_long_help().to_string();
        assert!(help.contains("legacy `ingressDomain0` key"), "help={}", help);
        assert!(help.contains("legacy `ingressPath` key"), "help={}", help);
    }

    #[test]
    fn zero_retry_steps_rejected() {
        assert!(Cli::try_parse_from(["gateway-extension", "ingress", "--retry-steps", "0"]).is_err());
    }

    #[test]
    fn subcommand_required() {
        assert!(Cli::try_parse_from(["gateway-extension"]).is_err());
    }
}
