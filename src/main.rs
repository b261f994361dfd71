//! heimdall: PrometheusRules from ingress annotations
//!
//! Usage:
//!   heimdall --templates DIR                    → run the controller
//!   heimdall render --templates DIR INGRESS.yaml → print the rules an ingress yields
//!   heimdall convert < alerts.yaml               → legacy Alerts to PrometheusRules
//!   heimdall config                             → print the effective configuration
//!   heimdall version                            → show version

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use heimdall_controller::{watch_ingresses, watch_rules, Controller, ControllerConfig, KubeStore};
use heimdall_core::{AnnotationPrefix, HeimdallConfig, LogConfig, DEFAULT_ANNOTATION_PREFIX};
use heimdall_rules::{legacy, to_yaml_stream, RuleRenderer, TemplateLibrary};
use k8s_openapi::api::networking::v1::Ingress;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "heimdall",
    about = "Generates PrometheusRules from annotated ingresses",
    version = env!("CARGO_PKG_VERSION"),
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Config file (TOML). Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a kubeconfig; in-cluster or $KUBECONFIG when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Namespace to watch (default: all namespaces)
    #[arg(long, env = "HEIMDALL_NAMESPACE")]
    namespace: Option<String>,

    /// Directory containing *.tmpl rule templates
    #[arg(long, env = "HEIMDALL_TEMPLATES")]
    templates: Option<PathBuf>,

    /// Full resync period in whole seconds, e.g. 30s, 1m, 1m30s
    #[arg(long)]
    sync_interval: Option<humantime::Duration>,

    /// Timeout for a single create/update/delete call, in whole seconds
    #[arg(long)]
    store_timeout: Option<humantime::Duration>,

    /// Annotation prefix to react to
    #[arg(long)]
    annotation_prefix: Option<String>,

    /// Debug logging
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Log as JSON
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the rules an ingress manifest would produce, without a cluster
    Render {
        /// Directory containing *.tmpl rule templates
        #[arg(long, env = "HEIMDALL_TEMPLATES")]
        templates: PathBuf,

        /// Annotation prefix to react to
        #[arg(long, default_value = DEFAULT_ANNOTATION_PREFIX)]
        prefix: String,

        /// Ingress manifest (YAML or JSON), `-` for stdin
        file: PathBuf,
    },
    /// Convert legacy heimdall Alert documents on stdin to PrometheusRules
    Convert,
    /// Print the effective configuration as TOML
    Config {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Render {
            templates,
            prefix,
            file,
        }) => render(&templates, prefix, &file)?,
        Some(Commands::Convert) => convert()?,
        Some(Commands::Config { run }) => print!("{}", run.resolve()?.to_toml()),
        Some(Commands::Version) => println!("heimdall v{}", env!("CARGO_PKG_VERSION")),
        None => run(cli.run).await?,
    }

    Ok(())
}

impl RunArgs {
    /// Config file (or defaults) with flags applied on top.
    fn resolve(&self) -> anyhow::Result<HeimdallConfig> {
        let mut config = match &self.config {
            Some(path) => HeimdallConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => HeimdallConfig::default(),
        };
        if let Some(templates) = &self.templates {
            config.templates = templates.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.namespace = namespace.clone();
        }
        if let Some(interval) = self.sync_interval {
            config.sync_interval_secs = whole_seconds("--sync-interval", interval)?;
        }
        if let Some(timeout) = self.store_timeout {
            config.store_timeout_secs = whole_seconds("--store-timeout", timeout)?;
        }
        if let Some(prefix) = &self.annotation_prefix {
            config.annotation_prefix = prefix.clone();
        }
        config.log.debug |= self.debug;
        config.log.json |= self.json;
        config.validate()?;
        Ok(config)
    }
}

/// Durations are stored as whole seconds; anything finer is refused.
fn whole_seconds(flag: &str, value: humantime::Duration) -> anyhow::Result<u64> {
    let value: Duration = value.into();
    if value.subsec_nanos() != 0 {
        anyhow::bail!(
            "{} must be a whole number of seconds, got {}",
            flag,
            humantime::format_duration(value)
        );
    }
    Ok(value.as_secs())
}

fn init_tracing(log: &LogConfig) {
    let default = if log.debug {
        "heimdall=debug,kube=info"
    } else {
        "heimdall=info,kube=warn"
    };
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()),
    );
    if log.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    init_tracing(&config.log);

    let library = TemplateLibrary::load(&config.templates)
        .with_context(|| format!("loading templates from {}", config.templates.display()))?;
    let renderer = Arc::new(
        RuleRenderer::new(library, config.prefix())
            .with_max_document_bytes(config.max_document_bytes),
    );

    let client = kube_client(args.kubeconfig.as_deref()).await?;
    let namespace = config.namespace_scope().map(str::to_string);
    info!(
        "heimdall v{} watching {} (prefix {}, resync {:?})",
        env!("CARGO_PKG_VERSION"),
        namespace.as_deref().unwrap_or("all namespaces"),
        config.annotation_prefix,
        config.sync_interval()
    );

    let store = Arc::new(KubeStore::new(client.clone()));
    let (controller, tx) = Controller::new(renderer, store, ControllerConfig::from(&config));
    let cancel = CancellationToken::new();

    let ingresses = tokio::spawn(watch_ingresses(
        client.clone(),
        namespace.clone(),
        tx.clone(),
        cancel.clone(),
    ));
    let rules = tokio::spawn(watch_rules(client, namespace, tx, cancel.clone()));
    tokio::spawn(cancel_on_signal(cancel.clone()));

    controller.run(cancel.clone()).await;
    cancel.cancel();
    let (ingresses, rules) = tokio::join!(ingresses, rules);
    if let Err(e) = ingresses.and(rules) {
        warn!("watch task failed: {}", e);
    }
    info!("heimdall stopped");
    Ok(())
}

async fn kube_client(kubeconfig: Option<&Path>) -> anyhow::Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await?
        }
        None => kube::Config::infer().await?,
    };
    Ok(Client::try_from(config)?)
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    cancel.cancel();
}

fn render(templates: &Path, prefix: String, file: &Path) -> anyhow::Result<()> {
    let library = TemplateLibrary::load(templates)
        .with_context(|| format!("loading templates from {}", templates.display()))?;
    let renderer = RuleRenderer::new(library, AnnotationPrefix::new(prefix));

    let manifest = read_input(file)?;
    let mut ingress: Ingress = serde_yaml::from_str(&manifest)
        .with_context(|| format!("parsing ingress from {}", file.display()))?;
    ingress.metadata.namespace.get_or_insert_with(|| "default".into());

    let rendered = renderer.render(&ingress);
    for warning in &rendered.warnings {
        eprintln!("warning: {}", warning);
    }
    print!("{}", to_yaml_stream(rendered.rules.values())?);
    Ok(())
}

fn convert() -> anyhow::Result<()> {
    let input = read_input(Path::new("-"))?;
    let rules = legacy::convert_documents(&input)?;
    print!("{}", to_yaml_stream(&rules)?);
    Ok(())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        Ok(std::io::read_to_string(std::io::stdin())?)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(args: &[&str]) -> anyhow::Result<HeimdallConfig> {
        let mut argv = vec!["heimdall"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)?.run.resolve()
    }

    #[test]
    fn durations() {
        let config = resolved(&["--sync-interval", "1m30s", "--store-timeout", "2s"]).unwrap();
        assert_eq!(config.sync_interval(), Duration::from_secs(90));
        assert_eq!(config.store_timeout(), Duration::from_secs(2));
        assert_eq!(
            resolved(&["--sync-interval", "1h"]).unwrap().sync_interval(),
            Duration::from_secs(3600)
        );
        assert!(Cli::try_parse_from(["heimdall", "--sync-interval", "soon"]).is_err());
        assert!(Cli::try_parse_from(["heimdall", "--sync-interval", ""]).is_err());
    }

    #[test]
    fn oversized_duration_is_a_parse_error() {
        assert!(Cli::try_parse_from(["heimdall", "--sync-interval", "18446744073709551615h"]).is_err());
    }

    #[test]
    fn fractional_seconds_rejected() {
        let err = resolved(&["--sync-interval", "500ms"]).unwrap_err();
        assert!(err.to_string().contains("--sync-interval"));
        assert!(resolved(&["--store-timeout", "1s 500ms"]).is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "heimdall",
            "--templates",
            "/etc/heimdall",
            "--namespace",
            "payments",
            "--sync-interval",
            "5m",
            "--json",
        ]);
        assert!(cli.command.is_none());
        let config = cli.run.resolve().unwrap();
        assert_eq!(config.templates, PathBuf::from("/etc/heimdall"));
        assert_eq!(config.namespace_scope(), Some("payments"));
        assert_eq!(config.sync_interval(), Duration::from_secs(300));
        assert!(config.log.json);
        assert!(!config.log.debug);
    }

    #[test]
    fn subcommands_parse() {
        let cli = Cli::parse_from(["heimdall", "render", "--templates", "t", "ing.yaml"]);
        match cli.command {
            Some(Commands::Render { prefix, file, .. }) => {
                assert_eq!(prefix, DEFAULT_ANNOTATION_PREFIX);
                assert_eq!(file, PathBuf::from("ing.yaml"));
            }
            _ => panic!("expected render"),
        }
        assert!(matches!(
            Cli::parse_from(["heimdall", "version"]).command,
            Some(Commands::Version)
        ));
    }

    #[test]
    fn sub_second_interval_rejected() {
        let args = RunArgs {
            sync_interval: Some(Duration::from_millis(10).into()),
            ..Default::default()
        };
        assert!(args.resolve().is_err());
    }
}
