mod config;

use apiserver::service::MCAppService;
use authz::principal::{CachedDirectory, InMemoryDirectory, SharedDirectory};
use authz::RoleTemplates;
use clap::Parser;
use config::{Config, LoggingConfig, MetricsConfig};
use fanout::{Controller, StaticCatalog, TargetReconciler};
use metrics_exporter_statsd::StatsdBuilder;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use store::memory::InMemoryStore;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "mcapp";

#[derive(Parser)]
#[command(about = "Multi-cluster app role and membership reconciler")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api server: {0}")]
    Api(#[from] apiserver::ApiServerError),
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    // Kept alive for the lifetime of the process so events are flushed.
    let _sentry = init_logging(config.logging.as_ref());

    if let Some(metrics) = &config.metrics
        && let Err(e) = init_metrics(metrics)
    {
        tracing::error!(error = %e, "could not install statsd recorder, metrics disabled");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("could not start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        tracing::error!(error = %e, "exiting");
        process::exit(1);
    }
}

fn init_logging(logging: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = logging.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), Box<dyn std::error::Error>> {
    let recorder = StatsdBuilder::from(config.statsd_host.as_str(), config.statsd_port)
        .build(Some(METRICS_PREFIX))?;
    metrics::set_global_recorder(recorder)
        .map_err(|_| "a global metrics recorder is already installed")?;

    for defs in [
        authz::metrics_defs::ALL_METRICS,
        fanout::metrics_defs::ALL_METRICS,
        apiserver::metrics_defs::ALL_METRICS,
    ] {
        shared::metrics_defs::describe_all(defs);
    }
    Ok(())
}

async fn run(config: Config) -> Result<(), RunError> {
    let templates = RoleTemplates::builtin().with(config.role_templates);
    let store = Arc::new(InMemoryStore::new());
    let directory: SharedDirectory =
        Arc::new(CachedDirectory::new(InMemoryDirectory::new(config.users)));
    let catalog = Arc::new(StaticCatalog::new(config.catalog));

    let reconciler =
        TargetReconciler::new(store.clone(), catalog, directory.clone(), templates.clone());
    let controller = Controller::start(store.clone(), reconciler, &config.controller);
    tracing::info!(workers = config.controller.workers, "controller started");

    let service = Arc::new(MCAppService::new(store, directory, templates));
    let api_task = async {
        apiserver::run(&config.listener, service).await?;
        Ok::<(), RunError>(())
    };

    let ready = controller.clone();
    let admin_task = run_http_service::<_, RunError>(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::new(move || ready.is_ready()),
    );

    let result = tokio::try_join!(api_task, admin_task).map(|_| ());
    controller.shutdown().await;
    result
}
