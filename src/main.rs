use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use figment::{Figment, providers::Env};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use jobflow::adapters::http::{
    CareersPageScraper, HttpEnrichment, HttpScorer, NoEnrichment, UnconfiguredScorer,
};
use jobflow::adapters::{AdapterSet, ScraperRegistry};
use jobflow::config::Config;
use jobflow::dedup::DedupCache;
use jobflow::ingest::IngestIntake;
use jobflow::pipeline::ItemPipeline;
use jobflow::queue::QueueManager;
use jobflow::rotation::RotationService;
use jobflow::services::ServiceManager;
use jobflow::settings::{SettingsCache, SettingsRefresher};
use jobflow::signals;
use jobflow::sources::SourceRegistry;
use jobflow::store::DocumentStore;
use jobflow::store::postgres::PgStore;
use jobflow::web::ingest::ReplayGuard;
use jobflow::web::{WebService, WebState, build_limiter};
use jobflow::worker::WorkerService;

/// Jobflow - job-matching ingest, queue, and scoring pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log formatter to use
    #[arg(long, value_enum, default_value_t = LogFormatter::Auto)]
    formatter: LogFormatter,

    #[command(subcommand)]
    role: Role,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogFormatter {
    /// Use pretty formatter (default in debug mode)
    Pretty,
    /// Use JSON formatter (default in release mode)
    Json,
    /// Auto-select based on build mode (debug=pretty, release=json)
    Auto,
}

#[derive(clap::Subcommand, Clone, Debug)]
enum Role {
    /// Run the webhook server and queue worker
    Worker,
    /// Run the source rotation driver
    Rotate,
}

fn init_logging(config: &Config, formatter: &LogFormatter) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,jobflow={}", config.log_level)));

    let use_pretty = match formatter {
        LogFormatter::Pretty => true,
        LogFormatter::Json => false,
        LogFormatter::Auto => cfg!(debug_assertions),
    };

    let subscriber: Box<dyn tracing::Subscriber + Send + Sync> = if use_pretty {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .finish(),
        )
    } else {
        Box::new(
            FmtSubscriber::builder()
                .with_target(true)
                .with_env_filter(filter)
                .json()
                .finish(),
        )
    };
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

fn load_profile(config: &Config) -> serde_json::Value {
    match &config.profile_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(path, error = %e, "profile file malformed, scoring with empty profile");
                    serde_json::json!({})
                }
            },
            Err(e) => {
                warn!(path, error = %e, "profile file unreadable, scoring with empty profile");
                serde_json::json!({})
            }
        },
        None => {
            warn!("no PROFILE_PATH set, scoring with empty profile");
            serde_json::json!({})
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Configuration problems are an exit-code-2 condition, distinct from
    // runtime failures.
    let config: Config = match Figment::new().merge(Env::raw()).extract() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    init_logging(&config, &args.formatter);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        role = ?args.role,
        environment = if cfg!(debug_assertions) {
            "development"
        } else {
            "production"
        },
        "starting jobflow"
    );

    let store: Arc<dyn DocumentStore> = match PgStore::connect(&config.database_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = ?e, "failed to connect to document store");
            return ExitCode::FAILURE;
        }
    };

    let settings = Arc::new(SettingsCache::new(store.clone()));
    if let Err(e) = settings.load().await {
        warn!(error = %e, "initial settings load failed, starting with defaults");
    }

    let queue = Arc::new(QueueManager::new(store.clone()));
    let dedup = Arc::new(DedupCache::new(config.dedup_ttl, config.dedup_capacity));
    let intake = Arc::new(IngestIntake::new(
        queue.clone(),
        store.clone(),
        dedup.clone(),
        settings.clone(),
    ));

    signals::spawn_sighup_reload(settings.clone());

    let mut service_manager = ServiceManager::new();
    service_manager.register(Box::new(SettingsRefresher::new(
        settings.clone(),
        config.config_refresh_interval,
    )));

    match args.role {
        Role::Worker => {
            let Some(webhook_secret) = config.webhook_secret.clone() else {
                error!("WEBHOOK_SECRET is required for the worker role");
                return ExitCode::from(2);
            };
            let Some(scorer_url) = config.scorer_url.clone() else {
                error!("SCORER_URL is required for the worker role");
                return ExitCode::from(2);
            };

            let limiter = match build_limiter(config.webhook_rpm, config.webhook_burst) {
                Ok(limiter) => Arc::new(limiter),
                Err(e) => {
                    error!(error = %e, "invalid webhook rate limit configuration");
                    return ExitCode::from(2);
                }
            };

            let adapters = Arc::new(AdapterSet {
                scrapers: ScraperRegistry::builtin().build_all(),
                detail: Arc::new(CareersPageScraper::new()),
                enrichment: match &config.enrichment_url {
                    Some(url) => Arc::new(HttpEnrichment::new(url.clone())),
                    None => Arc::new(NoEnrichment),
                },
                scorer: Arc::new(HttpScorer::new(scorer_url)),
            });

            let profile = load_profile(&config);
            let pipeline = Arc::new(ItemPipeline::new(
                store.clone(),
                queue.clone(),
                settings.clone(),
                adapters,
                profile,
            ));

            let web_state = WebState {
                intake: intake.clone(),
                queue: queue.clone(),
                webhook_secret: webhook_secret.into(),
                replay: Arc::new(ReplayGuard::new(config.replay_window)),
                limiter,
            };

            service_manager.register(Box::new(WebService::new(config.port, web_state)));
            service_manager.register(Box::new(WorkerService::new(
                queue.clone(),
                pipeline,
                settings.clone(),
            )));
        }
        Role::Rotate => {
            let adapters = Arc::new(AdapterSet {
                scrapers: ScraperRegistry::builtin().build_all(),
                detail: Arc::new(CareersPageScraper::new()),
                enrichment: Arc::new(NoEnrichment),
                scorer: Arc::new(UnconfiguredScorer),
            });

            let registry = Arc::new(SourceRegistry::new(store.clone()));
            service_manager.register(Box::new(RotationService::new(
                registry,
                queue.clone(),
                intake.clone(),
                settings.clone(),
                adapters,
                config.rotation_interval,
                config.rotation_batch,
            )));
        }
    }

    service_manager.spawn_all();
    signals::handle_shutdown_signals(service_manager, config.shutdown_timeout).await
}
