//! Museum Pipeline - consume kiosk events and load them into Postgres
//!
//! Configuration is read from `config/pipeline.*` and `PIPELINE__*`
//! variables, falling back to the plain deployment variables
//! (`BOOTSTRAP_SERVERS`, `DATABASE_IP`, `LOCAL_DATABASE_IP`, ...). A `.env`
//! file in the working directory is loaded first; variables already set in
//! the process win.

use anyhow::{Context, Result};
use clap::Parser;
use museum_pipeline::{
    ConfigError, DatabaseTarget, EventProcessor, LoadOptions, LoggingConfig, MuseumConsumer,
    PgStore, PipelineConfig, Transformer, Validator,
};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Load museum kiosk events from Kafka into the review and incident tables
#[derive(Parser, Debug)]
#[command(name = "pipeline", version)]
struct Args {
    /// Skip loading into the database (loading runs by default)
    #[arg(short = 'l', long = "no-load", alias = "load")]
    no_load: bool,

    /// Use the local database instead of the remote one
    #[arg(short = 'd', long = "local-db", alias = "local_db")]
    local_db: bool,

    /// Skip loading review records
    #[arg(short = 'r', long = "no-review", alias = "load_review")]
    no_review: bool,

    /// Skip loading incident records
    #[arg(short = 'i', long = "no-incident", alias = "load_incident")]
    no_incident: bool,

    /// Configuration file (defaults to config/pipeline.* when present)
    #[arg(short, long, env = "PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Append log lines to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    /// Database to load into, or `None` when loading is off
    fn load_target(&self) -> Option<DatabaseTarget> {
        match (self.no_load, self.local_db) {
            (true, _) => None,
            (false, true) => Some(DatabaseTarget::Local),
            (false, false) => Some(DatabaseTarget::Remote),
        }
    }

    fn load_options(&self) -> LoadOptions {
        LoadOptions {
            load_review: !self.no_review,
            load_incident: !self.no_incident,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv().ok();
    let args = Args::parse();

    let (mut config, load_error) = load_config(args.config.as_deref())?;
    if let Some(ref log_file) = args.log_file {
        config.logging.file = log_file.clone();
    }

    init_tracing(&config.logging)?;

    info!(args = ?args, "Pipeline started");

    if let Some(path) = dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }
    if let Some(e) = load_error {
        warn!(error = %e, "Layered configuration unavailable, using deployment variables");
    }

    let target = args.load_target();
    config.validate(target).context("Invalid configuration")?;

    let store = match target {
        Some(target) => {
            let store = Arc::new(
                PgStore::connect_lazy(&config.database, target)
                    .context("Failed to configure database")?,
            );

            if config.database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Some(store)
        }
        None => {
            info!("Loading disabled, transformed records will only be logged");
            None
        }
    };

    let transformer = Transformer::new(Validator::new(config.validation.clone()));
    let mut processor = EventProcessor::new(transformer);
    if let Some(ref store) = store {
        processor = processor.with_store(store.clone(), args.load_options());
    }

    let consumer = Arc::new(
        MuseumConsumer::new(config.kafka.clone()).context("Failed to create Kafka consumer")?,
    );
    consumer
        .subscribe()
        .context("Failed to subscribe to kiosk topic")?;

    let signal_consumer = consumer.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_consumer.shutdown();
    });

    consumer.run(&processor).await;

    if let Some(store) = store {
        store.close().await;
    }

    info!("Pipeline stopped");

    Ok(())
}

/// Load configuration from files, falling back to deployment variables.
///
/// When the fallback is used, the error from the layered load is returned
/// alongside the config so it can be logged once tracing is up.
fn load_config(path: Option<&Path>) -> Result<(PipelineConfig, Option<ConfigError>)> {
    resolve_config(
        PipelineConfig::load(path),
        path.is_some(),
        PipelineConfig::from_env,
    )
}

fn resolve_config<F>(
    loaded: Result<PipelineConfig, ConfigError>,
    explicit_file: bool,
    fallback: F,
) -> Result<(PipelineConfig, Option<ConfigError>)>
where
    F: FnOnce() -> Result<PipelineConfig, ConfigError>,
{
    match loaded {
        Ok(config) => Ok((config, None)),
        // An explicit file that fails to load is an error, not a fallback
        Err(e) if explicit_file => Err(e).context("Failed to load configuration file"),
        Err(load_error) => match fallback() {
            Ok(config) => Ok((config, Some(load_error))),
            Err(e) => Err(e).with_context(|| {
                format!(
                    "Failed to load configuration from environment \
                     (layered configuration: {})",
                    load_error
                )
            }),
        },
    }
}

/// Initialize tracing to an append-only log file
fn init_tracing(config: &LoggingConfig) -> Result<()> {
    if let Some(dir) = config.file.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.file)
        .with_context(|| format!("Failed to open log file {}", config.file.display()))?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(Mutex::new(file)),
        )
        .init();

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn broker_only() -> Result<PipelineConfig, ConfigError> {
        PipelineConfig::from_lookup(|key: &str| {
            (key == "BOOTSTRAP_SERVERS").then(|| "broker:9092".to_string())
        })
    }

    fn layered_failure() -> Result<PipelineConfig, ConfigError> {
        Err(ConfigError::LoadError("missing field `kafka`".to_string()))
    }

    #[test]
    fn test_layered_config_wins() {
        let (config, load_error) =
            resolve_config(broker_only(), false, || panic!("fallback used")).unwrap();

        assert_eq!(config.kafka.bootstrap_servers, "broker:9092");
        assert!(load_error.is_none());
    }

    #[test]
    fn test_fallback_keeps_layered_error() {
        let (config, load_error) = resolve_config(layered_failure(), false, broker_only).unwrap();

        assert_eq!(config.kafka.bootstrap_servers, "broker:9092");
        assert!(matches!(load_error, Some(ConfigError::LoadError(_))));
    }

    #[test]
    fn test_failed_fallback_reports_both_errors() {
        let err = resolve_config(layered_failure(), false, || {
            Err(ConfigError::MissingRequired("BOOTSTRAP_SERVERS".to_string()))
        })
        .unwrap_err();

        let rendered = format!("{:#}", err);
        assert!(rendered.contains("missing field `kafka`"));
        assert!(rendered.contains("BOOTSTRAP_SERVERS"));
    }

    #[test]
    fn test_explicit_file_never_falls_back() {
        let result = resolve_config(layered_failure(), true, broker_only);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_file_provides_deployment_variables() {
        let path = std::env::temp_dir().join(format!("pipeline-{}.env", std::process::id()));
        std::fs::write(
            &path,
            "BOOTSTRAP_SERVERS=broker:9092\n\
             DATABASE_USERNAME=museum\n\
             DATABASE_PASSWORD=\"secret\"\n\
             DATABASE_IP=db.example.com\n\
             DATABASE_NAME=museum\n",
        )
        .unwrap();

        let vars: HashMap<String, String> = dotenvy::from_path_iter(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        std::fs::remove_file(&path).unwrap();

        let config = PipelineConfig::from_lookup(|key: &str| vars.get(key).cloned()).unwrap();

        let remote = config.database.target(DatabaseTarget::Remote).unwrap();
        assert_eq!(remote.host, "db.example.com");
        assert_eq!(remote.password, "secret");
        assert!(config.validate(Some(DatabaseTarget::Remote)).is_ok());
    }

    #[test]
    fn test_defaults_load_everything_remotely() {
        let args = Args::try_parse_from(["pipeline"]).unwrap();

        assert_eq!(args.load_target(), Some(DatabaseTarget::Remote));
        assert_eq!(args.load_options(), LoadOptions::default());
    }

    #[test]
    fn test_flags() {
        let args = Args::try_parse_from(["pipeline", "-d", "-r"]).unwrap();
        assert_eq!(args.load_target(), Some(DatabaseTarget::Local));
        assert!(!args.load_options().load_review);
        assert!(args.load_options().load_incident);

        let args = Args::try_parse_from(["pipeline", "--no-load", "--local-db"]).unwrap();
        assert_eq!(args.load_target(), None);
    }

    #[test]
    fn test_legacy_flag_names() {
        let args =
            Args::try_parse_from(["pipeline", "--local_db", "--load_incident"]).unwrap();

        assert_eq!(args.load_target(), Some(DatabaseTarget::Local));
        assert!(args.load_options().load_review);
        assert!(!args.load_options().load_incident);

        let args = Args::try_parse_from(["pipeline", "--load"]).unwrap();
        assert_eq!(args.load_target(), None);
    }
}
