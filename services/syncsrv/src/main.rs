//! syncsrv entry point
//!
//! `migrate` copies cache contents into the document store once, with
//! resume support; `run` starts the continuous replication workers.

use clap::{Parser, Subcommand};
use enviro_common::{init_logging, LogConfig, LogFormat, SystemTimeProvider, TimeProvider};
use enviro_config::AppConfig;
use enviro_model::session_prefix;
use enviro_rtdb::{Cache, RedisCache};
use enviro_store::{DocStore, MongoStore};
use enviro_sync::{Migrator, SyncWorkers};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "syncsrv", about = "EnviroDAS cache-to-document sync", version)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, default_value = "config/syncsrv.yaml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One-shot bulk migration of cache contents
    Migrate {
        /// Only these sessions (default: everything discovered)
        #[arg(long, value_delimiter = ',')]
        sessions: Option<Vec<String>>,
    },
    /// Continuous incremental replication
    Run,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("syncsrv: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn connect(
    config: &AppConfig,
) -> enviro_common::Result<(Arc<dyn Cache>, Arc<dyn DocStore>)> {
    let cache = RedisCache::connect(&config.cache.url())
        .await
        .map_err(|e| enviro_common::Error::backend(format!("cache: {e}")))?;
    let store = MongoStore::connect(&config.document_store.uri, &config.document_store.database)
        .await
        .map_err(|e| enviro_common::Error::backend(format!("document store: {e}")))?;
    Ok((Arc::new(cache), Arc::new(store)))
}

async fn run() -> enviro_common::Result<()> {
    let args = Args::parse();
    let config = AppConfig::from_yaml_file(&args.config)
        .map_err(|e| enviro_common::Error::config(e.to_string()))?;

    let _log_guard = init_logging(&LogConfig {
        level: config.logging.level.clone(),
        console: true,
        file: config.logging.file.clone(),
        format: if config.logging.json {
            LogFormat::Json
        } else {
            LogFormat::Compact
        },
        ansi: true,
    })?;

    let session = config
        .session_prefix
        .clone()
        .unwrap_or_else(|| session_prefix(SystemTimeProvider.now_millis()));
    let (cache, store) = connect(&config).await?;
    info!("backends connected");

    match args.command {
        Command::Migrate { sessions } => {
            let migrator = Migrator::new(cache, store, config.sync.page_size, session);
            let summary = migrator
                .run(sessions.as_deref())
                .await
                .map_err(|e| enviro_common::Error::internal(e.to_string()))?;
            info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "migration summary"
            );
            for (key, err) in &summary.per_key_errors {
                error!(key = %key, error = %err, "failed key");
            }
            if summary.failed > 0 {
                return Err(enviro_common::Error::internal(format!(
                    "{} keys failed to migrate",
                    summary.failed
                )));
            }
            Ok(())
        }
        Command::Run => {
            store
                .ensure_indexes()
                .await
                .map_err(|e| enviro_common::Error::internal(e.to_string()))?;
            let token = CancellationToken::new();
            let workers = Arc::new(SyncWorkers::new(
                cache,
                store,
                config.sync.clone(),
                session,
            ));
            let stats = workers.stats();
            let handles = workers.spawn(token.clone());
            info!("sync workers running, Ctrl-C to stop");

            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "signal handler failed");
            }
            token.cancel();
            for handle in handles {
                let _ = handle.await;
            }
            let snapshot = stats.snapshot();
            info!(
                realtime = snapshot.realtime_synced,
                historical = snapshot.historical_synced,
                timeseries = snapshot.timeseries_synced,
                statistics = snapshot.statistics_synced,
                errors = snapshot.errors,
                "sync stopped"
            );
            Ok(())
        }
    }
}
