//! Integrated orchestrator
//!
//! Wires the manager, cache writer and document writer (and optionally the
//! embedded sync workers) into one running system. Startup connects the
//! backends first and fails fast; shutdown stops readers, drains the
//! sample stream with a bounded deadline, flushes both writer pipelines
//! and only then returns.

use crate::cache_writer::{CacheWriter, CacheWriterConfig, CacheWriterStats};
use crate::doc_writer::{DocWriter, DocWriterConfig, DocWriterStats};
use crate::manager::{ManagerStats, ModuleManager};
use anyhow::{Context, Result};
use enviro_common::{SystemTimeProvider, TimeProvider};
use enviro_config::AppConfig;
use enviro_model::{session_prefix, SensorType};
use enviro_rtdb::{Cache, KeySpace, RedisCache};
use enviro_store::{DocStore, MongoStore};
use enviro_sync::SyncWorkers;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Hard deadline for an orderly shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_LOG_PERIOD: Duration = Duration::from_secs(30);

/// Aggregate view over every component's counters.
#[derive(Debug, Clone)]
pub struct OrchestratorStats {
    pub manager: ManagerStats,
    pub cache_writer: CacheWriterStats,
    pub doc_writer: DocWriterStats,
}

/// The running acquisition system.
pub struct Orchestrator {
    manager: Arc<ModuleManager>,
    cache_writer: Arc<CacheWriter>,
    doc_writer: Arc<DocWriter>,
    token: CancellationToken,
    consumer: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    session: String,
}

impl Orchestrator {
    /// Connect both backends, failing fast when either is unreachable.
    pub async fn connect_backends(
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

    /// Start the full pipeline on already-connected backends.
    pub async fn start(
        config: AppConfig,
        cache: Arc<dyn Cache>,
        store: Arc<dyn DocStore>,
    ) -> Result<Orchestrator> {
        store
            .ensure_indexes()
            .await
            .context("document index bootstrap")?;

        let session = config
            .session_prefix
            .clone()
            .unwrap_or_else(|| session_prefix(SystemTimeProvider.now_millis()));
        info!(session = %session, modules = config.modules.len(), "starting acquisition");

        let token = CancellationToken::new();
        let manager = Arc::new(ModuleManager::new(
            config.acquisition.clone(),
            session.clone(),
            token.child_token(),
        ));

        let mut cache_writer = CacheWriter::new(KeySpace::flat(), CacheWriterConfig::default());
        for module in &config.modules {
            cache_writer.expect_channels(
                &module.module_id,
                module.sensor_type,
                module.channel_count,
            );
            if module.has_paired_temperature() {
                cache_writer.expect_channels(
                    &module.module_id,
                    SensorType::Temperature,
                    module.channel_count,
                );
            }
        }
        let cache_writer = Arc::new(cache_writer);
        let doc_writer = Arc::new(DocWriter::new(
            store.clone(),
            session.clone(),
            DocWriterConfig::default(),
        ));

        for module in &config.modules {
            let poll_interval = config.poll_interval_ms(module);
            manager
                .add(module.clone(), poll_interval)
                .context("module registration")?;
        }
        manager.start_all();

        let mut tasks = Vec::new();

        // Single consumer drains the fan-in stream into both writers,
        // preserving per-sensor order. Joined before the flush loops are
        // cancelled so nothing it enqueues is lost.
        let consumer = {
            let bus = manager.subscribe();
            let cache_writer = cache_writer.clone();
            let doc_writer = doc_writer.clone();
            tokio::spawn(async move {
                while let Some(reading) = bus.recv().await {
                    cache_writer.handle(&reading);
                    doc_writer.enqueue(reading);
                }
            })
        };

        // Cache pipeline flush loop
        {
            let buffer = cache_writer.buffer();
            let cache = cache.clone();
            let token = token.child_token();
            tasks.push(tokio::spawn(async move {
                buffer.flush_loop(cache.as_ref(), token).await;
            }));
        }

        // Stale-poll sweeper (polls missing a dropped channel)
        {
            let cache_writer = cache_writer.clone();
            let token = token.child_token();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            cache_writer.flush_stale(SystemTimeProvider.now_millis());
                        }
                    }
                }
            }));
        }

        // Document writer batcher
        {
            let doc_writer = doc_writer.clone();
            let token = token.child_token();
            tasks.push(tokio::spawn(async move {
                doc_writer.run(token).await;
            }));
        }

        // Periodic status log
        {
            let manager = manager.clone();
            let token = token.child_token();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(STATUS_LOG_PERIOD);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let stats = manager.statistics();
                            for (module, status) in &stats.modules {
                                info!(
                                    module = %module,
                                    state = status.state.as_str(),
                                    reads = status.total_reads,
                                    errors = status.total_errors,
                                    failures = status.consecutive_failures,
                                    "module status"
                                );
                            }
                            info!(
                                published = stats.published,
                                dropped = stats.dropped_oldest,
                                buffered = stats.buffered,
                                "stream status"
                            );
                        }
                    }
                }
            }));
        }

        // Optional embedded sync
        if config.sync.embedded {
            let workers = Arc::new(SyncWorkers::new(
                cache.clone(),
                store.clone(),
                config.sync.clone(),
                session.clone(),
            ));
            tasks.extend(workers.spawn(token.child_token()));
            info!("embedded sync workers started");
        }

        Ok(Orchestrator {
            manager,
            cache_writer,
            doc_writer,
            token,
            consumer,
            tasks,
            session,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn statistics(&self) -> OrchestratorStats {
        OrchestratorStats {
            manager: self.manager.statistics(),
            cache_writer: self.cache_writer.statistics(),
            doc_writer: self.doc_writer.statistics(),
        }
    }

    /// Orderly shutdown: readers first, then drain, then flush, with a
    /// hard deadline on the whole sequence.
    pub async fn shutdown(self) -> Result<()> {
        info!("shutting down");
        let sequence = async {
            // Stop polling; the bus stays open for draining
            self.manager.stop_all().await;
            // Close the stream and let the consumer drain what is buffered
            self.manager.subscribe().close();
            let _ = self.consumer.await;
            // Flush loops perform a final flush on cancellation
            self.token.cancel();
            for task in self.tasks {
                let _ = task.await;
            }
            self.doc_writer.flush().await.context("final doc flush")?;
            anyhow::Ok(())
        };
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, sequence).await {
            Ok(result) => result,
            Err(_) => {
                warn!("shutdown exceeded {SHUTDOWN_TIMEOUT:?}");
                anyhow::bail!("shutdown timed out")
            }
        }
    }
}
