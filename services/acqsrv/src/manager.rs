//! Module manager
//!
//! Supervises the set of module readers, keyed by module id. Readers feed a
//! shared fan-in bus; one reader faulting never slows the others.

use crate::bus::SampleBus;
use crate::decoder::ModuleDecoder;
use crate::reader::{ModuleReader, ReaderHandle, ReaderStatus};
use anyhow::{bail, Context, Result};
use enviro_config::{AcquisitionConfig, ModuleConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct ManagedReader {
    config: ModuleConfig,
    decoder: Arc<ModuleDecoder>,
    poll_interval_ms: u64,
    token: CancellationToken,
    handle: Option<ReaderHandle>,
}

/// Aggregate statistics exposed by `statistics()`.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub modules: Vec<(String, ReaderStatus)>,
    pub published: u64,
    pub dropped_oldest: u64,
    pub buffered: usize,
}

/// Owns the reader set and the fan-in bus.
pub struct ModuleManager {
    readers: Mutex<HashMap<String, ManagedReader>>,
    bus: Arc<SampleBus>,
    acquisition: AcquisitionConfig,
    session_prefix: String,
    running: AtomicBool,
    token: CancellationToken,
}

impl ModuleManager {
    /// `token` is the parent cancellation scope; each reader gets a child.
    pub fn new(
        acquisition: AcquisitionConfig,
        session_prefix: String,
        token: CancellationToken,
    ) -> Self {
        let bus = Arc::new(SampleBus::new(acquisition.fanin_capacity));
        Self {
            readers: Mutex::new(HashMap::new()),
            bus,
            acquisition,
            session_prefix,
            running: AtomicBool::new(false),
            token,
        }
    }

    /// The multiplexed reading stream (single consumer).
    pub fn subscribe(&self) -> Arc<SampleBus> {
        self.bus.clone()
    }

    /// Validate and register a module; starts its reader when the manager
    /// is already running. Exactly one reader per module id.
    pub fn add(&self, config: ModuleConfig, poll_interval_ms: u64) -> Result<()> {
        let decoder = Arc::new(
            ModuleDecoder::for_module(&config)
                .with_context(|| format!("module {}", config.module_id))?,
        );
        let mut readers = self.readers.lock();
        if readers.contains_key(&config.module_id) {
            bail!("module {} already registered", config.module_id);
        }
        let module_id = config.module_id.clone();
        let mut managed = ManagedReader {
            config,
            decoder,
            poll_interval_ms,
            token: self.token.child_token(),
            handle: None,
        };
        if self.running.load(Ordering::Acquire) {
            self.start_reader(&mut managed);
        }
        info!(module = %module_id, "module registered");
        readers.insert(module_id, managed);
        Ok(())
    }

    /// Stop a module's reader, wait for it to drain, and forget it.
    pub async fn remove(&self, module_id: &str) -> Result<()> {
        let managed = self
            .readers
            .lock()
            .remove(module_id)
            .with_context(|| format!("module {module_id} not registered"))?;
        managed.token.cancel();
        if let Some(handle) = managed.handle {
            handle.join().await;
        }
        info!(module = %module_id, "module removed");
        Ok(())
    }

    fn start_reader(&self, managed: &mut ManagedReader) {
        if managed.handle.is_some() {
            return;
        }
        if managed.token.is_cancelled() {
            managed.token = self.token.child_token();
        }
        let reader = ModuleReader::new(
            managed.config.clone(),
            managed.decoder.clone(),
            &self.acquisition,
            managed.poll_interval_ms,
            self.bus.clone(),
            self.session_prefix.clone(),
        );
        managed.handle = Some(reader.spawn(managed.token.clone()));
    }

    /// Start every registered reader. Idempotent.
    pub fn start_all(&self) {
        self.running.store(true, Ordering::Release);
        let mut readers = self.readers.lock();
        for managed in readers.values_mut() {
            self.start_reader(managed);
        }
        info!(modules = readers.len(), "acquisition started");
    }

    /// Stop every reader, waiting up to the configured grace before
    /// aborting stragglers. Idempotent. The bus stays open so the consumer
    /// can drain buffered readings.
    pub async fn stop_all(&self) {
        self.running.store(false, Ordering::Release);
        let handles: Vec<(String, ReaderHandle)> = {
            let mut readers = self.readers.lock();
            readers
                .iter_mut()
                .filter_map(|(id, managed)| {
                    managed.token.cancel();
                    managed.handle.take().map(|h| (id.clone(), h))
                })
                .collect()
        };
        if handles.is_empty() {
            return;
        }
        let grace = Duration::from_millis(self.acquisition.stop_grace_ms);
        for (module_id, handle) in handles {
            let mut join = handle.into_join();
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                warn!(module = %module_id, "reader did not stop within grace, aborting");
                join.abort();
            }
        }
        info!("acquisition stopped");
    }

    /// Per-module reader status plus aggregate counters.
    pub fn statistics(&self) -> ManagerStats {
        let readers = self.readers.lock();
        let mut modules: Vec<(String, ReaderStatus)> = readers
            .iter()
            .filter_map(|(id, managed)| {
                managed
                    .handle
                    .as_ref()
                    .map(|handle| (id.clone(), handle.status()))
            })
            .collect();
        modules.sort_by(|a, b| a.0.cmp(&b.0));
        ManagerStats {
            modules,
            published: self.bus.published(),
            dropped_oldest: self.bus.dropped_oldest(),
            buffered: self.bus.len(),
        }
    }

    pub fn module_count(&self) -> usize {
        self.readers.lock().len()
    }
}
