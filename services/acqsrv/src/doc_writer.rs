//! Document writer
//!
//! Batches readings (500 samples or 1 s) into unordered natural-key
//! upserts against the document tier, and maintains the per-session
//! statistics documents from a rolling per-channel window. A failed batch
//! is retried once, then parked in a bounded holding area and retried on
//! later flushes.

use enviro_model::{SensorReading, SensorType};
use enviro_store::documents::{self, ChannelSample, StatisticsSummary};
use enviro_store::{DocStore, Document};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DocWriterConfig {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// Failed batches kept for retry before the oldest is surfaced as lost.
    pub held_batches_max: usize,
}

impl Default for DocWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval_ms: 1000,
            held_batches_max: 64,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ChannelAgg {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
    last: f64,
}

impl ChannelAgg {
    fn absorb(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.count += 1;
        self.last = value;
    }
}

#[derive(Default)]
struct TypeAgg {
    channels: BTreeMap<u16, ChannelAgg>,
    last_update: i64,
}

impl TypeAgg {
    fn summary(&self) -> Option<StatisticsSummary> {
        let mut iter = self.channels.iter();
        let (&first_channel, first) = iter.next()?;
        let mut min = (first_channel, first.min);
        let mut max = (first_channel, first.max);
        let mut sum = 0.0;
        let mut count = 0u64;
        let mut channels = BTreeMap::new();
        for (&channel, agg) in &self.channels {
            if agg.min < min.1 {
                min = (channel, agg.min);
            }
            if agg.max > max.1 {
                max = (channel, agg.max);
            }
            sum += agg.sum;
            count += agg.count;
            channels.insert(channel, agg.last);
        }
        Some(StatisticsSummary {
            min: min.1,
            max: max.1,
            avg: sum / count as f64,
            channel_min: min.0,
            channel_max: max.0,
            last_update: self.last_update,
            channels,
        })
    }
}

#[derive(Default)]
struct DocState {
    batch: Vec<SensorReading>,
    aggregates: HashMap<SensorType, TypeAgg>,
    held: VecDeque<(String, Vec<(Document, Document)>)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocWriterStats {
    pub batches_flushed: u64,
    pub docs_written: u64,
    pub write_errors: u64,
    pub retries: u64,
    pub held_batches_dropped: u64,
}

/// Batching writer into the document tier.
pub struct DocWriter {
    store: Arc<dyn DocStore>,
    session: String,
    config: DocWriterConfig,
    state: Mutex<DocState>,
    flush_notify: Notify,
    batches_flushed: AtomicU64,
    docs_written: AtomicU64,
    write_errors: AtomicU64,
    retries: AtomicU64,
    held_dropped: AtomicU64,
}

impl DocWriter {
    pub fn new(store: Arc<dyn DocStore>, session: String, config: DocWriterConfig) -> Self {
        Self {
            store,
            session,
            config,
            state: Mutex::new(DocState::default()),
            flush_notify: Notify::new(),
            batches_flushed: AtomicU64::new(0),
            docs_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            held_dropped: AtomicU64::new(0),
        }
    }

    pub fn statistics(&self) -> DocWriterStats {
        DocWriterStats {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            docs_written: self.docs_written.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            held_batches_dropped: self.held_dropped.load(Ordering::Relaxed),
        }
    }

    /// Queue a reading; wakes the flusher once the batch budget fills.
    pub fn enqueue(&self, reading: SensorReading) {
        let len = {
            let mut state = self.state.lock();
            state.batch.push(reading);
            state.batch.len()
        };
        if len >= self.config.batch_size {
            self.flush_notify.notify_one();
        }
    }

    /// Background loop: flush on interval, batch-size wakeups, and once
    /// more on cancellation.
    pub async fn run(&self, token: CancellationToken) {
        let interval = Duration::from_millis(self.config.flush_interval_ms);
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "final document flush failed");
                    }
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
                _ = self.flush_notify.notified() => {}
            }
            if let Err(e) = self.flush().await {
                warn!(error = %e, "document flush failed");
            }
        }
        debug!("document writer stopped");
    }

    /// Drain the batch into collection writes and push them to the store.
    pub async fn flush(&self) -> anyhow::Result<usize> {
        let writes = {
            let mut state = self.state.lock();
            let batch = std::mem::take(&mut state.batch);
            for reading in &batch {
                let agg = state.aggregates.entry(reading.sensor_type).or_default();
                agg.channels
                    .entry(reading.channel)
                    .or_default()
                    .absorb(reading.value);
                agg.last_update = agg.last_update.max(reading.timestamp);
            }
            let mut writes: Vec<(String, Vec<(Document, Document)>)> =
                state.held.drain(..).collect();
            if !batch.is_empty() {
                writes.extend(self.build_writes(&batch, &state.aggregates));
            }
            writes
        };

        if writes.is_empty() {
            return Ok(0);
        }

        let mut written = 0usize;
        for (collection, batch_writes) in writes {
            match self.write_with_retry(&collection, batch_writes).await {
                Ok(count) => written += count,
                Err(_) => {}
            }
        }
        if written > 0 {
            self.batches_flushed.fetch_add(1, Ordering::Relaxed);
            self.docs_written
                .fetch_add(written as u64, Ordering::Relaxed);
        }
        Ok(written)
    }

    async fn write_with_retry(
        &self,
        collection: &str,
        writes: Vec<(Document, Document)>,
    ) -> anyhow::Result<usize> {
        if writes.is_empty() {
            return Ok(0);
        }
        match self.store.bulk_upsert(collection, writes.clone()).await {
            Ok(count) => Ok(count),
            Err(first) => {
                self.retries.fetch_add(1, Ordering::Relaxed);
                debug!(collection, error = %first, "bulk upsert failed, retrying");
                match self.store.bulk_upsert(collection, writes.clone()).await {
                    Ok(count) => Ok(count),
                    Err(second) => {
                        self.write_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(collection, error = %second, "bulk upsert failed after retry");
                        let mut state = self.state.lock();
                        state.held.push_back((collection.to_string(), writes));
                        while state.held.len() > self.config.held_batches_max {
                            state.held.pop_front();
                            self.held_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(second)
                    }
                }
            }
        }
    }

    /// Translate a drained batch into per-collection natural-key writes.
    fn build_writes(
        &self,
        batch: &[SensorReading],
        aggregates: &HashMap<SensorType, TypeAgg>,
    ) -> Vec<(String, Vec<(Document, Document)>)> {
        let mut out: Vec<(String, Vec<(Document, Document)>)> = Vec::new();
        if batch.is_empty() {
            return out;
        }

        // Realtime: one document per type per session, channels merged
        let mut realtime: HashMap<SensorType, (i64, BTreeMap<u16, ChannelSample>)> =
            HashMap::new();
        // Historical: one document per (type, module, poll timestamp)
        let mut historical: HashMap<(SensorType, String, i64), BTreeMap<u16, f64>> =
            HashMap::new();
        // Timeseries: one document per reading
        let mut timeseries: HashMap<SensorType, Vec<(Document, Document)>> = HashMap::new();

        for reading in batch {
            let (ts, channels) = realtime
                .entry(reading.sensor_type)
                .or_insert_with(|| (0, BTreeMap::new()));
            *ts = (*ts).max(reading.timestamp);
            channels.insert(
                reading.channel,
                ChannelSample {
                    value: reading.value,
                    raw: Some(i64::from(reading.raw)),
                },
            );

            historical
                .entry((
                    reading.sensor_type,
                    reading.module_id.clone(),
                    reading.timestamp,
                ))
                .or_default()
                .insert(reading.channel, reading.value);

            timeseries
                .entry(reading.sensor_type)
                .or_default()
                .push(documents::timeseries_write(
                    &self.session,
                    reading.channel,
                    reading.timestamp_unix(),
                    reading.value,
                ));
        }

        for (ty, (timestamp, channels)) in realtime {
            out.push((
                documents::realtime_collection(ty),
                vec![documents::realtime_write(&self.session, timestamp, &channels)],
            ));
        }
        let mut history_by_type: HashMap<SensorType, Vec<(Document, Document)>> = HashMap::new();
        for ((ty, _module, timestamp), values) in historical {
            let values: Vec<f64> = values.values().copied().collect();
            history_by_type.entry(ty).or_default().push(
                documents::historical_write(&self.session, timestamp, &values),
            );
        }
        for (ty, writes) in history_by_type {
            out.push((documents::historical_collection(ty), writes));
        }
        for (ty, writes) in timeseries {
            out.push((documents::timeseries_collection(ty), writes));
        }
        // Statistics: one upsert per active type per batch
        for (ty, agg) in aggregates {
            if let Some(summary) = agg.summary() {
                out.push((
                    documents::statistics_collection(*ty),
                    vec![documents::statistics_write(&self.session, &summary)],
                ));
            }
        }
        out
    }
}
