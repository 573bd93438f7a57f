//! Module reader
//!
//! One task per I/O module, exclusively owning its TCP socket. The state
//! machine is Connecting → Connected → Polling ⇄ Reconnecting → Stopped;
//! the terminal state is reached only through cancellation.
//!
//! Half-duplex Modbus: a single request is in flight at any time, and the
//! socket is never shared with another task.

use crate::bus::SampleBus;
use crate::decoder::ModuleDecoder;
use crate::reconnect::Backoff;
use enviro_common::{SystemTimeProvider, TimeProvider};
use enviro_config::{AcquisitionConfig, ModuleConfig};
use enviro_model::SensorReading;
use enviro_protocols::modbus::{self, ModbusError, ReadRequest};
use std::io;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reader lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    Created = 0,
    Connecting = 1,
    Connected = 2,
    Polling = 3,
    Reconnecting = 4,
    Stopped = 5,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReaderState::Connecting,
            2 => ReaderState::Connected,
            3 => ReaderState::Polling,
            4 => ReaderState::Reconnecting,
            5 => ReaderState::Stopped,
            _ => ReaderState::Created,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderState::Created => "created",
            ReaderState::Connecting => "connecting",
            ReaderState::Connected => "connected",
            ReaderState::Polling => "polling",
            ReaderState::Reconnecting => "reconnecting",
            ReaderState::Stopped => "stopped",
        }
    }
}

/// Counters shared between the reader task and status snapshots.
#[derive(Debug, Default)]
pub struct ReaderShared {
    state: AtomicU8,
    last_success_ts: AtomicI64,
    consecutive_failures: AtomicU32,
    total_reads: AtomicU64,
    total_errors: AtomicU64,
    decode_drops: AtomicU64,
    reconnects: AtomicU64,
}

impl ReaderShared {
    fn set_state(&self, state: ReaderState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn status(&self) -> ReaderStatus {
        let last = self.last_success_ts.load(Ordering::Relaxed);
        ReaderStatus {
            state: ReaderState::from_u8(self.state.load(Ordering::Acquire)),
            last_success_ts: (last > 0).then_some(last),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_reads: self.total_reads.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            decode_drops: self.decode_drops.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time reader status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStatus {
    pub state: ReaderState,
    pub last_success_ts: Option<i64>,
    pub consecutive_failures: u32,
    pub total_reads: u64,
    pub total_errors: u64,
    pub decode_drops: u64,
    pub reconnects: u64,
}

/// Running reader: status handle plus the join handle of its task.
pub struct ReaderHandle {
    shared: Arc<ReaderShared>,
    join: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn status(&self) -> ReaderStatus {
        self.shared.status()
    }

    pub fn shared(&self) -> Arc<ReaderShared> {
        self.shared.clone()
    }

    /// Wait for the task to finish (after cancellation).
    pub async fn join(self) {
        let _ = self.join.await;
    }

    /// Surrender the underlying task handle (for join-with-deadline).
    pub fn into_join(self) -> JoinHandle<()> {
        self.join
    }
}

enum PollExit {
    Cancelled,
    Reconnect,
}

enum PollError {
    Io(io::Error),
    Frame(ModbusError),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Io(e) => write!(f, "io: {e}"),
            PollError::Frame(e) => write!(f, "frame: {e}"),
        }
    }
}

/// One module reader, ready to spawn.
pub struct ModuleReader {
    module: ModuleConfig,
    decoder: Arc<ModuleDecoder>,
    poll_interval: Duration,
    read_timeout: Duration,
    connect_timeout: Duration,
    failure_threshold: u32,
    backoff: Backoff,
    bus: Arc<SampleBus>,
    session_prefix: String,
    shared: Arc<ReaderShared>,
}

impl ModuleReader {
    pub fn new(
        module: ModuleConfig,
        decoder: Arc<ModuleDecoder>,
        acquisition: &AcquisitionConfig,
        poll_interval_ms: u64,
        bus: Arc<SampleBus>,
        session_prefix: String,
    ) -> Self {
        Self {
            module,
            decoder,
            poll_interval: Duration::from_millis(poll_interval_ms),
            read_timeout: Duration::from_millis(acquisition.default_read_timeout_ms),
            connect_timeout: Duration::from_millis(acquisition.connect_timeout_ms),
            failure_threshold: acquisition.failure_threshold.max(1),
            backoff: Backoff::new(&acquisition.reconnect_backoff),
            bus,
            session_prefix,
            shared: Arc::new(ReaderShared::default()),
        }
    }

    /// Spawn the reader task; non-blocking.
    pub fn spawn(self, token: CancellationToken) -> ReaderHandle {
        let shared = self.shared.clone();
        let join = tokio::spawn(self.run(token));
        ReaderHandle { shared, join }
    }

    async fn run(mut self, token: CancellationToken) {
        let module_id = self.module.module_id.clone();
        loop {
            self.shared.set_state(ReaderState::Connecting);
            let connect = tokio::time::timeout(
                self.connect_timeout,
                TcpStream::connect((self.module.host.as_str(), self.module.port)),
            );
            let stream = tokio::select! {
                _ = token.cancelled() => break,
                result = connect => match result {
                    Ok(Ok(stream)) => Some(stream),
                    Ok(Err(e)) => {
                        warn!(module = %module_id, error = %e, "connect failed");
                        None
                    }
                    Err(_) => {
                        warn!(module = %module_id, timeout = ?self.connect_timeout, "connect deadline exceeded");
                        None
                    }
                },
            };

            match stream {
                Some(mut stream) => {
                    self.shared.set_state(ReaderState::Connected);
                    info!(module = %module_id, host = %self.module.host, port = self.module.port, connected = true, "module connected");
                    match self.poll_loop(&mut stream, &token).await {
                        PollExit::Cancelled => break,
                        PollExit::Reconnect => {
                            self.shared.reconnects.fetch_add(1, Ordering::Relaxed);
                            info!(module = %module_id, connected = false, "module reconnecting");
                        }
                    }
                    // Socket dropped here; backoff before the next connect.
                }
                None => {
                    self.shared.total_errors.fetch_add(1, Ordering::Relaxed);
                }
            }

            self.shared.set_state(ReaderState::Reconnecting);
            let delay = self.backoff.next_delay();
            debug!(module = %module_id, delay = ?delay, "backoff");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.shared.set_state(ReaderState::Stopped);
        debug!(module = %module_id, "reader stopped");
    }

    async fn poll_loop(&mut self, stream: &mut TcpStream, token: &CancellationToken) -> PollExit {
        self.shared.set_state(ReaderState::Polling);
        let request = ReadRequest::new(
            self.module.slave_addr,
            self.module.function_code,
            self.module.start_register,
            self.module.register_count,
        );
        let frame = request.encode();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return PollExit::Cancelled,
                _ = ticker.tick() => {}
            }

            self.shared.total_reads.fetch_add(1, Ordering::Relaxed);
            match self.poll_once(stream, &frame, &request).await {
                Ok(()) => {
                    self.shared.consecutive_failures.store(0, Ordering::Relaxed);
                    self.backoff.reset();
                }
                Err(e) => {
                    self.shared.total_errors.fetch_add(1, Ordering::Relaxed);
                    let failures = self
                        .shared
                        .consecutive_failures
                        .fetch_add(1, Ordering::Relaxed)
                        + 1;
                    warn!(
                        module = %self.module.module_id,
                        failures,
                        threshold = self.failure_threshold,
                        error = %e,
                        "poll failed"
                    );
                    if failures >= self.failure_threshold {
                        return PollExit::Reconnect;
                    }
                }
            }
        }
    }

    async fn poll_once(
        &self,
        stream: &mut TcpStream,
        frame: &[u8],
        request: &ReadRequest,
    ) -> Result<(), PollError> {
        stream.write_all(frame).await.map_err(PollError::Io)?;
        let response = read_frame(stream, self.read_timeout)
            .await
            .map_err(PollError::Io)?;
        let registers = modbus::decode_response(&response, request).map_err(PollError::Frame)?;

        let timestamp = SystemTimeProvider.now_millis();
        let (channels, dropped) = self.decoder.decode(&registers);
        if dropped > 0 {
            self.shared.decode_drops.fetch_add(dropped, Ordering::Relaxed);
        }
        for decoded in channels {
            self.bus.publish(SensorReading::new(
                &self.module.module_id,
                decoded.sensor_type,
                decoded.channel,
                timestamp,
                decoded.raw,
                decoded.value,
                &self.session_prefix,
            ));
        }
        self.shared
            .last_success_ts
            .store(timestamp, Ordering::Relaxed);
        Ok(())
    }
}

/// Accumulate one RTU frame off the stream within a deadline.
///
/// The total length comes from the byte-count field once the first three
/// bytes are in (five fixed bytes for exception frames).
async fn read_frame(stream: &mut TcpStream, deadline: Duration) -> io::Result<Vec<u8>> {
    let start = tokio::time::Instant::now();
    let mut buf: Vec<u8> = Vec::with_capacity(modbus::MIN_RESPONSE_LEN + 250);
    let mut chunk = [0u8; 256];
    loop {
        let elapsed = start.elapsed();
        let remaining = deadline
            .checked_sub(elapsed)
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"))?;
        let n = tokio::time::timeout(remaining, stream.read(&mut chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded"))??;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by device",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(total) = modbus::expected_frame_len(&buf) {
            if buf.len() >= total {
                buf.truncate(total);
                return Ok(buf);
            }
        }
    }
}
