//! Acquisition scenarios against a local mock Modbus device: RTC
//! temperature polls end-to-end, CRC failure counting, reconnect behavior
//! and module fault isolation.

use acqsrv::cache_writer::{CacheWriter, CacheWriterConfig};
use acqsrv::decoder::ModuleDecoder;
use acqsrv::reader::{ModuleReader, ReaderState};
use acqsrv::SampleBus;
use enviro_config::{AcquisitionConfig, BackoffConfig, ModuleConfig};
use enviro_model::SensorType;
use enviro_protocols::modbus;
use enviro_rtdb::{Cache, KeySpace, MemoryCache};
use enviro_store::DocStore;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Scripted per-request behavior for the mock device.
#[derive(Debug, Clone)]
enum Reply {
    /// Well-formed response with these register words
    Registers(Vec<u16>),
    /// Valid frame with the last byte of the CRC flipped
    BadCrc(Vec<u16>),
    /// Exception frame with this code
    Exception(u8),
    /// Close the connection instead of answering
    Hangup,
}

struct MockDevice {
    port: u16,
    accepts: Arc<AtomicU32>,
    _task: tokio::task::JoinHandle<()>,
}

/// TCP device speaking RTU frames. Scripted replies are consumed once,
/// then every request gets `fallback`.
async fn spawn_device(script: Vec<Reply>, fallback: Vec<u16>) -> MockDevice {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepts = Arc::new(AtomicU32::new(0));
    let script = Arc::new(Mutex::new(VecDeque::from(script)));

    let task = tokio::spawn({
        let accepts = accepts.clone();
        async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                accepts.fetch_add(1, Ordering::SeqCst);
                let script = script.clone();
                let fallback = fallback.clone();
                tokio::spawn(async move {
                    let mut request = [0u8; modbus::READ_REQUEST_LEN];
                    loop {
                        if socket.read_exact(&mut request).await.is_err() {
                            return;
                        }
                        let Ok(decoded) = modbus::decode_request(&request) else {
                            return;
                        };
                        let reply = script
                            .lock()
                            .pop_front()
                            .unwrap_or(Reply::Registers(fallback.clone()));
                        let frame = match reply {
                            Reply::Registers(registers) => modbus::encode_response(
                                decoded.slave_addr,
                                decoded.function_code,
                                &registers,
                            ),
                            Reply::BadCrc(registers) => {
                                let mut frame = modbus::encode_response(
                                    decoded.slave_addr,
                                    decoded.function_code,
                                    &registers,
                                );
                                let last = frame.len() - 1;
                                frame[last] ^= 0xFF;
                                frame
                            }
                            Reply::Exception(code) => modbus::encode_exception(
                                decoded.slave_addr,
                                decoded.function_code,
                                code,
                            ),
                            Reply::Hangup => return,
                        };
                        if socket.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                });
            }
        }
    });

    MockDevice {
        port,
        accepts,
        _task: task,
    }
}

fn temperature_module(port: u16) -> ModuleConfig {
    ModuleConfig {
        module_id: "temp_module_01".into(),
        host: "127.0.0.1".into(),
        port,
        slave_addr: 1,
        function_code: 4,
        start_register: 0,
        register_count: 2,
        poll_interval_ms: Some(30),
        sensor_type: SensorType::Temperature,
        channel_count: 2,
        conversion: None,
        is_rtc: true,
    }
}

fn fast_acquisition() -> AcquisitionConfig {
    AcquisitionConfig {
        default_poll_interval_ms: 30,
        default_read_timeout_ms: 300,
        connect_timeout_ms: 1000,
        failure_threshold: 3,
        reconnect_backoff: BackoffConfig {
            initial_ms: 20,
            max_ms: 100,
            multiplier: 2.0,
            jitter_pct: 0,
        },
        ..AcquisitionConfig::default()
    }
}

fn spawn_reader(
    module: ModuleConfig,
    bus: Arc<SampleBus>,
    token: CancellationToken,
) -> acqsrv::reader::ReaderHandle {
    let decoder = Arc::new(ModuleDecoder::for_module(&module).unwrap());
    let acquisition = fast_acquisition();
    let poll = module.poll_interval_ms.unwrap_or(30);
    ModuleReader::new(
        module,
        decoder,
        &acquisition,
        poll,
        bus,
        "20240101_000000".into(),
    )
    .spawn(token)
}

async fn recv_n(bus: &SampleBus, n: usize, deadline: Duration) -> Vec<enviro_model::SensorReading> {
    let mut readings = Vec::with_capacity(n);
    tokio::time::timeout(deadline, async {
        while readings.len() < n {
            if let Some(reading) = bus.recv().await {
                readings.push(reading);
            }
        }
    })
    .await
    .expect("timed out waiting for readings");
    readings
}

#[tokio::test]
async fn rtc_poll_lands_in_cache() {
    // Device replies 01 04 04 00 FA FF EC CRC: 0x00FA = 25.0 °C, 0xFFEC = −2.0 °C
    let device = spawn_device(Vec::new(), vec![0x00FA, 0xFFEC]).await;
    let bus = Arc::new(SampleBus::new(64));
    let token = CancellationToken::new();
    let handle = spawn_reader(temperature_module(device.port), bus.clone(), token.clone());

    let readings = recv_n(&bus, 2, Duration::from_secs(5)).await;
    assert_eq!(readings[0].value, 25.0);
    assert_eq!(readings[0].raw, 0x00FA);
    assert_eq!(readings[0].channel, 1);
    assert_eq!(readings[1].value, -2.0);
    assert_eq!(readings[1].raw, 0xFFEC);
    assert_eq!(readings[0].sensor_id, "temperature_temp_module_01_01");
    assert_eq!(readings[0].unit, "°C");
    assert_eq!(readings[0].timestamp, readings[1].timestamp);

    // Through the cache writer: realtime hashes, one history entry per poll
    let cache = MemoryCache::new();
    let mut writer = CacheWriter::new(KeySpace::flat(), CacheWriterConfig::default());
    writer.expect_channels("temp_module_01", SensorType::Temperature, 2);
    for reading in &readings {
        writer.handle(reading);
    }
    writer.buffer().flush(&cache).await.unwrap();

    let rt = cache
        .hash_get_all("sensor:temperature:temperature_temp_module_01_01:realtime")
        .await
        .unwrap();
    assert_eq!(rt.get("value").map(|b| b.as_ref()), Some("25".as_bytes()));
    let history = cache
        .list_range("sensor:temperature:temp_module_01:history", 0, -1)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    let entry: serde_json::Value = serde_json::from_slice(&history[0]).unwrap();
    assert_eq!(entry["values"], serde_json::json!([25.0, -2.0]));

    token.cancel();
    handle.join().await;
}

#[tokio::test]
async fn crc_failure_counts_without_disconnect() {
    // One bad frame between good ones: counted, socket stays up
    let device = spawn_device(
        vec![
            Reply::Registers(vec![0x00FA, 0xFFEC]),
            Reply::BadCrc(vec![0x00FA, 0xFFEC]),
            Reply::Registers(vec![0x00FA, 0xFFEC]),
        ],
        vec![0x00FA, 0xFFEC],
    )
    .await;
    let bus = Arc::new(SampleBus::new(64));
    let token = CancellationToken::new();
    let handle = spawn_reader(temperature_module(device.port), bus.clone(), token.clone());

    // Good, bad, good: four readings from polls 1 and 3
    recv_n(&bus, 4, Duration::from_secs(5)).await;
    let status = handle.status();
    assert_eq!(status.total_errors, 1);
    assert_eq!(status.consecutive_failures, 0, "reset on success");
    assert_eq!(device.accepts.load(Ordering::SeqCst), 1, "no reconnect");

    token.cancel();
    handle.join().await;
}

#[tokio::test]
async fn three_consecutive_crc_failures_force_reconnect() {
    let device = spawn_device(
        vec![
            Reply::BadCrc(vec![1, 2]),
            Reply::BadCrc(vec![1, 2]),
            Reply::BadCrc(vec![1, 2]),
        ],
        vec![0x00FA, 0xFFEC],
    )
    .await;
    let bus = Arc::new(SampleBus::new(64));
    let token = CancellationToken::new();
    let handle = spawn_reader(temperature_module(device.port), bus.clone(), token.clone());

    // Readings only flow again after the reconnect
    recv_n(&bus, 2, Duration::from_secs(5)).await;
    let status = handle.status();
    assert!(status.total_errors >= 3);
    assert_eq!(status.reconnects, 1);
    assert_eq!(device.accepts.load(Ordering::SeqCst), 2);
    assert_eq!(status.consecutive_failures, 0);

    token.cancel();
    handle.join().await;
}

#[tokio::test]
async fn exception_frames_count_toward_threshold() {
    let device = spawn_device(
        vec![
            Reply::Exception(0x02),
            Reply::Exception(0x02),
            Reply::Exception(0x02),
        ],
        vec![0x0064, 0x00C8],
    )
    .await;
    let bus = Arc::new(SampleBus::new(64));
    let token = CancellationToken::new();
    let handle = spawn_reader(temperature_module(device.port), bus.clone(), token.clone());

    recv_n(&bus, 2, Duration::from_secs(5)).await;
    let status = handle.status();
    assert!(status.total_errors >= 3);
    assert_eq!(device.accepts.load(Ordering::SeqCst), 2);

    token.cancel();
    handle.join().await;
}

#[tokio::test]
async fn faulting_module_does_not_stall_healthy_one() {
    // Module A's device hangs up on every request for a while; B is healthy
    let device_a = spawn_device(
        vec![
            Reply::Hangup,
            Reply::Hangup,
            Reply::Hangup,
            Reply::Hangup,
            Reply::Hangup,
            Reply::Hangup,
        ],
        vec![0x0001, 0x0002],
    )
    .await;
    let device_b = spawn_device(Vec::new(), vec![0x00FA, 0xFFEC]).await;

    let bus = Arc::new(SampleBus::new(1024));
    let token = CancellationToken::new();

    let mut module_a = temperature_module(device_a.port);
    module_a.module_id = "module_a".into();
    let mut module_b = temperature_module(device_b.port);
    module_b.module_id = "module_b".into();

    let handle_a = spawn_reader(module_a, bus.clone(), token.clone());
    let handle_b = spawn_reader(module_b, bus.clone(), token.clone());

    // B keeps its cadence while A flaps
    let readings = recv_n(&bus, 20, Duration::from_secs(10)).await;
    let from_b = readings
        .iter()
        .filter(|r| r.module_id == "module_b")
        .count();
    assert!(from_b >= 10, "healthy module starved: {from_b}/20");

    // A eventually recovers once its device behaves
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if handle_a.status().last_success_ts.is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "module A never recovered"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(handle_a.status().reconnects >= 1);
    assert_eq!(handle_b.status().total_errors, 0);

    token.cancel();
    handle_a.join().await;
    handle_b.join().await;
}

#[tokio::test]
async fn orchestrator_end_to_end() {
    let device = spawn_device(Vec::new(), vec![0x00FA, 0xFFEC]).await;
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(enviro_store::MemoryStore::new());
    let config = enviro_config::AppConfig {
        modules: vec![temperature_module(device.port)],
        ..Default::default()
    };

    let orchestrator = acqsrv::Orchestrator::start(config, cache.clone(), store.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let stats = orchestrator.statistics();
    assert!(stats.manager.published >= 2);
    orchestrator.shutdown().await.unwrap();

    // Cache tier: realtime hash, history entries, timeseries members
    let rt = cache
        .hash_get_all("sensor:temperature:temperature_temp_module_01_01:realtime")
        .await
        .unwrap();
    assert_eq!(rt.get("unit").map(|b| b.as_ref()), Some("°C".as_bytes()));
    assert!(
        cache
            .list_len("sensor:temperature:temp_module_01:history")
            .await
            .unwrap()
            >= 1
    );
    assert!(
        cache
            .zset_len("sensor:temperature:temperature_temp_module_01_01:timeseries")
            .await
            .unwrap()
            >= 1
    );

    // Document tier: the shutdown flush landed the batch
    assert!(
        store
            .count("timeseries_temperature", bson::doc! {})
            .await
            .unwrap()
            >= 2
    );
    assert_eq!(
        store
            .count("realtime_temperature", bson::doc! {})
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn cancellation_reaches_stopped_state() {
    let device = spawn_device(Vec::new(), vec![0x0001, 0x0002]).await;
    let bus = Arc::new(SampleBus::new(64));
    let token = CancellationToken::new();
    let handle = spawn_reader(temperature_module(device.port), bus.clone(), token.clone());

    recv_n(&bus, 2, Duration::from_secs(5)).await;
    token.cancel();
    let shared = handle.shared();
    handle.join().await;
    assert_eq!(shared.status().state, ReaderState::Stopped);
}
