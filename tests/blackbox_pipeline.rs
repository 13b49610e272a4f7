use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use axum::Router;
use parking_lot::Mutex;
use scout::agent::Agent;
use scout::collector::{IntervalCollector, Registry};
use scout::config::Config;
use scout::point::{Emitter, RateType, Unit};
use scout::watchdog::{Fatal, MemoryProbe};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.0.lock().clone())
            .expect("utf8")
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Mock OpenTSDB endpoint recording every request body.
#[derive(Clone)]
struct MockTsdb {
    status: StatusCode,
    put_requests: Arc<AtomicUsize>,
    batches: Arc<Mutex<Vec<Vec<serde_json::Value>>>>,
    metadata: Arc<Mutex<Vec<serde_json::Value>>>,
}

impl MockTsdb {
    async fn spawn(status: StatusCode) -> (SocketAddr, Self) {
        let mock = Self {
            status,
            put_requests: Arc::new(AtomicUsize::new(0)),
            batches: Arc::new(Mutex::new(Vec::new())),
            metadata: Arc::new(Mutex::new(Vec::new())),
        };

        let app = Router::new()
            .route("/api/put", put(put_handler))
            .route("/api/metadata/put", put(metadata_handler))
            .with_state(mock.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock server");
        });

        (addr, mock)
    }
}

fn decode_body(headers: &HeaderMap, body: &[u8]) -> serde_json::Value {
    let gzip = headers
        .get("content-encoding")
        .is_some_and(|v| v.as_bytes() == b"gzip");
    let raw = if gzip {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(body)
            .read_to_end(&mut out)
            .expect("gunzip");
        out
    } else {
        body.to_vec()
    };
    serde_json::from_slice(&raw).expect("json body")
}

async fn put_handler(
    State(mock): State<MockTsdb>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    mock.put_requests.fetch_add(1, Ordering::SeqCst);
    if mock.status.is_success() {
        let json = decode_body(&headers, &body);
        let points = json.as_array().expect("array body").clone();
        mock.batches.lock().push(points);
    }
    mock.status
}

async fn metadata_handler(
    State(mock): State<MockTsdb>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let json = decode_body(&headers, &body);
    mock.metadata
        .lock()
        .extend(json.as_array().expect("array body").iter().cloned());
    StatusCode::NO_CONTENT
}

struct HugeRss;

impl MemoryProbe for HugeRss {
    fn resident_bytes(&self) -> anyhow::Result<u64> {
        Ok(10 * 1024 * 1024 * 1024)
    }
}

fn remote_config(addr: SocketAddr) -> Config {
    let mut cfg = Config {
        endpoint: addr.to_string(),
        ..Default::default()
    };
    cfg.watchdog.max_rss_bytes = 0;
    cfg.metadata.enabled = false;
    cfg
}

fn registry_with(collector: IntervalCollector) -> Registry {
    let mut registry = Registry::new();
    registry.register(collector).expect("register");
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_synthetic_collector_to_local_sink() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&invocations);
    let collector = IntervalCollector::new("synthetic", move |emitter: &Emitter| {
        calls.fetch_add(1, Ordering::SeqCst);
        let mut batch = emitter.batch();
        for _ in 0..2 {
            batch.add("test.metric", 5, &[("host", "a")], RateType::Gauge, Unit::None, "");
        }
        Ok(batch)
    })
    .with_cadence(Duration::from_secs(1));

    let out = SharedBuf::default();
    let mut agent = Agent::new(Config::default())
        .expect("agent")
        .with_hostname("testbox")
        .with_output(Box::new(out.clone()));
    agent.start(registry_with(collector)).await.expect("start");

    tokio::time::sleep(Duration::from_millis(3200)).await;
    agent.stop().await.expect("stop");

    assert!(invocations.load(Ordering::SeqCst) >= 3);

    let lines = out.lines();
    assert!(lines.len() >= 6, "expected at least 6 points, got {}", lines.len());

    let mut timestamps = Vec::new();
    for line in &lines {
        let fields: Vec<&str> = line.split(' ').collect();
        assert_eq!(fields.len(), 4, "unexpected line {line:?}");
        assert_eq!(fields[0], "test.metric");
        assert_eq!(fields[2], "5");
        assert_eq!(fields[3], "host=a");
        timestamps.push(fields[1].parse::<i64>().expect("timestamp"));
    }

    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
    let mut distinct = timestamps.clone();
    distinct.dedup();
    assert!(distinct.len() >= 3, "invocations should carry increasing timestamps: {timestamps:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_failing_collector_emits_nothing() {
    let collector = IntervalCollector::new("always.fails", |_: &Emitter| {
        Err(anyhow::anyhow!("probe unreachable"))
    })
    .with_cadence(Duration::from_secs(1));

    let out = SharedBuf::default();
    let mut agent = Agent::new(Config::default())
        .expect("agent")
        .with_hostname("testbox")
        .with_output(Box::new(out.clone()));
    agent.start(registry_with(collector)).await.expect("start");

    tokio::time::sleep(Duration::from_millis(3200)).await;

    // Still running: no fatal condition, scheduler still ticking.
    assert!(tokio::time::timeout(Duration::from_millis(50), agent.fatal())
        .await
        .is_err());
    let errors = agent
        .health()
        .collector_errors
        .with_label_values(&["always.fails"])
        .get();
    assert!(errors >= 3.0, "expected at least 3 failed invocations, got {errors}");

    agent.stop().await.expect("stop");
    assert!(out.lines().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_failing_endpoint_drops_one_batch_per_flush() {
    let (addr, mock) = MockTsdb::spawn(StatusCode::INTERNAL_SERVER_ERROR).await;

    let mut cfg = remote_config(addr);
    cfg.sender.batch_size = 10_000;
    cfg.sender.flush_interval = Duration::from_millis(300);
    cfg.sender.max_attempts = 2;
    cfg.sender.initial_backoff = Duration::from_millis(10);
    cfg.sender.max_backoff = Duration::from_millis(20);

    let collector = IntervalCollector::new("steady", |emitter: &Emitter| {
        let mut batch = emitter.batch();
        for i in 0..5 {
            batch.add("test.steady", i, &[], RateType::Gauge, Unit::None, "");
        }
        Ok(batch)
    })
    .with_cadence(Duration::from_millis(100));

    let mut agent = Agent::new(cfg).expect("agent").with_hostname("testbox");
    agent.start(registry_with(collector)).await.expect("start");

    tokio::time::sleep(Duration::from_millis(2000)).await;

    let health = Arc::clone(agent.health());
    let emitted_mid = health.points_emitted.with_label_values(&["steady"]).get();
    agent.stop().await.expect("stop");

    // Producers were never blocked by the failing endpoint.
    assert!(emitted_mid >= 5.0 * 12.0, "pipeline stalled: {emitted_mid} points emitted");

    let dropped = health.batches_dropped.get() as usize;
    assert!((4..=9).contains(&dropped), "expected one drop per flush cycle, got {dropped}");
    assert_eq!(health.batches_sent.get(), 0.0);

    // Every cycle made both attempts. Batches caught by shutdown make one.
    let requests = mock.put_requests.load(Ordering::SeqCst);
    assert!(
        (2 * dropped - 2..=2 * dropped).contains(&requests),
        "requests={requests} dropped={dropped}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn remote_batches_respect_batch_size() {
    let (addr, mock) = MockTsdb::spawn(StatusCode::NO_CONTENT).await;

    let mut cfg = remote_config(addr);
    cfg.sender.batch_size = 7;
    cfg.sender.flush_interval = Duration::from_millis(100);
    cfg.sender.compression = "gzip".to_string();

    let collector = IntervalCollector::new("burst", |emitter: &Emitter| {
        let mut batch = emitter.batch();
        for i in 0..25 {
            batch.add("test.burst", i, &[], RateType::Gauge, Unit::None, "");
        }
        Ok(batch)
    })
    .with_cadence(Duration::from_millis(200));

    let mut agent = Agent::new(cfg).expect("agent").with_hostname("Box1.example.com");
    agent.start(registry_with(collector)).await.expect("start");
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let health = Arc::clone(agent.health());
    agent.stop().await.expect("stop");

    let batches = mock.batches.lock().clone();
    assert!(!batches.is_empty());
    assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 7));
    assert!(batches.iter().any(|b| b.len() == 7));

    let total: usize = batches.iter().map(Vec::len).sum();
    assert_eq!(total as f64, health.points_sent.get());
    assert!(total as f64 <= health.points_emitted.with_label_values(&["burst"]).get());
    assert_eq!(health.batches_dropped.get(), 0.0);

    let first = &batches[0][0];
    assert_eq!(first["metric"], "test.burst");
    assert_eq!(first["tags"]["host"], "box1");
    assert!(first["value"].is_i64());
    assert!(first["timestamp"].is_i64());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn metadata_reported_once_per_series() {
    let (addr, mock) = MockTsdb::spawn(StatusCode::NO_CONTENT).await;

    let mut cfg = remote_config(addr);
    cfg.metadata.enabled = true;
    cfg.metadata.flush_interval = Duration::from_millis(100);

    let collector = IntervalCollector::new("series", |emitter: &Emitter| {
        let mut batch = emitter.batch();
        for i in 0..4 {
            let idx = i.to_string();
            batch.add(
                "test.series",
                i,
                &[("i", idx.as_str())],
                RateType::Counter,
                Unit::Bytes,
                "Bytes seen.",
            );
        }
        Ok(batch)
    })
    .with_cadence(Duration::from_millis(100));

    let mut agent = Agent::new(cfg).expect("agent").with_hostname("testbox");
    agent.start(registry_with(collector)).await.expect("start");
    tokio::time::sleep(Duration::from_millis(800)).await;
    agent.stop().await.expect("stop");

    let entries = mock.metadata.lock().clone();
    assert_eq!(entries.len(), 4 * 3, "rate, unit and desc once per series");

    let mut keys: Vec<String> = entries
        .iter()
        .map(|e| format!("{}|{}|{}", e["metric"], e["tags"], e["name"]))
        .collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 12);

    assert!(entries
        .iter()
        .any(|e| e["name"] == "rate" && e["value"] == "counter"));
    assert!(entries
        .iter()
        .any(|e| e["name"] == "unit" && e["value"] == "bytes"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_memory_ceiling_is_fatal() {
    let (addr, _mock) = MockTsdb::spawn(StatusCode::NO_CONTENT).await;

    let mut cfg = remote_config(addr);
    cfg.watchdog.max_rss_bytes = 1024 * 1024;
    cfg.watchdog.check_interval = Duration::from_millis(200);

    let mut agent = Agent::new(cfg)
        .expect("agent")
        .with_hostname("testbox")
        .with_memory_probe(Arc::new(HugeRss));
    agent.start(Registry::new()).await.expect("start");

    let fatal = tokio::time::timeout(Duration::from_secs(2), agent.fatal())
        .await
        .expect("watchdog fires on its first check")
        .expect("fatal condition");

    assert!(matches!(fatal, Fatal::MemoryCeilingExceeded { .. }));
    assert_eq!(fatal.exit_code(), 3);

    agent.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_version_point_sent_once_in_remote_mode() {
    let (addr, mock) = MockTsdb::spawn(StatusCode::NO_CONTENT).await;
    let mut cfg = remote_config(addr);
    cfg.sender.flush_interval = Duration::from_millis(100);

    let mut agent = Agent::new(cfg)
        .expect("agent")
        .with_hostname("web1.example.com")
        .with_version_date(20260101120000);
    agent.start(Registry::new()).await.expect("start");

    tokio::time::sleep(Duration::from_millis(800)).await;
    agent.stop().await.expect("stop");

    let points: Vec<serde_json::Value> = mock.batches.lock().iter().flatten().cloned().collect();
    let versions: Vec<&serde_json::Value> =
        points.iter().filter(|p| p["metric"] == "version").collect();
    assert_eq!(versions.len(), 1, "points: {points:?}");
    assert_eq!(versions[0]["value"], 20260101120000i64);
    assert_eq!(versions[0]["tags"]["host"], "web1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_version_point_not_printed_locally() {
    let collector = IntervalCollector::new("synthetic", |emitter: &Emitter| {
        let mut batch = emitter.batch();
        batch.add("test.metric", 1, &[], RateType::Gauge, Unit::None, "");
        Ok(batch)
    })
    .with_cadence(Duration::from_millis(200));

    let out = SharedBuf::default();
    let mut agent = Agent::new(Config::default())
        .expect("agent")
        .with_hostname("testbox")
        .with_version_date(20260101120000)
        .with_output(Box::new(out.clone()));
    agent.start(registry_with(collector)).await.expect("start");

    tokio::time::sleep(Duration::from_millis(700)).await;
    agent.stop().await.expect("stop");

    let lines = out.lines();
    assert!(!lines.is_empty());
    assert!(lines.iter().all(|l| l.starts_with("test.metric ")), "{lines:?}");
}
