//! End-to-end pipeline scenarios against an in-memory store and a mock
//! reverse geocoding server.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use arrow::datatypes::{DataType, Field, Schema};
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use parquet::basic::Compression;
use serde_json::{json, Value};
use tempfile::TempDir;

use device_enrich::config::Config;
use device_enrich::error::PipelineError;
use device_enrich::geocode::{GeocodeFetcher, HttpGeocoder, ReverseGeocoder};
use device_enrich::ingest::Pipeline;
use device_enrich::kv::{KvStore, MemoryKv};
use device_enrich::models::{CoordKey, DeviceRecord};
use device_enrich::parquet_io::{write_row_groups, ParquetSource};
use device_enrich::progress::{CheckpointFile, FileStatus, ProgressCheckpoint, StatusLedger};

#[derive(Clone)]
struct MockState {
    calls: Arc<AtomicUsize>,
}

async fn reverse(
    State(state): State<MockState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let lat: f64 = params
        .get("lat")
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    let near = |target: f64| (lat - target).abs() < 1e-3;

    if near(40.7128) {
        Json(json!({
            "features": [{
                "properties": {
                    "city": "New York",
                    "state": "New York",
                    "country": "United States",
                    "countrycode": "US",
                    "postcode": "10007"
                }
            }]
        }))
        .into_response()
    } else if near(10.0) {
        (StatusCode::INTERNAL_SERVER_ERROR, "upstream down").into_response()
    } else if near(20.0) {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        Json(json!({ "features": [{ "properties": { "city": "Too Late" } }] })).into_response()
    } else if near(30.0) {
        (StatusCode::OK, "<html>not json</html>").into_response()
    } else {
        Json(json!({ "features": [] })).into_response()
    }
}

async fn start_mock_geocoder() -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/reverse", get(reverse))
        .with_state(MockState {
            calls: calls.clone(),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), calls)
}

fn input_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("refId", DataType::Utf8, true),
        Field::new("date", DataType::Int64, true),
        Field::new("device_ifa", DataType::Utf8, true),
        Field::new("device_vendor", DataType::Utf8, true),
        Field::new("device_model", DataType::Utf8, true),
        Field::new("os_version", DataType::Utf8, true),
        Field::new("ua", DataType::Utf8, true),
        Field::new("latitude", DataType::Float64, true),
        Field::new("longitude", DataType::Float64, true),
        Field::new("city", DataType::Utf8, true),
        Field::new("region", DataType::Utf8, true),
    ]))
}

fn event(ref_id: &str, lat: f64, lon: f64) -> DeviceRecord {
    [
        ("refId", json!(ref_id)),
        ("date", json!(1_700_000_000_000i64)),
        ("device_ifa", json!("ifa-1")),
        ("device_vendor", json!("Samsung")),
        ("device_model", json!("Samsung Galaxy S9")),
        ("os_version", json!("10.0.1")),
        ("ua", json!("Mozilla/5.0 (Linux; Android 10; SM-G960F)")),
        ("latitude", json!(lat)),
        ("longitude", json!(lon)),
        ("city", json!("Springfield")),
        ("region", json!("IL")),
    ]
    .into_iter()
    .collect()
}

fn write_input(path: &Path, groups: &[Vec<DeviceRecord>]) {
    write_row_groups(path, input_schema(), groups, Compression::SNAPPY).unwrap();
}

struct Harness {
    tmp: TempDir,
    config: Config,
    kv: Arc<MemoryKv>,
    calls: Arc<AtomicUsize>,
}

impl Harness {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let (base_url, calls) = start_mock_geocoder().await;
        let mut config = Config::minimal(tmp.path());
        config.geocoder.base_url = base_url;
        config.vendors.defaults = "samsung,apple".to_string();
        fs::create_dir_all(&config.paths.input_dir).unwrap();
        Self {
            tmp,
            config,
            kv: Arc::new(MemoryKv::new()),
            calls,
        }
    }

    fn pipeline(&self) -> Pipeline {
        let fetcher = GeocodeFetcher::from_config(&self.config.geocoder).unwrap();
        Pipeline::new(self.config.clone(), self.kv.clone(), fetcher)
    }

    fn input(&self, name: &str) -> std::path::PathBuf {
        self.config.paths.input_dir.join(name)
    }

    fn output_records(&self, name: &str) -> Vec<DeviceRecord> {
        let path = self.config.paths.output_dir.join(name);
        ParquetSource::open(&path)
            .unwrap()
            .read_all_blocking()
            .unwrap()
    }
}

#[tokio::test]
async fn enriches_and_serves_repeat_coordinates_from_cache() {
    let h = Harness::new().await;
    write_input(
        &h.input("A.parquet"),
        &[vec![event("a-1", 40.7128, -74.0060), event("a-2", 40.7128, -74.0060)]],
    );

    let summary = h.pipeline().run().await.unwrap();
    assert_eq!(summary.files_succeeded, vec!["A.parquet".to_string()]);
    assert!(summary.files_failed.is_empty());
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);

    let out = h.output_records("A.parquet");
    assert_eq!(out.len(), 2);
    let row = &out[0];
    assert_eq!(row.text("city").as_deref(), Some("New York"));
    assert_eq!(row.text("state").as_deref(), Some("New York"));
    assert_eq!(row.text("device_country_code").as_deref(), Some("US"));
    assert_eq!(row.text("zip").as_deref(), Some("10007"));
    assert_eq!(row.text("device_vendor").as_deref(), Some("samsung"));
    assert_eq!(row.text("device_model").as_deref(), Some("galaxy s9"));
    assert_eq!(row.text("normalized_osv").as_deref(), Some("10"));
    assert_eq!(
        row.text("reqTimeConverted").as_deref(),
        Some("2023-11-14 22:13:20")
    );
    assert!(!h.input("A.parquet").exists());

    let statuses = StatusLedger::new(&h.config.paths.status_file).load().unwrap();
    assert_eq!(statuses["A.parquet"], FileStatus::Success);

    write_input(&h.input("B.parquet"), &[vec![event("b-1", 40.7128, -74.0060)]]);
    h.pipeline().run().await.unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.output_records("B.parquet")[0].text("city").as_deref(),
        Some("New York")
    );
}

#[tokio::test]
async fn invalid_coordinates_fall_back_to_record_fields() {
    let h = Harness::new().await;
    write_input(&h.input("A.parquet"), &[vec![event("a-1", 200.0, 10.0)]]);

    h.pipeline().run().await.unwrap();
    assert_eq!(h.calls.load(Ordering::SeqCst), 0);

    let out = h.output_records("A.parquet");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].text("city").as_deref(), Some("Springfield"));
    assert_eq!(out[0].text("state").as_deref(), Some("IL"));
    assert_eq!(out[0].text("region").as_deref(), Some(""));
}

#[tokio::test]
async fn resumes_row_group_counter_from_checkpoint() {
    let h = Harness::new().await;
    let groups = vec![
        vec![event("a-1", 200.0, 10.0)],
        vec![event("a-2", 200.0, 10.0)],
        vec![event("a-3", 200.0, 10.0)],
    ];
    write_input(&h.input("A.parquet"), &groups);
    let checkpoint = CheckpointFile::new(&h.config.paths.progress_file);
    checkpoint
        .save(&ProgressCheckpoint::new("A.parquet", 2))
        .unwrap();

    let summary = h.pipeline().run().await.unwrap();
    assert_eq!(summary.row_groups, 3);

    let saved = checkpoint.load().unwrap();
    assert_eq!(saved.row_count, 5);
    assert!(saved.file.ends_with("A.parquet"));
    assert_eq!(h.output_records("A.parquet").len(), 3);
}

#[tokio::test]
async fn corrupt_file_is_marked_failed_and_kept() {
    let h = Harness::new().await;
    fs::write(h.input("A.parquet"), b"definitely not parquet").unwrap();
    write_input(&h.input("B.parquet"), &[vec![event("b-1", 200.0, 10.0)]]);

    let summary = h.pipeline().run().await.unwrap();
    assert_eq!(summary.files_failed, vec!["A.parquet".to_string()]);
    assert_eq!(summary.files_succeeded, vec!["B.parquet".to_string()]);

    assert!(h.input("A.parquet").exists());
    assert!(!h.input("B.parquet").exists());
    assert!(!h.config.paths.output_dir.join("A.parquet").exists());

    let statuses = StatusLedger::new(&h.config.paths.status_file).load().unwrap();
    assert_eq!(statuses["A.parquet"], FileStatus::Failed);
    assert_eq!(statuses["B.parquet"], FileStatus::Success);
    assert!(h.tmp.path().join("status.json").exists());
}

#[tokio::test]
async fn rerun_after_crash_does_not_duplicate_output() {
    let h = Harness::new().await;
    let rows = vec![vec![event("a-1", 200.0, 10.0), event("a-2", 200.0, 10.0)]];
    write_input(&h.input("A.parquet"), &rows);
    h.pipeline().run().await.unwrap();

    // Source came back, as if removal never happened.
    write_input(&h.input("A.parquet"), &rows);
    let summary = h.pipeline().run().await.unwrap();
    assert_eq!(summary.duplicates_skipped, 2);
    assert_eq!(h.output_records("A.parquet").len(), 2);
}

#[tokio::test]
async fn http_failures_map_to_lookup_errors() {
    let h = Harness::new().await;
    let mut geocoder_config = h.config.geocoder.clone();
    geocoder_config.timeout_secs = 1;
    let geocoder = HttpGeocoder::new(&geocoder_config).unwrap();

    let coord = |lat: f64| CoordKey::new(lat, 5.0).unwrap();
    let server_error = geocoder.reverse(coord(10.0)).await.unwrap_err();
    assert!(matches!(server_error, PipelineError::LookupTransport { .. }));
    assert!(server_error.to_string().contains("500"));

    let slow = geocoder.reverse(coord(20.0)).await.unwrap_err();
    assert!(matches!(slow, PipelineError::LookupTimeout(_)));

    let bad_body = geocoder.reverse(coord(30.0)).await.unwrap_err();
    assert!(matches!(bad_body, PipelineError::LookupTransport { .. }));

    assert_eq!(geocoder.reverse(coord(50.0)).await.unwrap(), None);
}

#[tokio::test]
async fn failed_lookups_fall_back_and_are_not_cached() {
    let mut h = Harness::new().await;
    h.config.geocoder.timeout_secs = 1;
    write_input(
        &h.input("A.parquet"),
        &[vec![
            event("a-1", 10.0, 5.0),
            event("a-2", 20.0, 5.0),
            event("a-3", 30.0, 5.0),
        ]],
    );

    let summary = h.pipeline().run().await.unwrap();
    assert_eq!(summary.files_succeeded, vec!["A.parquet".to_string()]);
    let statuses = StatusLedger::new(&h.config.paths.status_file).load().unwrap();
    assert_eq!(statuses["A.parquet"], FileStatus::Success);

    let out = h.output_records("A.parquet");
    assert_eq!(out.len(), 3);
    for row in &out {
        assert_eq!(row.text("city").as_deref(), Some("Springfield"));
        assert_eq!(row.text("state").as_deref(), Some("IL"));
    }
    assert_eq!(h.kv.count_keys("location:").await.unwrap(), 0);
}

/// A store that is never reachable.
struct DownKv;

#[async_trait]
impl KvStore for DownKv {
    async fn ping(&self) -> Result<()> {
        Err(anyhow!("connection refused"))
    }
    async fn set_members(&self, _key: &str) -> Result<Vec<String>> {
        Err(anyhow!("connection refused"))
    }
    async fn set_add(&self, _key: &str, _members: &[String]) -> Result<u64> {
        Err(anyhow!("connection refused"))
    }
    async fn hash_get_all(&self, _key: &str) -> Result<HashMap<String, String>> {
        Err(anyhow!("connection refused"))
    }
    async fn hash_get(&self, _key: &str, _field: &str) -> Result<Option<String>> {
        Err(anyhow!("connection refused"))
    }
    async fn hash_get_many(&self, _key: &str, _fields: &[String]) -> Result<Vec<Option<String>>> {
        Err(anyhow!("connection refused"))
    }
    async fn hash_set(&self, _key: &str, _field: &str, _value: &str) -> Result<()> {
        Err(anyhow!("connection refused"))
    }
    async fn get_many(&self, _keys: &[String]) -> Result<Vec<Option<String>>> {
        Err(anyhow!("connection refused"))
    }
    async fn set_many_with_expiry(
        &self,
        _entries: &[(String, String)],
        _ttl: Duration,
    ) -> Result<()> {
        Err(anyhow!("connection refused"))
    }
    async fn count_keys(&self, _prefix: &str) -> Result<u64> {
        Err(anyhow!("connection refused"))
    }
    async fn purge_expired(&self) -> Result<u64> {
        Err(anyhow!("connection refused"))
    }
}

#[tokio::test]
async fn unreachable_store_aborts_before_touching_inputs() {
    let h = Harness::new().await;
    write_input(&h.input("A.parquet"), &[vec![event("a-1", 200.0, 10.0)]]);

    let fetcher = GeocodeFetcher::from_config(&h.config.geocoder).unwrap();
    let pipeline = Pipeline::new(h.config.clone(), Arc::new(DownKv), fetcher);
    let err = pipeline.run().await.unwrap_err();

    let err = err.downcast_ref::<PipelineError>().unwrap();
    assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    assert!(err.is_fatal());
    assert!(h.input("A.parquet").exists());
    assert!(!h.config.paths.status_file.exists());
}
