#![allow(dead_code)]

use anyhow::Result;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tally_common::crypto::{generate_key_pair, Encryptor};
use tally_common::sign::Signer;
use tally_common::types::{Metric, MetricRecord};
use tally_server::app;
use tally_server::config::ServerConfig;
use tally_server::state::AppState;
use tally_storage::{Storage, StoreConfig};
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const TEST_KEY: &str = "test-sign-key";

pub struct TestContext {
    pub temp_dir: TempDir,
    pub state: AppState,
    pub app: axum::Router,
    /// Set when the context was built with encryption on.
    pub encryptor: Option<Encryptor>,
}

#[derive(Default)]
pub struct TestOptions {
    pub sign_key: Option<&'static str>,
    pub trusted_subnet: Option<&'static str>,
    pub encrypted: bool,
    pub durable: bool,
}

pub fn build_test_context() -> Result<TestContext> {
    build_test_context_with(TestOptions::default())
}

pub fn build_test_context_with(options: TestOptions) -> Result<TestContext> {
    let temp_dir = tempfile::tempdir()?;

    let store_config = StoreConfig {
        interval_secs: 0,
        file: temp_dir
            .path()
            .join("metrics.json")
            .to_string_lossy()
            .to_string(),
        restore: false,
        database_dsn: options.durable.then(|| {
            temp_dir
                .path()
                .join("metrics.db")
                .to_string_lossy()
                .to_string()
        }),
    };

    let mut encryptor = None;
    let crypto_private_key = if options.encrypted {
        let (public_pem, private_pem) = generate_key_pair(1024)?;
        let path = temp_dir.path().join("private.pem");
        std::fs::write(&path, private_pem)?;
        encryptor = Some(Encryptor::from_pem(&public_pem)?);
        Some(path.to_string_lossy().to_string())
    } else {
        None
    };

    let config = ServerConfig {
        sign_key: options.sign_key.map(str::to_string),
        crypto_private_key,
        trusted_subnet: options.trusted_subnet.map(str::to_string),
        dedup_window: 16,
        store: store_config.clone(),
        ..ServerConfig::default()
    };

    let store = Arc::new(Storage::open(&store_config)?);
    let state = AppState::new(config, store)?;
    let app = app::build_http_app(state.clone());

    Ok(TestContext {
        temp_dir,
        state,
        app,
        encryptor,
    })
}

pub fn signed(metric: Metric) -> MetricRecord {
    let signer = Signer::new(TEST_KEY.as_bytes()).expect("key should be accepted");
    let hash = signer.sign(&metric);
    MetricRecord::from_metric(&metric).with_hash(Some(hash))
}

pub fn unsigned(metric: Metric) -> MetricRecord {
    MetricRecord::from_metric(&metric)
}

pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
    pub trace_id: Option<String>,
}

pub async fn send(app: &axum::Router, req: Request<Body>) -> TestResponse {
    let resp = app
        .clone()
        .oneshot(req)
        .await
        .expect("request should be handled");

    let status = resp.status();
    let trace_id = resp
        .headers()
        .get("x-trace-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let bytes = to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body should read");
    let text = String::from_utf8_lossy(&bytes).to_string();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice::<Value>(&bytes).unwrap_or_else(|_| Value::String(text.clone()))
    };

    TestResponse {
        status,
        body,
        text,
        trace_id,
    }
}

pub async fn request_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Value,
) -> TestResponse {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder
        .body(Body::from(body.to_string()))
        .expect("request should build");
    send(app, req).await
}

pub async fn request_no_body(
    app: &axum::Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
) -> TestResponse {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Body::empty()).expect("request should build");
    send(app, req).await
}

pub async fn grpc_update_direct(
    service: &tally_server::grpc::MetricServiceImpl,
    batch_id: &str,
    records: &[MetricRecord],
    real_ip: Option<&str>,
) -> std::result::Result<
    tonic::Response<tally_common::proto::UpdateBatchResponse>,
    tonic::Status,
> {
    use tally_common::proto::metric_service_server::MetricService;
    use tally_common::proto::{MetricBatchProto, MetricProto};

    let mut request = tonic::Request::new(MetricBatchProto {
        batch_id: batch_id.to_string(),
        metrics: records.iter().map(MetricProto::from).collect(),
    });
    if let Some(ip) = real_ip {
        let value = ip.parse().expect("ip should be valid metadata");
        request.metadata_mut().insert("x-real-ip", value);
    }
    service.update_batch(request).await
}
