#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::post;
use axum::Router;
use flate2::read::GzDecoder;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::{Arc, Mutex};
use tally_agent::config::RetryConfig;
use tally_common::crypto::Decryptor;
use tally_common::types::MetricRecord;

/// One request as the stub collector saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Undoes gzip and encryption, then parses the JSON body.
    pub fn plain_body(&self, decryptor: Option<&Decryptor>) -> Vec<u8> {
        let mut body = self.body.clone();
        if self.header("content-encoding") == Some("gzip") {
            let mut out = Vec::new();
            GzDecoder::new(body.as_slice()).read_to_end(&mut out).unwrap();
            body = out;
        }
        if self.header("x-encrypted").is_some() {
            body = decryptor.expect("decryptor for encrypted body").decrypt(&body).unwrap();
        }
        body
    }

    pub fn batch(&self, decryptor: Option<&Decryptor>) -> Vec<MetricRecord> {
        serde_json::from_slice(&self.plain_body(decryptor)).unwrap()
    }

    pub fn record(&self) -> MetricRecord {
        serde_json::from_slice(&self.plain_body(None)).unwrap()
    }
}

/// Records every request and answers with queued statuses, then 200.
#[derive(Clone, Default)]
pub struct StubCollector {
    received: Arc<Mutex<Vec<Received>>>,
    statuses: Arc<Mutex<VecDeque<StatusCode>>>,
}

impl StubCollector {
    pub fn respond_with(&self, statuses: &[StatusCode]) {
        self.statuses.lock().unwrap().extend(statuses.iter().copied());
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

async fn record(
    State(stub): State<StubCollector>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    stub.received.lock().unwrap().push(Received {
        path: uri.path().to_string(),
        headers,
        body: body.to_vec(),
    });
    stub.statuses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(StatusCode::OK)
}

/// Serves the stub on an ephemeral port and returns its base URL.
pub async fn spawn_stub() -> (String, StubCollector) {
    let stub = StubCollector::default();
    let app = Router::new()
        .route("/update/", post(record))
        .route("/updates/", post(record))
        .with_state(stub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), stub)
}

pub fn fast_retry(count: u32) -> RetryConfig {
    RetryConfig {
        count,
        wait_secs: 0,
        max_wait_secs: 0,
    }
}
