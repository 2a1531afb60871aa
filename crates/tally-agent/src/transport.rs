//! Delivery of metric records to the collector.
//!
//! [`HttpTransport`] posts JSON bodies with bounded exponential retry, and
//! optionally encrypts or gzips them. [`GrpcTransport`] sends the same
//! records through `MetricService/UpdateBatch`, reconnecting lazily. Both
//! resend an identical batch id on retry so the collector can drop replays.

use crate::config::{AgentConfig, RetryConfig, TransportKind};
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io::Write;
use std::net::UdpSocket;
use std::time::Duration;
use tally_common::crypto::{Encryptor, ENCRYPTION_HEADER, ENCRYPTION_SCHEME};
use tally_common::error::CryptoError;
use tally_common::id::next_batch_id;
use tally_common::proto::metric_service_client::MetricServiceClient;
use tally_common::proto::{MetricBatchProto, MetricProto};
use tally_common::types::MetricRecord;
use thiserror::Error;
use tokio::sync::Mutex;
use tonic::transport::Channel;
use tonic::Code;

pub const BATCH_ID_HEADER: &str = "x-batch-id";
pub const REAL_IP_HEADER: &str = "x-real-ip";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("collector answered {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("rpc failed: {0}")]
    Grpc(#[from] tonic::Status),
    #[error("connect failed: {0}")]
    Connect(#[from] tonic::transport::Error),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("encryption failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("compression failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("collector rejected batch: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Whether another attempt could succeed: connection trouble and
    /// server-side failures, never a rejection of the payload itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Request(e) => !e.is_builder() && !e.is_decode(),
            TransportError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            TransportError::Grpc(status) => matches!(
                status.code(),
                Code::Unavailable
                    | Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Aborted
                    | Code::Internal
                    | Code::Unknown
            ),
            TransportError::Connect(_) => true,
            _ => false,
        }
    }
}

/// Retry schedule: up to `count` retries, waiting `wait` before the first
/// and doubling each time, never more than `max_wait` per wait.
#[derive(Debug, Clone)]
pub struct Backoff {
    current_wait: Duration,
    max_wait: Duration,
    remaining: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        let max_wait = Duration::from_secs(config.max_wait_secs);
        Self {
            current_wait: Duration::from_secs(config.wait_secs).min(max_wait),
            max_wait,
            remaining: config.count,
        }
    }

    /// Next wait, or `None` once the retry budget is spent.
    pub fn next_wait(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let wait = self.current_wait;
        self.current_wait = self
            .current_wait
            .checked_mul(2)
            .unwrap_or(self.max_wait)
            .min(self.max_wait);
        Some(wait)
    }
}

/// Primary outbound address of this host towards `target`, sent as
/// `X-Real-IP` for the collector's subnet check. No packets are sent.
fn outbound_ip(host: &str, port: u16) -> Option<String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect((host, port)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// A request body after encoding, ready to be sent any number of times.
struct EncodedBody {
    bytes: Vec<u8>,
    content_type: &'static str,
    encrypted: bool,
    gzipped: bool,
}

#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
    encryptor: Option<Encryptor>,
    compress: bool,
    real_ip: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        retry: RetryConfig,
        encryptor: Option<Encryptor>,
        compress: bool,
    ) -> Result<Self, TransportError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let real_ip = reqwest::Url::parse(&base_url).ok().and_then(|url| {
            let host = url.host_str()?.to_string();
            let port = url.port_or_known_default()?;
            outbound_ip(&host, port)
        });
        tracing::debug!(base_url = %base_url, real_ip = ?real_ip, "HTTP transport ready");
        Ok(Self {
            client,
            base_url,
            retry,
            encryptor,
            compress,
            real_ip,
        })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, TransportError> {
        let encryptor = config
            .crypto_public_key
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(Encryptor::load)
            .transpose()?;
        Self::new(
            config.http_base_url(),
            config.retry.clone(),
            encryptor,
            config.compress,
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn encode(&self, json: Vec<u8>, encrypt: bool) -> Result<EncodedBody, TransportError> {
        // Ciphertext does not compress, so an encrypted body is never gzipped.
        if let Some(encryptor) = self.encryptor.as_ref().filter(|_| encrypt) {
            return Ok(EncodedBody {
                bytes: encryptor.encrypt(&json)?,
                content_type: "application/octet-stream",
                encrypted: true,
                gzipped: false,
            });
        }
        if self.compress {
            return Ok(EncodedBody {
                bytes: gzip(&json)?,
                content_type: "application/json",
                encrypted: false,
                gzipped: true,
            });
        }
        Ok(EncodedBody {
            bytes: json,
            content_type: "application/json",
            encrypted: false,
            gzipped: false,
        })
    }

    async fn post_once(
        &self,
        url: &str,
        body: &EncodedBody,
        batch_id: Option<&str>,
    ) -> Result<(), TransportError> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, body.content_type)
            .body(body.bytes.clone());
        if body.encrypted {
            request = request.header(ENCRYPTION_HEADER, ENCRYPTION_SCHEME);
        }
        if body.gzipped {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(id) = batch_id {
            request = request.header(BATCH_ID_HEADER, id);
        }
        if let Some(ip) = &self.real_ip {
            request = request.header(REAL_IP_HEADER, ip);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status { status, body })
    }

    async fn post_with_retry(
        &self,
        path: &str,
        body: EncodedBody,
        batch_id: Option<&str>,
    ) -> Result<(), TransportError> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = Backoff::new(&self.retry);
        let mut attempt = 1u32;
        loop {
            match self.post_once(&url, &body, batch_id).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => match backoff.next_wait() {
                    Some(wait) => {
                        tracing::warn!(url = %url, attempt, wait_ms = wait.as_millis() as u64, error = %e, "Delivery failed, retrying");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// `POST /updates/` with the whole batch. Encrypted when a public key is
    /// configured.
    pub async fn send_batch(
        &self,
        batch_id: &str,
        records: &[MetricRecord],
    ) -> Result<(), TransportError> {
        let body = self.encode(serde_json::to_vec(records)?, true)?;
        self.post_with_retry("/updates/", body, Some(batch_id)).await
    }

    /// `POST /update/` with one record, never encrypted.
    pub async fn send_record(&self, record: &MetricRecord) -> Result<(), TransportError> {
        let body = self.encode(serde_json::to_vec(record)?, false)?;
        self.post_with_retry("/update/", body, None).await
    }
}

pub struct GrpcTransport {
    endpoint: String,
    client: Mutex<Option<MetricServiceClient<Channel>>>,
    retry: RetryConfig,
    real_ip: Option<String>,
}

impl GrpcTransport {
    pub fn new(endpoint: impl Into<String>, retry: RetryConfig) -> Self {
        let endpoint = endpoint.into();
        let real_ip = reqwest::Url::parse(&endpoint).ok().and_then(|url| {
            let host = url.host_str()?.to_string();
            let port = url.port_or_known_default()?;
            outbound_ip(&host, port)
        });
        Self {
            endpoint,
            client: Mutex::new(None),
            retry,
            real_ip,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        if config.crypto_public_key.is_some() {
            tracing::warn!("Payload encryption applies to HTTP only, gRPC batches are sent in clear");
        }
        Self::new(config.grpc_uri(), config.retry.clone())
    }

    async fn call_once(&self, batch: &MetricBatchProto) -> Result<(), TransportError> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            let client = MetricServiceClient::connect(self.endpoint.clone()).await?;
            tracing::info!(endpoint = %self.endpoint, "Connected to server");
            *guard = Some(client);
        }
        let Some(client) = guard.as_mut() else {
            return Err(TransportError::Rejected("no client".to_string()));
        };

        let mut request = tonic::Request::new(batch.clone());
        if let Some(ip) = self.real_ip.as_deref().and_then(|ip| ip.parse().ok()) {
            request.metadata_mut().insert(REAL_IP_HEADER, ip);
        }
        match client.update_batch(request).await {
            Ok(response) => {
                let response = response.into_inner();
                if response.success {
                    tracing::debug!(applied = response.applied, "Batch acknowledged");
                    Ok(())
                } else {
                    Err(TransportError::Rejected(response.message))
                }
            }
            Err(status) => {
                if status.code() == Code::Unavailable {
                    // Force reconnect on the next attempt.
                    *guard = None;
                }
                Err(status.into())
            }
        }
    }

    pub async fn send_batch(
        &self,
        batch_id: &str,
        records: &[MetricRecord],
    ) -> Result<(), TransportError> {
        let batch = MetricBatchProto {
            batch_id: batch_id.to_string(),
            metrics: records.iter().map(MetricProto::from).collect(),
        };
        let mut backoff = Backoff::new(&self.retry);
        loop {
            match self.call_once(&batch).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => match backoff.next_wait() {
                    Some(wait) => {
                        tracing::warn!(endpoint = %self.endpoint, error = %e, "RPC failed, retrying");
                        tokio::time::sleep(wait).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }
}

pub enum Transport {
    Http(HttpTransport),
    Grpc(GrpcTransport),
}

impl Transport {
    pub fn from_config(config: &AgentConfig) -> Result<Self, TransportError> {
        Ok(match config.transport {
            TransportKind::Http => Transport::Http(HttpTransport::from_config(config)?),
            TransportKind::Grpc => Transport::Grpc(GrpcTransport::from_config(config)),
        })
    }

    pub async fn send_batch(
        &self,
        batch_id: &str,
        records: &[MetricRecord],
    ) -> Result<(), TransportError> {
        match self {
            Transport::Http(http) => http.send_batch(batch_id, records).await,
            Transport::Grpc(grpc) => grpc.send_batch(batch_id, records).await,
        }
    }

    /// Single-record delivery. Over gRPC this is a batch of one.
    pub async fn send_record(&self, record: &MetricRecord) -> Result<(), TransportError> {
        match self {
            Transport::Http(http) => http.send_record(record).await,
            Transport::Grpc(grpc) => {
                grpc.send_batch(&next_batch_id(), std::slice::from_ref(record))
                    .await
            }
        }
    }
}
