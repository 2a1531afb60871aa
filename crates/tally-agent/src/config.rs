use serde::Deserialize;
use std::time::Duration;

/// Which wire protocol the agent reports over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Grpc,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_retry_count")]
    pub count: u32,
    /// Wait before the first retry; doubles on each further retry.
    #[serde(default = "default_retry_wait")]
    pub wait_secs: u64,
    /// Cap for a single wait.
    #[serde(default = "default_retry_max_wait")]
    pub max_wait_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: default_retry_count(),
            wait_secs: default_retry_wait(),
            max_wait_secs: default_retry_max_wait(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// HTTP collector address, `host:port` or a full URL.
    #[serde(default = "default_server_endpoint")]
    pub server_endpoint: String,
    /// gRPC collector address, used when `transport = "grpc"`.
    #[serde(default = "default_grpc_endpoint")]
    pub grpc_endpoint: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Use https/TLS scheme for bare `host:port` endpoints
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    /// Shared HMAC key; empty or absent disables signing.
    pub sign_key: Option<String>,
    /// PEM public key of the collector; enables body encryption over HTTP.
    pub crypto_public_key: Option<String>,
    /// Gzip request bodies.
    #[serde(default = "default_compress")]
    pub compress: bool,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Bound on waiting for in-flight uploads at shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub debug: bool,
}

fn default_server_endpoint() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_grpc_endpoint() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_poll_interval() -> u64 {
    2
}

fn default_report_interval() -> u64 {
    10
}

fn default_compress() -> bool {
    true
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_wait() -> u64 {
    10
}

fn default_retry_max_wait() -> u64 {
    90
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_endpoint: default_server_endpoint(),
            grpc_endpoint: default_grpc_endpoint(),
            transport: TransportKind::default(),
            tls: false,
            poll_interval_secs: default_poll_interval(),
            report_interval_secs: default_report_interval(),
            sign_key: None,
            crypto_public_key: None,
            compress: default_compress(),
            retry: RetryConfig::default(),
            shutdown_grace_secs: default_shutdown_grace(),
            debug: false,
        }
    }
}

fn with_scheme(addr: &str, tls: bool) -> String {
    let addr = addr.trim().trim_end_matches('/');
    if addr.contains("://") {
        return addr.to_string();
    }
    let scheme = if tls { "https" } else { "http" };
    format!("{scheme}://{addr}")
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Base URL for the HTTP transport, without trailing slash.
    pub fn http_base_url(&self) -> String {
        with_scheme(&self.server_endpoint, self.tls)
    }

    /// Build the gRPC endpoint URI from grpc_endpoint and tls config.
    pub fn grpc_uri(&self) -> String {
        with_scheme(&self.grpc_endpoint, self.tls)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
