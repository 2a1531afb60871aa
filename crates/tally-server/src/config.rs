use serde::Deserialize;
use std::time::Duration;
use tally_storage::StoreConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// gRPC listen address; empty disables the gRPC listener.
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: Option<String>,
    /// Shared HMAC key. When set every update must carry a matching tag.
    pub sign_key: Option<String>,
    /// PEM private key for decrypting request bodies.
    pub crypto_private_key: Option<String>,
    /// CIDR the `X-Real-IP` header must fall in, e.g. `192.168.1.0/24`.
    pub trusted_subnet: Option<String>,
    /// CORS allowed origins; empty allows any origin.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
    /// How many recent batch ids are remembered for replay detection.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub store: StoreConfig,
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_grpc_addr() -> Option<String> {
    Some("127.0.0.1:50051".to_string())
}

fn default_dedup_window() -> usize {
    1024
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            grpc_addr: default_grpc_addr(),
            sign_key: None,
            crypto_private_key: None,
            trusted_subnet: None,
            cors_allowed_origins: Vec::new(),
            dedup_window: default_dedup_window(),
            shutdown_grace_secs: default_shutdown_grace(),
            debug: false,
            store: StoreConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn grpc_addr(&self) -> Option<&str> {
        self.grpc_addr.as_deref().filter(|a| !a.is_empty())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
