use crate::config::ServerConfig;
use crate::ingest::IngestService;
use crate::middleware::Subnet;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tally_common::crypto::Decryptor;
use tally_common::sign::Signer;
use tally_storage::Storage;

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestService>,
    pub store: Arc<Storage>,
    pub decryptor: Option<Arc<Decryptor>>,
    pub trusted_subnet: Option<Subnet>,
    pub start_time: DateTime<Utc>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wires the shared pieces from configuration. Fails on an unreadable
    /// private key or a malformed subnet.
    pub fn new(config: ServerConfig, store: Arc<Storage>) -> anyhow::Result<Self> {
        let decryptor = match config.crypto_private_key.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => {
                let decryptor = Decryptor::load(path)
                    .with_context(|| format!("failed to load private key {path}"))?;
                tracing::info!(key = %path, "Request body decryption enabled");
                Some(Arc::new(decryptor))
            }
            None => None,
        };

        let trusted_subnet = match config.trusted_subnet.as_deref().map(str::trim) {
            Some(cidr) if !cidr.is_empty() => {
                let subnet: Subnet = cidr.parse()?;
                tracing::info!(subnet = %cidr, "Trusted subnet check enabled");
                Some(subnet)
            }
            _ => None,
        };

        let signer = Signer::from_key(config.sign_key.as_deref());
        if signer.is_some() {
            tracing::info!("Signature verification enabled");
        }

        let ingest = Arc::new(IngestService::new(
            Arc::clone(&store),
            signer,
            config.dedup_window,
        ));

        Ok(Self {
            ingest,
            store,
            decryptor,
            trusted_subnet,
            start_time: Utc::now(),
            config: Arc::new(config),
        })
    }
}
