use crate::types::MetricKind;

/// Validation failures for a single metric report.
///
/// Every variant is a client error: the report is rejected and nothing is
/// applied.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("metric name is required")]
    MissingName,

    #[error("unknown metric kind: {0}")]
    UnknownKind(String),

    #[error("invalid {kind} value: {raw:?}")]
    InvalidValue { kind: MetricKind, raw: String },

    #[error("metric {name} has no {field} for kind {kind}")]
    MissingValue {
        name: String,
        kind: MetricKind,
        field: &'static str,
    },

    #[error("gauge {name} is not a finite number")]
    NonFinite { name: String },
}

/// Signature check failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    #[error("signing key is empty")]
    EmptyKey,

    #[error("hash is required for metric {0}")]
    Missing(String),

    #[error("hash for metric {0} is not valid hex")]
    Malformed(String),

    #[error("hash mismatch for metric {0}")]
    Mismatch(String),
}

/// Payload encryption failures.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("crypto: failed to read key file {path}: {source}")]
    KeyFile {
        path: String,
        source: std::io::Error,
    },

    #[error("crypto: unsupported or malformed PEM key")]
    KeyFormat,

    #[error("crypto: RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("crypto: random number generator failure")]
    Random,

    #[error("crypto: AES-GCM seal/open failed")]
    Aead,

    #[error("crypto: envelope is truncated or malformed")]
    Envelope,
}
