//! Per-record HMAC-SHA256 authentication tags.
//!
//! The tag covers a canonical string, `name:gauge:value` with the gauge
//! printed to six decimals or `name:counter:delta`, and travels hex encoded
//! in the record's `hash` field.

use crate::error::SignError;
use crate::types::{Metric, MetricValue};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Canonical string a tag is computed over.
pub fn canonical(metric: &Metric) -> String {
    match metric.value {
        MetricValue::Gauge(v) => format!("{}:gauge:{v:.6}", metric.name),
        MetricValue::Counter(d) => format!("{}:counter:{d}", metric.name),
    }
}

/// Signs and verifies records with a shared key.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Signer(..)")
    }
}

impl Signer {
    pub fn new(key: &[u8]) -> Result<Self, SignError> {
        if key.is_empty() {
            return Err(SignError::EmptyKey);
        }
        let mac = HmacSha256::new_from_slice(key).map_err(|_| SignError::EmptyKey)?;
        Ok(Self { mac })
    }

    /// Builds a signer from an optional configured key. `None` and the empty
    /// string both mean signing is off.
    pub fn from_key(key: Option<&str>) -> Option<Self> {
        key.filter(|k| !k.is_empty())
            .and_then(|k| Self::new(k.as_bytes()).ok())
    }

    pub fn sign(&self, metric: &Metric) -> String {
        let mut mac = self.mac.clone();
        mac.update(canonical(metric).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Checks `tag` against the recomputed one. A missing tag is an error.
    pub fn verify(&self, metric: &Metric, tag: Option<&str>) -> Result<(), SignError> {
        let tag = tag.ok_or_else(|| SignError::Missing(metric.name.clone()))?;
        let expected =
            hex::decode(tag).map_err(|_| SignError::Malformed(metric.name.clone()))?;
        let mut mac = self.mac.clone();
        mac.update(canonical(metric).as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| SignError::Mismatch(metric.name.clone()))
    }
}
