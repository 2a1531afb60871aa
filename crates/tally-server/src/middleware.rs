use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::net::IpAddr;
use std::str::FromStr;
use tally_common::crypto::{ENCRYPTION_HEADER, ENCRYPTION_SCHEME};
use thiserror::Error;

use crate::api::error_response;
use crate::logging::TraceId;
use crate::state::AppState;

/// Header carrying the reporting host's address.
pub static REAL_IP_HEADER: HeaderName = HeaderName::from_static("x-real-ip");

/// Largest request body accepted for decryption.
const MAX_ENCRYPTED_BODY: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
#[error("invalid CIDR {0:?}")]
pub struct InvalidSubnet(String);

/// An IPv4 or IPv6 network in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: IpAddr,
    prefix: u8,
}

impl FromStr for Subnet {
    type Err = InvalidSubnet;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSubnet(s.to_string());
        let (addr, prefix) = match s.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s.trim(), None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => max,
        };
        if prefix > max {
            return Err(invalid());
        }
        Ok(Self {
            network: mask(addr, prefix),
            prefix,
        })
    }
}

fn mask(addr: IpAddr, prefix: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V4((bits & mask).into())
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let mask = u128::MAX.checked_shl(128 - u32::from(prefix)).unwrap_or(0);
            IpAddr::V6((bits & mask).into())
        }
    }
}

impl Subnet {
    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        if ip.is_ipv4() != self.network.is_ipv4() {
            return false;
        }
        mask(ip, self.prefix) == self.network
    }
}

fn trace_id_of<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_default()
}

/// Address from `X-Real-IP`, if present and well formed.
pub fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(&REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Rejects requests whose `X-Real-IP` is missing or outside the trusted
/// subnet with 403. Passes everything through when no subnet is set.
pub async fn trusted_subnet_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(subnet) = state.trusted_subnet else {
        return next.run(req).await;
    };

    match real_ip(req.headers()) {
        Some(ip) if subnet.contains(ip) => next.run(req).await,
        ip => {
            let trace_id = trace_id_of(&req);
            tracing::warn!(
                trace_id = %trace_id,
                real_ip = ?ip,
                "Request rejected: address outside trusted subnet"
            );
            error_response(
                StatusCode::FORBIDDEN,
                &trace_id,
                "forbidden",
                "address is not in the trusted subnet",
            )
        }
    }
}

fn is_encrypted(headers: &HeaderMap) -> bool {
    let marked = headers
        .get(ENCRYPTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(ENCRYPTION_SCHEME));
    let octet_stream = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/octet-stream"));
    marked && octet_stream
}

/// Replaces an encrypted body with its plaintext JSON before the handlers
/// see it. Undecryptable bodies are a 400.
pub async fn decrypt_body_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !is_encrypted(req.headers()) {
        return next.run(req).await;
    }

    let trace_id = trace_id_of(&req);
    let Some(decryptor) = state.decryptor.clone() else {
        tracing::warn!(trace_id = %trace_id, "Encrypted body received but no private key is configured");
        return error_response(
            StatusCode::BAD_REQUEST,
            &trace_id,
            "decrypt_failed",
            "server is not configured for encrypted bodies",
        );
    };

    let (mut parts, body) = req.into_parts();
    let bytes = match to_bytes(body, MAX_ENCRYPTED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "Failed to read encrypted body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "decrypt_failed",
                "failed to read request body",
            );
        }
    };

    let plain = match decryptor.decrypt(&bytes) {
        Ok(plain) => plain,
        Err(e) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "Failed to decrypt body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &trace_id,
                "decrypt_failed",
                "failed to decrypt request body",
            );
        }
    };

    parts.headers.remove(ENCRYPTION_HEADER);
    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    next.run(Request::from_parts(parts, Body::from(plain))).await
}
