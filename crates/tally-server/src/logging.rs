//! Request logging. Each request gets a trace id, one `-->` line describing
//! what it carried and one `<--` line with the outcome. The id is stored in
//! request extensions and echoed as `X-Trace-Id`.

use crate::api::{error_response, BATCH_ID_HEADER};
use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use rand::Rng;
use serde::de::IgnoredAny;
use serde::Deserialize;
use std::fmt;
use std::time::Instant;
use tally_common::crypto::ENCRYPTION_HEADER;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Largest plain body buffered for inspection.
const MAX_INSPECT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct TraceId(pub String);

impl std::ops::Deref for TraceId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

fn generate_trace_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// What a request body carried, as far as the log line is concerned.
#[derive(Debug, PartialEq)]
enum Payload {
    Empty,
    /// Compressed or encrypted. Only its declared size is known here.
    Opaque { scheme: String, bytes: Option<u64> },
    Batch { batch_id: Option<String>, count: usize },
    Record { id: String, kind: String },
    Unparsed { bytes: usize },
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Empty => f.write_str("-"),
            Payload::Opaque {
                scheme,
                bytes: Some(n),
            } => write!(f, "{scheme} ({n} bytes)"),
            Payload::Opaque { scheme, bytes: None } => write!(f, "{scheme}"),
            Payload::Batch { batch_id, count } => write!(
                f,
                "batch id={} count={count}",
                batch_id.as_deref().unwrap_or("-")
            ),
            Payload::Record { id, kind } => write!(f, "{kind} {id}"),
            Payload::Unparsed { bytes } => write!(f, "unparsed ({bytes} bytes)"),
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Scheme of a body that cannot be read as JSON before the inner layers
/// decode it, if any.
fn opaque_scheme(headers: &HeaderMap) -> Option<String> {
    if let Some(scheme) = header_value(headers, ENCRYPTION_HEADER) {
        return Some(scheme.to_string());
    }
    if let Some(encoding) = header_value(headers, header::CONTENT_ENCODING) {
        return Some(encoding.to_string());
    }
    header_value(headers, header::CONTENT_TYPE)
        .filter(|ct| ct.starts_with("application/octet-stream"))
        .map(|_| "octet-stream".to_string())
}

#[derive(Deserialize)]
struct RecordHead {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    kind: String,
}

fn inspect(path: &str, headers: &HeaderMap, body: &[u8]) -> Payload {
    if body.is_empty() {
        return Payload::Empty;
    }
    if path == "/updates/" {
        return match serde_json::from_slice::<Vec<IgnoredAny>>(body) {
            Ok(items) => Payload::Batch {
                batch_id: header_value(headers, BATCH_ID_HEADER).map(str::to_string),
                count: items.len(),
            },
            Err(_) => Payload::Unparsed { bytes: body.len() },
        };
    }
    match serde_json::from_slice::<RecordHead>(body) {
        Ok(head) => Payload::Record {
            id: head.id,
            kind: head.kind,
        },
        Err(_) => Payload::Unparsed { bytes: body.len() },
    }
}

#[derive(Deserialize)]
struct ErrorHead {
    err_code: i32,
    #[serde(default)]
    err_msg: String,
}

fn set_trace_header(response: &mut Response, trace_id: &str) {
    if let Ok(val) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, val);
    }
}

/// Runs outermost so every other layer can read the trace id.
pub async fn request_logging(mut req: Request, next: Next) -> Response {
    let trace_id = generate_trace_id();
    req.extensions_mut().insert(TraceId(trace_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let real_ip = header_value(req.headers(), "x-real-ip").unwrap_or("-").to_string();

    let (req, payload) = match opaque_scheme(req.headers()) {
        Some(scheme) => {
            let bytes =
                header_value(req.headers(), header::CONTENT_LENGTH).and_then(|v| v.parse().ok());
            (req, Payload::Opaque { scheme, bytes })
        }
        None if method == Method::POST => {
            let (parts, body) = req.into_parts();
            let bytes = match to_bytes(body, MAX_INSPECT_BYTES).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(
                        trace_id = %trace_id,
                        method = %method,
                        path = %path,
                        real_ip = %real_ip,
                        error = %e,
                        "--> request body rejected"
                    );
                    let mut response = error_response(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        &trace_id,
                        "bad_request",
                        "request body too large or unreadable",
                    );
                    set_trace_header(&mut response, &trace_id);
                    return response;
                }
            };
            let payload = inspect(&path, &parts.headers, &bytes);
            (Request::from_parts(parts, Body::from(bytes)), payload)
        }
        None => (req, Payload::Empty),
    };

    tracing::info!(
        trace_id = %trace_id,
        method = %method,
        path = %path,
        real_ip = %real_ip,
        payload = %payload,
        "--> request"
    );

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    let status = response.status();

    let mut response = if status.is_client_error() || status.is_server_error() {
        let (parts, body) = response.into_parts();
        let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
        let head = if parts.headers.contains_key(header::CONTENT_ENCODING) {
            None
        } else {
            serde_json::from_slice::<ErrorHead>(&bytes).ok()
        };
        let (err_code, err_msg) = head.map_or((0, String::new()), |h| (h.err_code, h.err_msg));
        if status.is_server_error() {
            tracing::error!(
                trace_id = %trace_id,
                status = status.as_u16(),
                elapsed_ms,
                err_code,
                err_msg = %err_msg,
                "<-- response"
            );
        } else {
            tracing::warn!(
                trace_id = %trace_id,
                status = status.as_u16(),
                elapsed_ms,
                err_code,
                err_msg = %err_msg,
                "<-- response"
            );
        }
        Response::from_parts(parts, Body::from(bytes))
    } else {
        tracing::info!(
            trace_id = %trace_id,
            status = status.as_u16(),
            elapsed_ms,
            "<-- response"
        );
        response
    };

    set_trace_header(&mut response, &trace_id);
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn trace_ids_are_16_hex_chars() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn encoded_and_encrypted_bodies_are_opaque() {
        assert_eq!(
            opaque_scheme(&headers(&[("content-encoding", "gzip")])).as_deref(),
            Some("gzip")
        );
        assert_eq!(
            opaque_scheme(&headers(&[(ENCRYPTION_HEADER, "rsa-aes256gcm")])).as_deref(),
            Some("rsa-aes256gcm")
        );
        assert_eq!(
            opaque_scheme(&headers(&[("content-type", "application/octet-stream")])).as_deref(),
            Some("octet-stream")
        );
        assert_eq!(opaque_scheme(&headers(&[("content-type", "application/json")])), None);
    }

    #[test]
    fn batch_bodies_report_id_and_count() {
        let payload = inspect(
            "/updates/",
            &headers(&[(BATCH_ID_HEADER, "b-7")]),
            br#"[{"id":"a","type":"gauge","value":1},{"id":"b","type":"counter","delta":2}]"#,
        );
        assert_eq!(
            payload,
            Payload::Batch {
                batch_id: Some("b-7".to_string()),
                count: 2
            }
        );
        assert_eq!(payload.to_string(), "batch id=b-7 count=2");
    }

    #[test]
    fn single_records_report_kind_and_name() {
        let payload = inspect(
            "/update/",
            &HeaderMap::new(),
            br#"{"id":"PollCount","type":"counter","delta":1}"#,
        );
        assert_eq!(payload.to_string(), "counter PollCount");
        assert_eq!(inspect("/update/", &HeaderMap::new(), b""), Payload::Empty);
        assert_eq!(
            inspect("/updates/", &HeaderMap::new(), b"{oops"),
            Payload::Unparsed { bytes: 5 }
        );
    }
}
