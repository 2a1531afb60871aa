mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{
    build_test_context, build_test_context_with, request_json, request_no_body, send, signed,
    unsigned, TestOptions, TEST_KEY,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::Write;
use tally_common::sign::Signer;
use tally_common::types::{Metric, MetricKind, MetricRecord};

fn to_json(records: &[MetricRecord]) -> Value {
    serde_json::to_value(records).expect("records should serialize")
}

#[tokio::test]
async fn positional_updates_merge_and_read_back() {
    let ctx = build_test_context().expect("context should build");

    for delta in ["5", "7"] {
        let uri = format!("/update/counter/PollCount/{delta}");
        let resp = request_no_body(&ctx.app, "POST", &uri, &[]).await;
        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body["err_code"], 0);
    }
    let resp = request_no_body(&ctx.app, "POST", "/update/gauge/Alloc/1.5", &[]).await;
    assert_eq!(resp.body["data"]["value"], "1.5");
    request_no_body(&ctx.app, "POST", "/update/gauge/Alloc/-3.25", &[]).await;

    let counter = request_no_body(&ctx.app, "GET", "/value/counter/PollCount", &[]).await;
    assert_eq!(counter.status, StatusCode::OK);
    assert_eq!(counter.text, "12");

    let gauge = request_no_body(&ctx.app, "GET", "/value/gauge/Alloc", &[]).await;
    assert_eq!(gauge.text, "-3.25");

    let table = request_no_body(&ctx.app, "GET", "/", &[]).await;
    assert_eq!(table.status, StatusCode::OK);
    assert_eq!(table.body, json!({"gauge": {"Alloc": -3.25}, "counter": {"PollCount": 12}}));
}

#[tokio::test]
async fn positional_error_statuses() {
    let ctx = build_test_context().expect("context should build");

    let unknown = request_no_body(&ctx.app, "POST", "/update/histogram/X/1", &[]).await;
    assert_eq!(unknown.status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(unknown.body["err_code"], 1011);

    let bad_counter = request_no_body(&ctx.app, "POST", "/update/counter/X/1.5", &[]).await;
    assert_eq!(bad_counter.status, StatusCode::BAD_REQUEST);
    let bad_gauge = request_no_body(&ctx.app, "POST", "/update/gauge/X/abc", &[]).await;
    assert_eq!(bad_gauge.status, StatusCode::BAD_REQUEST);

    let missing = request_no_body(&ctx.app, "GET", "/value/gauge/X", &[]).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    let unknown_read = request_no_body(&ctx.app, "GET", "/value/histogram/X", &[]).await;
    assert_eq!(unknown_read.status, StatusCode::NOT_FOUND);
    let msg = unknown_read.body["err_msg"].as_str().unwrap_or_default();
    assert!(msg.contains("histogram"), "{msg}");
    assert!(!msg.contains("gauge"), "{msg}");

    let table = request_no_body(&ctx.app, "GET", "/", &[]).await;
    assert_eq!(table.body, json!({"gauge": {}, "counter": {}}));
}

#[tokio::test]
async fn name_keeps_its_first_kind() {
    let ctx = build_test_context().expect("context should build");
    request_no_body(&ctx.app, "POST", "/update/gauge/Shared/1", &[]).await;

    let resp = request_no_body(&ctx.app, "POST", "/update/counter/Shared/1", &[]).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let counter = request_no_body(&ctx.app, "GET", "/value/counter/Shared", &[]).await;
    assert_eq!(counter.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn structured_update_echoes_hash() {
    let ctx = build_test_context_with(TestOptions {
        sign_key: Some(TEST_KEY),
        ..Default::default()
    })
    .expect("context should build");

    let record = signed(Metric::gauge("Alloc", 42.0));
    let resp = request_json(
        &ctx.app,
        "POST",
        "/update/",
        &[],
        serde_json::to_value(&record).expect("record should serialize"),
    )
    .await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["data"]["hash"], json!(record.hash));

    let value = request_no_body(&ctx.app, "GET", "/value/gauge/Alloc", &[]).await;
    assert_eq!(value.text, "42");
}

#[tokio::test]
async fn unsigned_or_forged_updates_are_rejected_when_key_set() {
    let ctx = build_test_context_with(TestOptions {
        sign_key: Some(TEST_KEY),
        ..Default::default()
    })
    .expect("context should build");

    let missing = request_json(
        &ctx.app,
        "POST",
        "/update/",
        &[],
        serde_json::to_value(unsigned(Metric::counter("PollCount", 1))).expect("serialize"),
    )
    .await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing.body["err_code"], 1012);

    let mut forged = signed(Metric::counter("PollCount", 1));
    forged.delta = Some(1000);
    let resp = request_json(
        &ctx.app,
        "POST",
        "/update/",
        &[],
        serde_json::to_value(&forged).expect("serialize"),
    )
    .await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);

    let positional = request_no_body(&ctx.app, "POST", "/update/counter/PollCount/1", &[]).await;
    assert_eq!(positional.status, StatusCode::BAD_REQUEST);

    let tag = Signer::new(TEST_KEY.as_bytes())
        .expect("key")
        .sign(&Metric::counter("PollCount", 1));
    let ok = request_no_body(
        &ctx.app,
        "POST",
        "/update/counter/PollCount/1",
        &[("X-Metric-Hash", tag.as_str())],
    )
    .await;
    assert_eq!(ok.status, StatusCode::OK);

    let value = request_no_body(&ctx.app, "GET", "/value/counter/PollCount", &[]).await;
    assert_eq!(value.text, "1");
}

#[tokio::test]
async fn malformed_bodies_are_bad_requests() {
    let ctx = build_test_context().expect("context should build");

    let req = Request::builder()
        .method("POST")
        .uri("/update/")
        .header("Content-Type", "application/json")
        .body(Body::from("{not json"))
        .expect("request should build");
    assert_eq!(send(&ctx.app, req).await.status, StatusCode::BAD_REQUEST);

    let unknown_type = request_json(
        &ctx.app,
        "POST",
        "/update/",
        &[],
        json!({"id": "X", "type": "histogram", "value": 1.0}),
    )
    .await;
    assert_eq!(unknown_type.status, StatusCode::BAD_REQUEST);

    let no_delta = request_json(
        &ctx.app,
        "POST",
        "/update/",
        &[],
        json!({"id": "PollCount", "type": "counter", "value": 1.0}),
    )
    .await;
    assert_eq!(no_delta.status, StatusCode::BAD_REQUEST);

    let no_name = request_json(
        &ctx.app,
        "POST",
        "/update/",
        &[],
        json!({"type": "gauge", "value": 1.0}),
    )
    .await;
    assert_eq!(no_name.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let ctx = build_test_context().expect("context should build");

    let mut body = to_json(&[
        unsigned(Metric::gauge("Alloc", 1.0)),
        unsigned(Metric::counter("PollCount", 2)),
    ]);
    body.as_array_mut()
        .expect("array")
        .push(json!({"id": "Broken", "type": "gauge"}));

    let resp = request_json(&ctx.app, "POST", "/updates/", &[], body).await;
    assert_eq!(resp.status, StatusCode::BAD_REQUEST);
    assert!(resp.body["err_msg"]
        .as_str()
        .expect("message")
        .contains("record 2"));

    let table = request_no_body(&ctx.app, "GET", "/", &[]).await;
    assert_eq!(table.body, json!({"gauge": {}, "counter": {}}));

    let ok = request_json(
        &ctx.app,
        "POST",
        "/updates/",
        &[],
        to_json(&[
            unsigned(Metric::gauge("Alloc", 1.0)),
            unsigned(Metric::counter("PollCount", 2)),
            unsigned(Metric::counter("PollCount", 3)),
        ]),
    )
    .await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.body["data"]["applied"], 3);

    let value = request_no_body(&ctx.app, "GET", "/value/counter/PollCount", &[]).await;
    assert_eq!(value.text, "5");
}

#[tokio::test]
async fn replayed_batch_id_is_acknowledged_once() {
    let ctx = build_test_context().expect("context should build");
    let body = to_json(&[unsigned(Metric::counter("PollCount", 4))]);
    let headers = [("X-Batch-Id", "0123456789abcdef")];

    let first = request_json(&ctx.app, "POST", "/updates/", &headers, body.clone()).await;
    assert_eq!(first.body["data"], json!({"applied": 1, "duplicate": false}));
    let replay = request_json(&ctx.app, "POST", "/updates/", &headers, body).await;
    assert_eq!(replay.status, StatusCode::OK);
    assert_eq!(replay.body["data"], json!({"applied": 0, "duplicate": true}));

    let value = request_no_body(&ctx.app, "GET", "/value/counter/PollCount", &[]).await;
    assert_eq!(value.text, "4");
}

#[tokio::test]
async fn gzip_batch_body_is_accepted() {
    let ctx = build_test_context().expect("context should build");
    let body = to_json(&[unsigned(Metric::gauge("Sys", 8.0))]).to_string();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body.as_bytes()).expect("gzip write");
    let compressed = encoder.finish().expect("gzip finish");

    let req = Request::builder()
        .method("POST")
        .uri("/updates/")
        .header("Content-Type", "application/json")
        .header("Content-Encoding", "gzip")
        .body(Body::from(compressed))
        .expect("request should build");
    let resp = send(&ctx.app, req).await;
    assert_eq!(resp.status, StatusCode::OK);

    let value = request_no_body(&ctx.app, "GET", "/value/gauge/Sys", &[]).await;
    assert_eq!(value.text, "8");
}

#[tokio::test]
async fn structured_read_signs_stored_value() {
    let ctx = build_test_context_with(TestOptions {
        sign_key: Some(TEST_KEY),
        ..Default::default()
    })
    .expect("context should build");

    for delta in [3, 4] {
        request_json(
            &ctx.app,
            "POST",
            "/update/",
            &[],
            serde_json::to_value(signed(Metric::counter("PollCount", delta))).expect("serialize"),
        )
        .await;
    }

    let resp = request_json(
        &ctx.app,
        "POST",
        "/value/",
        &[],
        json!({"id": "PollCount", "type": "counter"}),
    )
    .await;
    assert_eq!(resp.status, StatusCode::OK);
    let record: MetricRecord = serde_json::from_value(resp.body).expect("record should parse");
    assert_eq!(record.kind, MetricKind::Counter);
    assert_eq!(record.delta, Some(7));
    Signer::new(TEST_KEY.as_bytes())
        .expect("key")
        .verify(&record.to_metric().expect("metric"), record.tag())
        .expect("hash should cover the stored total");

    let missing = request_json(
        &ctx.app,
        "POST",
        "/value/",
        &[],
        json!({"id": "Nope", "type": "gauge"}),
    )
    .await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn ping_reports_backend() {
    let memory = build_test_context().expect("context should build");
    let resp = request_no_body(&memory.app, "GET", "/ping", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["data"]["backend"], "memory");

    let durable = build_test_context_with(TestOptions {
        durable: true,
        ..Default::default()
    })
    .expect("context should build");
    let resp = request_no_body(&durable.app, "GET", "/ping", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);
    assert_eq!(resp.body["data"]["backend"], "sqlite");
}

#[tokio::test]
async fn durable_backend_serves_the_same_routes() {
    let ctx = build_test_context_with(TestOptions {
        durable: true,
        ..Default::default()
    })
    .expect("context should build");

    request_no_body(&ctx.app, "POST", "/update/counter/PollCount/2", &[]).await;
    request_json(
        &ctx.app,
        "POST",
        "/updates/",
        &[],
        to_json(&[unsigned(Metric::counter("PollCount", 3))]),
    )
    .await;
    let value = request_no_body(&ctx.app, "GET", "/value/counter/PollCount", &[]).await;
    assert_eq!(value.text, "5");
}

#[tokio::test]
async fn trace_id_header_matches_envelope() {
    let ctx = build_test_context().expect("context should build");
    let resp = request_no_body(&ctx.app, "GET", "/value/gauge/Missing", &[]).await;
    let trace_id = resp.trace_id.expect("trace id header");
    assert_eq!(trace_id.len(), 16);
    assert_eq!(resp.body["trace_id"], trace_id);
}

#[tokio::test]
async fn oversized_body_is_rejected_with_trace_id() {
    let ctx = build_test_context().expect("context should build");
    let huge = vec![b' '; 3 * 1024 * 1024];
    let req = Request::builder()
        .method("POST")
        .uri("/updates/")
        .header("Content-Type", "application/json")
        .body(Body::from(huge))
        .expect("request should build");

    let resp = send(&ctx.app, req).await;
    assert_eq!(resp.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(resp.body["err_code"], 1001);
    assert_eq!(resp.body["trace_id"], resp.trace_id.expect("trace id header"));
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let ctx = build_test_context().expect("context should build");
    let resp = request_no_body(&ctx.app, "GET", "/openapi.json", &[]).await;
    assert_eq!(resp.status, StatusCode::OK);

    let paths = resp.body["paths"].as_object().expect("paths object");
    for path in [
        "/",
        "/ping",
        "/update/{kind}/{name}/{value}",
        "/update/",
        "/updates/",
        "/value/{kind}/{name}",
        "/value/",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
}
