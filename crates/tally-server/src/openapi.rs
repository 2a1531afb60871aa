use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use utoipa::openapi::OpenApi;

pub const OPENAPI_PATH: &str = "/openapi.json";

pub fn json_route(spec: Arc<OpenApi>) -> Router {
    Router::new().route(
        OPENAPI_PATH,
        get(move || {
            let spec = spec.clone();
            async move { openapi_json(spec).await }
        }),
    )
}

async fn openapi_json(spec: Arc<OpenApi>) -> impl IntoResponse {
    match spec.to_json() {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize OpenAPI document: {e}"),
        )
            .into_response(),
    }
}
