use crate::state::AppState;
use crate::{api, logging, middleware as mw, openapi};
use axum::http::HeaderValue;
use axum::middleware;
use axum::Router;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::decompression::RequestDecompressionLayer;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "tally API",
        description = "Metric collection endpoints of the tally server",
    ),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Metrics", description = "Metric updates and reads")
    )
)]
struct ApiDoc;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed))
    }
}

/// Builds the HTTP surface. Request path, outermost first: logging, CORS,
/// trusted-subnet check, gzip request decompression, body decryption, then
/// the handlers; responses are gzip-compressed on the way out.
pub fn build_http_app(state: AppState) -> Router {
    let (metric_router, metric_spec) = api::metric_routes().split_for_parts();

    let mut merged_spec = ApiDoc::openapi();
    merged_spec.merge(metric_spec);
    let spec = Arc::new(merged_spec);

    let cors = cors_layer(&state.config.cors_allowed_origins);

    metric_router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            mw::decrypt_body_middleware,
        ))
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            mw::trusted_subnet_middleware,
        ))
        .with_state(state)
        .merge(openapi::json_route(spec))
        .layer(cors)
        .layer(middleware::from_fn(logging::request_logging))
}
