use crate::models::echo::{ ErrorPayload, TextPayload };
use crate::report::Analyst;
use axum::{
    extract::State,
    http::{ HeaderMap, StatusCode },
    response::{ IntoResponse, Response },
    routing::post,
    Json,
    Router,
};
use governor::{ clock::DefaultClock, state::{ InMemoryState, NotKeyed }, Quota, RateLimiter };
use lazy_static::lazy_static;
use log::{ error, info, warn };
use std::num::NonZeroU32;
use std::sync::Arc;
use tower_http::cors::{ Any, CorsLayer };

lazy_static! {
    static ref REPORT_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock> = RateLimiter::direct(
        Quota::per_second(NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN))
    );
}

#[derive(Clone, Default)]
pub struct AppState {
    pub analyst: Option<Arc<Analyst>>,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(analyst: Option<Arc<Analyst>>, api_key: Option<String>) -> Self {
        Self { analyst, api_key: api_key.filter(|k| !k.trim().is_empty()) }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/echo", post(echo_handler))
        .route("/report", post(report_handler))
        .layer(cors)
        .with_state(state)
}

async fn echo_handler(Json(req): Json<TextPayload>) -> Json<TextPayload> {
    info!("{}", req.text);
    Json(req)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorPayload::new(message))).into_response()
}

async fn report_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TextPayload>
) -> Response {
    if let Some(required) = &state.api_key {
        let provided = headers.get("X-API-Key").and_then(|v| v.to_str().ok());
        if provided != Some(required.as_str()) {
            warn!("Rejected /report request with missing or invalid API key");
            return error_response(StatusCode::UNAUTHORIZED, "Invalid API key");
        }
    }

    if REPORT_LIMITER.check().is_err() {
        warn!("Report rate limit exceeded");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
    }

    let Some(analyst) = state.analyst.clone() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Report pipeline is not configured");
    };

    info!("Report requested: {}", req.text);
    match analyst.call_system(&req.text).await {
        Ok(report) => Json(TextPayload::new(report)).into_response(),
        Err(e) => {
            error!("Report pipeline failed: {}", e);
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}
