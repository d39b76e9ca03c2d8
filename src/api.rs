use std::convert::Infallible;
use std::time::Duration;

use actix_web::dev::Payload;
use actix_web::http::header;
use actix_web::web::{self, Bytes};
use actix_web::{FromRequest, HttpRequest, HttpResponse};
use futures_util::future::LocalBoxFuture;
use futures_util::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use uuid::Uuid;

use crate::error::AppError;
use crate::events::Event;
use crate::models::{ListDlqQuery, ListJobsQuery, SubmitJobRequest, Tenant};
use crate::state::AppState;

const SSE_KEEPALIVE: Duration = Duration::from_secs(15);

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/jobs", web::post().to(submit_job))
            .route("/jobs", web::get().to(list_jobs))
            // Literal segments must be registered before the id route.
            .route("/jobs/dlq", web::get().to(list_dlq))
            .route("/jobs/metrics/summary", web::get().to(metrics_summary))
            .route("/jobs/{id}", web::get().to(get_job))
            .route("/events", web::get().to(stream_events)),
    )
    .route("/health", web::get().to(health));
}

/// Malformed request bodies surface as VALIDATION_ERROR rather than the
/// framework default.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| AppError::Validation(err.to_string()).into())
}

/// Same shape for malformed query strings.
pub fn query_config() -> web::QueryConfig {
    web::QueryConfig::default()
        .error_handler(|err, _req| AppError::Validation(err.to_string()).into())
}

/// The tenant resolved from the `Authorization: Bearer <api_key>` header.
pub struct AuthedTenant(pub Tenant);

fn bearer_token(header: Option<&str>) -> Option<&str> {
    let token = header?.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

impl FromRequest for AuthedTenant {
    type Error = AppError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let header = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        Box::pin(async move {
            let state =
                state.ok_or_else(|| AppError::Internal("application state missing".into()))?;
            let token = bearer_token(header.as_deref()).ok_or(AppError::Unauthorized)?;
            let tenant = state
                .store
                .find_tenant_by_api_key(token)
                .await?
                .ok_or(AppError::Unauthorized)?;
            Ok(AuthedTenant(tenant))
        })
    }
}

// POST /api/v1/jobs
async fn submit_job(
    state: web::Data<AppState>,
    tenant: AuthedTenant,
    request: web::Json<SubmitJobRequest>,
) -> Result<HttpResponse, AppError> {
    let outcome = state.service.submit(&tenant.0, request.into_inner()).await?;
    if outcome.created {
        Ok(HttpResponse::Created().json(outcome.job))
    } else {
        Ok(HttpResponse::Ok().json(outcome.job))
    }
}

// GET /api/v1/jobs/{id}
async fn get_job(
    state: web::Data<AppState>,
    tenant: AuthedTenant,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let job = state.service.get_job(&tenant.0, path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(job))
}

// GET /api/v1/jobs
async fn list_jobs(
    state: web::Data<AppState>,
    tenant: AuthedTenant,
    query: web::Query<ListJobsQuery>,
) -> Result<HttpResponse, AppError> {
    let page = state.service.list_jobs(&tenant.0, query.into_inner()).await?;
    Ok(HttpResponse::Ok().json(page))
}

// GET /api/v1/jobs/dlq
async fn list_dlq(
    state: web::Data<AppState>,
    tenant: AuthedTenant,
    query: web::Query<ListDlqQuery>,
) -> Result<HttpResponse, AppError> {
    let page = state.service.list_dlq(&tenant.0, query.into_inner()).await?;
    Ok(HttpResponse::Ok().json(page))
}

// GET /api/v1/jobs/metrics/summary
async fn metrics_summary(
    state: web::Data<AppState>,
    tenant: AuthedTenant,
) -> Result<HttpResponse, AppError> {
    let summary = state.service.metrics(&tenant.0).await?;
    Ok(HttpResponse::Ok().json(summary))
}

// GET /health
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "ok"}))
}

fn sse_frame(event: &Event) -> Bytes {
    match serde_json::to_string(event) {
        Ok(data) => Bytes::from(format!("data: {data}\n\n")),
        // Serialization of Event cannot realistically fail; drop the frame
        // rather than tearing the stream down.
        Err(_) => Bytes::from_static(b": serialization error\n\n"),
    }
}

// GET /api/v1/events
//
// Fan-out only: a long-lived SSE stream pumping this tenant's lifecycle
// events outward. Dropping the connection drops the subscription; a
// subscriber that falls behind silently loses the lagged interval.
async fn stream_events(state: web::Data<AppState>, tenant: AuthedTenant) -> HttpResponse {
    let tenant_id = tenant.0.id;

    let events = BroadcastStream::new(state.events.subscribe()).filter_map(move |item| {
        let frame = match item {
            Ok(event) if event.tenant_id == tenant_id => Some(sse_frame(&event)),
            _ => None,
        };
        async move { frame.map(Ok::<_, Infallible>) }
    });

    // Comment frames keep idle connections alive through proxies.
    let keepalive = IntervalStream::new(tokio::time::interval(SSE_KEEPALIVE))
        .map(|_| Ok::<_, Infallible>(Bytes::from_static(b": keep-alive\n\n")));

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(futures_util::stream::select(events, keepalive))
}
