// HTTP surface: `/stops` and `/health`.

use actix_web::http::Method;
use actix_web::http::header::{ALLOW, ContentType};
use actix_web::error::{InternalError, QueryPayloadError};
use actix_web::{Error, HttpRequest, HttpResponse, middleware, web};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::models::StopId;
use crate::reconcile::Reconciler;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StopsQuery {
    stopid: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ErrorBody {
    fn new(error: &str) -> Self {
        ErrorBody {
            error: error.to_string(),
            message: None,
        }
    }

    fn with_message(error: &str, message: String) -> Self {
        ErrorBody {
            error: error.to_string(),
            message: Some(message),
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_stops(state: web::Data<AppState>, query: web::Query<StopsQuery>) -> HttpResponse {
    let raw = match query.stopid.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => {
            warn!("Stop request without stopid");
            return HttpResponse::BadRequest().json(ErrorBody::new("stopid parameter is required"));
        }
    };

    let stop_id = match StopId::parse(raw) {
        Ok(stop_id) => stop_id,
        Err(e) => {
            warn!(error = %e, "Rejected stop request");
            return HttpResponse::BadRequest().json(ErrorBody::new("invalid stopid parameter"));
        }
    };

    let reconciled = state.reconciler.reconcile(&stop_id).await;

    match serde_json::to_string(&reconciled.timetable) {
        Ok(body) => {
            info!(
                stop_id = %stop_id,
                source = ?reconciled.source,
                trips = reconciled.timetable.trips().len(),
                "Stop data served"
            );
            HttpResponse::Ok().content_type(ContentType::json()).body(body)
        }
        Err(e) => {
            error!(stop_id = %stop_id, error = %e, "Failed to encode stop data");
            HttpResponse::InternalServerError()
                .json(ErrorBody::with_message("Failed to fetch stop data", e.to_string()))
        }
    }
}

async fn preflight() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed()
        .insert_header((ALLOW, "GET, OPTIONS"))
        .json(ErrorBody::new("Method not allowed"))
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "ORR bus arrivals",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

// ============================================================================
// Routing
// ============================================================================

/// Malformed query strings (e.g. a repeated `stopid`) get the JSON error body.
fn query_error(err: QueryPayloadError, _req: &HttpRequest) -> Error {
    warn!(error = %err, "Unreadable stop query");
    let response = HttpResponse::BadRequest().json(ErrorBody::with_message("invalid query string", err.to_string()));
    InternalError::from_response(err, response).into()
}

/// CORS and no-cache headers carried by every `/stops` response.
fn transport_headers() -> middleware::DefaultHeaders {
    middleware::DefaultHeaders::new()
        .add(("Access-Control-Allow-Origin", "*"))
        .add(("Access-Control-Allow-Methods", "GET, OPTIONS"))
        .add(("Access-Control-Allow-Headers", "Content-Type"))
        .add(("Cache-Control", "no-cache, no-store, must-revalidate"))
        .add(("Pragma", "no-cache"))
        .add(("Expires", "0"))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check)).service(
        web::resource("/stops")
            .app_data(web::QueryConfig::default().error_handler(query_error))
            .route(web::get().to(get_stops))
            .route(web::method(Method::OPTIONS).to(preflight))
            .default_service(web::to(method_not_allowed))
            .wrap(transport_headers()),
    );
}
