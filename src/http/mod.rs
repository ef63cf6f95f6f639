//! REST + NDJSON streaming endpoints; auth middleware (C12 — HttpFacade).

pub mod routes;
pub mod stream;

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::AppError;
use crate::AppContext;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

/// Permissive-localhost CORS only — this daemon is not meant to be exposed
/// beyond the machine it runs on.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin([
            "http://localhost:3000".parse::<HeaderValue>().unwrap(),
            "http://127.0.0.1:3000".parse::<HeaderValue>().unwrap(),
        ])
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_credentials(true)
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/version", get(routes::version))
        .route("/api/auth/status", get(routes::auth_status))
        .route("/api/auth/login", post(routes::auth_login))
        .route("/api/auth/logout", post(routes::auth_logout))
        .route("/api/auth/change-password", post(routes::auth_change_password))
        .route("/api/openclaw/overview", get(routes::overview))
        .route("/api/agents", get(routes::list_agents).post(routes::create_agent))
        .route("/api/agents/:id", get(routes::get_agent).delete(routes::delete_agent))
        .route("/api/sessions", get(routes::list_sessions))
        .route("/api/sessions/remove", post(routes::remove_session))
        .route("/api/sessions/rename", post(routes::rename_session))
        .route("/api/sessions/history", get(routes::session_history))
        .route("/api/sessions/message", post(routes::send_message))
        .route("/api/sessions/message/stream", post(stream::message_stream))
        .route("/api/tasks", get(routes::list_tasks).post(routes::create_task))
        .route("/api/tasks/:id/status", post(routes::update_task_status))
        .route("/api/tasks/:id/blocker", post(routes::add_blocker))
        .route("/api/tasks/:id/artifact", post(routes::add_artifact))
        .route("/api/tasks/:id/worklog", post(routes::add_worklog))
        .route("/api/tasks/delete", post(routes::delete_tasks))
        .route("/api/skills", get(routes::list_skills))
        .route("/api/settings", get(routes::get_settings).post(routes::update_settings))
        .route("/api/logs/stream", get(stream::logs_stream))
        .layer(cors_layer())
        .with_state(ctx)
}

/// `401` with `code: "AUTH_REQUIRED"` — applied by handlers that need a
/// session when `settings.authentication.enabled` is true. Not a global
/// axum middleware layer because a couple of routes (`auth/status`,
/// `auth/login`) must stay reachable even when the gate is on; each
/// handler calls this helper explicitly via `require_session`.
pub async fn require_session(
    ctx: &AppContext,
    jar: &axum_extra::extract::CookieJar,
) -> Result<Option<String>, AppError> {
    let settings = ctx.settings.get().await;
    if !settings.authentication.enabled {
        return Ok(None);
    }
    let Some(cookie) = jar.get(crate::auth::SESSION_COOKIE_NAME) else {
        return Err(AppError::Authorization("AUTH_REQUIRED".to_string()));
    };
    match ctx.auth_gate.verify(cookie.value()) {
        Some(username) => Ok(Some(username)),
        None => Err(AppError::Authorization("AUTH_REQUIRED".to_string())),
    }
}
