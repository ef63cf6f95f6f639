//! NDJSON streaming endpoints: `POST /api/sessions/message/stream` and
//! `GET /api/logs/stream` (§6).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use futures_util::stream;
use serde::Deserialize;
use tokio::io::AsyncBufReadExt;

use crate::error::AppError;
use crate::executor::InvocationRequest;
use crate::http::require_session;
use crate::AppContext;

type Ctx = State<Arc<AppContext>>;

fn ndjson_response(body: Body) -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .expect("static headers always build")
}

#[derive(Deserialize)]
pub struct StreamMessageRequest {
    agent_id: String,
    session_ref: String,
    project_path: Option<std::path::PathBuf>,
    message: String,
}

/// Streams every progress/result/error event for one invocation as NDJSON,
/// one JSON object per line, in arrival order (already back-pressured by
/// `StreamSubscription` — see `stream.rs`).
pub async fn message_stream(
    State(ctx): Ctx,
    jar: CookieJar,
    axum::Json(body): axum::Json<StreamMessageRequest>,
) -> Result<Response, AppError> {
    require_session(&ctx, &jar).await?;

    let request = InvocationRequest {
        agent_id: body.agent_id,
        session_ref: body.session_ref,
        project_path: body.project_path,
        message: body.message,
        images: Vec::new(),
        env: Default::default(),
    };
    let subscription = ctx.executor.invoke(request);

    let event_stream = stream::unfold(subscription, |mut sub| async move {
        let event = sub.next().await?;
        let mut line = serde_json::to_string(&event).ok()?;
        line.push('\n');
        Some((Ok::<_, std::io::Error>(line), sub))
    });

    Ok(ndjson_response(Body::from_stream(event_stream)))
}

/// Tails the daemon's own log file as NDJSON lines, following appends the
/// way `tail -f` does. Only the lines already on disk at the time of
/// connection plus whatever is appended afterward are sent — there is no
/// historical replay beyond that.
///
/// `tracing_appender::rolling::daily` names files `<prefix>.<YYYY-MM-DD>`, so
/// there is no fixed `daemon.log` path to open directly — the current day's
/// file is whichever one in `logs_dir()` sorts last by name.
pub async fn logs_stream(State(ctx): Ctx, jar: CookieJar) -> Result<Response, AppError> {
    require_session(&ctx, &jar).await?;
    let path = latest_log_file(&ctx.layout.logs_dir())
        .await
        .ok_or_else(|| AppError::NotFound("no log file found — was --log-file set?".to_string()))?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| AppError::NotFound(format!("log file not available: {e}")))?;
    let reader = tokio::io::BufReader::new(file);

    let log_stream = stream::unfold(reader, |mut reader| async move {
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    continue;
                }
                Ok(_) => return Some((Ok::<_, std::io::Error>(line), reader)),
                Err(e) => return Some((Err(e), reader)),
            }
        }
    });

    Ok(ndjson_response(Body::from_stream(log_stream)))
}

/// Picks the most recently rolled log file in `dir`. `rolling::daily` writes
/// `<prefix>.<YYYY-MM-DD>`, so lexicographic order over entries named
/// `daemon.log*` is also date order — the last one is today's.
async fn latest_log_file(dir: &std::path::Path) -> Option<std::path::PathBuf> {
    let mut read_dir = tokio::fs::read_dir(dir).await.ok()?;
    let mut candidates = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with("daemon.log") {
            candidates.push(entry.path());
        }
    }
    candidates.sort();
    candidates.pop()
}
