//! Request handlers for every REST endpoint in §6 except the two NDJSON
//! streaming routes (see `http::stream`).

use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::Json;
use axum_extra::extract::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::authz::AuthzResolver;
use crate::agents::{Agent, AgentIdentity, AgentTraits, AgentType};
use crate::error::AppError;
use crate::http::require_session;
use crate::tasks::{Task, TaskDraft, TaskStatus};
use crate::AppContext;

type Ctx = State<Arc<AppContext>>;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

// ---- auth -----------------------------------------------------------------

#[derive(Serialize)]
pub struct AuthStatusResponse {
    enabled: bool,
    authenticated: bool,
    username: Option<String>,
}

pub async fn auth_status(State(ctx): Ctx, jar: CookieJar) -> Json<AuthStatusResponse> {
    let settings = ctx.settings.get().await;
    let authenticated = require_session(&ctx, &jar).await.ok().flatten();
    Json(AuthStatusResponse {
        enabled: settings.authentication.enabled,
        authenticated: authenticated.is_some() || !settings.authentication.enabled,
        username: authenticated,
    })
}

#[derive(Deserialize)]
pub struct LoginRequest {
    username: String,
    password: String,
}

pub async fn auth_login(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<LoginRequest>,
) -> Result<(CookieJar, Json<Value>), AppError> {
    let settings = ctx.settings.get().await;
    if !settings.authentication.enabled {
        return Ok((jar, Json(json!({ "authenticated": true }))));
    }
    let username_matches = settings
        .authentication
        .username
        .as_deref()
        .map(|expected| expected == body.username)
        .unwrap_or(false);
    if !username_matches || !settings.authentication.verify_password(&body.password) {
        return Err(AppError::Authorization("invalid username or password".to_string()));
    }
    let cookie = ctx.auth_gate.issue_cookie(&body.username);
    let jar = jar.add(cookie);
    Ok((jar, Json(json!({ "authenticated": true }))))
}

pub async fn auth_logout(State(ctx): Ctx, jar: CookieJar) -> (CookieJar, Json<Value>) {
    let jar = jar.add(ctx.auth_gate.logout_cookie());
    (jar, Json(json!({ "authenticated": false })))
}

#[derive(Deserialize)]
pub struct ChangePasswordRequest {
    current_password: Option<String>,
    new_password: String,
}

pub async fn auth_change_password(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    let settings = ctx.settings.get().await;
    if settings.authentication.has_password() {
        let ok = body
            .current_password
            .as_deref()
            .map(|p| settings.authentication.verify_password(p))
            .unwrap_or(false);
        if !ok {
            return Err(AppError::Authorization("current password is incorrect".to_string()));
        }
    }
    crate::auth::validate_password_policy(&body.new_password)
        .map_err(AppError::Validation)?;
    ctx.settings
        .update(|s| {
            let _ = s.authentication.set_password(&body.new_password);
        })
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "changed": true })))
}

// ---- overview ---------------------------------------------------------------

pub async fn overview(State(ctx): Ctx, jar: CookieJar) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    let agents = ctx.agents.list_agents().await.map_err(AppError::Internal)?;
    let tasks = ctx.tasks.list_tasks().await.map_err(AppError::Internal)?;
    let open_tasks = tasks.iter().filter(|t| t.status != TaskStatus::Done).count();
    Ok(Json(json!({
        "agentCount": agents.len(),
        "taskCount": tasks.len(),
        "openTaskCount": open_tasks,
    })))
}

// ---- agents -----------------------------------------------------------------

#[derive(Serialize)]
pub struct AgentResponse {
    id: String,
    display_name: String,
    #[serde(rename = "type")]
    agent_type: AgentType,
    reports_to: Option<String>,
    role: Option<String>,
    provider_id: String,
}

impl From<Agent> for AgentResponse {
    fn from(a: Agent) -> Self {
        Self {
            id: a.id,
            display_name: a.display_name,
            agent_type: a.agent_type,
            reports_to: a.reports_to,
            role: a.role,
            provider_id: a.provider_id,
        }
    }
}

pub async fn list_agents(State(ctx): Ctx, jar: CookieJar) -> Result<Json<Vec<AgentResponse>>, AppError> {
    require_session(&ctx, &jar).await?;
    let agents = ctx.agents.list_agents().await.map_err(AppError::Internal)?;
    Ok(Json(agents.into_iter().map(AgentResponse::from).collect()))
}

pub async fn get_agent(
    State(ctx): Ctx,
    jar: CookieJar,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<AgentResponse>, AppError> {
    require_session(&ctx, &jar).await?;
    let agent = ctx
        .agents
        .get_agent(&id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("agent not found: {id}")))?;
    Ok(Json(agent.into()))
}

#[derive(Deserialize)]
pub struct CreateAgentRequest {
    id: String,
    display_name: String,
    #[serde(rename = "type")]
    agent_type: AgentType,
    reports_to: Option<String>,
    role: Option<String>,
    provider_id: Option<String>,
}

pub async fn create_agent(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<CreateAgentRequest>,
) -> Result<Json<AgentResponse>, AppError> {
    require_session(&ctx, &jar).await?;
    let identity = AgentIdentity {
        id: body.id,
        display_name: body.display_name,
        agent_type: body.agent_type,
        reports_to: body.reports_to,
        role: body.role,
        provider_id: body.provider_id,
    };
    let agent = ctx
        .agents
        .ensure_agent(identity, AgentTraits::default())
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;
    Ok(Json(agent.into()))
}

#[derive(Deserialize, Default)]
pub struct DeleteAgentQuery {
    #[serde(default)]
    force: bool,
}

pub async fn delete_agent(
    State(ctx): Ctx,
    jar: CookieJar,
    AxumPath(id): AxumPath<String>,
    Query(query): Query<DeleteAgentQuery>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    ctx.agents
        .delete_agent(&id, query.force)
        .await
        .map_err(|e| AppError::Conflict(e.to_string()))?;
    Ok(Json(json!({ "deleted": true })))
}

// ---- sessions ---------------------------------------------------------------

#[derive(Deserialize)]
pub struct SessionListQuery {
    agent_id: Option<String>,
}

pub async fn list_sessions(
    State(ctx): Ctx,
    jar: CookieJar,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    let sessions = ctx
        .sessions
        .list(query.agent_id.as_deref())
        .await
        .map_err(AppError::Internal)?;
    let body: Vec<Value> = sessions
        .into_iter()
        .map(|s| {
            json!({
                "sessionKey": s.session_key,
                "sessionId": s.session_id,
                "agentId": s.agent_id,
                "title": s.title,
                "projectPath": s.project_path,
                "kind": s.kind,
                "providerId": s.provider_id,
                "inputChars": s.input_chars,
                "outputChars": s.output_chars,
                "totalChars": s.total_chars,
                "compactionCount": s.compaction_count,
                "updatedAt": s.updated_at,
            })
        })
        .collect();
    Ok(Json(json!({ "sessions": body })))
}

#[derive(Deserialize)]
pub struct SessionKeyRequest {
    session_key: String,
}

pub async fn remove_session(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<SessionKeyRequest>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    ctx.sessions
        .remove(&body.session_key)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "removed": true })))
}

#[derive(Deserialize)]
pub struct RenameSessionRequest {
    session_key: String,
    name: String,
}

pub async fn rename_session(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<RenameSessionRequest>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    ctx.sessions
        .rename(&body.session_key, &body.name)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(json!({ "renamed": true })))
}

#[derive(Deserialize)]
pub struct SessionHistoryQuery {
    agent_id: String,
    session_key: String,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    200
}

pub async fn session_history(
    State(ctx): Ctx,
    jar: CookieJar,
    Query(query): Query<SessionHistoryQuery>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    let meta = ctx
        .sessions
        .metadata(&query.session_key)
        .await
        .map_err(AppError::Internal)?;
    match meta {
        Some(meta) if meta.agent_id == query.agent_id => {}
        _ => {
            return Err(AppError::NotFound(format!(
                "session not found for agent {}: {}",
                query.agent_id, query.session_key
            )))
        }
    }
    let entries = ctx
        .sessions
        .history(&query.session_key, query.limit)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "entries": entries })))
}

#[derive(Deserialize)]
pub struct SendMessageRequest {
    agent_id: String,
    session_ref: String,
    project_path: Option<std::path::PathBuf>,
    message: String,
}

/// Non-streaming invocation entry point: blocks until the terminal event and
/// returns it as a plain JSON response.
pub async fn send_message(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<SendMessageRequest>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    let request = crate::executor::InvocationRequest {
        agent_id: body.agent_id,
        session_ref: body.session_ref,
        project_path: body.project_path,
        message: body.message,
        images: Vec::new(),
        env: Default::default(),
    };
    let subscription = ctx.executor.invoke(request);
    match subscription.await_result().await {
        Some(event) => Ok(Json(serde_json::to_value(event).map_err(|e| AppError::Internal(e.into()))?)),
        None => Err(AppError::Internal(anyhow::anyhow!("invocation stream closed without a result"))),
    }
}

// ---- tasks ------------------------------------------------------------------

async fn authz_for(ctx: &AppContext) -> Result<AuthzResolver, AppError> {
    let agents = ctx.agents.list_agents().await.map_err(AppError::Internal)?;
    Ok(AuthzResolver::from_agents(&agents))
}

#[derive(Deserialize)]
pub struct ListTasksQuery {
    assigned_to: Option<String>,
    #[serde(default = "default_task_limit")]
    limit: i64,
}

fn default_task_limit() -> i64 {
    100
}

pub async fn list_tasks(
    State(ctx): Ctx,
    jar: CookieJar,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    require_session(&ctx, &jar).await?;
    let tasks = ctx
        .tasks
        .list_latest_tasks(query.assigned_to.as_deref(), query.limit)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(tasks))
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    actor_id: String,
    assigned_to: String,
    title: String,
    description: String,
    #[serde(default)]
    status: Option<String>,
    status_reason: Option<String>,
    project: Option<String>,
}

pub async fn create_task(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<CreateTaskRequest>,
) -> Result<Json<Task>, AppError> {
    require_session(&ctx, &jar).await?;
    let status = body
        .status
        .as_deref()
        .and_then(TaskStatus::parse)
        .unwrap_or(TaskStatus::Todo);
    let draft = TaskDraft {
        assigned_to: body.assigned_to,
        title: body.title,
        description: body.description,
        status,
        status_reason: body.status_reason,
        project: body.project,
    };
    let authz = authz_for(&ctx).await?;
    let task = ctx
        .tasks
        .create_task(&body.actor_id, draft, &authz)
        .await?;
    Ok(Json(task))
}

#[derive(Deserialize)]
pub struct UpdateTaskStatusRequest {
    actor_id: String,
    status: String,
    status_reason: Option<String>,
}

pub async fn update_task_status(
    State(ctx): Ctx,
    jar: CookieJar,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<UpdateTaskStatusRequest>,
) -> Result<Json<Task>, AppError> {
    require_session(&ctx, &jar).await?;
    let status = TaskStatus::parse(&body.status)
        .ok_or_else(|| AppError::Validation(format!("unknown status: {}", body.status)))?;
    let authz = authz_for(&ctx).await?;
    let task = ctx
        .tasks
        .update_task_status(&body.actor_id, &id, status, body.status_reason, &authz)
        .await?;
    Ok(Json(task))
}

#[derive(Deserialize)]
pub struct SideTableRequest {
    actor_id: String,
    content: String,
}

pub async fn add_blocker(
    State(ctx): Ctx,
    jar: CookieJar,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SideTableRequest>,
) -> Result<Json<Task>, AppError> {
    require_session(&ctx, &jar).await?;
    let authz = authz_for(&ctx).await?;
    let task = ctx
        .tasks
        .add_blocker(&body.actor_id, &id, &body.content, &authz)
        .await?;
    Ok(Json(task))
}

pub async fn add_artifact(
    State(ctx): Ctx,
    jar: CookieJar,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SideTableRequest>,
) -> Result<Json<Task>, AppError> {
    require_session(&ctx, &jar).await?;
    let authz = authz_for(&ctx).await?;
    let task = ctx
        .tasks
        .add_artifact(&body.actor_id, &id, &body.content, &authz)
        .await?;
    Ok(Json(task))
}

pub async fn add_worklog(
    State(ctx): Ctx,
    jar: CookieJar,
    AxumPath(id): AxumPath<String>,
    Json(body): Json<SideTableRequest>,
) -> Result<Json<Task>, AppError> {
    require_session(&ctx, &jar).await?;
    let authz = authz_for(&ctx).await?;
    let task = ctx
        .tasks
        .add_worklog(&body.actor_id, &id, &body.content, &authz)
        .await?;
    Ok(Json(task))
}

#[derive(Deserialize)]
pub struct DeleteTasksRequest {
    actor_id: String,
    task_ids: Vec<String>,
}

pub async fn delete_tasks(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<DeleteTasksRequest>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;
    let authz = authz_for(&ctx).await?;
    let (deleted, count) = ctx
        .tasks
        .delete_tasks(&body.actor_id, body.task_ids, &authz)
        .await
        .map_err(AppError::Internal)?;
    Ok(Json(json!({ "deleted": deleted, "count": count })))
}

// ---- skills -------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListSkillsQuery {
    agent_id: Option<String>,
    #[serde(default)]
    global: bool,
}

/// `global=true` lists the shared skills catalog at `skillsDir`; otherwise
/// `agentId` is required and lists that agent's own workspace skills.
pub async fn list_skills(
    State(ctx): Ctx,
    jar: CookieJar,
    Query(query): Query<ListSkillsQuery>,
) -> Result<Json<Value>, AppError> {
    require_session(&ctx, &jar).await?;

    let dir = if query.global {
        ctx.layout.skills_dir()
    } else {
        let agent_id = query.agent_id.as_deref().ok_or_else(|| {
            AppError::Validation("either agentId or global=true is required".to_string())
        })?;
        let agent = ctx
            .agents
            .get_agent(agent_id)
            .await
            .map_err(AppError::Internal)?
            .ok_or_else(|| AppError::NotFound(format!("agent not found: {agent_id}")))?;
        agent.workspace_dir.join("skills")
    };

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Json(json!({ "skills": Vec::<String>::new() })));
        }
        Err(e) => return Err(AppError::Internal(e.into())),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(|e| AppError::Internal(e.into()))? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(Json(json!({ "skills": names })))
}

// ---- settings -----------------------------------------------------------------

#[derive(Serialize)]
pub struct PublicSettings {
    task_cron_enabled: bool,
    notify_managers_of_inactive_agents: bool,
    max_inactivity_minutes: u32,
    inactive_agent_notification_target: crate::settings::InactiveAgentNotificationTarget,
    authentication_enabled: bool,
    authentication_username: Option<String>,
    has_password: bool,
}

pub async fn get_settings(State(ctx): Ctx, jar: CookieJar) -> Result<Json<PublicSettings>, AppError> {
    require_session(&ctx, &jar).await?;
    let settings = ctx.settings.get().await;
    Ok(Json(PublicSettings {
        task_cron_enabled: settings.task_cron_enabled,
        notify_managers_of_inactive_agents: settings.notify_managers_of_inactive_agents,
        max_inactivity_minutes: settings.max_inactivity_minutes,
        inactive_agent_notification_target: settings.inactive_agent_notification_target,
        authentication_enabled: settings.authentication.enabled,
        authentication_username: settings.authentication.username.clone(),
        has_password: settings.authentication.has_password(),
    }))
}

#[derive(Deserialize)]
pub struct UpdateSettingsRequest {
    task_cron_enabled: Option<bool>,
    notify_managers_of_inactive_agents: Option<bool>,
    max_inactivity_minutes: Option<u32>,
    inactive_agent_notification_target: Option<crate::settings::InactiveAgentNotificationTarget>,
    authentication_enabled: Option<bool>,
    authentication_username: Option<String>,
    /// Required to change `authentication_enabled`/`authentication_username`
    /// while protection is already on (§4.13).
    current_password: Option<String>,
}

pub async fn update_settings(
    State(ctx): Ctx,
    jar: CookieJar,
    Json(body): Json<UpdateSettingsRequest>,
) -> Result<Json<PublicSettings>, AppError> {
    require_session(&ctx, &jar).await?;

    let current = ctx.settings.get().await;
    let changes_protected_fields =
        body.authentication_enabled.is_some() || body.authentication_username.is_some();
    if current.authentication.enabled && changes_protected_fields {
        let ok = body
            .current_password
            .as_deref()
            .is_some_and(|p| current.authentication.verify_password(p));
        if !ok {
            return Err(AppError::Authorization(
                "current_password is required and must match to change authentication settings"
                    .to_string(),
            ));
        }
    }

    let updated = ctx
        .settings
        .update(|s| {
            if let Some(v) = body.task_cron_enabled {
                s.task_cron_enabled = v;
            }
            if let Some(v) = body.notify_managers_of_inactive_agents {
                s.notify_managers_of_inactive_agents = v;
            }
            if let Some(v) = body.max_inactivity_minutes {
                s.max_inactivity_minutes = v;
            }
            if let Some(v) = body.inactive_agent_notification_target {
                s.inactive_agent_notification_target = v;
            }
            if let Some(v) = body.authentication_enabled {
                s.authentication.enabled = v;
            }
            if let Some(v) = body.authentication_username {
                s.authentication.username = Some(v);
            }
        })
        .await
        .map_err(|e| AppError::Validation(e.to_string()))?;

    // The scheduler watches this channel so a toggle here takes effect on the
    // next tick without a restart (§4.9).
    let _ = ctx.cron_enabled_tx.send(updated.task_cron_enabled);

    Ok(Json(PublicSettings {
        task_cron_enabled: updated.task_cron_enabled,
        notify_managers_of_inactive_agents: updated.notify_managers_of_inactive_agents,
        max_inactivity_minutes: updated.max_inactivity_minutes,
        inactive_agent_notification_target: updated.inactive_agent_notification_target,
        authentication_enabled: updated.authentication.enabled,
        authentication_username: updated.authentication.username.clone(),
        has_password: updated.authentication.has_password(),
    }))
}
