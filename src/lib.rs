//! OpenGoat agent execution core — library root.
//!
//! Wires every component (C1–C13) into one `AppContext` that the HTTP
//! facade and the scheduler share, the way the teacher's `lib.rs` wires its
//! own `AppContext` for `ipc::run` and its background jobs.

pub mod agents;
pub mod auth;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod executor;
pub mod http;
pub mod paths;
pub mod providers;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod stream;
pub mod tasks;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;

use agents::AgentManifestStore;
use auth::AuthGate;
use config::DaemonConfig;
use executor::InvocationExecutor;
use paths::PathLayout;
use providers::adapter::ProviderAdapter;
use providers::{Provider, ProviderCapabilities, ProviderKind, ProviderRegistry};
use scheduler::TaskScheduler;
use session::SessionStore;
use settings::SettingsStore;
use stream::StreamBroker;
use tasks::storage::TaskStore;

/// Shared, `Arc`-wrapped application state handed to every HTTP handler and
/// to the scheduler. Built once in `main` at startup.
pub struct AppContext {
    pub config: Arc<DaemonConfig>,
    pub layout: PathLayout,
    pub settings: Arc<SettingsStore>,
    pub auth_gate: Arc<AuthGate>,
    pub agents: Arc<AgentManifestStore>,
    pub sessions: Arc<SessionStore>,
    pub tasks: Arc<TaskStore>,
    pub providers: Arc<ProviderRegistry>,
    pub executor: Arc<InvocationExecutor>,
    pub broker: Arc<StreamBroker>,
    /// Flips live when `POST /api/settings` changes `taskCronEnabled`; the
    /// scheduler's `enabled_rx` half is handed to `TaskScheduler::new`.
    pub cron_enabled_tx: watch::Sender<bool>,
    pub started_at: std::time::Instant,
}

/// Builds the full `AppContext` plus a handle to the spawned scheduler task.
/// Split out of `main` so tests can build a context against a temp home
/// without going through CLI argument parsing.
pub async fn build_context(config: DaemonConfig) -> Result<(Arc<AppContext>, Arc<TaskScheduler>)> {
    let config = Arc::new(config);
    let layout = PathLayout::new(config.home.clone());

    tokio::fs::create_dir_all(layout.home())
        .await
        .with_context(|| format!("failed to create home directory {}", layout.home().display()))?;

    let settings = Arc::new(SettingsStore::open(layout.home()).await?);
    let auth_gate = Arc::new(AuthGate::open(layout.home()).await?);
    let agents = Arc::new(AgentManifestStore::new(layout.clone()));
    let sessions = Arc::new(SessionStore::new(layout.clone()));
    let tasks = Arc::new(TaskStore::open(&layout.boards_sqlite_path()).await?);

    let providers = Arc::new(build_provider_registry(&config));

    let broker = Arc::new(StreamBroker::new());
    let executor = Arc::new(InvocationExecutor::new(
        config.clone(),
        agents.clone(),
        sessions.clone(),
        providers.clone(),
        broker.clone(),
    ));

    let current = settings.get().await;
    let (cron_enabled_tx, cron_enabled_rx) = watch::channel(current.task_cron_enabled);

    let scheduler = Arc::new(TaskScheduler::new(
        settings.clone(),
        tasks.clone(),
        agents.clone(),
        sessions.clone(),
        executor.clone(),
        cron_enabled_rx,
    ));

    let ctx = Arc::new(AppContext {
        config,
        layout,
        settings,
        auth_gate,
        agents,
        sessions,
        tasks,
        providers,
        executor,
        broker,
        cron_enabled_tx,
        started_at: std::time::Instant::now(),
    });

    Ok((ctx, scheduler))
}

/// One provider at startup: the CLI provider (spawns `OPENCLAW_CMD`). The
/// gateway fallback is reached directly by `InvocationExecutor` through
/// `GatewayClient` when this provider's command is absent, not through a
/// second registry entry.
fn build_provider_registry(config: &DaemonConfig) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    let adapter = Arc::new(ProviderAdapter::new(
        &config.openclaw_cmd,
        &config.openclaw_arguments,
    ));
    registry.register(Provider {
        id: providers::DEFAULT_PROVIDER_ID.to_string(),
        kind: ProviderKind::Cli,
        capabilities: ProviderCapabilities {
            agent: true,
            model: true,
            auth: true,
            passthrough: true,
            reportees: true,
            agent_create: true,
            agent_delete: true,
        },
        adapter,
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_context_scaffolds_home_and_registers_default_provider() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::new(Some(0), Some(dir.path().to_path_buf()), Some("error".to_string()));
        let (ctx, _scheduler) = build_context(config).await.unwrap();
        assert!(ctx.providers.default_provider().is_some());
        assert!(ctx.layout.home().exists());
    }
}
