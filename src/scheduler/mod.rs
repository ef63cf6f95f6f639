//! Cron loop: todo/blocked/doing-timeout/inactivity sweeps (C9 —
//! TaskScheduler).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agents::authz::AuthzResolver;
use crate::agents::AgentManifestStore;
use crate::executor::{InvocationExecutor, InvocationRequest};
use crate::session::SessionStore;
use crate::settings::{InactiveAgentNotificationTarget, SettingsStore};
use crate::tasks::{TaskStatus, TaskStore};

const TICK: Duration = Duration::from_secs(60);

pub struct TaskScheduler {
    settings: Arc<SettingsStore>,
    tasks: Arc<TaskStore>,
    agents: Arc<AgentManifestStore>,
    sessions: Arc<SessionStore>,
    executor: Arc<InvocationExecutor>,
    /// Flipped by `SettingsStore::update` so `POST /api/settings` toggling
    /// `taskCronEnabled` takes effect on the next tick without a restart.
    enabled_rx: watch::Receiver<bool>,
}

impl TaskScheduler {
    pub fn new(
        settings: Arc<SettingsStore>,
        tasks: Arc<TaskStore>,
        agents: Arc<AgentManifestStore>,
        sessions: Arc<SessionStore>,
        executor: Arc<InvocationExecutor>,
        enabled_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            tasks,
            agents,
            sessions,
            executor,
            enabled_rx,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            loop {
                interval.tick().await;
                if let Err(e) = self.tick().await {
                    tracing::error!(err = %e, "scheduler tick failed");
                }
            }
        })
    }

    async fn tick(&self) -> Result<()> {
        if !*self.enabled_rx.borrow() {
            return Ok(());
        }
        let settings = self.settings.get().await;
        if !settings.task_cron_enabled {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + TICK;

        if tokio::time::Instant::now() < deadline {
            if let Err(e) = self.sweep_todo().await {
                tracing::warn!(err = %e, "todo sweep failed");
            }
        }
        if tokio::time::Instant::now() < deadline {
            if let Err(e) = self.sweep_blocked().await {
                tracing::warn!(err = %e, "blocked sweep failed");
            }
        }
        if tokio::time::Instant::now() < deadline {
            if let Err(e) = self.sweep_doing_timeout().await {
                tracing::warn!(err = %e, "doing-timeout sweep failed");
            }
        }
        if tokio::time::Instant::now() < deadline {
            if let Err(e) = self.sweep_inactivity(&settings).await {
                tracing::warn!(err = %e, "inactivity sweep failed");
            }
        }
        Ok(())
    }

    /// Nudges the assignee of every task still `todo` and older than one
    /// tick window, then resets its timeout so it isn't nudged again next
    /// tick for the same staleness.
    async fn sweep_todo(&self) -> Result<()> {
        let cutoff_minutes = 1;
        for task in self.tasks.list_tasks().await? {
            if task.status != TaskStatus::Todo {
                continue;
            }
            let age_ms = chrono::Utc::now().timestamp_millis() - task.status_updated_at;
            if age_ms < (cutoff_minutes * 60_000) {
                continue;
            }
            self.nudge(&task.assigned_to, &format!("Status check on task {}", task.task_id))
                .await;
            self.tasks.reset_task_status_timeout(&task.task_id).await?;
        }
        Ok(())
    }

    async fn sweep_blocked(&self) -> Result<()> {
        for task in self.tasks.list_tasks().await? {
            if task.status != TaskStatus::Blocked {
                continue;
            }
            let reason = task.status_reason.clone().unwrap_or_default();
            self.nudge(
                &task.owner,
                &format!("Task {} is blocked: {reason}", task.task_id),
            )
            .await;
            self.tasks.reset_task_status_timeout(&task.task_id).await?;
        }
        Ok(())
    }

    async fn sweep_doing_timeout(&self) -> Result<()> {
        const DOING_TIMEOUT_MINUTES: i64 = 30;
        let stale = self
            .tasks
            .list_doing_task_ids_older_than(DOING_TIMEOUT_MINUTES)
            .await?;
        for task_id in stale {
            if let Some(task) = self.tasks.get_task(&task_id).await? {
                self.nudge(
                    &task.assigned_to,
                    &format!("Task {} has been doing for a while — still on it?", task.task_id),
                )
                .await;
            }
            self.tasks.reset_task_status_timeout(&task_id).await?;
        }
        Ok(())
    }

    /// For each agent whose most recent `assistant` transcript entry is
    /// older than `maxInactivityMinutes`, notifies that agent's manager (or
    /// the CEO only, when the agent reports directly to the CEO and the
    /// target is `ceo-only`).
    async fn sweep_inactivity(&self, settings: &crate::settings::Settings) -> Result<()> {
        if !settings.notify_managers_of_inactive_agents {
            return Ok(());
        }
        let agents = self.agents.list_agents().await?;
        let resolver = AuthzResolver::from_agents(&agents);
        let _ = resolver; // reserved for future cross-tree notification checks

        let threshold_ms = settings.max_inactivity_minutes as i64 * 60_000;
        let now = chrono::Utc::now().timestamp_millis();

        for agent in &agents {
            let Some(manager_id) = &agent.reports_to else {
                continue;
            };
            let session_key = format!("ui-agent:{}", agent.id);
            let Some(last_activity) = self.sessions.last_assistant_activity(&session_key).await?
            else {
                continue;
            };
            if now - last_activity < threshold_ms {
                continue;
            }

            let reports_directly_to_ceo = manager_id == crate::agents::CEO_ID;
            let target = match settings.inactive_agent_notification_target {
                InactiveAgentNotificationTarget::AllManagers => Some(manager_id.clone()),
                InactiveAgentNotificationTarget::CeoOnly if reports_directly_to_ceo => {
                    Some(crate::agents::CEO_ID.to_string())
                }
                InactiveAgentNotificationTarget::CeoOnly => None,
            };

            if let Some(target) = target {
                self.nudge(
                    &target,
                    &format!("Agent {} has been inactive for a while.", agent.id),
                )
                .await;
            }
        }
        Ok(())
    }

    async fn nudge(&self, agent_id: &str, message: &str) {
        let request = InvocationRequest {
            agent_id: agent_id.to_string(),
            session_ref: format!("ui-agent:{agent_id}"),
            project_path: None,
            message: message.to_string(),
            images: Vec::new(),
            env: Default::default(),
        };
        // Reuses the normal executor path, so scheduler-driven invocations
        // participate in the same per-session mutex discipline as any
        // caller-initiated one (§4.9).
        let mut subscription = self.executor.invoke(request);
        tokio::spawn(async move { while subscription.next().await.is_some() {} });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentIdentity, AgentTraits, AgentType};
    use crate::config::DaemonConfig;
    use crate::paths::PathLayout;
    use crate::providers::adapter::ProviderAdapter;
    use crate::providers::{Provider, ProviderCapabilities, ProviderKind, ProviderRegistry};
    use crate::session::{Role, TranscriptEntry};
    use crate::settings::Settings;
    use crate::stream::StreamBroker;

    /// Builds a scheduler whose executor talks to a no-op `true`-equivalent
    /// provider (`/bin/sh` with a script that exits 0 immediately), so
    /// sweeps can run `nudge` without needing a real provider binary.
    async fn harness(home: &std::path::Path) -> (Arc<TaskScheduler>, Arc<TaskStore>, Arc<AgentManifestStore>, Arc<SessionStore>, Arc<SettingsStore>)
    {
        let layout = PathLayout::new(home.to_path_buf());
        let config = Arc::new(DaemonConfig::new(
            Some(0),
            Some(home.to_path_buf()),
            Some("error".to_string()),
        ));
        let agents = Arc::new(AgentManifestStore::new(layout.clone()));
        let sessions = Arc::new(SessionStore::new(layout.clone()));
        let tasks = Arc::new(TaskStore::open(&layout.boards_sqlite_path()).await.unwrap());
        let settings = Arc::new(SettingsStore::open(layout.home()).await.unwrap());

        let script = home.join("noop-cli");
        tokio::fs::write(&script, "#!/bin/sh\ncat >/dev/null\necho ok\n")
            .await
            .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&script).await.unwrap().permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&script, perms).await.unwrap();
        }

        let mut registry = ProviderRegistry::new();
        registry.register(Provider {
            id: crate::providers::DEFAULT_PROVIDER_ID.to_string(),
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
            adapter: Arc::new(ProviderAdapter::new(script.to_str().unwrap(), "")),
        });
        let broker = Arc::new(StreamBroker::new());
        let executor = Arc::new(InvocationExecutor::new(
            config,
            agents.clone(),
            sessions.clone(),
            Arc::new(registry),
            broker,
        ));

        let (_tx, rx) = watch::channel(true);
        let scheduler = Arc::new(TaskScheduler::new(
            settings.clone(),
            tasks.clone(),
            agents.clone(),
            sessions.clone(),
            executor,
            rx,
        ));
        (scheduler, tasks, agents, sessions, settings)
    }

    async fn ensure(agents: &AgentManifestStore, id: &str, reports_to: Option<&str>) {
        agents
            .ensure_agent(
                AgentIdentity {
                    id: id.to_string(),
                    display_name: id.to_string(),
                    agent_type: AgentType::Individual,
                    reports_to: reports_to.map(|s| s.to_string()),
                    role: None,
                    provider_id: None,
                },
                AgentTraits::default(),
            )
            .await
            .unwrap();
    }

    /// Spec §8 scenario 5: an agent reporting only indirectly to the CEO
    /// produces no notification under `ceo-only`; making it a direct report
    /// flips that to exactly one notification addressed to the CEO.
    #[tokio::test]
    async fn inactivity_sweep_ceo_only_respects_direct_vs_indirect_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _tasks, agents, sessions, _settings) = harness(dir.path()).await;

        ensure(&agents, "ceo", None).await;
        ensure(&agents, "cto", Some("ceo")).await;
        ensure(&agents, "eng", Some("cto")).await;

        let stale_timestamp = chrono::Utc::now().timestamp_millis() - 45 * 60_000;
        sessions
            .append(
                "ui-agent:eng",
                "eng",
                "openclaw",
                TranscriptEntry::Message {
                    role: Role::Assistant,
                    content: "last reply".to_string(),
                    timestamp: stale_timestamp,
                },
            )
            .await
            .unwrap();

        let mut settings = Settings::default();
        settings.notify_managers_of_inactive_agents = true;
        settings.max_inactivity_minutes = 30;
        settings.inactive_agent_notification_target =
            crate::settings::InactiveAgentNotificationTarget::CeoOnly;

        // eng reports to cto, not directly to ceo: no notification yet.
        scheduler.sweep_inactivity(&settings).await.unwrap();
        let ceo_history_before = sessions.history("ui-agent:ceo", 10).await.unwrap();
        assert!(
            ceo_history_before.is_empty(),
            "indirect report must not notify ceo-only target"
        );

        // Re-parent eng directly under ceo: now exactly one notification.
        // `ensureAgent` is idempotent over an existing config, so reparenting
        // goes through delete-then-recreate rather than a second `ensure`.
        agents.delete_agent("eng", true).await.unwrap();
        ensure(&agents, "eng", Some("ceo")).await;
        scheduler.sweep_inactivity(&settings).await.unwrap();

        // The nudge's write-back runs on a detached task; poll briefly
        // rather than sleeping a fixed guess.
        let ceo_history_after = wait_for_history_len(&sessions, "ui-agent:ceo", 2).await;
        assert_eq!(
            ceo_history_after.len(),
            2,
            "expected exactly one nudge (user msg + assistant reply) addressed to ceo"
        );
    }

    /// Polls session history until it reaches `want` entries or a 2s budget
    /// runs out, to avoid a flaky fixed sleep after a fire-and-forget nudge.
    async fn wait_for_history_len(
        sessions: &SessionStore,
        session_key: &str,
        want: usize,
    ) -> Vec<TranscriptEntry> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let history = sessions.history(session_key, 10).await.unwrap();
            if history.len() >= want || tokio::time::Instant::now() >= deadline {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn inactivity_sweep_skips_agents_without_a_manager() {
        let dir = tempfile::tempdir().unwrap();
        let (scheduler, _tasks, agents, sessions, _settings) = harness(dir.path()).await;
        ensure(&agents, "ceo", None).await;

        sessions
            .append(
                "ui-agent:ceo",
                "ceo",
                "openclaw",
                TranscriptEntry::Message {
                    role: Role::Assistant,
                    content: "reply".to_string(),
                    timestamp: chrono::Utc::now().timestamp_millis() - 90 * 60_000,
                },
            )
            .await
            .unwrap();

        let mut settings = Settings::default();
        settings.notify_managers_of_inactive_agents = true;
        settings.max_inactivity_minutes = 30;

        // The CEO has no manager — must not panic or notify anyone.
        scheduler.sweep_inactivity(&settings).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // History grew by nothing beyond the seeded message (no self-nudge).
        let history = sessions.history("ui-agent:ceo", 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
