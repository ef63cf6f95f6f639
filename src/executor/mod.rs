//! Per-agent/per-session invocation execution (C7 — InvocationExecutor).
//!
//! The hardest part of the system: serialises concurrent invocations per
//! `(agentId, sessionKey)`, assembles provider context, drives the
//! `queued -> ... -> result|error` state machine, and implements the three
//! retry/fallback policies from §4.7.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock};

use crate::agents::AgentManifestStore;
use crate::cancellation::CancellationToken;
use crate::config::DaemonConfig;
use crate::error::ProviderError;
use crate::paths::PathLayout;
use crate::providers::adapter::{ImageAttachment, InvokeOptions};
use crate::providers::gateway::GatewayClient;
use crate::providers::ProviderRegistry;
use crate::session::{Role, SessionStore, TranscriptEntry};
use crate::stream::{InvocationResult, Phase, StreamBroker, StreamSubscription};

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub agent_id: String,
    pub session_ref: String,
    pub project_path: Option<PathBuf>,
    pub message: String,
    pub images: Vec<ImageAttachment>,
    pub env: HashMap<String, String>,
}

type SessionMutexMap = RwLock<HashMap<(String, String), Arc<Mutex<()>>>>;

pub struct InvocationExecutor {
    config: Arc<DaemonConfig>,
    agents: Arc<AgentManifestStore>,
    sessions: Arc<SessionStore>,
    registry: Arc<ProviderRegistry>,
    broker: Arc<StreamBroker>,
    locks: SessionMutexMap,
}

impl InvocationExecutor {
    pub fn new(
        config: Arc<DaemonConfig>,
        agents: Arc<AgentManifestStore>,
        sessions: Arc<SessionStore>,
        registry: Arc<ProviderRegistry>,
        broker: Arc<StreamBroker>,
    ) -> Self {
        Self {
            config,
            agents,
            sessions,
            registry,
            broker,
            locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, agent_id: &str, session_key: &str) -> Arc<Mutex<()>> {
        let key = (agent_id.to_string(), session_key.to_string());
        if let Some(lock) = self.locks.read().await.get(&key) {
            return lock.clone();
        }
        let mut guard = self.locks.write().await;
        guard
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Starts an invocation and returns a subscription to its event stream
    /// immediately; the invocation itself runs on a spawned task so the
    /// caller (an HTTP handler framing NDJSON) can start forwarding events
    /// as soon as they appear.
    pub fn invoke(self: &Arc<Self>, request: InvocationRequest) -> StreamSubscription {
        let (producer, subscription) = self.broker.open();
        let executor = self.clone();
        tokio::spawn(async move {
            producer.emit_progress(Phase::Queued, "queued");
            let lock = executor.lock_for(&request.agent_id, &request.session_ref).await;
            let _guard = lock.lock().await;

            producer.emit_progress(Phase::RunStarted, "run started");

            match executor.run_with_retries(&request, &producer).await {
                Ok(invoke_result) => {
                    producer.emit_progress(
                        Phase::ProviderInvocationCompleted,
                        "provider invocation completed",
                    );
                    if let Err(e) = executor.write_back_history(&request, &invoke_result).await {
                        tracing::error!(err = %e, "failed to write invocation history");
                    }
                    producer.emit_progress(Phase::RunCompleted, "run completed");
                    let output = invoke_result.stdout.clone();
                    producer.emit_result(
                        &request.agent_id,
                        &request.session_ref,
                        output,
                        InvocationResult {
                            code: invoke_result.code,
                            stdout: invoke_result.stdout,
                            stderr: invoke_result.stderr,
                        },
                        None,
                    );
                }
                Err(e) => {
                    producer.emit_error(e.to_string());
                }
            }
        });
        subscription
    }

    /// Implements the three retry/fallback policies in §4.7, plus the
    /// "any other non-zero result is terminal, no retry" default.
    async fn run_with_retries(
        &self,
        request: &InvocationRequest,
        producer: &crate::stream::StreamProducer,
    ) -> Result<crate::providers::adapter::InvokeResult> {
        let agent = self
            .agents
            .get_agent(&request.agent_id)
            .await?
            .with_context(|| format!("agent not found: {}", request.agent_id))?;
        let provider = self
            .registry
            .get(&agent.provider_id)
            .or_else(|| self.registry.default_provider())
            .with_context(|| format!("no provider registered for {}", agent.provider_id))?;

        let options = self
            .assemble_context(request, &agent, provider, producer.cancellation())
            .await?;

        producer.emit_progress(
            Phase::ProviderInvocationStarted,
            "provider invocation started",
        );

        let on_output = |producer: &crate::stream::StreamProducer| {
            move |is_stderr: bool, line: &str| {
                let phase = if is_stderr { Phase::Stderr } else { Phase::Stdout };
                producer.emit_progress(phase, line.to_string());
            }
        };

        let mut restarted_once = false;
        let mut retried_lock_once = false;

        loop {
            let attempt = provider
                .adapter
                .invoke(options.clone(), on_output(producer))
                .await;

            match attempt {
                Ok(result) => return Ok(result),
                Err(ProviderError::UvCwdFailure(_)) if !restarted_once => {
                    restarted_once = true;
                    producer.emit_progress(Phase::Stderr, "restarting gateway");
                    GatewayClient::restart_via_cli(&self.config.openclaw_cmd, &self.config.home)
                        .await?;
                    continue;
                }
                Err(ProviderError::SessionLockContention { retry_after, .. })
                    if !retried_lock_once =>
                {
                    retried_lock_once = true;
                    if options.cancel.is_cancelled() {
                        return Err(ProviderError::Cancelled.into());
                    }
                    let capped = retry_after.min(Duration::from_secs(10));
                    let ticks = capped.as_secs().max(1);
                    for _ in 0..ticks {
                        producer.emit_progress(Phase::Heartbeat, "waiting on session lock");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            _ = options.cancel.cancelled() => {
                                return Err(ProviderError::Cancelled.into());
                            }
                        }
                    }
                    continue;
                }
                Err(ProviderError::CommandNotFound(_)) => {
                    if provider.capabilities.passthrough {
                        let gateway = GatewayClient::new(format!(
                            "ws://127.0.0.1:{}/gateway",
                            self.config.port
                        ));
                        let cwd = options.cwd.to_string_lossy().to_string();
                        let value = gateway
                            .agent(&request.agent_id, &request.message, &cwd)
                            .await?;
                        return Ok(crate::providers::adapter::InvokeResult {
                            code: 0,
                            stdout: value
                                .get("output")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            stderr: String::new(),
                            provider_session_id: value
                                .get("sessionId")
                                .and_then(|v| v.as_str())
                                .map(|s| s.to_string()),
                        });
                    }
                    anyhow::bail!("provider command not found and no gateway fallback declared");
                }
                Err(other) => anyhow::bail!(other),
            }
        }
    }

    /// Context assembly: bootstrap files concatenated up to
    /// `bootstrapMaxChars` with fair-share truncation across files, a
    /// `## Skills` section, and a `cwd` resolution. Only applies for
    /// CLI providers declaring `capabilities.agent`.
    async fn assemble_context(
        &self,
        request: &InvocationRequest,
        agent: &crate::agents::Agent,
        provider: &crate::providers::Provider,
        cancel: CancellationToken,
    ) -> Result<InvokeOptions> {
        let cwd = request
            .project_path
            .clone()
            .unwrap_or_else(|| agent.workspace_dir.clone());

        let system_prompt = if provider.capabilities.agent
            && provider.kind == crate::providers::ProviderKind::Cli
        {
            Some(self.build_system_prompt(agent).await?)
        } else {
            None
        };

        let mut env = HashMap::new();
        env.insert("OPENCLAW_CMD".to_string(), self.config.openclaw_cmd.clone());
        env.insert(
            "OPENCLAW_ARGUMENTS".to_string(),
            self.config.openclaw_arguments.clone(),
        );
        for (k, v) in self.load_provider_config_env(&provider.id).await? {
            env.insert(k, v);
        }
        for (k, v) in &request.env {
            env.insert(k.clone(), v.clone());
        }

        Ok(InvokeOptions {
            cwd,
            system_prompt,
            message: request.message.clone(),
            images: request.images.clone(),
            env,
            timeout: Duration::from_secs(self.config.provider_timeout_secs),
            cancel,
        })
    }

    /// Reads `providers/<id>/config.json` as a flat string map of env
    /// overrides — the middle layer between built-in defaults and the
    /// caller-supplied env (§4.6: `defaults < stored providerConfig < caller
    /// env`). Absent file means no overrides; present-but-malformed is a
    /// real config error and is not swallowed.
    async fn load_provider_config_env(&self, provider_id: &str) -> Result<HashMap<String, String>> {
        let path = PathLayout::new(&self.config.home).provider_config_path(provider_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("provider config at {} is not a valid string map", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).with_context(|| format!("failed to read provider config at {}", path.display())),
        }
    }

    async fn build_system_prompt(&self, agent: &crate::agents::Agent) -> Result<String> {
        let files = ["AGENTS.md", "SOUL.md", "IDENTITY.md", "BOOTSTRAP.md"];
        let mut contents = Vec::new();
        for name in files {
            let path = agent.workspace_dir.join(name);
            if let Ok(text) = tokio::fs::read_to_string(&path).await {
                contents.push((name, text));
            }
        }
        let budget = self.config.bootstrap_max_chars;
        let per_file_budget = if contents.is_empty() {
            0
        } else {
            budget / contents.len()
        };

        let mut prompt = String::new();
        for (name, text) in &contents {
            prompt.push_str("## ");
            prompt.push_str(name);
            prompt.push('\n');
            let truncated: String = text.chars().take(per_file_budget).collect();
            prompt.push_str(&truncated);
            prompt.push('\n');
        }

        let skills = self.skills_section(agent).await;
        prompt.push_str("## Skills\n");
        prompt.push_str(&skills);
        prompt.push('\n');

        Ok(prompt.chars().take(budget.max(per_file_budget)).collect())
    }

    /// Enumerates the agent's workspace `skills/` directory (the same
    /// source `list_skills` reads for a non-global lookup) and renders it as
    /// a bullet list for the injected `## Skills` section.
    async fn skills_section(&self, agent: &crate::agents::Agent) -> String {
        let dir = agent.workspace_dir.join("skills");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return "No skills catalog configured.".to_string(),
        };
        let mut names = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        if names.is_empty() {
            return "No skills catalog configured.".to_string();
        }
        names.sort();
        names.iter().map(|n| format!("- {n}")).collect::<Vec<_>>().join("\n")
    }

    async fn write_back_history(
        &self,
        request: &InvocationRequest,
        result: &crate::providers::adapter::InvokeResult,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.sessions
            .append(
                &request.session_ref,
                &request.agent_id,
                "openclaw",
                TranscriptEntry::Message {
                    role: Role::User,
                    content: request.message.clone(),
                    timestamp: now,
                },
            )
            .await?;
        self.sessions
            .append(
                &request.session_ref,
                &request.agent_id,
                "openclaw",
                TranscriptEntry::Message {
                    role: Role::Assistant,
                    content: result.stdout.clone(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentIdentity, AgentTraits, AgentType};
    use crate::paths::PathLayout;
    use crate::providers::{Provider, ProviderCapabilities, ProviderKind};
    use crate::stream::StreamEvent;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn bootstrap_budget_splits_evenly_across_present_files() {
        // Fair-share truncation: with a 400-char budget and 4 files present,
        // each file gets ~100 chars regardless of its own length.
        let budget = 400usize;
        let file_count = 4usize;
        assert_eq!(budget / file_count, 100);
    }

    /// Writes a tiny shell script standing in for the provider CLI and
    /// returns its path. `body` is the script's behaviour.
    async fn fake_provider_script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let script = format!("#!/bin/sh\ncat >/dev/null\n{body}\n");
        tokio::fs::write(&path, script).await.unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    async fn test_harness(
        home: &std::path::Path,
        provider_cmd: &str,
    ) -> (
        Arc<InvocationExecutor>,
        Arc<AgentManifestStore>,
        Arc<SessionStore>,
    ) {
        let layout = PathLayout::new(home.to_path_buf());
        let config = Arc::new(DaemonConfig::new(
            Some(0),
            Some(home.to_path_buf()),
            Some("error".to_string()),
        ));
        let agents = Arc::new(AgentManifestStore::new(layout.clone()));
        agents
            .ensure_agent(
                AgentIdentity {
                    id: "ceo".to_string(),
                    display_name: "CEO".to_string(),
                    agent_type: AgentType::Manager,
                    reports_to: None,
                    role: None,
                    provider_id: None,
                },
                AgentTraits::default(),
            )
            .await
            .unwrap();

        let sessions = Arc::new(SessionStore::new(layout.clone()));
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
            adapter: Arc::new(crate::providers::adapter::ProviderAdapter::new(
                provider_cmd,
                "",
            )),
        });
        let broker = Arc::new(StreamBroker::new());
        let executor = Arc::new(InvocationExecutor::new(
            config,
            agents.clone(),
            sessions.clone(),
            Arc::new(registry),
            broker,
        ));
        (executor, agents, sessions)
    }

    fn request(session_ref: &str, message: &str) -> InvocationRequest {
        InvocationRequest {
            agent_id: "ceo".to_string(),
            session_ref: session_ref.to_string(),
            project_path: None,
            message: message.to_string(),
            images: vec![],
            env: HashMap::new(),
        }
    }

    /// Drains a subscription and returns every event in producer order.
    async fn drain(mut sub: StreamSubscription) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = sub.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn successful_invocation_emits_state_machine_in_order_and_writes_back_history() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_provider_script(dir.path(), "fake-cli", "echo ok").await;
        let (executor, _agents, sessions) =
            test_harness(dir.path(), script.to_str().unwrap()).await;

        let events = drain(executor.invoke(request("project:demo", "hi"))).await;

        let phases: Vec<Phase> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Progress { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                Phase::Queued,
                Phase::RunStarted,
                Phase::ProviderInvocationStarted,
                Phase::Stdout,
                Phase::ProviderInvocationCompleted,
                Phase::RunCompleted,
            ]
        );
        // Exactly one terminal event, and it's last.
        assert!(matches!(events.last().unwrap(), StreamEvent::Result { .. }));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let history = sessions.history("project:demo", 10).await.unwrap();
        assert_eq!(history.len(), 2, "user + assistant entries written back");
    }

    #[tokio::test]
    async fn concurrent_invocations_on_same_session_are_serialised() {
        let dir = tempfile::tempdir().unwrap();
        // Sleeps briefly so overlap would be observable if the mutex didn't
        // serialise the two calls.
        let script = fake_provider_script(dir.path(), "fake-cli", "sleep 0.2 && echo ok").await;
        let (executor, _agents, sessions) =
            test_harness(dir.path(), script.to_str().unwrap()).await;

        let start = std::time::Instant::now();
        let first = executor.invoke(request("project:same", "one"));
        let second = executor.invoke(request("project:same", "two"));
        let (r1, r2) = tokio::join!(
            first.await_result(),
            second.await_result(),
        );
        assert!(r1.is_some());
        assert!(r2.is_some());
        // Two serialised 200ms calls take at least ~400ms; parallel would be ~200ms.
        assert!(start.elapsed() >= Duration::from_millis(380));

        let history = sessions.history("project:same", 10).await.unwrap();
        assert_eq!(history.len(), 4, "both invocations wrote their own pair of entries");
    }

    #[tokio::test]
    async fn invocations_on_different_sessions_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_provider_script(dir.path(), "fake-cli", "sleep 0.2 && echo ok").await;
        let (executor, _agents, _sessions) =
            test_harness(dir.path(), script.to_str().unwrap()).await;

        let start = std::time::Instant::now();
        let first = executor.invoke(request("project:a", "one"));
        let second = executor.invoke(request("project:b", "two"));
        let (r1, r2) = tokio::join!(first.await_result(), second.await_result());
        assert!(r1.is_some());
        assert!(r2.is_some());
        // Independent sessions should overlap — well under the serial 400ms.
        assert!(start.elapsed() < Duration::from_millis(380));
    }

    #[tokio::test]
    async fn nonzero_exit_without_known_stderr_pattern_is_terminal_result_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_provider_script(
            dir.path(),
            "fake-cli",
            "echo boom 1>&2 && exit 7",
        )
        .await;
        let (executor, _agents, _sessions) =
            test_harness(dir.path(), script.to_str().unwrap()).await;

        let event = executor
            .invoke(request("project:fail", "hi"))
            .await_result()
            .await
            .unwrap();
        match event {
            StreamEvent::Result { result, .. } => assert_eq!(result.code, 7),
            other => panic!("expected a result event with code=7, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_not_found_falls_back_to_gateway_and_is_terminal_error_when_gateway_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let (executor, _agents, _sessions) =
            test_harness(dir.path(), "opengoat-definitely-not-a-real-binary").await;

        // No gateway is listening on this port, so the fallback call itself
        // fails — but the important property is that CommandNotFound took
        // the passthrough branch (an `error`, not a silent hang) rather than
        // bailing immediately with "no gateway fallback declared".
        let event = executor
            .invoke(request("project:missing", "hi"))
            .await_result()
            .await
            .unwrap();
        match event {
            StreamEvent::Error { error, .. } => {
                assert!(
                    !error.contains("no gateway fallback declared"),
                    "should have attempted the gateway passthrough, got: {error}"
                );
            }
            other => panic!("expected a terminal error event, got {other:?}"),
        }
    }

    /// §5: dropping the subscription without draining it (the way axum drops
    /// a response body on client disconnect) must cancel the invocation —
    /// the provider subprocess gets killed rather than left to run to
    /// completion, and a cancelled invocation never writes back history.
    /// Uses `sleep` directly as the provider command (not the usual
    /// shell-script fixture) so the spawned child is unambiguously the
    /// process that gets signalled.
    #[tokio::test]
    async fn dropping_the_subscription_cancels_the_invocation_before_history_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PathLayout::new(dir.path().to_path_buf());
        let config = Arc::new(DaemonConfig::new(
            Some(0),
            Some(dir.path().to_path_buf()),
            Some("error".to_string()),
        ));
        let agents = Arc::new(AgentManifestStore::new(layout.clone()));
        agents
            .ensure_agent(
                AgentIdentity {
                    id: "ceo".to_string(),
                    display_name: "CEO".to_string(),
                    agent_type: AgentType::Manager,
                    reports_to: None,
                    role: None,
                    provider_id: None,
                },
                AgentTraits::default(),
            )
            .await
            .unwrap();
        let sessions = Arc::new(SessionStore::new(layout.clone()));
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
            adapter: Arc::new(crate::providers::adapter::ProviderAdapter::new("sleep", "2")),
        });
        let broker = Arc::new(StreamBroker::new());
        let executor = Arc::new(InvocationExecutor::new(
            config,
            agents.clone(),
            sessions.clone(),
            Arc::new(registry),
            broker,
        ));

        // Simulates an HTTP client disconnecting mid-stream: nobody drains
        // this subscription, it's just dropped.
        drop(executor.invoke(request("project:cancel-me", "hi")));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let history = sessions.history("project:cancel-me", 10).await.unwrap();
        assert!(
            history.is_empty(),
            "a cancelled invocation must not write back history"
        );
    }

    #[tokio::test]
    async fn skills_section_lists_workspace_skills_directory() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_provider_script(dir.path(), "fake-cli", "echo ok").await;
        let (executor, agents, _sessions) = test_harness(dir.path(), script.to_str().unwrap()).await;
        let agent = agents.get_agent("ceo").await.unwrap().unwrap();

        assert_eq!(
            executor.skills_section(&agent).await,
            "No skills catalog configured."
        );

        let skills_dir = agent.workspace_dir.join("skills");
        tokio::fs::create_dir_all(&skills_dir).await.unwrap();
        tokio::fs::write(skills_dir.join("code-review.md"), "...").await.unwrap();
        tokio::fs::write(skills_dir.join("deploy.md"), "...").await.unwrap();

        assert_eq!(
            executor.skills_section(&agent).await,
            "- code-review.md\n- deploy.md"
        );
    }

    #[tokio::test]
    async fn assemble_context_layers_stored_provider_config_between_defaults_and_caller_env() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_provider_script(dir.path(), "fake-cli", "echo ok").await;
        let (executor, agents, _sessions) = test_harness(dir.path(), script.to_str().unwrap()).await;
        let agent = agents.get_agent("ceo").await.unwrap().unwrap();

        let layout = PathLayout::new(dir.path().to_path_buf());
        let config_path = layout.provider_config_path(crate::providers::DEFAULT_PROVIDER_ID);
        tokio::fs::create_dir_all(config_path.parent().unwrap()).await.unwrap();
        tokio::fs::write(
            &config_path,
            serde_json::json!({
                "OPENCLAW_ARGUMENTS": "--from-stored-config",
                "CUSTOM_VAR": "stored",
            })
            .to_string(),
        )
        .await
        .unwrap();

        let provider = crate::providers::Provider {
            id: crate::providers::DEFAULT_PROVIDER_ID.to_string(),
            kind: ProviderKind::Cli,
            capabilities: ProviderCapabilities::default(),
            adapter: Arc::new(crate::providers::adapter::ProviderAdapter::new(
                script.to_str().unwrap(),
                "",
            )),
        };
        let mut req = request("project:demo", "hi");
        req.env.insert("CUSTOM_VAR".to_string(), "caller".to_string());
        let cancel = CancellationToken::new();

        let options = executor
            .assemble_context(&req, &agent, &provider, cancel)
            .await
            .unwrap();

        // Stored config overrides the built-in default...
        assert_eq!(
            options.env.get("OPENCLAW_ARGUMENTS").map(String::as_str),
            Some("--from-stored-config")
        );
        // ...and the caller's own env overrides the stored config.
        assert_eq!(options.env.get("CUSTOM_VAR").map(String::as_str), Some("caller"));
    }
}
