//! Agent identity, workspace scaffolding, and the agents index (C2 —
//! AgentManifestStore).

pub mod authz;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::paths::PathLayout;

pub const CEO_ID: &str = "ceo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Manager,
    Individual,
}

/// What the caller wants the agent to be; `ensureAgent` is idempotent over
/// this — calling it twice with the same identity leaves the workspace
/// byte-identical to after the first call.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub id: String,
    pub display_name: String,
    pub agent_type: AgentType,
    pub reports_to: Option<String>,
    pub role: Option<String>,
    pub provider_id: Option<String>,
}

/// Seed content for the four bootstrap files, used only the first time a
/// workspace is scaffolded. Omitted fields fall back to a minimal built-in
/// template rather than an empty file.
#[derive(Debug, Clone, Default)]
pub struct AgentTraits {
    pub agents_md: Option<String>,
    pub soul_md: Option<String>,
    pub identity_md: Option<String>,
    pub bootstrap_md: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub reports_to: Option<String>,
    pub role: Option<String>,
    pub workspace_dir: PathBuf,
    pub internal_config_dir: PathBuf,
    pub provider_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AgentConfigFile {
    id: String,
    display_name: String,
    #[serde(rename = "type")]
    agent_type: AgentType,
    reports_to: Option<String>,
    role: Option<String>,
    provider_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct AgentsIndex {
    agents: Vec<String>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(thiserror::Error, Debug)]
pub enum InvalidAgentConfigError {
    #[error("agent config at {path} is not valid JSON: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Normalise a proposed agent id: trim, lowercase, collapse runs of
/// non-alphanumerics to a single `-`. Rejects names that normalise to empty.
pub fn normalize_agent_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim().to_lowercase();
    let mut out = String::with_capacity(trimmed.len());
    let mut last_was_dash = false;
    for c in trimmed.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        bail!("agent name must contain at least one alphanumeric character");
    }
    Ok(out)
}

pub struct AgentManifestStore {
    layout: PathLayout,
    /// Guards index reads/writes so concurrent `ensureAgent` calls can't
    /// race on `agents.json`.
    lock: RwLock<()>,
}

impl AgentManifestStore {
    pub fn new(layout: PathLayout) -> Self {
        Self {
            layout,
            lock: RwLock::new(()),
        }
    }

    /// Idempotent: scaffolds the workspace only when it is fresh. Enforces
    /// the DAG invariant (no cycles, `reportsTo` resolves or is null) against
    /// the current index before writing.
    pub async fn ensure_agent(
        &self,
        identity: AgentIdentity,
        traits: AgentTraits,
    ) -> Result<Agent> {
        let _guard = self.lock.write().await;
        let id = normalize_agent_id(&identity.id)?;

        let existing = self.list_agents_locked().await?;
        if let Some(reports_to) = &identity.reports_to {
            if reports_to == &id {
                bail!("agent {id} cannot report to itself");
            }
            if !existing.iter().any(|a| &a.id == reports_to) && reports_to != &id {
                bail!("reportsTo agent \"{reports_to}\" does not exist");
            }
        }
        if id != CEO_ID && identity.reports_to.is_none() {
            bail!("agent {id} must set reportsTo (only \"{CEO_ID}\" may be a root)");
        }

        let workspace_dir = self.layout.agent_workspace_dir(&id);
        let internal_config_dir = self.layout.agent_internal_config_dir(&id);
        let config_path = self.layout.agent_config_path(&id);

        let now = Utc::now();
        let fresh = !config_path.exists();

        let config = if fresh {
            AgentConfigFile {
                id: id.clone(),
                display_name: identity.display_name.clone(),
                agent_type: identity.agent_type,
                reports_to: identity.reports_to.clone(),
                role: identity.role.clone(),
                provider_id: identity.provider_id.clone(),
                created_at: now,
                updated_at: now,
            }
        } else {
            self.read_config(&config_path).await?
        };

        if fresh {
            tokio::fs::create_dir_all(&workspace_dir).await?;
            tokio::fs::create_dir_all(&internal_config_dir).await?;
            scaffold_workspace(&workspace_dir, &traits).await?;
            if let Some(parent) = config_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let body = serde_json::to_vec_pretty(&config)?;
            write_atomic(&config_path, &body).await?;
        }

        self.add_to_index(&id).await?;
        self.check_no_cycles().await?;

        Ok(agent_from_config(config, workspace_dir, internal_config_dir))
    }

    /// Reads the index; falls back to enumerating `agents/*/config.json` if
    /// the index file is missing (e.g. deleted out-of-band).
    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        let _guard = self.lock.read().await;
        self.list_agents_locked().await
    }

    async fn list_agents_locked(&self) -> Result<Vec<Agent>> {
        let ids = match self.read_index().await? {
            Some(index) => index.agents,
            None => self.enumerate_agent_dirs().await?,
        };
        let mut agents = Vec::with_capacity(ids.len());
        for id in ids {
            let config_path = self.layout.agent_config_path(&id);
            if !config_path.exists() {
                continue;
            }
            let config = self.read_config(&config_path).await?;
            agents.push(agent_from_config(
                config,
                self.layout.agent_workspace_dir(&id),
                self.layout.agent_internal_config_dir(&id),
            ));
        }
        Ok(agents)
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let agents = self.list_agents().await?;
        Ok(agents.into_iter().find(|a| a.id == id))
    }

    /// Deletes an agent's config and index entry. `force` also removes the
    /// workspace directory; without it, refuses to delete an agent that
    /// still has reportees.
    pub async fn delete_agent(&self, id: &str, force: bool) -> Result<()> {
        let _guard = self.lock.write().await;
        if id == CEO_ID {
            bail!("the global default agent ({CEO_ID}) can never be deleted");
        }
        let agents = self.list_agents_locked().await?;
        if !agents.iter().any(|a| a.id == id) {
            bail!("agent not found: {id}");
        }
        if !force && agents.iter().any(|a| a.reports_to.as_deref() == Some(id)) {
            bail!("agent {id} still has reportees; pass force=true to delete anyway");
        }

        let mut index = self.read_index().await?.unwrap_or_default();
        index.agents.retain(|a| a != id);
        self.write_index(index).await?;

        let config_path = self.layout.agent_config_path(id);
        let _ = tokio::fs::remove_file(&config_path).await;
        if force {
            let _ = tokio::fs::remove_dir_all(self.layout.agent_workspace_dir(id)).await;
            let _ = tokio::fs::remove_dir_all(self.layout.agent_internal_config_dir(id)).await;
        }
        Ok(())
    }

    async fn read_config(&self, path: &PathBuf) -> Result<AgentConfigFile> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read agent config at {}", path.display()))?;
        serde_json::from_slice(&bytes).map_err(|source| {
            InvalidAgentConfigError::Malformed {
                path: path.clone(),
                source,
            }
            .into()
        })
    }

    async fn read_index(&self) -> Result<Option<AgentsIndex>> {
        let path = self.layout.agents_index_json_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("agents index at {} is not valid JSON", path.display())
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context("failed to read agents index"),
        }
    }

    async fn write_index(&self, mut index: AgentsIndex) -> Result<()> {
        index.agents.sort();
        index.agents.dedup();
        index.updated_at = Some(Utc::now());
        let path = self.layout.agents_index_json_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&index)?;
        write_atomic(&path, &body).await
    }

    async fn add_to_index(&self, id: &str) -> Result<()> {
        let mut index = self.read_index().await?.unwrap_or_default();
        if !index.agents.iter().any(|a| a == id) {
            index.agents.push(id.to_string());
        }
        self.write_index(index).await
    }

    async fn enumerate_agent_dirs(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.layout.agents_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn check_no_cycles(&self) -> Result<()> {
        let agents = self.list_agents_locked().await?;
        let by_id: HashMap<&str, &Agent> = agents.iter().map(|a| (a.id.as_str(), a)).collect();
        for agent in &agents {
            let mut seen = std::collections::HashSet::new();
            let mut cursor = agent.reports_to.as_deref();
            seen.insert(agent.id.as_str());
            while let Some(parent_id) = cursor {
                if !seen.insert(parent_id) {
                    bail!("reporting graph contains a cycle involving {parent_id}");
                }
                cursor = by_id.get(parent_id).and_then(|a| a.reports_to.as_deref());
            }
        }
        Ok(())
    }
}

fn agent_from_config(
    config: AgentConfigFile,
    workspace_dir: PathBuf,
    internal_config_dir: PathBuf,
) -> Agent {
    Agent {
        id: config.id,
        display_name: config.display_name,
        agent_type: config.agent_type,
        reports_to: config.reports_to,
        role: config.role,
        workspace_dir,
        internal_config_dir,
        provider_id: config.provider_id.unwrap_or_else(|| "openclaw".to_string()),
        created_at: config.created_at,
        updated_at: config.updated_at,
    }
}

async fn scaffold_workspace(workspace_dir: &PathBuf, traits: &AgentTraits) -> Result<()> {
    write_if_absent(
        &workspace_dir.join("AGENTS.md"),
        traits
            .agents_md
            .as_deref()
            .unwrap_or("# Agents\n\nNo collaborating agents recorded yet.\n"),
    )
    .await?;
    write_if_absent(
        &workspace_dir.join("SOUL.md"),
        traits
            .soul_md
            .as_deref()
            .unwrap_or("# Soul\n\nGuiding principles: be helpful, be honest, ask when unsure.\n"),
    )
    .await?;
    write_if_absent(
        &workspace_dir.join("IDENTITY.md"),
        traits
            .identity_md
            .as_deref()
            .unwrap_or("# Identity\n\nRole and responsibilities not yet described.\n"),
    )
    .await?;
    write_if_absent(
        &workspace_dir.join("BOOTSTRAP.md"),
        traits
            .bootstrap_md
            .as_deref()
            .unwrap_or("# Bootstrap\n\nRead AGENTS.md, SOUL.md, and IDENTITY.md before acting.\n"),
    )
    .await?;
    Ok(())
}

async fn write_if_absent(path: &PathBuf, content: &str) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    write_atomic(path, content.as_bytes()).await
}

async fn write_atomic(path: &PathBuf, body: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!(
        "{}tmp",
        path.extension()
            .map(|e| format!("{}.", e.to_string_lossy()))
            .unwrap_or_default()
    ));
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, reports_to: Option<&str>) -> AgentIdentity {
        AgentIdentity {
            id: id.to_string(),
            display_name: id.to_string(),
            agent_type: AgentType::Individual,
            reports_to: reports_to.map(|s| s.to_string()),
            role: None,
            provider_id: None,
        }
    }

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_agent_id("  CEO  ").unwrap(), "ceo");
        assert_eq!(normalize_agent_id("Staff Engineer!!").unwrap(), "staff-engineer");
        assert!(normalize_agent_id("   ").is_err());
        assert!(normalize_agent_id("***").is_err());
    }

    proptest::proptest! {
        /// Whatever normalizes, normalizes again to the same thing — an
        /// already-normalized id is a fixed point.
        #[test]
        fn normalize_is_idempotent(raw in "[ -~]{0,40}") {
            if let Ok(once) = normalize_agent_id(&raw) {
                let twice = normalize_agent_id(&once).expect("a normalized id must re-normalize");
                proptest::prop_assert_eq!(once, twice);
            }
        }

        /// Output never contains uppercase, never contains a run of `-`, and
        /// never starts or ends with `-`.
        #[test]
        fn normalize_output_is_canonical(raw in "[ -~]{0,40}") {
            if let Ok(id) = normalize_agent_id(&raw) {
                proptest::prop_assert!(id.chars().all(|c| !c.is_ascii_uppercase()));
                proptest::prop_assert!(!id.contains("--"));
                proptest::prop_assert!(!id.starts_with('-') && !id.ends_with('-'));
                proptest::prop_assert!(!id.is_empty());
            }
        }
    }

    #[tokio::test]
    async fn ensure_agent_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentManifestStore::new(PathLayout::new(dir.path()));
        store
            .ensure_agent(identity(CEO_ID, None), AgentTraits::default())
            .await
            .unwrap();

        let config_path = PathLayout::new(dir.path()).agent_config_path(CEO_ID);
        let before = tokio::fs::read(&config_path).await.unwrap();

        store
            .ensure_agent(identity(CEO_ID, None), AgentTraits::default())
            .await
            .unwrap();
        let after = tokio::fs::read(&config_path).await.unwrap();

        assert_eq!(before, after);
        let agents = store.list_agents().await.unwrap();
        assert_eq!(agents.iter().filter(|a| a.id == CEO_ID).count(), 1);
    }

    #[tokio::test]
    async fn rejects_reports_to_unknown_agent() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentManifestStore::new(PathLayout::new(dir.path()));
        let err = store
            .ensure_agent(identity("cto", Some("nobody")), AgentTraits::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn non_root_agent_must_set_reports_to() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentManifestStore::new(PathLayout::new(dir.path()));
        let err = store
            .ensure_agent(identity("cto", None), AgentTraits::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reportsTo"));
    }

    #[tokio::test]
    async fn delete_requires_force_when_reportees_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentManifestStore::new(PathLayout::new(dir.path()));
        store
            .ensure_agent(identity(CEO_ID, None), AgentTraits::default())
            .await
            .unwrap();
        store
            .ensure_agent(identity("cto", Some(CEO_ID)), AgentTraits::default())
            .await
            .unwrap();
        store
            .ensure_agent(identity("eng", Some("cto")), AgentTraits::default())
            .await
            .unwrap();

        let err = store.delete_agent("cto", false).await.unwrap_err();
        assert!(err.to_string().contains("reportees"));
        store.delete_agent("cto", true).await.unwrap();
    }

    #[tokio::test]
    async fn delete_agent_never_removes_the_global_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = AgentManifestStore::new(PathLayout::new(dir.path()));
        store
            .ensure_agent(identity(CEO_ID, None), AgentTraits::default())
            .await
            .unwrap();

        let err = store.delete_agent(CEO_ID, false).await.unwrap_err();
        assert!(err.to_string().contains(CEO_ID));
        let err = store.delete_agent(CEO_ID, true).await.unwrap_err();
        assert!(err.to_string().contains(CEO_ID));

        assert!(store.get_agent(CEO_ID).await.unwrap().is_some());
    }
}
