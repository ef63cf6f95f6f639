//! On-disk layout resolution (C1 — PathLayout).
//!
//! Everything the daemon touches on disk is derived from a single home
//! directory. Stores create their own subdirectories lazily on first write;
//! this module only computes paths, it never creates anything.

use std::path::{Path, PathBuf};

/// Resolves the on-disk layout rooted at `home`.
#[derive(Debug, Clone)]
pub struct PathLayout {
    home: PathBuf,
}

impl PathLayout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.home.join("workspaces")
    }

    pub fn agent_workspace_dir(&self, agent_id: &str) -> PathBuf {
        self.workspaces_dir().join(agent_id)
    }

    /// The organisation directory holds cross-agent shared docs (wiki,
    /// onboarding) — out of scope here, but other components (e.g. the
    /// browser UI) expect it to exist alongside `workspaces/`.
    pub fn organization_dir(&self) -> PathBuf {
        self.home.join("organization")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.home.join("agents")
    }

    pub fn agent_config_path(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id).join("config.json")
    }

    pub fn agent_internal_config_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id).join("internal")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.home.join("skills")
    }

    pub fn providers_dir(&self) -> PathBuf {
        self.home.join("providers")
    }

    pub fn provider_config_path(&self, provider_id: &str) -> PathBuf {
        self.providers_dir().join(provider_id).join("config.json")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.home.join("sessions")
    }

    pub fn session_dir(&self, session_key_slug: &str) -> PathBuf {
        self.sessions_dir().join(session_key_slug)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn global_config_json_path(&self) -> PathBuf {
        self.home.join("config.json")
    }

    pub fn global_config_markdown_path(&self) -> PathBuf {
        self.home.join("config.md")
    }

    pub fn agents_index_json_path(&self) -> PathBuf {
        self.home.join("agents.json")
    }

    pub fn boards_sqlite_path(&self) -> PathBuf {
        self.home.join("boards.sqlite")
    }

    /// Signing secret for auth cookies (HMAC key), generated on first run.
    pub fn auth_secret_path(&self) -> PathBuf {
        self.home.join("auth_secret")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.home.join("settings.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_absolute_paths_from_home() {
        let layout = PathLayout::new("/tmp/opengoat-home");
        assert_eq!(
            layout.agent_workspace_dir("ceo"),
            PathBuf::from("/tmp/opengoat-home/workspaces/ceo")
        );
        assert_eq!(
            layout.agents_index_json_path(),
            PathBuf::from("/tmp/opengoat-home/agents.json")
        );
        assert_eq!(
            layout.boards_sqlite_path(),
            PathBuf::from("/tmp/opengoat-home/boards.sqlite")
        );
    }
}
