//! Append-only session transcripts (C3 — SessionStore).
//!
//! Each session owns one NDJSON transcript file and a `metadata.json`
//! sidecar under `sessions/<sessionKey-slug>/`. Writes are durable
//! (write-temp-then-rename for metadata; transcript lines are appended and
//! fsynced directly, since NDJSON append is itself crash-safe as long as a
//! partial last line is tolerated by readers). Concurrent appends to the
//! same session are serialised by a per-session `tokio::sync::Mutex`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::paths::PathLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Project,
    UiAgent,
    Ws,
}

impl SessionKind {
    pub fn from_session_key(key: &str) -> Self {
        if key.starts_with("project:") {
            SessionKind::Project
        } else if key.starts_with("ui-agent:") {
            SessionKind::UiAgent
        } else {
            SessionKind::Ws
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TranscriptEntry {
    Message {
        role: Role,
        content: String,
        timestamp: i64,
    },
    Compaction {
        summary: String,
        timestamp: i64,
    },
}

impl TranscriptEntry {
    pub fn timestamp(&self) -> i64 {
        match self {
            TranscriptEntry::Message { timestamp, .. } => *timestamp,
            TranscriptEntry::Compaction { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_key: String,
    pub session_id: String,
    /// Empty for sessions created before agent scoping was tracked.
    #[serde(default)]
    pub agent_id: String,
    pub title: Option<String>,
    pub project_path: Option<String>,
    pub provider_id: String,
    pub input_chars: u64,
    pub output_chars: u64,
    pub total_chars: u64,
    pub compaction_count: u32,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_key: String,
    pub session_id: String,
    pub agent_id: String,
    pub title: Option<String>,
    pub project_path: Option<String>,
    pub kind: SessionKind,
    pub provider_id: String,
    pub transcript_path: PathBuf,
    pub input_chars: u64,
    pub output_chars: u64,
    pub total_chars: u64,
    pub compaction_count: u32,
    pub updated_at: i64,
}

/// Maps a `sessionKey` to a filesystem-safe directory slug. Not reversible
/// in general, so the slug is stored verbatim alongside the key in
/// `metadata.json` rather than derived back from the directory name.
fn slug_for(session_key: &str) -> String {
    session_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct SessionStore {
    layout: PathLayout,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(layout: PathLayout) -> Self {
        Self {
            layout,
            locks: RwLock::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, session_key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(session_key) {
            return lock.clone();
        }
        let mut guard = self.locks.write().await;
        guard
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn dir_for(&self, session_key: &str) -> PathBuf {
        self.layout.session_dir(&slug_for(session_key))
    }

    fn transcript_path(&self, session_key: &str) -> PathBuf {
        self.dir_for(session_key).join("transcript.ndjson")
    }

    fn metadata_path(&self, session_key: &str) -> PathBuf {
        self.dir_for(session_key).join("metadata.json")
    }

    async fn read_metadata(&self, session_key: &str) -> Result<Option<SessionMetadata>> {
        match tokio::fs::read(self.metadata_path(session_key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_metadata(&self, meta: &SessionMetadata) -> Result<()> {
        let path = self.metadata_path(&meta.session_key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(meta)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Appends one entry, creating the session (and deriving its title from
    /// the first user message) on first write. Serialised per `sessionKey`.
    /// `agent_id` is only recorded at creation time — it does not change on
    /// later appends to the same session.
    pub async fn append(
        &self,
        session_key: &str,
        agent_id: &str,
        provider_id: &str,
        entry: TranscriptEntry,
    ) -> Result<SessionMetadata> {
        let lock = self.lock_for(session_key).await;
        let _guard = lock.lock().await;

        let dir = self.dir_for(session_key);
        tokio::fs::create_dir_all(&dir).await?;

        let mut meta = match self.read_metadata(session_key).await? {
            Some(meta) => meta,
            None => SessionMetadata {
                session_key: session_key.to_string(),
                session_id: uuid::Uuid::new_v4().to_string(),
                agent_id: agent_id.to_string(),
                title: None,
                project_path: None,
                provider_id: provider_id.to_string(),
                input_chars: 0,
                output_chars: 0,
                total_chars: 0,
                compaction_count: 0,
                updated_at: now_millis(),
            },
        };

        if meta.title.is_none() {
            if let TranscriptEntry::Message {
                role: Role::User,
                content,
                ..
            } = &entry
            {
                meta.title = Some(derive_title(content));
            }
        }

        match &entry {
            TranscriptEntry::Message { role, content, .. } => {
                let len = content.chars().count() as u64;
                match role {
                    Role::User => meta.input_chars += len,
                    Role::Assistant => meta.output_chars += len,
                    Role::System => {}
                }
                meta.total_chars += len;
            }
            TranscriptEntry::Compaction { .. } => {
                meta.compaction_count += 1;
            }
        }
        meta.updated_at = entry.timestamp();

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.transcript_path(session_key))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        self.write_metadata(&meta).await?;
        Ok(meta)
    }

    /// Returns the last `limit` transcript entries in chronological order.
    pub async fn history(&self, session_key: &str, limit: usize) -> Result<Vec<TranscriptEntry>> {
        let path = self.transcript_path(session_key);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TranscriptEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    // A trailing partial line from a crash mid-write; skip it
                    // rather than fail the whole read.
                    tracing::warn!(path = %path.display(), err = %e, "skipping malformed transcript line");
                }
            }
        }
        if entries.len() > limit {
            entries.drain(0..entries.len() - limit);
        }
        Ok(entries)
    }

    pub async fn rename(&self, session_key: &str, name: &str) -> Result<()> {
        let lock = self.lock_for(session_key).await;
        let _guard = lock.lock().await;
        let Some(mut meta) = self.read_metadata(session_key).await? else {
            bail!("session not found: {session_key}");
        };
        meta.title = Some(name.to_string());
        self.write_metadata(&meta).await
    }

    pub async fn remove(&self, session_key: &str) -> Result<()> {
        let lock = self.lock_for(session_key).await;
        let _guard = lock.lock().await;
        let dir = self.dir_for(session_key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove session directory"),
        }
    }

    /// Returns one session's metadata, if it exists.
    pub async fn metadata(&self, session_key: &str) -> Result<Option<SessionMetadata>> {
        self.read_metadata(session_key).await
    }

    /// Lists sessions sorted by `updatedAt desc`, optionally restricted to
    /// those created by `agent_id`. Scans every session directory under
    /// `sessionsDir` since there is no separate per-agent index — session
    /// directories are named from the `sessionKey` slug, not grouped by
    /// agent.
    pub async fn list(&self, agent_id: Option<&str>) -> Result<Vec<SessionView>> {
        let mut views = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.layout.sessions_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(views),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let meta_path = entry.path().join("metadata.json");
            let Ok(bytes) = tokio::fs::read(&meta_path).await else {
                continue;
            };
            let meta: SessionMetadata = match serde_json::from_slice(&bytes) {
                Ok(meta) => meta,
                Err(e) => {
                    tracing::warn!(path = %meta_path.display(), err = %e, "skipping malformed session metadata");
                    continue;
                }
            };
            if let Some(agent_id) = agent_id {
                if meta.agent_id != agent_id {
                    continue;
                }
            }
            let key = meta.session_key.clone();
            views.push(SessionView {
                session_key: meta.session_key.clone(),
                session_id: meta.session_id,
                agent_id: meta.agent_id,
                title: meta.title,
                project_path: meta.project_path,
                kind: SessionKind::from_session_key(&key),
                provider_id: meta.provider_id,
                transcript_path: self.transcript_path(&key),
                input_chars: meta.input_chars,
                output_chars: meta.output_chars,
                total_chars: meta.total_chars,
                compaction_count: meta.compaction_count,
                updated_at: meta.updated_at,
            });
        }
        views.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(views)
    }

    /// Timestamp of the most recent `assistant` message, used by the
    /// inactivity sweep (§4.9.4).
    pub async fn last_assistant_activity(&self, session_key: &str) -> Result<Option<i64>> {
        let history = self.history(session_key, usize::MAX).await?;
        Ok(history
            .iter()
            .rev()
            .find_map(|entry| match entry {
                TranscriptEntry::Message {
                    role: Role::Assistant,
                    timestamp,
                    ..
                } => Some(*timestamp),
                _ => None,
            }))
    }
}

fn derive_title(first_user_message: &str) -> String {
    let trimmed = first_user_message.trim();
    let truncated: String = trimmed.chars().take(72).collect();
    if truncated.is_empty() {
        "Untitled session".to_string()
    } else {
        truncated
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
