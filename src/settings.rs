//! Global runtime settings (C11 — SettingsStore).
//!
//! One JSON document at `{home}/settings.json`. Read on each settings
//! endpoint, written with an atomic replace (write-temp-then-rename, same
//! durability idiom as `SessionStore`). The authentication block only ever
//! stores a password verifier (salt + argon2id hash); the plaintext is never
//! written to disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InactiveAgentNotificationTarget {
    AllManagers,
    CeoOnly,
}

impl Default for InactiveAgentNotificationTarget {
    fn default() -> Self {
        InactiveAgentNotificationTarget::AllManagers
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticationSettings {
    pub enabled: bool,
    pub username: Option<String>,
    /// Salt + argon2id hash, PHC string format. Never serialised in API
    /// responses — callers should go through `Settings::public()`.
    pub password_verifier: Option<String>,
}

impl AuthenticationSettings {
    pub fn has_password(&self) -> bool {
        self.password_verifier.is_some()
    }

    pub fn set_password(&mut self, plaintext: &str) -> Result<()> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("failed to hash password: {e}"))?;
        self.password_verifier = Some(hash.to_string());
        Ok(())
    }

    pub fn verify_password(&self, plaintext: &str) -> bool {
        let Some(verifier) = &self.password_verifier else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(verifier) else {
            return false;
        };
        Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_true")]
    pub task_cron_enabled: bool,
    #[serde(default)]
    pub notify_managers_of_inactive_agents: bool,
    #[serde(default = "default_max_inactivity_minutes")]
    pub max_inactivity_minutes: u32,
    #[serde(default)]
    pub inactive_agent_notification_target: InactiveAgentNotificationTarget,
    #[serde(default)]
    pub authentication: AuthenticationSettings,
}

fn default_true() -> bool {
    true
}

fn default_max_inactivity_minutes() -> u32 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            task_cron_enabled: true,
            notify_managers_of_inactive_agents: false,
            max_inactivity_minutes: default_max_inactivity_minutes(),
            inactive_agent_notification_target: InactiveAgentNotificationTarget::default(),
            authentication: AuthenticationSettings::default(),
        }
    }
}

impl Settings {
    /// Clamp `maxInactivityMinutes` to the documented 1..=10080 (one week) range.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=10_080).contains(&self.max_inactivity_minutes) {
            return Err("maxInactivityMinutes must be between 1 and 10080".to_string());
        }
        Ok(())
    }
}

/// Holds the settings document plus a process-wide cache so readers don't
/// re-parse JSON on every request. Writers replace the cache after an atomic
/// file swap.
pub struct SettingsStore {
    path: PathBuf,
    cache: RwLock<Arc<Settings>>,
}

impl SettingsStore {
    pub async fn open(home: &Path) -> Result<Self> {
        let path = home.join("settings.json");
        let initial = load(&path).await?;
        Ok(Self {
            path,
            cache: RwLock::new(Arc::new(initial)),
        })
    }

    pub async fn get(&self) -> Arc<Settings> {
        self.cache.read().await.clone()
    }

    pub async fn update<F>(&self, mutate: F) -> Result<Arc<Settings>>
    where
        F: FnOnce(&mut Settings),
    {
        let mut guard = self.cache.write().await;
        let mut next = (**guard).clone();
        mutate(&mut next);
        next.validate().map_err(|e| anyhow::anyhow!(e))?;
        save(&self.path, &next).await?;
        let next = Arc::new(next);
        *guard = next.clone();
        Ok(next)
    }
}

async fn load(path: &Path) -> Result<Settings> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            serde_json::from_slice(&bytes).context("settings.json is not valid JSON")
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
        Err(e) => Err(e).context("failed to read settings.json"),
    }
}

async fn save(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(settings)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).await.unwrap();
        let settings = store.get().await;
        assert!(settings.task_cron_enabled);
        assert!(!settings.authentication.enabled);
    }

    #[tokio::test]
    async fn save_load_save_is_byte_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::open(dir.path()).await.unwrap();
        store
            .update(|s| {
                s.max_inactivity_minutes = 30;
                s.notify_managers_of_inactive_agents = true;
            })
            .await
            .unwrap();

        let bytes_first = tokio::fs::read(dir.path().join("settings.json"))
            .await
            .unwrap();

        let reopened = SettingsStore::open(dir.path()).await.unwrap();
        reopened
            .update(|s| {
                s.max_inactivity_minutes = 30;
                s.notify_managers_of_inactive_agents = true;
            })
            .await
            .unwrap();
        let bytes_second = tokio::fs::read(dir.path().join("settings.json"))
            .await
            .unwrap();

        assert_eq!(bytes_first, bytes_second);
    }

    #[test]
    fn password_verifier_round_trips() {
        let mut auth = AuthenticationSettings::default();
        assert!(!auth.has_password());
        auth.set_password("correct horse battery staple").unwrap();
        assert!(auth.has_password());
        assert!(auth.verify_password("correct horse battery staple"));
        assert!(!auth.verify_password("wrong"));
    }

    #[test]
    fn rejects_out_of_range_inactivity_threshold() {
        let mut settings = Settings::default();
        settings.max_inactivity_minutes = 0;
        assert!(settings.validate().is_err());
        settings.max_inactivity_minutes = 20_000;
        assert!(settings.validate().is_err());
        settings.max_inactivity_minutes = 60;
        assert!(settings.validate().is_ok());
    }
}
