//! Optional username+password gate with a signed session cookie (C13 —
//! AuthGate).
//!
//! The cookie is opaque to the client: `{username}.{expires_at}` signed
//! with HMAC-SHA256 under a process-scoped secret generated on first run
//! (`PathLayout::auth_secret_path`). `HttpOnly`/`SameSite=Lax`, no
//! encryption — the secret never leaves the process, so a stolen cookie
//! only grants access for its lifetime and can't be forged without it.

use std::path::Path;

use anyhow::{Context, Result};
use axum_extra::extract::cookie::{Cookie, SameSite};
use hmac::{Hmac, Mac};
use sha2::Sha256;

pub const SESSION_COOKIE_NAME: &str = "opengoat_session";
const COOKIE_TTL_SECS: i64 = 7 * 24 * 60 * 60;

type HmacSha256 = Hmac<Sha256>;

pub struct AuthGate {
    secret: Vec<u8>,
}

impl AuthGate {
    pub async fn open(home: &Path) -> Result<Self> {
        let path = home.join("auth_secret");
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if !bytes.is_empty() {
                return Ok(Self { secret: bytes });
            }
        }
        let secret: Vec<u8> = {
            use rand::RngCore;
            let mut bytes = vec![0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_secret_file(&path, &secret).await?;
        Ok(Self { secret })
    }

    /// Builds a fresh signed cookie for `username`, valid for one week.
    pub fn issue_cookie(&self, username: &str) -> Cookie<'static> {
        let expires_at = chrono::Utc::now().timestamp() + COOKIE_TTL_SECS;
        let value = self.sign(username, expires_at);
        Cookie::build((SESSION_COOKIE_NAME, value))
            .http_only(true)
            .same_site(SameSite::Lax)
            .path("/")
            .build()
    }

    pub fn logout_cookie(&self) -> Cookie<'static> {
        let mut cookie = Cookie::build((SESSION_COOKIE_NAME, ""))
            .http_only(true)
            .same_site(SameSite::Lax)
            .path("/")
            .build();
        cookie.make_removal();
        cookie
    }

    /// Verifies a cookie value and returns the authenticated username, or
    /// `None` if the signature is invalid, the cookie is malformed, or it
    /// has expired.
    pub fn verify(&self, cookie_value: &str) -> Option<String> {
        let (payload, signature_hex) = cookie_value.rsplit_once('.')?;
        let (username, expires_at_str) = payload.rsplit_once('.')?;
        let expires_at: i64 = expires_at_str.parse().ok()?;
        if chrono::Utc::now().timestamp() > expires_at {
            return None;
        }
        let expected = self.sign(username, expires_at);
        let (_, expected_signature) = expected.rsplit_once('.')?;
        if constant_time_eq(signature_hex.as_bytes(), expected_signature.as_bytes()) {
            Some(username.to_string())
        } else {
            None
        }
    }

    fn sign(&self, username: &str, expires_at: i64) -> String {
        let payload = format!("{username}.{expires_at}");
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        format!("{payload}.{signature}")
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn write_secret_file(path: &Path, secret: &[u8]) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        file.write_all(secret).await?;
    }
    #[cfg(not(unix))]
    tokio::fs::write(path, secret).await?;
    Ok(())
}

/// Password policy enforced on change (§4.13): at least 12 characters, with
/// at least one upper, one lower, one digit, and one symbol.
pub fn validate_password_policy(password: &str) -> Result<(), String> {
    if password.len() < 12 {
        return Err("password must be at least 12 characters".to_string());
    }
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| !c.is_ascii_alphanumeric());
    if !(has_upper && has_lower && has_digit && has_symbol) {
        return Err(
            "password must include an uppercase letter, a lowercase letter, a digit, and a symbol"
                .to_string(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_valid_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let gate = AuthGate::open(dir.path()).await.unwrap();
        let cookie = gate.issue_cookie("alice");
        let verified = gate.verify(cookie.value()).unwrap();
        assert_eq!(verified, "alice");
    }

    #[tokio::test]
    async fn rejects_tampered_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let gate = AuthGate::open(dir.path()).await.unwrap();
        let cookie = gate.issue_cookie("alice");
        let tampered = cookie.value().replace("alice", "mallory");
        assert!(gate.verify(&tampered).is_none());
    }

    #[test]
    fn password_policy_requires_all_four_classes() {
        assert!(validate_password_policy("short1!A").is_err());
        assert!(validate_password_policy("alllowercase123!").is_err());
        assert!(validate_password_policy("CorrectHorse123!").is_ok());
    }
}
