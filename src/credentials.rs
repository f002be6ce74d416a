//! Personal access token storage.
//!
//! The token is looked up in `GITHUB_TOKEN` first, then in the local store,
//! and is finally requested through a [`TokenPrompt`]. Prompt answers are
//! validated against GitHub's token formats before they are persisted.

use crate::db::{TOKEN_KEY, get_value, remove_value, set_value};
use crate::error::SyncError;
use async_trait::async_trait;
use log::{info, warn};
use regex::Regex;
use rusqlite::Connection;
use std::fmt;
use std::sync::{LazyLock, Mutex};

static TOKEN_FORMAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(gh[ps]_[a-zA-Z0-9]{36}|github_pat_[a-zA-Z0-9]{22}_[a-zA-Z0-9]{59})$").unwrap()
});

pub const DEFAULT_MAX_TOKEN_ATTEMPTS: u32 = 3;

#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

pub fn validate_token(raw: &str) -> Result<Token, SyncError> {
    let trimmed = raw.trim();
    if TOKEN_FORMAT.is_match(trimmed) {
        Ok(Token(trimmed.to_string()))
    } else {
        Err(SyncError::InvalidToken(
            "expected ghp_/ghs_ followed by 36 characters, or a github_pat_ fine-grained token"
                .to_string(),
        ))
    }
}

/// Asks the user for a token. `None` means the user gave up.
#[async_trait]
pub trait TokenPrompt: Send + Sync {
    async fn request_token(&self, attempt: u32, rejection: Option<&str>) -> Option<String>;
}

pub struct CredentialStore<'a> {
    conn: &'a Mutex<Connection>,
    max_attempts: u32,
    /// Raw `GITHUB_TOKEN` captured at construction.
    env_value: Option<String>,
}

impl<'a> CredentialStore<'a> {
    pub fn new(conn: &'a Mutex<Connection>, max_attempts: u32) -> Self {
        Self {
            conn,
            max_attempts: max_attempts.max(1),
            env_value: std::env::var("GITHUB_TOKEN").ok(),
        }
    }

    /// Ignore `GITHUB_TOKEN`; only the store and the prompt are consulted.
    pub fn without_env(mut self) -> Self {
        self.env_value = None;
        self
    }

    #[cfg(test)]
    fn with_env_value(mut self, raw: &str) -> Self {
        self.env_value = Some(raw.to_string());
        self
    }

    pub fn stored(&self) -> Result<Option<Token>, SyncError> {
        let raw = {
            let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
            get_value(&conn, TOKEN_KEY)?
        };
        match raw {
            Some(raw) => match validate_token(&raw) {
                Ok(token) => Ok(Some(token)),
                Err(_) => {
                    warn!("Ignoring stored token with an unrecognised format");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    pub fn store(&self, token: &Token) -> Result<(), SyncError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        set_value(&conn, TOKEN_KEY, token.expose())
    }

    pub fn clear(&self) -> Result<(), SyncError> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        remove_value(&conn, TOKEN_KEY)
    }

    pub async fn get_or_prompt(&self, prompt: &dyn TokenPrompt) -> Result<Token, SyncError> {
        if let Some(token) = env_token(self.env_value.as_deref()) {
            return Ok(token);
        }
        if let Some(token) = self.stored()? {
            return Ok(token);
        }

        let mut rejection: Option<String> = None;
        for attempt in 1..=self.max_attempts {
            let Some(answer) = prompt.request_token(attempt, rejection.as_deref()).await else {
                return Err(SyncError::CredentialCancelled);
            };
            match validate_token(&answer) {
                Ok(token) => {
                    self.store(&token)?;
                    info!("Stored new GitHub token");
                    return Ok(token);
                }
                Err(e) => {
                    warn!("Rejected token entry (attempt {attempt}/{})", self.max_attempts);
                    rejection = Some(e.to_string());
                }
            }
        }
        Err(SyncError::InvalidToken(format!(
            "no valid token after {} attempts",
            self.max_attempts
        )))
    }
}

/// A usable `GITHUB_TOKEN` value. A malformed one is skipped with a warning
/// so the stored token still applies.
pub fn env_token(raw: Option<&str>) -> Option<Token> {
    let raw = raw.filter(|r| !r.trim().is_empty())?;
    match validate_token(raw) {
        Ok(token) => Some(token),
        Err(e) => {
            warn!("Ignoring GITHUB_TOKEN: {e}");
            None
        }
    }
}
