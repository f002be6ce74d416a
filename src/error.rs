//! Error type shared by the sync engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Local SQLite store failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// GitHub rejected the token (expired, revoked or missing scopes).
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// GitHub answered with an error status or a GraphQL error payload.
    #[error("GitHub API error: {message}")]
    GitHubApi {
        message: String,
        status_code: Option<u16>,
    },

    /// The request never produced a GitHub answer (connection, TLS, decoding).
    #[error("GitHub request failed: {0}")]
    Transport(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token entry was cancelled")]
    CredentialCancelled,

    #[error("Invalid refresh schedule '{input}': {reason}")]
    InvalidSchedule { input: String, reason: String },

    #[error("A fetch cycle is already in progress")]
    FetchInProgress,

    #[error("Migration {from} -> {to} failed: {message}")]
    Migration { from: u32, to: u32, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Scheduler is not running")]
    SchedulerStopped,
}

impl SyncError {
    pub fn github_api(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self::GitHubApi {
            message: message.into(),
            status_code,
        }
    }

    pub fn invalid_schedule(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// True when the failure means the token has to be replaced.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication(_))
    }
}

impl From<octocrab::Error> for SyncError {
    fn from(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let status = source.status_code.as_u16();
                if status == 401 {
                    Self::Authentication(source.message.clone())
                } else {
                    Self::github_api(source.message.clone(), Some(status))
                }
            }
            other => Self::Transport(other.to_string()),
        }
    }
}
