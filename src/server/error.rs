use thiserror::Error;

use crate::common::models::UserId;

#[derive(Debug, Error)]
pub enum ImError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("user {0} is not connected")]
    NotConnected(UserId),
    #[error("write to user {user} failed: {reason}")]
    Transport { user: UserId, reason: String },
    #[error("presence store unavailable: {0}")]
    Store(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid or expired session")]
    InvalidSession,
}

impl From<redis::RedisError> for ImError {
    fn from(e: redis::RedisError) -> Self {
        ImError::Store(e.to_string())
    }
}

impl ImError {
    /// Conditions absorbed where they occur and never shown to the client.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ImError::Malformed(_) | ImError::NotConnected(_) | ImError::Transport { .. }
        )
    }
}
