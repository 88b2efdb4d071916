use thiserror::Error;

use crate::domain::EntityKind;

#[derive(Error, Debug)]
pub enum PlaylogError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unique constraint violated: {constraint}")]
    Conflict { constraint: String },

    #[error("Missing parent {kind}: {id}")]
    MissingParent { kind: EntityKind, id: i64 },

    #[error("Provider error: {message}")]
    Provider { message: String },
}

impl PlaylogError {
    /// Constraint description when this is a uniqueness conflict, else None.
    /// The canonicalizer uses this to tell an expected identity race apart
    /// from unrelated storage failures.
    pub fn conflict_constraint(&self) -> Option<&str> {
        match self {
            PlaylogError::Conflict { constraint } => Some(constraint),
            PlaylogError::Database(rusqlite::Error::SqliteFailure(e, Some(msg)))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Some(msg.strip_prefix("UNIQUE constraint failed: ").unwrap_or(msg))
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlaylogError>;
