use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::model::Identity;

pub const MAX_KEY_LENGTH: usize = 512;
const SESSION_PREFIX: &str = "session";

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}

/// Rejects anything that could escape its namespace when used as a storage key
/// or path segment.
pub(crate) fn validate_key(key: &str) -> Result<(), KeyError> {
    let invalid = |reason: &str| KeyError::InvalidKey {
        key: key.chars().take(50).collect::<String>().replace('\0', "\\0"),
        reason: reason.to_string(),
    };

    if key.is_empty() {
        return Err(invalid("key cannot be empty"));
    }

    if key.len() > MAX_KEY_LENGTH {
        return Err(KeyError::InvalidKey {
            key: key.chars().take(50).collect::<String>() + "...",
            reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
        });
    }

    if key.trim().is_empty() {
        return Err(invalid("key cannot be only whitespace"));
    }

    if key.contains('\0') {
        return Err(invalid("key cannot contain null bytes"));
    }

    if key.contains("..") {
        return Err(invalid("key cannot contain path traversal sequences"));
    }

    if key.starts_with('/') || key.starts_with('\\') {
        return Err(invalid("key cannot start with path separator"));
    }

    if key.chars().any(|c| c.is_control() && c != '\t') {
        return Err(invalid("key contains invalid control characters"));
    }

    Ok(())
}

/// Key under which one session's state document is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Result<Self, KeyError> {
        let key = key.into();
        validate_key(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespaced form used as the storage row key.
    pub fn raw(&self) -> String {
        format!("{SESSION_PREFIX}:{}", self.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fan-out group that receives state updates for one user of one application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionGroup(String);

impl SessionGroup {
    pub fn for_identity(identity: &Identity) -> Self {
        Self(format!("{}:{}", identity.application_id, identity.username))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
