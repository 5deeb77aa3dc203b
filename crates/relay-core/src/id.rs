//! Strongly-typed identifiers for Relay entities.
//!
//! All generated identifiers are ULID-backed:
//! - **Lexicographically sortable**: encode creation time and sort naturally
//! - **Globally unique**: no coordination required for generation
//!
//! Consumer ids additionally carry the `producer-` prefix so container names
//! and lock documents are self-describing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Prefix applied to every generated consumer id.
pub const CONSUMER_ID_PREFIX: &str = "producer-";

/// A unique identifier for a sandbox workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(Ulid);

impl WorkspaceId {
    /// Generates a new unique workspace id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the creation timestamp encoded in the id.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = self.0.timestamp_ms();
        chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkspaceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid workspace id '{s}': {e}"),
            })
    }
}

/// A unique identifier for an executor (producer/consumer pair).
///
/// Consumer ids are random and prefixed with `producer-` so that derived
/// container names sort with their lock documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Generates a new unique consumer id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!(
            "{CONSUMER_ID_PREFIX}{}",
            Ulid::new().to_string().to_lowercase()
        ))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConsumerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidId {
                message: "consumer id cannot be empty".into(),
            });
        }
        if s.contains(|c: char| c.is_whitespace() || c == '/' || c == '\0') {
            return Err(Error::InvalidId {
                message: format!("consumer id contains invalid characters: '{s}'"),
            });
        }
        Ok(Self(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_id_roundtrip() {
        let id = WorkspaceId::generate();
        let parsed: WorkspaceId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn consumer_id_carries_prefix() {
        let id = ConsumerId::generate();
        assert!(id.as_str().starts_with(CONSUMER_ID_PREFIX));
    }

    #[test]
    fn consumer_ids_are_unique() {
        assert_ne!(ConsumerId::generate(), ConsumerId::generate());
    }

    #[test]
    fn invalid_consumer_id_rejected() {
        assert!("has space".parse::<ConsumerId>().is_err());
        assert!("".parse::<ConsumerId>().is_err());
        assert!("producer-ok".parse::<ConsumerId>().is_ok());
    }

    #[test]
    fn invalid_workspace_id_rejected() {
        let result: Result<WorkspaceId> = "not-a-ulid".parse();
        assert!(result.is_err());
    }
}
