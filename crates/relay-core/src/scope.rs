//! Request scoping for multi-tenant metadata.
//!
//! All Relay metadata is scoped by `(userId, projectId)`. This module
//! validates the identifiers at construction and provides the canonical
//! document key layout:
//!
//! ```text
//! users/{userId}/projects/{projectId}/{collection}/{docId}
//! ```
//!
//! The key=value-free path format keeps keys grep-friendly and lets a prefix
//! scan enumerate one collection for one scope.
//!
//! # Security
//!
//! Identifiers are validated at construction: path separators, control
//! characters, and traversal segments are rejected so a scope can never
//! escape its prefix.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A validated `(userId, projectId)` scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    user_id: String,
    project_id: String,
}

impl Scope {
    /// Creates a new scope from user and project identifiers.
    ///
    /// # Errors
    ///
    /// Returns an error if either identifier is empty, contains path
    /// separators or control characters, or is a traversal segment.
    pub fn new(user_id: impl Into<String>, project_id: impl Into<String>) -> Result<Self> {
        let user_id = user_id.into();
        let project_id = project_id.into();

        Self::validate_id(&user_id, "userId")?;
        Self::validate_id(&project_id, "projectId")?;

        Ok(Self {
            user_id,
            project_id,
        })
    }

    fn validate_id(id: &str, field: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidId {
                message: format!("{field} cannot be empty"),
            });
        }

        if id == "." || id == ".." {
            return Err(Error::InvalidId {
                message: format!("{field} cannot be a traversal segment"),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(Error::InvalidId {
                message: format!(
                    "{field} contains invalid characters (allowed: a-z, A-Z, 0-9, '-', '_', '.')"
                ),
            });
        }

        Ok(())
    }

    /// Returns the user identifier.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Returns the project identifier.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Returns the key for a document in a scoped collection.
    #[must_use]
    pub fn doc_key(&self, collection: &str, doc_id: &str) -> String {
        format!(
            "users/{}/projects/{}/{collection}/{doc_id}",
            self.user_id, self.project_id
        )
    }

    /// Returns the key prefix that enumerates one scoped collection.
    #[must_use]
    pub fn collection_prefix(&self, collection: &str) -> String {
        format!(
            "users/{}/projects/{}/{collection}/",
            self.user_id, self.project_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_builds_doc_keys() {
        let scope = Scope::new("u1", "p1").expect("scope");
        assert_eq!(
            scope.doc_key("locks", "consumer"),
            "users/u1/projects/p1/locks/consumer"
        );
        assert_eq!(
            scope.collection_prefix("workspaces"),
            "users/u1/projects/p1/workspaces/"
        );
    }

    #[test]
    fn scope_rejects_separators() {
        assert!(Scope::new("u/1", "p1").is_err());
        assert!(Scope::new("u1", "p\\1").is_err());
        assert!(Scope::new("", "p1").is_err());
        assert!(Scope::new("u1", "..").is_err());
    }

    #[test]
    fn scope_allows_firebase_style_ids() {
        assert!(Scope::new("Ab3_xYz-9", "proj.dev").is_ok());
    }
}
