//! Per-request work root derivation and path containment.
//!
//! Every tool invocation operates inside a work root derived from the
//! configured mount and a rendered prefix template:
//!
//! ```text
//! workRoot = WORK_ROOT / render(WORK_PREFIX_TEMPLATE, scope)
//! ```
//!
//! Recognized template tokens are `{userId}`, `{projectId}`, `{workspaceId}`
//! and `{sessionId}`; unknown tokens render empty.
//!
//! # Security
//!
//! Tool `filepath` inputs must resolve to strict descendants of the work
//! root. Absolute paths, traversal segments, backslashes, and control
//! characters are rejected before any filesystem access.

use std::path::{Path, PathBuf};

use relay_core::error::{Error, Result};

use crate::tools::ToolError;

/// Default base mount for work roots.
pub const DEFAULT_WORK_ROOT: &str = "/mnt/work";

/// Default per-request prefix template.
pub const DEFAULT_PREFIX_TEMPLATE: &str = "{projectId}/{workspaceId}";

/// Configuration for deriving work roots.
#[derive(Debug, Clone)]
pub struct WorkRootSpec {
    /// Base sandbox mount.
    pub base: PathBuf,
    /// Per-request prefix template.
    pub template: String,
}

impl WorkRootSpec {
    /// Creates a spec with the given base mount and template.
    #[must_use]
    pub fn new(base: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            template: template.into(),
        }
    }
}

impl Default for WorkRootSpec {
    fn default() -> Self {
        Self::new(DEFAULT_WORK_ROOT, DEFAULT_PREFIX_TEMPLATE)
    }
}

/// Template variables available to the prefix template.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars<'a> {
    /// `{userId}` token value.
    pub user_id: &'a str,
    /// `{projectId}` token value.
    pub project_id: &'a str,
    /// `{workspaceId}` token value.
    pub workspace_id: &'a str,
    /// `{sessionId}` token value.
    pub session_id: &'a str,
}

/// Renders a prefix template, substituting recognized tokens.
///
/// Unknown `{token}` occurrences render empty. Empty path segments produced
/// by empty substitutions are collapsed.
#[must_use]
pub fn render_prefix(template: &str, vars: &TemplateVars<'_>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        if let Some(close) = after.find('}') {
            let token = &after[..close];
            match token {
                "userId" => out.push_str(vars.user_id),
                "projectId" => out.push_str(vars.project_id),
                "workspaceId" => out.push_str(vars.workspace_id),
                "sessionId" => out.push_str(vars.session_id),
                _ => {}
            }
            rest = &after[close + 1..];
        } else {
            out.push('{');
            rest = after;
        }
    }
    out.push_str(rest);

    out.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// A derived, existing work root directory.
#[derive(Debug, Clone)]
pub struct WorkRoot {
    root: PathBuf,
}

impl WorkRoot {
    /// Derives the work root for the given variables and creates it if
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the rendered prefix escapes the base mount or
    /// the directory cannot be created.
    pub async fn ensure(spec: &WorkRootSpec, vars: &TemplateVars<'_>) -> Result<Self> {
        let prefix = render_prefix(&spec.template, vars);
        validate_relative(&prefix)
            .map_err(|e| Error::InvalidInput(format!("work prefix '{prefix}': {}", e.message)))?;

        let root = spec.base.join(&prefix);
        if root == spec.base {
            return Err(Error::InvalidInput(
                "work prefix must not be empty (work root must be a strict descendant of the mount)"
                    .to_string(),
            ));
        }

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::storage_with_source(format!("create work root {}", root.display()), e))?;

        Ok(Self { root })
    }

    /// Wraps an existing directory as a work root (tests and the producer
    /// binary, which receives the resolved root directly).
    #[must_use]
    pub fn from_path(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolves a tool-supplied relative path strictly inside the root.
    ///
    /// # Errors
    ///
    /// Returns a `path_escape` tool error for absolute paths and any
    /// component that would resolve outside the root. No filesystem access
    /// is performed.
    pub fn resolve(&self, filepath: &str) -> std::result::Result<PathBuf, ToolError> {
        validate_relative(filepath)?;
        Ok(self.root.join(filepath))
    }
}

fn validate_relative(path: &str) -> std::result::Result<(), ToolError> {
    if path.is_empty() {
        return Err(ToolError::path_escape());
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(ToolError::path_escape());
    }
    if path.contains('\\') || path.contains('\0') || path.contains('\n') || path.contains('\r') {
        return Err(ToolError::path_escape());
    }
    for segment in path.split('/') {
        if segment == "." || segment == ".." {
            return Err(ToolError::path_escape());
        }
    }
    Ok(())
}
