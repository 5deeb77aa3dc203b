//! Tool handlers and the tool-level error type.
//!
//! A [`ToolError`] is a protocol success: it is returned to the upstream in
//! the result frame and never fails the stream. Stable messages
//! (`path_escape`, `not_found`, `timeout`, `bad_arguments`, `unknown_tool`,
//! `workroot_unavailable`) let callers branch without string matching their
//! own spellings.

pub mod fs;
pub mod shell;

use std::fmt;
use std::str::FromStr;

/// The supported tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolName {
    /// Read a file inside the work root.
    ReadFile,
    /// Write a file inside the work root atomically.
    UpdateFile,
    /// Run a shell command with the work root as cwd.
    RunCommand,
}

impl ToolName {
    /// Returns the wire spelling of this tool.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadFile => "READ_FILE",
            Self::UpdateFile => "UPDATE_FILE",
            Self::RunCommand => "RUN_COMMAND",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = ToolError;

    fn from_str(s: &str) -> Result<Self, ToolError> {
        match s {
            "READ_FILE" => Ok(Self::ReadFile),
            "UPDATE_FILE" => Ok(Self::UpdateFile),
            "RUN_COMMAND" => Ok(Self::RunCommand),
            _ => Err(ToolError::unknown_tool()),
        }
    }
}

/// An error raised by a tool handler.
///
/// Not a transport failure: the dispatcher converts it into the `error`
/// field of the result record and the protocol advances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolError {
    /// Stable message reported to the upstream.
    pub message: String,
}

impl ToolError {
    /// Creates a tool error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The path resolves outside the work root.
    #[must_use]
    pub fn path_escape() -> Self {
        Self::new("path_escape")
    }

    /// The target file does not exist.
    #[must_use]
    pub fn not_found() -> Self {
        Self::new("not_found")
    }

    /// The subprocess exceeded its time budget.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new("timeout")
    }

    /// Arguments were a string but not parseable JSON.
    #[must_use]
    pub fn bad_arguments() -> Self {
        Self::new("bad_arguments")
    }

    /// The tool name is not recognized.
    #[must_use]
    pub fn unknown_tool() -> Self {
        Self::new("unknown_tool")
    }

    /// The work root could not be created.
    #[must_use]
    pub fn workroot_unavailable() -> Self {
        Self::new("workroot_unavailable")
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ToolError {}

/// Result type for tool handlers.
pub type ToolResult<T> = Result<T, ToolError>;
