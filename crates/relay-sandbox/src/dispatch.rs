//! Event-to-tool dispatch.
//!
//! The dispatcher parses each incoming event, resolves the tool, derives the
//! per-request work root, and invokes the handler. Both outcomes - handler
//! value or handler error - are protocol successes: exactly one result
//! record is produced per dispatched event and cursors advance either way.

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use crate::event::{ToolErrorBody, ToolEvent, ToolRef, ToolResultRecord};
use crate::tools::fs::{self, ReadFileArgs, UpdateFileArgs, DEFAULT_READ_FILE_MAX_BYTES};
use crate::tools::shell::{
    self, RunCommandArgs, DEFAULT_OUTPUT_MAX_BYTES, DEFAULT_RUN_COMMAND_TIMEOUT,
};
use crate::tools::{ToolError, ToolName};
use crate::workroot::{TemplateVars, WorkRoot, WorkRootSpec};

/// Tool execution limits.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Cap on bytes returned by `READ_FILE`.
    pub read_file_max_bytes: usize,
    /// Cap on combined subprocess output bytes.
    pub output_max_bytes: usize,
    /// Subprocess ceiling for `RUN_COMMAND`.
    pub run_command_timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            read_file_max_bytes: DEFAULT_READ_FILE_MAX_BYTES,
            output_max_bytes: DEFAULT_OUTPUT_MAX_BYTES,
            run_command_timeout: DEFAULT_RUN_COMMAND_TIMEOUT,
        }
    }
}

/// Identity of the request a stream serves; feeds the work-root template.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    /// User identifier.
    pub user_id: String,
    /// Project identifier.
    pub project_id: String,
    /// Workspace identifier (may be empty for project-wide streams).
    pub workspace_id: String,
    /// Session identifier (may be empty).
    pub session_id: String,
}

impl DispatchContext {
    fn vars(&self) -> TemplateVars<'_> {
        TemplateVars {
            user_id: &self.user_id,
            project_id: &self.project_id,
            workspace_id: &self.workspace_id,
            session_id: &self.session_id,
        }
    }
}

/// Routes events to tool handlers inside a per-request sandbox.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    spec: WorkRootSpec,
    config: ToolConfig,
}

impl Dispatcher {
    /// Creates a dispatcher with the given work-root spec and limits.
    #[must_use]
    pub fn new(spec: WorkRootSpec, config: ToolConfig) -> Self {
        Self { spec, config }
    }

    /// Returns the configured limits.
    #[must_use]
    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Derives (and creates) the work root for a request context.
    ///
    /// # Errors
    ///
    /// Surfaces work-root derivation failures; the dispatch path maps them
    /// to `workroot_unavailable` tool errors.
    pub async fn work_root(&self, ctx: &DispatchContext) -> relay_core::Result<WorkRoot> {
        WorkRoot::ensure(&self.spec, &ctx.vars()).await
    }

    /// Dispatches one event, producing exactly one result record.
    pub async fn dispatch(&self, event: &ToolEvent, ctx: &DispatchContext) -> ToolResultRecord {
        let (name, args) = match Self::parse_call(event) {
            Ok(parts) => parts,
            Err((name, args, err)) => return Self::record(event, name, args, Err(err)),
        };

        let outcome = self.invoke(&name, &args, ctx).await;
        Self::record(event, name.as_str().to_string(), args, outcome)
    }

    /// Extracts the tool name and normalized arguments from an event.
    ///
    /// Accepts arguments as an object or a JSON-encoded string; a string
    /// that fails to parse is rejected with `bad_arguments`.
    fn parse_call(event: &ToolEvent) -> Result<(ToolName, Value), (String, Value, ToolError)> {
        let Some(call) = event.tool_call.as_ref() else {
            return Err((
                String::new(),
                Value::Null,
                ToolError::new("missing_tool_call"),
            ));
        };

        let raw_name = call.function.name.clone();
        let args = match call.function.arguments.clone() {
            None => Value::Object(serde_json::Map::new()),
            Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => parsed,
                Err(_) => {
                    return Err((raw_name, Value::String(text), ToolError::bad_arguments()));
                }
            },
            Some(other) => other,
        };

        match raw_name.parse::<ToolName>() {
            Ok(name) => Ok((name, args)),
            Err(err) => Err((raw_name, args, err)),
        }
    }

    async fn invoke(
        &self,
        name: &ToolName,
        args: &Value,
        ctx: &DispatchContext,
    ) -> Result<Value, ToolError> {
        let root = match self.work_root(ctx).await {
            Ok(root) => root,
            Err(e) => {
                tracing::warn!(error = %e, "Work root unavailable");
                return Err(ToolError::workroot_unavailable());
            }
        };

        match name {
            ToolName::ReadFile => {
                let args: ReadFileArgs = typed_args(args)?;
                let output =
                    fs::read_file(&root, &args.filepath, self.config.read_file_max_bytes).await?;
                to_value(&output)
            }
            ToolName::UpdateFile => {
                let args: UpdateFileArgs = typed_args(args)?;
                let output = fs::update_file(&root, &args.filepath, &args.content).await?;
                to_value(&output)
            }
            ToolName::RunCommand => {
                let args: RunCommandArgs = typed_args(args)?;
                let output = shell::run_command(
                    &root,
                    &args.command,
                    self.config.run_command_timeout,
                    self.config.output_max_bytes,
                )
                .await?;
                to_value(&output)
            }
        }
    }

    fn record(
        event: &ToolEvent,
        tool_name: String,
        args: Value,
        outcome: Result<Value, ToolError>,
    ) -> ToolResultRecord {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(err) => (
                None,
                Some(ToolErrorBody {
                    message: err.message,
                }),
            ),
        };

        ToolResultRecord {
            event_id: event.id.clone(),
            create_time: event.create_time,
            tool: ToolRef { name: tool_name },
            args,
            result,
            error,
            timestamp: Utc::now(),
        }
    }
}

fn typed_args<T: serde::de::DeserializeOwned>(args: &Value) -> Result<T, ToolError> {
    serde_json::from_value(args.clone()).map_err(|_| ToolError::bad_arguments())
}

fn to_value<T: serde::Serialize>(output: &T) -> Result<Value, ToolError> {
    serde_json::to_value(output).map_err(|e| ToolError::new(format!("serialize result: {e}")))
}
