//! File tools: `READ_FILE` and `UPDATE_FILE`.
//!
//! Reads are byte-capped with an explicit truncation flag. Writes replace
//! the target atomically (write to a sibling `*.tmp`, then rename) so a
//! concurrent read observes either the old or the new content, never a
//! partial file.

use serde::{Deserialize, Serialize};

use crate::tools::{ToolError, ToolResult};
use crate::workroot::WorkRoot;

/// Default cap on bytes returned by `READ_FILE`.
pub const DEFAULT_READ_FILE_MAX_BYTES: usize = 200_000;

/// Arguments for `READ_FILE`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadFileArgs {
    /// Path relative to the work root.
    pub filepath: String,
}

/// Output of `READ_FILE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileOutput {
    /// Always true on success.
    pub ok: bool,
    /// The path that was read, as supplied.
    pub filepath: String,
    /// UTF-8 content, capped at the configured maximum.
    pub content: String,
    /// True when the file exceeded the cap and was truncated.
    pub truncated: bool,
}

/// Arguments for `UPDATE_FILE`.
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateFileArgs {
    /// Path relative to the work root.
    pub filepath: String,
    /// Full replacement content.
    pub content: String,
}

/// Output of `UPDATE_FILE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFileOutput {
    /// Always true on success.
    pub ok: bool,
    /// The path that was written, as supplied.
    pub filepath: String,
    /// Bytes written.
    pub bytes: u64,
    /// Modification time of the written file, epoch milliseconds.
    pub mtime_ms: i64,
}

/// Reads a file inside the work root, capping the returned content.
///
/// # Errors
///
/// `path_escape` for escaping paths, `not_found` for missing files, and an
/// io message for other failures. All are tool errors (protocol successes).
pub async fn read_file(
    root: &WorkRoot,
    filepath: &str,
    max_bytes: usize,
) -> ToolResult<ReadFileOutput> {
    let path = root.resolve(filepath)?;

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ToolError::not_found());
        }
        Err(e) => return Err(ToolError::new(format!("read failed: {e}"))),
    };

    let truncated = bytes.len() > max_bytes;
    let slice = if truncated { &bytes[..max_bytes] } else { &bytes };

    Ok(ReadFileOutput {
        ok: true,
        filepath: filepath.to_string(),
        content: String::from_utf8_lossy(slice).into_owned(),
        truncated,
    })
}

/// Writes a file inside the work root, replacing it atomically.
///
/// Parent directories are created as needed. The content lands in a sibling
/// `*.tmp` first and is renamed over the target.
///
/// # Errors
///
/// `path_escape` for escaping paths, an io message for other failures.
pub async fn update_file(
    root: &WorkRoot,
    filepath: &str,
    content: &str,
) -> ToolResult<UpdateFileOutput> {
    let path = root.resolve(filepath)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ToolError::new(format!("create parent failed: {e}")))?;
    }

    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });

    tokio::fs::write(&tmp, content.as_bytes())
        .await
        .map_err(|e| ToolError::new(format!("write failed: {e}")))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| ToolError::new(format!("rename failed: {e}")))?;

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| ToolError::new(format!("stat failed: {e}")))?;
    let mtime_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as i64);

    Ok(UpdateFileOutput {
        ok: true,
        filepath: filepath.to_string(),
        bytes: content.len() as u64,
        mtime_ms,
    })
}
