use crate::error::{ChatError, Result};
use relay_llm::ContentPart;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// What happens to the tool calls a model asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolExecution {
    #[default]
    Auto,
    /// Every call is offered to the confirmation hook first.
    Confirm,
    /// Calls are returned to the caller and never executed.
    DryRun,
}

impl std::str::FromStr for ToolExecution {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "confirm" => Ok(Self::Confirm),
            "dry-run" | "dry_run" | "dryrun" => Ok(Self::DryRun),
            other => Err(ChatError::Validation(format!(
                "tool execution must be auto, confirm or dry-run, got {other:?}"
            ))),
        }
    }
}

impl std::fmt::Display for ToolExecution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Confirm => "confirm",
            Self::DryRun => "dry-run",
        })
    }
}

/// Per-call inputs for [`crate::Chat::ask`] and [`crate::Chat::stream`].
#[derive(Debug, Clone, Default)]
pub struct AskOptions {
    /// Local paths read at call time, or `http(s)://` references passed through.
    pub files: Vec<PathBuf>,
    pub attachments: Vec<ContentPart>,
    /// Spans every provider round and tool execution of the call.
    pub cancel: Option<CancellationToken>,
}

impl AskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn with_attachment(mut self, part: ContentPart) -> Self {
        self.attachments.push(part);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Files first, in the order given, then explicit attachments.
    pub(crate) async fn resolve_parts(&self) -> Result<Vec<ContentPart>> {
        let mut parts = Vec::with_capacity(self.files.len() + self.attachments.len());
        for path in &self.files {
            let display = path.to_string_lossy();
            let mime_type = mime_type_for(path);
            if display.starts_with("http://") || display.starts_with("https://") {
                parts.push(ContentPart::url(mime_type, display.into_owned()));
                continue;
            }
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| ChatError::Io(format!("{}: {e}", path.display())))?;
            tracing::debug!(path = %path.display(), bytes = bytes.len(), mime_type, "attachment loaded");
            parts.push(ContentPart::binary(mime_type, &bytes));
        }
        parts.extend(self.attachments.iter().cloned());
        Ok(parts)
    }
}

pub(crate) fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}
