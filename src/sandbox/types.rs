use serde::{Deserialize, Serialize};

use crate::agent::CodeFragment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub execution_timeout_ms: u64,
    pub table_max_rows: usize,
    pub table_max_columns: usize,
    pub max_output_chars: usize,
    pub max_repr_chars: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 30_000,
            table_max_rows: 20,
            table_max_columns: 12,
            max_output_chars: 4_000,
            max_repr_chars: 2_000,
        }
    }
}

impl SandboxLimits {
    pub fn execution_timeout_secs(&self) -> f64 {
        self.execution_timeout_ms as f64 / 1000.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: String,
    pub message: String,
}

/// Anything a fragment produced besides plain text output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    TextualTable {
        rows: usize,
        columns: usize,
        column_names: Vec<String>,
        preview: String,
        truncated: bool,
    },
    Image {
        format: String,
        data_base64: String,
        width: Option<u32>,
        height: Option<u32>,
    },
    RawValue {
        type_name: String,
        repr: String,
    },
}

impl Artifact {
    pub fn label(&self) -> &'static str {
        match self {
            Self::TextualTable { .. } => "table",
            Self::Image { .. } => "image",
            Self::RawValue { .. } => "value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<ExecutionError>,
    pub artifacts: Vec<Artifact>,
    pub succeeded: bool,
}

impl ExecutionResult {
    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            error: Some(ExecutionError {
                kind: kind.into(),
                message: message.into(),
            }),
            artifacts: Vec::new(),
            succeeded: false,
        }
    }
}

/// One executed fragment, tagged with the turn that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub turn: usize,
    pub fragment: CodeFragment,
    pub result: ExecutionResult,
}

/// Shape returned by the Python runtime helpers, before classification.
#[derive(Debug, Deserialize)]
pub(crate) struct RawExecution {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<ExecutionError>,
    pub artifacts: Vec<RawArtifact>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum RawArtifact {
    Table {
        rows: usize,
        columns: usize,
        column_names: Vec<String>,
        preview: String,
        truncated: bool,
    },
    Image {
        format: String,
        data_base64: String,
        width: Option<u32>,
        height: Option<u32>,
    },
    Value {
        type_name: String,
        repr: String,
        /// Length of the full repr; the helper only ships the first `max_repr_chars`.
        #[serde(default)]
        repr_chars: Option<usize>,
    },
}

impl RawExecution {
    pub(crate) fn classify(self, limits: &SandboxLimits) -> ExecutionResult {
        let artifacts = self
            .artifacts
            .into_iter()
            .map(|raw| classify_artifact(raw, limits))
            .collect();

        ExecutionResult {
            stdout: truncate_output(&self.stdout, limits.max_output_chars),
            stderr: truncate_output(&self.stderr, limits.max_output_chars),
            succeeded: self.error.is_none(),
            error: self.error,
            artifacts,
        }
    }
}

fn classify_artifact(raw: RawArtifact, limits: &SandboxLimits) -> Artifact {
    match raw {
        RawArtifact::Table {
            rows,
            columns,
            column_names,
            preview,
            truncated,
        } => Artifact::TextualTable {
            rows,
            columns,
            truncated: truncated
                || rows > limits.table_max_rows
                || columns > limits.table_max_columns,
            column_names: column_names
                .into_iter()
                .take(limits.table_max_columns)
                .collect(),
            preview: truncate_output(&preview, limits.max_output_chars),
        },
        RawArtifact::Image {
            format,
            data_base64,
            width,
            height,
        } => Artifact::Image {
            format,
            data_base64,
            width,
            height,
        },
        RawArtifact::Value {
            type_name,
            repr,
            repr_chars,
        } => {
            let shipped = repr.chars().count();
            let total = repr_chars.map_or(shipped, |total| total.max(shipped));
            Artifact::RawValue {
                type_name,
                repr: truncate_counted(&repr, total, limits.max_repr_chars),
            }
        }
    }
}

pub fn truncate_output(text: &str, max_chars: usize) -> String {
    truncate_counted(text, text.chars().count(), max_chars)
}

fn truncate_counted(text: &str, total: usize, max_chars: usize) -> String {
    if total <= max_chars {
        return text.to_string();
    }

    let kept = text.chars().take(max_chars).collect::<String>();
    format!("{kept}…[truncated {} chars]", total - max_chars)
}
