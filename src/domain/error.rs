//! Domain error types.

use serde::Serialize;
use std::fmt;

/// A parse error with line/column information for strategy source.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("syntax error at line {line}, column {column}: {message}")]
pub struct ParseError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
        }
    }

    /// Format the error with the offending source line and a caret under the column.
    pub fn display_with_context(&self, input: &str) -> String {
        let source_line = input
            .lines()
            .nth(self.line.saturating_sub(1))
            .unwrap_or_default();
        let caret = " ".repeat(self.column.saturating_sub(1)) + "^";
        format!("{source_line}\n{caret}\n{self}")
    }
}

/// Why a sandboxed execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The wall-clock alarm fired.
    Timeout,
    /// The worker thread used more CPU time than allowed.
    CpuTimeExceeded,
    /// The script allocated more than its memory budget.
    MemoryExceeded,
    /// Nested calls went deeper than the sandbox permits.
    RecursionLimit,
    /// The strategy's own logic raised an error.
    Runtime,
    /// The script finished but its trades/equity could not be read.
    InvalidOutput,
    /// The sandbox itself failed (interpreter panic, alarm thread spawn failure).
    Internal,
}

impl ExecutionErrorKind {
    pub fn is_resource_breach(self) -> bool {
        matches!(
            self,
            ExecutionErrorKind::Timeout
                | ExecutionErrorKind::CpuTimeExceeded
                | ExecutionErrorKind::MemoryExceeded
                | ExecutionErrorKind::RecursionLimit
        )
    }
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::CpuTimeExceeded => "cpu time exceeded",
            ExecutionErrorKind::MemoryExceeded => "memory exceeded",
            ExecutionErrorKind::RecursionLimit => "recursion limit",
            ExecutionErrorKind::Runtime => "runtime error",
            ExecutionErrorKind::InvalidOutput => "invalid output",
            ExecutionErrorKind::Internal => "internal error",
        };
        f.write_str(label)
    }
}

/// An error captured at the sandbox boundary and carried on an outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub line: Option<usize>,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            line: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Runtime, message)
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::InvalidOutput, message)
    }

    /// Attach a source line unless an inner frame already did.
    pub fn with_line(mut self, line: usize) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} at line {}: {}", self.kind, line, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ExecutionError {}

/// Top-level error type for stratbox.
#[derive(Debug, thiserror::Error)]
pub enum StratboxError {
    #[error("strategy rejected: {reason}")]
    Validation { reason: String },

    #[error("strategy execution failed: {0}")]
    Execution(ExecutionError),

    #[error("strategy produced zero trades over {bars} bars")]
    DegenerateResult { bars: usize },

    #[error("execution engine is closed")]
    EngineClosed,

    #[error("execution worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("data error: {reason}")]
    Data { reason: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ExecutionError> for StratboxError {
    fn from(err: ExecutionError) -> Self {
        StratboxError::Execution(err)
    }
}

impl StratboxError {
    /// Process exit status used by the CLI for this failure class.
    pub fn exit_status(&self) -> u8 {
        match self {
            StratboxError::Io(_) | StratboxError::Json(_) => 1,
            StratboxError::ConfigParse { .. } | StratboxError::ConfigInvalid { .. } => 2,
            StratboxError::Data { .. } => 3,
            StratboxError::Validation { .. } => 4,
            StratboxError::Execution(_) => 5,
            StratboxError::DegenerateResult { .. } => 6,
            StratboxError::EngineClosed | StratboxError::WorkerUnavailable { .. } => 7,
        }
    }
}

impl From<&StratboxError> for std::process::ExitCode {
    fn from(err: &StratboxError) -> Self {
        std::process::ExitCode::from(err.exit_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_display() {
        let err = ParseError::new("expected ':'", 2, 7);
        assert_eq!(
            err.to_string(),
            "syntax error at line 2, column 7: expected ':'"
        );
    }

    #[test]
    fn parse_error_context_points_at_column() {
        let err = ParseError::new("expected ':'", 2, 5);
        let rendered = err.display_with_context("x = 1\nif x\n");
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("if x"));
        assert_eq!(lines.next(), Some("    ^"));
    }

    #[test]
    fn execution_error_line_is_sticky() {
        let err = ExecutionError::runtime("division by zero")
            .with_line(3)
            .with_line(9);
        assert_eq!(err.line, Some(3));
        assert_eq!(err.to_string(), "runtime error at line 3: division by zero");
    }

    #[test]
    fn resource_breach_kinds() {
        assert!(ExecutionErrorKind::Timeout.is_resource_breach());
        assert!(ExecutionErrorKind::MemoryExceeded.is_resource_breach());
        assert!(!ExecutionErrorKind::Runtime.is_resource_breach());
        assert!(!ExecutionErrorKind::InvalidOutput.is_resource_breach());
    }

    #[test]
    fn exit_codes_distinguish_failure_classes() {
        let validation = StratboxError::Validation {
            reason: "x".into(),
        };
        let degenerate = StratboxError::DegenerateResult { bars: 10 };
        assert_eq!(validation.exit_status(), 4);
        assert_eq!(degenerate.exit_status(), 6);
        assert_eq!(StratboxError::EngineClosed.exit_status(), 7);
    }
}
