//! Structured operation results.
//!
//! Every caller-facing operation returns an `OperationReport`: success flag, an
//! optional error `{kind, message}`, advisory warnings and the log narrative.

use crate::error::WardenError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How much a failed step matters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Ends the operation
    Fatal,
    /// Logged and reported, primary outcome stands
    Advisory,
}

/// A step that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub step: String,
    pub severity: Severity,
    pub message: String,
}

impl StepFailure {
    pub fn advisory(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            severity: Severity::Advisory,
            message: message.into(),
        }
    }

    pub fn fatal(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            severity: Severity::Fatal,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&WardenError> for ErrorInfo {
    fn from(err: &WardenError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationReport {
    pub id: String,
    pub operation: String,
    pub target: String,
    pub success: bool,
    /// True when the target was already in the requested state
    #[serde(default)]
    pub unchanged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default)]
    pub warnings: Vec<StepFailure>,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl OperationReport {
    pub fn begin(operation: &str, target: &str) -> Self {
        let now = Utc::now();
        Self {
            id: format!("op_{}", uuid::Uuid::new_v4()),
            operation: operation.to_string(),
            target: target.to_string(),
            success: false,
            unchanged: false,
            error: None,
            warnings: Vec::new(),
            log: Vec::new(),
            data: None,
            started_at: now,
            finished_at: now,
        }
    }

    pub fn succeed(mut self) -> Self {
        self.success = true;
        self.error = None;
        self.finished_at = Utc::now();
        self
    }

    pub fn fail(mut self, err: &WardenError) -> Self {
        self.success = false;
        self.error = Some(ErrorInfo::from(err));
        self.finished_at = Utc::now();
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<StepFailure>) -> Self {
        self.warnings.extend(warnings);
        self
    }

    pub fn with_log(mut self, log: Vec<String>) -> Self {
        self.log = log;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn error_kind(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.kind.as_str())
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let verdict = match (&self.error, self.unchanged) {
            (Some(e), _) => format!("FAILED ({}): {}", e.kind, e.message),
            (None, true) => "OK (already in desired state)".to_string(),
            (None, false) => "OK".to_string(),
        };
        let mut line = format!("{} {}: {}", self.operation, self.target, verdict);
        if !self.warnings.is_empty() {
            line.push_str(&format!(" [{} warning(s)]", self.warnings.len()));
        }
        line
    }
}
