//! Error types for hostwarden.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Component '{id}' is protected and cannot be {action}")]
    ProtectedResourceViolation { id: String, action: String },

    #[error("Missing dependency: {0}")]
    DependencyMissing(String),

    #[error("Upstream rate limit while running {program}: {detail}")]
    ExternalRateLimited { program: String, detail: String },

    #[error("{stack} stack failed during {phase} ({step}): {message}")]
    PartialStepFailure {
        stack: String,
        phase: String,
        step: String,
        completed: Vec<String>,
        message: String,
    },

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Template syntax error in {template}: {message}")]
    TemplateSyntax { template: String, message: String },

    #[error("Command '{command}' failed (exit {exit_code:?}): {stderr}")]
    Command {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WardenError {
    /// Stable identifier used in structured results.
    pub fn kind(&self) -> &'static str {
        match self {
            WardenError::UnknownComponent(_) => "unknown_component",
            WardenError::ProtectedResourceViolation { .. } => "protected_resource_violation",
            WardenError::DependencyMissing(_) => "dependency_missing",
            WardenError::ExternalRateLimited { .. } => "external_rate_limited",
            WardenError::PartialStepFailure { .. } => "partial_step_failure",
            WardenError::TemplateNotFound(_) => "template_not_found",
            WardenError::TemplateSyntax { .. } => "template_syntax",
            WardenError::Command { .. } => "command_failed",
            WardenError::Timeout { .. } => "command_timeout",
            WardenError::InvalidInput(_) => "invalid_input",
            WardenError::Config(_) => "config",
            WardenError::Io(_) => "io",
            WardenError::Json(_) => "json",
        }
    }

    pub fn protected(id: impl Into<String>, action: impl Into<String>) -> Self {
        WardenError::ProtectedResourceViolation {
            id: id.into(),
            action: action.into(),
        }
    }

    /// Wrap an error raised inside a stack phase, keeping the steps already done.
    pub fn partial(
        stack: impl Into<String>,
        phase: impl Into<String>,
        step: impl Into<String>,
        completed: Vec<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        WardenError::PartialStepFailure {
            stack: stack.into(),
            phase: phase.into(),
            step: step.into(),
            completed,
            message: cause.to_string(),
        }
    }
}

pub type WardenResult<T> = Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_stable() {
        assert_eq!(
            WardenError::UnknownComponent("x".into()).kind(),
            "unknown_component"
        );
        assert_eq!(
            WardenError::protected("openssh", "removed").kind(),
            "protected_resource_violation"
        );
    }

    #[test]
    fn test_partial_keeps_completed_steps() {
        let err = WardenError::partial(
            "mail",
            "install",
            "dovecot",
            vec!["postfix".into()],
            "exit 100",
        );
        match &err {
            WardenError::PartialStepFailure { completed, step, .. } => {
                assert_eq!(completed, &vec!["postfix".to_string()]);
                assert_eq!(step, "dovecot");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("mail stack failed during install"));
    }
}
