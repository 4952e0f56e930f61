//! Rule Engine Error Types

use thiserror::Error;

/// Result type for rule operations
pub type Result<T> = std::result::Result<T, RuleError>;

/// Rule engine errors
#[derive(Debug, Error)]
pub enum RuleError {
    /// Ruleset source could not be compiled (malformed source, missing
    /// required rule fields, type mismatches, sandbox violation)
    #[error("Compilation error: {0}")]
    Compilation(String),

    /// A rule condition or action failed during matching/firing
    #[error("Execution error: {0}")]
    Execution(String),

    /// Host-detected runaway firing cycle
    #[error("Loop error: {0}")]
    Loop(String),

    /// A deferred rule action could not be scheduled or failed at the
    /// firing boundary
    #[error("Scheduling error: {0}")]
    Scheduling(String),

    /// Structured source parsing error (declarative/flow formats)
    #[error("Rule parsing error: {0}")]
    Parse(String),

    /// Expression compilation or evaluation error (script formats)
    #[error("Expression error: {0}")]
    Expression(String),
}

impl From<serde_json::Error> for RuleError {
    fn from(err: serde_json::Error) -> Self {
        RuleError::Parse(err.to_string())
    }
}

impl From<evalexpr::EvalexprError> for RuleError {
    fn from(err: evalexpr::EvalexprError) -> Self {
        RuleError::Expression(err.to_string())
    }
}
