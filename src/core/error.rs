// This module defines the error type shared by every stage of the JIT using the thiserror
// crate. JitError covers the whole taxonomy: front-end parse failures, duplicate symbol or
// namespace definitions, optimization/compile/link failures that fail a materialization
// responsibility, failed lookups, resource tracker misuse, operations on a closed session,
// dependency cycles between in-flight responsibilities and fatal lazy-compilation failures.
// Errors are Clone so a single failed responsibility can hand the same error to every
// thread that was waiting on one of its symbols. JitResult<T> is the convenience alias.

//! Error types for the JIT.

use thiserror::Error;

/// Main error type for session, layer and front-end operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JitError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("invalid module `{module}`: {reason}")]
    InvalidModule { module: String, reason: String },

    #[error("duplicate definition of `{name}` in namespace `{namespace}`")]
    DuplicateSymbol { name: String, namespace: String },

    #[error("namespace `{name}` already exists")]
    DuplicateNamespace { name: String },

    #[error("namespace `{name}` does not exist")]
    UnknownNamespace { name: String },

    #[error("optimization of `{module}` failed: {reason}")]
    Optimization { module: String, reason: String },

    #[error("compilation of `{module}` failed: {reason}")]
    Compile { module: String, reason: String },

    #[error("linking `{module}` failed: {reason}")]
    Link { module: String, reason: String },

    #[error("symbol `{name}` not found")]
    SymbolNotFound { name: String },

    #[error("resource tracker busy: {pending} symbol(s) still materializing")]
    ResourceBusy { pending: usize },

    #[error("resource tracker has been removed")]
    TrackerClosed,

    #[error("execution session is closed")]
    SessionClosed,

    #[error("circular dependency while resolving `{name}`")]
    CircularDependency { name: String },

    #[error("lazy compilation of `{symbol}` failed: {source}")]
    LazyCompileFailure {
        symbol: String,
        #[source]
        source: Box<JitError>,
    },

    #[error("i/o error on `{path}`: {message}")]
    Io { path: String, message: String },
}

impl JitError {
    pub fn link(module: impl Into<String>, reason: impl Into<String>) -> Self {
        JitError::Link {
            module: module.into(),
            reason: reason.into(),
        }
    }

    pub fn compile(module: impl Into<String>, reason: impl Into<String>) -> Self {
        JitError::Compile {
            module: module.into(),
            reason: reason.into(),
        }
    }

    /// True for the errors produced by a failing pipeline stage.
    pub fn is_pipeline_failure(&self) -> bool {
        matches!(
            self,
            JitError::Optimization { .. } | JitError::Compile { .. } | JitError::Link { .. }
        )
    }
}

/// Result type alias for JIT operations.
pub type JitResult<T> = Result<T, JitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_failure_keeps_source() {
        let err = JitError::LazyCompileFailure {
            symbol: "fib".to_string(),
            source: Box::new(JitError::compile("fib.part", "unsupported target")),
        };
        let text = err.to_string();
        assert!(text.contains("fib"));
        assert!(text.contains("unsupported target"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_pipeline_failure_classification() {
        assert!(JitError::link("m", "bad reloc").is_pipeline_failure());
        assert!(!JitError::SessionClosed.is_pipeline_failure());
        assert!(!JitError::SymbolNotFound { name: "x".into() }.is_pipeline_failure());
    }
}
