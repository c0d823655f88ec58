//! Error taxonomy for the construction engine, tools, and hook processor.
//!
//! `BuildError` is the top-level failure mode of an engine invocation;
//! everything else either is a `BuildError` variant or converts into one at
//! the boundary where it stops being retriable.

use std::fmt;

/// Classification assigned to a failed HTTP attempt, driving [`crate::retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// No retry: 4xx other than 408, certificate errors.
    Terminal,
    /// Retry, but extend the backoff schedule by one slot (HTTP 503).
    RetriableForever,
    /// Retry within the existing schedule: connection errors, timeouts,
    /// 5xx other than 503, 404, 408, checksum mismatch.
    Retriable,
}

/// Error raised by the HTTP client after classification.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub mode: RetryMode,
}

impl RemoteError {
    pub fn new(mode: RetryMode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            mode,
        }
    }
}

/// MD5/ETag mismatch while streaming an S3 response body. Always retriable.
#[derive(Debug, thiserror::Error)]
#[error("checksum mismatch: expected {expected}, got {actual}")]
pub struct ChecksumError {
    pub expected: String,
    pub actual: String,
}

impl From<ChecksumError> for RemoteError {
    fn from(e: ChecksumError) -> Self {
        RemoteError::new(RetryMode::Retriable, e.to_string())
    }
}

/// Error raised by a [`crate::tool::Tool`] implementation.
#[derive(Debug, thiserror::Error)]
#[error("{tool} failed: {message}")]
pub struct ToolError {
    pub tool: String,
    pub message: String,
    pub exit_code: Option<i32>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ToolError {
    pub fn new(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            message: message.into(),
            exit_code: None,
            source: None,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

/// Context frame attached to a `BuildError` as it propagates up through the
/// engine, so the top-level `Display` can print
/// `configSet -> config -> tool -> command`.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    pub config_set: Option<String>,
    pub config: Option<String>,
    pub tool: Option<String>,
    pub command: Option<String>,
}

impl fmt::Display for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = [&self.config_set, &self.config, &self.tool, &self.command]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .collect();
        write!(f, "{}", parts.join(" -> "))
    }
}

/// Top-level failure of an engine invocation. Fatal: the build aborts.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no such config: {0}")]
    NoSuchConfig(String),

    #[error("no such configSet: {0}")]
    NoSuchConfigSet(String),

    #[error("circular configSet dependency involving: {0:?}")]
    CircularConfigSetDependency(Vec<String>),

    #[error("[{context}] {source}")]
    Tool {
        context: BuildContext,
        #[source]
        source: ToolError,
    },

    #[error("invalid model: {0}")]
    InvalidModel(String),
}

/// Error raised while resolving or evaluating a hook's path. Propagates and
/// aborts the current poll tick (unlike any other hook-processing error,
/// which is caught and logged).
#[derive(Debug, thiserror::Error)]
#[error("invalid hook path {path:?}: {message}")]
pub struct UpdateError {
    pub path: String,
    pub message: String,
}

impl UpdateError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}
