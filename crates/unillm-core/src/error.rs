//! Error types.
//!
//! Every transport, parser, and the tool-use loop surface failures through
//! [`LlmError`].  Each variant maps onto an [`ErrorKind`] so callers can
//! branch on the category without matching message text.

use std::fmt;

/// Coarse classification of an [`LlmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidCredentials,
    RateLimited,
    Network,
    InvalidRequest,
    InvalidResponse,
    ExecutableNotFound,
    CliExecution,
    CliParse,
    ToolExecution,
    TurnLimitExceeded,
    Cancelled,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidCredentials => "invalid-credentials",
            Self::RateLimited => "rate-limited",
            Self::Network => "network",
            Self::InvalidRequest => "invalid-request",
            Self::InvalidResponse => "invalid-response",
            Self::ExecutableNotFound => "executable-not-found",
            Self::CliExecution => "cli-execution",
            Self::CliParse => "cli-parse",
            Self::ToolExecution => "tool-execution",
            Self::TurnLimitExceeded => "turn-limit-exceeded",
            Self::Cancelled => "cancelled",
            Self::Config => "config",
        };
        write!(f, "{s}")
    }
}

/// Unified error type for providers, transports, and the tool-use loop.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    // -- Transport errors ----------------------------------------------------
    /// The provider rejected the credentials (HTTP 401/403 or an
    /// authentication error body).
    #[error("invalid credentials for {provider}: {message}")]
    InvalidCredentials { provider: String, message: String },

    /// The provider is throttling requests (HTTP 429 or a rate-limit body).
    #[error("rate limited by {provider}: {message}")]
    RateLimited { provider: String, message: String },

    /// The request could not be delivered, or the server failed.
    #[error("network error: {reason}")]
    Network {
        /// HTTP status, when the server answered at all.
        status: Option<u16>,
        reason: String,
    },

    /// The request was malformed before any call was made.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A success payload or stream could not be turned into a response.
    #[error("invalid response: {reason}")]
    InvalidResponse { reason: String },

    // -- Subprocess errors ---------------------------------------------------
    /// The CLI executable could not be located.
    #[error("executable not found: {name}")]
    ExecutableNotFound { name: String },

    /// The CLI process exited unsuccessfully.
    #[error("`{program}` exited with {status}: {stderr}")]
    CliExecution {
        program: String,
        status: String,
        stderr: String,
    },

    /// The CLI produced empty or unparseable output.
    #[error("could not parse CLI output: {reason}")]
    CliParse { reason: String },

    // -- Tool-use loop -------------------------------------------------------
    /// A tool invocation failed fatally (unknown tool, missing parameter).
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ToolExecution { tool_name: String, reason: String },

    /// The tool-use loop hit its turn cap without a final answer.
    #[error("tool-use loop exceeded max turns ({max_turns})")]
    TurnLimitExceeded { max_turns: u32 },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    // -- Configuration -------------------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidCredentials { .. } => ErrorKind::InvalidCredentials,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Network { .. } => ErrorKind::Network,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::InvalidResponse { .. } | Self::Json(_) => ErrorKind::InvalidResponse,
            Self::ExecutableNotFound { .. } => ErrorKind::ExecutableNotFound,
            Self::CliExecution { .. } => ErrorKind::CliExecution,
            Self::CliParse { .. } => ErrorKind::CliParse,
            Self::ToolExecution { .. } => ErrorKind::ToolExecution,
            Self::TurnLimitExceeded { .. } => ErrorKind::TurnLimitExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config { .. } => ErrorKind::Config,
        }
    }

    pub(crate) fn invalid_response(reason: impl Into<String>) -> Self {
        Self::InvalidResponse {
            reason: reason.into(),
        }
    }

    pub(crate) fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            status: None,
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, LlmError>;

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network {
            status: err.status().map(|s| s.as_u16()),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        let err = LlmError::TurnLimitExceeded { max_turns: 3 };
        assert_eq!(err.kind(), ErrorKind::TurnLimitExceeded);
        assert_eq!(err.to_string(), "tool-use loop exceeded max turns (3)");

        let err = LlmError::RateLimited {
            provider: "openai".into(),
            message: "slow down".into(),
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn json_errors_are_invalid_responses() {
        let err: LlmError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }
}
