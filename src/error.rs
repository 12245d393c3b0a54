//! Error types for mcp-forge.
//!
//! Each subsystem has its own enum; [`BrokerError`] unifies them at the
//! boundary where failures are turned into structured payloads for the agent.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxError;

/// Registry store errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Alias '{0}' is already registered")]
    DuplicateAlias(String),

    #[error("Provider '{0}' not found")]
    NotFound(String),

    #[error("Registry document at {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize registry: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Sub-kinds of transport failure, as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportFailure {
    LaunchFailed,
    HandshakeTimeout,
    ProtocolError,
    PrematureExit,
    ConnectFailed,
    Timeout,
    BadStatus,
}

impl TransportFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportFailure::LaunchFailed => "launch-failed",
            TransportFailure::HandshakeTimeout => "handshake-timeout",
            TransportFailure::ProtocolError => "protocol-error",
            TransportFailure::PrematureExit => "premature-exit",
            TransportFailure::ConnectFailed => "connect-failed",
            TransportFailure::Timeout => "timeout",
            TransportFailure::BadStatus => "bad-status",
        }
    }
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a single provider session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to launch provider: {reason}")]
    LaunchFailed { reason: String },

    #[error("Provider did not finish the handshake within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Provider exited before responding ({status}){}", stderr_suffix(.stderr))]
    PrematureExit { status: String, stderr: String },

    #[error("Could not connect to provider: {reason}")]
    ConnectFailed { reason: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider returned HTTP {status}: {body}")]
    BadStatus { status: u16, body: String },

    /// The provider answered, but with an error of its own.
    #[error("Provider reported an error: {message}")]
    Remote {
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("; stderr: {}", stderr.trim())
    }
}

impl TransportError {
    /// The transport sub-kind, or `None` for tool-reported errors.
    pub fn failure(&self) -> Option<TransportFailure> {
        match self {
            TransportError::LaunchFailed { .. } => Some(TransportFailure::LaunchFailed),
            TransportError::HandshakeTimeout(_) => Some(TransportFailure::HandshakeTimeout),
            TransportError::Protocol { .. } => Some(TransportFailure::ProtocolError),
            TransportError::PrematureExit { .. } => Some(TransportFailure::PrematureExit),
            TransportError::ConnectFailed { .. } => Some(TransportFailure::ConnectFailed),
            TransportError::Timeout(_) => Some(TransportFailure::Timeout),
            TransportError::BadStatus { .. } => Some(TransportFailure::BadStatus),
            TransportError::Remote { .. } => None,
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        TransportError::Protocol {
            reason: reason.into(),
        }
    }
}

/// Scaffold engine errors.
#[derive(Debug, thiserror::Error)]
pub enum ScaffoldError {
    #[error("Alias '{0}' is already registered or its directory exists")]
    DuplicateAlias(String),

    #[error("Unknown template '{name}' (available: {available})")]
    UnknownTemplate { name: String, available: String },

    #[error("Invalid tool name '{0}': must be an identifier")]
    InvalidToolName(String),

    #[error("Could not detect a provider in {path}: {reason}")]
    Detection { path: PathBuf, reason: String },

    #[error("Fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Provider '{0}' not found")]
    NotFound(String),

    #[error("Provider '{0}' is external; only managed providers have source to edit")]
    ExternalProvider(String),

    #[error("Scaffold I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Build engine errors.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Provider '{0}' not found")]
    NotFound(String),

    #[error("Provider '{0}' is external; nothing to build")]
    ExternalProvider(String),

    #[error("A build for '{0}' is already in progress")]
    InProgress(String),

    #[error("Build of '{0}' was cancelled before it completed")]
    Cancelled(String),

    #[error("Build of '{alias}' failed: {reason}{}", output_suffix(.output))]
    Failed {
        alias: String,
        reason: String,
        output: String,
    },

    #[error("Build of '{alias}' failed: {source}")]
    Sandbox {
        alias: String,
        #[source]
        source: SandboxError,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn output_suffix(output: &str) -> String {
    if output.trim().is_empty() {
        String::new()
    } else {
        format!("\n{}", output.trim_end())
    }
}

/// Agent-facing channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error kinds surfaced to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidDescriptor,
    DuplicateAlias,
    NotFound,
    TransportError,
    ToolError,
    UnknownTemplate,
    DetectionError,
    ExternalProvider,
    BuildFailed,
    BuildInProgress,
    InvalidArguments,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidDescriptor => "invalid_descriptor",
            ErrorKind::DuplicateAlias => "duplicate_alias",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ToolError => "tool_error",
            ErrorKind::UnknownTemplate => "unknown_template",
            ErrorKind::DetectionError => "detection_error",
            ErrorKind::ExternalProvider => "external_provider",
            ErrorKind::BuildFailed => "build_failed",
            ErrorKind::BuildInProgress => "build_in_progress",
            ErrorKind::InvalidArguments => "invalid_arguments",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any failure of a broker operation.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("'{alias}': {source}")]
    Transport {
        alias: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Scaffold(#[from] ScaffoldError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn transport(alias: impl Into<String>, source: TransportError) -> Self {
        BrokerError::Transport {
            alias: alias.into(),
            source,
        }
    }

    /// Classify the error for the agent.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::Registry(e) => registry_kind(e),
            BrokerError::Transport { source, .. } => match source {
                TransportError::Remote { .. } => ErrorKind::ToolError,
                _ => ErrorKind::TransportError,
            },
            BrokerError::Scaffold(e) => match e {
                ScaffoldError::DuplicateAlias(_) => ErrorKind::DuplicateAlias,
                ScaffoldError::UnknownTemplate { .. } => ErrorKind::UnknownTemplate,
                ScaffoldError::InvalidToolName(_) => ErrorKind::InvalidArguments,
                ScaffoldError::Detection { .. } => ErrorKind::DetectionError,
                ScaffoldError::Fetch { .. } => ErrorKind::DetectionError,
                ScaffoldError::NotFound(_) => ErrorKind::NotFound,
                ScaffoldError::ExternalProvider(_) => ErrorKind::ExternalProvider,
                ScaffoldError::Io(_) => ErrorKind::Internal,
                ScaffoldError::Registry(e) => registry_kind(e),
            },
            BrokerError::Build(e) => match e {
                BuildError::NotFound(_) => ErrorKind::NotFound,
                BuildError::ExternalProvider(_) => ErrorKind::ExternalProvider,
                BuildError::InProgress(_) => ErrorKind::BuildInProgress,
                BuildError::Failed { .. }
                | BuildError::Sandbox { .. }
                | BuildError::Cancelled(_) => ErrorKind::BuildFailed,
                BuildError::Registry(e) => registry_kind(e),
            },
            BrokerError::InvalidArguments(_) => ErrorKind::InvalidArguments,
            BrokerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Transport sub-kind, when this is a transport failure.
    pub fn transport_failure(&self) -> Option<TransportFailure> {
        match self {
            BrokerError::Transport { source, .. } => source.failure(),
            _ => None,
        }
    }
}

fn registry_kind(err: &RegistryError) -> ErrorKind {
    match err {
        RegistryError::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
        RegistryError::DuplicateAlias(_) => ErrorKind::DuplicateAlias,
        RegistryError::NotFound(_) => ErrorKind::NotFound,
        RegistryError::Corrupt { .. } | RegistryError::Io { .. } | RegistryError::Serialize(_) => {
            ErrorKind::Internal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        let err = BrokerError::from(RegistryError::DuplicateAlias("weather".into()));
        assert_eq!(err.kind(), ErrorKind::DuplicateAlias);

        let err = BrokerError::from(ScaffoldError::Registry(RegistryError::NotFound("x".into())));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = BrokerError::from(BuildError::InProgress("x".into()));
        assert_eq!(err.kind(), ErrorKind::BuildInProgress);
        assert_eq!(err.kind().as_str(), "build_in_progress");
    }

    #[test]
    fn test_transport_sub_kinds() {
        let err = BrokerError::transport("w", TransportError::HandshakeTimeout(Duration::from_secs(1)));
        assert_eq!(err.kind(), ErrorKind::TransportError);
        assert_eq!(
            err.transport_failure().map(|f| f.as_str()),
            Some("handshake-timeout")
        );

        let err = BrokerError::transport(
            "w",
            TransportError::Remote {
                code: Some(-32602),
                message: "bad city".into(),
                data: None,
            },
        );
        assert_eq!(err.kind(), ErrorKind::ToolError);
        assert!(err.transport_failure().is_none());
    }

    #[test]
    fn test_premature_exit_message_includes_stderr() {
        let err = TransportError::PrematureExit {
            status: "exit status: 1".into(),
            stderr: "ModuleNotFoundError: fastmcp\n".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit status: 1"));
        assert!(msg.contains("ModuleNotFoundError"));
    }
}
