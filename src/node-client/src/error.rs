// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Structured errors for node operations.
//!
//! Every failure that can reach a caller is classified into an
//! [`ErrorKind`] carrying a category, a severity, a retryable flag, and a
//! set of recommended recovery strategies. The retry engine, the circuit
//! breakers, and the recovery manager all make decisions from these fields
//! rather than from raw transport errors.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tonic::{Code, Status};
use warden_proto::TryFromProtoError;
use warden_service::types::NodeId;

/// Broad classification used for metrics and propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Service,
    Timeout,
    Authentication,
    Configuration,
    Resource,
    Protocol,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Service => "service",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity for prioritization and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// Recovery actions recommended for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryStrategy {
    Retry,
    Reconnect,
    Fallback,
    Degrade,
    Escalate,
    CircuitBreak,
}

/// The concrete failure, with a human-readable detail string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    // Network.
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),
    #[error("network unstable: {0}")]
    NetworkUnstable(String),
    #[error("container network issue: {0}")]
    ContainerNetwork(String),

    // Service.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("service overloaded: {0}")]
    ServiceOverloaded(String),
    #[error("service degraded: {0}")]
    ServiceDegraded(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    // Timeout.
    #[error("operation timeout: {0}")]
    OperationTimeout(String),
    #[error("stream timeout: {0}")]
    StreamTimeout(String),
    #[error("health check timeout: {0}")]
    HealthCheckTimeout(String),

    // Authentication.
    #[error("TLS failure: {0}")]
    Ssl(String),
    #[error("certificate expired: {0}")]
    CertificateExpired(String),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    // Configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),
    #[error("configuration validation failed: {0}")]
    ConfigurationValidation(String),

    // Resource.
    #[error("memory exhaustion: {0}")]
    MemoryExhaustion(String),
    #[error("disk space low: {0}")]
    DiskSpace(String),
    #[error("cpu overload: {0}")]
    CpuOverload(String),
    #[error("container restart detected: {0}")]
    ContainerRestart(String),

    // Protocol.
    #[error("grpc failure: {0}")]
    Grpc(String),
    #[error("protocol version mismatch: {0}")]
    VersionMismatch(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            Connection(_) | ConnectionTimeout(_) | NetworkUnstable(_) | ContainerNetwork(_) => {
                ErrorCategory::Network
            }
            ServiceUnavailable(_) | ServiceOverloaded(_) | ServiceDegraded(_) | Backend(_)
            | CircuitOpen(_) => ErrorCategory::Service,
            OperationTimeout(_) | StreamTimeout(_) | HealthCheckTimeout(_) => {
                ErrorCategory::Timeout
            }
            Ssl(_) | CertificateExpired(_) | InvalidCredentials(_) => {
                ErrorCategory::Authentication
            }
            InvalidConfiguration(_) | MissingConfiguration(_) | ConfigurationValidation(_) => {
                ErrorCategory::Configuration
            }
            MemoryExhaustion(_) | DiskSpace(_) | CpuOverload(_) | ContainerRestart(_) => {
                ErrorCategory::Resource
            }
            Grpc(_) | VersionMismatch(_) | StreamInterrupted(_) => ErrorCategory::Protocol,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        use ErrorKind::*;
        match self {
            Ssl(_) | CertificateExpired(_) | InvalidCredentials(_) | MissingConfiguration(_)
            | MemoryExhaustion(_) => ErrorSeverity::Critical,
            Connection(_) | NetworkUnstable(_) | ContainerNetwork(_) | ServiceUnavailable(_)
            | Backend(_) | CircuitOpen(_) | InvalidConfiguration(_)
            | ConfigurationValidation(_) | DiskSpace(_) | ContainerRestart(_)
            | VersionMismatch(_) => ErrorSeverity::High,
            ConnectionTimeout(_) | ServiceOverloaded(_) | ServiceDegraded(_)
            | OperationTimeout(_) | StreamTimeout(_) | CpuOverload(_) | Grpc(_)
            | StreamInterrupted(_) => ErrorSeverity::Medium,
            HealthCheckTimeout(_) => ErrorSeverity::Low,
        }
    }

    pub fn retryable(&self) -> bool {
        use ErrorKind::*;
        !matches!(
            self,
            ServiceDegraded(_)
                | CircuitOpen(_)
                | Ssl(_)
                | CertificateExpired(_)
                | InvalidCredentials(_)
                | InvalidConfiguration(_)
                | MissingConfiguration(_)
                | ConfigurationValidation(_)
                | VersionMismatch(_)
        )
    }

    pub fn strategies(&self) -> &'static [RecoveryStrategy] {
        use ErrorKind::*;
        use RecoveryStrategy::*;
        match self {
            Connection(_) => &[Reconnect, Retry],
            ConnectionTimeout(_) => &[Retry, Reconnect],
            NetworkUnstable(_) => &[Retry, CircuitBreak],
            ContainerNetwork(_) => &[Reconnect, Escalate],
            ServiceUnavailable(_) => &[Retry, CircuitBreak, Fallback],
            ServiceOverloaded(_) => &[Retry, Degrade],
            ServiceDegraded(_) => &[Degrade, Fallback],
            Backend(_) => &[Retry, Escalate],
            CircuitOpen(_) => &[Fallback, Degrade],
            OperationTimeout(_) => &[Retry],
            StreamTimeout(_) => &[Reconnect, Retry],
            HealthCheckTimeout(_) => &[Retry, Degrade],
            Ssl(_) | CertificateExpired(_) | InvalidCredentials(_) => &[Escalate],
            InvalidConfiguration(_) | MissingConfiguration(_) | ConfigurationValidation(_) => {
                &[Escalate]
            }
            MemoryExhaustion(_) | DiskSpace(_) => &[Degrade, Escalate],
            CpuOverload(_) => &[Degrade, Retry],
            ContainerRestart(_) => &[Reconnect, Retry],
            Grpc(_) => &[Retry, Reconnect],
            VersionMismatch(_) => &[Escalate],
            StreamInterrupted(_) => &[Reconnect, Retry],
        }
    }
}

/// Context attached to a structured error for logs and metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub node_id: Option<NodeId>,
    pub operation: Option<String>,
    pub attempt: u32,
    pub remote_address: Option<String>,
    pub duration: Option<Duration>,
    pub metadata: BTreeMap<String, String>,
}

/// A classified failure of a node operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}")]
pub struct NodeError {
    pub kind: ErrorKind,
    pub context: ErrorContext,
}

impl NodeError {
    pub fn new(kind: ErrorKind) -> Self {
        NodeError {
            kind,
            context: ErrorContext::default(),
        }
    }

    pub fn for_node(mut self, node_id: NodeId) -> Self {
        self.context.node_id = Some(node_id);
        self
    }

    pub fn during(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = Some(operation.into());
        self
    }

    pub fn at(mut self, remote_address: impl Into<String>) -> Self {
        self.context.remote_address = Some(remote_address.into());
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    pub fn severity(&self) -> ErrorSeverity {
        self.kind.severity()
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn strategies(&self) -> &'static [RecoveryStrategy] {
        self.kind.strategies()
    }

    pub fn supports(&self, strategy: RecoveryStrategy) -> bool {
        self.strategies().contains(&strategy)
    }

    /// Classifies a gRPC status returned by a node.
    pub fn from_status(status: &Status) -> Self {
        let detail = status.message().to_owned();
        let kind = match status.code() {
            Code::Unavailable => ErrorKind::ServiceUnavailable(detail),
            Code::DeadlineExceeded => ErrorKind::OperationTimeout(detail),
            Code::ResourceExhausted => ErrorKind::ServiceOverloaded(detail),
            Code::Unauthenticated | Code::PermissionDenied => {
                ErrorKind::InvalidCredentials(detail)
            }
            Code::InvalidArgument | Code::FailedPrecondition => {
                ErrorKind::ConfigurationValidation(detail)
            }
            Code::Aborted => ErrorKind::StreamInterrupted(detail),
            Code::Internal => ErrorKind::Backend(detail),
            _ => ErrorKind::Grpc(format!("{}: {}", status.code(), status.message())),
        };
        NodeError::new(kind)
    }

    /// Classifies a transport-level failure from its message text.
    pub fn from_transport(err: &tonic::transport::Error) -> Self {
        NodeError::new(classify_failure_text(&err.to_string()))
    }

    /// Classifies a wire-decoding failure.
    pub fn from_decode(err: TryFromProtoError) -> Self {
        NodeError::new(ErrorKind::Grpc(format!("malformed response: {err}")))
    }
}

/// Maps failure text to an error kind using the textual patterns transport
/// errors actually produce.
pub fn classify_failure_text(text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    if lower.contains("certificate") && lower.contains("expired") {
        ErrorKind::CertificateExpired(text.to_owned())
    } else if lower.contains("certificate")
        || lower.contains("tls")
        || lower.contains("ssl")
        || lower.contains("handshake")
    {
        ErrorKind::Ssl(text.to_owned())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::ConnectionTimeout(text.to_owned())
    } else if lower.contains("network is unreachable") || lower.contains("no route to host") {
        ErrorKind::NetworkUnstable(text.to_owned())
    } else {
        ErrorKind::Connection(text.to_owned())
    }
}

/// Failure-text patterns that suggest the node's container restarted rather
/// than a transient network blip.
pub fn container_restart_suspected(text: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "connection refused",
        "network unreachable",
        "network is unreachable",
        "connection reset",
        "broken pipe",
        "no route to host",
        "connection aborted",
        "connection closed by peer",
    ];
    let lower = text.to_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_follows_code_map() {
        let cases = [
            (Code::Unavailable, ErrorCategory::Service, true),
            (Code::DeadlineExceeded, ErrorCategory::Timeout, true),
            (Code::ResourceExhausted, ErrorCategory::Service, true),
            (Code::Unauthenticated, ErrorCategory::Authentication, false),
            (Code::PermissionDenied, ErrorCategory::Authentication, false),
            (Code::InvalidArgument, ErrorCategory::Configuration, false),
            (Code::FailedPrecondition, ErrorCategory::Configuration, false),
            (Code::Aborted, ErrorCategory::Protocol, true),
            (Code::Internal, ErrorCategory::Service, true),
        ];
        for (code, category, retryable) in cases {
            let err = NodeError::from_status(&Status::new(code, "boom"));
            assert_eq!(err.category(), category, "code {code:?}");
            assert_eq!(err.retryable(), retryable, "code {code:?}");
        }
    }

    #[test]
    fn text_classification_patterns() {
        assert!(matches!(
            classify_failure_text("tcp connect error: connection timed out"),
            ErrorKind::ConnectionTimeout(_)
        ));
        assert!(matches!(
            classify_failure_text("connect error: Connection refused (os error 111)"),
            ErrorKind::Connection(_)
        ));
        assert!(matches!(
            classify_failure_text("Network is unreachable (os error 101)"),
            ErrorKind::NetworkUnstable(_)
        ));
        assert!(matches!(
            classify_failure_text("invalid peer certificate: Expired certificate expired"),
            ErrorKind::CertificateExpired(_)
        ));
        assert!(matches!(
            classify_failure_text("tls handshake eof"),
            ErrorKind::Ssl(_)
        ));
    }

    #[test]
    fn circuit_open_is_never_retryable() {
        let err = NodeError::new(ErrorKind::CircuitOpen("user_sync".into()));
        assert!(!err.retryable());
        assert!(err.supports(RecoveryStrategy::Fallback));
        assert!(!err.supports(RecoveryStrategy::Retry));
    }

    #[test]
    fn restart_patterns() {
        assert!(container_restart_suspected(
            "transport error: Connection reset by peer"
        ));
        assert!(container_restart_suspected("connection refused"));
        assert!(!container_restart_suspected("deadline exceeded"));
    }
}
