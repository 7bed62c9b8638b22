// Failure classification and credential redaction

use crate::errors::RawConnectionError;
use crate::models::{ConnectionProfile, ProfilePublicInfo};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

const REDACTED: &str = "***";

/// Closed taxonomy of connection failures surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NetworkUnreachable,
    ConnectionRefused,
    Timeout,
    TlsHandshakeFailed,
    AuthenticationFailed,
    AuthorizationDenied,
    ProtocolError,
    TopologyDiscoveryFailed,
    Unknown,
    /// Produced by the facade when the provider has no such profile
    ProfileNotFound,
    /// Produced by the facade when the request context is incomplete
    InvalidRequest,
}

impl FailureKind {
    pub const ALL: [FailureKind; 11] = [
        FailureKind::NetworkUnreachable,
        FailureKind::ConnectionRefused,
        FailureKind::Timeout,
        FailureKind::TlsHandshakeFailed,
        FailureKind::AuthenticationFailed,
        FailureKind::AuthorizationDenied,
        FailureKind::ProtocolError,
        FailureKind::TopologyDiscoveryFailed,
        FailureKind::Unknown,
        FailureKind::ProfileNotFound,
        FailureKind::InvalidRequest,
    ];

    /// Stable label used for metrics and log fields
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::NetworkUnreachable => "network_unreachable",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::Timeout => "timeout",
            FailureKind::TlsHandshakeFailed => "tls_handshake_failed",
            FailureKind::AuthenticationFailed => "authentication_failed",
            FailureKind::AuthorizationDenied => "authorization_denied",
            FailureKind::ProtocolError => "protocol_error",
            FailureKind::TopologyDiscoveryFailed => "topology_discovery_failed",
            FailureKind::Unknown => "unknown",
            FailureKind::ProfileNotFound => "profile_not_found",
            FailureKind::InvalidRequest => "invalid_request",
        }
    }

    /// Message suitable for showing to an end user
    pub fn user_message(&self, address: Option<&str>) -> String {
        let address = address.unwrap_or("the database");
        match self {
            FailureKind::NetworkUnreachable | FailureKind::ConnectionRefused => format!(
                "Could not connect to {}, please check the connection details.",
                address
            ),
            FailureKind::Timeout => {
                "The connection has timed out, please check the connection details.".to_string()
            }
            FailureKind::TlsHandshakeFailed => format!(
                "Could not connect to {}, please check the CA or Client certificate.",
                address
            ),
            FailureKind::AuthenticationFailed => {
                "Failed to authenticate, please check the username or password.".to_string()
            }
            FailureKind::AuthorizationDenied => format!(
                "Could not connect to {}, the user lacks the permissions required.",
                address
            ),
            FailureKind::ProtocolError => {
                "Unexpected reply from the server, please check the connection details."
                    .to_string()
            }
            FailureKind::TopologyDiscoveryFailed => format!(
                "Could not discover the topology of {}, please check the cluster or sentinel settings.",
                address
            ),
            FailureKind::Unknown => "Unable to establish connection.".to_string(),
            FailureKind::ProfileNotFound => "Invalid database instance id.".to_string(),
            FailureKind::InvalidRequest => {
                "Client metadata missed required properties.".to_string()
            }
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Map a raw builder error onto the taxonomy
pub fn classify(err: &RawConnectionError) -> FailureKind {
    match err {
        RawConnectionError::Unreachable { .. } => FailureKind::NetworkUnreachable,
        RawConnectionError::Refused { .. } => FailureKind::ConnectionRefused,
        RawConnectionError::TimedOut { .. } => FailureKind::Timeout,
        RawConnectionError::Tls(_) => FailureKind::TlsHandshakeFailed,
        RawConnectionError::AuthRejected(_) => FailureKind::AuthenticationFailed,
        RawConnectionError::PermissionDenied(_) => FailureKind::AuthorizationDenied,
        RawConnectionError::Protocol(_) => FailureKind::ProtocolError,
        RawConnectionError::Topology(_) => FailureKind::TopologyDiscoveryFailed,
        RawConnectionError::Other(_) => FailureKind::Unknown,
    }
}

fn userinfo_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b([a-z][a-z0-9+.\-]*://)[^/@\s]+@").expect("Invalid regex pattern")
    })
}

fn auth_command_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\bAUTH((?:\s+[^\s,;]+){1,2})").expect("Invalid regex pattern")
    })
}

fn password_field_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(password|passwd|pwd)(\s*[=:]\s*)[^\s,;&]+")
            .expect("Invalid regex pattern")
    })
}

/// Strip credentials from a failure message
pub fn redact(message: &str, profile: &ConnectionProfile) -> String {
    let mut redacted = userinfo_pattern()
        .replace_all(message, format!("${{1}}{}@", REDACTED).as_str())
        .into_owned();
    redacted = auth_command_pattern()
        .replace_all(&redacted, format!("AUTH {}", REDACTED).as_str())
        .into_owned();
    redacted = password_field_pattern()
        .replace_all(&redacted, format!("${{1}}${{2}}{}", REDACTED).as_str())
        .into_owned();

    for secret in profile.secrets() {
        redacted = redacted.replace(secret, REDACTED);
    }
    redacted
}

/// Typed outcome of a failed acquisition
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {cause}")]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// Redacted description of the underlying error
    pub cause: String,
    pub profile: Option<ProfilePublicInfo>,
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        kind: FailureKind,
        cause: impl Into<String>,
        profile: Option<ProfilePublicInfo>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            cause: cause.into(),
            profile,
            occurred_at,
        }
    }

    /// Classify and redact a builder error raised for `profile`
    pub fn from_raw(
        err: &RawConnectionError,
        profile: &ConnectionProfile,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: classify(err),
            cause: redact(&err.to_string(), profile),
            profile: Some(profile.public_info()),
            occurred_at,
        }
    }

    pub fn user_message(&self) -> String {
        let address = self
            .profile
            .as_ref()
            .map(|profile| format!("{}:{}", profile.host, profile.port));
        self.kind.user_message(address.as_deref())
    }
}
