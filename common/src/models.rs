use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Profile Models
// ============================================================================

/// Shape of a Redis deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    /// Never connected, shape is discovered on first successful connection
    #[default]
    Unknown,
    Standalone,
    Cluster,
    Sentinel,
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topology::Unknown => "unknown",
            Topology::Standalone => "standalone",
            Topology::Cluster => "cluster",
            Topology::Sentinel => "sentinel",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Additional node address (cluster seed or sentinel)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 hosts wrapped in brackets
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

/// Client certificate in PEM form
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCertificate {
    pub certificate: String,
    pub key: String,
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("certificate", &format_args!("<{} bytes>", self.certificate.len()))
            .field("key", &"<redacted>")
            .finish()
    }
}

/// TLS material of a profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default = "default_verify_server_cert")]
    pub verify_server_cert: bool,
    /// CA certificate (PEM)
    #[serde(default)]
    pub ca_certificate: Option<String>,
    #[serde(default)]
    pub client_certificate: Option<ClientCertificate>,
    /// Name sent in SNI and checked against the certificate instead of the host
    #[serde(default)]
    pub servername: Option<String>,
}

fn default_verify_server_cert() -> bool {
    true
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            verify_server_cert: true,
            ca_certificate: None,
            client_certificate: None,
            servername: None,
        }
    }
}

/// SSH bastion the standalone connection is tunnelled through
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshSettings {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Private key (PEM)
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl SshSettings {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

impl fmt::Debug for SshSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Master group monitored by sentinels
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelMaster {
    pub name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for SentinelMaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentinelMaster")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Stored description of how to reach a Redis deployment
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Cluster seeds or additional sentinels
    #[serde(default)]
    pub nodes: Vec<Endpoint>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub tls: Option<TlsSettings>,
    #[serde(default)]
    pub sentinel_master: Option<SentinelMaster>,
    #[serde(default)]
    pub ssh: Option<SshSettings>,
    #[serde(default)]
    pub topology: Topology,
    /// Connect timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ConnectionProfile {
    /// Minimal profile for a standalone-or-unknown endpoint
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            host: host.into(),
            port,
            nodes: Vec::new(),
            username: None,
            password: None,
            db: 0,
            tls: None,
            sentinel_master: None,
            ssh: None,
            topology: Topology::Unknown,
            timeout_ms: None,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Primary endpoint followed by the additional nodes, without duplicates
    pub fn seed_endpoints(&self) -> Vec<Endpoint> {
        let mut seeds = vec![self.endpoint()];
        for node in &self.nodes {
            if !seeds.contains(node) {
                seeds.push(node.clone());
            }
        }
        seeds
    }

    /// Identifying fields safe to log and to hand to telemetry
    pub fn public_info(&self) -> ProfilePublicInfo {
        ProfilePublicInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            topology: self.topology,
        }
    }

    /// Secret values that must never leave the subsystem
    pub fn secrets(&self) -> Vec<&str> {
        let mut secrets = Vec::new();
        if let Some(password) = self.password.as_deref() {
            secrets.push(password);
        }
        if let Some(password) = self
            .sentinel_master
            .as_ref()
            .and_then(|master| master.password.as_deref())
        {
            secrets.push(password);
        }
        if let Some(cert) = self
            .tls
            .as_ref()
            .and_then(|tls| tls.client_certificate.as_ref())
        {
            secrets.push(cert.key.as_str());
        }
        if let Some(ssh) = self.ssh.as_ref() {
            secrets.extend(
                [&ssh.password, &ssh.private_key, &ssh.passphrase]
                    .into_iter()
                    .filter_map(|secret| secret.as_deref()),
            );
        }
        secrets.retain(|secret| !secret.is_empty());
        secrets
    }
}

impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("nodes", &self.nodes)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("db", &self.db)
            .field("tls", &self.tls)
            .field("sentinel_master", &self.sentinel_master)
            .field("ssh", &self.ssh)
            .field("topology", &self.topology)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// Public identifying fields of a profile (never credentials)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePublicInfo {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub topology: Topology,
}

// ============================================================================
// Request Models
// ============================================================================

/// Area of the product a connection is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ClientContext {
    #[default]
    Common,
    Browser,
    Cli,
    Workbench,
    Profiler,
}

impl ClientContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientContext::Common => "Common",
            ClientContext::Browser => "Browser",
            ClientContext::Cli => "CLI",
            ClientContext::Workbench => "Workbench",
            ClientContext::Profiler => "Profiler",
        }
    }
}

impl fmt::Display for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking for the connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct SessionMetadata {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub unique_id: Option<String>,
}

impl SessionMetadata {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            unique_id: None,
        }
    }
}

/// Everything a caller supplies when asking for a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestContext {
    pub database_id: String,
    #[serde(default)]
    pub context: ClientContext,
    pub session: SessionMetadata,
    /// Logical database override; the profile's `db` is used when absent
    #[serde(default)]
    pub db: Option<i64>,
    #[serde(default)]
    pub unique_id: Option<String>,
}

impl RequestContext {
    pub fn new(database_id: impl Into<String>, session: SessionMetadata) -> Self {
        Self {
            database_id: database_id.into(),
            context: ClientContext::Common,
            session,
            db: None,
            unique_id: None,
        }
    }

    pub fn with_context(mut self, context: ClientContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_db(mut self, db: i64) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }
}
