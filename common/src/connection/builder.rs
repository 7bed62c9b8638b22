// Client builder: network handshakes and topology discovery

use crate::clock::{Clock, SystemClock};
use crate::connection::dial;
use crate::connection::handle::{ClientHandle, Connection};
use crate::connection::redis_connection::RedisConnection;
use crate::connection::ssh_tunnel::SshTunnel;
use crate::connection::tls;
use crate::errors::RawConnectionError;
use crate::models::{
    ClientContext, ConnectionProfile, Endpoint, RequestContext, TlsSettings, Topology,
};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClientBuilder;
use redis::{ConnectionInfo, ErrorKind, IntoConnectionInfo, RedisError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Builds live client handles from connection profiles
#[async_trait]
pub trait ClientBuilder: Send + Sync {
    async fn build(
        &self,
        profile: &ConnectionProfile,
        ctx: &RequestContext,
    ) -> Result<ClientHandle, RawConnectionError>;
}

/// Builder configuration
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Used when the profile carries no timeout of its own
    pub default_connect_timeout: Duration,
    pub client_name_prefix: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            default_connect_timeout: Duration::from_secs(30),
            client_name_prefix: "redis-conn".to_string(),
        }
    }
}

/// Handshake step a redis error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connect,
    Discovery,
    Cluster,
    Sentinel,
}

#[derive(Debug, Clone, Copy)]
struct Credentials<'a> {
    username: Option<&'a str>,
    password: Option<&'a str>,
}

impl<'a> Credentials<'a> {
    fn of_profile(profile: &'a ConnectionProfile) -> Self {
        Self {
            username: profile.username.as_deref(),
            password: profile.password.as_deref(),
        }
    }

    fn of_sentinel_master(profile: &'a ConnectionProfile) -> Self {
        match profile.sentinel_master.as_ref() {
            Some(master) => Self {
                username: master.username.as_deref(),
                password: master.password.as_deref(),
            },
            None => Self::of_profile(profile),
        }
    }
}

/// Where sockets for the profile's primary endpoint go
struct Route {
    target: Endpoint,
    tunnel: Option<Arc<SshTunnel>>,
}

impl Route {
    fn wrap(&self, conn: MultiplexedConnection) -> RedisConnection {
        match &self.tunnel {
            Some(tunnel) => RedisConnection::Tunneled {
                conn,
                tunnel: tunnel.clone(),
            },
            None => RedisConnection::Standalone(conn),
        }
    }
}

/// redis-rs backed builder
pub struct RedisClientBuilder {
    config: BuilderConfig,
    clock: Arc<dyn Clock>,
}

impl Default for RedisClientBuilder {
    fn default() -> Self {
        Self::new(BuilderConfig::default(), Arc::new(SystemClock))
    }
}

#[async_trait]
impl ClientBuilder for RedisClientBuilder {
    #[instrument(
        skip(self, profile, ctx),
        fields(database_id = %profile.id, declared_topology = %profile.topology, context = %ctx.context)
    )]
    async fn build(
        &self,
        profile: &ConnectionProfile,
        ctx: &RequestContext,
    ) -> Result<ClientHandle, RawConnectionError> {
        let timeout = self.connect_timeout(profile);

        match tokio::time::timeout(timeout, self.connect(profile, ctx, timeout)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Connection attempt timed out");
                Err(RawConnectionError::TimedOut {
                    after_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl RedisClientBuilder {
    pub fn new(config: BuilderConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn connect_timeout(&self, profile: &ConnectionProfile) -> Duration {
        profile
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_connect_timeout)
    }

    /// `<prefix>-<context>-<database id>`, restricted to characters the
    /// server accepts in a client name
    pub fn client_name(&self, context: ClientContext, database_id: &str) -> String {
        format!(
            "{}-{}-{}",
            self.config.client_name_prefix,
            context.as_str().to_lowercase(),
            database_id
        )
        .chars()
        .map(|c| if c.is_ascii_graphic() { c } else { '_' })
        .collect()
    }

    async fn connect(
        &self,
        profile: &ConnectionProfile,
        ctx: &RequestContext,
        timeout: Duration,
    ) -> Result<ClientHandle, RawConnectionError> {
        let db = ctx.db.unwrap_or(profile.db);

        if profile.ssh.is_some()
            && matches!(profile.topology, Topology::Cluster | Topology::Sentinel)
        {
            return Err(ssh_unsupported(profile.topology));
        }

        let (connection, topology) = match profile.topology {
            Topology::Standalone => (
                self.connect_standalone(profile, db, timeout).await?,
                Topology::Standalone,
            ),
            Topology::Cluster => (
                self.connect_cluster(profile, timeout).await?,
                Topology::Cluster,
            ),
            Topology::Sentinel => (
                self.connect_sentinel(profile, db, timeout).await?,
                Topology::Sentinel,
            ),
            Topology::Unknown => self.discover(profile, db, timeout).await?,
        };

        connection
            .query(&redis::cmd("PING"))
            .await
            .map_err(|e| map_redis_error(e, profile, &profile.endpoint(), Stage::Connect, timeout))?;

        let name = self.client_name(ctx.context, &profile.id);
        if let Err(e) = connection
            .query(redis::cmd("CLIENT").arg("SETNAME").arg(&name))
            .await
        {
            debug!(client_name = %name, error = %e, "CLIENT SETNAME rejected");
        }

        info!(topology = %topology, db, "Connection established");
        Ok(ClientHandle::new(
            profile.id.clone(),
            topology,
            Arc::new(connection),
            self.clock.now(),
        ))
    }

    async fn connect_standalone(
        &self,
        profile: &ConnectionProfile,
        db: i64,
        timeout: Duration,
    ) -> Result<RedisConnection, RawConnectionError> {
        let endpoint = profile.endpoint();
        let route = self.route(profile, timeout).await?;
        let conn = self
            .open(
                profile,
                &endpoint,
                &route.target,
                db,
                Credentials::of_profile(profile),
                Stage::Connect,
                timeout,
            )
            .await?;
        Ok(route.wrap(conn))
    }

    /// Probe the endpoint directly, or open an SSH tunnel to it when the
    /// profile has one
    async fn route(
        &self,
        profile: &ConnectionProfile,
        timeout: Duration,
    ) -> Result<Route, RawConnectionError> {
        let endpoint = profile.endpoint();
        match profile.ssh.as_ref() {
            Some(ssh) => {
                let tunnel = SshTunnel::open(ssh, &endpoint, timeout).await?;
                Ok(Route {
                    target: tunnel.local_endpoint(),
                    tunnel: Some(Arc::new(tunnel)),
                })
            }
            None => {
                dial::probe_endpoint(&endpoint, timeout).await?;
                Ok(Route {
                    target: endpoint,
                    tunnel: None,
                })
            }
        }
    }

    /// Connect without a declared topology and let the server say what it is.
    /// Performs at most one extra hop.
    async fn discover(
        &self,
        profile: &ConnectionProfile,
        db: i64,
        timeout: Duration,
    ) -> Result<(RedisConnection, Topology), RawConnectionError> {
        let endpoint = profile.endpoint();
        let route = self.route(profile, timeout).await?;
        let mut conn = self
            .open(
                profile,
                &endpoint,
                &route.target,
                0,
                Credentials::of_profile(profile),
                Stage::Discovery,
                timeout,
            )
            .await?;

        let mode = match redis::cmd("INFO")
            .arg("server")
            .query_async::<_, String>(&mut conn)
            .await
        {
            Ok(info) => parse_redis_mode(&info),
            Err(e) if has_code(&e, "NOPERM") => {
                debug!("INFO not permitted, assuming standalone");
                Topology::Standalone
            }
            Err(e) => return Err(map_redis_error(e, profile, &endpoint, Stage::Discovery, timeout)),
        };
        debug!(discovered = %mode, "Topology discovered");

        if route.tunnel.is_some() && mode != Topology::Standalone {
            return Err(ssh_unsupported(mode));
        }

        match mode {
            Topology::Cluster => {
                drop(conn);
                Ok((self.connect_cluster(profile, timeout).await?, Topology::Cluster))
            }
            Topology::Sentinel => {
                drop(conn);
                Ok((
                    self.connect_sentinel(profile, db, timeout).await?,
                    Topology::Sentinel,
                ))
            }
            _ if db == 0 => Ok((route.wrap(conn), Topology::Standalone)),
            _ => {
                let conn = self
                    .open(
                        profile,
                        &endpoint,
                        &route.target,
                        db,
                        Credentials::of_profile(profile),
                        Stage::Connect,
                        timeout,
                    )
                    .await?;
                Ok((route.wrap(conn), Topology::Standalone))
            }
        }
    }

    async fn connect_cluster(
        &self,
        profile: &ConnectionProfile,
        timeout: Duration,
    ) -> Result<RedisConnection, RawConnectionError> {
        let seeds = profile.seed_endpoints();
        let reachable = dial::probe_any(&seeds, timeout).await?;

        let credentials = Credentials::of_profile(profile);
        let nodes = seeds
            .iter()
            .map(|seed| connection_info(profile, seed, 0, credentials))
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = ClusterClientBuilder::new(nodes);
        if let Some(username) = credentials.username {
            builder = builder.username(username.to_string());
        }
        if let Some(password) = credentials.password {
            builder = builder.password(password.to_string());
        }
        if let Some(certs) = tls_certificates(profile) {
            builder = builder.certs(certs);
        }

        let client = builder
            .build()
            .map_err(|e| map_redis_error(e, profile, &reachable, Stage::Cluster, timeout))?;
        let conn = client
            .get_async_connection()
            .await
            .map_err(|e| map_redis_error(e, profile, &reachable, Stage::Cluster, timeout))?;

        debug!(seeds = seeds.len(), "Cluster connection established");
        Ok(RedisConnection::Cluster(conn))
    }

    async fn connect_sentinel(
        &self,
        profile: &ConnectionProfile,
        db: i64,
        timeout: Duration,
    ) -> Result<RedisConnection, RawConnectionError> {
        let master_name = profile
            .sentinel_master
            .as_ref()
            .map(|master| master.name.trim())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                RawConnectionError::Topology("Sentinel master name must be specified.".to_string())
            })?;

        let mut last_error = None;
        let mut master = None;
        for sentinel in profile.seed_endpoints() {
            match self
                .master_address(profile, &sentinel, master_name, timeout)
                .await
            {
                Ok(Some(address)) => {
                    debug!(sentinel = %sentinel, master = %address, "Master address resolved");
                    master = Some(address);
                    break;
                }
                Ok(None) => {
                    last_error = Some(RawConnectionError::Topology(format!(
                        "Sentinel {} does not monitor a master named {}",
                        sentinel, master_name
                    )));
                }
                Err(e) => {
                    debug!(sentinel = %sentinel, error = %e, "Sentinel query failed");
                    last_error = Some(e);
                }
            }
        }

        let master = match master {
            Some(master) => master,
            None => {
                return Err(last_error.unwrap_or_else(|| {
                    RawConnectionError::Topology("no sentinels configured".to_string())
                }))
            }
        };

        dial::probe_endpoint(&master, timeout).await?;
        let conn = self
            .open(
                profile,
                &master,
                &master,
                db,
                Credentials::of_sentinel_master(profile),
                Stage::Connect,
                timeout,
            )
            .await?;
        Ok(RedisConnection::Standalone(conn))
    }

    async fn master_address(
        &self,
        profile: &ConnectionProfile,
        sentinel: &Endpoint,
        master_name: &str,
        timeout: Duration,
    ) -> Result<Option<Endpoint>, RawConnectionError> {
        dial::probe_endpoint(sentinel, timeout).await?;
        let mut conn = self
            .open(
                profile,
                sentinel,
                sentinel,
                0,
                Credentials::of_profile(profile),
                Stage::Sentinel,
                timeout,
            )
            .await?;

        let reply: Option<(String, u16)> = redis::cmd("SENTINEL")
            .arg("GET-MASTER-ADDR-BY-NAME")
            .arg(master_name)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, profile, sentinel, Stage::Sentinel, timeout))?;

        Ok(reply.map(|(host, port)| Endpoint::new(host, port)))
    }

    /// Open a multiplexed connection to the server at `endpoint`, with the
    /// socket going to `target` (the same endpoint, or a tunnel port)
    #[allow(clippy::too_many_arguments)]
    async fn open(
        &self,
        profile: &ConnectionProfile,
        endpoint: &Endpoint,
        target: &Endpoint,
        db: i64,
        credentials: Credentials<'_>,
        stage: Stage,
        timeout: Duration,
    ) -> Result<MultiplexedConnection, RawConnectionError> {
        if let Some((settings, server_name)) = tls_server_name(profile, endpoint, target) {
            let stream = tls::connect(settings, target, &server_name, timeout).await?;
            let info = connection_info(profile, endpoint, db, credentials)?;
            let (conn, driver) = MultiplexedConnection::new(&info.redis, stream)
                .await
                .map_err(|e| map_redis_error(e, profile, endpoint, stage, timeout))?;
            tokio::spawn(driver);
            return Ok(conn);
        }

        let info = connection_info(profile, target, db, credentials)?;
        let client = match tls_certificates(profile) {
            Some(certs) => redis::Client::build_with_tls(info, certs).map_err(|e| {
                RawConnectionError::Tls(format!("invalid certificate material: {}", e))
            })?,
            None => redis::Client::open(info)
                .map_err(|e| map_redis_error(e, profile, endpoint, stage, timeout))?,
        };

        client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error(e, profile, endpoint, stage, timeout))
    }
}

/// TLS settings and the server name to present, when the name cannot be the
/// socket's host: an explicit override, or a tunnel standing in for the host
fn tls_server_name<'a>(
    profile: &'a ConnectionProfile,
    endpoint: &Endpoint,
    target: &Endpoint,
) -> Option<(&'a TlsSettings, String)> {
    let settings = profile.tls.as_ref()?;
    let name = match settings.servername.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ if target != endpoint => endpoint.host.clone(),
        _ => return None,
    };
    Some((settings, name))
}

fn ssh_unsupported(topology: Topology) -> RawConnectionError {
    RawConnectionError::Topology(format!("SSH is unsupported for {} databases.", topology))
}

fn connection_info(
    profile: &ConnectionProfile,
    endpoint: &Endpoint,
    db: i64,
    credentials: Credentials<'_>,
) -> Result<ConnectionInfo, RawConnectionError> {
    let url = match profile.tls.as_ref() {
        Some(tls) if !tls.verify_server_cert => format!("rediss://{}/#insecure", endpoint.address()),
        Some(_) => format!("rediss://{}", endpoint.address()),
        None => format!("redis://{}", endpoint.address()),
    };

    let mut info = url.as_str().into_connection_info().map_err(|e| {
        RawConnectionError::Other(format!("invalid address {}: {}", endpoint, e))
    })?;
    info.redis.db = db;
    info.redis.username = credentials.username.map(str::to_string);
    info.redis.password = credentials.password.map(str::to_string);
    Ok(info)
}

fn tls_certificates(profile: &ConnectionProfile) -> Option<redis::TlsCertificates> {
    let tls = profile.tls.as_ref()?;
    if tls.ca_certificate.is_none() && tls.client_certificate.is_none() {
        return None;
    }

    Some(redis::TlsCertificates {
        client_tls: tls
            .client_certificate
            .as_ref()
            .map(|cert| redis::ClientTlsConfig {
                client_cert: cert.certificate.as_bytes().to_vec(),
                client_key: cert.key.as_bytes().to_vec(),
            }),
        root_cert: tls
            .ca_certificate
            .as_ref()
            .map(|ca| ca.as_bytes().to_vec()),
    })
}

/// Read `redis_mode` from an `INFO server` reply
pub(crate) fn parse_redis_mode(info: &str) -> Topology {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("redis_mode:"))
        .map(|mode| match mode.trim() {
            "cluster" => Topology::Cluster,
            "sentinel" => Topology::Sentinel,
            _ => Topology::Standalone,
        })
        .next()
        .unwrap_or(Topology::Standalone)
}

/// Server error replies carry their code as the first word
fn has_code(err: &RedisError, code: &str) -> bool {
    err.code() == Some(code) || err.to_string().starts_with(code)
}

/// Translate a redis-rs error into a raw connection error for the step it
/// was raised in. The TCP probe already passed, so I/O failures on a TLS
/// profile are handshake failures.
fn map_redis_error(
    err: RedisError,
    profile: &ConnectionProfile,
    endpoint: &Endpoint,
    stage: Stage,
    timeout: Duration,
) -> RawConnectionError {
    let message = err.to_string();

    if err.kind() == ErrorKind::AuthenticationFailed
        || has_code(&err, "WRONGPASS")
        || has_code(&err, "NOAUTH")
    {
        return RawConnectionError::AuthRejected(message);
    }
    if has_code(&err, "NOPERM") {
        return RawConnectionError::PermissionDenied(message);
    }
    if err.is_timeout() {
        return RawConnectionError::TimedOut {
            after_ms: timeout.as_millis() as u64,
        };
    }
    if err.is_connection_refusal() {
        return RawConnectionError::Refused {
            address: endpoint.address(),
            message,
        };
    }
    if err.is_io_error() || err.is_connection_dropped() {
        if profile.tls.is_some() {
            return RawConnectionError::Tls(message);
        }
        return RawConnectionError::Unreachable {
            address: endpoint.address(),
            message,
        };
    }
    if err.kind() == ErrorKind::InvalidClientConfig {
        return RawConnectionError::Other(message);
    }

    match stage {
        Stage::Cluster | Stage::Sentinel => RawConnectionError::Topology(message),
        Stage::Connect | Stage::Discovery => match err.kind() {
            ErrorKind::ResponseError | ErrorKind::TypeError | ErrorKind::ExtensionError => {
                RawConnectionError::Protocol(message)
            }
            _ => RawConnectionError::Other(message),
        },
    }
}
