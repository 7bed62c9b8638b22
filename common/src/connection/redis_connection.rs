// redis-rs backed Connection implementation

use crate::connection::handle::Connection;
use crate::connection::ssh_tunnel::SshTunnel;
use crate::errors::RawConnectionError;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, RedisResult, Value};
use std::sync::Arc;
use tracing::debug;

/// Multiplexed standalone connection, possibly through an SSH tunnel, or a
/// slot-aware cluster connection. All are cheap to clone and safe for
/// concurrent command issuance.
#[derive(Clone)]
pub enum RedisConnection {
    Standalone(MultiplexedConnection),
    Tunneled {
        conn: MultiplexedConnection,
        tunnel: Arc<SshTunnel>,
    },
    Cluster(ClusterConnection),
}

impl RedisConnection {
    pub fn kind(&self) -> &'static str {
        match self {
            RedisConnection::Standalone(_) => "standalone",
            RedisConnection::Tunneled { .. } => "tunneled",
            RedisConnection::Cluster(_) => "cluster",
        }
    }
}

async fn quit(conn: &MultiplexedConnection) -> Result<(), RawConnectionError> {
    let mut conn = conn.clone();
    // The server closes the socket after replying; the driver task ends once
    // the last clone is dropped.
    match redis::cmd("QUIT").query_async::<_, ()>(&mut conn).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_connection_dropped() || e.is_io_error() => Ok(()),
        Err(e) => Err(RawConnectionError::Other(e.to_string())),
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn query(&self, cmd: &Cmd) -> RedisResult<Value> {
        match self {
            RedisConnection::Standalone(conn) | RedisConnection::Tunneled { conn, .. } => {
                let mut conn = conn.clone();
                cmd.query_async(&mut conn).await
            }
            RedisConnection::Cluster(conn) => {
                let mut conn = conn.clone();
                cmd.query_async(&mut conn).await
            }
        }
    }

    async fn is_alive(&self) -> bool {
        if let RedisConnection::Tunneled { tunnel, .. } = self {
            if !tunnel.is_open() {
                debug!(forward_to = %tunnel.target(), "SSH tunnel is closed");
                return false;
            }
        }
        match self.query(&redis::cmd("PING")).await {
            Ok(_) => true,
            Err(e) => {
                debug!(connection = self.kind(), error = %e, "PING failed");
                false
            }
        }
    }

    async fn close(&self) -> Result<(), RawConnectionError> {
        match self {
            RedisConnection::Standalone(conn) => quit(conn).await,
            RedisConnection::Tunneled { conn, tunnel } => {
                let result = quit(conn).await;
                tunnel.close();
                result
            }
            // Node connections are released when the last clone is dropped
            RedisConnection::Cluster(_) => Ok(()),
        }
    }
}
