// Live client handle shared between the registry and its callers

use crate::errors::RawConnectionError;
use crate::models::Topology;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Established connection to a Redis deployment
#[async_trait]
pub trait Connection: Send + Sync {
    /// Issue a single command
    async fn query(&self, cmd: &redis::Cmd) -> redis::RedisResult<redis::Value>;

    /// Cheap round trip proving the connection still answers
    async fn is_alive(&self) -> bool;

    /// Release the underlying sockets
    async fn close(&self) -> Result<(), RawConnectionError>;
}

/// Live connection plus the metadata the registry tracks for it
pub struct ClientHandle {
    id: Uuid,
    database_id: String,
    topology: Topology,
    created_at: DateTime<Utc>,
    last_accessed_ms: AtomicI64,
    closed: AtomicBool,
    connection: Arc<dyn Connection>,
}

impl ClientHandle {
    pub fn new(
        database_id: impl Into<String>,
        topology: Topology,
        connection: Arc<dyn Connection>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            database_id: database_id.into(),
            topology,
            created_at: now,
            last_accessed_ms: AtomicI64::new(now.timestamp_millis()),
            closed: AtomicBool::new(false),
            connection,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// Topology the builder actually connected with
    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_accessed(&self) -> DateTime<Utc> {
        let millis = self.last_accessed_ms.load(Ordering::Acquire);
        DateTime::from_timestamp_millis(millis).unwrap_or(self.created_at)
    }

    /// Record a use at `now`. Never moves the timestamp backwards.
    pub fn touch(&self, now: DateTime<Utc>) {
        self.last_accessed_ms
            .fetch_max(now.timestamp_millis(), Ordering::AcqRel);
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_accessed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn query(&self, cmd: &redis::Cmd) -> redis::RedisResult<redis::Value> {
        if self.is_closed() {
            return Err(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Connection handle is closed",
            )));
        }
        self.connection.query(cmd).await
    }

    /// False once closed locally, otherwise asks the connection
    pub async fn is_alive(&self) -> bool {
        !self.is_closed() && self.connection.is_alive().await
    }

    /// Close the connection. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), RawConnectionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.connection.close().await
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("database_id", &self.database_id)
            .field("topology", &self.topology)
            .field("created_at", &self.created_at)
            .field("last_accessed", &self.last_accessed())
            .field("closed", &self.is_closed())
            .finish()
    }
}
