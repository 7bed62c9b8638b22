// Public entry point for acquiring Redis connections

use crate::connection::builder::ClientBuilder;
use crate::connection::classifier::{FailureKind, FailureRecord};
use crate::connection::handle::ClientHandle;
use crate::connection::key::ConnectionKey;
use crate::connection::registry::ClientRegistry;
use crate::errors::{KeyError, ProfileError};
use crate::models::{ConnectionProfile, RequestContext, Topology};
use crate::profile::ProfileProvider;
use crate::telemetry::ConnectionTelemetry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Pooled and unpooled connection acquisition
pub struct ConnectionFacade {
    registry: Arc<ClientRegistry>,
    builder: Arc<dyn ClientBuilder>,
    profiles: Arc<dyn ProfileProvider>,
    telemetry: Arc<dyn ConnectionTelemetry>,
    /// Databases with a topology write in flight
    persisting: Arc<DashMap<String, ()>>,
}

impl ConnectionFacade {
    pub fn new(
        registry: Arc<ClientRegistry>,
        builder: Arc<dyn ClientBuilder>,
        profiles: Arc<dyn ProfileProvider>,
        telemetry: Arc<dyn ConnectionTelemetry>,
    ) -> Self {
        Self {
            registry,
            builder,
            profiles,
            telemetry,
            persisting: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Return the pooled connection for this request, building it on first
    /// use. Concurrent requests with the same key share one build.
    #[instrument(skip(self, ctx), fields(database_id = %ctx.database_id, context = %ctx.context))]
    pub async fn get_or_create_client(
        &self,
        ctx: &RequestContext,
    ) -> Result<Arc<ClientHandle>, FailureRecord> {
        let key = ConnectionKey::derive(ctx).map_err(|e| self.invalid_request(e))?;
        self.registry.get_or_create(&key, || self.build(ctx)).await
    }

    /// Build a fresh connection that is never pooled. The caller owns it and
    /// is responsible for closing it.
    #[instrument(skip(self, ctx), fields(database_id = %ctx.database_id, context = %ctx.context))]
    pub async fn create_client(&self, ctx: &RequestContext) -> Result<ClientHandle, FailureRecord> {
        ConnectionKey::derive(ctx).map_err(|e| self.invalid_request(e))?;
        self.build(ctx).await
    }

    /// Close every pooled connection of a database whose profile changed or
    /// was deleted
    #[instrument(skip(self))]
    pub async fn invalidate_database(&self, database_id: &str) -> usize {
        self.registry.remove_by_database(database_id).await
    }

    /// Store an edited profile and close the connections built from the old
    /// one. Returns how many pooled connections were closed.
    #[instrument(skip(self, profile), fields(database_id = %profile.id))]
    pub async fn update_profile(&self, profile: ConnectionProfile) -> Result<usize, ProfileError> {
        let database_id = profile.id.clone();
        self.profiles.save_profile(profile).await?;
        Ok(self.registry.remove_by_database(&database_id).await)
    }

    /// Delete a profile and close its pooled connections
    #[instrument(skip(self))]
    pub async fn delete_profile(&self, database_id: &str) -> Result<usize, ProfileError> {
        self.profiles.delete_profile(database_id).await?;
        Ok(self.registry.remove_by_database(database_id).await)
    }

    async fn build(&self, ctx: &RequestContext) -> Result<ClientHandle, FailureRecord> {
        let profile = self
            .profiles
            .get_profile(&ctx.database_id)
            .await
            .map_err(|e| self.profile_failure(e))?;

        match self.builder.build(&profile, ctx).await {
            Ok(handle) => {
                let discovered = handle.topology();
                self.telemetry
                    .report_connection_established(&profile.public_info(), discovered);

                if profile.topology == Topology::Unknown && discovered != Topology::Unknown {
                    self.persist_topology(profile.id.clone(), discovered);
                }
                Ok(handle)
            }
            Err(err) => {
                let record = FailureRecord::from_raw(&err, &profile, self.registry.clock().now());
                self.telemetry
                    .report_connection_failure(&profile.public_info(), &record);
                Err(record)
            }
        }
    }

    /// Store the discovered topology without holding up the caller
    fn persist_topology(&self, database_id: String, topology: Topology) {
        match self.persisting.entry(database_id.clone()) {
            Entry::Occupied(_) => {
                debug!(database_id = %database_id, "Topology write already in flight");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }

        let profiles = self.profiles.clone();
        let persisting = self.persisting.clone();
        tokio::spawn(async move {
            match profiles
                .update_discovered_topology(&database_id, topology)
                .await
            {
                Ok(()) => debug!(database_id = %database_id, topology = %topology, "Persisted discovered topology"),
                Err(e) => warn!(
                    database_id = %database_id,
                    topology = %topology,
                    error = %e,
                    "Failed to persist discovered topology"
                ),
            }
            persisting.remove(&database_id);
        });
    }

    fn invalid_request(&self, err: KeyError) -> FailureRecord {
        warn!(error = %err, "Rejected connection request");
        FailureRecord::new(
            FailureKind::InvalidRequest,
            err.to_string(),
            None,
            self.registry.clock().now(),
        )
    }

    fn profile_failure(&self, err: ProfileError) -> FailureRecord {
        let kind = match err {
            ProfileError::NotFound(_) => FailureKind::ProfileNotFound,
            ProfileError::Persist { .. } => FailureKind::Unknown,
        };
        warn!(error = %err, kind = kind.label(), "Connection profile unavailable");
        FailureRecord::new(kind, err.to_string(), None, self.registry.clock().now())
    }
}
