// Connection profile provider boundary and in-memory implementation

use crate::errors::ProfileError;
use crate::models::{ConnectionProfile, Topology};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Source of stored connection profiles
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    /// Fetch the current profile of a database
    async fn get_profile(&self, database_id: &str) -> Result<ConnectionProfile, ProfileError>;

    /// Persist the topology discovered on first successful connection
    async fn update_discovered_topology(
        &self,
        database_id: &str,
        topology: Topology,
    ) -> Result<(), ProfileError>;

    /// Insert or replace a profile
    async fn save_profile(&self, profile: ConnectionProfile) -> Result<(), ProfileError>;

    async fn delete_profile(&self, database_id: &str) -> Result<(), ProfileError>;
}

/// Profiles held in memory, seeded from configuration
#[derive(Default)]
pub struct InMemoryProfileProvider {
    profiles: RwLock<HashMap<String, ConnectionProfile>>,
}

impl InMemoryProfileProvider {
    pub fn new(profiles: impl IntoIterator<Item = ConnectionProfile>) -> Self {
        Self {
            profiles: RwLock::new(
                profiles
                    .into_iter()
                    .map(|profile| (profile.id.clone(), profile))
                    .collect(),
            ),
        }
    }

    /// Insert or replace a profile, returning the previous one
    pub async fn upsert(&self, profile: ConnectionProfile) -> Option<ConnectionProfile> {
        self.profiles
            .write()
            .await
            .insert(profile.id.clone(), profile)
    }

    pub async fn delete(&self, database_id: &str) -> Option<ConnectionProfile> {
        self.profiles.write().await.remove(database_id)
    }

    pub async fn list(&self) -> Vec<ConnectionProfile> {
        let mut profiles: Vec<_> = self.profiles.read().await.values().cloned().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }
}

#[async_trait]
impl ProfileProvider for InMemoryProfileProvider {
    async fn get_profile(&self, database_id: &str) -> Result<ConnectionProfile, ProfileError> {
        self.profiles
            .read()
            .await
            .get(database_id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(database_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn update_discovered_topology(
        &self,
        database_id: &str,
        topology: Topology,
    ) -> Result<(), ProfileError> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get_mut(database_id)
            .ok_or_else(|| ProfileError::Persist {
                database_id: database_id.to_string(),
                reason: "profile no longer exists".to_string(),
            })?;

        profile.topology = topology;
        debug!("Discovered topology stored");
        Ok(())
    }

    async fn save_profile(&self, profile: ConnectionProfile) -> Result<(), ProfileError> {
        self.upsert(profile).await;
        Ok(())
    }

    async fn delete_profile(&self, database_id: &str) -> Result<(), ProfileError> {
        self.delete(database_id)
            .await
            .map(|_| ())
            .ok_or_else(|| ProfileError::NotFound(database_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_profile_not_found() {
        let provider = InMemoryProfileProvider::default();
        let result = provider.get_profile("missing").await;
        assert_eq!(result, Err(ProfileError::NotFound("missing".to_string())));
    }

    #[tokio::test]
    async fn test_update_discovered_topology() {
        let provider =
            InMemoryProfileProvider::new(vec![ConnectionProfile::new("db-1", "localhost", 6379)]);

        provider
            .update_discovered_topology("db-1", Topology::Cluster)
            .await
            .unwrap();
        let profile = provider.get_profile("db-1").await.unwrap();
        assert_eq!(profile.topology, Topology::Cluster);

        let missing = provider
            .update_discovered_topology("db-2", Topology::Cluster)
            .await;
        assert!(matches!(missing, Err(ProfileError::Persist { .. })));
    }

    #[tokio::test]
    async fn test_upsert_delete_and_list() {
        let provider = InMemoryProfileProvider::default();
        assert!(provider
            .upsert(ConnectionProfile::new("db-2", "b", 6379))
            .await
            .is_none());
        provider.upsert(ConnectionProfile::new("db-1", "a", 6379)).await;

        let ids: Vec<_> = provider.list().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["db-1", "db-2"]);

        assert!(provider.delete("db-1").await.is_some());
        assert!(provider.get_profile("db-1").await.is_err());
    }

    #[tokio::test]
    async fn test_save_and_delete_through_trait() {
        let provider = InMemoryProfileProvider::default();
        let mut profile = ConnectionProfile::new("db-1", "a", 6379);
        provider.save_profile(profile.clone()).await.unwrap();

        profile.port = 6380;
        provider.save_profile(profile).await.unwrap();
        assert_eq!(provider.get_profile("db-1").await.unwrap().port, 6380);

        provider.delete_profile("db-1").await.unwrap();
        assert_eq!(
            provider.delete_profile("db-1").await,
            Err(ProfileError::NotFound("db-1".to_string()))
        );
    }
}
