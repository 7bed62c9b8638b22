// Property-based tests for the connection facade
// Covers: shared builds, topology persistence, failure reporting and idle
// eviction followed by a fresh build

use async_trait::async_trait;
use chrono::Utc;
use common::clock::{Clock, ManualClock};
use common::connection::{
    ClientBuilder, ClientHandle, ClientRegistry, Connection, ConnectionFacade, FailureKind,
    FailureRecord, RegistryConfig,
};
use common::errors::{ProfileError, RawConnectionError};
use common::models::{
    ClientContext, ConnectionProfile, ProfilePublicInfo, RequestContext, SessionMetadata, Topology,
};
use common::profile::{InMemoryProfileProvider, ProfileProvider};
use common::telemetry::ConnectionTelemetry;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct TestConnection;

#[async_trait]
impl Connection for TestConnection {
    async fn query(&self, _cmd: &redis::Cmd) -> redis::RedisResult<redis::Value> {
        Ok(redis::Value::Okay)
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), RawConnectionError> {
        Ok(())
    }
}

/// Builder that counts calls, waits, then returns a scripted outcome
struct CountingBuilder {
    clock: Arc<dyn Clock>,
    delay: Duration,
    discovered: Topology,
    failure: Option<RawConnectionError>,
    builds: AtomicUsize,
}

impl CountingBuilder {
    fn succeeding(clock: Arc<dyn Clock>, discovered: Topology) -> Self {
        Self {
            clock,
            delay: Duration::from_millis(0),
            discovered,
            failure: None,
            builds: AtomicUsize::new(0),
        }
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientBuilder for CountingBuilder {
    async fn build(
        &self,
        profile: &ConnectionProfile,
        _ctx: &RequestContext,
    ) -> Result<ClientHandle, RawConnectionError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let topology = match profile.topology {
            Topology::Unknown => self.discovered,
            declared => declared,
        };
        Ok(ClientHandle::new(
            profile.id.clone(),
            topology,
            Arc::new(TestConnection),
            self.clock.now(),
        ))
    }
}

/// Provider that records topology updates and can be told to fail them
struct RecordingProvider {
    inner: InMemoryProfileProvider,
    updates: AtomicUsize,
    fail_updates: AtomicBool,
    update_delay_ms: AtomicU64,
}

impl RecordingProvider {
    fn new(profile: ConnectionProfile) -> Self {
        Self {
            inner: InMemoryProfileProvider::new(vec![profile]),
            updates: AtomicUsize::new(0),
            fail_updates: AtomicBool::new(false),
            update_delay_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ProfileProvider for RecordingProvider {
    async fn get_profile(&self, database_id: &str) -> Result<ConnectionProfile, ProfileError> {
        self.inner.get_profile(database_id).await
    }

    async fn update_discovered_topology(
        &self,
        database_id: &str,
        topology: Topology,
    ) -> Result<(), ProfileError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let delay = self.update_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(ProfileError::Persist {
                database_id: database_id.to_string(),
                reason: "storage offline".to_string(),
            });
        }
        self.inner
            .update_discovered_topology(database_id, topology)
            .await
    }

    async fn save_profile(&self, profile: ConnectionProfile) -> Result<(), ProfileError> {
        self.inner.save_profile(profile).await
    }

    async fn delete_profile(&self, database_id: &str) -> Result<(), ProfileError> {
        self.inner.delete_profile(database_id).await
    }
}

#[derive(Default)]
struct RecordingTelemetry {
    failures: Mutex<Vec<(ProfilePublicInfo, FailureRecord)>>,
    established: AtomicUsize,
}

impl ConnectionTelemetry for RecordingTelemetry {
    fn report_connection_failure(&self, profile: &ProfilePublicInfo, failure: &FailureRecord) {
        self.failures
            .lock()
            .unwrap()
            .push((profile.clone(), failure.clone()));
    }

    fn report_connection_established(&self, _profile: &ProfilePublicInfo, _topology: Topology) {
        self.established.fetch_add(1, Ordering::SeqCst);
    }
}

struct Fixture {
    facade: Arc<ConnectionFacade>,
    clock: Arc<ManualClock>,
    builder: Arc<CountingBuilder>,
    provider: Arc<RecordingProvider>,
    telemetry: Arc<RecordingTelemetry>,
}

fn fixture(
    profile: ConnectionProfile,
    builder: impl FnOnce(Arc<dyn Clock>) -> CountingBuilder,
) -> Fixture {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let shared: Arc<dyn Clock> = clock.clone();
    let registry = Arc::new(ClientRegistry::new(shared.clone(), RegistryConfig::default()));
    let builder = Arc::new(builder(shared));
    let provider = Arc::new(RecordingProvider::new(profile));
    let telemetry = Arc::new(RecordingTelemetry::default());

    let facade = Arc::new(ConnectionFacade::new(
        registry,
        builder.clone(),
        provider.clone(),
        telemetry.clone(),
    ));

    Fixture {
        facade,
        clock,
        builder,
        provider,
        telemetry,
    }
}

fn request(context: ClientContext) -> RequestContext {
    RequestContext::new("db-1", SessionMetadata::new("uid", "sid")).with_context(context)
}

async fn wait_for(counter: &AtomicUsize, expected: usize) {
    for _ in 0..100 {
        if counter.load(Ordering::SeqCst) >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Any number of concurrent callers with the same key cause one build and all
/// receive the same handle
#[test]
fn property_concurrent_callers_share_one_build() {
    proptest!(ProptestConfig::with_cases(8), |(callers in 2usize..24)| {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let fx = fixture(ConnectionProfile::new("db-1", "localhost", 6379), |clock| {
                CountingBuilder {
                    delay: Duration::from_millis(50),
                    ..CountingBuilder::succeeding(clock, Topology::Standalone)
                }
            });

            let tasks: Vec<_> = (0..callers)
                .map(|_| {
                    let facade = fx.facade.clone();
                    tokio::spawn(async move {
                        facade.get_or_create_client(&request(ClientContext::Browser)).await
                    })
                })
                .collect();

            let mut ids = Vec::new();
            for joined in futures::future::join_all(tasks).await {
                ids.push(joined.unwrap().unwrap().id());
            }

            prop_assert_eq!(fx.builder.builds(), 1);
            prop_assert!(ids.iter().all(|id| *id == ids[0]));
            prop_assert_eq!(fx.telemetry.established.load(Ordering::SeqCst), 1);
            Ok(())
        })?;
    });
}

/// A profile with unknown topology is updated exactly once after discovery
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_topology_is_persisted_once() {
    let fx = fixture(ConnectionProfile::new("db-1", "localhost", 6379), |clock| {
        CountingBuilder {
            delay: Duration::from_millis(50),
            ..CountingBuilder::succeeding(clock, Topology::Standalone)
        }
    });

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let facade = fx.facade.clone();
            tokio::spawn(async move { facade.get_or_create_client(&request(ClientContext::Common)).await })
        })
        .collect();
    for joined in futures::future::join_all(tasks).await {
        assert_eq!(joined.unwrap().unwrap().topology(), Topology::Standalone);
    }

    wait_for(&fx.provider.updates, 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fx.provider.updates.load(Ordering::SeqCst), 1);
    let stored = fx.provider.get_profile("db-1").await.unwrap();
    assert_eq!(stored.topology, Topology::Standalone);
}

/// Builds for different keys of one unknown-topology database finish
/// together; only the first schedules a topology write
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_keys_persist_topology_once() {
    let fx = fixture(ConnectionProfile::new("db-1", "localhost", 6379), |clock| {
        CountingBuilder {
            delay: Duration::from_millis(50),
            ..CountingBuilder::succeeding(clock, Topology::Cluster)
        }
    });
    fx.provider.update_delay_ms.store(200, Ordering::SeqCst);

    let contexts = [
        ClientContext::Browser,
        ClientContext::Cli,
        ClientContext::Workbench,
        ClientContext::Profiler,
    ];
    let tasks: Vec<_> = contexts
        .into_iter()
        .map(|context| {
            let facade = fx.facade.clone();
            tokio::spawn(async move { facade.get_or_create_client(&request(context)).await })
        })
        .collect();
    for joined in futures::future::join_all(tasks).await {
        assert_eq!(joined.unwrap().unwrap().topology(), Topology::Cluster);
    }
    assert_eq!(fx.builder.builds(), 4);

    wait_for(&fx.provider.updates, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(fx.provider.updates.load(Ordering::SeqCst), 1);
    let stored = fx.provider.get_profile("db-1").await.unwrap();
    assert_eq!(stored.topology, Topology::Cluster);
}

/// Editing a profile closes the pooled connections built from the old one
#[tokio::test]
async fn profile_update_replaces_pooled_connections() {
    let fx = fixture(ConnectionProfile::new("db-1", "localhost", 6379), |clock| {
        CountingBuilder::succeeding(clock, Topology::Standalone)
    });

    let browser = fx
        .facade
        .get_or_create_client(&request(ClientContext::Browser))
        .await
        .unwrap();
    let cli = fx
        .facade
        .get_or_create_client(&request(ClientContext::Cli))
        .await
        .unwrap();

    let mut edited = ConnectionProfile::new("db-1", "localhost", 6380);
    edited.topology = Topology::Standalone;
    assert_eq!(fx.facade.update_profile(edited).await, Ok(2));
    assert!(browser.is_closed());
    assert!(cli.is_closed());
    assert!(fx.facade.registry().is_empty());

    let fresh = fx
        .facade
        .get_or_create_client(&request(ClientContext::Browser))
        .await
        .unwrap();
    assert!(!fresh.is_closed());
    assert_eq!(fx.builder.builds(), 3);
}

/// A declared topology is never written back
#[tokio::test]
async fn declared_topology_is_not_persisted() {
    let mut profile = ConnectionProfile::new("db-1", "localhost", 6379);
    profile.topology = Topology::Cluster;
    let fx = fixture(profile, |clock| CountingBuilder::succeeding(clock, Topology::Standalone));

    let handle = fx
        .facade
        .get_or_create_client(&request(ClientContext::Common))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handle.topology(), Topology::Cluster);
    assert_eq!(fx.provider.updates.load(Ordering::SeqCst), 0);
}

/// A failed topology write does not fail the acquisition
#[tokio::test]
async fn failed_topology_persistence_is_not_surfaced() {
    let fx = fixture(ConnectionProfile::new("db-1", "localhost", 6379), |clock| {
        CountingBuilder::succeeding(clock, Topology::Cluster)
    });
    fx.provider.fail_updates.store(true, Ordering::SeqCst);

    let result = fx
        .facade
        .get_or_create_client(&request(ClientContext::Common))
        .await;
    wait_for(&fx.provider.updates, 1).await;

    assert!(result.is_ok());
    assert_eq!(fx.provider.updates.load(Ordering::SeqCst), 1);
}

/// An authentication failure is classified, redacted, reported once and
/// leaves no pooled entry
#[tokio::test]
async fn authentication_failure_is_reported_once() {
    let mut profile = ConnectionProfile::new("db-1", "localhost", 6379);
    profile.password = Some("s3cr3t-pass".to_string());
    let fx = fixture(profile, |clock| CountingBuilder {
        failure: Some(RawConnectionError::AuthRejected(
            "WRONGPASS invalid username-password pair (s3cr3t-pass)".to_string(),
        )),
        ..CountingBuilder::succeeding(clock, Topology::Standalone)
    });

    let err = fx
        .facade
        .get_or_create_client(&request(ClientContext::Browser))
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::AuthenticationFailed);
    assert!(!err.cause.contains("s3cr3t-pass"));
    assert!(fx.facade.registry().is_empty());

    let failures = fx.telemetry.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.id, "db-1");
    assert_eq!(failures[0].1.kind, FailureKind::AuthenticationFailed);
    assert_eq!(fx.telemetry.established.load(Ordering::SeqCst), 0);
}

/// After an idle sweep the next request builds a fresh connection
#[tokio::test]
async fn idle_eviction_then_fresh_build() {
    let fx = fixture(ConnectionProfile::new("db-1", "localhost", 6379), |clock| {
        CountingBuilder::succeeding(clock, Topology::Standalone)
    });
    let ctx = request(ClientContext::Workbench);

    let first = fx.facade.get_or_create_client(&ctx).await.unwrap();
    fx.clock.advance(chrono::Duration::hours(2));

    let reclaimed = fx
        .facade
        .registry()
        .sweep_idle(Duration::from_secs(3600))
        .await;
    assert_eq!(reclaimed, 1);
    assert!(first.is_closed());

    let second = fx.facade.get_or_create_client(&ctx).await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(fx.builder.builds(), 2);
}

/// Different contexts of one database get separate connections, and
/// invalidating the database closes all of them
#[tokio::test]
async fn contexts_are_isolated_until_invalidated() {
    let fx = fixture(ConnectionProfile::new("db-1", "localhost", 6379), |clock| {
        CountingBuilder::succeeding(clock, Topology::Standalone)
    });

    let browser = fx
        .facade
        .get_or_create_client(&request(ClientContext::Browser))
        .await
        .unwrap();
    let cli = fx
        .facade
        .get_or_create_client(&request(ClientContext::Cli))
        .await
        .unwrap();

    assert_ne!(browser.id(), cli.id());
    assert_eq!(fx.facade.registry().len(), 2);

    assert_eq!(fx.facade.invalidate_database("db-1").await, 2);
    assert!(browser.is_closed());
    assert!(cli.is_closed());
    assert!(fx.facade.registry().is_empty());
}

/// Unpooled connections never enter the registry
#[tokio::test]
async fn create_client_bypasses_registry() {
    let fx = fixture(ConnectionProfile::new("db-1", "localhost", 6379), |clock| {
        CountingBuilder::succeeding(clock, Topology::Standalone)
    });

    let handle = fx
        .facade
        .create_client(&request(ClientContext::Profiler))
        .await
        .unwrap();

    assert!(fx.facade.registry().is_empty());
    handle.close().await.unwrap();
    assert!(handle.is_closed());
}
