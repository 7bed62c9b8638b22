// Client registry: one live handle per connection key
//
// Entries are keyed in a sharded concurrent map. Each entry carries a
// construction cell that doubles as the per-key construction lock, so
// unrelated keys never wait on each other and a key is built at most once
// at a time. Shard locks are never held across an await.

use crate::clock::{Clock, SystemClock};
use crate::connection::classifier::{FailureKind, FailureRecord};
use crate::connection::handle::ClientHandle;
use crate::connection::key::ConnectionKey;
use crate::telemetry;
use dashmap::DashMap;
use futures::future::join_all;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

type Outcome = Result<Arc<ClientHandle>, FailureRecord>;

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Upper bound for the PING issued before a cached handle is reused
    pub liveness_probe_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            liveness_probe_timeout: Duration::from_millis(1000),
        }
    }
}

struct RegistryEntry {
    cell: OnceCell<Outcome>,
    /// Callers currently inside `get_or_create` for this entry
    waiters: AtomicUsize,
}

impl RegistryEntry {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    fn live_handle(&self) -> Option<Arc<ClientHandle>> {
        match self.cell.get() {
            Some(Ok(handle)) => Some(handle.clone()),
            _ => None,
        }
    }
}

/// Drops an abandoned entry when the last caller waiting on it goes away
/// before construction finished (all of them cancelled).
struct WaiterGuard<'a> {
    entries: &'a DashMap<ConnectionKey, Arc<RegistryEntry>>,
    key: &'a ConnectionKey,
    entry: Arc<RegistryEntry>,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let last = self.entry.waiters.fetch_sub(1, Ordering::AcqRel) == 1;
        if last && !self.entry.cell.initialized() {
            self.entries.remove_if(self.key, |_, current| {
                Arc::ptr_eq(current, &self.entry)
                    && current.waiters.load(Ordering::Acquire) == 0
                    && !current.cell.initialized()
            });
        }
    }
}

/// Maps connection keys to live client handles
pub struct ClientRegistry {
    entries: DashMap<ConnectionKey, Arc<RegistryEntry>>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock), RegistryConfig::default())
    }
}

impl ClientRegistry {
    pub fn new(clock: Arc<dyn Clock>, config: RegistryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            config,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of entries, including constructions still in flight
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &ConnectionKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up a live handle without waiting for an in-flight construction.
    ///
    /// A hit is liveness-probed and touched. A dead handle is evicted, closed
    /// and reported as a miss.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn get_by_key(&self, key: &ConnectionKey) -> Option<Arc<ClientHandle>> {
        let entry = self.entries.get(key).map(|slot| slot.value().clone())?;
        let handle = entry.live_handle()?;

        // Touch first so a concurrent sweep does not see the handle as idle
        handle.touch(self.clock.now());
        if !self.probe(&handle).await {
            warn!(handle_id = %handle.id(), "Cached connection failed liveness probe, evicting");
            self.evict(key, &entry, &handle).await;
            return None;
        }

        if self.still_pooled(key, &entry, &handle) {
            Some(handle)
        } else {
            debug!(handle_id = %handle.id(), "Connection was removed while probing");
            None
        }
    }

    /// Return the live handle for `key`, constructing it with `factory` when
    /// absent.
    ///
    /// Concurrent callers for the same key share one construction and all
    /// receive its outcome. A failed construction is never cached: the entry
    /// is removed before waiters are woken, so the next call retries. If the
    /// constructing caller is cancelled, a waiting caller runs its own
    /// factory instead.
    #[instrument(skip(self, factory), fields(key = %key))]
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &ConnectionKey,
        factory: F,
    ) -> Result<Arc<ClientHandle>, FailureRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ClientHandle, FailureRecord>>,
    {
        let mut factory = Some(factory);

        loop {
            let entry = {
                let slot = self
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(RegistryEntry::new()));
                slot.waiters.fetch_add(1, Ordering::AcqRel);
                slot.value().clone()
            };
            let guard = WaiterGuard {
                entries: &self.entries,
                key,
                entry,
            };

            let mut built_here = false;
            let outcome = guard
                .entry
                .cell
                .get_or_init(|| {
                    built_here = true;
                    self.construct(key, &guard.entry, factory.take())
                })
                .await;

            let handle = match outcome {
                Ok(handle) => handle.clone(),
                Err(record) => return Err(record.clone()),
            };

            if built_here {
                telemetry::record_registry_size(self.entries.len());
                return Ok(handle);
            }

            handle.touch(self.clock.now());
            if !self.probe(&handle).await {
                warn!(handle_id = %handle.id(), "Pooled connection is dead, rebuilding");
                self.evict(key, &guard.entry, &handle).await;
                continue;
            }

            if self.still_pooled(key, &guard.entry, &handle) {
                debug!(handle_id = %handle.id(), "Reusing pooled connection");
                return Ok(handle);
            }
            debug!(handle_id = %handle.id(), "Connection was removed while probing, retrying");
        }
    }

    /// The handle is open and its entry is still the one mapped under `key`
    fn still_pooled(
        &self,
        key: &ConnectionKey,
        entry: &Arc<RegistryEntry>,
        handle: &ClientHandle,
    ) -> bool {
        !handle.is_closed()
            && self
                .entries
                .get(key)
                .is_some_and(|slot| Arc::ptr_eq(slot.value(), entry))
    }

    async fn construct<F, Fut>(
        &self,
        key: &ConnectionKey,
        entry: &Arc<RegistryEntry>,
        factory: Option<F>,
    ) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ClientHandle, FailureRecord>>,
    {
        let result = match factory {
            Some(factory) => factory().await.map(Arc::new),
            None => Err(FailureRecord::new(
                FailureKind::Unknown,
                "connection factory was already used",
                None,
                self.clock.now(),
            )),
        };

        match &result {
            Ok(handle) => {
                handle.touch(self.clock.now());
                info!(
                    handle_id = %handle.id(),
                    topology = %handle.topology(),
                    "Connection added to registry"
                );
            }
            Err(record) => {
                // Must happen before the outcome is published to waiters
                self.entries
                    .remove_if(key, |_, current| Arc::ptr_eq(current, entry));
                debug!(kind = %record.kind, "Connection construction failed");
            }
        }

        result
    }

    /// Remove the handle for `key` and hand it to the caller for closing.
    ///
    /// A construction in flight for the key is detached: its callers still get
    /// the result but it is not pooled.
    #[instrument(skip(self), fields(key = %key))]
    pub fn remove(&self, key: &ConnectionKey) -> Option<Arc<ClientHandle>> {
        let (_, entry) = self.entries.remove(key)?;
        telemetry::record_registry_size(self.entries.len());
        entry.live_handle()
    }

    /// Remove and close every handle derived from `database_id`
    #[instrument(skip(self))]
    pub async fn remove_by_database(&self, database_id: &str) -> usize {
        let removed = self.drain_where(|key, _| key.belongs_to(database_id));
        let count = removed.len();
        let handles = removed
            .iter()
            .filter_map(|entry| entry.live_handle())
            .collect();
        close_quietly(handles, "database invalidated").await;

        if count > 0 {
            info!(database_id, removed = count, "Removed pooled connections of database");
        }
        count
    }

    /// Remove and close every live handle idle for strictly longer than
    /// `max_idle`. Constructions in flight are left alone.
    #[instrument(skip(self), fields(max_idle_ms = max_idle.as_millis() as u64))]
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = self.clock.now();
        let max_idle_ms = i64::try_from(max_idle.as_millis()).unwrap_or(i64::MAX);

        let removed = self.drain_where(|_, entry| match entry.cell.get() {
            Some(Ok(handle)) => handle.idle_for(now).num_milliseconds() > max_idle_ms,
            // A published failure is never meant to stay in the map
            Some(Err(_)) => true,
            None => false,
        });

        let handles: Vec<_> = removed
            .iter()
            .filter_map(|entry| entry.live_handle())
            .collect();
        let count = handles.len();
        close_quietly(handles, "idle").await;

        if count > 0 {
            telemetry::record_connections_reclaimed(count as u64);
            info!(reclaimed = count, "Reclaimed idle connections");
        }
        count
    }

    /// Drain the registry and close every handle
    #[instrument(skip(self))]
    pub async fn close_all(&self) -> usize {
        let removed = self.drain_where(|_, _| true);
        let handles: Vec<_> = removed
            .iter()
            .filter_map(|entry| entry.live_handle())
            .collect();
        let count = handles.len();
        close_quietly(handles, "shutdown").await;

        info!(closed = count, "Closed all pooled connections");
        count
    }

    fn drain_where<P>(&self, mut predicate: P) -> Vec<Arc<RegistryEntry>>
    where
        P: FnMut(&ConnectionKey, &RegistryEntry) -> bool,
    {
        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            if predicate(key, entry) {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            telemetry::record_registry_size(self.entries.len());
        }
        removed
    }

    async fn probe(&self, handle: &ClientHandle) -> bool {
        tokio::time::timeout(self.config.liveness_probe_timeout, handle.is_alive())
            .await
            .unwrap_or(false)
    }

    async fn evict(&self, key: &ConnectionKey, entry: &Arc<RegistryEntry>, handle: &ClientHandle) {
        let removed = self
            .entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry))
            .is_some();
        if removed {
            telemetry::record_registry_size(self.entries.len());
        }
        if let Err(e) = handle.close().await {
            debug!(handle_id = %handle.id(), error = %e, "Closing dead connection failed");
        }
    }
}

async fn close_quietly(handles: Vec<Arc<ClientHandle>>, reason: &'static str) {
    join_all(handles.iter().map(|handle| async move {
        if let Err(e) = handle.close().await {
            warn!(
                handle_id = %handle.id(),
                database_id = handle.database_id(),
                reason,
                error = %e,
                "Failed to close connection"
            );
        }
    }))
    .await;
}
