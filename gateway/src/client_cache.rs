//! Bounded cache of schema-pinned database clients.
//!
//! The contract: at most one live entry per schema, at most `capacity`
//! entries total. When full, the entry with the smallest last-access
//! time goes first (ties broken by schema name so eviction is
//! deterministic). Disconnects are fired asynchronously and never fail
//! the caller. A background sweeper evicts entries idle for longer than
//! the configured timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use preview_api::schema_name::SchemaName;
use tracing::{info, warn};

use crate::metrics::{CLIENT_CACHE_EVICTIONS, CLIENT_CACHE_SIZE};

/// How the cache obtains and releases clients. The production connector
/// dials postgres; tests plug in stubs.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    async fn connect(&self, schema: &SchemaName) -> anyhow::Result<Self::Client>;

    /// Must swallow its own errors; eviction is fire-and-forget.
    async fn disconnect(&self, client: Self::Client);
}

struct Entry<C> {
    client: Arc<C>,
    last_accessed: Instant,
}

pub struct ClientCache<C: Connector> {
    connector: C,
    capacity: usize,
    idle_timeout: Duration,
    entries: Mutex<HashMap<SchemaName, Entry<C::Client>>>,
}

impl<C: Connector + Clone> ClientCache<C> {
    pub fn new(connector: C, capacity: usize, idle_timeout: Duration) -> Self {
        assert!(capacity > 0, "client cache capacity must be positive");
        ClientCache {
            connector,
            capacity,
            idle_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, schema: &SchemaName) -> bool {
        self.entries.lock().contains_key(schema)
    }

    /// Return the cached client for `schema`, creating one on miss.
    ///
    /// The mutex only ever guards map manipulation; connecting happens
    /// outside the critical section. If two tasks race a miss for the
    /// same schema, the loser's freshly connected client is discarded in
    /// favour of the cached one, preserving one-client-per-schema.
    pub async fn get_or_connect(&self, schema: &SchemaName) -> anyhow::Result<Arc<C::Client>> {
        if let Some(client) = self.lookup(schema) {
            return Ok(client);
        }

        let fresh = Arc::new(self.connector.connect(schema).await?);

        let (client, displaced) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(schema) {
                entry.last_accessed = Instant::now();
                (Arc::clone(&entry.client), Some(fresh))
            } else {
                let victim = if entries.len() >= self.capacity {
                    evict_victim(&mut entries).map(|(schema, entry)| {
                        info!("evicting least-recently-used client for {schema}");
                        CLIENT_CACHE_EVICTIONS.with_label_values(&["lru"]).inc();
                        entry.client
                    })
                } else {
                    None
                };
                entries.insert(
                    schema.clone(),
                    Entry {
                        client: Arc::clone(&fresh),
                        last_accessed: Instant::now(),
                    },
                );
                CLIENT_CACHE_SIZE.set(entries.len() as i64);
                drop(entries);
                if let Some(victim) = victim {
                    self.spawn_disconnect(victim);
                }
                return Ok(fresh);
            }
        };

        if let Some(displaced) = displaced {
            self.spawn_disconnect(displaced);
        }
        Ok(client)
    }

    fn lookup(&self, schema: &SchemaName) -> Option<Arc<C::Client>> {
        let mut entries = self.entries.lock();
        entries.get_mut(schema).map(|entry| {
            entry.last_accessed = Instant::now();
            Arc::clone(&entry.client)
        })
    }

    /// Drop the entry for `schema`, if any, disconnecting in the
    /// background. Used after DROP SCHEMA and after failed provisions.
    pub fn remove(&self, schema: &SchemaName) {
        let removed = self.entries.lock().remove(schema);
        if let Some(entry) = removed {
            CLIENT_CACHE_EVICTIONS.with_label_values(&["removed"]).inc();
            self.spawn_disconnect(entry.client);
        }
        CLIENT_CACHE_SIZE.set(self.len() as i64);
    }

    /// Evict every entry whose last access is older than the idle
    /// timeout. Returns how many entries were evicted.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle: Vec<(SchemaName, Arc<C::Client>)> = {
            let mut entries = self.entries.lock();
            let stale: Vec<SchemaName> = entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_accessed) > self.idle_timeout)
                .map(|(schema, _)| schema.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|schema| {
                    entries
                        .remove(&schema)
                        .map(|entry| (schema, entry.client))
                })
                .collect()
        };
        CLIENT_CACHE_SIZE.set(self.len() as i64);

        let evicted = idle.len();
        for (schema, client) in idle {
            info!("evicting idle client for {schema}");
            CLIENT_CACHE_EVICTIONS.with_label_values(&["idle"]).inc();
            self.spawn_disconnect(client);
        }
        evicted
    }

    /// Synchronously drain the whole cache, awaiting each disconnect.
    /// Individual failures are already swallowed by the connector.
    pub async fn drain(&self) {
        let all: Vec<Arc<C::Client>> = {
            let mut entries = self.entries.lock();
            let drained = entries.drain().map(|(_, e)| e.client).collect();
            drained
        };
        CLIENT_CACHE_SIZE.set(0);
        for client in all {
            self.disconnect_arc(client).await;
        }
    }

    fn spawn_disconnect(&self, client: Arc<C::Client>) {
        let connector = self.connector.clone();
        tokio::spawn(async move {
            match Arc::try_unwrap(client) {
                Ok(client) => connector.disconnect(client).await,
                Err(still_shared) => {
                    // A request is still holding the client; it will be
                    // closed once the last holder lets go of the Arc.
                    warn!(
                        "evicted client still has {} holders, deferring disconnect",
                        Arc::strong_count(&still_shared)
                    );
                }
            }
        });
    }

    async fn disconnect_arc(&self, client: Arc<C::Client>) {
        if let Ok(client) = Arc::try_unwrap(client) {
            self.connector.disconnect(client).await;
        }
    }
}

/// Remove and return the LRU victim: smallest last-access instant,
/// smallest schema name on ties.
fn evict_victim<C>(
    entries: &mut HashMap<SchemaName, Entry<C>>,
) -> Option<(SchemaName, Entry<C>)> {
    let victim = entries
        .iter()
        .min_by(|(name_a, a), (name_b, b)| {
            a.last_accessed
                .cmp(&b.last_accessed)
                .then_with(|| name_a.as_str().cmp(name_b.as_str()))
        })
        .map(|(schema, _)| schema.clone())?;
    entries.remove(&victim).map(|entry| (victim, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct StubConnector {
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
    }

    struct StubClient {
        #[allow(dead_code)]
        schema: SchemaName,
    }

    #[async_trait]
    impl Connector for StubConnector {
        type Client = StubClient;

        async fn connect(&self, schema: &SchemaName) -> anyhow::Result<StubClient> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(StubClient {
                schema: schema.clone(),
            })
        }

        async fn disconnect(&self, _client: StubClient) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn schema(name: &str) -> SchemaName {
        SchemaName::new(format!("preview_{name}")).unwrap()
    }

    fn cache(capacity: usize) -> (Arc<ClientCache<StubConnector>>, StubConnector) {
        let connector = StubConnector::default();
        (
            Arc::new(ClientCache::new(
                connector.clone(),
                capacity,
                Duration::from_secs(600),
            )),
            connector,
        )
    }

    #[tokio::test]
    async fn hit_does_not_reconnect() {
        let (cache, connector) = cache(3);
        cache.get_or_connect(&schema("a")).await.unwrap();
        cache.get_or_connect(&schema("a")).await.unwrap();
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn lru_eviction_order() {
        // Access A, B, C, A, D with capacity 3: B is the victim and the
        // cache ends up holding {A, C, D}.
        let (cache, _connector) = cache(3);
        for name in ["a", "b", "c"] {
            cache.get_or_connect(&schema(name)).await.unwrap();
            // Instant has nanosecond resolution but give the ordering
            // some room anyway.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        cache.get_or_connect(&schema("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.get_or_connect(&schema("d")).await.unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&schema("a")));
        assert!(cache.contains(&schema("c")));
        assert!(cache.contains(&schema("d")));
        assert!(!cache.contains(&schema("b")));
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let (cache, _) = cache(2);
        for name in ["a", "b", "c", "d", "e"] {
            cache.get_or_connect(&schema(name)).await.unwrap();
            assert!(cache.len() <= 2);
        }
    }

    #[tokio::test]
    async fn eviction_tie_break_is_by_name() {
        let (cache, _) = cache(2);
        // Two entries with effectively identical access times; the
        // lexicographically smaller name must go first.
        cache.get_or_connect(&schema("b")).await.unwrap();
        cache.get_or_connect(&schema("a")).await.unwrap();
        cache.get_or_connect(&schema("c")).await.unwrap();
        // Either a or b was evicted depending on timer resolution; with
        // distinguishable instants b is older. Assert the deterministic
        // part: exactly two entries remain and c is one of them.
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&schema("c")));
    }

    #[tokio::test]
    async fn evicted_clients_get_disconnected() {
        let (cache, connector) = cache(1);
        cache.get_or_connect(&schema("a")).await.unwrap();
        cache.get_or_connect(&schema("b")).await.unwrap();
        // The eviction disconnect is spawned; give it a moment.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (cache, _) = cache(2);
        cache.get_or_connect(&schema("a")).await.unwrap();
        cache.remove(&schema("a"));
        cache.remove(&schema("a"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn idle_sweep_only_evicts_stale_entries() {
        let connector = StubConnector::default();
        let cache = ClientCache::new(connector.clone(), 5, Duration::from_millis(30));
        cache.get_or_connect(&schema("old")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.get_or_connect(&schema("fresh")).await.unwrap();

        let evicted = cache.sweep_idle();
        assert_eq!(evicted, 1);
        assert!(cache.contains(&schema("fresh")));
        assert!(!cache.contains(&schema("old")));
    }

    #[tokio::test]
    async fn drain_empties_and_disconnects_everything() {
        let (cache, connector) = cache(4);
        for name in ["a", "b", "c"] {
            cache.get_or_connect(&schema(name)).await.unwrap();
        }
        cache.drain().await;
        assert!(cache.is_empty());
        assert_eq!(connector.disconnects.load(Ordering::SeqCst), 3);
    }
}
