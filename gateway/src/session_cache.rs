//! Short-TTL projection of authority sessions, so steady tenant
//! traffic does not hammer the authority with resolve calls.
//!
//! Concurrency is last-writer-wins: two racing inserts for the same
//! token just leave whichever snapshot landed last, and the TTL bounds
//! how stale a losing write can be.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use preview_api::models::ResolvedSession;
use utils::token::SessionToken;

use crate::metrics::SESSION_CACHE_LOOKUPS;

struct CachedSession {
    resolved: ResolvedSession,
    cached_at: Instant,
}

pub struct SessionCache {
    ttl: Duration,
    entries: Mutex<HashMap<SessionToken, CachedSession>>,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> SessionCache {
        SessionCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, token: &SessionToken) -> Option<ResolvedSession> {
        let mut entries = self.entries.lock();
        match entries.get(token) {
            Some(entry) if entry.cached_at.elapsed() <= self.ttl => {
                SESSION_CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
                Some(entry.resolved.clone())
            }
            Some(_) => {
                // Passive expiry; drop the stale snapshot on the way out.
                entries.remove(token);
                SESSION_CACHE_LOOKUPS.with_label_values(&["expired"]).inc();
                None
            }
            None => {
                SESSION_CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
                None
            }
        }
    }

    pub fn insert(&self, token: SessionToken, resolved: ResolvedSession) {
        self.entries.lock().insert(
            token,
            CachedSession {
                resolved,
                cached_at: Instant::now(),
            },
        );
    }

    /// Explicit invalidation from the authority (expiry or manual
    /// termination). Returns whether an entry was present.
    pub fn invalidate(&self, token: &SessionToken) -> bool {
        self.entries.lock().remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use preview_api::models::SchemaStatus;

    fn resolved(status: SchemaStatus) -> ResolvedSession {
        ResolvedSession {
            schema_name: None,
            selected_features: vec!["ecommerce.products".to_owned()],
            tier: "pro".to_owned(),
            schema_status: status,
            expires_at: Utc::now() + chrono::Duration::hours(4),
        }
    }

    #[test]
    fn insert_get_invalidate() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let token = SessionToken::generate();

        assert!(cache.get(&token).is_none());
        cache.insert(token.clone(), resolved(SchemaStatus::Ready));
        assert_eq!(
            cache.get(&token).unwrap().schema_status,
            SchemaStatus::Ready
        );

        assert!(cache.invalidate(&token));
        assert!(cache.get(&token).is_none());
        assert!(!cache.invalidate(&token));
    }

    #[test]
    fn entries_expire_passively() {
        let cache = SessionCache::new(Duration::from_millis(0));
        let token = SessionToken::generate();
        cache.insert(token.clone(), resolved(SchemaStatus::Ready));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&token).is_none());
        // And the expired entry is gone, not just hidden.
        assert!(cache.is_empty());
    }

    #[test]
    fn last_writer_wins() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let token = SessionToken::generate();
        cache.insert(token.clone(), resolved(SchemaStatus::Provisioning));
        cache.insert(token.clone(), resolved(SchemaStatus::Ready));
        assert_eq!(
            cache.get(&token).unwrap().schema_status,
            SchemaStatus::Ready
        );
    }
}
