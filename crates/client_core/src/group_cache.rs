use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use shared::domain::{GroupMetadata, Jid};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::Connection;

pub const DEFAULT_GROUP_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_GROUP_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GroupCacheConfig {
    pub ttl: Duration,
    pub fetch_timeout: Duration,
}

impl Default for GroupCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_GROUP_TTL,
            fetch_timeout: DEFAULT_GROUP_FETCH_TIMEOUT,
        }
    }
}

struct CachedGroup {
    metadata: GroupMetadata,
    fetched_at: Instant,
}

struct GroupCacheInner {
    connection: Arc<dyn Connection>,
    config: GroupCacheConfig,
    entries: Mutex<HashMap<Jid, CachedGroup>>,
}

/// Group descriptors cached for `ttl`, refreshed with a bounded fetch.
///
/// A failed refresh keeps the expired entry and serves it; a group that was never
/// fetched successfully resolves to [`GroupMetadata::placeholder`].
#[derive(Clone)]
pub struct GroupMetadataCache {
    inner: Arc<GroupCacheInner>,
}

impl GroupMetadataCache {
    pub fn new(connection: Arc<dyn Connection>, config: &GroupCacheConfig) -> Self {
        Self {
            inner: Arc::new(GroupCacheInner {
                connection,
                config: config.clone(),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn get(&self, group: &Jid) -> GroupMetadata {
        let stale = {
            let entries = self.lock_entries();
            match entries.get(group) {
                Some(entry) if entry.fetched_at.elapsed() < self.inner.config.ttl => {
                    return entry.metadata.clone();
                }
                Some(entry) => Some(entry.metadata.clone()),
                None => None,
            }
        };

        let fetched = tokio::time::timeout(
            self.inner.config.fetch_timeout,
            self.inner.connection.fetch_group_metadata(group),
        )
        .await;

        let failure = match fetched {
            Ok(Ok(metadata)) => {
                debug!(%group, subject = %metadata.subject, "group metadata refreshed");
                self.lock_entries().insert(
                    group.clone(),
                    CachedGroup {
                        metadata: metadata.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                return metadata;
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => "timed out".to_string(),
        };

        match stale {
            Some(metadata) => {
                warn!(%group, error = %failure, "group metadata refresh failed; serving stale entry");
                metadata
            }
            None => {
                warn!(%group, error = %failure, "group metadata unavailable; using placeholder");
                GroupMetadata::placeholder(group)
            }
        }
    }

    /// Returns the cached descriptor, fresh or not, without touching the network.
    pub fn peek(&self, group: &Jid) -> Option<GroupMetadata> {
        self.lock_entries()
            .get(group)
            .map(|entry| entry.metadata.clone())
    }

    pub fn invalidate(&self, group: &Jid) {
        self.lock_entries().remove(group);
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<Jid, CachedGroup>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/group_cache_tests.rs"]
mod tests;
