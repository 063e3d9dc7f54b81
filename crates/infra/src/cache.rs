//! Key-based response cache with fixed expirations.
//!
//! Backs the computed read endpoints (progress, calculations). Keys are
//! tenant-scoped; writers invalidate by prefix when new values land for an
//! indicator. A cache failure is never a request failure: backend errors are
//! logged and degrade to a miss.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;

use pulse_core::TenantId;

pub trait ResponseCache: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &str) -> Option<JsonValue>;
    fn put(&self, tenant_id: TenantId, key: &str, value: JsonValue, ttl: Duration);
    /// Drop every entry for the tenant whose key starts with `prefix`.
    fn invalidate_prefix(&self, tenant_id: TenantId, prefix: &str);
}

impl<C> ResponseCache for Arc<C>
where
    C: ResponseCache + ?Sized,
{
    fn get(&self, tenant_id: TenantId, key: &str) -> Option<JsonValue> {
        (**self).get(tenant_id, key)
    }

    fn put(&self, tenant_id: TenantId, key: &str, value: JsonValue, ttl: Duration) {
        (**self).put(tenant_id, key, value, ttl)
    }

    fn invalidate_prefix(&self, tenant_id: TenantId, prefix: &str) {
        (**self).invalidate_prefix(tenant_id, prefix)
    }
}

/// In-memory TTL cache for tests/dev. Expired entries are dropped lazily on
/// read.
#[derive(Debug, Default)]
pub struct InMemoryResponseCache {
    inner: RwLock<HashMap<(TenantId, String), (Instant, JsonValue)>>,
}

impl InMemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseCache for InMemoryResponseCache {
    fn get(&self, tenant_id: TenantId, key: &str) -> Option<JsonValue> {
        let lookup = (tenant_id, key.to_string());

        {
            let map = self.inner.read().ok()?;
            match map.get(&lookup) {
                Some((expires_at, value)) if *expires_at > Instant::now() => {
                    return Some(value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Entry exists but is expired; evict it.
        if let Ok(mut map) = self.inner.write() {
            map.remove(&lookup);
        }
        None
    }

    fn put(&self, tenant_id: TenantId, key: &str, value: JsonValue, ttl: Duration) {
        if let Ok(mut map) = self.inner.write() {
            map.insert((tenant_id, key.to_string()), (Instant::now() + ttl, value));
        }
    }

    fn invalidate_prefix(&self, tenant_id: TenantId, prefix: &str) {
        if let Ok(mut map) = self.inner.write() {
            map.retain(|(t, k), _| *t != tenant_id || !k.starts_with(prefix));
        }
    }
}

/// Redis-backed cache (`redis` feature). TTLs map to SETEX.
#[cfg(feature = "redis")]
pub mod redis_cache {
    use super::*;
    use redis::Commands;

    pub struct RedisResponseCache {
        client: redis::Client,
    }

    impl RedisResponseCache {
        pub fn new(url: &str) -> Result<Self, redis::RedisError> {
            Ok(Self {
                client: redis::Client::open(url)?,
            })
        }

        fn full_key(tenant_id: TenantId, key: &str) -> String {
            format!("pulse:cache:{tenant_id}:{key}")
        }
    }

    impl ResponseCache for RedisResponseCache {
        fn get(&self, tenant_id: TenantId, key: &str) -> Option<JsonValue> {
            let mut conn = match self.client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "redis cache connection failed; treating as miss");
                    return None;
                }
            };

            let raw: Option<String> = match conn.get(Self::full_key(tenant_id, key)) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "redis cache GET failed; treating as miss");
                    return None;
                }
            };

            raw.and_then(|s| serde_json::from_str(&s).ok())
        }

        fn put(&self, tenant_id: TenantId, key: &str, value: JsonValue, ttl: Duration) {
            let mut conn = match self.client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "redis cache connection failed; skipping PUT");
                    return;
                }
            };

            let payload = value.to_string();
            let secs = ttl.as_secs().max(1);
            if let Err(e) = conn.set_ex::<_, _, ()>(Self::full_key(tenant_id, key), payload, secs) {
                tracing::warn!(error = %e, "redis cache SETEX failed");
            }
        }

        fn invalidate_prefix(&self, tenant_id: TenantId, prefix: &str) {
            let mut conn = match self.client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "redis cache connection failed; skipping invalidation");
                    return;
                }
            };

            let pattern = format!("{}*", Self::full_key(tenant_id, prefix));
            let keys: Vec<String> = match conn.scan_match::<_, String>(&pattern) {
                Ok(iter) => iter.collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "redis cache SCAN failed; skipping invalidation");
                    return;
                }
            };

            // scan_match borrows the connection; delete with a fresh one.
            drop(conn);
            if keys.is_empty() {
                return;
            }
            match self.client.get_connection() {
                Ok(mut conn) => {
                    if let Err(e) = conn.del::<_, ()>(keys) {
                        tracing::warn!(error = %e, "redis cache DEL failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "redis cache connection failed; skipping DEL");
                }
            }
        }
    }
}

#[cfg(feature = "redis")]
pub use redis_cache::RedisResponseCache;
