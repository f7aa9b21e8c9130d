//! Thread-keyed cache for reusable client sessions.
//!
//! HTTP clients and NoSQL driver handles are expensive to build and safe to
//! reuse, but carry per-connector defaults (headers, timeouts, auth), so the
//! cache key includes the current thread id in addition to the connection
//! identity. Entries are type-erased; each caller gets back the concrete
//! handle type it stored.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::canonical_config;
use crate::error::EtlError;
use crate::JsonMap;

type SessionKey = (String, String, ThreadId);
type SessionCache = Mutex<HashMap<SessionKey, Arc<dyn Any + Send + Sync>>>;

fn session_cache() -> &'static SessionCache {
    static CACHE: OnceLock<SessionCache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Return the cached session for `(connection_type, config)` on the current
/// thread or create and store a new one. `reuse = false` bypasses both
/// lookup and storage.
pub async fn get_or_create_session<T, F, Fut>(
    connection_type: &str,
    config: &JsonMap,
    factory: F,
    reuse: bool,
) -> Result<Arc<T>, EtlError>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, EtlError>>,
{
    if !reuse {
        debug!(connection_type, "session reuse disabled, creating new session");
        return Ok(Arc::new(factory().await?));
    }

    let key = (
        connection_type.to_string(),
        canonical_config(config),
        std::thread::current().id(),
    );

    let mut cache = session_cache().lock().await;
    if let Some(entry) = cache.get(&key) {
        if let Ok(typed) = Arc::clone(entry).downcast::<T>() {
            debug!(connection_type, "session cache hit");
            return Ok(typed);
        }
    }

    let created = Arc::new(factory().await?);
    cache.insert(key, created.clone());
    info!(connection_type, "session cache miss, new session created");
    Ok(created)
}

/// Drop every cached session and empty the cache.
pub async fn close_all_sessions() {
    let mut cache = session_cache().lock().await;
    let count = cache.len();
    cache.clear();
    info!(count, "closed cached sessions");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, serde_json::Value)]) -> JsonMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn build() -> Result<reqwest::Client, EtlError> {
        reqwest::Client::builder()
            .build()
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))
    }

    #[tokio::test]
    async fn same_thread_same_config_returns_same_handle() {
        let config = map(&[("base_url", json!("http://one.test"))]);
        let first = get_or_create_session("test_session_cache", &config, build, true)
            .await
            .unwrap();
        let second = get_or_create_session("test_session_cache", &config, build, true)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn reuse_false_bypasses_storage() {
        let config = map(&[("base_url", json!("http://three.test"))]);
        let first = get_or_create_session("test_session_bypass", &config, build, false)
            .await
            .unwrap();
        let second = get_or_create_session("test_session_bypass", &config, build, false)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        let cache = session_cache().lock().await;
        assert!(!cache.keys().any(|(kind, _, _)| kind == "test_session_bypass"));
    }

    #[tokio::test]
    async fn different_configs_get_distinct_handles() {
        let first = get_or_create_session(
            "test_session_distinct",
            &map(&[("base_url", json!("http://a.test"))]),
            build,
            true,
        )
        .await
        .unwrap();
        let second = get_or_create_session(
            "test_session_distinct",
            &map(&[("base_url", json!("http://b.test"))]),
            build,
            true,
        )
        .await
        .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
