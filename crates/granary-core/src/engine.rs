//! Cached database engines keyed by connection identity.
//!
//! Engines are pooled `sqlx` handles tagged with their SQL dialect. A
//! process-global cache deduplicates them by `(connection_type, canonical
//! config)`; callers opt out per call with `reuse = false`. Cached engines
//! are owned by the cache and are only closed through [`close_all_engines`].

use std::collections::HashMap;
use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::dialect::Dialect;
use crate::error::EtlError;
use crate::JsonMap;

const SENSITIVE_KEY_PARTS: &[&str] = &["password", "token", "secret", "key"];

/// A pooled database handle plus the dialect it speaks.
#[derive(Clone)]
pub struct DbEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    pool: AnyPool,
    dialect: Dialect,
}

impl DbEngine {
    /// Connect a new engine from a database URL. The dialect is derived
    /// from the URL scheme; the sqlx `Any` driver set must cover it for the
    /// connection to succeed.
    pub async fn connect(url: &str, acquire_timeout_seconds: u64) -> Result<Self, EtlError> {
        install_drivers_once();
        let dialect = Dialect::from_url(url)?;
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(acquire_timeout_seconds))
            .connect(url)
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(EngineInner { pool, dialect }),
        })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.inner.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.inner.dialect
    }

    /// True when both values refer to the same cached handle.
    pub fn same_handle(&self, other: &DbEngine) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run the dialect's health-check query.
    pub async fn health_check(&self) -> Result<(), EtlError> {
        sqlx::query(self.dialect().health_check_query())
            .execute(self.pool())
            .await
            .map_err(|e| EtlError::ConnectionFailed(e.to_string()))?;
        Ok(())
    }

    /// Close the underlying pool. Cached handles are owned by the cache and
    /// must be closed through [`close_all_engines`]; call this only on
    /// engines created with `reuse = false`.
    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

fn install_drivers_once() {
    static INSTALL: OnceLock<()> = OnceLock::new();
    INSTALL.get_or_init(sqlx::any::install_default_drivers);
}

type EngineCache = Mutex<HashMap<(String, String), DbEngine>>;

fn engine_cache() -> &'static EngineCache {
    static CACHE: OnceLock<EngineCache> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Canonical cache-key form of a config: sorted `key=value` pairs joined by
/// `|`. Sensitive values are folded into a fingerprint so the key still
/// distinguishes credentials without carrying them.
pub fn canonical_config(config: &JsonMap) -> String {
    let mut keys: Vec<&String> = config.keys().collect();
    keys.sort();

    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let value = &config[key];
        let rendered = if is_sensitive(key) && !value.is_null() {
            let mut hasher = DefaultHasher::new();
            value.to_string().hash(&mut hasher);
            format!("#{:016x}", hasher.finish())
        } else {
            match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        };
        parts.push(format!("{}={}", key, rendered));
    }
    parts.join("|")
}

fn is_sensitive(key: &str) -> bool {
    let lowered = key.to_lowercase();
    SENSITIVE_KEY_PARTS.iter().any(|part| lowered.contains(part))
}

/// Return the cached engine for `(connection_type, config)` or create and
/// store a new one. `reuse = false` bypasses both lookup and storage.
pub async fn get_or_create_engine<F, Fut>(
    connection_type: &str,
    config: &JsonMap,
    factory: F,
    reuse: bool,
) -> Result<DbEngine, EtlError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<DbEngine, EtlError>>,
{
    if !reuse {
        debug!(connection_type, "engine reuse disabled, creating new engine");
        return factory().await;
    }

    let key = (connection_type.to_string(), canonical_config(config));

    // Holding the async lock across creation serializes insertion, so two
    // racing callers with the same key end up sharing one handle.
    let mut cache = engine_cache().lock().await;
    if let Some(engine) = cache.get(&key) {
        debug!(connection_type, "engine cache hit");
        return Ok(engine.clone());
    }

    let engine = factory().await?;
    cache.insert(key, engine.clone());
    info!(connection_type, "engine cache miss, new engine created");
    Ok(engine)
}

/// Close every cached engine and empty the cache.
pub async fn close_all_engines() {
    let engines: Vec<DbEngine> = {
        let mut cache = engine_cache().lock().await;
        cache.drain().map(|(_, engine)| engine).collect()
    };
    let count = engines.len();
    for engine in engines {
        engine.close().await;
    }
    info!(count, "closed cached engines");
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

    #[test]
    fn canonical_config_sorts_keys() {
        let a = map(&[("b", json!(2)), ("a", json!("x"))]);
        let b = map(&[("a", json!("x")), ("b", json!(2))]);
        assert_eq!(canonical_config(&a), canonical_config(&b));
        assert_eq!(canonical_config(&a), "a=x|b=2");
    }

    #[test]
    fn canonical_config_fingerprints_secrets() {
        let with_secret = map(&[("host", json!("h")), ("password", json!("hunter2"))]);
        let rendered = canonical_config(&with_secret);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("password=#"));

        // Different secrets still produce different keys.
        let other = map(&[("host", json!("h")), ("password", json!("hunter3"))]);
        assert_ne!(rendered, canonical_config(&other));
    }

    fn sqlite_url(dir: &tempfile::TempDir, name: &str) -> String {
        format!("sqlite://{}?mode=rwc", dir.path().join(name).display())
    }

    #[tokio::test]
    async fn cache_identity_reuse_and_close_all() {
        let dir = tempfile::tempdir().unwrap();
        let url = sqlite_url(&dir, "engine_cache.db");
        let config = map(&[("database_path", json!(url.clone()))]);

        let first = get_or_create_engine("test_engine_cache", &config, || {
            DbEngine::connect(&url, 5)
        }, true)
        .await
        .unwrap();
        let second = get_or_create_engine("test_engine_cache", &config, || {
            DbEngine::connect(&url, 5)
        }, true)
        .await
        .unwrap();
        assert!(first.same_handle(&second));

        let bypassed = get_or_create_engine("test_engine_cache", &config, || {
            DbEngine::connect(&url, 5)
        }, false)
        .await
        .unwrap();
        assert!(!first.same_handle(&bypassed));

        close_all_engines().await;

        let fresh = get_or_create_engine("test_engine_cache", &config, || {
            DbEngine::connect(&url, 5)
        }, true)
        .await
        .unwrap();
        assert!(!fresh.same_handle(&first));
    }

    #[tokio::test]
    async fn health_check_runs_select_one() {
        let dir = tempfile::tempdir().unwrap();
        let url = sqlite_url(&dir, "health.db");
        let engine = DbEngine::connect(&url, 5).await.unwrap();
        engine.health_check().await.unwrap();
        assert_eq!(engine.dialect(), Dialect::Sqlite);
    }
}
