//! Cache storage: the stored envelope and the adapter over a key/value store.
//!
//! Expiry is owned by the backend. The adapter only encodes envelopes,
//! forwards the TTL, and classifies every read as hit, miss or failure.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use lru::LruCache;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("failed to encode cached response")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode cached response")]
    Decode(#[source] serde_json::Error),
    #[error("cached response is corrupt: {reason}")]
    Corrupt { reason: String },
    #[error("response body is not valid UTF-8 text")]
    NonTextBody,
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "unavailable",
            Self::Encode(_) => "encode",
            Self::Decode(_) => "decode",
            Self::Corrupt { .. } => "corrupt",
            Self::NonTextBody => "non_text_body",
        }
    }
}

/// Envelope persisted per cache key.
///
/// Field names follow the JSON layout already present in the shared store:
/// `{"Headers": {name: [values]}, "Body": "...", "Status": 200}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CachedResponse {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
    pub status: u16,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::deserialize(deserializer)?.unwrap_or_default())
}

impl CachedResponse {
    /// Capture an upstream response as a storable envelope.
    ///
    /// Multi-valued headers keep their order. Values that are not visible
    /// ASCII cannot be stored as text and are dropped.
    pub fn capture(status: StatusCode, headers: &HeaderMap, body: &Bytes) -> Result<Self, StoreError> {
        let body = std::str::from_utf8(body)
            .map_err(|_| StoreError::NonTextBody)?
            .to_string();

        let mut stored: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                stored
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        Ok(Self {
            headers: stored,
            body,
            status: status.as_u16(),
        })
    }

    pub fn status_code(&self) -> Result<StatusCode, StoreError> {
        StatusCode::from_u16(self.status).map_err(|_| StoreError::Corrupt {
            reason: format!("invalid status code {}", self.status),
        })
    }

    /// Rebuild status, headers and body for replay.
    pub fn into_parts(self) -> Result<(StatusCode, HeaderMap, Bytes), StoreError> {
        let status = self.status_code()?;

        let mut headers = HeaderMap::new();
        for (name, values) in self.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    headers.append(name.clone(), value);
                }
            }
        }

        Ok((status, headers, Bytes::from(self.body)))
    }
}

/// Outcome of a cache read.
///
/// `Miss` and `Unavailable` lead to the same fallback (forward upstream) but
/// stay distinct so store health can be observed.
#[derive(Debug)]
pub enum Lookup {
    Hit(CachedResponse),
    Miss,
    Unavailable(StoreError),
}

/// Raw key/value backend with per-entry expiry.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Fetch the payload for `key`; `Ok(None)` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `payload` under `key`, expiring after `ttl`.
    async fn set(&self, key: &str, payload: String, ttl: Duration) -> Result<(), StoreError>;
}

/// Typed adapter over a [`ResponseStore`].
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn ResponseStore>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn ResponseStore>) -> Self {
        Self { backend }
    }

    pub async fn read(&self, key: &CacheKey) -> Lookup {
        let raw = match self.backend.get(key.as_str()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Lookup::Miss,
            Err(err) => return Lookup::Unavailable(err),
        };

        let cached: CachedResponse = match serde_json::from_str(&raw) {
            Ok(cached) => cached,
            Err(err) => return Lookup::Unavailable(StoreError::Decode(err)),
        };

        match cached.status_code() {
            Ok(_) => Lookup::Hit(cached),
            Err(err) => Lookup::Unavailable(err),
        }
    }

    pub async fn write(
        &self,
        key: &CacheKey,
        response: &CachedResponse,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(response).map_err(StoreError::Encode)?;
        self.backend.set(key.as_str(), payload, ttl).await
    }
}

struct MemoryEntry {
    payload: String,
    expires_at: Instant,
}

/// In-process store with LRU eviction and per-entry expiry.
///
/// Used for single-instance deployments and tests; entries are not shared
/// between processes.
pub struct MemoryStore {
    entries: RwLock<LruCache<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Number of stored entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "memory_len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let mut entries = rw_write(&self.entries, SOURCE, "memory_get");
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.payload.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, payload: String, ttl: Duration) -> Result<(), StoreError> {
        let entry = MemoryEntry {
            payload,
            expires_at: Instant::now() + ttl,
        };
        rw_write(&self.entries, SOURCE, "memory_set").put(key.to_string(), entry);
        Ok(())
    }
}
