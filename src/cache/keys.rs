//! Cache key definitions.
//!
//! A key identifies one partner's view of one whitelisted resource:
//!
//! ```text
//! :{version}:{partner_id}_{credential_token}_{resource}
//! ```
//!
//! Bumping the version tag orphans every existing entry at once; the old
//! entries then expire through the store TTL.

use std::fmt;
use std::sync::Arc;

use axum::http::HeaderMap;
use thiserror::Error;

use super::routes::{ClassifyError, RouteTable};

pub const PARTNER_ID_HEADER: &str = "partner-id";
pub const CREDENTIAL_HEADER: &str = "authorization";

const DEFAULT_KEY_VERSION: &str = "1";

/// Process-wide version tag prefixed to every key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVersion(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyVersionError {
    #[error("key version must not contain `:`")]
    ContainsDelimiter,
}

impl KeyVersion {
    /// Parse a configured tag. Blank input resolves to the default `"1"`.
    pub fn parse(raw: &str) -> Result<Self, KeyVersionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        if trimmed.contains(':') {
            return Err(KeyVersionError::ContainsDelimiter);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for KeyVersion {
    fn default() -> Self {
        Self(DEFAULT_KEY_VERSION.to_string())
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller identity taken from the `Partner-Id` and `Authorization` headers.
///
/// The credential is opaque: it only partitions the cache and is never
/// validated or logged.
#[derive(Clone, PartialEq, Eq)]
pub struct PartnerIdentity {
    partner_id: String,
    credential: String,
}

impl PartnerIdentity {
    /// Returns `None` unless both values are present and non-empty.
    pub fn new(partner_id: impl Into<String>, credential: impl Into<String>) -> Option<Self> {
        let partner_id = partner_id.into();
        let credential = credential.into();
        if partner_id.is_empty() || credential.is_empty() {
            return None;
        }
        Some(Self {
            partner_id,
            credential,
        })
    }

    /// Extract the identity headers; values that are not valid header text count as absent.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let partner_id = headers.get(PARTNER_ID_HEADER)?.to_str().ok()?;
        let credential = headers.get(CREDENTIAL_HEADER)?.to_str().ok()?;
        Self::new(partner_id, credential)
    }

    pub fn partner_id(&self) -> &str {
        &self.partner_id
    }
}

impl fmt::Debug for PartnerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartnerIdentity")
            .field("partner_id", &self.partner_id)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Fully-qualified store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives cache keys from identity and request path.
///
/// Pure: no I/O, and identical inputs always produce identical keys.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    version: KeyVersion,
    routes: Arc<RouteTable>,
}

impl KeyBuilder {
    pub fn new(version: KeyVersion, routes: Arc<RouteTable>) -> Self {
        Self { version, routes }
    }

    /// Distinct identities map to distinct keys only while partner ids
    /// contain no `_`.
    pub fn derive(&self, identity: &PartnerIdentity, path: &str) -> Result<CacheKey, ClassifyError> {
        let resource = self.routes.classify(path)?;
        Ok(CacheKey(format!(
            ":{}:{}_{}_{}",
            self.version, identity.partner_id, identity.credential, resource
        )))
    }
}
