//! Response cache for partner requests.
//!
//! - **Routes**: whitelist deciding which paths are cacheable
//! - **Keys**: deterministic key derivation from partner identity and resource
//! - **Store**: envelope encoding and the key/value adapter (Redis or in-process)
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! key_version = "2"
//!
//! [[cache.routes]]
//! pattern = "v1/bet_insights/partner-sports"
//! resource = "v1_bet_insights_partner_sports"
//! ```

mod config;
mod keys;
mod lock;
mod routes;
mod store;

pub use config::{CacheConfig, ENTRY_TTL};
pub use keys::{
    CREDENTIAL_HEADER, CacheKey, KeyBuilder, KeyVersion, KeyVersionError, PARTNER_ID_HEADER,
    PartnerIdentity,
};
pub use routes::{ClassifyError, RouteRule, RouteTable, RouteTableError};
pub use store::{CacheStore, CachedResponse, Lookup, MemoryStore, ResponseStore, StoreError};
