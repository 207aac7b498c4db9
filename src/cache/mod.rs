//! Fetch-result caching: in-memory mirrors over a persisted key-value store.
//!
//! Read APIs are answered synchronously from the mirrors; the SQLite store
//! only hydrates them at startup and absorbs best-effort write-throughs.

mod mirror;
mod store;
mod types;

pub use mirror::{AvatarCache, StatusCache};
pub use store::{CacheStore, NoopStore, SqliteStore};
pub use types::{AvatarRecord, StatusRecord};
