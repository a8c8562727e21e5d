//! Wire-client layer.
//!
//! [`RedisClient`] wraps a shared connection manager and exposes exactly the
//! command surface the mapping layer needs: hash and JSON key I/O, SCAN,
//! set bookkeeping, and the search-module commands (FT.CREATE, FT.DROPINDEX,
//! FT.INFO, FT.SEARCH). Every call is a suspension point; nothing else in
//! the library suspends.

pub mod redis;
pub mod retry;

pub use self::redis::RedisClient;
pub use retry::{retry, RetryConfig};
