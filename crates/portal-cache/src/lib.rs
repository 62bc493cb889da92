mod client;
mod message;
mod token;

pub use client::{Cache, CacheConfig, CacheError};
pub use message::{ChunkMessage, PortalMessage, UriMessage};
pub use token::{CacheToken, TokenError, TokenPayload};

/// The pub/sub channel shared by the gateway and the worker. The two
/// processes share no state other than cache entries and this channel.
pub const CHANNEL: &str = "data-portal";

/// TTL of encoded chunk bytes. Everything else uses the configured cache
/// expiry (default 3600s).
pub const CHUNK_TTL: u64 = 360;

pub const DEFAULT_EXPIRY: u64 = 3600;

/// Key of the serialized dataset handle belonging to a load token.
pub fn dset_key(token: &CacheToken) -> String {
    format!("{}-dset", token.as_str())
}

/// Key of one encoded chunk: `<token>-<variable>-<chunk_id>`.
pub fn chunk_key(token: &CacheToken, variable: &str, chunk_id: &str) -> String {
    format!("{}-{}-{}", token.as_str(), variable, chunk_id)
}
