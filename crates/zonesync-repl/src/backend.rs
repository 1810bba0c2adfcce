//! Metadata record backend.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Fetch, store and remove for metadata records, chosen once per controller.
///
/// Keys have the form `section:name`.
#[async_trait]
pub trait MetadataBackend: Send + Sync {
    /// Reads the record from the source zone. `None` means it was deleted there.
    async fn fetch(&self, key: &str) -> Result<Option<Bytes>>;

    /// Writes the record locally.
    async fn store(&self, key: &str, value: Bytes) -> Result<()>;

    /// Removes the record locally. Removing a missing record succeeds.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Metadata log shard the key belongs to.
    fn shard_for(&self, key: &str, num_shards: u32) -> u32;
}

/// Stable FNV-1a shard mapping for `section:name` keys.
pub fn hash_shard(key: &str, num_shards: u32) -> u32 {
    if num_shards == 0 {
        return 0;
    }
    let mut hash: u32 = 0x811c_9dc5;
    for b in key.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % num_shards
}
