//! Cache tiers: the in-process L1 map and the shared L2 backends.

mod local;
mod memory;
mod redis;
mod remote;

pub use local::{CachedEntry, LocalTier};
pub use memory::MemoryRemoteTier;
pub use self::redis::RedisTier;
pub(crate) use self::redis::with_timeout;
pub use remote::{RemoteStats, RemoteTier};
