//! Timed caches
//!
//! `ExpiringCache` is the generic primitive behind the trigger index;
//! `CacheSweeper` reclaims expired entries in the background.

mod expiring_cache;
mod sweeper;

pub use expiring_cache::{CacheStats, ExpiringCache};
pub use sweeper::CacheSweeper;

use std::time::Duration;

/// A cache the sweeper can purge
pub trait Sweep: Send + Sync {
    fn cache_name(&self) -> &str;
    fn sweep_interval(&self) -> Duration;
    /// Drop expired entries, returning how many were removed
    fn sweep(&self) -> usize;
}
