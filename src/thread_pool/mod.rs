mod thread_pool;

pub use thread_pool::{
    PoolCategory, PoolCounters, PoolMetrics, TaskHandle, ThreadPoolConfig, ThreadPoolManager,
};
