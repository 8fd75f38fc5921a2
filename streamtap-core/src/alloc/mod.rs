//! ## streamtap-core::alloc
//! **Capture buffer pool**
//!
//! ### Key Submodules:
//! - `pool/`: Fixed-capacity byte buffers drawn from a bounded free-list
//! - `stats/`: Acquire/release/grow counters for the pool

pub mod pool;
pub mod stats;

pub use pool::{BufferPool, PoolPolicy, PooledBuffer};
pub use stats::{PoolSnapshot, PoolStats};
