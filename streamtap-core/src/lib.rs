//! # streamtap-core
//!
//! Foundation layer shared by the capture, decoding and monitor crates.
//!
//! ### Key Submodules:
//! - `alloc`: Bounded capture buffer pool and its statistics
//! - `events`: Decoded message events and the subscriber list that fans them out
//! - `time`: Capture epoch clocks (wall clock and a manual clock for tests)

pub mod alloc;
pub mod error;
pub mod events;
pub mod time;

pub mod prelude {
    pub use crate::alloc::*;
    pub use crate::error::*;
    pub use crate::events::*;
    pub use crate::time::*;
}

pub use error::PoolError;
