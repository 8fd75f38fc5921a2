//! # streamtap-engine
//!
//! Ties capture, reassembly and decoding together for one target process.
//!
//! ### Key Submodules:
//! - `connections`: Joins discovery snapshots into long-lived tracked connections
//! - `discovery`: `/proc` based connection provider
//! - `pipeline`: IP -> TCP -> framing stages for one direction
//! - `monitor`: Worker thread, lifecycle and subscriber fan-out
//! - `settings`: Configuration to runtime type mapping

pub mod connections;
pub mod discovery;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod settings;

pub use connections::{
    ConnectionDescriptor, ConnectionProvider, ConnectionTracker, RefreshOutcome,
    TrackedConnection, TransportProtocol,
};
pub use discovery::{ProcNetProvider, Target};
pub use error::{DiscoveryError, MonitorError};
pub use monitor::{MonitorState, NetworkMonitor, ProviderFactory, SocketFactory};
pub use pipeline::{DecompressorFactory, DirectionPipeline, PipelineFactory, PipelineOutput};
pub use settings::MonitorSettings;
