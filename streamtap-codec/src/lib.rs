//! # Streamtap Codec Selection
//!
//! Chooses where the network decompression routines come from and hands out
//! per-stream sessions bound to them.
//!
//! ### Components:
//! - `selector`: Owned backend state machine with library auto-detection
//! - `library`: Routines exported by a shared library
//! - `embedded`: Routines located inside a loaded module by signature scan
//! - `signatures/`: Wildcard byte-pattern scanner built on Aho-Corasick
//! - `session`: Per-stream decoder state implementing `Decompressor`

pub mod backend;
pub mod embedded;
pub mod error;
pub mod library;
pub mod session;
pub mod selector;
pub mod signatures;

pub use backend::{BackendKind, BackendLoader, CodecBackend, EntryPoints, NativeLoader, Transport};
pub use error::CodecError;
pub use selector::{default_search_paths, AutoDetect, CodecSelector};
pub use session::CodecSession;
pub use signatures::{SignatureScanner, SignatureSet, SignatureSets};
