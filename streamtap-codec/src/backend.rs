//! ## streamtap-codec::backend
//! **Backend contract and entry points**

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use streamtap_protocols::Decompressor;

use crate::embedded::EmbeddedBackend;
use crate::error::CodecError;
use crate::library::LibraryBackend;
use crate::signatures::SignatureSets;

/// Where the decompression routines come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    #[default]
    None,
    /// Exports of a standalone shared library.
    Library,
    /// Routines inside a module, found with the global signature set.
    Embedded,
    /// Same as `Embedded` with the regional signature set.
    EmbeddedRegion,
}

impl BackendKind {
    pub fn is_embedded(self) -> bool {
        matches!(self, BackendKind::Embedded | BackendKind::EmbeddedRegion)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

pub type SharedSizeFn = unsafe extern "C" fn(htbits: i32) -> isize;
pub type SetWindowFn =
    unsafe extern "C" fn(shared: *mut u8, htbits: i32, window: *const u8, window_size: i32);
pub type StateSizeFn = unsafe extern "C" fn() -> isize;
pub type TrainFn = unsafe extern "C" fn(
    state: *mut u8,
    shared: *const u8,
    packets: *const *const u8,
    sizes: *const i32,
    count: i32,
);
pub type DecodeFn = unsafe extern "C" fn(
    state: *mut u8,
    shared: *const u8,
    compressed: *const u8,
    compressed_len: isize,
    raw: *mut u8,
    raw_len: isize,
) -> bool;

/// Resolved network codec routines.
#[derive(Clone, Copy)]
pub struct EntryPoints {
    pub shared_size: SharedSizeFn,
    pub set_window: SetWindowFn,
    pub tcp_state_size: StateSizeFn,
    pub tcp_train: TrainFn,
    pub tcp_decode: DecodeFn,
    pub udp_state_size: StateSizeFn,
    pub udp_train: TrainFn,
    pub udp_decode: DecodeFn,
}

impl EntryPoints {
    /// Signature names an embedded scan must resolve.
    pub const NAMES: [&'static str; 8] = [
        "shared_size",
        "set_window",
        "tcp_state_size",
        "tcp_train",
        "tcp_decode",
        "udp_state_size",
        "udp_train",
        "udp_decode",
    ];

    /// Builds entry points from absolute code addresses keyed by [`Self::NAMES`].
    ///
    /// # Safety
    /// Every address must be the start of a routine with the matching
    /// signature, inside a module that stays loaded while the entry points
    /// are used.
    pub unsafe fn from_addresses(addresses: &HashMap<&'static str, usize>) -> Result<Self, CodecError> {
        let get = |name: &'static str| -> Result<usize, CodecError> {
            addresses
                .get(name)
                .copied()
                .filter(|&address| address != 0)
                .ok_or(CodecError::MissingSignature(name))
        };
        Ok(Self {
            shared_size: std::mem::transmute::<usize, SharedSizeFn>(get("shared_size")?),
            set_window: std::mem::transmute::<usize, SetWindowFn>(get("set_window")?),
            tcp_state_size: std::mem::transmute::<usize, StateSizeFn>(get("tcp_state_size")?),
            tcp_train: std::mem::transmute::<usize, TrainFn>(get("tcp_train")?),
            tcp_decode: std::mem::transmute::<usize, DecodeFn>(get("tcp_decode")?),
            udp_state_size: std::mem::transmute::<usize, StateSizeFn>(get("udp_state_size")?),
            udp_train: std::mem::transmute::<usize, TrainFn>(get("udp_train")?),
            udp_decode: std::mem::transmute::<usize, DecodeFn>(get("udp_decode")?),
        })
    }
}

impl std::fmt::Debug for EntryPoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoints")
            .field("tcp_decode", &(self.tcp_decode as usize as *const ()))
            .field("udp_decode", &(self.udp_decode as usize as *const ()))
            .finish_non_exhaustive()
    }
}

/// A loaded codec provider. Sessions keep the backend alive through the `Arc`.
pub trait CodecBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn new_session(self: Arc<Self>, transport: Transport) -> Result<Box<dyn Decompressor>, CodecError>;
}

/// Creates backends. Swapped out in tests so the selector can be exercised
/// without native modules.
pub trait BackendLoader: Send {
    fn load(&self, kind: BackendKind, path: &Path) -> Result<Arc<dyn CodecBackend>, CodecError>;

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Loads real modules from disk.
#[derive(Debug, Clone, Default)]
pub struct NativeLoader {
    signatures: SignatureSets,
}

impl NativeLoader {
    pub fn new(signatures: SignatureSets) -> Self {
        Self { signatures }
    }
}

impl BackendLoader for NativeLoader {
    fn load(&self, kind: BackendKind, path: &Path) -> Result<Arc<dyn CodecBackend>, CodecError> {
        match kind {
            BackendKind::None => Err(CodecError::NoBackend),
            BackendKind::Library => Ok(Arc::new(LibraryBackend::load(path)?)),
            BackendKind::Embedded => Ok(Arc::new(EmbeddedBackend::load(
                kind,
                path,
                &self.signatures.global,
            )?)),
            BackendKind::EmbeddedRegion => Ok(Arc::new(EmbeddedBackend::load(
                kind,
                path,
                &self.signatures.region,
            )?)),
        }
    }
}
