//! ## streamtap-codec::session
//! **Per-stream codec state**
//!
//! A session owns the shared dictionary, its window and the per-stream state
//! the network codec keeps between frames. Allocation mirrors the codec's
//! setup sequence: size the shared block, install a zeroed window, size the
//! state and train it with no packets.

use std::sync::Arc;

use streamtap_protocols::{Decompressor, ProtocolError};

use crate::backend::{CodecBackend, DecodeFn, EntryPoints, Transport};
use crate::error::CodecError;

pub const HASH_TABLE_BITS: i32 = 19;
pub const WINDOW_SIZE: usize = 0x10_0000;

/// 8-byte aligned scratch block handed to the codec.
struct AlignedBlock(Vec<u64>);

impl AlignedBlock {
    fn zeroed(len: usize) -> Self {
        Self(vec![0u64; len.div_ceil(8).max(1)])
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr().cast()
    }

    fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr().cast()
    }
}

pub struct CodecSession {
    transport: Transport,
    decode: DecodeFn,
    state: AlignedBlock,
    shared: AlignedBlock,
    _window: AlignedBlock,
    // Keeps the module that owns the entry points loaded.
    _backend: Arc<dyn CodecBackend>,
}

impl CodecSession {
    pub fn new(
        backend: Arc<dyn CodecBackend>,
        entry: EntryPoints,
        transport: Transport,
    ) -> Result<Self, CodecError> {
        let (state_size, train, decode) = match transport {
            Transport::Tcp => (entry.tcp_state_size, entry.tcp_train, entry.tcp_decode),
            Transport::Udp => (entry.udp_state_size, entry.udp_train, entry.udp_decode),
        };

        // SAFETY: entry points come from a loaded backend that `_backend`
        // keeps alive; every buffer is sized by the codec's own size query.
        unsafe {
            let shared_len = usize::try_from((entry.shared_size)(HASH_TABLE_BITS))
                .map_err(|_| CodecError::Session("negative shared size".to_string()))?;
            let mut shared = AlignedBlock::zeroed(shared_len);
            let window = AlignedBlock::zeroed(WINDOW_SIZE);
            (entry.set_window)(
                shared.as_mut_ptr(),
                HASH_TABLE_BITS,
                window.as_ptr(),
                WINDOW_SIZE as i32,
            );

            let state_len = usize::try_from(state_size())
                .map_err(|_| CodecError::Session("negative state size".to_string()))?;
            let mut state = AlignedBlock::zeroed(state_len);
            train(
                state.as_mut_ptr(),
                shared.as_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                0,
            );

            Ok(Self {
                transport,
                decode,
                state,
                shared,
                _window: window,
                _backend: backend,
            })
        }
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }
}

impl Decompressor for CodecSession {
    fn decompress(&mut self, input: &[u8], decompressed_len: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut out = vec![0u8; decompressed_len];
        // SAFETY: both slices are valid for the lengths passed; the state and
        // shared blocks were initialised in `new`.
        let ok = unsafe {
            (self.decode)(
                self.state.as_mut_ptr(),
                self.shared.as_ptr(),
                input.as_ptr(),
                input.len() as isize,
                out.as_mut_ptr(),
                decompressed_len as isize,
            )
        };
        if ok {
            Ok(out)
        } else {
            Err(ProtocolError::Decompression(format!(
                "{:?} decode rejected {} bytes",
                self.transport,
                input.len()
            )))
        }
    }
}
