//! ## streamtap-codec::library
//! **Shared-library backend**

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use streamtap_protocols::Decompressor;
use tracing::info;

use crate::backend::{BackendKind, CodecBackend, EntryPoints, Transport};
use crate::error::CodecError;
use crate::session::CodecSession;

pub struct LibraryBackend {
    path: PathBuf,
    entry: EntryPoints,
    _library: Library,
}

/// Copies a function pointer out of `library`.
///
/// # Safety
/// `T` must match the exported symbol's real type.
unsafe fn export<T: Copy>(library: &Library, name: &'static str) -> Result<T, CodecError> {
    let symbol: Symbol<T> = library
        .get(name.as_bytes())
        .map_err(|_| CodecError::MissingExport(name))?;
    Ok(*symbol)
}

impl LibraryBackend {
    pub fn load(path: &Path) -> Result<Self, CodecError> {
        // SAFETY: loading runs the module's initialisers; the codec library
        // has none with side effects on this process.
        let library = unsafe { Library::new(path) }.map_err(|e| CodecError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // SAFETY: the signatures below are the codec's published ABI.
        let entry = unsafe {
            EntryPoints {
                shared_size: export(&library, "OodleNetwork1_Shared_Size")?,
                set_window: export(&library, "OodleNetwork1_Shared_SetWindow")?,
                tcp_state_size: export(&library, "OodleNetwork1TCP_State_Size")?,
                tcp_train: export(&library, "OodleNetwork1TCP_Train")?,
                tcp_decode: export(&library, "OodleNetwork1TCP_Decode")?,
                udp_state_size: export(&library, "OodleNetwork1UDP_State_Size")?,
                udp_train: export(&library, "OodleNetwork1UDP_Train")?,
                udp_decode: export(&library, "OodleNetwork1UDP_Decode")?,
            }
        };

        info!(path = %path.display(), "Codec library loaded");
        Ok(Self {
            path: path.to_path_buf(),
            entry,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CodecBackend for LibraryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Library
    }

    fn new_session(self: Arc<Self>, transport: Transport) -> Result<Box<dyn Decompressor>, CodecError> {
        let entry = self.entry;
        Ok(Box::new(CodecSession::new(self, entry, transport)?))
    }
}
