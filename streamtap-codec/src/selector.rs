//! ## streamtap-codec::selector
//! **Codec backend selection**
//!
//! Owned replacement for process-wide codec state. Embedded discovery is the
//! fallback: before honouring the first embedded request, the selector tries
//! a standalone codec library from the well-known search paths. Once that
//! succeeds, later embedded requests are ignored; once it fails, it is not
//! tried again until a library (or no codec) is requested explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use streamtap_protocols::Decompressor;
use tracing::{debug, info, warn};

use crate::backend::{BackendKind, BackendLoader, CodecBackend, Transport};
use crate::error::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoDetect {
    /// Try the search paths on the next embedded request.
    Enabled,
    /// A library was found; embedded requests are ignored.
    Detected,
    /// Search failed; embedded requests are honoured directly.
    Disabled,
}

struct ActiveBackend {
    kind: BackendKind,
    path: PathBuf,
    backend: Arc<dyn CodecBackend>,
}

pub struct CodecSelector {
    loader: Box<dyn BackendLoader>,
    search_paths: Vec<PathBuf>,
    auto_detect: AutoDetect,
    active: Option<ActiveBackend>,
}

/// `<exe dir>/plugins/<library_name>`.
pub fn default_search_paths(library_name: &str) -> Vec<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("plugins").join(library_name)))
        .into_iter()
        .collect()
}

impl CodecSelector {
    pub fn new(loader: Box<dyn BackendLoader>, search_paths: Vec<PathBuf>) -> Self {
        Self {
            loader,
            search_paths,
            auto_detect: AutoDetect::Enabled,
            active: None,
        }
    }

    pub fn auto_detect(&self) -> AutoDetect {
        self.auto_detect
    }

    pub fn current_kind(&self) -> BackendKind {
        self.active
            .as_ref()
            .map_or(BackendKind::None, |active| active.kind)
    }

    pub fn current_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.path.as_path())
    }

    /// Requests a backend. See the module docs for how embedded requests
    /// interact with library auto-detection.
    pub fn configure(&mut self, kind: BackendKind, path: &Path) -> Result<(), CodecError> {
        if kind.is_embedded() {
            match self.auto_detect {
                AutoDetect::Detected => {
                    debug!(?kind, "Codec library already detected; ignoring request");
                    return Ok(());
                }
                AutoDetect::Enabled => {
                    self.teardown();
                    if self.detect_library() {
                        return Ok(());
                    }
                    self.auto_detect = AutoDetect::Disabled;
                    info!("No codec library found; falling back to embedded discovery");
                }
                AutoDetect::Disabled => {}
            }
        } else {
            self.auto_detect = AutoDetect::Enabled;
        }

        if kind == BackendKind::None {
            self.teardown();
            return Ok(());
        }
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.kind == kind && active.path == path)
        {
            return Ok(());
        }

        self.teardown();
        let backend = self.loader.load(kind, path)?;
        info!(?kind, path = %path.display(), "Codec backend ready");
        self.active = Some(ActiveBackend {
            kind,
            path: path.to_path_buf(),
            backend,
        });
        Ok(())
    }

    /// A new decompressor bound to the current backend, or `None` when no
    /// backend is configured or session setup fails.
    pub fn create(&self, transport: Transport) -> Option<Box<dyn Decompressor>> {
        let active = self.active.as_ref()?;
        match Arc::clone(&active.backend).new_session(transport) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, ?transport, "Codec session setup failed");
                None
            }
        }
    }

    fn detect_library(&mut self) -> bool {
        for path in &self.search_paths {
            if !self.loader.exists(path) {
                continue;
            }
            match self.loader.load(BackendKind::Library, path) {
                Ok(backend) => {
                    info!(path = %path.display(), "Codec library auto-detected");
                    self.active = Some(ActiveBackend {
                        kind: BackendKind::Library,
                        path: path.clone(),
                        backend,
                    });
                    self.auto_detect = AutoDetect::Detected;
                    return true;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Codec library failed to load"),
            }
        }
        false
    }

    fn teardown(&mut self) {
        if let Some(active) = self.active.take() {
            debug!(kind = ?active.kind, "Releasing codec backend");
        }
    }
}
