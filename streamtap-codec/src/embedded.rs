//! ## streamtap-codec::embedded
//! **Signature-scanned backend**
//!
//! Loads a module that statically links the codec, walks its executable
//! mappings in `/proc/self/maps` and locates every entry point with the
//! configured signature set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use streamtap_protocols::Decompressor;
use tracing::{debug, info};

use crate::backend::{BackendKind, CodecBackend, EntryPoints, Transport};
use crate::error::CodecError;
use crate::session::CodecSession;
use crate::signatures::{SignatureScanner, SignatureSet};

/// One mapped address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    pub start: usize,
    pub end: usize,
}

impl MappedRegion {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Executable ranges of `module` listed in a `/proc/<pid>/maps` dump.
pub fn executable_regions(maps: &str, module: &Path) -> Vec<MappedRegion> {
    maps.lines()
        .filter_map(|line| {
            let mut fields = line.splitn(6, char::is_whitespace);
            let range = fields.next()?;
            let perms = fields.next()?;
            let path = fields.nth(3)?.trim();
            if !perms.contains('x') || Path::new(path) != module {
                return None;
            }
            let (start, end) = range.split_once('-')?;
            let start = usize::from_str_radix(start, 16).ok()?;
            let end = usize::from_str_radix(end, 16).ok()?;
            (end > start).then_some(MappedRegion { start, end })
        })
        .collect()
}

pub struct EmbeddedBackend {
    kind: BackendKind,
    path: PathBuf,
    entry: EntryPoints,
    _module: Library,
}

impl EmbeddedBackend {
    pub fn load(kind: BackendKind, path: &Path, signatures: &SignatureSet) -> Result<Self, CodecError> {
        if signatures.is_empty() {
            return Err(CodecError::NoSignatures);
        }
        let scanner = SignatureScanner::new(signatures)?;

        // SAFETY: the module is loaded for its code only; nothing is called
        // until every entry point has been located.
        let module = unsafe { Library::new(path) }.map_err(|e| CodecError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let canonical = path.canonicalize()?;
        let maps = read_own_maps()?;
        let regions = executable_regions(&maps, &canonical);
        debug!(path = %canonical.display(), regions = regions.len(), "Scanning module");

        let mut addresses: HashMap<&'static str, usize> = HashMap::new();
        for region in &regions {
            // SAFETY: the region is an executable mapping of `module`, which
            // stays loaded for this whole scope.
            let code = unsafe { std::slice::from_raw_parts(region.start as *const u8, region.len()) };
            let found = scanner.scan(code);
            for name in EntryPoints::NAMES {
                if let Some(offset) = found.get(name) {
                    addresses.entry(name).or_insert(region.start + offset);
                }
            }
        }

        // SAFETY: addresses were verified against the signatures inside the
        // module kept in `_module`.
        let entry = unsafe { EntryPoints::from_addresses(&addresses)? };

        info!(path = %path.display(), ?kind, "Codec located by signature scan");
        Ok(Self {
            kind,
            path: path.to_path_buf(),
            entry,
            _module: module,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
fn read_own_maps() -> Result<String, CodecError> {
    Ok(std::fs::read_to_string("/proc/self/maps")?)
}

#[cfg(not(target_os = "linux"))]
fn read_own_maps() -> Result<String, CodecError> {
    Err(CodecError::Unsupported("embedded codec discovery"))
}

impl CodecBackend for EmbeddedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn new_session(self: Arc<Self>, transport: Transport) -> Result<Box<dyn Decompressor>, CodecError> {
        let entry = self.entry;
        Ok(Box::new(CodecSession::new(self, entry, transport)?))
    }
}
