//! OTF lookup and generation.
//!
//! An OTF is valid for any acquisition that shares its PSF and optics
//! parameters, so generated OTFs are cached for the life of the process.
//! The cache is an explicit object handed to the manager, which keeps
//! batches and tests isolated from each other.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::UNIX_EPOCH;

use log::{debug, info};
use sha2::{Digest, Sha256};
use strum_macros::{Display, EnumString};

use crate::config::ParameterSet;
use crate::engine::ReconEngine;
use crate::formats::{otf_output_path, FormatBridge, FormatError};

#[derive(Debug, thiserror::Error)]
pub enum OtfError {
    #[error("OTF generation failed for {}", .psf.display())]
    GenerationFailed {
        psf: PathBuf,
        #[source]
        source: crate::engine::EngineError,
    },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("failed to fingerprint PSF {}", .path.display())]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no OTF source: neither a PSF nor an override covers {wavelength} nm")]
    NoSource { wavelength: u32 },
    #[error("override OTF for {} nm not found at {}", .wavelength, .path.display())]
    MissingOverride { wavelength: u32, path: PathBuf },
}
impl OtfError {
    pub fn kind(&self) -> &'static str {
        match self {
            OtfError::GenerationFailed { .. } => "generation-failed",
            OtfError::Format(inner) => inner.kind(),
            OtfError::Fingerprint { .. } => "fingerprint",
            OtfError::NoSource { .. } => "no-source",
            OtfError::MissingOverride { .. } => "missing-override",
        }
    }
}

/// How a PSF file's identity enters the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PsfKeying {
    /// Digest of the file contents; a rewritten PSF always misses.
    ContentHash,
    /// Path plus modification time; cheaper, trusts the filesystem clock.
    PathMtime,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OtfKey {
    psf_id: String,
    wavelength: u32,
    optics: Vec<(String, String)>,
}

/// A usable OTF artifact.
#[derive(Debug, Clone)]
pub struct OtfHandle {
    pub path: PathBuf,
}

type Slot = Arc<Mutex<Option<OtfHandle>>>;

/// Process-wide OTF cache. Populated lazily, cleared on demand, gone at
/// process exit.
#[derive(Default)]
pub struct OtfCache {
    slots: Mutex<HashMap<OtfKey, Slot>>,
}
impl OtfCache {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn clear(&self) {
        self.slots.lock().expect("OTF cache mutex poisoned").clear();
    }
    /// Number of keys holding a generated OTF.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .expect("OTF cache mutex poisoned")
            .values()
            .filter(|slot| slot.lock().expect("OTF slot mutex poisoned").is_some())
            .count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn slot(&self, key: &OtfKey) -> Slot {
        self.slots
            .lock()
            .expect("OTF cache mutex poisoned")
            .entry(key.clone())
            .or_default()
            .clone()
    }
}

pub struct OtfManager {
    cache: Arc<OtfCache>,
    keying: PsfKeying,
    psf: Option<PathBuf>,
    overrides: HashMap<u32, PathBuf>,
    otf_dir: Option<PathBuf>,
}
impl OtfManager {
    pub fn new(cache: Arc<OtfCache>) -> Self {
        Self {
            cache,
            keying: PsfKeying::ContentHash,
            psf: None,
            overrides: HashMap::new(),
            otf_dir: None,
        }
    }
    /// PSF capture OTFs are generated from.
    pub fn psf(self, path: impl Into<PathBuf>) -> Self {
        Self {
            psf: Some(path.into()),
            ..self
        }
    }
    pub fn keying(self, keying: PsfKeying) -> Self {
        Self { keying, ..self }
    }
    /// Directory generated OTFs are written to; next to the PSF if unset.
    pub fn otf_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            otf_dir: Some(dir.into()),
            ..self
        }
    }
    /// Use a pre-built OTF for one wavelength instead of generating.
    pub fn override_otf(mut self, wavelength: u32, path: impl Into<PathBuf>) -> Self {
        self.overrides.insert(wavelength, path.into());
        self
    }

    /// Return the OTF matching the resolved parameters, generating it on
    /// first request. Concurrent callers for the same key block on the
    /// key's slot, so at most one generation runs per key; a failed
    /// generation leaves the slot empty and the next caller retries.
    pub fn get_or_build(
        &self,
        params: &ParameterSet,
        bridge: &FormatBridge,
        engine: &dyn ReconEngine,
    ) -> Result<OtfHandle, OtfError> {
        let wavelength = params.wavelength();
        if let Some(path) = self.overrides.get(&wavelength) {
            if !path.exists() {
                return Err(OtfError::MissingOverride {
                    wavelength,
                    path: path.clone(),
                });
            }
            debug!("using override OTF {} for {} nm", path.display(), wavelength);
            return Ok(OtfHandle { path: path.clone() });
        }
        let psf = self.psf.as_deref().ok_or(OtfError::NoSource { wavelength })?;
        let key = self.key_for(psf, params)?;

        let slot = self.cache.slot(&key);
        let mut guard = slot.lock().expect("OTF slot mutex poisoned");
        if let Some(handle) = guard.as_ref() {
            debug!("OTF cache hit for {} nm", wavelength);
            return Ok(handle.clone());
        }

        let dir = self.otf_dir.clone().unwrap_or_else(|| {
            psf.parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        });
        let source = bridge.convert(psf, &dir)?;
        let dest = otf_output_path(psf, &dir, wavelength);
        engine
            .make_otf(&source.converted_path, &dest, params)
            .map_err(|failure| OtfError::GenerationFailed {
                psf: psf.to_path_buf(),
                source: failure.classify(),
            })?;
        info!("generated OTF {} for {} nm", dest.display(), wavelength);

        let handle = OtfHandle { path: dest };
        *guard = Some(handle.clone());
        Ok(handle)
    }

    fn key_for(&self, psf: &Path, params: &ParameterSet) -> Result<OtfKey, OtfError> {
        let psf_id = match self.keying {
            PsfKeying::ContentHash => {
                let mut file = File::open(psf).map_err(|source| OtfError::Fingerprint {
                    path: psf.to_path_buf(),
                    source,
                })?;
                let mut hasher = Sha256::new();
                io::copy(&mut file, &mut hasher).map_err(|source| OtfError::Fingerprint {
                    path: psf.to_path_buf(),
                    source,
                })?;
                hasher
                    .finalize()
                    .iter()
                    .map(|byte| format!("{:02x}", byte))
                    .collect()
            }
            PsfKeying::PathMtime => {
                let modified = std::fs::metadata(psf)
                    .and_then(|meta| meta.modified())
                    .map_err(|source| OtfError::Fingerprint {
                        path: psf.to_path_buf(),
                        source,
                    })?;
                let nanos = modified
                    .duration_since(UNIX_EPOCH)
                    .map(|elapsed| elapsed.as_nanos())
                    .unwrap_or_default();
                format!("{}|{}", psf.display(), nanos)
            }
        };
        Ok(OtfKey {
            psf_id,
            wavelength: params.wavelength(),
            optics: params
                .otf_fields()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        })
    }
}
