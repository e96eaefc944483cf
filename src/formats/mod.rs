//! Conversion between instrument-native volumes and the engine format.
//!
//! The byte-level DV/MRC work lives behind [`VolumeReader`]; this module
//! owns metadata validation, deterministic output naming, and the
//! reuse-or-reconvert decision that makes reruns of a partially completed
//! batch safe.

mod dv;
pub use dv::CommandReader;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;

use crate::{OTF_NAME_STUB, RECON_NAME_STUB};

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("missing metadata field `{}` in {}", .field, .path.display())]
    MissingMetadata { field: &'static str, path: PathBuf },
    #[error("unsupported layout in {}: {}", .path.display(), .detail)]
    UnsupportedLayout { path: PathBuf, detail: String },
    #[error("failed to access {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("conversion tool failed on {}: {}", .path.display(), .detail)]
    Conversion { path: PathBuf, detail: String },
    #[error("invalid header pattern")]
    Pattern(#[from] regex::Error),
}
impl FormatError {
    pub fn kind(&self) -> &'static str {
        match self {
            FormatError::MissingMetadata { .. } => "missing-metadata",
            FormatError::UnsupportedLayout { .. } => "unsupported-layout",
            FormatError::Io { .. } => "io",
            FormatError::Conversion { .. } => "conversion",
            FormatError::Pattern(_) => "pattern",
        }
    }
}

/// Header metadata as reported by the probe, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VolumeMeta {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
    pub channels: u32,
    pub pixel_size_um: Option<f64>,
    pub z_step_um: Option<f64>,
    /// Emission wavelengths in nm, one per recorded channel
    pub wavelengths: Vec<u32>,
}

/// A raw acquisition with validated metadata and its engine-format twin.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub raw_path: PathBuf,
    pub converted_path: PathBuf,
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
    pub pixel_size_um: f64,
    pub z_step_um: Option<f64>,
    /// Wavelength recorded in the file itself
    pub wavelength: u32,
}

/// Boundary to the DV/MRC tooling.
pub trait VolumeReader: Send + Sync {
    /// Read header metadata without converting.
    fn probe(&self, path: &Path) -> Result<VolumeMeta, FormatError>;
    /// Convert `src` into the engine format at `dest`.
    fn convert(&self, src: &Path, dest: &Path) -> Result<(), FormatError>;
}

pub struct FormatBridge {
    reader: Arc<dyn VolumeReader>,
}
impl FormatBridge {
    pub fn new(reader: Arc<dyn VolumeReader>) -> Self {
        Self { reader }
    }

    /// Convert a raw file into `target_dir`, reusing an up-to-date output.
    ///
    /// The converted name derives from the input stem, so converting the
    /// same file into the same directory twice yields the same path and the
    /// second call performs no conversion work.
    pub fn convert(&self, raw: &Path, target_dir: &Path) -> Result<SourceFile, FormatError> {
        let meta = self.reader.probe(raw)?;
        if meta.channels != 1 {
            return Err(FormatError::UnsupportedLayout {
                path: raw.to_path_buf(),
                detail: format!(
                    "{} channels where a single-channel volume is required",
                    meta.channels
                ),
            });
        }
        if meta.nx == 0 || meta.ny == 0 || meta.nz == 0 {
            return Err(FormatError::UnsupportedLayout {
                path: raw.to_path_buf(),
                detail: format!("degenerate volume {}x{}x{}", meta.nx, meta.ny, meta.nz),
            });
        }
        let pixel_size_um = meta.pixel_size_um.ok_or_else(|| FormatError::MissingMetadata {
            field: "pixel size",
            path: raw.to_path_buf(),
        })?;
        let wavelength = meta
            .wavelengths
            .first()
            .copied()
            .ok_or_else(|| FormatError::MissingMetadata {
                field: "wavelength",
                path: raw.to_path_buf(),
            })?;
        let stem = file_stem(raw)?;

        fs::create_dir_all(target_dir).map_err(|source| FormatError::Io {
            path: target_dir.to_path_buf(),
            source,
        })?;
        let dest = target_dir.join(format!("{}.mrc", stem));
        if up_to_date(&dest, raw)? {
            debug!("reusing converted volume {}", dest.display());
        } else {
            self.reader.convert(raw, &dest)?;
            info!("converted {} -> {}", raw.display(), dest.display());
        }

        Ok(SourceFile {
            raw_path: raw.to_path_buf(),
            converted_path: dest,
            nx: meta.nx,
            ny: meta.ny,
            nz: meta.nz,
            pixel_size_um,
            z_step_um: meta.z_step_um,
            wavelength,
        })
    }
}

fn file_stem(path: &Path) -> Result<String, FormatError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_string)
        .ok_or_else(|| FormatError::UnsupportedLayout {
            path: path.to_path_buf(),
            detail: "file has no usable name".to_string(),
        })
}

fn up_to_date(dest: &Path, raw: &Path) -> Result<bool, FormatError> {
    if !dest.exists() {
        return Ok(false);
    }
    let dest_modified = fs::metadata(dest)
        .and_then(|meta| meta.modified())
        .map_err(|source| FormatError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
    let raw_modified = fs::metadata(raw)
        .and_then(|meta| meta.modified())
        .map_err(|source| FormatError::Io {
            path: raw.to_path_buf(),
            source,
        })?;
    Ok(dest_modified >= raw_modified)
}

/// Deterministic reconstruction output path for an input file.
pub fn recon_output_path(input: &Path, dir: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!("{}_{}.mrc", stem, RECON_NAME_STUB))
}

/// Deterministic OTF artifact path for a PSF and wavelength.
pub fn otf_output_path(psf: &Path, dir: &Path, wavelength: u32) -> PathBuf {
    let stem = psf
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!("{}_{}_{}.mrc", stem, OTF_NAME_STUB, wavelength))
}
