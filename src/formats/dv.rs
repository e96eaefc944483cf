//! DV tooling driven through external commands.

use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use super::{FormatError, VolumeMeta, VolumeReader};

/// [`VolumeReader`] backed by the instrument vendor's command-line tools:
/// a header probe printing one `field: value` line per metadata field, and
/// a DV to MRC converter taking source and destination paths.
pub struct CommandReader {
    probe_bin: PathBuf,
    convert_bin: PathBuf,
}
impl CommandReader {
    pub fn new(probe_bin: impl Into<PathBuf>, convert_bin: impl Into<PathBuf>) -> Self {
        Self {
            probe_bin: probe_bin.into(),
            convert_bin: convert_bin.into(),
        }
    }

    fn run(&self, bin: &Path, args: &[&Path], context: &Path) -> Result<String, FormatError> {
        let output = Command::new(bin)
            .args(args)
            .output()
            .map_err(|source| FormatError::Io {
                path: bin.to_path_buf(),
                source,
            })?;
        if !output.status.success() {
            return Err(FormatError::Conversion {
                path: context.to_path_buf(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
impl VolumeReader for CommandReader {
    fn probe(&self, path: &Path) -> Result<VolumeMeta, FormatError> {
        let stdout = self.run(&self.probe_bin, &[path], path)?;
        parse_header(&stdout, path)
    }
    fn convert(&self, src: &Path, dest: &Path) -> Result<(), FormatError> {
        self.run(&self.convert_bin, &[src, dest], src)?;
        if !dest.exists() {
            return Err(FormatError::Conversion {
                path: src.to_path_buf(),
                detail: format!("converter produced no output at {}", dest.display()),
            });
        }
        Ok(())
    }
}

fn parse_header(text: &str, path: &Path) -> Result<VolumeMeta, FormatError> {
    let re_dims = Regex::new(r"(?m)^\s*dimensions\s*:\s*(\d+)\s+(\d+)\s+(\d+)")?;
    let re_channels = Regex::new(r"(?m)^\s*channels\s*:\s*(\d+)")?;
    let re_pixel = Regex::new(r"(?m)^\s*pixel size\s*:\s*([0-9.eE+-]+)")?;
    let re_zstep = Regex::new(r"(?m)^\s*z step\s*:\s*([0-9.eE+-]+)")?;
    let re_waves = Regex::new(r"(?m)^\s*wavelengths\s*:\s*([0-9 ]+)")?;

    let dims = re_dims
        .captures(text)
        .ok_or_else(|| FormatError::MissingMetadata {
            field: "dimensions",
            path: path.to_path_buf(),
        })?;
    let mut meta = VolumeMeta {
        nx: dims[1].parse().unwrap_or(0),
        ny: dims[2].parse().unwrap_or(0),
        nz: dims[3].parse().unwrap_or(0),
        // single-channel files may omit the channel count
        channels: 1,
        ..Default::default()
    };
    if let Some(capts) = re_channels.captures(text) {
        meta.channels = capts[1].parse().unwrap_or(0);
    }
    if let Some(capts) = re_pixel.captures(text) {
        meta.pixel_size_um = capts[1].parse::<f64>().ok();
    }
    if let Some(capts) = re_zstep.captures(text) {
        meta.z_step_um = capts[1].parse::<f64>().ok();
    }
    if let Some(capts) = re_waves.captures(text) {
        meta.wavelengths = capts[1]
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect();
    }
    Ok(meta)
}
