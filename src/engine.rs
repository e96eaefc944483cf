//! The reconstruction engine boundary.
//!
//! The engine is an external GPU program. This module sees it as two
//! operations behind [`ReconEngine`] and a failure signal carrying an exit
//! code and diagnostic text; classification into [`EngineError`] happens
//! here, from that signal alone, so the rest of the pipeline never depends
//! on engine internals.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::ParameterSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine rejected its input: {0}")]
    InvalidInput(String),
    #[error("engine ran out of compute resources: {0}")]
    ResourceExhausted(String),
    #[error("engine crashed or timed out: {0}")]
    CrashedOrTimedOut(String),
    #[error("engine failed: {0}")]
    Unknown(String),
}
impl EngineError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ResourceExhausted(_) | EngineError::CrashedOrTimedOut(_)
        )
    }
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid-input",
            EngineError::ResourceExhausted(_) => "resource-exhausted",
            EngineError::CrashedOrTimedOut(_) => "crashed-or-timed-out",
            EngineError::Unknown(_) => "unknown",
        }
    }
}

const RESOURCE_MARKERS: &[&str] = &[
    "out of memory",
    "cannot allocate",
    "allocation failed",
    "resource temporarily unavailable",
    "device busy",
    "insufficient",
];
const INPUT_MARKERS: &[&str] = &[
    "invalid",
    "unsupported",
    "corrupt",
    "malformed",
    "cannot read",
    "no such file",
    "bad header",
];

/// Raw failure signal from one engine invocation.
#[derive(Debug, Clone)]
pub struct EngineFailure {
    pub code: Option<i32>,
    pub detail: String,
    pub timed_out: bool,
}
impl EngineFailure {
    pub fn from_parts(code: Option<i32>, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            timed_out: false,
        }
    }
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self {
            code: None,
            detail: detail.into(),
            timed_out: true,
        }
    }

    /// Classify the signal into an [`EngineError`] from the exit status and
    /// the diagnostic text, never from reconstruction semantics.
    pub fn classify(self) -> EngineError {
        let EngineFailure {
            code,
            detail,
            timed_out,
        } = self;
        let detail = if detail.trim().is_empty() {
            match code {
                Some(code) => format!("exit code {} with no diagnostics", code),
                None => "terminated without an exit code".to_string(),
            }
        } else {
            detail
        };
        if timed_out || code.is_none() {
            return EngineError::CrashedOrTimedOut(detail);
        }
        let lower = detail.to_lowercase();
        if RESOURCE_MARKERS.iter().any(|marker| lower.contains(marker)) {
            return EngineError::ResourceExhausted(detail);
        }
        if INPUT_MARKERS.iter().any(|marker| lower.contains(marker)) {
            return EngineError::InvalidInput(detail);
        }
        EngineError::Unknown(detail)
    }
}

/// The two engine operations the pipeline needs.
pub trait ReconEngine: Send + Sync {
    /// Derive an OTF from a converted PSF volume.
    fn make_otf(
        &self,
        psf: &Path,
        dest: &Path,
        params: &ParameterSet,
    ) -> Result<(), EngineFailure>;
    /// Reconstruct a converted acquisition against an OTF.
    fn reconstruct(
        &self,
        volume: &Path,
        otf: &Path,
        params: &ParameterSet,
        dest: &Path,
    ) -> Result<PathBuf, EngineFailure>;
}

/// [`ReconEngine`] that drives the engine executables as subprocesses.
///
/// Parameters are handed over as a flat `key=value` file next to the
/// destination artifact. An optional wall-clock ceiling kills calls that
/// overrun it; the kill is reported as a timeout signal.
pub struct CommandEngine {
    recon_bin: PathBuf,
    otf_bin: PathBuf,
    ceiling: Option<Duration>,
}
impl CommandEngine {
    pub fn new(recon_bin: impl Into<PathBuf>, otf_bin: impl Into<PathBuf>) -> Self {
        Self {
            recon_bin: recon_bin.into(),
            otf_bin: otf_bin.into(),
            ceiling: None,
        }
    }
    pub fn timeout(self, ceiling: Duration) -> Self {
        Self {
            ceiling: Some(ceiling),
            ..self
        }
    }

    fn write_params(&self, dest: &Path, params: &ParameterSet) -> Result<PathBuf, EngineFailure> {
        let config_path = dest.with_extension("cfg");
        fs::write(&config_path, params.engine_config()).map_err(|source| {
            EngineFailure::from_parts(
                Some(1),
                format!(
                    "failed to write engine parameter file {}: {}",
                    config_path.display(),
                    source
                ),
            )
        })?;
        Ok(config_path)
    }

    fn run(&self, mut command: Command) -> Result<(), EngineFailure> {
        debug!("engine call: {:?}", command);
        command.stdout(Stdio::null()).stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|source| EngineFailure::from_parts(None, format!("failed to launch engine: {}", source)))?;
        let stderr = drain_stderr(&mut child);

        let deadline = self.ceiling.map(|ceiling| Instant::now() + ceiling);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            warn!("engine call exceeded its ceiling, killing it");
                            let _ = child.kill();
                            let _ = child.wait();
                            let detail = stderr.join().unwrap_or_default();
                            return Err(EngineFailure::timeout(format!(
                                "exceeded the configured {:?} ceiling; {}",
                                self.ceiling.unwrap_or_default(),
                                detail.trim()
                            )));
                        }
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(source) => {
                    let _ = child.kill();
                    let _ = stderr.join();
                    return Err(EngineFailure::from_parts(
                        None,
                        format!("lost track of the engine process: {}", source),
                    ));
                }
            }
        };
        let detail = stderr.join().unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(EngineFailure {
                code: status.code(),
                detail: detail.trim().to_string(),
                timed_out: false,
            })
        }
    }
}

fn drain_stderr(child: &mut Child) -> std::thread::JoinHandle<String> {
    let stderr = child.stderr.take();
    std::thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut stream) = stderr {
            let _ = stream.read_to_string(&mut buffer);
        }
        buffer
    })
}

impl ReconEngine for CommandEngine {
    fn make_otf(
        &self,
        psf: &Path,
        dest: &Path,
        params: &ParameterSet,
    ) -> Result<(), EngineFailure> {
        let config_path = self.write_params(dest, params)?;
        let mut command = Command::new(&self.otf_bin);
        command
            .arg(psf)
            .arg(dest)
            .arg("--config")
            .arg(&config_path);
        self.run(command)?;
        if !dest.exists() {
            return Err(EngineFailure::from_parts(
                Some(1),
                format!("engine reported success but produced no OTF at {}", dest.display()),
            ));
        }
        Ok(())
    }

    fn reconstruct(
        &self,
        volume: &Path,
        otf: &Path,
        params: &ParameterSet,
        dest: &Path,
    ) -> Result<PathBuf, EngineFailure> {
        let config_path = self.write_params(dest, params)?;
        let mut command = Command::new(&self.recon_bin);
        command
            .arg(volume)
            .arg(dest)
            .arg(otf)
            .arg("--config")
            .arg(&config_path);
        self.run(command)?;
        if !dest.exists() {
            return Err(EngineFailure::from_parts(
                Some(1),
                format!(
                    "engine reported success but produced no output at {}",
                    dest.display()
                ),
            ));
        }
        Ok(dest.to_path_buf())
    }
}
