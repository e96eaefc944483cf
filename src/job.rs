//! One acquisition through the reconstruction pipeline.
//!
//! A [`Job`] binds an input file to a resolved parameter snapshot and walks
//! Pending → Converting → Reconstructing → Succeeded | Failed | Skipped.
//! Transient engine failures are retried up to a caller-supplied budget;
//! deterministic failures get exactly one attempt.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use strum_macros::{Display, EnumString};

use crate::config::{ConfigError, ParameterSet};
use crate::engine::{EngineError, ReconEngine};
use crate::formats::{recon_output_path, FormatBridge, FormatError};
use crate::otf::{OtfError, OtfManager};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("configuration did not resolve")]
    Config(#[from] ConfigError),
    #[error("conversion failed")]
    Format(#[from] FormatError),
    #[error("no usable OTF")]
    Otf(#[from] OtfError),
    #[error("reconstruction failed")]
    Engine(#[from] EngineError),
    #[error("cancelled before completion")]
    Cancelled,
}
impl JobError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Engine(engine) => engine.is_transient(),
            JobError::Otf(OtfError::GenerationFailed { source, .. }) => source.is_transient(),
            _ => false,
        }
    }
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Config(inner) => inner.kind(),
            JobError::Format(inner) => inner.kind(),
            JobError::Otf(inner) => inner.kind(),
            JobError::Engine(inner) => inner.kind(),
            JobError::Cancelled => "cancelled",
        }
    }
}

/// Lifecycle state of a reconstruction job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Converting,
    Reconstructing,
    Succeeded,
    Failed,
    Skipped,
}
impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped
        )
    }
}

/// Batch-level stop signal, observable between jobs and between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);
impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal record of one job.
#[derive(Debug)]
pub struct JobOutcome {
    pub input: PathBuf,
    pub status: JobStatus,
    /// Pipeline attempts, counting retries
    pub attempts: u32,
    pub output: Option<PathBuf>,
    pub error: Option<JobError>,
    /// Which layer supplied each resolved parameter
    pub provenance: BTreeMap<String, String>,
}

pub struct Job {
    input: PathBuf,
    params: ParameterSet,
    status: JobStatus,
    attempts: u32,
}
impl Job {
    pub fn new(input: impl Into<PathBuf>, params: ParameterSet) -> Self {
        Self {
            input: input.into(),
            params,
            status: JobStatus::Pending,
            attempts: 0,
        }
    }
    pub fn status(&self) -> JobStatus {
        self.status
    }
    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    fn attempt(
        &mut self,
        bridge: &FormatBridge,
        otfs: &OtfManager,
        engine: &dyn ReconEngine,
        work_dir: &Path,
        output_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<PathBuf, JobError> {
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        self.attempts += 1;
        self.status = JobStatus::Converting;
        let source = bridge.convert(&self.input, work_dir)?;
        let otf = otfs.get_or_build(&self.params, bridge, engine)?;
        if cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        self.status = JobStatus::Reconstructing;
        fs::create_dir_all(output_dir).map_err(|source| FormatError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;
        let dest = recon_output_path(&self.input, output_dir);
        let output = engine
            .reconstruct(&source.converted_path, &otf.path, &self.params, &dest)
            .map_err(|failure| JobError::Engine(failure.classify()))?;
        Ok(output)
    }

    /// Drive the job to a terminal state.
    ///
    /// The reconstruction artifact lands under `output_dir` with a name
    /// derived from the input stem, so a rerun overwrites its predecessor.
    pub fn run(
        mut self,
        bridge: &FormatBridge,
        otfs: &OtfManager,
        engine: &dyn ReconEngine,
        work_dir: &Path,
        output_dir: &Path,
        max_retries: u32,
        cancel: &CancelToken,
    ) -> JobOutcome {
        loop {
            match self.attempt(bridge, otfs, engine, work_dir, output_dir, cancel) {
                Ok(output) => {
                    self.status = JobStatus::Succeeded;
                    info!(
                        "reconstructed {} -> {}",
                        self.input.display(),
                        output.display()
                    );
                    return self.finish(Some(output), None);
                }
                Err(JobError::Cancelled) => {
                    self.status = JobStatus::Skipped;
                    return self.finish(None, None);
                }
                Err(error) if error.is_transient() && self.attempts <= max_retries => {
                    warn!(
                        "attempt {} on {} failed ({}), retrying",
                        self.attempts,
                        self.input.display(),
                        error.kind()
                    );
                }
                Err(error) => {
                    self.status = JobStatus::Failed;
                    warn!("{} failed: {}", self.input.display(), error.kind());
                    return self.finish(None, Some(error));
                }
            }
        }
    }

    fn finish(self, output: Option<PathBuf>, error: Option<JobError>) -> JobOutcome {
        JobOutcome {
            input: self.input,
            status: self.status,
            attempts: self.attempts,
            output,
            error,
            provenance: self.params.provenance_labels(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, ConfigStore, Layer};
    use crate::engine::EngineFailure;
    use crate::formats::tests::StubReader;
    use crate::otf::OtfCache;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    /// Engine whose reconstructions fail a set number of times before
    /// succeeding, with configurable diagnostics.
    struct ScriptedEngine {
        fail_first: AtomicUsize,
        detail: &'static str,
        recon_calls: AtomicUsize,
    }
    impl ScriptedEngine {
        fn reliable() -> Self {
            Self::failing_first(0, "")
        }
        fn failing_first(count: usize, detail: &'static str) -> Self {
            Self {
                fail_first: AtomicUsize::new(count),
                detail,
                recon_calls: AtomicUsize::new(0),
            }
        }
    }
    impl ReconEngine for ScriptedEngine {
        fn make_otf(
            &self,
            _psf: &Path,
            dest: &Path,
            _params: &ParameterSet,
        ) -> Result<(), EngineFailure> {
            fs::write(dest, b"OTF").map_err(|_| EngineFailure::from_parts(Some(1), "write"))
        }
        fn reconstruct(
            &self,
            _volume: &Path,
            _otf: &Path,
            _params: &ParameterSet,
            dest: &Path,
        ) -> Result<PathBuf, EngineFailure> {
            self.recon_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(EngineFailure::from_parts(Some(3), self.detail));
            }
            fs::write(dest, b"REC").map_err(|_| EngineFailure::from_parts(Some(1), "write"))?;
            Ok(dest.to_path_buf())
        }
    }

    fn params() -> ParameterSet {
        ConfigStore::new()
            .preset(Layer::preset("test").set(keys::WAVELENGTH, 488i64))
            .resolve()
            .unwrap()
    }

    struct Fixture {
        dir: tempfile::TempDir,
        bridge: FormatBridge,
        otfs: OtfManager,
    }
    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let psf = dir.path().join("psf_488.dv");
            fs::write(&psf, b"PSF").unwrap();
            let bridge = FormatBridge::new(Arc::new(StubReader::single_channel()));
            let otfs = OtfManager::new(Arc::new(OtfCache::new())).psf(&psf);
            Self { dir, bridge, otfs }
        }
        fn input(&self, name: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            fs::write(&path, b"DV").unwrap();
            path
        }
        fn run(&self, job: Job, engine: &dyn ReconEngine, max_retries: u32) -> JobOutcome {
            job.run(
                &self.bridge,
                &self.otfs,
                engine,
                self.dir.path(),
                self.dir.path(),
                max_retries,
                &CancelToken::new(),
            )
        }
    }

    #[test]
    fn successful_job_records_its_artifact() {
        let fixture = Fixture::new();
        let engine = ScriptedEngine::reliable();
        let job = Job::new(fixture.input("cell_488.dv"), params());
        assert_eq!(job.status(), JobStatus::Pending);

        let outcome = fixture.run(job, &engine, 0);
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.attempts, 1);
        let output = outcome.output.unwrap();
        assert!(output.ends_with("cell_488_recon.mrc"));
        assert!(output.exists());
        assert_eq!(
            outcome.provenance.get("wavelength").map(String::as_str),
            Some("preset:test")
        );
    }

    #[test]
    fn missing_input_fails_before_any_engine_work() {
        let fixture = Fixture::new();
        let engine = ScriptedEngine::reliable();
        let job = Job::new(fixture.dir.path().join("gone.dv"), params());

        let outcome = fixture.run(job, &engine, 3);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.output.is_none());
        assert!(matches!(outcome.error, Some(JobError::Format(_))));
        assert_eq!(engine.recon_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transient_failures_are_retried_to_success() {
        let fixture = Fixture::new();
        let engine = ScriptedEngine::failing_first(2, "CUDA out of memory");
        let job = Job::new(fixture.input("cell_488.dv"), params());

        let outcome = fixture.run(job, &engine, 2);
        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(engine.recon_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_retries_end_in_failure() {
        let fixture = Fixture::new();
        let engine = ScriptedEngine::failing_first(usize::MAX, "out of memory");
        let job = Job::new(fixture.input("cell_488.dv"), params());

        let outcome = fixture.run(job, &engine, 2);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.attempts, 3);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind(), "resource-exhausted");
        assert!(error.is_transient());
    }

    #[test]
    fn deterministic_failures_get_one_attempt() {
        let fixture = Fixture::new();
        let engine = ScriptedEngine::failing_first(usize::MAX, "invalid MRC header");
        let job = Job::new(fixture.input("cell_488.dv"), params());

        let outcome = fixture.run(job, &engine, 5);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.error.unwrap().kind(), "invalid-input");
    }

    #[test]
    fn tripped_token_skips_the_job() {
        let fixture = Fixture::new();
        let engine = ScriptedEngine::reliable();
        let job = Job::new(fixture.input("cell_488.dv"), params());
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = job.run(
            &fixture.bridge,
            &fixture.otfs,
            &engine,
            fixture.dir.path(),
            fixture.dir.path(),
            0,
            &cancel,
        );
        assert_eq!(outcome.status, JobStatus::Skipped);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(engine.recon_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reruns_overwrite_rather_than_accumulate() {
        let fixture = Fixture::new();
        let engine = ScriptedEngine::reliable();
        let input = fixture.input("cell_488.dv");

        let first = fixture.run(Job::new(&input, params()), &engine, 0);
        let second = fixture.run(Job::new(&input, params()), &engine, 0);
        assert_eq!(first.output, second.output);
        let outputs = fs::read_dir(fixture.dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains("recon"))
            .count();
        assert_eq!(outputs, 1);
    }
}
