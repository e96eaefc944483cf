//! Batch execution across a collection of acquisitions.
//!
//! Each input gets a fresh parameter snapshot and runs in isolation on a
//! bounded worker pool; one bad file never aborts the run. Report entries
//! keep the input order regardless of execution order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::ProgressBar;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::config::ConfigStore;
use crate::engine::ReconEngine;
use crate::formats::{FormatBridge, VolumeReader};
use crate::job::{CancelToken, Job};
use crate::otf::{OtfCache, OtfManager, PsfKeying};
use crate::report::{JobRecord, RunReport};

pub struct BatchRunner {
    store: ConfigStore,
    reader: Arc<dyn VolumeReader>,
    engine: Arc<dyn ReconEngine>,
    cache: Arc<OtfCache>,
    psf: Option<PathBuf>,
    otf_overrides: Vec<(u32, PathBuf)>,
    keying: PsfKeying,
    output_dir: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    workers: usize,
    max_retries: u32,
    cancel: CancelToken,
    progress: Option<ProgressBar>,
}
impl BatchRunner {
    pub fn new(
        store: ConfigStore,
        reader: Arc<dyn VolumeReader>,
        engine: Arc<dyn ReconEngine>,
        cache: Arc<OtfCache>,
    ) -> Self {
        Self {
            store,
            reader,
            engine,
            cache,
            psf: None,
            otf_overrides: Vec::new(),
            keying: PsfKeying::ContentHash,
            output_dir: None,
            work_dir: None,
            workers: 1,
            max_retries: 0,
            cancel: CancelToken::new(),
            progress: None,
        }
    }
    /// PSF capture OTFs are generated from.
    pub fn psf(self, path: impl Into<PathBuf>) -> Self {
        Self {
            psf: Some(path.into()),
            ..self
        }
    }
    /// Use a pre-built OTF for one wavelength instead of generating.
    pub fn override_otf(mut self, wavelength: u32, path: impl Into<PathBuf>) -> Self {
        self.otf_overrides.push((wavelength, path.into()));
        self
    }
    pub fn keying(self, keying: PsfKeying) -> Self {
        Self { keying, ..self }
    }
    /// Directory final artifacts land in; next to each input if unset.
    pub fn output_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: Some(dir.into()),
            ..self
        }
    }
    /// Directory for converted intermediates; the output directory if unset.
    pub fn work_dir(self, dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(dir.into()),
            ..self
        }
    }
    pub fn workers(self, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..self
        }
    }
    /// Retry budget for transient engine failures.
    pub fn max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }
    pub fn progress(self, progress: ProgressBar) -> Self {
        Self {
            progress: Some(progress),
            ..self
        }
    }
    /// Shared stop signal; tripping it skips jobs that have not started.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run every input to a terminal state and aggregate the report.
    ///
    /// Never returns an error: per-job failures are recorded in the report
    /// and the caller decides overall policy.
    pub fn run(&self, inputs: &[PathBuf]) -> RunReport {
        let bridge = FormatBridge::new(self.reader.clone());
        let mut otfs = OtfManager::new(self.cache.clone()).keying(self.keying);
        if let Some(psf) = &self.psf {
            otfs = otfs.psf(psf);
        }
        if let Some(dir) = &self.work_dir {
            otfs = otfs.otf_dir(dir);
        }
        for (wavelength, path) in &self.otf_overrides {
            otfs = otfs.override_otf(*wavelength, path);
        }

        info!(
            "running {} jobs on {} workers",
            inputs.len(),
            self.workers
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build();
        let records: Vec<JobRecord> = match pool {
            Ok(pool) => pool.install(|| {
                inputs
                    .par_iter()
                    .map(|input| self.run_one(input, &bridge, &otfs))
                    .collect()
            }),
            // degraded but correct: same jobs, one at a time
            Err(error) => {
                warn!("worker pool unavailable ({}), running sequentially", error);
                inputs
                    .iter()
                    .map(|input| self.run_one(input, &bridge, &otfs))
                    .collect()
            }
        };
        if let Some(progress) = &self.progress {
            progress.finish();
        }
        RunReport::new(records)
    }

    fn run_one(&self, input: &Path, bridge: &FormatBridge, otfs: &OtfManager) -> JobRecord {
        let record = if self.cancel.is_cancelled() {
            debug!("batch cancelled, skipping {}", input.display());
            JobRecord::skipped(input)
        } else {
            match self.store.resolve() {
                // each job gets its own snapshot
                Ok(params) => {
                    let output_dir = self
                        .output_dir
                        .clone()
                        .unwrap_or_else(|| parent_dir(input));
                    let work_dir = self.work_dir.clone().unwrap_or_else(|| output_dir.clone());
                    Job::new(input, params)
                        .run(
                            bridge,
                            otfs,
                            self.engine.as_ref(),
                            &work_dir,
                            &output_dir,
                            self.max_retries,
                            &self.cancel,
                        )
                        .into()
                }
                Err(error) => {
                    warn!("{}: {}", input.display(), error);
                    JobRecord::config_failure(input, &error)
                }
            }
        };
        if let Some(progress) = &self.progress {
            progress.inc(1);
        }
        record
    }
}

fn parent_dir(input: &Path) -> PathBuf {
    input
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{keys, Layer, ParameterSet};
    use crate::engine::EngineFailure;
    use crate::formats::tests::StubReader;
    use crate::job::JobStatus;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingEngine {
        otf_calls: AtomicUsize,
        recon_calls: AtomicUsize,
        otf_delay: Option<Duration>,
    }
    impl CountingEngine {
        fn new() -> Self {
            Self {
                otf_calls: AtomicUsize::new(0),
                recon_calls: AtomicUsize::new(0),
                otf_delay: None,
            }
        }
        fn slow_otf(delay: Duration) -> Self {
            Self {
                otf_delay: Some(delay),
                ..Self::new()
            }
        }
    }
    impl ReconEngine for CountingEngine {
        fn make_otf(
            &self,
            _psf: &Path,
            dest: &Path,
            _params: &ParameterSet,
        ) -> Result<(), EngineFailure> {
            if let Some(delay) = self.otf_delay {
                std::thread::sleep(delay);
            }
            self.otf_calls.fetch_add(1, Ordering::SeqCst);
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
            fs::write(dest, b"REC").map_err(|_| EngineFailure::from_parts(Some(1), "write"))?;
            Ok(dest.to_path_buf())
        }
    }

    fn store() -> ConfigStore {
        ConfigStore::new().preset(Layer::preset("imaging").set(keys::WAVELENGTH, 488i64))
    }

    fn runner(dir: &Path, engine: Arc<CountingEngine>) -> BatchRunner {
        let psf = dir.join("psf_488.dv");
        fs::write(&psf, b"PSF").unwrap();
        BatchRunner::new(
            store(),
            Arc::new(StubReader::single_channel()),
            engine,
            Arc::new(OtfCache::new()),
        )
        .psf(&psf)
        .output_dir(dir.join("out"))
        .work_dir(dir.join("work"))
    }

    fn inputs(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, b"DV").unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn one_bad_input_does_not_halt_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let runner = runner(dir.path(), engine.clone());

        let mut files = inputs(dir.path(), &["a_488.dv", "c_488.dv"]);
        files.insert(1, dir.path().join("b_488.dv")); // never written

        let report = runner.run(&files);
        assert_eq!(report.len(), 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        let statuses: Vec<_> = report.records().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            [JobStatus::Succeeded, JobStatus::Failed, JobStatus::Succeeded]
        );
        assert_eq!(report.records()[1].error_kind.as_deref(), Some("io"));
        assert_eq!(engine.recon_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn config_failure_aborts_jobs_before_any_engine_work() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let psf = dir.path().join("psf.dv");
        fs::write(&psf, b"PSF").unwrap();
        // no layer supplies the required wavelength
        let runner = BatchRunner::new(
            ConfigStore::new(),
            Arc::new(StubReader::single_channel()),
            engine.clone(),
            Arc::new(OtfCache::new()),
        )
        .psf(&psf);

        let report = runner.run(&inputs(dir.path(), &["a_488.dv", "b_488.dv"]));
        assert_eq!(report.failed, 2);
        for record in report.records() {
            assert_eq!(record.error_kind.as_deref(), Some("missing-required"));
            assert_eq!(record.attempts, 0);
        }
        assert_eq!(engine.otf_calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.recon_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tripped_token_skips_remaining_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let runner = runner(dir.path(), engine.clone());
        runner.cancel_token().cancel();

        let report = runner.run(&inputs(dir.path(), &["a_488.dv", "b_488.dv"]));
        assert_eq!(report.skipped, 2);
        assert_eq!(report.succeeded, 0);
        assert_eq!(engine.recon_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn workers_share_one_otf_generation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::slow_otf(Duration::from_millis(30)));
        let runner = runner(dir.path(), engine.clone()).workers(4);

        let report = runner.run(&inputs(
            dir.path(),
            &["a_488.dv", "b_488.dv", "c_488.dv", "d_488.dv"],
        ));
        assert_eq!(report.succeeded, 4);
        assert_eq!(engine.otf_calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.recon_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn report_entries_carry_parameter_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let psf = dir.path().join("psf_488.dv");
        fs::write(&psf, b"PSF").unwrap();
        let runner = BatchRunner::new(
            store().overrides(Layer::overrides().set(keys::ZSTEP, 0.2)),
            Arc::new(StubReader::single_channel()),
            engine,
            Arc::new(OtfCache::new()),
        )
        .psf(&psf)
        .output_dir(dir.path().join("out"));

        let report = runner.run(&inputs(dir.path(), &["a.dv", "b.dv"]));
        assert_eq!(report.len(), 2);
        for record in report.records() {
            assert_eq!(
                record.provenance.get("wavelength").map(String::as_str),
                Some("preset:imaging")
            );
            assert_eq!(
                record.provenance.get("zstep").map(String::as_str),
                Some("override")
            );
        }
    }

    #[test]
    fn outputs_land_next_to_inputs_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(CountingEngine::new());
        let psf = dir.path().join("psf_488.dv");
        fs::write(&psf, b"PSF").unwrap();
        let runner = BatchRunner::new(
            store(),
            Arc::new(StubReader::single_channel()),
            engine,
            Arc::new(OtfCache::new()),
        )
        .psf(&psf);

        let report = runner.run(&inputs(dir.path(), &["cell_488.dv"]));
        assert_eq!(
            report.records()[0].output.as_deref(),
            Some(dir.path().join("cell_488_recon.mrc").as_path())
        );
    }
}
