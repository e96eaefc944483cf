use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use indicatif::ProgressBar;
use sim_recon::{
    BatchRunner, CommandEngine, CommandReader, ConfigStore, Layer, OtfCache, PsfKeying,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "sim-recon", about = "Batch SIM reconstruction of raw DV acquisitions")]
struct Opt {
    /// Raw acquisitions, as paths or glob patterns
    #[structopt(required = true)]
    inputs: Vec<String>,
    /// PSF capture OTFs are generated from
    #[structopt(long)]
    psf: Option<PathBuf>,
    /// Pre-built OTF for one wavelength, as `WAVELENGTH=PATH`
    #[structopt(long = "otf")]
    otfs: Vec<String>,
    /// Preset file, repeatable, lowest precedence first
    #[structopt(short = "c", long = "preset")]
    presets: Vec<PathBuf>,
    /// Per-run parameter override, as `KEY=VALUE`
    #[structopt(short = "s", long = "set")]
    sets: Vec<String>,
    /// Output directory; next to each input if unset
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Processing directory for converted intermediates
    #[structopt(short, long)]
    work: Option<PathBuf>,
    /// Reconstruction engine executable
    #[structopt(long, default_value = "sirecon")]
    recon_bin: PathBuf,
    /// OTF generation executable
    #[structopt(long, default_value = "makeotf")]
    otf_bin: PathBuf,
    /// DV header probe executable
    #[structopt(long, default_value = "dvheader")]
    probe_bin: PathBuf,
    /// DV to MRC converter executable
    #[structopt(long, default_value = "dv2mrc")]
    convert_bin: PathBuf,
    /// Worker thread count
    #[structopt(short = "j", long, default_value = "1")]
    workers: usize,
    /// Retries for transient engine failures
    #[structopt(short = "r", long, default_value = "0")]
    retries: u32,
    /// Engine wall-clock ceiling in seconds
    #[structopt(long)]
    timeout: Option<u64>,
    /// PSF cache keying: content-hash or path-mtime
    #[structopt(long, default_value = "content-hash")]
    keying: PsfKeying,
    /// Write the run report as JSON
    #[structopt(long)]
    json: Option<PathBuf>,
    /// Write the run report as CSV
    #[structopt(long)]
    csv: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let mut inputs = Vec::new();
    for pattern in &opt.inputs {
        let mut matched: Vec<PathBuf> = glob::glob(pattern)
            .with_context(|| format!("bad input pattern `{}`", pattern))?
            .filter_map(Result::ok)
            .collect();
        matched.sort();
        if matched.is_empty() {
            // a literal path; a missing file is the job's failure to report
            inputs.push(PathBuf::from(pattern));
        } else {
            inputs.append(&mut matched);
        }
    }
    println!("Found {} acquisitions", inputs.len());

    let mut store = ConfigStore::new();
    for preset in &opt.presets {
        store = store.preset_file(preset)?;
    }
    if !opt.sets.is_empty() {
        let mut layer = Layer::overrides();
        for raw in &opt.sets {
            let (key, value) = Layer::parse_assignment(raw)?;
            layer = layer.set(key, value);
        }
        store = store.overrides(layer);
    }

    let mut engine = CommandEngine::new(&opt.recon_bin, &opt.otf_bin);
    if let Some(secs) = opt.timeout {
        engine = engine.timeout(Duration::from_secs(secs));
    }
    let mut runner = BatchRunner::new(
        store,
        Arc::new(CommandReader::new(&opt.probe_bin, &opt.convert_bin)),
        Arc::new(engine),
        Arc::new(OtfCache::new()),
    )
    .keying(opt.keying)
    .workers(opt.workers)
    .max_retries(opt.retries)
    .progress(ProgressBar::new(inputs.len() as u64));
    if let Some(psf) = &opt.psf {
        runner = runner.psf(psf);
    }
    if let Some(dir) = &opt.output {
        runner = runner.output_dir(dir);
    }
    if let Some(dir) = &opt.work {
        runner = runner.work_dir(dir);
    }
    for raw in &opt.otfs {
        let (wavelength, path) = raw
            .split_once('=')
            .with_context(|| format!("expected WAVELENGTH=PATH, got `{}`", raw))?;
        let wavelength: u32 = wavelength
            .parse()
            .with_context(|| format!("bad wavelength in `{}`", raw))?;
        runner = runner.override_otf(wavelength, path);
    }

    let report = runner.run(&inputs);
    report.summary();
    if let Some(path) = &opt.json {
        report.to_json(path)?;
    }
    if let Some(path) = &opt.csv {
        report.to_csv(path)?;
    }
    if report.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
