use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sim_recon::{
    CommandEngine, CommandReader, ConfigStore, FormatBridge, Layer, OtfCache, OtfManager,
};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "sim-otf", about = "Derive an OTF from a PSF capture")]
struct Opt {
    /// PSF capture
    psf: PathBuf,
    /// Directory the OTF lands in; next to the PSF if unset
    #[structopt(short, long)]
    output: Option<PathBuf>,
    /// Preset file, repeatable, lowest precedence first
    #[structopt(short = "c", long = "preset")]
    presets: Vec<PathBuf>,
    /// Per-run parameter override, as `KEY=VALUE`
    #[structopt(short = "s", long = "set")]
    sets: Vec<String>,
    /// OTF generation executable
    #[structopt(long, default_value = "makeotf")]
    otf_bin: PathBuf,
    /// DV header probe executable
    #[structopt(long, default_value = "dvheader")]
    probe_bin: PathBuf,
    /// DV to MRC converter executable
    #[structopt(long, default_value = "dv2mrc")]
    convert_bin: PathBuf,
    /// Engine wall-clock ceiling in seconds
    #[structopt(long)]
    timeout: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

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
    let params = store.resolve()?;

    let bridge = FormatBridge::new(Arc::new(CommandReader::new(
        &opt.probe_bin,
        &opt.convert_bin,
    )));
    // only the OTF operation is exercised here
    let mut engine = CommandEngine::new(&opt.otf_bin, &opt.otf_bin);
    if let Some(secs) = opt.timeout {
        engine = engine.timeout(Duration::from_secs(secs));
    }
    let mut manager = OtfManager::new(Arc::new(OtfCache::new())).psf(&opt.psf);
    if let Some(dir) = &opt.output {
        manager = manager.otf_dir(dir);
    }

    let handle = manager.get_or_build(&params, &bridge, &engine)?;
    println!("{}", handle.path.display());
    Ok(())
}
