/*!
# SIM reconstruction orchestrator

This library drives structured-illumination-microscopy reconstruction over
batches of raw instrument acquisitions: it resolves layered configuration
into reproducible parameter sets, converts DV volumes into the engine
format, derives and caches optical transfer functions, and sequences the
external GPU reconstruction engine over every input while keeping one bad
file from sinking the whole run.

## Key Components

- [`ConfigStore`] - layered parameter resolution with per-key provenance
- [`FormatBridge`] - DV to MRC conversion with idempotent reruns
- [`OtfManager`] - OTF lookup and generation over an explicit [`OtfCache`]
- [`Job`] - one acquisition through the convert/OTF/reconstruct pipeline
- [`BatchRunner`] - bounded-parallel batch execution and the [`RunReport`]

## Usage

```rust,no_run
use std::sync::Arc;
use sim_recon::{
    BatchRunner, CommandEngine, CommandReader, ConfigStore, Layer, OtfCache,
};

let store = ConfigStore::new()
    .preset_file("presets/60x-oil.toml".as_ref())?
    .overrides(Layer::overrides().set("zstep", 0.2));
let report = BatchRunner::new(
    store,
    Arc::new(CommandReader::new("dvheader", "dv2mrc")),
    Arc::new(CommandEngine::new("sirecon", "makeotf")),
    Arc::new(OtfCache::new()),
)
.psf("psf_488.dv")
.workers(4)
.run(&["cell01_488.dv".into(), "cell02_488.dv".into()]);
report.summary();
# Ok::<(), sim_recon::Error>(())
```
*/

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod formats;
pub mod job;
pub mod otf;
pub mod report;

pub use batch::BatchRunner;
pub use config::{ConfigError, ConfigStore, Layer, ParameterSet, Provenance};
pub use engine::{CommandEngine, EngineError, EngineFailure, ReconEngine};
pub use error::Error;
pub use formats::{CommandReader, FormatBridge, FormatError, SourceFile, VolumeReader};
pub use job::{CancelToken, Job, JobError, JobStatus};
pub use otf::{OtfCache, OtfError, OtfHandle, OtfManager, PsfKeying};
pub use report::{JobRecord, RunReport};

/// Name stub embedded in reconstruction output filenames
pub const RECON_NAME_STUB: &str = "recon";
/// Name stub embedded in generated OTF filenames
pub const OTF_NAME_STUB: &str = "OTF";
