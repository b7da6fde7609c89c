use log::{debug, error, info, warn};
use plugfuzz_core::error::ModuleArgumentError;
use plugfuzz_core::executor::{ProcessOutcome, TargetCommand};
use plugfuzz_core::mutator::{BitFlipMutator, Mutator};
use plugfuzz_core::oracle::{FailureKind, Oracle, StderrOrSignalOracle};
use plugfuzz_core::plugin::{FuzzerPlugin, STATUS_CONTINUE};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const MODULE_NAME: &str = "BitFlipFuzzer";

pub const DEFAULT_TIMEOUT_MS: u64 = 3000;

/// Setup failed: no cache directory, or the seed could not be read.
pub const STATUS_SETUP_FAILED: i32 = -1;

/// The artifact could not be written or the target could not be spawned.
pub const STATUS_IO_FAILED: i32 = -2;

/// `maxFailures` artifacts have been retained by this instance.
pub const STATUS_FAILURE_LIMIT: i32 = 2;

const ARTIFACT_INFIX: &str = "_modification_";

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Module argument blob, e.g.
/// `{"targetFileLocation": "/usr/bin/exif", "targetSampleDataLocation": "seed.jpg"}`.
/// PascalCase keys are accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessArgs {
    #[serde(alias = "TargetFileLocation")]
    pub target_file_location: PathBuf,
    #[serde(alias = "TargetSampleDataLocation")]
    pub target_sample_data_location: PathBuf,
    #[serde(default = "default_timeout_ms", alias = "TimeoutMs")]
    pub timeout_ms: u64,
    #[serde(default, alias = "MaxFailures")]
    pub max_failures: Option<u64>,
}

impl HarnessArgs {
    pub fn parse(blob: &str) -> Result<Self, ModuleArgumentError> {
        let args: HarnessArgs = serde_json::from_str(blob)?;
        if args.target_file_location.as_os_str().is_empty() {
            return Err(ModuleArgumentError::new("targetFileLocation is empty"));
        }
        if args.target_sample_data_location.as_os_str().is_empty() {
            return Err(ModuleArgumentError::new("targetSampleDataLocation is empty"));
        }
        if args.timeout_ms == 0 {
            return Err(ModuleArgumentError::new("timeoutMs must be at least 1"));
        }
        Ok(args)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// File name prefix shared by every artifact mutated from this seed.
    fn artifact_prefix(&self) -> String {
        let base = self
            .target_sample_data_location
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sample".to_string());
        format!("{base}{ARTIFACT_INFIX}")
    }
}

/// Mutation fuzzer for targets that take one input file as their only argument.
///
/// Every iteration writes a bit-flipped copy of the seed into the cache
/// directory, runs the target on it and keeps the file only if the target
/// hanged, wrote to standard error or returned a negative status.
pub struct BitFlipFuzzer {
    args: Option<HarnessArgs>,
    cache_dir: Option<PathBuf>,
    seed: Option<Vec<u8>>,
    iteration: u64,
    retained: u64,
    mutator: BitFlipMutator,
    oracle: StderrOrSignalOracle,
    rng: ChaCha8Rng,
}

impl Default for BitFlipFuzzer {
    fn default() -> Self {
        Self {
            args: None,
            cache_dir: None,
            seed: None,
            iteration: 0,
            retained: 0,
            mutator: BitFlipMutator::default(),
            oracle: StderrOrSignalOracle::new(),
            rng: ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }
}

impl BitFlipFuzzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `rng` instead of an OS-seeded one. Duplicates are still reseeded.
    pub fn with_rng(mut self, rng: ChaCha8Rng) -> Self {
        self.rng = rng;
        self
    }

    pub fn args(&self) -> Option<&HarnessArgs> {
        self.args.as_ref()
    }

    pub fn seed(&self) -> Option<&[u8]> {
        self.seed.as_deref()
    }

    /// Iterations started by this instance, including failed ones.
    pub fn iterations(&self) -> u64 {
        self.iteration
    }

    /// Failing or hanging artifacts this instance has left in the cache directory.
    pub fn retained(&self) -> u64 {
        self.retained
    }

    /// Deep copy with its own seed buffer and a freshly seeded RNG.
    pub fn fork(&self) -> Self {
        Self {
            args: self.args.clone(),
            cache_dir: self.cache_dir.clone(),
            seed: self.seed.clone(),
            iteration: self.iteration,
            retained: self.retained,
            mutator: self.mutator,
            oracle: self.oracle,
            rng: ChaCha8Rng::from_rng(&mut rand::rng()),
        }
    }

    fn set_up(&mut self) -> Result<(), i32> {
        let Some(args) = &self.args else {
            error!("{MODULE_NAME}: module arguments were never loaded");
            return Err(STATUS_SETUP_FAILED);
        };

        let usable_cache_dir = self
            .cache_dir
            .as_ref()
            .is_some_and(|dir| !dir.as_os_str().is_empty());
        if !usable_cache_dir {
            error!("{MODULE_NAME} requires a cache directory, set cacheDirName in the config");
            return Err(STATUS_SETUP_FAILED);
        }

        let seed_path = &args.target_sample_data_location;
        let seed = fs::read(seed_path).map_err(|e| {
            error!("Failed to read the seed {seed_path:?}: {e}");
            STATUS_SETUP_FAILED
        })?;
        info!(
            "Loaded seed {seed_path:?} ({} bytes, {} flips per mutation)",
            seed.len(),
            self.mutator.flip_count(seed.len())
        );
        self.seed = Some(seed);
        Ok(())
    }

    fn iterate(&mut self, args: &HarnessArgs, cache_dir: &Path, seed: &[u8]) -> i32 {
        let iteration = self.iteration;
        self.iteration += 1;

        let mutated = self.mutator.mutate(seed, &mut self.rng);
        let artifact = cache_dir.join(format!("{}{}", args.artifact_prefix(), Uuid::new_v4()));
        if let Err(e) = fs::write(&artifact, &mutated) {
            error!("{iteration} failed to write {artifact:?}: {e}");
            return STATUS_IO_FAILED;
        }

        let outcome = match TargetCommand::new(&args.target_file_location, args.timeout())
            .arg(&artifact)
            .run()
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "{iteration} failed to run target {:?}: {e}",
                    args.target_file_location
                );
                remove_artifact(&artifact);
                return STATUS_IO_FAILED;
            }
        };

        match self.oracle.examine(&mutated, &outcome) {
            Some(report) => {
                self.retained += 1;
                match report.kind {
                    FailureKind::Hang => {
                        error!("{iteration} target hanged on processing {artifact:?}")
                    }
                    _ => info!(
                        "{iteration} {} on processing {artifact:?} (md5 {})",
                        report.description(),
                        report.input_hash
                    ),
                }
            }
            None => {
                if let ProcessOutcome::Completed(output) = &outcome {
                    debug!("{iteration} passed with status {}", output.status_code());
                }
                remove_artifact(&artifact);
            }
        }

        match args.max_failures {
            Some(limit) if self.retained >= limit => {
                warn!("{MODULE_NAME} retained {} failing artifacts, stopping", self.retained);
                STATUS_FAILURE_LIMIT
            }
            _ => STATUS_CONTINUE,
        }
    }
}

fn remove_artifact(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to delete {path:?}: {e}");
    }
}

impl FuzzerPlugin for BitFlipFuzzer {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn description(&self) -> &str {
        "Flips random bits of a seed file past its 4-byte header and runs the target on each mutation"
    }

    fn load_args(&mut self, args: &str) -> Result<(), ModuleArgumentError> {
        let parsed = HarnessArgs::parse(args)?;
        info!(
            "Fuzzing {:?} with seed {:?}, timeout {} ms",
            parsed.target_file_location, parsed.target_sample_data_location, parsed.timeout_ms
        );
        self.args = Some(parsed);
        Ok(())
    }

    fn set_cache_dir(&mut self, path: &Path) {
        self.cache_dir = Some(path.to_path_buf());
    }

    fn execute(&mut self) -> i32 {
        if self.seed.is_none() {
            if let Err(status) = self.set_up() {
                return status;
            }
        }

        // Taken out for the iteration so `self` stays mutable; restored below.
        let (Some(args), Some(cache_dir), Some(seed)) =
            (self.args.take(), self.cache_dir.take(), self.seed.take())
        else {
            return STATUS_SETUP_FAILED;
        };
        let status = self.iterate(&args, &cache_dir, &seed);
        self.args = Some(args);
        self.cache_dir = Some(cache_dir);
        self.seed = Some(seed);
        status
    }

    fn duplicate(&self) -> Box<dyn FuzzerPlugin> {
        Box::new(self.fork())
    }
}
