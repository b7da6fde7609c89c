pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod loader;
pub mod mutator;
pub mod oracle;
pub mod plugin;

pub use config::HostConfig;
pub use engine::{CatalogEntry, Engine, RunOutcome, RunReport, WorkerExit, WorkerReport};
pub use error::{HostError, ModuleArgumentError, ModuleLoadError};
pub use executor::{ProcessOutcome, ProcessOutput, TargetCommand};
pub use loader::{DylibLoader, LoadedPlugin, PluginLoader, StaticLoader};
pub use mutator::{BitFlipMutator, Mutator};
pub use oracle::{BugReport, FailureKind, Oracle, StderrOrSignalOracle};
pub use plugin::{FuzzerPlugin, PluginDeclaration, PluginRegistrar, STATUS_CONTINUE};
