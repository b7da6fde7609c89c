use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning a plugin directory into a catalog of modules.
///
/// Every variant is fatal to the run; the engine does not retry a load.
#[derive(Error, Debug)]
pub enum ModuleLoadError {
    /// The plugin directory could not be listed.
    #[error("Failed to read plugin location {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The dynamic library could not be opened (bad format, missing dependencies).
    #[error("Failed to load plugin library {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    /// The library does not export the plugin declaration symbol.
    #[error("Plugin library {path:?} does not export `{symbol}`: {source}")]
    MissingDeclaration {
        path: PathBuf,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    /// The library was built against a different plugin ABI or core version.
    #[error(
        "Plugin library {path:?} was built for ABI {found_abi} (core {found_core}), host expects ABI {expected_abi} (core {expected_core})"
    )]
    IncompatibleAbi {
        path: PathBuf,
        expected_abi: u32,
        expected_core: String,
        found_abi: u32,
        found_core: String,
    },

    /// The library loaded fine but registered no plugin instance.
    #[error("Can't find any plugin registered by {path:?}")]
    NoPlugins { path: PathBuf },
}

/// Error returned by [`crate::FuzzerPlugin::load_args`] when the argument blob
/// is malformed or lacks required fields.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ModuleArgumentError(pub String);

impl ModuleArgumentError {
    pub fn new<S: Into<String>>(msg: S) -> Self {
        Self(msg.into())
    }
}

impl From<serde_json::Error> for ModuleArgumentError {
    fn from(err: serde_json::Error) -> Self {
        ModuleArgumentError(format!("Malformed module arguments: {err}"))
    }
}

/// Top-level error taxonomy for one engine run.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Missing or invalid configuration: {0}")]
    MissingConfiguration(String),

    #[error(transparent)]
    ModuleLoad(#[from] ModuleLoadError),

    #[error("Couldn't find {0} module")]
    ModuleNotFound(String),

    #[error("Module '{module}' rejected its arguments: {source}")]
    ModuleArgument {
        module: String,
        #[source]
        source: ModuleArgumentError,
    },

    #[error("Cache directory {path:?} could not be prepared: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn worker thread {worker}: {source}")]
    WorkerSpawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
}
