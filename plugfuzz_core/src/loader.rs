use crate::error::ModuleLoadError;
use crate::plugin::{
    CORE_VERSION, DECLARATION_SYMBOL, FuzzerPlugin, PLUGIN_ABI_VERSION, PluginDeclaration,
    PluginRegistrar,
};
use libloading::Library;
use log::{info, warn};
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A module instance together with the library that provides its code.
///
/// The library handle is dropped after the instance (field order), and every
/// duplicate handed to a worker is dropped before the catalog is.
pub struct LoadedPlugin {
    plugin: Box<dyn FuzzerPlugin>,
    origin: Option<PathBuf>,
    _library: Option<Arc<Library>>,
}

impl LoadedPlugin {
    /// Wraps an instance that is linked into the host binary.
    pub fn in_process(plugin: Box<dyn FuzzerPlugin>) -> Self {
        Self {
            plugin,
            origin: None,
            _library: None,
        }
    }

    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn description(&self) -> &str {
        self.plugin.description()
    }

    /// Path of the library this instance came from, if it was loaded dynamically.
    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    pub fn plugin(&self) -> &dyn FuzzerPlugin {
        self.plugin.as_ref()
    }

    pub fn plugin_mut(&mut self) -> &mut dyn FuzzerPlugin {
        self.plugin.as_mut()
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.name())
            .field("origin", &self.origin)
            .finish()
    }
}

/// Collects a library's instances and shares the host logger with it.
#[derive(Default)]
struct HostRegistrar {
    plugins: Vec<Box<dyn FuzzerPlugin>>,
}

impl PluginRegistrar for HostRegistrar {
    fn register(&mut self, plugin: Box<dyn FuzzerPlugin>) {
        self.plugins.push(plugin);
    }

    fn logger(&self) -> Option<&'static dyn log::Log> {
        Some(log::logger())
    }
}

/// Produces the catalog of selectable modules for a plugin location.
///
/// An empty catalog is not an error: the engine logs it and ends the run.
pub trait PluginLoader {
    fn load_all(&self, location: &Path) -> Result<Vec<LoadedPlugin>, ModuleLoadError>;
}

/// Loads every dynamic library found directly inside the plugin location.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl DylibLoader {
    pub fn new() -> Self {
        DylibLoader
    }

    /// Lists the files in `location` that carry the platform's dynamic library
    /// extension. Subdirectories are not traversed.
    pub fn candidate_files(location: &Path) -> Result<Vec<PathBuf>, ModuleLoadError> {
        let read_dir_err = |source| ModuleLoadError::ReadDir {
            path: location.to_path_buf(),
            source,
        };

        let mut files = Vec::new();
        for entry in std::fs::read_dir(location).map_err(read_dir_err)? {
            let path = entry.map_err(read_dir_err)?.path();
            if path.is_file() {
                files.push(path);
            }
        }

        if files.is_empty() {
            warn!("No files found in the plugin location {location:?}");
            return Ok(files);
        }

        files.retain(|p| p.extension() == Some(OsStr::new(std::env::consts::DLL_EXTENSION)));
        if files.is_empty() {
            warn!(
                "No .{} files found in the plugin location {location:?}",
                std::env::consts::DLL_EXTENSION
            );
        }
        files.sort();
        Ok(files)
    }

    /// Opens one library and collects the instances it registers.
    pub fn load_library(path: &Path) -> Result<Vec<LoadedPlugin>, ModuleLoadError> {
        info!("Loading plugins from: {path:?}");

        // SAFETY: loading runs the library's initialisers. Plugin libraries are
        // trusted build artifacts placed in the configured plugin location.
        let library = unsafe { Library::new(path) }.map_err(|source| ModuleLoadError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        // SAFETY: the symbol is a `PluginDeclaration` static emitted by
        // `export_plugins!`; the ABI and core version are checked before use.
        let declaration: PluginDeclaration = unsafe {
            let symbol = library
                .get::<*const PluginDeclaration>(DECLARATION_SYMBOL.as_bytes())
                .map_err(|source| ModuleLoadError::MissingDeclaration {
                    path: path.to_path_buf(),
                    symbol: DECLARATION_SYMBOL,
                    source,
                })?;
            (*symbol).read()
        };

        let registered = register_declared(path, &declaration)?;

        let library = Arc::new(library);
        Ok(registered
            .into_iter()
            .map(|plugin| LoadedPlugin {
                plugin,
                origin: Some(path.to_path_buf()),
                _library: Some(Arc::clone(&library)),
            })
            .collect())
    }
}

/// Checks a declaration against the host's ABI and core version, then runs its
/// register function with the host logger on offer.
fn register_declared(
    path: &Path,
    declaration: &PluginDeclaration,
) -> Result<Vec<Box<dyn FuzzerPlugin>>, ModuleLoadError> {
    if declaration.abi_version != PLUGIN_ABI_VERSION || declaration.core_version != CORE_VERSION {
        return Err(ModuleLoadError::IncompatibleAbi {
            path: path.to_path_buf(),
            expected_abi: PLUGIN_ABI_VERSION,
            expected_core: CORE_VERSION.to_string(),
            found_abi: declaration.abi_version,
            found_core: declaration.core_version.to_string(),
        });
    }

    let mut registrar = HostRegistrar::default();
    (declaration.register)(&mut registrar);
    if registrar.plugins.is_empty() {
        return Err(ModuleLoadError::NoPlugins {
            path: path.to_path_buf(),
        });
    }
    Ok(registrar.plugins)
}

impl PluginLoader for DylibLoader {
    fn load_all(&self, location: &Path) -> Result<Vec<LoadedPlugin>, ModuleLoadError> {
        let mut catalog = Vec::new();
        for path in Self::candidate_files(location)? {
            catalog.extend(Self::load_library(&path)?);
        }
        Ok(catalog)
    }
}

type PluginFactory = Box<dyn Fn() -> Box<dyn FuzzerPlugin> + Send + Sync>;

/// Builds the catalog from factories linked into the host. The plugin location
/// is ignored.
#[derive(Default)]
pub struct StaticLoader {
    factories: Vec<PluginFactory>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn FuzzerPlugin> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
        self
    }
}

impl PluginLoader for StaticLoader {
    fn load_all(&self, _location: &Path) -> Result<Vec<LoadedPlugin>, ModuleLoadError> {
        Ok(self
            .factories
            .iter()
            .map(|factory| LoadedPlugin::in_process(factory()))
            .collect())
    }
}
