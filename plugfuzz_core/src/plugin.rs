use crate::error::ModuleArgumentError;
use std::path::Path;

/// Bumped whenever [`FuzzerPlugin`] or [`PluginDeclaration`] change shape.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Version of `plugfuzz_core` the host and every module are built against.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the static every module library exports, see [`export_plugins!`].
pub const DECLARATION_SYMBOL: &str = "PLUGFUZZ_PLUGIN_DECLARATION";

/// Status returned by [`FuzzerPlugin::execute`] to keep the worker loop going.
pub const STATUS_CONTINUE: i32 = 0;

/// The capability set every fuzzer module exposes to the engine.
///
/// One instance is owned by exactly one worker thread at a time. Workers other
/// than the first receive an instance produced by [`FuzzerPlugin::duplicate`].
pub trait FuzzerPlugin: Send {
    /// Selection key. Matched case-sensitively against the first CLI argument.
    fn name(&self) -> &str;

    /// Human-readable summary shown in the catalog listing.
    fn description(&self) -> &str;

    /// Parses the module-specific argument blob.
    fn load_args(&mut self, args: &str) -> Result<(), ModuleArgumentError>;

    /// Tells the module where its writable scratch directory is.
    ///
    /// Modules without a use for a cache directory may ignore this. Modules that
    /// need one must fail on first use if it was never set.
    fn set_cache_dir(&mut self, path: &Path);

    /// Runs exactly one fuzzing iteration.
    ///
    /// [`STATUS_CONTINUE`] keeps the worker going; any other value stops this
    /// worker's loop and is reported by the engine.
    fn execute(&mut self) -> i32;

    /// Returns an independent copy for another worker thread. The copy must not
    /// share any buffer the original mutates.
    fn duplicate(&self) -> Box<dyn FuzzerPlugin>;
}

/// Sink the module's register function pushes its instances into.
pub trait PluginRegistrar {
    fn register(&mut self, plugin: Box<dyn FuzzerPlugin>);

    /// The host's logger. A module library carries its own copy of `log`, which
    /// stays silent unless pointed at this logger.
    fn logger(&self) -> Option<&'static dyn log::Log> {
        None
    }

    fn max_level(&self) -> log::LevelFilter {
        log::max_level()
    }
}

/// Points this copy of `log` at the host's logger, if the registrar offers one.
/// Called by the register function [`export_plugins!`] generates.
pub fn install_host_logger(registrar: &dyn PluginRegistrar) {
    if let Some(logger) = registrar.logger() {
        // Fails only if this library already installed a logger.
        let _ = log::set_logger(logger);
        log::set_max_level(registrar.max_level());
    }
}

impl PluginRegistrar for Vec<Box<dyn FuzzerPlugin>> {
    fn register(&mut self, plugin: Box<dyn FuzzerPlugin>) {
        self.push(plugin);
    }
}

/// The one symbol a module library exports.
#[derive(Copy, Clone)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    pub core_version: &'static str,
    pub register: fn(&mut dyn PluginRegistrar),
}

/// Exports a [`PluginDeclaration`] registering one default-constructed instance
/// of every listed type.
///
/// ```ignore
/// plugfuzz_core::export_plugins!(MyFuzzer);
/// ```
#[macro_export]
macro_rules! export_plugins {
    ($($plugin:ty),+ $(,)?) => {
        #[doc(hidden)]
        #[unsafe(no_mangle)]
        pub static PLUGFUZZ_PLUGIN_DECLARATION: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                abi_version: $crate::plugin::PLUGIN_ABI_VERSION,
                core_version: $crate::plugin::CORE_VERSION,
                register: __plugfuzz_register_plugins,
            };

        #[doc(hidden)]
        fn __plugfuzz_register_plugins(registrar: &mut dyn $crate::plugin::PluginRegistrar) {
            $crate::plugin::install_host_logger(&*registrar);
            $(
                registrar.register(::std::boxed::Box::new(
                    <$plugin as ::core::default::Default>::default(),
                ));
            )+
        }
    };
}
