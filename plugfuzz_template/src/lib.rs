//! Skeleton module to copy when writing a new fuzzer. It only logs the calls
//! the engine makes.

use log::{info, warn};
use plugfuzz_core::error::ModuleArgumentError;
use plugfuzz_core::plugin::{FuzzerPlugin, STATUS_CONTINUE};
use std::path::Path;

pub const MODULE_NAME: &str = "TemplateFuzzer";

#[derive(Debug, Default, Clone)]
pub struct TemplateFuzzer {
    args: String,
    executions: u64,
}

impl TemplateFuzzer {
    pub fn args(&self) -> &str {
        &self.args
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }
}

impl FuzzerPlugin for TemplateFuzzer {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn description(&self) -> &str {
        "Template to create a fuzzer"
    }

    fn load_args(&mut self, args: &str) -> Result<(), ModuleArgumentError> {
        info!("Loaded args: {args}");
        self.args = args.to_string();
        Ok(())
    }

    fn set_cache_dir(&mut self, path: &Path) {
        warn!("{MODULE_NAME} does not use a cache directory, ignoring {path:?}");
    }

    fn execute(&mut self) -> i32 {
        info!("Execute fuzzer's task ....");
        self.executions += 1;
        info!("Finished fuzzer's task");
        STATUS_CONTINUE
    }

    fn duplicate(&self) -> Box<dyn FuzzerPlugin> {
        Box::new(self.clone())
    }
}

plugfuzz_core::export_plugins!(TemplateFuzzer);
