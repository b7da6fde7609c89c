use crate::config::HostConfig;
use crate::error::HostError;
use crate::loader::{LoadedPlugin, PluginLoader};
use crate::plugin::{FuzzerPlugin, STATUS_CONTINUE};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::thread;

/// One line of the module listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
}

/// How a worker's iteration loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// All configured iterations ran.
    Finished,
    /// `execute()` returned this non-zero status.
    Stopped(i32),
    /// The worker thread panicked; its iteration count is unknown.
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub iterations: u64,
    pub exit: WorkerExit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub module: String,
    pub cache_dir: Option<PathBuf>,
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    pub fn total_iterations(&self) -> u64 {
        self.workers.iter().map(|w| w.iterations).sum()
    }
}

/// Non-fatal ways a run can end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The plugin location held no loadable module.
    NoPlugins,
    /// Invoked without arguments: the catalog was listed.
    CatalogPrinted(Vec<CatalogEntry>),
    /// Invoked with neither zero nor two arguments.
    UsageError { arg_count: usize },
    Completed(RunReport),
}

/// Drives one end-to-end run: cache directory, discovery, selection, the worker
/// pool and cleanup.
pub struct Engine<L: PluginLoader> {
    config: HostConfig,
    loader: L,
    working_dir: Option<PathBuf>,
}

impl<L: PluginLoader> Engine<L> {
    pub fn new(config: HostConfig, loader: L) -> Self {
        Self {
            config,
            loader,
            working_dir: None,
        }
    }

    /// Base for the cache directory when the config has no `cacheDirLocation`.
    /// Defaults to the process working directory.
    pub fn with_working_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Runs the engine with the positional arguments `[module-name, module-args]`.
    pub fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<RunOutcome, HostError> {
        let cache_dir = self.resolve_cache_dir()?;
        match &cache_dir {
            Some(path) => prepare_cache_dir(path)?,
            None => warn!("Cache directory will not be used"),
        }

        let mut catalog = self.loader.load_all(&self.config.plugins_location)?;
        if catalog.is_empty() {
            warn!(
                "No plugins available in {:?}, nothing to do",
                self.config.plugins_location
            );
            finish(cache_dir.as_deref());
            return Ok(RunOutcome::NoPlugins);
        }

        let (module_name, module_args): (&str, &str) = match args {
            [] => {
                let entries = print_catalog(&catalog);
                finish(cache_dir.as_deref());
                return Ok(RunOutcome::CatalogPrinted(entries));
            }
            [name, module_args] => (name.as_ref(), module_args.as_ref()),
            _ => {
                error!(
                    "Not valid arguments ({} given)! Run program without parameters to see available options",
                    args.len()
                );
                finish(cache_dir.as_deref());
                return Ok(RunOutcome::UsageError {
                    arg_count: args.len(),
                });
            }
        };

        let selected = catalog
            .iter_mut()
            .find(|p| p.name() == module_name)
            .ok_or_else(|| HostError::ModuleNotFound(module_name.to_string()))?;
        info!("Selected module {module_name}");

        selected
            .plugin_mut()
            .load_args(module_args)
            .map_err(|source| HostError::ModuleArgument {
                module: module_name.to_string(),
                source,
            })?;
        if let Some(path) = &cache_dir {
            selected.plugin_mut().set_cache_dir(path);
        }

        let workers = self.run_workers(selected)?;
        for report in &workers {
            match report.exit {
                WorkerExit::Finished => {}
                WorkerExit::Stopped(status) => warn!(
                    "Worker {} stopped after {} iterations with status {status}",
                    report.worker, report.iterations
                ),
                WorkerExit::Panicked => error!("Worker {} panicked", report.worker),
            }
        }

        finish(cache_dir.as_deref());
        Ok(RunOutcome::Completed(RunReport {
            module: module_name.to_string(),
            cache_dir,
            workers,
        }))
    }

    fn resolve_cache_dir(&self) -> Result<Option<PathBuf>, HostError> {
        let cwd = match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(|source| HostError::CacheDir {
                path: PathBuf::from("."),
                source,
            })?,
        };
        Ok(self.config.cache_dir_path(&cwd))
    }

    fn run_workers(&self, selected: &mut LoadedPlugin) -> Result<Vec<WorkerReport>, HostError> {
        let threads = self.config.amount_of_threads;
        let iterations = self.config.amount_of_execution_per_thread;

        if threads <= 1 {
            return Ok(vec![run_worker(0, selected.plugin_mut(), iterations)]);
        }

        let instances: Vec<Box<dyn FuzzerPlugin>> =
            (0..threads).map(|_| selected.plugin().duplicate()).collect();
        info!("Starting {threads} workers with {iterations} iterations each");

        thread::scope(|scope| -> Result<Vec<WorkerReport>, HostError> {
            let mut handles = Vec::with_capacity(threads);
            for (worker, mut instance) in instances.into_iter().enumerate() {
                let handle = thread::Builder::new()
                    .name(format!("worker-{worker}"))
                    .spawn_scoped(scope, move || {
                        run_worker(worker, instance.as_mut(), iterations)
                    })
                    .map_err(|source| HostError::WorkerSpawn { worker, source })?;
                handles.push((worker, handle));
            }

            Ok(handles
                .into_iter()
                .map(|(worker, handle)| {
                    handle.join().unwrap_or(WorkerReport {
                        worker,
                        iterations: 0,
                        exit: WorkerExit::Panicked,
                    })
                })
                .collect())
        })
    }
}

/// Runs up to `iterations` calls of `execute()`, stopping early on a non-zero
/// status.
pub fn run_worker(worker: usize, plugin: &mut dyn FuzzerPlugin, iterations: u64) -> WorkerReport {
    for i in 0..iterations {
        debug!("TH: {worker} LOOP: {}", i + 1);
        let status = plugin.execute();
        if status != STATUS_CONTINUE {
            error!("Fuzzer returned {status} on worker {worker}");
            return WorkerReport {
                worker,
                iterations: i + 1,
                exit: WorkerExit::Stopped(status),
            };
        }
    }
    WorkerReport {
        worker,
        iterations,
        exit: WorkerExit::Finished,
    }
}

/// Creates the cache directory unless it already exists.
pub fn prepare_cache_dir(path: &Path) -> Result<(), HostError> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path).map_err(|source| HostError::CacheDir {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Created cache directory {path:?}");
    Ok(())
}

/// Removes the cache directory if it exists and is empty. Returns whether it
/// was removed; failures are logged and leave the directory in place.
pub fn cleanup_cache_dir(path: &Path) -> bool {
    let is_empty = match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => return false,
    };
    if !is_empty {
        info!("Cache directory {path:?} holds artifacts, keeping it");
        return false;
    }

    match std::fs::remove_dir(path) {
        Ok(()) => {
            info!("Cache directory is empty, deleted {path:?}");
            true
        }
        Err(e) => {
            warn!("Failed to delete empty cache directory {path:?}: {e}");
            false
        }
    }
}

fn print_catalog(catalog: &[LoadedPlugin]) -> Vec<CatalogEntry> {
    info!("Installed plugins:");
    let entries: Vec<CatalogEntry> = catalog
        .iter()
        .map(|p| CatalogEntry {
            name: p.name().to_string(),
            description: p.description().to_string(),
        })
        .collect();
    for entry in &entries {
        info!("{}\t - {}", entry.name, entry.description);
    }
    info!("Call program with this pattern: plugfuzz <plugin-name> <plugin-args>");
    entries
}

fn finish(cache_dir: Option<&Path>) {
    if let Some(path) = cache_dir {
        cleanup_cache_dir(path);
    }
    info!("Finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleArgumentError;
    use crate::loader::StaticLoader;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Probe {
        executions: AtomicU64,
        duplicates: AtomicU64,
        args: Mutex<Vec<String>>,
        cache_dirs: Mutex<Vec<PathBuf>>,
    }

    #[derive(Clone)]
    struct CountingPlugin {
        name: &'static str,
        probe: Arc<Probe>,
        stop_after: Option<u64>,
        reject_args: bool,
        write_artifact: bool,
        local_calls: u64,
        cache_dir: Option<PathBuf>,
    }

    impl CountingPlugin {
        fn new(name: &'static str, probe: &Arc<Probe>) -> Self {
            Self {
                name,
                probe: Arc::clone(probe),
                stop_after: None,
                reject_args: false,
                write_artifact: false,
                local_calls: 0,
                cache_dir: None,
            }
        }
    }

    impl FuzzerPlugin for CountingPlugin {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "counts executions"
        }
        fn load_args(&mut self, args: &str) -> Result<(), ModuleArgumentError> {
            if self.reject_args {
                return Err(ModuleArgumentError::new("missing field `target`"));
            }
            self.probe.args.lock().unwrap().push(args.to_string());
            Ok(())
        }
        fn set_cache_dir(&mut self, path: &Path) {
            self.cache_dir = Some(path.to_path_buf());
            self.probe.cache_dirs.lock().unwrap().push(path.to_path_buf());
        }
        fn execute(&mut self) -> i32 {
            self.probe.executions.fetch_add(1, Ordering::SeqCst);
            self.local_calls += 1;
            if self.write_artifact {
                if let Some(dir) = &self.cache_dir {
                    std::fs::write(dir.join(format!("artifact_{}", self.local_calls)), b"x")
                        .unwrap();
                }
            }
            match self.stop_after {
                Some(limit) if self.local_calls >= limit => 7,
                _ => STATUS_CONTINUE,
            }
        }
        fn duplicate(&self) -> Box<dyn FuzzerPlugin> {
            self.probe.duplicates.fetch_add(1, Ordering::SeqCst);
            Box::new(self.clone())
        }
    }

    fn config(dir: &Path, threads: usize, iterations: u64) -> HostConfig {
        HostConfig {
            cache_dir_location: Some(dir.to_path_buf()),
            cache_dir_name: "cache".to_string(),
            plugins_location: dir.join("plugins"),
            amount_of_threads: threads,
            amount_of_execution_per_thread: iterations,
        }
    }

    fn loader_for(plugin: CountingPlugin) -> StaticLoader {
        StaticLoader::new().with(move || Box::new(plugin.clone()))
    }

    fn completed(outcome: RunOutcome) -> RunReport {
        match outcome {
            RunOutcome::Completed(report) => report,
            other => panic!("Expected a completed run, got {other:?}"),
        }
    }

    #[test]
    fn no_arguments_lists_the_catalog_without_executing() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let loader = StaticLoader::new()
            .with({
                let probe = Arc::clone(&probe);
                move || Box::new(CountingPlugin::new("Alpha", &probe))
            })
            .with({
                let probe = Arc::clone(&probe);
                move || Box::new(CountingPlugin::new("Beta", &probe))
            });

        let engine = Engine::new(config(dir.path(), 2, 5), loader);
        let outcome = engine.run::<&str>(&[]).unwrap();

        match outcome {
            RunOutcome::CatalogPrinted(entries) => {
                let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
                assert_eq!(names, vec!["Alpha", "Beta"]);
                assert_eq!(entries[0].description, "counts executions");
            }
            other => panic!("Expected catalog, got {other:?}"),
        }
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
        assert!(!dir.path().join("cache").exists());
    }

    #[test]
    fn wrong_argument_count_is_a_usage_error() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let engine = Engine::new(
            config(dir.path(), 1, 5),
            loader_for(CountingPlugin::new("Alpha", &probe)),
        );

        let outcome = engine.run(&["Alpha", "{}", "extra"]).unwrap();
        assert_eq!(outcome, RunOutcome::UsageError { arg_count: 3 });
        let outcome = engine.run(&["Alpha"]).unwrap();
        assert_eq!(outcome, RunOutcome::UsageError { arg_count: 1 });
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
        assert!(probe.args.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_plugin_location_ends_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config(dir.path(), 1, 5), StaticLoader::new());
        assert_eq!(
            engine.run(&["Alpha", "{}"]).unwrap(),
            RunOutcome::NoPlugins
        );
    }

    #[test]
    fn unknown_module_name_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let engine = Engine::new(
            config(dir.path(), 1, 5),
            loader_for(CountingPlugin::new("Alpha", &probe)),
        );

        match engine.run(&["alpha", "{}"]) {
            Err(HostError::ModuleNotFound(name)) => assert_eq!(name, "alpha"),
            other => panic!("Expected ModuleNotFound, got {other:?}"),
        }
    }

    #[test]
    fn single_thread_runs_the_resolved_instance_directly() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let engine = Engine::new(
            config(dir.path(), 1, 12),
            loader_for(CountingPlugin::new("Alpha", &probe)),
        );

        let report = completed(engine.run(&["Alpha", r#"{"k":1}"#]).unwrap());
        assert_eq!(report.module, "Alpha");
        assert_eq!(report.total_iterations(), 12);
        assert_eq!(report.workers.len(), 1);
        assert_eq!(probe.executions.load(Ordering::SeqCst), 12);
        assert_eq!(probe.duplicates.load(Ordering::SeqCst), 0);
        assert_eq!(*probe.args.lock().unwrap(), vec![r#"{"k":1}"#.to_string()]);
    }

    #[test]
    fn every_worker_runs_its_own_duplicate_for_the_full_count() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let engine = Engine::new(
            config(dir.path(), 4, 25),
            loader_for(CountingPlugin::new("Alpha", &probe)),
        );

        let report = completed(engine.run(&["Alpha", "{}"]).unwrap());
        assert_eq!(report.workers.len(), 4);
        assert!(report
            .workers
            .iter()
            .all(|w| w.iterations == 25 && w.exit == WorkerExit::Finished));
        assert_eq!(report.total_iterations(), 100);
        assert_eq!(probe.executions.load(Ordering::SeqCst), 100);
        assert_eq!(probe.duplicates.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn non_zero_status_stops_only_that_workers_loop() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let mut plugin = CountingPlugin::new("Alpha", &probe);
        plugin.stop_after = Some(3);
        let engine = Engine::new(config(dir.path(), 3, 10), loader_for(plugin));

        let report = completed(engine.run(&["Alpha", "{}"]).unwrap());
        for worker in &report.workers {
            assert_eq!(worker.iterations, 3);
            assert_eq!(worker.exit, WorkerExit::Stopped(7));
        }
        assert_eq!(probe.executions.load(Ordering::SeqCst), 9);
        assert!(report.total_iterations() <= 3 * 10);
    }

    #[test]
    fn rejected_module_arguments_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let mut plugin = CountingPlugin::new("Alpha", &probe);
        plugin.reject_args = true;
        let engine = Engine::new(config(dir.path(), 2, 10), loader_for(plugin));

        match engine.run(&["Alpha", "not json"]) {
            Err(HostError::ModuleArgument { module, source }) => {
                assert_eq!(module, "Alpha");
                assert!(source.to_string().contains("target"));
            }
            other => panic!("Expected ModuleArgument, got {other:?}"),
        }
        assert_eq!(probe.executions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_cache_dir_is_handed_to_the_module_then_removed() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let engine = Engine::new(
            config(dir.path(), 2, 3),
            loader_for(CountingPlugin::new("Alpha", &probe)),
        );

        let report = completed(engine.run(&["Alpha", "{}"]).unwrap());
        let expected = dir.path().join("cache");
        assert_eq!(report.cache_dir.as_deref(), Some(expected.as_path()));
        assert_eq!(*probe.cache_dirs.lock().unwrap(), vec![expected.clone()]);
        assert!(!expected.exists());
    }

    #[test]
    fn cache_dir_with_artifacts_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let mut plugin = CountingPlugin::new("Alpha", &probe);
        plugin.write_artifact = true;
        let engine = Engine::new(config(dir.path(), 1, 2), loader_for(plugin));

        completed(engine.run(&["Alpha", "{}"]).unwrap());
        let cache = dir.path().join("cache");
        assert!(cache.join("artifact_1").exists());
        assert!(cache.join("artifact_2").exists());
    }

    #[test]
    fn blank_cache_settings_skip_the_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let mut cfg = config(dir.path(), 1, 1);
        cfg.cache_dir_location = None;
        cfg.cache_dir_name = String::new();
        let engine = Engine::new(cfg, loader_for(CountingPlugin::new("Alpha", &probe)))
            .with_working_dir(dir.path());

        let report = completed(engine.run(&["Alpha", "{}"]).unwrap());
        assert!(report.cache_dir.is_none());
        assert!(probe.cache_dirs.lock().unwrap().is_empty());
    }

    #[test]
    fn cache_dir_defaults_to_the_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(Probe::default());
        let mut cfg = config(dir.path(), 1, 1);
        cfg.cache_dir_location = None;
        let engine = Engine::new(cfg, loader_for(CountingPlugin::new("Alpha", &probe)))
            .with_working_dir(dir.path());

        let report = completed(engine.run(&["Alpha", "{}"]).unwrap());
        assert_eq!(report.cache_dir, Some(dir.path().join("cache")));
    }

    #[test]
    fn first_module_with_a_matching_name_is_selected() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(Probe::default());
        let second = Arc::new(Probe::default());
        let loader = StaticLoader::new()
            .with({
                let probe = Arc::clone(&first);
                move || Box::new(CountingPlugin::new("Twin", &probe))
            })
            .with({
                let probe = Arc::clone(&second);
                move || Box::new(CountingPlugin::new("Twin", &probe))
            });
        let engine = Engine::new(config(dir.path(), 1, 4), loader);

        completed(engine.run(&["Twin", "{}"]).unwrap());
        assert_eq!(first.executions.load(Ordering::SeqCst), 4);
        assert_eq!(second.executions.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        prepare_cache_dir(&cache).unwrap();
        prepare_cache_dir(&cache).unwrap();
        assert!(cache.is_dir());

        assert!(cleanup_cache_dir(&cache));
        assert!(!cleanup_cache_dir(&cache));
        assert!(!cleanup_cache_dir(&cache));
        assert!(!cache.exists());
    }

    #[test]
    fn run_worker_stops_on_first_non_zero_status() {
        let probe = Arc::new(Probe::default());
        let mut plugin = CountingPlugin::new("Alpha", &probe);
        plugin.stop_after = Some(1);
        let report = run_worker(5, &mut plugin, 100);
        assert_eq!(
            report,
            WorkerReport {
                worker: 5,
                iterations: 1,
                exit: WorkerExit::Stopped(7),
            }
        );
    }
}
