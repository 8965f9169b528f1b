use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use suite_core::{BenchmarkRef, TestDescriptor};
use tracing::debug;

use crate::benchmark::{Benchmark, PluginEnv};
use crate::benchmarks;
use crate::error::ConfigError;

/// Builds a plugin for the given environment. Construction may fail when the
/// plugin's tool is not installed.
pub type Factory =
    Box<dyn Fn(&PluginEnv) -> Result<Arc<dyn Benchmark>, ConfigError> + Send + Sync>;

/// Identifier → plugin. Each plugin is constructed on first use and shared
/// by every trial after that.
pub struct Registry {
    env: PluginEnv,
    factories: IndexMap<String, Factory>,
    instances: Mutex<HashMap<String, Arc<dyn Benchmark>>>,
}

impl Registry {
    pub fn new(env: PluginEnv) -> Self {
        Self {
            env,
            factories: IndexMap::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_builtin(env: PluginEnv) -> Self {
        let mut registry = Self::new(env);
        for (id, factory) in benchmarks::builtin() {
            registry.factories.insert(id.to_string(), factory);
        }
        registry
    }

    /// Adds or replaces a plugin. A replaced plugin's cached instance is
    /// discarded.
    pub fn register<F>(&mut self, id: &str, factory: F)
    where
        F: Fn(&PluginEnv) -> Result<Arc<dyn Benchmark>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(id.to_string(), Box::new(factory));
        self.instances
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id);
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn env(&self) -> &PluginEnv {
        &self.env
    }

    pub fn get_benchmark(&self, id: &str) -> Result<Arc<dyn Benchmark>, ConfigError> {
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = instances.get(id) {
            return Ok(Arc::clone(existing));
        }
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| ConfigError::UnknownBenchmark(id.to_string()))?;
        let instance = factory(&self.env)?;
        debug!(benchmark = id, "constructed plugin");
        instances.insert(id.to_string(), Arc::clone(&instance));
        Ok(instance)
    }

    /// Resolves both plugins of a test and checks their arguments. Every
    /// schema problem of a reference is reported together.
    pub fn validate(&self, test: &TestDescriptor) -> Result<(), ConfigError> {
        self.validate_ref(&test.name, &test.benchmark)?;
        if let Some(concurrent) = &test.concurrent {
            self.validate_ref(&test.name, concurrent)?;
        }
        Ok(())
    }

    fn validate_ref(&self, test: &str, reference: &BenchmarkRef) -> Result<(), ConfigError> {
        let plugin = self.get_benchmark(&reference.id)?;
        plugin
            .schema()
            .validate(&reference.args)
            .map_err(|message| ConfigError::InvalidArgs {
                test: test.to_string(),
                message: format!("{}: {}", reference.id, message),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::{ParamKind, ParamSchema, RunHash, Scratch};
    use crate::error::{HashingError, TrialFailure};
    use crate::supervisor::CommandSpec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use suite_core::{Args, Row};

    struct Echo(PluginEnv);

    impl Benchmark for Echo {
        fn id(&self) -> &str {
            "echo"
        }
        fn env(&self) -> &PluginEnv {
            &self.0
        }
        fn schema(&self) -> ParamSchema {
            ParamSchema::closed().required("text", ParamKind::Str)
        }
        fn estimate_runtime(&self, _args: &Args) -> Option<Duration> {
            None
        }
        fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
            Ok(RunHash::builder("echo").finish(args))
        }
        fn command(&self, args: &Args, _scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
            Ok(CommandSpec::new("/bin/echo").arg(args.get_str("text").unwrap_or_default()))
        }
        fn parse(&self, stdout: &str) -> Row {
            let mut row = Row::new();
            row.insert("echo", stdout.trim());
            row
        }
    }

    fn test_with(args: Args) -> TestDescriptor {
        TestDescriptor {
            name: "t".to_string(),
            label: None,
            benchmark: BenchmarkRef {
                id: "echo".to_string(),
                args,
            },
            concurrent: None,
        }
    }

    #[test]
    fn plugins_are_constructed_once() {
        static BUILT: AtomicUsize = AtomicUsize::new(0);
        let mut registry = Registry::new(PluginEnv::new("/opt/suite", "/tmp"));
        registry.register("echo", |env| {
            BUILT.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Echo(env.clone())))
        });
        let a = registry.get_benchmark("echo").expect("echo");
        let b = registry.get_benchmark("echo").expect("echo");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(BUILT.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ids().collect::<Vec<_>>(), ["echo"]);
    }

    #[test]
    fn unknown_ids_and_bad_args_are_configuration_errors() {
        let mut registry = Registry::new(PluginEnv::new("/opt/suite", "/tmp"));
        registry.register("echo", |env| Ok(Arc::new(Echo(env.clone()))));
        assert!(matches!(
            registry.get_benchmark("nope"),
            Err(ConfigError::UnknownBenchmark(id)) if id == "nope"
        ));
        assert!(registry
            .validate(&test_with(Args::new().with("text", "hi")))
            .is_ok());
        let err = registry
            .validate(&test_with(Args::new().with("text", 3).with("loud", true)))
            .expect_err("invalid");
        let message = err.to_string();
        assert!(message.contains("'text' must be string"), "{}", message);
        assert!(message.contains("unknown argument 'loud'"), "{}", message);
    }

    #[test]
    fn builtin_table_lists_every_plugin() {
        let registry = Registry::with_builtin(PluginEnv::new("/nonexistent", "/tmp"));
        let ids: Vec<_> = registry.ids().collect();
        for id in [
            "buckets",
            "scheduling",
            "correctness",
            "init",
            "leveldb",
            "kyotocabinet",
            "dedup",
            "streamcluster",
            "raytrace",
            "volrend",
            "index",
            "hackbench",
        ] {
            assert!(ids.contains(&id), "{} missing", id);
        }
        assert!(registry.get_benchmark("buckets").is_ok());
        assert!(matches!(
            registry.get_benchmark("leveldb"),
            Err(ConfigError::MissingBinary { .. })
        ));
    }
}
