//! Built-in benchmark plugins and the static table that registers them.

mod buckets;
mod cycles;
mod dbbench;
mod dedup;
mod hackbench;
mod index;
mod locktool;
mod raytrace;
mod scheduling;
mod streamcluster;
mod volrend;

pub use buckets::BucketsBenchmark;
pub use dbbench::DbBenchBenchmark;
pub use dedup::DedupBenchmark;
pub use hackbench::HackbenchBenchmark;
pub use index::IndexBenchmark;
pub use locktool::{CorrectnessBenchmark, InitBenchmark};
pub use raytrace::RaytraceBenchmark;
pub use scheduling::SchedulingBenchmark;
pub use streamcluster::StreamclusterBenchmark;
pub use volrend::VolrendBenchmark;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::benchmark::{Benchmark, PluginEnv};
use crate::error::ConfigError;
use crate::registry::Factory;
use crate::supervisor::CommandSpec;

/// Identifier → constructor for every plugin shipped with the suite.
pub fn builtin() -> Vec<(&'static str, Factory)> {
    vec![
        ("buckets", factory(|env| Ok(Arc::new(BucketsBenchmark::new(env)?)))),
        ("scheduling", factory(|env| Ok(Arc::new(SchedulingBenchmark::new(env)?)))),
        ("correctness", factory(|env| Ok(Arc::new(CorrectnessBenchmark::new(env)?)))),
        ("init", factory(|env| Ok(Arc::new(InitBenchmark::new(env))))),
        ("leveldb", factory(|env| Ok(Arc::new(DbBenchBenchmark::leveldb(env)?)))),
        ("kyotocabinet", factory(|env| Ok(Arc::new(DbBenchBenchmark::kyotocabinet(env)?)))),
        ("dedup", factory(|env| Ok(Arc::new(DedupBenchmark::new(env)?)))),
        ("streamcluster", factory(|env| Ok(Arc::new(StreamclusterBenchmark::new(env)?)))),
        ("raytrace", factory(|env| Ok(Arc::new(RaytraceBenchmark::new(env)?)))),
        ("volrend", factory(|env| Ok(Arc::new(VolrendBenchmark::new(env)?)))),
        ("index", factory(|env| Ok(Arc::new(IndexBenchmark::new(env)?)))),
        ("hackbench", factory(|env| Ok(Arc::new(HackbenchBenchmark::new(env)?)))),
    ]
}

fn factory<F>(f: F) -> Factory
where
    F: Fn(&PluginEnv) -> Result<Arc<dyn Benchmark>, ConfigError> + Send + Sync + 'static,
{
    Box::new(f)
}

pub(crate) fn pattern(benchmark: &str, re: &str) -> Result<Regex, ConfigError> {
    Regex::new(re).map_err(|e| ConfigError::Plugin {
        benchmark: benchmark.to_string(),
        message: format!("bad output pattern: {}", e),
    })
}

/// Lock name of a trial; `stock` means the tool's own locking.
pub(crate) fn lock_arg(args: &suite_core::Args) -> Option<&str> {
    args.get_str("lock").filter(|lock| *lock != "stock")
}

/// Wrapper script that preloads the interposition library for `lock`.
pub(crate) fn interpose_wrapper(env: &PluginEnv, lock: &str) -> PathBuf {
    env.base_dir.join(format!("interpose_{}.sh", lock))
}

/// The interposition library itself; it changes the measured code, so it is
/// part of the run hash whenever it is loaded.
pub(crate) fn interpose_library(env: &PluginEnv, lock: &str) -> PathBuf {
    env.base_dir.join(format!("interpose_{}.so", lock))
}

/// `program` started through the interposition wrapper when a lock is set.
pub(crate) fn interposed(env: &PluginEnv, lock: Option<&str>, program: &Path) -> CommandSpec {
    match lock {
        Some(lock) => CommandSpec::new(interpose_wrapper(env, lock)).arg(program.to_string_lossy()),
        None => CommandSpec::new(program),
    }
}
