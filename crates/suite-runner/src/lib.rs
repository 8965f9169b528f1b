//! Trial execution engine: benchmark plugins, their registry, the result
//! cache, process supervision and the orchestrator that ties them together.

pub mod aggregate;
pub mod benchmark;
pub mod benchmarks;
pub mod cache;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod supervisor;

pub use aggregate::{aggregate, Table, TestMeta};
pub use benchmark::{Benchmark, ParamKind, ParamSchema, PluginEnv, RunHash, Scratch, TimeoutPolicy};
pub use cache::{CacheKey, CacheMode, ResultCache};
pub use config::{load_experiment, load_experiment_file, SuiteConfig};
pub use error::{ConfigError, HashingError, TrialFailure};
pub use orchestrator::{
    Estimate, ExperimentReport, Orchestrator, RecordSettings, Tally, TrialRecord, TrialStatus,
};
pub use registry::{Factory, Registry};
pub use supervisor::{BackgroundProcess, CancelToken, CommandSpec, ProcessError, Supervisor};
