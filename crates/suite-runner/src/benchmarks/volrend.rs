use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use suite_core::{Args, Row};

use super::{interpose_library, interposed, lock_arg, pattern};
use crate::benchmark::{
    millis, Benchmark, ParamKind, ParamSchema, PluginEnv, RunHash, Scratch, TimeoutPolicy,
};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::CommandSpec;

/// SPLASH-2x `volrend` rendering the `head` dataset for 1000 frames. The tool
/// loads its inputs by relative path, so it runs inside its `run/` directory.
pub struct VolrendBenchmark {
    env: PluginEnv,
    bin: PathBuf,
    run_dir: PathBuf,
    time: Regex,
}

impl VolrendBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        let app = env.base_dir.join("ext/parsec-benchmark/ext/splash2x/apps/volrend");
        let bin = app.join("inst/amd64-linux.gcc/bin/volrend");
        env.require_executable("volrend", &bin)?;
        Ok(Self {
            env: env.clone(),
            bin,
            run_dir: app.join("run"),
            time: pattern("volrend", r"Benchmark time:\s+(\d+)")?,
        })
    }

    fn threads(args: &Args) -> i64 {
        args.get_i64("threads").filter(|t| *t > 0).unwrap_or(1)
    }
}

impl Benchmark for VolrendBenchmark {
    fn id(&self) -> &str {
        "volrend"
    }

    fn env(&self) -> &PluginEnv {
        &self.env
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::closed()
            .optional("lock", ParamKind::Str)
            .optional("threads", ParamKind::Int)
    }

    fn estimate_runtime(&self, args: &Args) -> Option<Duration> {
        millis((2_000_000 / Self::threads(args)).max(15_000) as f64)
    }

    fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::with_multiplier(8.0)
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        let mut builder = RunHash::builder("volrend").artifact("executable", &self.bin)?;
        if let Some(lock) = lock_arg(args) {
            builder = builder.artifact("interpose", &interpose_library(&self.env, lock))?;
        }
        Ok(builder.finish(args))
    }

    fn command(&self, args: &Args, _scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        Ok(interposed(&self.env, lock_arg(args), &self.bin)
            .arg(Self::threads(args).to_string())
            .arg("head")
            .arg("1000")
            .current_dir(&self.run_dir))
    }

    fn parse(&self, stdout: &str) -> Row {
        let mut row = Row::new();
        if let Some(micros) = self
            .time
            .captures_iter(stdout)
            .filter_map(|c| c[1].parse::<i64>().ok())
            .last()
        {
            row.insert("time", micros);
        }
        row
    }
}
