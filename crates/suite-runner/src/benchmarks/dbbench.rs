//! `db_bench`-style key-value store benchmarks (LevelDB and the Kyoto Cabinet
//! tree DB port). Both print one `name : X micros/op;` line per workload.

use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use suite_core::{ArgValue, Args, Row};

use super::{interpose_library, interposed, lock_arg, pattern};
use crate::benchmark::{
    render_flags, Benchmark, BoolStyle, ParamKind, ParamSchema, PluginEnv, RunHash, Scratch,
    TimeoutPolicy,
};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::CommandSpec;

pub struct DbBenchBenchmark {
    id: &'static str,
    env: PluginEnv,
    bin: PathBuf,
    library_path: Option<PathBuf>,
    pattern: Regex,
}

impl DbBenchBenchmark {
    pub fn leveldb(env: &PluginEnv) -> Result<Self, ConfigError> {
        let bin = env.base_dir.join("ext/leveldb/build/db_bench");
        Self::new("leveldb", env, bin, None)
    }

    pub fn kyotocabinet(env: &PluginEnv) -> Result<Self, ConfigError> {
        let bin = env.base_dir.join("ext/leveldb/build/db_bench_tree_db");
        let library_path = env.base_dir.join("ext/kyotocabinet");
        Self::new("kyotocabinet", env, bin, Some(library_path))
    }

    fn new(
        id: &'static str,
        env: &PluginEnv,
        bin: PathBuf,
        library_path: Option<PathBuf>,
    ) -> Result<Self, ConfigError> {
        env.require_executable(id, &bin)?;
        Ok(Self {
            id,
            env: env.clone(),
            bin,
            library_path,
            pattern: pattern(id, r"(?P<name>\w+)\s+:\s+(?P<micros>\d+\.\d+)\s+micros/op;")?,
        })
    }
}

impl Benchmark for DbBenchBenchmark {
    fn id(&self) -> &str {
        self.id
    }

    fn env(&self) -> &PluginEnv {
        &self.env
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::open()
            .optional("lock", ParamKind::Str)
            .optional("benchmarks", ParamKind::Any)
            .optional("threads", ParamKind::Int)
            .optional("num", ParamKind::Int)
    }

    fn estimate_runtime(&self, _args: &Args) -> Option<Duration> {
        None
    }

    fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            fallback: Duration::from_secs(600),
            ..TimeoutPolicy::default()
        }
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        let mut builder = RunHash::builder(self.id).artifact("executable", &self.bin)?;
        if let Some(lock) = lock_arg(args) {
            builder = builder.artifact("interpose", &interpose_library(&self.env, lock))?;
        }
        Ok(builder.finish(args))
    }

    fn command(&self, args: &Args, scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        let mut cmd = interposed(&self.env, lock_arg(args), &self.bin)
            .args(render_flags(args, &["lock", "benchmarks"], BoolStyle::Numeric));
        match args.get("benchmarks") {
            Some(ArgValue::List(items)) => {
                cmd = cmd.arg(format!("--benchmarks={}", items.join(",")));
            }
            Some(other) => cmd = cmd.arg(format!("--benchmarks={}", other)),
            None => {}
        }
        cmd = cmd.arg(format!("--db={}", scratch.path("db").display()));
        if let Some(dir) = &self.library_path {
            cmd = cmd.env("LD_LIBRARY_PATH", dir.to_string_lossy());
        }
        Ok(cmd)
    }

    /// Repeated workload names get `_2`, `_3`, ... suffixes.
    fn parse(&self, stdout: &str) -> Row {
        let mut row = Row::new();
        for c in self.pattern.captures_iter(stdout) {
            let Ok(micros) = c["micros"].parse::<f64>() else {
                continue;
            };
            let base = format!("latency_{}", &c["name"]);
            let mut name = base.clone();
            let mut count = 1;
            while row.contains(&name) {
                count += 1;
                name = format!("{}_{}", base, count);
            }
            row.insert(name, micros);
        }
        row
    }
}
