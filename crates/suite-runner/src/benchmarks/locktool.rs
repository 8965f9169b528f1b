//! Microbenchmarks built once per lock implementation, as
//! `{base}/build/{prefix}_{lock}`. All of them take `--key=value` flags and
//! most accept a `duration` (or `d`) in milliseconds.

use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use suite_core::{Args, Row};

use super::pattern;
use crate::benchmark::{
    millis_arg, render_flags, Benchmark, BoolStyle, ParamKind, ParamSchema, PluginEnv, RunHash,
    Scratch,
};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::CommandSpec;

#[derive(Debug, Clone)]
pub(crate) struct LockTool {
    pub id: &'static str,
    prefix: &'static str,
    pub env: PluginEnv,
}

impl LockTool {
    pub fn new(id: &'static str, prefix: &'static str, env: &PluginEnv) -> Self {
        Self {
            id,
            prefix,
            env: env.clone(),
        }
    }

    pub fn executable(&self, args: &Args) -> PathBuf {
        let lock = args.get_str("lock").unwrap_or_default();
        self.env
            .build_dir()
            .join(format!("{}_{}", self.prefix, lock))
    }

    pub fn schema(&self) -> ParamSchema {
        ParamSchema::open()
            .required("lock", ParamKind::Str)
            .optional("duration", ParamKind::Float)
            .optional("d", ParamKind::Float)
    }

    pub fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        Ok(RunHash::builder(self.id)
            .artifact("executable", &self.executable(args))?
            .finish(args))
    }

    pub fn command(&self, args: &Args) -> CommandSpec {
        CommandSpec::new(self.executable(args)).args(render_flags(args, &["lock"], BoolStyle::Numeric))
    }

    pub fn duration_estimate(args: &Args) -> Option<Duration> {
        millis_arg(args, "duration").or_else(|| millis_arg(args, "d"))
    }
}

/// Counter-based mutual exclusion check: the lock is correct when the shared
/// counter ends at the expected total.
pub struct CorrectnessBenchmark {
    tool: LockTool,
    pattern: Regex,
}

impl CorrectnessBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        Ok(Self {
            tool: LockTool::new("correctness", "test_correctness", env),
            pattern: pattern(
                "correctness",
                r"^Counter total\s*:\s*(\d+),\s*Expected\s*:\s*(\d+)",
            )?,
        })
    }
}

impl Benchmark for CorrectnessBenchmark {
    fn id(&self) -> &str {
        self.tool.id
    }

    fn env(&self) -> &PluginEnv {
        &self.tool.env
    }

    fn schema(&self) -> ParamSchema {
        self.tool.schema()
    }

    fn estimate_runtime(&self, args: &Args) -> Option<Duration> {
        LockTool::duration_estimate(args)
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        self.tool.run_hash(args)
    }

    fn command(&self, args: &Args, _scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        Ok(self.tool.command(args))
    }

    fn parse(&self, stdout: &str) -> Row {
        let mut row = Row::new();
        for line in stdout.lines() {
            let Some(c) = self.pattern.captures(line) else {
                continue;
            };
            let (Ok(total), Ok(expected)) = (c[1].parse::<i64>(), c[2].parse::<i64>()) else {
                continue;
            };
            row.insert("counter_total", total);
            row.insert("expected", expected);
            row.insert("correct", total == expected);
        }
        row
    }
}

/// Lock initialisation smoke test. The tool prints nothing useful; a clean
/// exit is the result.
pub struct InitBenchmark {
    tool: LockTool,
}

impl InitBenchmark {
    pub fn new(env: &PluginEnv) -> Self {
        Self {
            tool: LockTool::new("init", "test_init", env),
        }
    }
}

impl Benchmark for InitBenchmark {
    fn id(&self) -> &str {
        self.tool.id
    }

    fn env(&self) -> &PluginEnv {
        &self.tool.env
    }

    fn schema(&self) -> ParamSchema {
        self.tool.schema()
    }

    fn estimate_runtime(&self, args: &Args) -> Option<Duration> {
        LockTool::duration_estimate(args)
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        self.tool.run_hash(args)
    }

    fn command(&self, args: &Args, _scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        Ok(self.tool.command(args))
    }

    fn parse(&self, _stdout: &str) -> Row {
        let mut row = Row::new();
        row.insert("completed", true);
        row
    }
}
