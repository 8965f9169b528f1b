use regex::Regex;
use std::time::Duration;
use suite_core::{Args, Row};

use super::locktool::LockTool;
use super::pattern;
use crate::benchmark::{millis, Benchmark, ParamKind, ParamSchema, PluginEnv, RunHash, Scratch};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::CommandSpec;

/// Thread-count sweep: the tool walks from `base-threads` to `num-threads`
/// (and back down unless `increasing-only=1`), printing one
/// `step, threads, throughput` line per step. Mostly used as a companion
/// workload.
pub struct SchedulingBenchmark {
    tool: LockTool,
    step: Regex,
}

impl SchedulingBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        Ok(Self {
            tool: LockTool::new("scheduling", "scheduling", env),
            step: pattern("scheduling", r"^(\d+),\s*(\d+),\s*([+-]?\d*\.\d+)")?,
        })
    }
}

impl Benchmark for SchedulingBenchmark {
    fn id(&self) -> &str {
        self.tool.id
    }

    fn env(&self) -> &PluginEnv {
        &self.tool.env
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::open()
            .required("lock", ParamKind::Str)
            .optional("num-threads", ParamKind::Int)
            .optional("base-threads", ParamKind::Int)
            .optional("thread-step", ParamKind::Int)
            .optional("step-duration", ParamKind::Float)
            .optional("increasing-only", ParamKind::Int)
    }

    fn estimate_runtime(&self, args: &Args) -> Option<Duration> {
        let mut steps = args.get_f64("num-threads").unwrap_or(10.0);
        if let Some(base) = args.get_f64("base-threads") {
            steps -= base;
        }
        if let Some(step) = args.get_f64("thread-step").filter(|s| *s > 0.0) {
            steps /= step;
        }
        if args.get_i64("increasing-only") != Some(1) {
            steps = steps * 2.0 + 5.0;
        }
        let step_ms = args.get_f64("step-duration").unwrap_or(1000.0);
        let total_ms = steps * step_ms;
        millis(total_ms)
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
            let Some(c) = self.step.captures(line) else {
                continue;
            };
            let (Ok(step), Ok(threads), Ok(throughput)) =
                (c[1].parse::<i64>(), c[2].parse::<i64>(), c[3].parse::<f64>())
            else {
                continue;
            };
            row.insert(format!("threads_s{}", step), threads);
            row.insert(format!("throughput_s{}", step), throughput);
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suite_core::Scalar;

    fn bench() -> SchedulingBenchmark {
        SchedulingBenchmark::new(&PluginEnv::new("/opt/suite", "/tmp")).expect("plugin")
    }

    #[test]
    fn estimate_follows_the_sweep_shape() {
        let b = bench();
        // 10 default steps, up and down plus 5 settle steps, 1 s each.
        assert_eq!(b.estimate_runtime(&Args::new()), Some(Duration::from_secs(25)));
        let args = Args::new()
            .with("lock", "mcstas")
            .with("base-threads", 4)
            .with("num-threads", 4)
            .with("step-duration", 15000);
        assert_eq!(b.estimate_runtime(&args), Some(Duration::from_secs(75)));
        let args = Args::new()
            .with("num-threads", 16)
            .with("thread-step", 2)
            .with("increasing-only", 1);
        assert_eq!(b.estimate_runtime(&args), Some(Duration::from_secs(8)));
    }

    #[test]
    fn each_step_becomes_a_column_pair() {
        let row = bench().parse("header\n0, 1, 100.5\n1, 2, 180.25\n");
        assert_eq!(row.get("threads_s0"), Some(&Scalar::Int(1)));
        assert_eq!(row.get("throughput_s1"), Some(&Scalar::Float(180.25)));
        assert_eq!(row.len(), 4);
    }
}
