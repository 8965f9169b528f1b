use regex::Regex;
use std::time::Duration;
use suite_core::{Args, Row};

use super::locktool::LockTool;
use super::pattern;
use crate::benchmark::{Benchmark, ParamKind, ParamSchema, PluginEnv, RunHash, Scratch};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::CommandSpec;

/// Hash table with a fixed number of lock-protected buckets. Reports global
/// and per-thread critical-section throughput.
pub struct BucketsBenchmark {
    tool: LockTool,
    global: Regex,
    local: Regex,
    pauses: Regex,
}

impl BucketsBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        Ok(Self {
            tool: LockTool::new("buckets", "buckets", env),
            global: pattern("buckets", r"^#Throughput:\s*([\d\.]+)\s*CS/s")?,
            local: pattern(
                "buckets",
                r"^#Local result for Thread\s+(\d+):\s*([\d\.]+)\s*CS/s",
            )?,
            pauses: pattern("buckets", r"^Pauses:\s+(\d+)")?,
        })
    }
}

impl Benchmark for BucketsBenchmark {
    fn id(&self) -> &str {
        self.tool.id
    }

    fn env(&self) -> &PluginEnv {
        &self.tool.env
    }

    fn schema(&self) -> ParamSchema {
        self.tool
            .schema()
            .optional("num-threads", ParamKind::Int)
            .optional("buckets", ParamKind::Int)
            .optional("max-value", ParamKind::Int)
            .optional("offset-changes", ParamKind::Int)
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
            if let Some(c) = self.global.captures(line) {
                if let Ok(v) = c[1].parse::<f64>() {
                    row.insert("throughput", v);
                }
                continue;
            }
            if let Some(c) = self.local.captures(line) {
                if let Ok(v) = c[2].parse::<f64>() {
                    row.insert(format!("throughput_t{}", &c[1]), v);
                }
            }
            if let Some(c) = self.pauses.captures(line) {
                if let Ok(v) = c[1].parse::<i64>() {
                    row.insert("pauses", v);
                }
            }
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suite_core::Scalar;

    #[test]
    fn parses_global_local_and_pause_counts() {
        let bench = BucketsBenchmark::new(&PluginEnv::new("/opt/suite", "/tmp")).expect("plugin");
        let stdout = "\
#Local result for Thread 0: 1500.5 CS/s
#Local result for Thread 1: 1499.5 CS/s
#Throughput: 3000.0 CS/s
Pauses: 17
";
        let row = bench.parse(stdout);
        assert_eq!(row.get("throughput"), Some(&Scalar::Float(3000.0)));
        assert_eq!(row.get("throughput_t0"), Some(&Scalar::Float(1500.5)));
        assert_eq!(row.get("throughput_t1"), Some(&Scalar::Float(1499.5)));
        assert_eq!(row.get("pauses"), Some(&Scalar::Int(17)));
        assert!(bench.parse("usage: buckets [options]").is_empty());
    }

    #[test]
    fn estimate_comes_from_duration() {
        let bench = BucketsBenchmark::new(&PluginEnv::new("/opt/suite", "/tmp")).expect("plugin");
        let args = Args::new().with("lock", "mcs").with("duration", 10000);
        assert_eq!(bench.estimate_runtime(&args), Some(Duration::from_secs(10)));
        assert_eq!(
            bench.timeout_policy().timeout_for(bench.estimate_runtime(&args)),
            Duration::from_secs(100)
        );
        assert_eq!(bench.estimate_runtime(&Args::new().with("lock", "mcs")), None);
    }
}
