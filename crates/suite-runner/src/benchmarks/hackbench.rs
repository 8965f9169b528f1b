use regex::Regex;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use suite_core::{Args, Row};

use super::pattern;
use crate::benchmark::{execute, render_flags, Benchmark, BoolStyle, PluginEnv, RunHash, Scratch};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::{find_on_path, CommandSpec, Supervisor};

/// Time the companion workload gets to ramp up before hackbench starts.
const SETTLE: Duration = Duration::from_secs(1);

/// Scheduler stress test from rt-tests, taken from `PATH`.
pub struct HackbenchBenchmark {
    env: PluginEnv,
    bin: PathBuf,
    pattern: Regex,
}

impl HackbenchBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        let bin = find_on_path("hackbench").ok_or_else(|| ConfigError::MissingBinary {
            benchmark: "hackbench".to_string(),
            path: PathBuf::from("hackbench"),
        })?;
        Self::with_binary(env, bin)
    }

    fn with_binary(env: &PluginEnv, bin: PathBuf) -> Result<Self, ConfigError> {
        Ok(Self {
            env: env.clone(),
            bin,
            pattern: pattern("hackbench", r"^Time:\s+(\d+\.\d+)")?,
        })
    }
}

impl Benchmark for HackbenchBenchmark {
    fn id(&self) -> &str {
        "hackbench"
    }

    fn env(&self) -> &PluginEnv {
        &self.env
    }

    fn estimate_runtime(&self, _args: &Args) -> Option<Duration> {
        None
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        Ok(RunHash::builder("hackbench")
            .artifact("executable", &self.bin)?
            .finish(args))
    }

    fn command(&self, args: &Args, _scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        Ok(CommandSpec::new(&self.bin).args(render_flags(args, &[], BoolStyle::Switch)))
    }

    fn parse(&self, stdout: &str) -> Row {
        let mut row = Row::new();
        for line in stdout.lines() {
            if let Some(c) = self.pattern.captures(line) {
                if let Ok(v) = c[1].parse::<f64>() {
                    row.insert("time", v);
                }
            }
        }
        row
    }

    fn run(&self, args: &Args, scratch: &Scratch, supervisor: &Supervisor) -> Result<Row, TrialFailure> {
        let command = self.command(args, scratch)?;
        thread::sleep(SETTLE);
        let timeout = self.timeout_policy().timeout_for(self.estimate_runtime(args));
        execute(supervisor, &command, timeout, |stdout| self.parse(stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use suite_core::Scalar;

    #[test]
    fn runs_after_settling_and_reads_time() {
        let dir = std::env::temp_dir().join(format!(
            "suite_hackbench_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let exe = dir.join("hackbench");
        fs::write(&exe, "#!/bin/sh\necho \"Running in process mode\"\necho \"Time: 0.123\"\n")
            .expect("exe");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");

        let env = PluginEnv::new(&dir, std::env::temp_dir());
        let bench = HackbenchBenchmark::with_binary(&env, exe).expect("plugin");
        let sup = Supervisor::default();
        let scratch = bench.init(&Args::new(), &sup).expect("scratch");
        let started = std::time::Instant::now();
        let row = bench
            .run(&Args::new().with("groups", 2).with("pipe", true), &scratch, &sup)
            .expect("row");
        assert!(started.elapsed() >= SETTLE);
        assert_eq!(row.get("time"), Some(&Scalar::Float(0.123)));

        let cmd = bench
            .command(&Args::new().with("pipe", true).with("threads", false), &scratch)
            .expect("command");
        assert_eq!(cmd.args, ["--pipe"]);
        let _ = fs::remove_dir_all(dir);
    }
}
