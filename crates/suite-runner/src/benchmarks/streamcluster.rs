use std::path::PathBuf;
use std::time::Duration;
use suite_core::{Args, Row};

use super::cycles::{thread_scaled_estimate, CycleTimes};
use super::{interpose_library, interposed, lock_arg};
use crate::benchmark::{Benchmark, ParamKind, ParamSchema, PluginEnv, RunHash, Scratch, TimeoutPolicy};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::CommandSpec;

/// Positional parameters in command-line order, with the tool's defaults.
const POSITIONAL: [(&str, i64); 6] = [
    ("min_centers", 10),
    ("max_centers", 30),
    ("dimensions", 512),
    ("num_points", 32768),
    ("chunksize", 32768),
    ("clustersize", 2000),
];

/// PARSEC `streamcluster` kernel on generated points. Cluster output goes to
/// the trial's scratch directory.
pub struct StreamclusterBenchmark {
    env: PluginEnv,
    bin: PathBuf,
    times: CycleTimes,
}

impl StreamclusterBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        let times = CycleTimes::new("streamcluster", env)?;
        let bin = env.base_dir.join(
            "ext/parsec-benchmark/pkgs/kernels/streamcluster/inst/amd64-linux.gcc/bin/streamcluster",
        );
        env.require_executable("streamcluster", &bin)?;
        Ok(Self {
            env: env.clone(),
            bin,
            times,
        })
    }
}

impl Benchmark for StreamclusterBenchmark {
    fn id(&self) -> &str {
        "streamcluster"
    }

    fn env(&self) -> &PluginEnv {
        &self.env
    }

    fn schema(&self) -> ParamSchema {
        POSITIONAL
            .iter()
            .fold(ParamSchema::closed(), |schema, (name, _)| {
                schema.optional(name, ParamKind::Int)
            })
            .optional("lock", ParamKind::Str)
            .optional("threads", ParamKind::Int)
    }

    fn estimate_runtime(&self, args: &Args) -> Option<Duration> {
        thread_scaled_estimate(args)
    }

    fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::with_multiplier(5.0)
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        let mut builder = RunHash::builder("streamcluster").artifact("executable", &self.bin)?;
        if let Some(lock) = lock_arg(args) {
            builder = builder.artifact("interpose", &interpose_library(&self.env, lock))?;
        }
        Ok(builder.finish(args))
    }

    fn command(&self, args: &Args, scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        let positional = POSITIONAL.iter().map(|(name, default)| {
            args.get(name)
                .map(|v| v.to_string())
                .unwrap_or_else(|| default.to_string())
        });
        let threads = args.get_i64("threads").unwrap_or(10);
        Ok(interposed(&self.env, lock_arg(args), &self.bin)
            .args(positional)
            // No input file: points are generated.
            .arg("none")
            .arg(scratch.path("output.txt").to_string_lossy())
            .arg(threads.to_string()))
    }

    fn parse(&self, stdout: &str) -> Row {
        self.times.parse(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use suite_core::Scalar;

    fn fake_checkout(tag: &str) -> PluginEnv {
        let base = std::env::temp_dir().join(format!(
            "suite_streamcluster_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let bin_dir = base.join("ext/parsec-benchmark/pkgs/kernels/streamcluster/inst/amd64-linux.gcc/bin");
        fs::create_dir_all(&bin_dir).expect("bin dir");
        let exe = bin_dir.join("streamcluster");
        fs::write(&exe, "#!/bin/sh\n").expect("exe");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");
        let mut env = PluginEnv::new(base, std::env::temp_dir());
        env.tsc_khz = Some(1_000_000);
        env
    }

    #[test]
    fn positional_arguments_fall_back_to_defaults() {
        let env = fake_checkout("cmd");
        let bench = StreamclusterBenchmark::new(&env).expect("plugin");
        let scratch = Scratch::allocate(&env.temp_dir).expect("scratch");
        let args = Args::new().with("dimensions", 128).with("threads", 4);
        let cmd = bench.command(&args, &scratch).expect("command");
        assert_eq!(cmd.program, bench.bin);
        assert_eq!(
            cmd.args,
            [
                "10".to_string(),
                "30".to_string(),
                "128".to_string(),
                "32768".to_string(),
                "32768".to_string(),
                "2000".to_string(),
                "none".to_string(),
                scratch.path("output.txt").to_string_lossy().to_string(),
                "4".to_string(),
            ]
        );
        let default_threads = bench.command(&Args::new(), &scratch).expect("command");
        assert_eq!(default_threads.args.last().map(String::as_str), Some("10"));

        let locked = bench
            .command(&Args::new().with("lock", "mcs"), &scratch)
            .expect("command");
        assert_eq!(locked.program, env.base_dir.join("interpose_mcs.sh"));
        assert_eq!(locked.args[0], bench.bin.to_string_lossy());
        let _ = fs::remove_dir_all(&env.base_dir);
    }

    #[test]
    fn reports_cycle_times_and_scales_timeout_by_five() {
        let env = fake_checkout("parse");
        let bench = StreamclusterBenchmark::new(&env).expect("plugin");
        let row = bench.parse("read 32768 points\nSetup time: 3000000\nBenchmark time: 12000000\n");
        assert_eq!(row.get("setup_time"), Some(&Scalar::Float(3.0)));
        assert_eq!(row.get("run_time"), Some(&Scalar::Float(12.0)));
        let estimate = bench.estimate_runtime(&Args::new().with("threads", 8));
        assert_eq!(estimate, Some(Duration::from_secs(8)));
        assert_eq!(
            bench.timeout_policy().timeout_for(estimate),
            Duration::from_secs(40)
        );
        assert!(bench.schema().validate(&Args::new().with("points", 3)).is_err());
        let _ = fs::remove_dir_all(&env.base_dir);
    }
}
