use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use suite_core::{Args, Row};
use tracing::debug;

use super::cycles::{thread_scaled_estimate, CycleTimes};
use super::{interpose_library, interposed, lock_arg};
use crate::benchmark::{
    hash_artifact, Benchmark, ParamKind, ParamSchema, PluginEnv, RunHash, Scratch, TimeoutPolicy,
};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::{CommandSpec, Supervisor};

const FIXTURE: &str = "input.dat.ddp";
const SETUP_TIMEOUT: Duration = Duration::from_secs(100);

/// PARSEC `dedup` kernel. Compression trials read the ISO input directly;
/// decompression trials (`compress: false`) first compress it into a
/// per-trial fixture. Times are reported in TSC cycles and converted to
/// milliseconds with the configured `tsc_khz`.
pub struct DedupBenchmark {
    env: PluginEnv,
    bin: PathBuf,
    input: PathBuf,
    input_hash: Mutex<Option<String>>,
    times: CycleTimes,
}

impl DedupBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        let times = CycleTimes::new("dedup", env)?;
        let kernel = env.base_dir.join("ext/parsec-benchmark/pkgs/kernels/dedup");
        let input = kernel.join("run/FC-6-x86_64-disc1.iso");
        let bin = kernel.join("inst/amd64-linux.gcc/bin/dedup");
        if !input.is_file() {
            return Err(ConfigError::Plugin {
                benchmark: "dedup".to_string(),
                message: format!("input file not found: {}", input.display()),
            });
        }
        env.require_executable("dedup", &bin)?;
        Ok(Self {
            env: env.clone(),
            bin,
            input,
            input_hash: Mutex::new(None),
            times,
        })
    }

    fn compressing(args: &Args) -> bool {
        args.get_bool("compress").unwrap_or(true)
    }

    /// The ISO is several hundred megabytes; hash it once per plugin.
    fn input_digest(&self) -> Result<String, HashingError> {
        let mut memo = self
            .input_hash
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(digest) = memo.as_ref() {
            return Ok(digest.clone());
        }
        let digest = hash_artifact("input", &self.input)?;
        *memo = Some(digest.clone());
        Ok(digest)
    }
}

impl Benchmark for DedupBenchmark {
    fn id(&self) -> &str {
        "dedup"
    }

    fn env(&self) -> &PluginEnv {
        &self.env
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::closed()
            .optional("lock", ParamKind::Str)
            .optional("threads", ParamKind::Int)
            .optional("compress", ParamKind::Bool)
            .optional("compression_type", ParamKind::Str)
    }

    fn estimate_runtime(&self, args: &Args) -> Option<Duration> {
        thread_scaled_estimate(args)
    }

    fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::with_multiplier(100.0)
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        let mut builder = RunHash::builder("dedup").artifact("executable", &self.bin)?;
        if let Some(lock) = lock_arg(args) {
            builder = builder.artifact("interpose", &interpose_library(&self.env, lock))?;
        }
        Ok(builder.digest("input", self.input_digest()?).finish(args))
    }

    fn init(&self, args: &Args, supervisor: &Supervisor) -> Result<Scratch, TrialFailure> {
        let scratch = Scratch::allocate(&self.env.temp_dir)?;
        if Self::compressing(args) {
            return Ok(scratch);
        }
        let mut cmd = CommandSpec::new(&self.bin).arg("-c").arg("-p");
        if let Some(kind) = args.get_str("compression_type") {
            cmd = cmd.arg(format!("-w{}", kind));
        }
        cmd = cmd
            .arg("-t20")
            .arg(format!("-i{}", self.input.display()))
            .arg(format!("-o{}", scratch.path(FIXTURE).display()));
        debug!(command = %cmd.display(), "compressing dedup fixture");
        let output = supervisor
            .run(&cmd, SETUP_TIMEOUT)
            .map_err(|e| TrialFailure::Setup(format!("dedup fixture: {}", e)))?;
        if !output.success() {
            return Err(TrialFailure::Setup(format!(
                "dedup fixture exited with status {}: {}",
                output.status_label(),
                output.stderr_tail()
            )));
        }
        Ok(scratch)
    }

    fn command(&self, args: &Args, scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        let compress = Self::compressing(args);
        let mut cmd = interposed(&self.env, lock_arg(args), &self.bin)
            .arg(if compress { "-c" } else { "-u" })
            .arg("-p");
        if let Some(kind) = args.get_str("compression_type") {
            cmd = cmd.arg(format!("-w{}", kind));
        }
        if let Some(threads) = args.get_i64("threads") {
            cmd = cmd.arg(format!("-t{}", threads));
        }
        let (input, output) = if compress {
            (self.input.clone(), scratch.path("output.dat.ddp"))
        } else {
            (scratch.path(FIXTURE), scratch.path("output.iso"))
        };
        Ok(cmd
            .arg(format!("-i{}", input.display()))
            .arg(format!("-o{}", output.display())))
    }

    fn parse(&self, stdout: &str) -> Row {
        self.times.parse(stdout)
    }
}
