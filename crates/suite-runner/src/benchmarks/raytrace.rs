use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use suite_core::{Args, Row};

use super::{interpose_library, interposed, lock_arg, pattern};
use crate::benchmark::{Benchmark, ParamKind, ParamSchema, PluginEnv, RunHash, Scratch};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::CommandSpec;

const APP_DIR: &str = "ext/parsec-benchmark/ext/splash2x/apps/raytrace";

/// SPLASH-2x `raytrace` rendering the bundled `balls4` scene with
/// antialiasing. No runtime estimate exists, so the fallback timeout applies.
pub struct RaytraceBenchmark {
    env: PluginEnv,
    bin: PathBuf,
    scene: PathBuf,
    time: Regex,
}

impl RaytraceBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        let app = env.base_dir.join(APP_DIR);
        let bin = app.join("inst/amd64-linux.gcc/bin/raytrace");
        let scene = app.join("run/balls4.env");
        env.require_executable("raytrace", &bin)?;
        if !scene.is_file() {
            return Err(ConfigError::Plugin {
                benchmark: "raytrace".to_string(),
                message: format!("scene file not found: {}", scene.display()),
            });
        }
        Ok(Self {
            env: env.clone(),
            bin,
            scene,
            time: pattern("raytrace", r"Total time without initialization\s+(\d+)")?,
        })
    }
}

impl Benchmark for RaytraceBenchmark {
    fn id(&self) -> &str {
        "raytrace"
    }

    fn env(&self) -> &PluginEnv {
        &self.env
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::closed()
            .required("threads", ParamKind::Int)
            .optional("lock", ParamKind::Str)
    }

    fn estimate_runtime(&self, _args: &Args) -> Option<Duration> {
        None
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        let mut builder = RunHash::builder("raytrace")
            .artifact("executable", &self.bin)?
            .artifact("scene", &self.scene)?;
        if let Some(lock) = lock_arg(args) {
            builder = builder.artifact("interpose", &interpose_library(&self.env, lock))?;
        }
        Ok(builder.finish(args))
    }

    fn command(&self, args: &Args, _scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        let threads = args.get_i64("threads").unwrap_or(1);
        Ok(interposed(&self.env, lock_arg(args), &self.bin)
            .arg(format!("-p{}", threads))
            .arg("-a8")
            .arg(self.scene.to_string_lossy()))
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
