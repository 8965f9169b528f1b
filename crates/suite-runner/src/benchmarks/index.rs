use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use suite_core::{Args, Row, Scalar};

use super::pattern;
use crate::benchmark::{
    millis, render_flags, Benchmark, BoolStyle, ParamKind, ParamSchema, PluginEnv, RunHash,
    Scratch, TimeoutPolicy,
};
use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::CommandSpec;

const OPS: [&str; 5] = ["Insert", "Read", "Update", "Remove", "Scan"];
const FINISHES: [&str; 2] = ["completed", "succeeded"];

/// PiBench driving one index implementation, loaded as
/// `build/wrappers/lib{index}_wrapper.so`.
pub struct IndexBenchmark {
    env: PluginEnv,
    root: PathBuf,
    pibench: PathBuf,
    patterns: Vec<(String, Regex)>,
}

impl IndexBenchmark {
    pub fn new(env: &PluginEnv) -> Result<Self, ConfigError> {
        let root = env.base_dir.join("ext/index-benchmarks");
        let pibench = root.join("build/_deps/pibench-build/src/PiBench");
        env.require_executable("index", &pibench)?;
        let mut patterns = Vec::new();
        for finish in FINISHES {
            for op in OPS {
                let re = pattern("index", &format!(r"^\s+-\s{}\s{}:\s(.+)\sops", op, finish))?;
                patterns.push((format!("{}-{}", op, finish), re));
            }
        }
        Ok(Self {
            env: env.clone(),
            root,
            pibench,
            patterns,
        })
    }

    fn wrapper(&self, args: &Args) -> PathBuf {
        let index = args.get_str("index").unwrap_or_default();
        self.root
            .join("build/wrappers")
            .join(format!("lib{}_wrapper.so", index))
    }
}

impl Benchmark for IndexBenchmark {
    fn id(&self) -> &str {
        "index"
    }

    fn env(&self) -> &PluginEnv {
        &self.env
    }

    fn schema(&self) -> ParamSchema {
        ParamSchema::open()
            .required("index", ParamKind::Str)
            .optional("mode", ParamKind::Str)
            .optional("seconds", ParamKind::Float)
    }

    fn estimate_runtime(&self, args: &Args) -> Option<Duration> {
        let ms = if args.get_str("mode") == Some("time") {
            args.get_f64("seconds").map(|s| s * 1000.0).unwrap_or(20000.0)
        } else {
            3000.0
        };
        millis(ms)
    }

    fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::with_multiplier(60.0)
    }

    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError> {
        Ok(RunHash::builder("index")
            .artifact("wrapper", &self.wrapper(args))?
            .artifact("pibench", &self.pibench)?
            .finish(args))
    }

    fn command(&self, args: &Args, _scratch: &Scratch) -> Result<CommandSpec, TrialFailure> {
        Ok(CommandSpec::new(&self.pibench)
            .arg(self.wrapper(args).to_string_lossy())
            .args(render_flags(args, &["index"], BoolStyle::Capitalized))
            .args([
                "--bulk_load",
                "--pcm=False",
                "--skip_verify=True",
                "--apply_hash=False",
            ]))
    }

    /// Per-operation counts, then `completed` and `succeeded` summed across
    /// operations when anything matched.
    fn parse(&self, stdout: &str) -> Row {
        let mut row = Row::new();
        for line in stdout.lines() {
            for (column, re) in &self.patterns {
                if let Some(c) = re.captures(line) {
                    if let Ok(v) = c[1].trim().parse::<f64>() {
                        row.insert(column.as_str(), v);
                    }
                    break;
                }
            }
        }
        if row.is_empty() {
            return row;
        }
        for finish in FINISHES {
            let total: f64 = OPS
                .iter()
                .filter_map(|op| row.get(&format!("{}-{}", op, finish)))
                .filter_map(|v| match v {
                    Scalar::Float(f) => Some(*f),
                    _ => None,
                })
                .sum();
            row.insert(finish, total);
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    fn fake_pibench() -> PluginEnv {
        let base = std::env::temp_dir().join(format!(
            "suite_index_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let src = base.join("ext/index-benchmarks/build/_deps/pibench-build/src");
        fs::create_dir_all(&src).expect("dir");
        fs::create_dir_all(base.join("ext/index-benchmarks/build/wrappers")).expect("wrappers");
        let exe = src.join("PiBench");
        fs::write(&exe, "#!/bin/sh\n").expect("exe");
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).expect("chmod");
        PluginEnv::new(base, "/tmp")
    }

    #[test]
    fn sums_operations_into_totals() {
        let env = fake_pibench();
        let bench = IndexBenchmark::new(&env).expect("plugin");
        let stdout = "\
Results:
Overview:
\t- Read completed: 800 ops
\t- Read succeeded: 790 ops
\t- Insert completed: 200 ops
\t- Insert succeeded: 200 ops
";
        let row = bench.parse(stdout);
        assert_eq!(row.get("Read-completed"), Some(&Scalar::Float(800.0)));
        assert_eq!(row.get("completed"), Some(&Scalar::Float(1000.0)));
        assert_eq!(row.get("succeeded"), Some(&Scalar::Float(990.0)));
        assert!(bench.parse("PiBench: bad option").is_empty());
        let _ = fs::remove_dir_all(&env.base_dir);
    }

    #[test]
    fn command_loads_the_wrapper_and_fixed_flags() {
        let env = fake_pibench();
        let bench = IndexBenchmark::new(&env).expect("plugin");
        let scratch = Scratch::allocate(&std::env::temp_dir()).expect("scratch");
        let args = Args::new()
            .with("index", "btree")
            .with("mode", "time")
            .with("seconds", 5)
            .with("bulk", true);
        let cmd = bench.command(&args, &scratch).expect("command");
        assert!(cmd.args[0].ends_with("build/wrappers/libbtree_wrapper.so"));
        assert_eq!(&cmd.args[1..4], ["--mode=time", "--seconds=5", "--bulk=True"]);
        assert_eq!(cmd.args.last().map(String::as_str), Some("--apply_hash=False"));
        assert_eq!(bench.estimate_runtime(&args), Some(Duration::from_secs(5)));
        assert_eq!(
            bench.estimate_runtime(&Args::new().with("index", "btree")),
            Some(Duration::from_secs(3))
        );
        // The wrapper library was never built.
        assert!(bench.run_hash(&args).is_err());
        let _ = fs::remove_dir_all(&env.base_dir);
    }
}
