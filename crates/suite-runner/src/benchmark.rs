//! The contract every benchmark plugin implements, plus the pieces plugins
//! share: argument schemas, run hashes, scratch space, timeouts and the
//! standard execute-then-parse path.

use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use suite_core::{canonical_json_digest, sha256_file, ArgValue, Args, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ConfigError, HashingError, TrialFailure};
use crate::supervisor::{is_executable, CommandSpec, Supervisor};

/// Where plugins find built artifacts and where they may put scratch files.
#[derive(Debug, Clone)]
pub struct PluginEnv {
    pub base_dir: PathBuf,
    pub temp_dir: PathBuf,
    /// TSC frequency in kHz, for tools that report raw cycle counts.
    pub tsc_khz: Option<u64>,
}

impl PluginEnv {
    pub fn new(base_dir: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            temp_dir: temp_dir.into(),
            tsc_khz: None,
        }
    }

    pub fn build_dir(&self) -> PathBuf {
        self.base_dir.join("build")
    }

    /// Construction-time check that `path` exists and is executable.
    pub fn require_executable(&self, benchmark: &str, path: &Path) -> Result<(), ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::MissingBinary {
                benchmark: benchmark.to_string(),
                path: path.to_path_buf(),
            });
        }
        if !is_executable(path) {
            return Err(ConfigError::NotExecutable {
                benchmark: benchmark.to_string(),
                path: path.to_path_buf(),
            });
        }
        Ok(())
    }
}

/// A benchmark plugin wraps one external tool.
pub trait Benchmark: Send + Sync {
    fn id(&self) -> &str;

    fn env(&self) -> &PluginEnv;

    /// Parameters the plugin understands. Checked before any trial runs.
    fn schema(&self) -> ParamSchema {
        ParamSchema::open()
    }

    /// Best-effort runtime estimate, only used to size timeouts.
    fn estimate_runtime(&self, args: &Args) -> Option<Duration>;

    fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::default()
    }

    /// Fingerprint of everything that makes two trials interchangeable.
    fn run_hash(&self, args: &Args) -> Result<RunHash, HashingError>;

    /// Per-trial setup. Allocates a fresh scratch directory; plugins that need
    /// fixtures materialise them inside it.
    fn init(&self, args: &Args, supervisor: &Supervisor) -> Result<Scratch, TrialFailure> {
        let _ = (args, supervisor);
        Scratch::allocate(&self.env().temp_dir)
    }

    /// The external command line for `args`.
    fn command(&self, args: &Args, scratch: &Scratch) -> Result<CommandSpec, TrialFailure>;

    /// Extracts result fields from the tool's standard output.
    fn parse(&self, stdout: &str) -> Row;

    fn run(&self, args: &Args, scratch: &Scratch, supervisor: &Supervisor) -> Result<Row, TrialFailure> {
        let command = self.command(args, scratch)?;
        let timeout = self.timeout_policy().timeout_for(self.estimate_runtime(args));
        execute(supervisor, &command, timeout, |stdout| self.parse(stdout))
    }
}

/// Runs `command` and parses its output. Non-zero exit, timeout, spawn
/// failure and an empty parse all come back as [`TrialFailure`].
pub fn execute<F>(
    supervisor: &Supervisor,
    command: &CommandSpec,
    timeout: Duration,
    parse: F,
) -> Result<Row, TrialFailure>
where
    F: FnOnce(&str) -> Row,
{
    info!(command = %command.display(), timeout_s = timeout.as_secs_f64(), "executing");
    let result = supervisor
        .run(command, timeout)
        .map_err(TrialFailure::from)
        .and_then(|output| {
            if !output.success() {
                return Err(TrialFailure::Exit {
                    status: output.status_label(),
                    stderr_tail: output.stderr_tail(),
                });
            }
            let row = parse(&output.stdout);
            if row.is_empty() {
                return Err(TrialFailure::NoFields);
            }
            Ok(row)
        });
    if let Err(failure) = &result {
        warn!(
            command = %command.display(),
            kind = failure.kind(),
            "command failed: {}",
            failure
        );
    }
    result
}

/// How long a trial may run: `estimate × multiplier`, never below `floor`,
/// and `fallback` when no estimate exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPolicy {
    pub multiplier: f64,
    pub floor: Duration,
    pub fallback: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            multiplier: 10.0,
            floor: Duration::from_secs(10),
            fallback: Duration::from_secs(60),
        }
    }
}

impl TimeoutPolicy {
    pub fn with_multiplier(multiplier: f64) -> Self {
        Self {
            multiplier,
            ..Self::default()
        }
    }

    pub fn timeout_for(&self, estimate: Option<Duration>) -> Duration {
        match estimate {
            Some(estimate) => Duration::try_from_secs_f64(estimate.as_secs_f64() * self.multiplier)
                .unwrap_or(Duration::MAX)
                .max(self.floor),
            None => self.fallback.max(self.floor),
        }
    }
}

/// Per-trial scratch directory under `temp_dir`, named by a fresh UUID and
/// removed when dropped.
#[derive(Debug)]
pub struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    pub fn allocate(temp_dir: &Path) -> Result<Self, TrialFailure> {
        let dir = temp_dir.join(format!("suite-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).map_err(|e| {
            TrialFailure::Setup(format!("cannot create scratch dir {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// Content fingerprint of a trial's cacheable inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunHash(String);

impl RunHash {
    pub fn builder(benchmark: &str) -> RunHashBuilder {
        RunHashBuilder {
            benchmark: benchmark.to_string(),
            artifacts: BTreeMap::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug)]
pub struct RunHashBuilder {
    benchmark: String,
    artifacts: BTreeMap<String, String>,
}

impl RunHashBuilder {
    /// Hashes the bytes of `path` into the fingerprint under `label`.
    pub fn artifact(mut self, label: &str, path: &Path) -> Result<Self, HashingError> {
        let digest = hash_artifact(label, path)?;
        self.artifacts.insert(label.to_string(), digest);
        Ok(self)
    }

    /// Adds an already computed digest.
    pub fn digest(mut self, label: &str, digest: impl Into<String>) -> Self {
        self.artifacts.insert(label.to_string(), digest.into());
        self
    }

    pub fn finish(self, args: &Args) -> RunHash {
        RunHash(canonical_json_digest(&json!({
            "benchmark": self.benchmark,
            "artifacts": self.artifacts,
            "args": args.to_canonical_json(),
        })))
    }
}

pub fn hash_artifact(label: &str, path: &Path) -> Result<String, HashingError> {
    sha256_file(path).map_err(|source| HashingError {
        label: label.to_string(),
        artifact: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    /// Accepts integers too.
    Float,
    Str,
    Bool,
    List,
    Any,
}

impl ParamKind {
    fn accepts(&self, value: &ArgValue) -> bool {
        matches!(
            (self, value),
            (ParamKind::Any, _)
                | (ParamKind::Int, ArgValue::Int(_))
                | (ParamKind::Float, ArgValue::Int(_) | ArgValue::Float(_))
                | (ParamKind::Str, ArgValue::Str(_))
                | (ParamKind::Bool, ArgValue::Bool(_))
                | (ParamKind::List, ArgValue::List(_))
        )
    }

    fn name(&self) -> &'static str {
        match self {
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "string",
            ParamKind::Bool => "bool",
            ParamKind::List => "list",
            ParamKind::Any => "any",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

/// Declared parameters of a plugin. An open schema also accepts undeclared
/// arguments, which are passed through to the tool untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
    open: bool,
}

impl ParamSchema {
    pub fn open() -> Self {
        Self {
            params: Vec::new(),
            open: true,
        }
    }

    pub fn closed() -> Self {
        Self {
            params: Vec::new(),
            open: false,
        }
    }

    pub fn required(mut self, name: &str, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: ParamKind) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Reports every violation at once, separated by `; `.
    pub fn validate(&self, args: &Args) -> Result<(), String> {
        let mut problems = Vec::new();
        for spec in &self.params {
            match args.get(&spec.name) {
                None if spec.required => {
                    problems.push(format!("missing required argument '{}'", spec.name))
                }
                Some(value) if !spec.kind.accepts(value) => problems.push(format!(
                    "argument '{}' must be {}, got {}",
                    spec.name,
                    spec.kind.name(),
                    value.type_name()
                )),
                _ => {}
            }
        }
        if !self.open {
            for (key, _) in args.iter() {
                if !self.params.iter().any(|p| &p.name == key) {
                    problems.push(format!("unknown argument '{}'", key));
                }
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }
}

/// How boolean arguments are spelled on a tool's command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolStyle {
    /// `--flag=1` / `--flag=0`
    Numeric,
    /// `--flag=True` / `--flag=False`
    Capitalized,
    /// `--flag` when true, omitted when false
    Switch,
}

/// Renders `args` as `--key=value` tokens in declaration order, skipping
/// `skip`. Lists are comma-joined.
pub fn render_flags(args: &Args, skip: &[&str], bools: BoolStyle) -> Vec<String> {
    args.iter()
        .filter(|(k, _)| !skip.contains(&k.as_str()))
        .filter_map(|(k, v)| match (v, bools) {
            (ArgValue::Bool(b), BoolStyle::Numeric) => {
                Some(format!("--{}={}", k, if *b { 1 } else { 0 }))
            }
            (ArgValue::Bool(b), BoolStyle::Capitalized) => {
                Some(format!("--{}={}", k, if *b { "True" } else { "False" }))
            }
            (ArgValue::Bool(true), BoolStyle::Switch) => Some(format!("--{}", k)),
            (ArgValue::Bool(false), BoolStyle::Switch) => None,
            (other, _) => Some(format!("--{}={}", k, other)),
        })
        .collect()
}

/// Milliseconds from an integer or float argument.
pub fn millis_arg(args: &Args, key: &str) -> Option<Duration> {
    args.get_f64(key).and_then(millis)
}

/// `ms` as a duration; `None` when negative, NaN or too large to represent.
pub fn millis(ms: f64) -> Option<Duration> {
    if ms < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(ms / 1000.0).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn timeout_scales_estimate_with_floor_and_fallback() {
        let policy = TimeoutPolicy::default();
        assert_eq!(
            policy.timeout_for(Some(Duration::from_secs(3))),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.timeout_for(Some(Duration::from_millis(100))),
            Duration::from_secs(10)
        );
        assert_eq!(policy.timeout_for(None), Duration::from_secs(60));
        assert_eq!(
            TimeoutPolicy::with_multiplier(100.0).timeout_for(Some(Duration::from_secs(1))),
            Duration::from_secs(100)
        );
    }

    #[test]
    fn unrepresentable_durations_do_not_panic() {
        assert_eq!(millis(1500.0), Some(Duration::from_millis(1500)));
        assert_eq!(millis(1e300), None);
        assert_eq!(millis(-1.0), None);
        assert_eq!(millis(f64::NAN), None);
        assert_eq!(millis_arg(&Args::new().with("duration", 1e300), "duration"), None);
        assert_eq!(
            TimeoutPolicy::default().timeout_for(Some(Duration::MAX)),
            Duration::MAX
        );
    }

    #[test]
    fn flags_follow_declaration_order_and_bool_style() {
        let args = Args::new()
            .with("lock", "mcs")
            .with("duration", 1000)
            .with("verbose", true)
            .with("quiet", false)
            .with("benchmarks", vec!["fillseq".to_string(), "readrandom".to_string()]);
        assert_eq!(
            render_flags(&args, &["lock"], BoolStyle::Numeric),
            [
                "--duration=1000",
                "--verbose=1",
                "--quiet=0",
                "--benchmarks=fillseq,readrandom"
            ]
        );
        assert_eq!(
            render_flags(&args, &["lock", "benchmarks"], BoolStyle::Switch),
            ["--duration=1000", "--verbose"]
        );
        assert_eq!(
            render_flags(&args, &["lock", "duration", "benchmarks"], BoolStyle::Capitalized),
            ["--verbose=True", "--quiet=False"]
        );
    }

    #[test]
    fn schema_reports_every_problem() {
        let schema = ParamSchema::closed()
            .required("lock", ParamKind::Str)
            .optional("duration", ParamKind::Float);
        assert!(schema
            .validate(&Args::new().with("lock", "mcs").with("duration", 10))
            .is_ok());
        let err = schema
            .validate(&Args::new().with("duration", "long").with("extra", 1))
            .expect_err("invalid");
        assert!(err.contains("missing required argument 'lock'"), "{}", err);
        assert!(err.contains("argument 'duration' must be float, got string"), "{}", err);
        assert!(err.contains("unknown argument 'extra'"), "{}", err);
        assert!(ParamSchema::open().validate(&Args::new().with("x", 1)).is_ok());
    }

    #[test]
    fn run_hash_tracks_args_and_artifact_bytes() {
        let dir = std::env::temp_dir().join(format!(
            "suite_runhash_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let exe = dir.join("tool");
        fs::write(&exe, b"v1").expect("write");

        let args = Args::new().with("lock", "mcs").with("duration", 1000);
        let hash = |args: &Args| {
            RunHash::builder("buckets")
                .artifact("executable", &exe)
                .expect("hash")
                .finish(args)
        };
        let first = hash(&args);
        assert_eq!(first, hash(&Args::new().with("duration", 1000).with("lock", "mcs")));
        assert_ne!(first, hash(&args.clone().with("duration", 1001)));

        fs::write(&exe, b"v2").expect("rewrite");
        assert_ne!(first, hash(&args));

        let err = RunHash::builder("buckets")
            .artifact("executable", &dir.join("missing"))
            .expect_err("missing artifact");
        assert!(err.to_string().contains("missing"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn scratch_dirs_are_unique_and_removed_on_drop() {
        let temp = std::env::temp_dir();
        let a = Scratch::allocate(&temp).expect("a");
        let b = Scratch::allocate(&temp).expect("b");
        assert_ne!(a.dir(), b.dir());
        let kept = a.dir().to_path_buf();
        fs::write(a.path("db"), b"x").expect("write");
        drop(a);
        assert!(!kept.exists());
    }
}
