use std::path::PathBuf;
use thiserror::Error;

use crate::supervisor::ProcessError;

/// Mistakes in how the suite was set up. These are never trial-level
/// conditions: the CLI reports them and exits.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown benchmark: {0}")]
    UnknownBenchmark(String),

    #[error("unknown experiment {name} (looked in {dir})")]
    UnknownExperiment { name: String, dir: PathBuf },

    #[error("{benchmark} binary not found: {path}")]
    MissingBinary { benchmark: String, path: PathBuf },

    #[error("{benchmark} binary permission denied: {path}")]
    NotExecutable { benchmark: String, path: PathBuf },

    #[error("test '{test}': {message}")]
    InvalidArgs { test: String, message: String },

    #[error("{benchmark}: {message}")]
    Plugin { benchmark: String, message: String },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// An artifact that participates in a run hash could not be read.
#[derive(Debug, Error)]
#[error("failed to hash {label} at {artifact}: {source}")]
pub struct HashingError {
    pub label: String,
    pub artifact: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Why a trial produced no row. The orchestrator treats every variant the
/// same way (the replication is skipped); the distinction is for logs.
#[derive(Debug, Error)]
pub enum TrialFailure {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("exited with status {status}: {stderr_tail}")]
    Exit { status: String, stderr_tail: String },

    #[error("no fields matched in the output")]
    NoFields,

    #[error("setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Hashing(#[from] HashingError),
}

impl TrialFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            TrialFailure::Process(ProcessError::Timeout(_)) => "timeout",
            TrialFailure::Process(ProcessError::Cancelled) => "cancelled",
            TrialFailure::Process(_) => "spawn",
            TrialFailure::Exit { .. } => "exit",
            TrialFailure::NoFields => "parse",
            TrialFailure::Setup(_) => "setup",
            TrialFailure::Hashing(_) => "hashing",
        }
    }
}
