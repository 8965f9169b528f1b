//! Suite settings and experiment files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use suite_core::Experiment;

use crate::benchmark::PluginEnv;
use crate::cache::CacheMode;
use crate::error::ConfigError;

fn default_base_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_replication() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    /// Checkout holding `build/` and `ext/`.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Defaults to `{base_dir}/results`.
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    /// Defaults to `{base_dir}/experiments`.
    #[serde(default)]
    pub experiments_dir: Option<PathBuf>,
    #[serde(default = "default_replication")]
    pub replication: u32,
    #[serde(default = "default_true")]
    pub cache: bool,
    #[serde(default)]
    pub cache_only: bool,
    #[serde(default)]
    pub tsc_khz: Option<u64>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            temp_dir: default_temp_dir(),
            results_dir: None,
            experiments_dir: None,
            replication: default_replication(),
            cache: true,
            cache_only: false,
            tsc_khz: None,
        }
    }
}

impl SuiteConfig {
    /// Reads a YAML settings file. Relative paths in it are taken relative
    /// to the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: SuiteConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        let root = path.parent().unwrap_or(Path::new("."));
        config.base_dir = anchor(root, &config.base_dir);
        config.temp_dir = anchor(root, &config.temp_dir);
        config.results_dir = config.results_dir.map(|p| anchor(root, &p));
        config.experiments_dir = config.experiments_dir.map(|p| anchor(root, &p));
        Ok(config)
    }

    pub fn results_dir(&self) -> PathBuf {
        self.results_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("results"))
    }

    pub fn experiments_dir(&self) -> PathBuf {
        self.experiments_dir
            .clone()
            .unwrap_or_else(|| self.base_dir.join("experiments"))
    }

    pub fn cache_mode(&self) -> CacheMode {
        CacheMode::from_flags(self.cache, self.cache_only)
    }

    pub fn plugin_env(&self) -> PluginEnv {
        let mut env = PluginEnv::new(&self.base_dir, &self.temp_dir);
        env.tsc_khz = self.tsc_khz;
        env
    }

    /// Reports every inconsistent setting at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.replication == 0 {
            problems.push("replication must be at least 1".to_string());
        }
        if self.cache_only && !self.cache {
            problems.push("cache_only requires the cache to be enabled".to_string());
        }
        if self.temp_dir.as_os_str().is_empty() {
            problems.push("temp_dir must not be empty".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }
}

fn anchor(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Finds `{dir}/{name}.yaml`, `.yml` or `.json`.
pub fn experiment_path(dir: &Path, name: &str) -> Result<PathBuf, ConfigError> {
    ["yaml", "yml", "json"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", name, ext)))
        .find(|p| p.is_file())
        .ok_or_else(|| ConfigError::UnknownExperiment {
            name: name.to_string(),
            dir: dir.to_path_buf(),
        })
}

/// Parses an experiment file. An experiment without a `name` takes the file
/// stem.
pub fn load_experiment_file(path: &Path) -> Result<Experiment> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read experiment {}", path.display()))?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let mut experiment: Experiment = if is_json {
        serde_json::from_str(&raw)
            .with_context(|| format!("parse experiment {}", path.display()))?
    } else {
        serde_yaml::from_str(&raw)
            .with_context(|| format!("parse experiment {}", path.display()))?
    };
    if experiment.name.is_empty() {
        experiment.name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    let unnamed: Vec<String> = experiment
        .tests
        .iter()
        .enumerate()
        .filter(|(_, t)| t.name.trim().is_empty())
        .map(|(i, _)| format!("#{}", i))
        .collect();
    if !unnamed.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "experiment {}: tests without a name: {}",
            experiment.name,
            unnamed.join(", ")
        ))
        .into());
    }
    Ok(experiment)
}

pub fn load_experiment(dir: &Path, name: &str) -> Result<Experiment> {
    let path = experiment_path(dir, name)?;
    load_experiment_file(&path)
}
