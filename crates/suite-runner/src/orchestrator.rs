//! Drives experiments: replications outer, tests inner, one trial at a time.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use suite_core::{
    atomic_write_json_pretty, ensure_dir, Args, BenchmarkRef, Experiment, Row, Scalar,
    TestDescriptor,
};
use tracing::{info, warn};

use crate::aggregate::{aggregate, TestMeta};
use crate::benchmark::Benchmark;
use crate::cache::{CacheKey, CacheMode, ResultCache};
use crate::config::SuiteConfig;
use crate::error::{ConfigError, TrialFailure};
use crate::registry::Registry;
use crate::supervisor::{CancelToken, Supervisor};

#[derive(Debug, Clone, PartialEq)]
pub struct RecordSettings {
    pub results_dir: PathBuf,
    pub replication: u32,
    pub cache_mode: CacheMode,
}

impl RecordSettings {
    pub fn from_config(config: &SuiteConfig) -> Self {
        Self {
            results_dir: config.results_dir(),
            replication: config.replication,
            cache_mode: config.cache_mode(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Row came from the cache.
    Retrieved,
    /// Executed and produced a row.
    Ran,
    /// No row: hashing, setup, execution or parsing went wrong.
    Failed,
    /// Cache-only miss; nothing executed.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialRecord {
    pub test: String,
    pub replication: u32,
    pub status: TrialStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub retrieved: usize,
    pub ran: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Tally {
    fn count(&mut self, status: TrialStatus) {
        match status {
            TrialStatus::Retrieved => self.retrieved += 1,
            TrialStatus::Ran => self.ran += 1,
            TrialStatus::Failed => self.failed += 1,
            TrialStatus::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub name: String,
    /// The exported table, absent when no test produced a row.
    pub output: Option<PathBuf>,
    pub rows: usize,
    pub tally: Tally,
    /// Tests with zero successful replications.
    pub dropped: Vec<String>,
    pub cancelled: bool,
    pub trials: Vec<TrialRecord>,
}

/// Trial count and summed runtime estimate over all replications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Estimate {
    pub trials: usize,
    pub runtime: Duration,
}

struct Progress {
    done: usize,
    total: usize,
}

/// A resolved plugin with the arguments of one side of a test.
struct Side<'a> {
    plugin: Arc<dyn Benchmark>,
    reference: &'a BenchmarkRef,
}

pub struct Orchestrator {
    registry: Registry,
    supervisor: Supervisor,
    settings: RecordSettings,
}

impl Orchestrator {
    pub fn new(registry: Registry, settings: RecordSettings) -> Self {
        Self {
            registry,
            supervisor: Supervisor::default(),
            settings,
        }
    }

    /// Token that stops the run at the next trial boundary and tears down
    /// whatever is running.
    pub fn cancel_token(&self) -> CancelToken {
        self.supervisor.cancel_token().clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn settings(&self) -> &RecordSettings {
        &self.settings
    }

    /// Resolves every plugin and checks every argument list before any trial
    /// runs.
    pub fn validate(&self, experiments: &[Experiment]) -> Result<(), ConfigError> {
        for experiment in experiments {
            for test in &experiment.tests {
                self.registry.validate(test)?;
            }
        }
        Ok(())
    }

    pub fn estimate(&self, experiments: &[Experiment]) -> Result<Estimate, ConfigError> {
        let mut estimate = Estimate::default();
        let replication = self.settings.replication;
        for experiment in experiments {
            for test in &experiment.tests {
                let plugin = self.registry.get_benchmark(&test.benchmark.id)?;
                let once = plugin
                    .estimate_runtime(&test.benchmark.args)
                    .unwrap_or_default();
                let total = once.checked_mul(replication).unwrap_or(Duration::MAX);
                estimate.runtime = estimate.runtime.saturating_add(total);
                estimate.trials += replication as usize;
            }
        }
        Ok(estimate)
    }

    pub fn record(&self, experiments: &[Experiment]) -> Result<Vec<ExperimentReport>> {
        self.validate(experiments)?;
        let estimate = self.estimate(experiments)?;
        info!(
            trials = estimate.trials,
            "Estimated run time: {}s",
            estimate.runtime.as_secs_f64()
        );
        let mut progress = Progress {
            done: 0,
            total: estimate.trials,
        };
        let mut reports = Vec::new();
        for experiment in experiments {
            let report = self.record_experiment(experiment, &mut progress)?;
            let stop = report.cancelled;
            reports.push(report);
            if stop {
                break;
            }
        }
        Ok(reports)
    }

    fn record_experiment(
        &self,
        experiment: &Experiment,
        progress: &mut Progress,
    ) -> Result<ExperimentReport> {
        info!(experiment = %experiment.name, "Running experiment {}", experiment.name);
        let exp_dir = self.settings.results_dir.join(&experiment.name);
        let cache = ResultCache::new(exp_dir.join("cache"), self.settings.cache_mode);
        let cancel = self.supervisor.cancel_token();

        let mut results: Vec<Vec<Row>> = vec![Vec::new(); experiment.tests.len()];
        let mut trials = Vec::new();
        let mut tally = Tally::default();
        let mut cancelled = false;

        'replications: for replication in 0..self.settings.replication {
            for (index, test) in experiment.tests.iter().enumerate() {
                if cancel.is_cancelled() {
                    warn!(experiment = %experiment.name, "cancelled; no further trials");
                    cancelled = true;
                    break 'replications;
                }
                progress.done += 1;
                let (status, row, failure) = self.trial(test, replication, &cache, progress)?;
                if let Some(row) = row {
                    results[index].push(row);
                }
                tally.count(status);
                trials.push(TrialRecord {
                    test: test.name.clone(),
                    replication,
                    status,
                    failure,
                });
            }
        }

        let mut dropped = Vec::new();
        let mut per_test = Vec::new();
        for (test, rows) in experiment.tests.iter().zip(results) {
            if rows.is_empty() {
                info!(test = %test.name, "Test {} produced no results; dropped", test.name);
                dropped.push(test.name.clone());
                continue;
            }
            let meta = TestMeta {
                test_name: test.name.clone(),
                label: test.label.clone().unwrap_or_else(|| test.name.clone()),
            };
            per_test.push((meta, rows));
        }

        let table = aggregate(per_test);
        let mut output = None;
        if table.is_empty() {
            info!(experiment = %experiment.name, "No output");
        } else {
            ensure_dir(&exp_dir)?;
            let path = exp_dir.join(format!("{}.csv", experiment.name));
            table.write_csv(&path)?;
            let manifest = json!({
                "schema_version": "suite_manifest_v1",
                "experiment": experiment.name,
                "created_at": Utc::now().to_rfc3339(),
                "replication": self.settings.replication,
                "cache_mode": format!("{:?}", self.settings.cache_mode),
                "cancelled": cancelled,
                "tally": tally,
                "dropped": dropped,
                "columns": table.columns,
                "rows": table.rows.len(),
            });
            atomic_write_json_pretty(&exp_dir.join("manifest.json"), &manifest)?;
            info!(
                experiment = %experiment.name,
                "Recorded {} experiment results to {}",
                experiment.name,
                path.display()
            );
            output = Some(path);
        }

        Ok(ExperimentReport {
            name: experiment.name.clone(),
            output,
            rows: table.rows.len(),
            tally,
            dropped,
            cancelled,
            trials,
        })
    }

    /// One replication of one test. Trial-level problems come back as a
    /// status; only configuration and storage errors abort the run.
    fn trial(
        &self,
        test: &TestDescriptor,
        replication: u32,
        cache: &ResultCache,
        progress: &Progress,
    ) -> Result<(TrialStatus, Option<Row>, Option<String>)> {
        let tag = format!("[{}/{}]", progress.done, progress.total);
        let primary = Side {
            plugin: self.registry.get_benchmark(&test.benchmark.id)?,
            reference: &test.benchmark,
        };
        let companion = match &test.concurrent {
            Some(reference) => Some(Side {
                plugin: self.registry.get_benchmark(&reference.id)?,
                reference,
            }),
            None => None,
        };

        let key = match trial_key(&primary, companion.as_ref(), replication) {
            Ok(key) => key,
            // Nothing unhashable can be in the cache, and nothing runs.
            Err(failure) if cache.mode() == CacheMode::ReadOnly => {
                info!(
                    reason = %failure,
                    "{} Skipped uncached test: {} #{}",
                    tag,
                    test.name,
                    replication
                );
                return Ok((TrialStatus::Skipped, None, None));
            }
            Err(failure) => {
                warn!(
                    test = %test.name,
                    replication,
                    kind = failure.kind(),
                    "{} Test {} failed: {}",
                    tag,
                    test.name,
                    failure
                );
                return Ok((TrialStatus::Failed, None, Some(failure.to_string())));
            }
        };

        if let Some(raw) = cache.lookup(&key)? {
            info!("{} Retrieved cached test: {} #{}", tag, test.name, replication);
            let row = annotate(raw, test, replication);
            return Ok((TrialStatus::Retrieved, Some(row), None));
        }
        if cache.mode() == CacheMode::ReadOnly {
            info!("{} Skipped uncached test: {} #{}", tag, test.name, replication);
            return Ok((TrialStatus::Skipped, None, None));
        }

        info!("{} Running test: {} #{}", tag, test.name, replication);
        match self.execute(&primary, companion.as_ref()) {
            Ok(raw) => {
                cache.store(&key, &raw)?;
                Ok((TrialStatus::Ran, Some(annotate(raw, test, replication)), None))
            }
            Err(failure) => {
                warn!(
                    test = %test.name,
                    replication,
                    kind = failure.kind(),
                    "{} Test {} failed: {}",
                    tag,
                    test.name,
                    failure
                );
                Ok((TrialStatus::Failed, None, Some(failure.to_string())))
            }
        }
    }

    /// Starts the companion, runs the primary, then kills the companion's
    /// whole tree. The companion handle also kills on drop, so an early
    /// return cannot leak it.
    fn execute(&self, primary: &Side<'_>, companion: Option<&Side<'_>>) -> Result<Row, TrialFailure> {
        let sup = &self.supervisor;
        let scratch = primary.plugin.init(&primary.reference.args, sup)?;
        let background = match companion {
            Some(side) => {
                let args = &side.reference.args;
                let companion_scratch = side.plugin.init(args, sup)?;
                let command = side.plugin.command(args, &companion_scratch)?;
                info!(command = %command.display(), "starting concurrent {}", side.plugin.id());
                Some((sup.spawn_background(&command)?, companion_scratch))
            }
            None => None,
        };
        let result = primary
            .plugin
            .run(&primary.reference.args, &scratch, sup);
        if let Some((process, companion_scratch)) = background {
            process.kill_tree();
            drop(companion_scratch);
        }
        result
    }
}

fn trial_key(
    primary: &Side<'_>,
    companion: Option<&Side<'_>>,
    replication: u32,
) -> Result<CacheKey, TrialFailure> {
    let primary_hash = primary.plugin.run_hash(&primary.reference.args)?;
    let companion_hash = match companion {
        Some(side) => Some(side.plugin.run_hash(&side.reference.args)?),
        None => None,
    };
    Ok(CacheKey::compute(
        &primary_hash,
        companion_hash.as_ref(),
        replication,
    ))
}

/// Adds trial-identifying columns. They win over plugin columns of the same
/// name.
fn annotate(mut row: Row, test: &TestDescriptor, replication: u32) -> Row {
    row.insert("replication_id", i64::from(replication));
    row.insert("benchmark", test.benchmark.id.as_str());
    flatten_args(&mut row, "", &test.benchmark.args);
    if let Some(concurrent) = &test.concurrent {
        row.insert("concurrent_benchmark", concurrent.id.as_str());
        flatten_args(&mut row, "concurrent_", &concurrent.args);
    }
    row
}

fn flatten_args(row: &mut Row, prefix: &str, args: &Args) {
    for (key, value) in args.iter() {
        row.insert(format!("{}{}", prefix, key), Scalar::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::PluginEnv;

    fn descriptor(concurrent: bool) -> TestDescriptor {
        TestDescriptor {
            name: "mcs".to_string(),
            label: None,
            benchmark: BenchmarkRef {
                id: "buckets".to_string(),
                args: Args::new().with("lock", "mcs").with("throughput", 9),
            },
            concurrent: concurrent.then(|| BenchmarkRef {
                id: "scheduling".to_string(),
                args: Args::new()
                    .with("lock", "tas")
                    .with("phases", vec!["up".to_string(), "down".to_string()]),
            }),
        }
    }

    #[test]
    fn annotation_flattens_both_sides() {
        let mut raw = Row::new();
        raw.insert("throughput", 1.5);
        let row = annotate(raw, &descriptor(true), 2);
        assert_eq!(row.get("replication_id"), Some(&Scalar::Int(2)));
        assert_eq!(row.get("benchmark"), Some(&Scalar::from("buckets")));
        assert_eq!(row.get("lock"), Some(&Scalar::from("mcs")));
        // Argument columns replace a measured column of the same name.
        assert_eq!(row.get("throughput"), Some(&Scalar::Int(9)));
        assert_eq!(row.get("concurrent_benchmark"), Some(&Scalar::from("scheduling")));
        assert_eq!(row.get("concurrent_lock"), Some(&Scalar::from("tas")));
        assert_eq!(row.get("concurrent_phases"), Some(&Scalar::from("up,down")));

        let solo = annotate(Row::new(), &descriptor(false), 0);
        assert!(!solo.contains("concurrent_benchmark"));
    }

    #[test]
    fn estimate_multiplies_by_replication() {
        let registry = Registry::with_builtin(PluginEnv::new("/nonexistent", "/tmp"));
        let orchestrator = Orchestrator::new(
            registry,
            RecordSettings {
                results_dir: std::env::temp_dir(),
                replication: 3,
                cache_mode: CacheMode::Disabled,
            },
        );
        let mut test = descriptor(false);
        test.benchmark.args = Args::new().with("lock", "mcs").with("duration", 2000);
        let experiment = Experiment {
            name: "e".to_string(),
            tests: vec![test.clone(), test],
        };
        let estimate = orchestrator
            .estimate(std::slice::from_ref(&experiment))
            .expect("estimate");
        assert_eq!(estimate.trials, 6);
        assert_eq!(estimate.runtime, Duration::from_secs(12));
    }

    #[test]
    fn estimate_saturates_on_huge_durations() {
        let registry = Registry::with_builtin(PluginEnv::new("/nonexistent", "/tmp"));
        let orchestrator = Orchestrator::new(
            registry,
            RecordSettings {
                results_dir: std::env::temp_dir(),
                replication: 3,
                cache_mode: CacheMode::Disabled,
            },
        );
        let mut huge = descriptor(false);
        huge.benchmark.args = Args::new().with("lock", "mcs").with("duration", 1.5e22);
        let mut absurd = descriptor(false);
        absurd.benchmark.args = Args::new().with("lock", "mcs").with("duration", 1e300);
        let experiment = Experiment {
            name: "e".to_string(),
            tests: vec![huge.clone(), huge, absurd],
        };
        let estimate = orchestrator
            .estimate(std::slice::from_ref(&experiment))
            .expect("estimate");
        assert_eq!(estimate.trials, 9);
        assert_eq!(estimate.runtime, Duration::MAX);
    }

    #[test]
    fn tally_counts_each_status() {
        let mut tally = Tally::default();
        for status in [
            TrialStatus::Ran,
            TrialStatus::Ran,
            TrialStatus::Failed,
            TrialStatus::Retrieved,
            TrialStatus::Skipped,
        ] {
            tally.count(status);
        }
        assert_eq!(
            tally,
            Tally {
                retrieved: 1,
                ran: 2,
                failed: 1,
                skipped: 1
            }
        );
        assert_eq!(
            serde_json::to_value(TrialStatus::Retrieved).expect("json"),
            json!("retrieved")
        );
    }
}
