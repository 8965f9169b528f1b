//! PARSEC kernels instrumented to print raw TSC cycle counts for their setup
//! and measured phases.

use regex::Regex;
use std::time::Duration;
use suite_core::{Args, Row};

use super::pattern;
use crate::benchmark::{millis, PluginEnv};
use crate::error::ConfigError;

/// Reads `Setup time:` and `Benchmark time:` cycle counts and reports them as
/// `setup_time` / `run_time` in milliseconds.
pub(crate) struct CycleTimes {
    tsc_khz: u64,
    setup: Regex,
    run: Regex,
}

impl CycleTimes {
    /// Fails when `tsc_khz` is not configured; without it cycles are
    /// meaningless.
    pub(crate) fn new(benchmark: &str, env: &PluginEnv) -> Result<Self, ConfigError> {
        let tsc_khz = env
            .tsc_khz
            .filter(|khz| *khz > 0)
            .ok_or_else(|| ConfigError::Plugin {
                benchmark: benchmark.to_string(),
                message: "tsc_khz is not configured".to_string(),
            })?;
        Ok(Self {
            tsc_khz,
            setup: pattern(benchmark, r"^Setup time:\s+(\d+)")?,
            run: pattern(benchmark, r"^Benchmark time:\s+(\d+)")?,
        })
    }

    fn to_ms(&self, cycles: &str) -> Option<f64> {
        cycles
            .parse::<u64>()
            .ok()
            .map(|c| c as f64 / self.tsc_khz as f64)
    }

    pub(crate) fn parse(&self, stdout: &str) -> Row {
        let mut row = Row::new();
        for line in stdout.lines() {
            if let Some(c) = self.setup.captures(line) {
                if let Some(ms) = self.to_ms(&c[1]) {
                    row.insert("setup_time", ms);
                }
                continue;
            }
            if let Some(c) = self.run.captures(line) {
                if let Some(ms) = self.to_ms(&c[1]) {
                    row.insert("run_time", ms);
                }
            }
        }
        row
    }
}

/// 32 s single-threaded, scaling down with up to eight threads; 15 s
/// otherwise.
pub(crate) fn thread_scaled_estimate(args: &Args) -> Option<Duration> {
    let ms = match args.get_i64("threads") {
        Some(1) => 32000.0,
        Some(t) if (2..=8).contains(&t) => 2.0 * 32000.0 / t as f64,
        _ => 15000.0,
    };
    millis(ms)
}
