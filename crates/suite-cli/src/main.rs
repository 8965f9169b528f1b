use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::OnceLock;
use suite_core::Experiment;
use suite_runner::{
    load_experiment, CancelToken, ConfigError, Orchestrator, RecordSettings, Registry, SuiteConfig,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "suite", version, about = "Lock benchmark suite trial runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Settings {
    /// YAML settings file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Checkout holding build/ and ext/ (default: current directory)
    #[arg(long)]
    base_dir: Option<PathBuf>,
    /// Directory holding experiment files
    #[arg(long)]
    experiments_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run experiments and record their results
    Record {
        #[arg(short = 'e', long = "experiments", required = true, num_args = 1..)]
        experiments: Vec<String>,
        #[command(flatten)]
        settings: Settings,
        /// Results directory
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        #[arg(short = 'r', long = "replication")]
        replication: Option<u32>,
        #[arg(long)]
        no_cache: bool,
        /// Only use cached results; never execute anything
        #[arg(long)]
        cache_only: bool,
        /// Scratch directory for trial files
        #[arg(long = "tmp")]
        temp_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show the tests of experiments and their runtime estimate
    Describe {
        #[arg(short = 'e', long = "experiments", required = true, num_args = 1..)]
        experiments: Vec<String>,
        #[command(flatten)]
        settings: Settings,
        #[arg(short = 'r', long = "replication")]
        replication: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// List registered benchmark identifiers
    List {
        #[arg(long)]
        json: bool,
    },
}

static CANCEL: OnceLock<CancelToken> = OnceLock::new();

extern "C" fn on_sigint(_signal: libc::c_int) {
    if let Some(token) = CANCEL.get() {
        token.cancel();
    }
    // A second Ctrl-C terminates immediately.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

fn install_sigint(token: CancelToken) {
    if CANCEL.set(token).is_ok() {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = if err.downcast_ref::<ConfigError>().is_some() {
                    "configuration_error"
                } else {
                    "command_failed"
                };
                emit_json(&json_error(code, format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Record {
            experiments,
            settings,
            output,
            replication,
            no_cache,
            cache_only,
            temp_dir,
            json,
        } => {
            let mut config = load_config(&settings)?;
            if let Some(output) = output {
                config.results_dir = Some(output);
            }
            if let Some(replication) = replication {
                config.replication = replication;
            }
            if no_cache {
                config.cache = false;
            }
            if cache_only {
                config.cache_only = true;
            }
            if let Some(temp_dir) = temp_dir {
                config.temp_dir = temp_dir;
            }
            config.validate()?;

            let experiments = load_experiments(&config, &experiments)?;
            let orchestrator = Orchestrator::new(
                Registry::with_builtin(config.plugin_env()),
                RecordSettings::from_config(&config),
            );
            install_sigint(orchestrator.cancel_token());
            let reports = orchestrator.record(&experiments)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "record",
                    "results_dir": config.results_dir(),
                    "replication": config.replication,
                    "experiments": reports,
                })));
            }
            for report in &reports {
                println!(
                    "{}: {} rows (ran {}, retrieved {}, failed {}, skipped {}){}",
                    report.name,
                    report.rows,
                    report.tally.ran,
                    report.tally.retrieved,
                    report.tally.failed,
                    report.tally.skipped,
                    if report.cancelled { " [cancelled]" } else { "" }
                );
                match &report.output {
                    Some(path) => println!("  output: {}", path.display()),
                    None => println!("  No output"),
                }
                for name in &report.dropped {
                    println!("  dropped: {}", name);
                }
            }
        }
        Commands::Describe {
            experiments,
            settings,
            replication,
            json,
        } => {
            let mut config = load_config(&settings)?;
            if let Some(replication) = replication {
                config.replication = replication;
            }
            config.validate()?;
            let experiments = load_experiments(&config, &experiments)?;
            let orchestrator = Orchestrator::new(
                Registry::with_builtin(config.plugin_env()),
                RecordSettings::from_config(&config),
            );
            orchestrator.validate(&experiments)?;
            let mut described = Vec::new();
            for experiment in &experiments {
                let estimate = orchestrator.estimate(std::slice::from_ref(experiment))?;
                described.push(describe_to_json(
                    experiment,
                    estimate.trials,
                    estimate.runtime.as_secs_f64(),
                ));
            }
            let total = orchestrator.estimate(&experiments)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "replication": config.replication,
                    "total_trials": total.trials,
                    "estimated_runtime_s": total.runtime.as_secs_f64(),
                    "experiments": described,
                })));
            }
            for experiment in &experiments {
                print_experiment(experiment);
            }
            println!("replication: {}", config.replication);
            println!("total_trials: {}", total.trials);
            println!("estimated_runtime_s: {:.1}", total.runtime.as_secs_f64());
        }
        Commands::List { json } => {
            let registry = Registry::with_builtin(SuiteConfig::default().plugin_env());
            let ids: Vec<&str> = registry.ids().collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "benchmarks": ids,
                })));
            }
            for id in ids {
                println!("{}", id);
            }
        }
    }
    Ok(None)
}

fn load_config(settings: &Settings) -> Result<SuiteConfig> {
    let mut config = match &settings.config {
        Some(path) => SuiteConfig::load(path)?,
        None => SuiteConfig {
            base_dir: std::env::current_dir()?,
            ..SuiteConfig::default()
        },
    };
    if let Some(base_dir) = &settings.base_dir {
        config.base_dir = base_dir.clone();
    }
    if let Some(dir) = &settings.experiments_dir {
        config.experiments_dir = Some(dir.clone());
    }
    debug!(
        base_dir = %config.base_dir.display(),
        experiments_dir = %config.experiments_dir().display(),
        "settings resolved"
    );
    Ok(config)
}

fn load_experiments(config: &SuiteConfig, names: &[String]) -> Result<Vec<Experiment>> {
    let dir = config.experiments_dir();
    names
        .iter()
        .map(|name| load_experiment(&dir, name))
        .collect()
}

fn describe_to_json(experiment: &Experiment, trials: usize, runtime_s: f64) -> Value {
    json!({
        "name": experiment.name,
        "trials": trials,
        "estimated_runtime_s": runtime_s,
        "tests": experiment.tests.iter().map(|t| json!({
            "name": t.name,
            "label": t.label,
            "benchmark": t.benchmark,
            "concurrent": t.concurrent,
        })).collect::<Vec<_>>(),
    })
}

fn print_experiment(experiment: &Experiment) {
    println!("experiment: {}", experiment.name);
    for test in &experiment.tests {
        match &test.concurrent {
            Some(concurrent) => println!(
                "  - {} [{}] with {} in background",
                test.name, test.benchmark.id, concurrent.id
            ),
            None => println!("  - {} [{}]", test.name, test.benchmark.id),
        }
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Record { json, .. }
        | Commands::Describe { json, .. }
        | Commands::List { json } => *json,
    }
}
