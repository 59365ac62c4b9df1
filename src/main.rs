//! splitrun CLI - parallel test-suite orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use splitrun::config::{self, Config, FeedbackMode, LoaderConfig, ProcessCount, RunnerKind};
use splitrun::loader;
use splitrun::report::{ConsoleReporter, MultiReporter, ProgressBarReporter};
use splitrun::runner::exit_codes::SplitrunExitCode;
use splitrun::runner::{OneshotRunner, RunOptions, Runner, WrapperRunner};
use splitrun::unit::{CommandTemplate, WorkUnit};
use splitrun::worker::child;

#[derive(Parser)]
#[command(name = "splitrun")]
#[command(about = "Parallel test-suite orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "splitrun.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the suite
    Run(RunArgs),

    /// Serve the worker protocol on stdin/stdout
    Worker,

    /// List the units that would run
    Collect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Test file suffix for the directory loader
        #[arg(short, long, default_value = "Test.php")]
        suffix: String,
    },
}

/// Overrides for the `[splitrun]` and `[report]` settings.
#[derive(Args)]
struct RunArgs {
    /// Number of processes: a number, "auto" or "half"
    #[arg(short, long)]
    processes: Option<ProcessCount>,

    /// Units per worker before it is replaced (0 = never)
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Stop dispatching after the first unsuccessful unit
    #[arg(long)]
    stop_on_failure: bool,

    /// Combined JUnit log output path
    #[arg(long)]
    log_junit: Option<PathBuf>,

    /// Runner flavour
    #[arg(long, value_enum)]
    runner: Option<RunnerKind>,
}

impl RunArgs {
    fn apply(self, config: &mut Config) {
        if let Some(processes) = self.processes {
            config.splitrun.processes = processes;
        }
        if let Some(size) = self.max_batch_size {
            config.splitrun.max_batch_size = size;
        }
        if self.stop_on_failure {
            config.splitrun.stop_on_failure = true;
        }
        if self.log_junit.is_some() {
            config.report.log_junit = self.log_junit;
        }
        if let Some(runner) = self.runner {
            config.splitrun.runner = runner;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries progress and, for workers, the protocol.
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => run_tests(&cli.config, args).await,
        Commands::Worker => child::serve().await.context("Worker failed"),
        Commands::Collect { format } => collect_units(&cli.config, &format),
        Commands::Validate => validate_config(&cli.config),
        Commands::Init { suffix } => init_config(&suffix),
    }
}

async fn run_tests(config_path: &Path, args: RunArgs) -> Result<()> {
    let (config, units, options) = match prepare(config_path, args) {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(SplitrunExitCode::SETUP_ERROR);
        }
    };

    let template = CommandTemplate::from_config(&config.engine)
        .with_coverage(config.report.coverage_dir.is_some())
        .with_temp_dir(config.splitrun.temp_dir.clone());
    let reporter = create_reporter(&config);

    let outcome = match config.splitrun.runner {
        RunnerKind::Wrapper => {
            let mut runner = WrapperRunner::new(options, template, units, reporter);
            runner.run().await
        }
        RunnerKind::Oneshot => {
            let mut runner = OneshotRunner::new(options, template, units, reporter);
            runner.run().await
        }
    };

    match outcome {
        Ok(result) => std::process::exit(result.exit_code()),
        Err(e) => {
            eprintln!();
            eprintln!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// Everything that happens before a process is started. Any failure here
/// is a setup error.
fn prepare(config_path: &Path, args: RunArgs) -> Result<(Config, Vec<WorkUnit>, RunOptions)> {
    let mut config = config::load_config(config_path)?;
    args.apply(&mut config);
    info!("Loaded configuration from {}", config_path.display());

    let units = load_units(&config)?;
    let options = RunOptions::from_config(&config).context("Failed to resolve worker command")?;
    Ok((config, units, options))
}

fn load_units(config: &Config) -> Result<Vec<WorkUnit>> {
    let loader = loader::from_config(&config.loader);
    info!("Using loader: {}", loader.name());

    let mut units = loader.load().context("Failed to load units")?;
    loader::apply_order(&mut units, config.splitrun.order, config.splitrun.random_seed);
    Ok(units)
}

fn collect_units(config_path: &Path, format: &str) -> Result<()> {
    let config = config::load_config(config_path)?;
    let units = load_units(&config)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&units)?;
            println!("{}", json);
        }
        _ => {
            println!("Loaded {} units:", units.len());
            for unit in &units {
                println!("  {}", unit);
            }
        }
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!(
                "  Processes: {} ({})",
                config.splitrun.processes,
                config.splitrun.processes.resolve()
            );
            println!("  Runner: {:?}", config.splitrun.runner);
            println!("  Max batch size: {}", config.splitrun.max_batch_size);
            println!("  Stop on failure: {}", config.splitrun.stop_on_failure);

            let loader_name = match &config.loader {
                LoaderConfig::Directory(_) => "directory",
                LoaderConfig::List(_) => "list",
            };
            println!("  Loader: {}", loader_name);
            println!("  Engine: {}", shell_words::join(&config.engine.command));

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(SplitrunExitCode::SETUP_ERROR);
        }
    }
}

fn init_config(suffix: &str) -> Result<()> {
    let config = format!(
        r#"# splitrun configuration file

[splitrun]
processes = "auto"
max_batch_size = 0
stop_on_failure = false

[engine]
command = ["vendor/bin/phpunit", "--log-junit", "{{report}}", "{{filter}}", "{{path}}"]
filter_args = ["--filter", "{{pattern}}"]

[loader]
type = "directory"
paths = ["tests"]
suffix = "{}"

[report]
log_junit = "build/junit.xml"
"#,
        suffix
    );

    let path = PathBuf::from("splitrun.toml");
    if path.exists() {
        eprintln!("splitrun.toml already exists. Remove it first or edit manually.");
        std::process::exit(SplitrunExitCode::SETUP_ERROR);
    }

    std::fs::write(&path, config)?;
    println!("Created splitrun.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  splitrun run");

    Ok(())
}

fn create_reporter(config: &Config) -> MultiReporter {
    let multi = MultiReporter::new();
    match config.report.feedback {
        FeedbackMode::Dots => multi.with_reporter(ConsoleReporter::new(config.report.columns)),
        FeedbackMode::Bar => multi.with_reporter(ProgressBarReporter::new()),
    }
}
