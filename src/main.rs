//! Arbor CLI - run and validate workflow manifests
//!
//! Exit codes: 0 success, 1 task failed, 2 manifest invalid, 3 queue
//! overflow, 4 cancelled.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use arbor::config::ArborConfig;
use arbor::error::ArborError;
use arbor::event::TraceSink;
use arbor::manifest::Manifest;
use arbor::task::{TaskSpec, TaskStatus};
use arbor::{Engine, ScriptedLlm};

#[derive(Parser)]
#[command(name = "arbor")]
#[command(about = "Arbor - manifest-driven DAG orchestration engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a manifest against an input
    Run {
        /// Path to the manifest YAML file
        file: PathBuf,

        /// Input JSON (defaults to null)
        #[arg(short, long)]
        input: Option<String>,

        /// Mode tag baked into the task id
        #[arg(short, long, default_value = "run")]
        mode: String,

        /// Write the event stream to an NDJSON trace file
        #[arg(long)]
        trace: bool,

        /// Answer every agent node with this fixed text (no provider needed)
        #[arg(long)]
        mock_llm: Option<String>,
    },

    /// Validate a manifest file without running it
    Validate {
        /// Path to the manifest YAML file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let config = ArborConfig::load().unwrap_or_default().with_env();
    init_tracing(config.defaults.log.as_deref());

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            input,
            mode,
            trace,
            mock_llm,
        } => run(&config, &file, input.as_deref(), &mode, trace, mock_llm),
        Commands::Validate { file } => validate(&file),
    }
}

fn init_tracing(default_filter: Option<&str>) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.unwrap_or("arbor=info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_manifest(file: &PathBuf) -> Result<Manifest, ExitCode> {
    let content = fs::read_to_string(file).map_err(|e| {
        eprintln!("{} {}: {}", "error:".red().bold(), file.display(), e);
        ExitCode::from(2)
    })?;
    serde_yaml::from_str(&content).map_err(|e| {
        eprintln!("{} {}", "manifest parse error:".red().bold(), e);
        ExitCode::from(2)
    })
}

fn validate(file: &PathBuf) -> ExitCode {
    let manifest = match load_manifest(file) {
        Ok(m) => m,
        Err(code) => return code,
    };

    match Engine::load(manifest) {
        Ok(engine) => {
            println!(
                "{} {} ({} nodes, hash {})",
                "valid".green().bold(),
                file.display(),
                engine.dag().nodes().len(),
                engine.manifest_hash()
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            report_manifest_error(&error);
            ExitCode::from(2)
        }
    }
}

fn run(
    config: &ArborConfig,
    file: &PathBuf,
    input: Option<&str>,
    mode: &str,
    trace: bool,
    mock_llm: Option<String>,
) -> ExitCode {
    let manifest = match load_manifest(file) {
        Ok(m) => m,
        Err(code) => return code,
    };

    let input: serde_json::Value = match input {
        None => serde_json::Value::Null,
        Some(text) => match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("{} input is not valid JSON: {}", "error:".red().bold(), e);
                return ExitCode::from(2);
            }
        },
    };

    let engine = match Engine::load(manifest) {
        Ok(engine) => engine,
        Err(error) => {
            report_manifest_error(&error);
            return ExitCode::from(2);
        }
    };

    if let Some(response) = mock_llm {
        engine.bind_llm(Arc::new(ScriptedLlm::always(response)));
    }

    if trace {
        let dir = config
            .defaults
            .trace_dir
            .clone()
            .unwrap_or_else(|| ".arbor/traces".to_string());
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let path = PathBuf::from(dir).join(format!("{stamp}.ndjson"));
        match TraceSink::create(&path) {
            Ok(sink) => {
                if engine.subscribe(Arc::new(sink)).is_ok() {
                    eprintln!("{} {}", "trace:".dimmed(), path.display());
                }
            }
            Err(e) => eprintln!("{} cannot create trace file: {}", "warning:".yellow(), e),
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let spec = TaskSpec::new(input).with_mode(mode);
    match runtime.block_on(engine.run(spec)) {
        Ok(result) => {
            match result.status {
                TaskStatus::Succeeded => {
                    println!("{}", serde_json::to_string_pretty(&result.output).unwrap_or_default());
                    eprintln!("{} {}", "succeeded".green().bold(), result.task_id);
                    ExitCode::SUCCESS
                }
                TaskStatus::Cancelled => {
                    eprintln!("{} {}", "cancelled".yellow().bold(), result.task_id);
                    ExitCode::from(4)
                }
                _ => {
                    if let Some(error) = &result.error {
                        eprintln!("{} {}", "failed:".red().bold(), error);
                    }
                    eprintln!("{} {}", "failed".red().bold(), result.task_id);
                    ExitCode::from(1)
                }
            }
        }
        Err(ArborError::QueueFull { capacity }) => {
            eprintln!("{} queue at capacity {}", "error:".red().bold(), capacity);
            ExitCode::from(3)
        }
        Err(error) => {
            eprintln!("{} {}", "error:".red().bold(), error);
            ExitCode::from(1)
        }
    }
}

fn report_manifest_error(error: &ArborError) {
    match error {
        ArborError::ManifestInvalid { violations } => {
            eprintln!(
                "{} {} violation(s):",
                "manifest rejected:".red().bold(),
                violations.len()
            );
            for violation in violations {
                eprintln!("  {violation}");
            }
        }
        other => eprintln!("{} {}", "error:".red().bold(), other),
    }
}

