//! Chaperone CLI binary
//!
//! Command-line interface for running and supervising child processes.

use chaperone_core::config::load_from_toml_path;
use chaperone_core::{EnvironmentMode, ProcessOptions};
use clap::{Parser, Subcommand};
use cli::{CliError, OutputFormat, RunRequest};
use std::io::Write;
use std::path::PathBuf;
use tracing::error;

#[derive(Parser)]
#[command(name = "chaperone")]
#[command(about = "Run and supervise child processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Default log filter (RUST_LOG takes precedence)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one program to completion and mirror its output and exit code
    Run {
        /// Treat COMMAND as a shell command line
        #[arg(long)]
        shell: bool,
        /// Text written to the program's standard input
        #[arg(long, default_value = "")]
        input: String,
        /// Working directory for the program
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,
        /// Environment override, repeatable
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,
        /// Start from an empty environment
        #[arg(long)]
        clear_env: bool,
        /// Program to run
        command: String,
        /// Arguments for the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Launch every program in a supervision file and wait for them
    Supervise {
        /// Path to the TOML supervision file
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
        /// Print one JSON event per line instead of prefixed text
        #[arg(long)]
        json: bool,
    },
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = chaperone_core::utils::init_tracing(&cli.log_level) {
        eprintln!("{}: {}", e.code(), e);
    }

    match execute(cli.command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Command failed: {}", e);
            eprintln!("chaperone: {} ({})", e, e.code());
            std::process::exit(1);
        }
    }
}

async fn execute(command: Commands) -> cli::Result<i32> {
    match command {
        Commands::Run {
            shell,
            input,
            cwd,
            env,
            clear_env,
            command,
            args,
        } => {
            let mut options = ProcessOptions {
                working_directory: cwd,
                environment: env.into_iter().collect(),
                ..ProcessOptions::default()
            };
            if clear_env {
                options.environment_mode = EnvironmentMode::Clear;
            }

            let result = cli::run_once(RunRequest {
                command,
                args,
                shell,
                input,
                options,
            })
            .await?;

            std::io::stdout().write_all(result.std_out.as_bytes())?;
            std::io::stderr().write_all(result.std_err.as_bytes())?;
            Ok(cli::shell_exit_code(result.exit_status))
        }
        Commands::Supervise { config, json } => {
            let config = load_from_toml_path(&config)
                .map_err(|e| CliError::ConfigError(e.to_string()))?;
            let format = if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            };

            // the supervisor is single-threaded; keep it on one blocking worker
            let summary =
                tokio::task::spawn_blocking(move || cli::supervise(&config, format, std::io::stdout()))
                    .await
                    .map_err(|e| CliError::CommandFailed(format!("supervisor thread failed: {}", e)))?;

            Ok(if summary.success() { 0 } else { 1 })
        }
    }
}
