use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use overwatcher::{
    config::secs, runtime::stop, CancelToken, OperatorCommand, OverwatcherConfig,
    OverwatcherHandle, OverwatcherRuntime,
};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Runtime,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "overwatcher",
    version,
    about = "Autonomous observatory supervisor"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Starts the overwatcher and reads operator commands from stdin.
    Run(RunArgs),
    /// Validates a configuration file and prints the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Configuration file; `reload-config` re-reads it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Drives a simulated observatory instead of real hardware.
    #[arg(long)]
    simulate: bool,
    /// Also writes every log record to this JSON-lines file.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Wall-clock time the simulation starts at (RFC 3339).
    #[arg(long)]
    start: Option<DateTime<Utc>>,
}

/// One line typed at the operator console.
#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum ConsoleCommand {
    /// Allows autonomous operation.
    Enable,
    /// Stops autonomous operation.
    Disable {
        /// Aborts running work and secures the observatory immediately.
        #[arg(long)]
        now: bool,
        /// Closes the dome once running work has finished.
        #[arg(long)]
        close_dome: bool,
    },
    /// Prints the current status.
    Status,
    /// Re-reads the configuration file.
    ReloadConfig,
    /// Stops the overwatcher.
    Quit,
}

impl ConsoleCommand {
    const fn operator_command(&self) -> Option<OperatorCommand> {
        match *self {
            Self::Enable => Some(OperatorCommand::Enable),
            Self::Disable { now, close_dome } => Some(OperatorCommand::Disable { now, close_dome }),
            Self::Status => Some(OperatorCommand::Status),
            Self::ReloadConfig => Some(OperatorCommand::ReloadConfig),
            Self::Quit => None,
        }
    }
}

fn parse_console_line(line: &str) -> Result<Option<ConsoleCommand>, clap::Error> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    ConsoleLine::try_parse_from(line.split_whitespace()).map(|parsed| Some(parsed.command))
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let runtime = Runtime::new()?;
            runtime.block_on(run(args))
        }
        Commands::CheckConfig { config } => check_config(&config),
    }
}

fn check_config(path: &Path) -> Result<()> {
    let config = OverwatcherConfig::load(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    let summary = json!({
        "config": path,
        "valid": true,
        "settings": config,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    if !args.simulate {
        bail!("no hardware device facade is available in this build; pass --simulate");
    }
    let config = match &args.config {
        Some(path) => OverwatcherConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OverwatcherConfig::default(),
    };
    let grace = secs(config.control.shutdown_grace) * 2;
    let mut builder = match &args.config {
        Some(path) => OverwatcherRuntime::builder().config_path(path)?,
        None => OverwatcherRuntime::builder().config(config),
    };
    if let Some(path) = args.log_file {
        builder = builder.log_file(path);
    }
    let (runtime, _simulation) = builder.simulated(args.start.unwrap_or_else(Utc::now))?;
    let handle = runtime.handle();
    let cancel = CancelToken::new();
    let tasks = runtime.spawn(cancel.clone());

    console(&handle).await?;

    stop(tasks, &cancel, grace).await
}

/// Reads operator commands until `quit`, Ctrl-C or the control loop stops.
async fn console(handle: &OverwatcherHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                return Ok(());
            }
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                let command = match parse_console_line(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(err) => {
                        eprintln!("{err}");
                        continue;
                    }
                };
                let Some(command) = command.operator_command() else {
                    return Ok(());
                };
                match handle.send(command).await {
                    Ok(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
                    Err(err) => {
                        eprintln!("{err}");
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_parses_disable_flags() {
        let command = parse_console_line("disable --now --close-dome")
            .unwrap()
            .unwrap();
        assert_eq!(
            command.operator_command(),
            Some(OperatorCommand::Disable {
                now: true,
                close_dome: true
            })
        );
        let command = parse_console_line("  disable ").unwrap().unwrap();
        assert_eq!(
            command,
            ConsoleCommand::Disable {
                now: false,
                close_dome: false
            }
        );
    }

    #[test]
    fn console_maps_commands_and_skips_blank_lines() {
        assert!(parse_console_line("   ").unwrap().is_none());
        assert_eq!(
            parse_console_line("reload-config")
                .unwrap()
                .unwrap()
                .operator_command(),
            Some(OperatorCommand::ReloadConfig)
        );
        assert_eq!(
            parse_console_line("quit").unwrap().unwrap().operator_command(),
            None
        );
        assert!(parse_console_line("open-dome").is_err());
    }

    #[test]
    fn run_arguments_accept_a_simulation_start() {
        let cli = Cli::try_parse_from([
            "overwatcher",
            "run",
            "--simulate",
            "--start",
            "2026-03-01T22:00:00Z",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(args.simulate);
        assert!(args.config.is_none());
        assert_eq!(
            args.start.unwrap().to_rfc3339(),
            "2026-03-01T22:00:00+00:00"
        );
    }
}
