use clap::{Parser, Subcommand};
use dltidy::cli::{Command, run_cli};
use dltidy::config::Config;
use dltidy::history::BatchId;
use dltidy::logging::init_tracing;
use dltidy::output::OutputFormatter;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    name = "dltidy",
    version,
    about = "Sort a downloads folder into categories, with watch mode and undo"
)]
struct Cli {
    /// Directory to organize (defaults to the configured root or ~/Downloads)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Configuration file (defaults to ./.dltidy.toml, then the user config)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Do not add YYYY-MM folders under each category
    #[arg(long, global = true)]
    no_date: bool,

    /// Also organize files inside subdirectories
    #[arg(short, long, global = true)]
    recursive: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show what would be moved (default)
    Preview,
    /// Move files into their categories
    Organize,
    /// Keep organizing new files until interrupted
    Watch,
    /// Revert the last batch, or the given one
    Undo {
        /// Batch id as shown by `history`
        #[arg(short, long)]
        batch: Option<BatchId>,
    },
    /// List past batches
    History,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = init_tracing(cli.verbose, cli.json_logs);

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            OutputFormatter::error(&format!("Error loading configuration: {}", e));
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = cli.path {
        config.root_path = Some(path);
    }
    if cli.no_date {
        config.archive_by_date = false;
    }
    if cli.recursive {
        config.recursive = true;
    }
    let settings = match config.compile() {
        Ok(settings) => settings,
        Err(e) => {
            OutputFormatter::error(&format!("Invalid configuration: {}", e));
            return ExitCode::FAILURE;
        }
    };

    let command = match cli.command.unwrap_or(Cmd::Preview) {
        Cmd::Preview => Command::Preview,
        Cmd::Organize => Command::Organize,
        Cmd::Watch => Command::Watch,
        Cmd::Undo { batch } => Command::Undo { batch },
        Cmd::History => Command::History,
    };

    match run_cli(command, settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            OutputFormatter::error(&format!("Error: {}", e));
            ExitCode::FAILURE
        }
    }
}
