pub mod daemon_path;
pub mod login;
pub mod process;
pub mod status;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use process::{daemon_binary, kill_previous_servers, restart_server};
use tracing::level_filters::LevelFilter;

use crate::{
    daemon::start_daemon,
    utils::{
        dir::create_application_default_path,
        logging::{enable_logging, CLI_PREFIX, DAEMON_PREFIX},
    },
};

const DIR_HELP: &str =
    "Application directory. By default $XDG_STATE_HOME/activity-relay or $HOME/.local/state/activity-relay";

#[derive(Parser, Debug)]
#[command(name = "activity-relay", version, long_about = None)]
#[command(about = "Relays foreground application activity and screenshots to a time-tracking server", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long = "log-filter", global = true, help = "Log level. Defaults to RUST_LOG, then debug")]
    log_filter: Option<LevelFilter>,
    #[arg(long = "log-console", global = true, help = "Mirror log output to the console")]
    log_console: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Starts a daemon for the application, replacing a running one")]
    Init {
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
    #[command(
        about = "Run a daemon directly in current console. Used for debugging"
    )]
    Serve {
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
    #[command(about = "Stop currently running daemon.")]
    Stop {},
    #[command(about = "Show pending uploads and the outcome of the last sync")]
    Status {
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
    #[command(about = "Log into the server and store the access token. Reads the password from stdin")]
    Login {
        #[arg(long, help = "Server url. Defaults to the configured one")]
        server: Option<String>,
        #[arg(long)]
        username: String,
        #[arg(long, help = DIR_HELP)]
        dir: Option<PathBuf>,
    },
}

fn application_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            Ok(std::path::absolute(dir)?)
        }
        None => create_application_default_path(),
    }
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let logging_level = args.log_filter;

    match args.commands {
        Commands::Init { dir } => {
            let explicit = dir.is_some();
            let dir = application_dir(dir)?;
            enable_logging(CLI_PREFIX, &dir, logging_level, args.log_console)?;
            restart_server(explicit.then_some(dir.as_path()))
        }
        Commands::Stop {} => {
            let dir = create_application_default_path()?;
            enable_logging(CLI_PREFIX, &dir, logging_level, args.log_console)?;
            let stopped = kill_previous_servers(&daemon_binary()?)?;
            println!("Stopped {stopped} daemon(s)");
            Ok(())
        }
        Commands::Serve { dir } => {
            let dir = application_dir(dir)?;
            enable_logging(DAEMON_PREFIX, &dir, logging_level, true)?;
            start_daemon(&dir).await
        }
        Commands::Status { dir } => {
            let dir = application_dir(dir)?;
            enable_logging(CLI_PREFIX, &dir, logging_level, args.log_console)?;
            status::print_status(&dir).await
        }
        Commands::Login {
            server,
            username,
            dir,
        } => {
            let dir = application_dir(dir)?;
            enable_logging(CLI_PREFIX, &dir, logging_level, args.log_console)?;
            login::login(&dir, server, &username).await
        }
    }
}
