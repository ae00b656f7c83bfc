use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serverkeep::{
    CommandReply, Core, CoreConfig, InstanceId, LifecycleState, Repository, config::LoggingSettings,
    telemetry,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "serverkeep", version, about = "Run, relay to and back up game servers")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "serverkeep.toml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start an instance, tail its console and forward stdin as commands
    Run { id: String },
    /// Print the state of every configured instance
    Status,
    /// Archive an instance's working directory
    Backup {
        id: String,
        /// Also upload the artifact to the remote store
        #[arg(long)]
        remote: bool,
    },
    /// Replace an instance's working directory with an artifact
    Restore {
        artifact: String,
        /// Download the artifact from the remote store first
        #[arg(long)]
        remote: bool,
    },
    /// Delete an artifact
    Delete {
        artifact: String,
        /// Also delete the remote copy
        #[arg(long)]
        remote: bool,
    },
    /// List recorded artifacts, newest first
    Backups {
        #[arg(long)]
        instance: Option<String>,
    },
    /// Fetch remote artifacts of an instance that are missing locally
    Sync { id: String },
    /// Send one command over RCON and print the response
    Rcon {
        id: String,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        CoreConfig::load(&cli.config)?
    } else {
        CoreConfig::default()
    };
    let logging = LoggingSettings {
        json: cli.json || config.logging.json,
        ..config.logging.clone()
    };
    telemetry::init(&logging).context("failed to install log subscriber")?;
    if !cli.config.exists() {
        warn!(path = %cli.config.display(), "config file not found, using defaults");
    }

    let core = Core::from_config(&config)?;
    core.discover_backups().await?;

    match cli.command {
        Command::Run { id } => run(&core, &InstanceId::new(id)).await?,
        Command::Status => {
            for instance in core.repository().instances().await? {
                println!("{:<20} {}", instance.id, core.state(&instance.id));
            }
        }
        Command::Backup { id, remote } => {
            let artifact = core.create_backup(&InstanceId::new(id), remote).await?;
            println!(
                "{} ({} bytes{})",
                artifact.name,
                artifact.size,
                if artifact.remote { ", mirrored" } else { "" }
            );
        }
        Command::Restore { artifact, remote } => {
            let artifact = core.restore_backup(&artifact, remote).await?;
            println!("restored {} into {}", artifact.name, artifact.instance);
        }
        Command::Delete { artifact, remote } => {
            let report = core.delete_backup(&artifact, remote).await?;
            println!(
                "local: {}, remote: {}",
                if report.local_removed { "removed" } else { "absent" },
                if report.remote_removed { "removed" } else { "untouched" }
            );
            if let Some(err) = report.remote_error {
                bail!("remote deletion failed: {err}");
            }
        }
        Command::Backups { instance } => {
            let filter = instance.map(InstanceId::new);
            for artifact in core.list_backups(filter.as_ref()).await? {
                println!(
                    "{}  {:<12} {:>12}  {}{}",
                    artifact.created_at.format("%Y-%m-%d %H:%M:%S"),
                    artifact.instance,
                    artifact.size,
                    artifact.name,
                    if artifact.remote { "  [remote]" } else { "" }
                );
            }
        }
        Command::Sync { id } => {
            let fetched = core.sync_backups(&InstanceId::new(id)).await?;
            println!("fetched {} artifact(s)", fetched.len());
        }
        Command::Rcon { id, command } => {
            let response = core.rcon(&InstanceId::new(id), &command.join(" ")).await?;
            println!("{response}");
        }
    }

    Ok(())
}

async fn run(core: &Core, id: &InstanceId) -> Result<()> {
    let mut state_rx = core.watch_state(id);
    let mut logs = core.subscribe(id);
    core.start(id).await?;
    info!(instance = %id, "started, Ctrl-C stops the server");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = logs.recv() => match line {
                Some(line) => println!("{line}"),
                None => break,
            },
            input = stdin.next_line(), if stdin_open => match input {
                Ok(Some(text)) if !text.trim().is_empty() => {
                    match core.send_command(id, text.trim()).await {
                        Ok(CommandReply::Rcon(response)) => println!("{response}"),
                        Ok(CommandReply::Console) => {}
                        Err(err) => warn!(error = %err, "command not delivered"),
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!(instance = %id, "interrupt received, stopping");
                let report = core.stop(id, None).await?;
                info!(instance = %id, state = %report.state, code = ?report.code, "server stopped");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                if matches!(state, LifecycleState::Stopped | LifecycleState::Error)
                    && !core.is_running(id)
                {
                    info!(instance = %id, %state, "server exited");
                    break;
                }
            }
        }
    }

    core.unsubscribe(logs.handle());
    let state = core.state(id);
    if state == LifecycleState::Error {
        bail!("server {id} ended in error state");
    }
    Ok(())
}
