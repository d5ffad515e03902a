use anyhow::{bail, Context, Result};
use nix::unistd::Uid;

use crate::cli::{Cli, Command};
use crate::core::config::Config;
use crate::core::manager::Manager;
use crate::core::model::State;

/// Dispatch a parsed CLI command to the appropriate handler.
pub fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Create { name, command } => cmd_create(&name, &command),
        Command::List { state } => cmd_list(state.as_deref()),
        Command::Start { id } => cmd_start(&id),
        Command::Stop { id } => cmd_stop(&id),
        Command::Rm { id } => cmd_rm(&id),
        Command::Run {
            name,
            memory,
            command,
        } => cmd_run(&name, memory, &command),
    }
}

fn check_root() -> Result<()> {
    if !Uid::effective().is_root() {
        bail!("this command requires root privileges");
    }
    Ok(())
}

fn manager() -> Result<Manager> {
    Manager::new(Config::from_env()).context("failed to initialize container manager")
}

// ─── create ─────────────────────────────────────────────────────────────────

fn cmd_create(name: &str, command: &[String]) -> Result<()> {
    check_root()?;
    let manager = manager()?;
    let id = manager
        .create(name, command, None)
        .context("failed to create container")?;
    println!("{id}");
    Ok(())
}

// ─── list ───────────────────────────────────────────────────────────────────

fn cmd_list(state: Option<&str>) -> Result<()> {
    let filter = match state {
        Some(raw) => Some(raw.parse::<State>().map_err(|e| anyhow::anyhow!(e))?),
        None => None,
    };

    let manager = manager()?;
    let containers = manager.list(filter);

    println!(
        "{:<10} {:<18} {:<9} {:<8} {}",
        "ID", "NAME", "STATE", "PID", "COMMAND"
    );

    for container in containers {
        let pid = container
            .process_id
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());

        let mut command = container.command[..container.command.len().min(3)].join(" ");
        if container.command.len() > 3 {
            command.push_str("...");
        }

        println!(
            "{:<10} {:<18} {:<9} {:<8} {}",
            container.id, container.name, container.state, pid, command
        );
    }

    Ok(())
}

// ─── start / stop / rm ──────────────────────────────────────────────────────

fn cmd_start(id: &str) -> Result<()> {
    check_root()?;
    let manager = manager()?;
    manager
        .start(id)
        .with_context(|| format!("failed to start container {id}"))?;
    println!("Started container {id}");
    Ok(())
}

fn cmd_stop(id: &str) -> Result<()> {
    check_root()?;
    let manager = manager()?;
    manager
        .stop(id)
        .with_context(|| format!("failed to stop container {id}"))?;
    println!("Stopped container {id}");
    Ok(())
}

fn cmd_rm(id: &str) -> Result<()> {
    check_root()?;
    let manager = manager()?;
    manager
        .remove(id)
        .with_context(|| format!("failed to remove container {id}"))?;
    println!("Removed container {id}");
    Ok(())
}

// ─── run ────────────────────────────────────────────────────────────────────

fn cmd_run(name: &str, memory: u64, command: &[String]) -> Result<()> {
    check_root()?;
    let manager = manager()?;

    let id = manager
        .create(name, command, Some(memory))
        .context("failed to create container")?;
    manager
        .start(&id)
        .with_context(|| format!("failed to start container {id}"))?;

    println!("{id}");
    Ok(())
}
