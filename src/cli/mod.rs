pub mod commands;

use clap::{Parser, Subcommand};

use crate::core::config::DEFAULT_MEMORY_LIMIT;

/// MiniCon — a minimal single-host Linux container runtime.
#[derive(Parser, Debug)]
#[command(name = "minicon", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a new container in the created state.
    Create {
        /// Container name.
        #[arg(long, short = 'n')]
        name: String,

        /// The command (and arguments) to execute inside the container.
        /// Everything after `--` is treated as the command.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// List containers.
    List {
        /// Filter by container state (created, running, exited).
        #[arg(long, short = 's')]
        state: Option<String>,
    },

    /// Start a created container.
    Start {
        /// Container ID.
        id: String,
    },

    /// Stop a running container.
    Stop {
        /// Container ID.
        id: String,
    },

    /// Remove a container that is not running.
    Rm {
        /// Container ID.
        id: String,
    },

    /// Create and start a container in one step.
    Run {
        /// Container name.
        #[arg(long, short = 'n')]
        name: String,

        /// Memory limit in bytes.
        #[arg(long, short = 'm', default_value_t = DEFAULT_MEMORY_LIMIT)]
        memory: u64,

        /// The command (and arguments) to execute inside the container.
        /// Everything after `--` is treated as the command.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Parse CLI arguments. Called from `main`.
pub fn parse() -> Cli {
    Cli::parse()
}
