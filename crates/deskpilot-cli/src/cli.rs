//! CLI argument definitions for DeskPilot.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// DeskPilot -- desktop command interpreter and workflow runner.
#[derive(Parser, Debug)]
#[command(
    name = "deskpilot",
    version,
    about = "DeskPilot -- desktop command interpreter and workflow runner",
    long_about = "Interprets short natural-language commands into tool calls and runs \
                  multi-step workflows, on demand or from triggers."
)]
pub struct Cli {
    /// Config file (defaults to $DESKPILOT_CONFIG, then config/default.toml).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the available tools.
    Tools {
        /// Only show tools matching this query.
        query: Option<String>,
    },

    /// Show how a command would be interpreted, without running it.
    Interpret {
        /// The command text.
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Interpret a command and run it.
    Exec {
        /// The command text.
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Call a tool directly by name.
    Invoke {
        /// Tool name.
        tool: String,

        /// Parameters as a JSON object.
        #[arg(long, short, default_value = "{}")]
        params: String,
    },

    /// Validate or run workflow files.
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Interactive shell with context carried between commands.
    Shell,

    /// Load a directory of workflows and run their triggers until Ctrl-C.
    Triggers {
        /// Directory of `.json`/`.toml` workflow files.
        dir: PathBuf,

        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<u64>,
    },
}

/// Actions on workflow files.
#[derive(Subcommand, Debug)]
pub enum WorkflowAction {
    /// Check a workflow file and print its execution order.
    Validate {
        /// Path to a `.json` or `.toml` workflow file.
        path: PathBuf,
    },
    /// Run a workflow file once.
    Run {
        /// Path to a `.json` or `.toml` workflow file.
        path: PathBuf,

        /// Workflow input as a JSON object.
        #[arg(long, short, default_value = "{}")]
        input: String,
    },
}
