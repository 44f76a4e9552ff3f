//! Subcommand: `deskpilot shell` -- interactive command loop.
//!
//! Each line is interpreted and executed; successful commands become the
//! context for referring words in later lines.  Lines starting with `:` are
//! shell commands.

use std::io::Write as _;

use anyhow::{Context, Result};
use deskpilot_intent::DeskPilot;
use deskpilot_kernel::ToolParams;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::helpers::{print_parsed, print_result, print_workflow};

const HELP: &str = "\
  Shell commands:
    :tools [query]     List tools
    :history [n]       Show the last n executions (default 10)
    :context           Show the commands used to resolve \"it\" and \"that\"
    :workflows         List loaded workflows
    :run <id>          Run a loaded workflow
    :help              Show this help
    :quit              Exit
  Anything else is interpreted as a command.";

pub async fn run_shell(pilot: DeskPilot) -> Result<()> {
    println!();
    println!("  DeskPilot v{}", env!("CARGO_PKG_VERSION"));
    println!("  Type a command, ':help' for help, or ':quit' to exit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next_line().await.context("failed to read input")? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix(':') {
            if !shell_command(&pilot, command).await {
                break;
            }
            continue;
        }

        let outcome = pilot.execute_command(line).await;
        print_parsed(&outcome.command);
        if outcome.command.is_resolved() {
            print_result(&outcome.result);
        }
    }

    info!("shell closed");
    Ok(())
}

/// Handle a `:` command.  Returns `false` to exit.
async fn shell_command(pilot: &DeskPilot, command: &str) -> bool {
    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();

    match name {
        "quit" | "exit" | "q" => return false,
        "help" | "h" => println!("{HELP}"),
        "tools" => {
            let tools = match arg {
                Some(query) => pilot.registry().search(query),
                None => pilot.list_tools(),
            };
            for tool in tools {
                println!("  {:<20} {}", tool.name, tool.description);
            }
        }
        "history" => {
            let limit = arg.and_then(|a| a.parse().ok()).unwrap_or(10);
            for record in pilot.get_history(limit) {
                let status = if record.result.success { "ok" } else { "failed" };
                println!(
                    "  {} {:<20} {:<7} {} ms",
                    record.timestamp.format("%H:%M:%S"),
                    record.tool,
                    status,
                    record.duration_ms
                );
            }
        }
        "context" => {
            for command in pilot.recent_commands() {
                println!("  {}", command.raw_text);
            }
        }
        "workflows" => {
            for id in pilot.list_workflows() {
                println!("  {id}");
            }
        }
        "run" => match arg {
            Some(id) => match pilot.run_workflow(id, ToolParams::new()).await {
                Ok(result) => print_workflow(&result),
                Err(e) => println!("  [!] {e}"),
            },
            None => println!("  usage: :run <workflow id>"),
        },
        other => println!("  unknown shell command `:{other}` (try :help)"),
    }
    true
}
