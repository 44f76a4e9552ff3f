//! CLI entry point for DeskPilot.
//!
//! This binary provides the `deskpilot` command with subcommands for
//! listing tools, interpreting and executing commands, running workflows,
//! and serving triggers.

mod builtins;
mod cli;
mod config;
mod helpers;
mod repl;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use deskpilot_intent::{DeskPilot, WorkflowDefinition};
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::{Cli, Commands, WorkflowAction};
use crate::helpers::{
    build_pilot, init_tracing, load_workflow_dir, parse_params, print_json, print_parsed,
    print_result, print_workflow,
};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = config::load(cli.config.as_deref())?;
    init_tracing(&config.logging.level);
    let pilot = build_pilot(&config)?;

    match cli.command {
        Commands::Tools { query } => cmd_tools(&pilot, query.as_deref()),
        Commands::Interpret { text } => print_json(&pilot.interpret(&text.join(" "))),
        Commands::Exec { text } => cmd_exec(&pilot, &text.join(" ")).await,
        Commands::Invoke { tool, params } => cmd_invoke(&pilot, &tool, &params).await,
        Commands::Workflow { action } => cmd_workflow(&pilot, action).await,
        Commands::Shell => repl::run_shell(pilot).await,
        Commands::Triggers { dir, duration } => cmd_triggers(&pilot, &dir, duration).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

fn cmd_tools(pilot: &DeskPilot, query: Option<&str>) -> Result<()> {
    let tools = match query {
        Some(query) => pilot.registry().search(query),
        None => pilot.list_tools(),
    };

    println!();
    for tool in &tools {
        println!("  {:<20} {:<18} {}", tool.name, tool.category.to_string(), tool.description);
        for param in &tool.parameters {
            let required = if param.required { "required" } else { "optional" };
            println!("      {:<16} {:?} ({required})", param.name, param.kind);
        }
    }
    println!();
    println!("  {} tool(s)", tools.len());
    Ok(())
}

async fn cmd_exec(pilot: &DeskPilot, text: &str) -> Result<()> {
    let outcome = pilot.execute_command(text).await;
    print_parsed(&outcome.command);
    if outcome.command.is_resolved() {
        print_result(&outcome.result);
    }
    if !outcome.result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_invoke(pilot: &DeskPilot, tool: &str, params: &str) -> Result<()> {
    let params = parse_params(params)?;
    let result = pilot.invoke_tool(tool, params).await;
    print_result(&result);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_workflow(pilot: &DeskPilot, action: WorkflowAction) -> Result<()> {
    match action {
        WorkflowAction::Validate { path } => {
            let definition = WorkflowDefinition::from_path(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            let plan = pilot
                .engine()
                .validate(&definition)
                .with_context(|| format!("{} is not a valid workflow", path.display()))?;
            println!("  [+] {} is valid", definition.id);
            println!("  Execution order: {}", plan.order().join(" -> "));
            Ok(())
        }
        WorkflowAction::Run { path, input } => {
            let definition = WorkflowDefinition::from_path(&path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            let input = parse_params(&input)?;
            let result = pilot.engine().run(&definition, input).await?;
            print_workflow(&result);
            if !result.succeeded() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn cmd_triggers(pilot: &DeskPilot, dir: &std::path::Path, duration: Option<u64>) -> Result<()> {
    let loaded = load_workflow_dir(pilot, dir)?;
    let scheduler = pilot.trigger_scheduler().await?;
    let mut scheduler = scheduler.lock().await;
    let triggers = scheduler.triggers().await;
    println!("  Loaded {loaded} workflow(s), {} trigger(s)", triggers.len());
    for binding in &triggers {
        let target = match &binding.step_id {
            Some(step) => format!("{}.{step}", binding.workflow_id),
            None => binding.workflow_id.clone(),
        };
        println!("    {target:<30} {}", binding.spec);
    }
    if triggers.is_empty() {
        return Ok(());
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler.start(tx).await?;

    let deadline = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            run = rx.recv() => match run {
                Some(run) => match run.result {
                    Ok(result) => print_workflow(&result),
                    Err(e) => println!("  [!] {}: {e}", run.workflow_id),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            () = &mut deadline => break,
        }
    }

    scheduler.stop().await;
    Ok(())
}
