mod builtin;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use strand_core::config::WorkflowConfig;
use strand_core::types::NodeState;
use strand_engine::{DependencyGraph, RunResult, Scheduler};

#[derive(Parser)]
#[command(name = "strand", version, about = "Dependency-driven workflow runner")]
struct Cli {
    /// Path to the workflow file
    #[arg(short, long, default_value = "strand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the workflow file and graph without running anything
    Validate,
    /// Print the graph as parallel levels
    Graph,
    /// Execute the workflow with the built-in agents
    Run {
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
        /// Override run.max_parallelism
        #[arg(long)]
        max_parallelism: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("strand=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = WorkflowConfig::load(&cli.config)?;

    match cli.command {
        Commands::Validate => {
            let scheduler = prepare(&config)?;
            println!(
                "{}: {} nodes, {} capabilities, ok",
                config.name.as_deref().unwrap_or("workflow"),
                scheduler.graph().len(),
                scheduler.connections().capabilities().len()
            );
        }
        Commands::Graph => {
            let graph = DependencyGraph::from_config(&config)?;
            for (level, nodes) in graph.levels().iter().enumerate() {
                let ids: Vec<&str> = nodes.iter().map(|&i| graph.node(i).id.as_str()).collect();
                println!("{}: {}", level, ids.join(", "));
            }
        }
        Commands::Run {
            json,
            max_parallelism,
        } => {
            if let Some(n) = max_parallelism {
                config.run.max_parallelism = n;
                config.validate()?;
            }
            let scheduler = prepare(&config)?;

            let cancel = CancellationToken::new();
            let interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    interrupt.cancel();
                }
            });

            let result = scheduler.run(cancel).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            std::process::exit(result.exit_code());
        }
    }

    Ok(())
}

fn prepare(config: &WorkflowConfig) -> anyhow::Result<Scheduler> {
    let registry = builtin::registry();
    let connectors = builtin::loopback_connectors(config);
    Ok(Scheduler::from_config(config, &registry, connectors)?)
}

fn print_result(result: &RunResult) {
    for node in &result.nodes {
        let marker = match node.state {
            NodeState::Succeeded => "ok",
            NodeState::Failed => "FAILED",
            NodeState::Skipped => "skipped",
            NodeState::Cancelled => "cancelled",
            _ => "?",
        };
        match &node.error {
            Some(e) => println!(
                "  {:<20} {:<9} attempts={} [{}] {}",
                node.id, marker, node.attempts, e.class, e.message
            ),
            None => println!("  {:<20} {:<9} attempts={}", node.id, marker, node.attempts),
        }
    }
    println!("{}", result.summary());
}
