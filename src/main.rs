use std::process;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pve_orch::cli::{
    build_task, cluster_status, explain_route, filter_nodes, format_cluster_status,
    format_node_list, format_route_report, format_task, init_config, load_orchestrator_config,
    resolve_config_path, run_task, Cli, CommandError, Commands,
};
use pve_orch::config::save_config_to;
use pve_orch::telemetry::probe_local_node;
use pve_orch::TaskStatus;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}

/// Execute one command; returns the process exit code
async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Status => {
            let config = load_orchestrator_config(config_path)?;
            let status = cluster_status(&config.cluster);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", format_cluster_status(&status));
            }
        }

        Commands::Nodes(args) => {
            let config = load_orchestrator_config(config_path)?;
            let nodes = filter_nodes(&config.cluster, args.capability, args.all);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else {
                print!("{}", format_node_list(&nodes));
            }
        }

        Commands::Route(args) => {
            let config = load_orchestrator_config(config_path)?;
            let task = build_task(&args.task);
            let weights = config.scheduler.queue_config().scoring;
            let report = explain_route(&task, &config.cluster, &weights);
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", format_route_report(&report, args.explain));
            }
            if report.selected.is_none() {
                return Ok(2);
            }
        }

        Commands::Run(args) => {
            let config = load_orchestrator_config(config_path)?;
            let task = run_task(&config, &args).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&task)?);
            } else {
                print!("{}", format_task(&task));
            }
            if task.status() == TaskStatus::Failed {
                return Ok(2);
            }
        }

        Commands::Discover(args) => {
            let node = probe_local_node(args.name.as_deref());
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&node)?);
            } else {
                print!("{}", serde_yaml::to_string(&vec![node])?);
            }
        }

        Commands::Init(args) => {
            let path = resolve_config_path(config_path);
            if path.exists() && !args.force {
                return Err(CommandError::AlreadyExists(path).into());
            }
            let config = init_config(&args);
            save_config_to(&config, &path)
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Configuration saved to {}", path.display());
            println!("Configuration saved to {}", path.display());
        }
    }

    Ok(0)
}
