//! CLI entry point for the ontoship query gateway.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use ontoship_core::config::{self as core_config, DEFAULT_CONFIG_PREFIX};
use ontoship_gateway::config::GatewayConfig;
use ontoship_gateway::http::{router, AppState};
use ontoship_gateway::{GraphClient, GraphConfig};

#[derive(Parser)]
#[command(name = "ontoship-gateway")]
#[command(about = "Serve parameterized graph traversals over HTTP")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file prefix (default: ontoship).
    #[arg(short, long, default_value = DEFAULT_CONFIG_PREFIX, global = true)]
    config: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Override the listen address.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Resolve a request without executing it and print the bound query.
    Resolve {
        /// Request path, e.g. /dynamic/shortestSimple.
        path: String,
        /// Parameters as name=value.
        #[arg(value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },
    /// List the registered templates as JSON.
    Templates,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected name=value, got {s:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match cli.command {
        Command::Serve { .. } => fmt().with_env_filter(filter).json().init(),
        _ => fmt().with_env_filter(filter).with_writer(std::io::stderr).init(),
    }

    let cfg = core_config::load(&cli.config)?;
    let mut gateway: GatewayConfig = core_config::section(&cfg, "gateway")?;
    let registry = gateway.registry()?;

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                gateway.bind = bind;
            }
            let graph_config: GraphConfig = core_config::section(&cfg, "neo4j")?;
            let graph = GraphClient::connect(&graph_config).await?;

            let state = AppState::new(registry, Arc::new(graph), gateway.query_timeout());
            let listener = tokio::net::TcpListener::bind(&gateway.bind).await?;
            tracing::info!(bind = %gateway.bind, "Query gateway listening");
            axum::serve(listener, router(state)).await?;
        }
        Command::Resolve { path, params } => {
            let supplied: HashMap<String, String> = params.into_iter().collect();
            let resolved = registry.resolve(&path, &supplied)?;
            println!("{}", serde_json::to_string_pretty(&resolved)?);
        }
        Command::Templates => {
            let templates: Vec<_> = registry.templates().collect();
            println!("{}", serde_json::to_string_pretty(&templates)?);
        }
    }

    Ok(())
}
