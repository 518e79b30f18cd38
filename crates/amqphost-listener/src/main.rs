#![warn(missing_docs)]

//! `amqphost` daemon: serves AMQP 1.0 nodes that log and accept every message.

use std::path::PathBuf;
use std::sync::Arc;

use amqphost_listener::{ContainerHost, HostConfig, MessageContext, MessageProcessor};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "amqphost", version, about = "AMQP 1.0 container host")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, env = "AMQPHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. `amqp://localhost:5672`; repeatable, replaces the configured list.
    #[arg(short, long)]
    listen: Vec<String>,

    /// Node address to serve; repeatable, added to the configured nodes.
    #[arg(short, long)]
    node: Vec<String>,
}

struct LoggingNode {
    address: String,
    credit: u32,
}

impl MessageProcessor for LoggingNode {
    fn credit(&self) -> u32 {
        self.credit
    }

    fn process(&self, context: MessageContext) {
        tracing::info!(
            node = %self.address,
            link = %context.link().name(),
            message = ?context.message(),
            "message received"
        );
        context.complete();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => HostConfig::default(),
    };
    if !args.listen.is_empty() {
        config.listen = args.listen.clone();
    }
    config.nodes.extend(args.node.iter().cloned());

    let mut host = ContainerHost::from_config(&config)?;
    for node in &config.nodes {
        host.register_message_processor(
            node,
            Arc::new(LoggingNode {
                address: node.clone(),
                credit: config.node_credit,
            }),
        )?;
    }

    host.open().await?;
    tracing::info!(listen = ?config.listen, nodes = ?config.nodes, "amqphost started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    host.close().await;
    tracing::info!(metrics = ?host.metrics(), "amqphost stopped");
    Ok(())
}
