//! LocalAI server - HTTP surface over the LocalAI core.
//!
//! Parses flags, sets up logging, builds the core and serves gallery,
//! runtime and P2P endpoints until Ctrl-C.

mod cli;
mod handlers;
mod server;

use anyhow::Result;
use clap::Parser;
use cli::{Args, LogFormat};
use localai_core::config::EnvVars;
use localai_core::{CancellationToken, LocalAiApi};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging(args: &Args) {
    let default_level = if args.debug { "debug" } else { "info" };
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let explicit_p2p = std::env::var("RUST_LOG")
        .map(|v| v.contains("localai_core::p2p"))
        .unwrap_or(false);
    if !explicit_p2p {
        if let Ok(level) = std::env::var(EnvVars::P2P_LOGLEVEL) {
            if let Ok(directive) = format!("localai_core::p2p={}", level.trim()).parse() {
                filter = filter.add_directive(directive);
            }
        }
    }

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false);
    match args.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.compact().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting LocalAI server");

    let (config, generated_token) = args.application_config()?;
    if let Some(token) = generated_token {
        // Other nodes need this to join.
        println!("P2P_TOKEN={}", token);
    }

    let root = CancellationToken::new();
    let api = LocalAiApi::builder(config)
        .auto_create_dirs(true)
        .with_cancellation(root.clone())
        .build()
        .await?;

    let addr = server::start_server(api.clone(), &args.address, root.clone()).await?;
    info!("HTTP server running on {}", addr);
    println!("LOCALAI_PORT={}", addr.port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");
    root.cancel();
    api.shutdown().await;

    Ok(())
}
