mod bootstrap_helpers;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rkgate_cli::Cli;
use rkgate_gateway::run_gateway_server;
use rkgate_runtime::{RpcRuntime, SimulatedEngine};

use crate::bootstrap_helpers::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    run_cli(cli).await
}

async fn run_cli(cli: Cli) -> Result<()> {
    tracing::info!(
        transports = ?cli.gateway_config().transport_labels(),
        "starting rkgate"
    );
    let engine = Arc::new(SimulatedEngine::new(cli.engine_config()));
    let runtime = RpcRuntime::start(cli.runtime_config(), engine)?;
    run_gateway_server(cli.gateway_config(), runtime).await
}
