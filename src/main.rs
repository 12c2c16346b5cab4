use std::{process::ExitCode, time::Duration};

use mcp_sse_proxy::{
    config::Config,
    logging,
    proxy::{Proxy, ProxyOptions},
};
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let config = match Config::from_env_and_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            logging::init_logging(false);
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    logging::init_logging(config.debug);

    let proxy = match ProxyOptions::from_config(&config) {
        Ok(options) => Proxy::start(options).await,
        Err(err) => Err(err.into()),
    };
    let proxy = match proxy {
        Ok(proxy) => proxy,
        Err(err) => {
            error!(error = %err, command = %config.command, "could not start the proxy");
            tokio::time::sleep(Duration::from_secs(1)).await;
            return ExitCode::FAILURE;
        }
    };

    info!(
        local_addr = %proxy.local_addr(),
        endpoint = %config.endpoint,
        "starting the SSE server"
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "could not listen for shutdown signal");
    }

    info!("shutting down");
    proxy.shutdown().await;
    ExitCode::SUCCESS
}
