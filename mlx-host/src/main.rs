//! Entry point: parse configuration, initialize logging, run the listener
//! until bind/accept fails (§6 process exit codes).

use std::process::ExitCode;
use std::sync::Arc;

use mlx_host::config::HostConfig;
use mlx_host::engine::stub::StubEngine;
use mlx_host::listener;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match HostConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mlx-host: {e}");
            return ExitCode::from(2);
        }
    };

    let engine = Arc::new(StubEngine::new());

    if let Err(e) = listener::run(config, engine).await {
        tracing::error!(error = %e, "mlx-host exiting");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}
