//! tcp-beacon: a TCP beacon server
//!
//! Every connected client receives a fixed payload (`t321t` by default) once
//! per interval until it disconnects or the server is interrupted.
//!
//! Features:
//! - One task per connection, capped by a connection limit
//! - Verification of payloads echoed back by the client
//! - An echo client mode that plays the device side of the link
//! - Graceful shutdown on Ctrl-C or SIGTERM
//! - Configuration via CLI arguments, environment variables or TOML file

mod beacon;
mod client;
mod config;
mod connection;
mod server;

use client::EchoClient;
use config::{Config, Mode};
use server::Server;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    runtime.block_on(async move {
        match config.mode.clone() {
            Mode::Serve => run_server(config).await,
            Mode::Echo { connect } => run_echo_client(config, connect).await,
        }
    })
}

/// Run the beacon server until interrupted
async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        payload = ?config.payload,
        interval_ms = config.interval.as_millis() as u64,
        max_connections = config.max_connections,
        "Starting tcp-beacon server"
    );

    let server = Server::new(config);
    let listener = server.bind()?;

    println!("TCP beacon started on {}", listener.local_addr()?);
    println!("Interrupt the program with Ctrl-C");
    println!("{}", ">".repeat(49));

    server.run(listener, shutdown_signal()).await?;
    Ok(())
}

/// Run the echo client until interrupted
async fn run_echo_client(config: Config, connect: String) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        connect = %connect,
        reconnect_ms = config.reconnect_delay.as_millis() as u64,
        "Starting tcp-beacon echo client"
    );

    println!("Echo client connecting to {connect}");
    println!("Interrupt the program with Ctrl-C");

    EchoClient::new(connect, config.reconnect_delay)
        .run(shutdown_signal())
        .await;
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => info!("SIGINT received, initiating graceful shutdown"),
        _ = terminate => info!("SIGTERM received, initiating graceful shutdown"),
    }
}
