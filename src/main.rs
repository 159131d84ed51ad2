// src/main.rs

//! The main entry point for the Citrine proxy.

use anyhow::Result;
use citrine::config::Config;
use citrine::server;
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("Citrine version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "citrine.toml" when present.
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let mut config = match config_path {
        Some(path) => match Config::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e}");
                std::process::exit(1);
            }
        },
        None if std::path::Path::new("citrine.toml").exists() => {
            match Config::from_file("citrine.toml") {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("Failed to load configuration from \"citrine.toml\": {e}");
                    std::process::exit(1);
                }
            }
        }
        None => Config::default(),
    };

    // Override ports if provided as command-line arguments.
    if let Some(i) = args.iter().position(|arg| arg == "--port") {
        match args.get(i + 1).and_then(|s| s.parse::<u16>().ok()) {
            Some(port) => config.port = port,
            None => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(1);
            }
        }
    }
    if let Some(i) = args.iter().position(|arg| arg == "--backend") {
        match args.get(i + 1).and_then(|s| {
            let (host, port) = s.rsplit_once(':')?;
            Some((host.to_string(), port.parse::<u16>().ok()?))
        }) {
            Some((host, port)) => {
                config.backend.host = host;
                config.backend.port = port;
            }
            None => {
                eprintln!("--backend flag requires host:port");
                std::process::exit(1);
            }
        }
    }

    // Setup logging with reloading capabilities.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true), // Enable ANSI color codes for log levels.
        )
        .init();

    let reload_handle = Arc::new(reload_handle);

    info!("Starting Citrine {VERSION}");
    if let Err(e) = server::run(config, reload_handle).await {
        error!("Proxy runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
