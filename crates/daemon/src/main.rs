//! Veilnet relay daemon: a local SOCKS4 forwarder driven by the edge
//! engine over a loopback circuit.

use anyhow::Result;
use std::path::PathBuf;
use tracing::{info, Level};

use veilnet_common::RelayConfig;
use veilnet_daemon::ProxyServer;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "help" | "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "version" | "--version" | "-v" => {
                println!("veilnet-daemon v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            _ => {
                eprintln!("Unknown command: {}", args[1]);
                eprintln!("Run with 'help' to see available commands");
                std::process::exit(1);
            }
        }
    }

    // Load or create default configuration
    let config_path = PathBuf::from("veilnet.toml");
    let config = if config_path.exists() {
        RelayConfig::from_file(&config_path)?
    } else {
        RelayConfig::default()
    };

    tracing_subscriber::fmt()
        .with_max_level(if config.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    info!("Starting veilnet daemon v{}", env!("CARGO_PKG_VERSION"));
    if config_path.exists() {
        info!("Loaded configuration from {:?}", config_path);
    } else {
        info!("No configuration file found, using defaults");
    }

    let mut server = ProxyServer::bind(&config)?;
    server.run()
}

fn print_help() {
    println!("veilnet-daemon - onion relay edge daemon");
    println!();
    println!("USAGE:");
    println!("    veilnet-daemon [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    help       Show this help text");
    println!("    version    Show the version");
    println!();
    println!("With no command, runs the SOCKS4 proxy from veilnet.toml");
    println!("(or defaults when the file is absent).");
}
