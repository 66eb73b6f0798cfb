use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::info;

use shardfs::client::NamingClient;
use shardfs::config::{AppConfig, CliArgs, ClientConfig, NamingConfig, StorageConfig};
use shardfs::naming::NamingServer;
use shardfs::net::protocol::StorageAddress;
use shardfs::storage::StorageNode;

#[tokio::main]
async fn main() -> Result<()> {
    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = CliArgs::parse();
    match AppConfig::from_args(&args)? {
        AppConfig::Naming(config) => run_naming(config).await,
        AppConfig::Storage(config) => run_storage(config).await,
        AppConfig::Client(config) => run_client(config).await,
    }
}

async fn run_naming(config: NamingConfig) -> Result<()> {
    let storage = TcpListener::bind(SocketAddr::new(config.bind, config.storage_port)).await?;
    let clients = TcpListener::bind(SocketAddr::new(config.bind, config.client_port)).await?;
    info!(heartbeat = ?config.heartbeat, "Starting naming server");

    let server = Arc::new(NamingServer::new(config.heartbeat));
    server.serve(storage, clients).await?;
    Ok(())
}

async fn run_storage(config: StorageConfig) -> Result<()> {
    std::fs::create_dir_all(&config.root)?;
    let address = StorageAddress {
        ip: config.advertise_ip,
        control_port: config.control_port,
        data_port: config.data_port,
    };
    info!(name = %config.name, %address, root = ?config.root, "Starting storage node");

    let node = Arc::new(StorageNode::open(config.name, address, config.root)?);
    let data = TcpListener::bind(SocketAddr::new(config.bind, config.data_port)).await?;
    node.run(&config.naming, data).await?;

    info!("Control channel closed. Goodbye.");
    Ok(())
}

async fn run_client(config: ClientConfig) -> Result<()> {
    let mut client = NamingClient::connect(&config.naming).await?;

    if let Some(line) = config.command {
        print_outcome(client.run_line(&line).await);
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let outcome = client.run_line(&line).await;
        let bye = matches!(&outcome, Ok(text) if text == "BYE");
        print_outcome(outcome);
        if bye {
            break;
        }
    }
    Ok(())
}

fn print_outcome(outcome: shardfs::Result<String>) {
    match outcome {
        Ok(text) => println!("{}", text.trim_end()),
        Err(e) => println!("ERROR: {e}"),
    }
}
