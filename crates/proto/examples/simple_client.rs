//! Simple SSH Client Example
//!
//! Connects, authenticates with a password and runs one command.
//!
//! Usage:
//!   cargo run --example simple_client <host:port> <username> <password> <command>
//!
//! Example:
//!   cargo run --example simple_client 127.0.0.1:2222 testuser testpass "echo hi"

use std::env;
use std::io::Write;
use tessera_proto::ssh::{SshClient, TransportConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() != 5 {
        eprintln!("Usage: {} <host:port> <username> <password> <command>", args[0]);
        std::process::exit(2);
    }
    let (addr, user, password, command) = (&args[1], &args[2], &args[3], &args[4]);

    let client = SshClient::connect(addr, TransportConfig::default()).await?;
    println!("Connected to {} ({})", client.peer_addr(), client.transport().remote_version());
    if let Some(print) = client.server_fingerprint() {
        println!("Host key: {}", print);
    }
    if let Some(negotiated) = client.transport().negotiated() {
        println!(
            "Algorithms: {} / {} / {}",
            negotiated.kex,
            negotiated.cipher_client_to_server.name(),
            negotiated.mac_client_to_server.name()
        );
    }

    client.authenticate_password(user, password).await?;
    if let Some(banner) = client.transport().auth_banner() {
        print!("{}", banner);
    }

    let output = client.execute(command).await?;
    std::io::stdout().write_all(&output.stdout)?;
    std::io::stderr().write_all(&output.stderr)?;
    client.close().await;

    std::process::exit(output.exit_status.map(|s| s as i32).unwrap_or(255));
}
