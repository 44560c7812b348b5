//! Simple SSH Server Example
//!
//! This example demonstrates how to:
//! - Create an SSH server with an Ed25519 host key
//! - Authenticate users with a password
//! - Answer `exec` requests from a handler
//!
//! Usage:
//!   cargo run --example simple_server [bind_address]
//!
//! Then connect with a client:
//!   cargo run --example simple_client 127.0.0.1:2222 testuser testpass "echo hi"

use std::env;
use std::sync::Arc;
use tessera_platform::SystemRandomSource;
use tessera_proto::ssh::{
    fingerprint, AuthDecision, Channel, ChannelRequestType, Ed25519HostKey, HostKey,
    ServerHandler, SshServer, TransportConfig,
};
use tracing_subscriber::EnvFilter;

struct SimpleHandler;

#[async_trait::async_trait]
impl ServerHandler for SimpleHandler {
    async fn auth_password(&self, user: &str, password: &str) -> AuthDecision {
        if user == "testuser" && password == "testpass" {
            AuthDecision::Success
        } else {
            AuthDecision::Failure
        }
    }

    async fn exec_request(&self, _channel: &Channel, _command: &str) -> bool {
        true
    }

    async fn session_started(&self, channel: Channel, request: ChannelRequestType) {
        let ChannelRequestType::Exec { command } = request else {
            return;
        };
        println!("  Executing command: {}", command);

        let (output, status) = match command.trim() {
            "whoami" => ("testuser\n".to_string(), 0),
            "hostname" => ("tessera-example\n".to_string(), 0),
            cmd if cmd.starts_with("echo ") => (format!("{}\n", &cmd[5..]), 0),
            other => (format!("{}: command not found\n", other), 127),
        };
        let result = if status == 0 {
            channel.sendall(output.as_bytes()).await
        } else {
            channel.sendall_stderr(output.as_bytes()).await
        };
        if result.is_ok() {
            let _ = channel.send_exit_status(status).await;
        }
        let _ = channel.close().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let bind_addr = env::args().nth(1).unwrap_or_else(|| "127.0.0.1:2222".to_string());

    println!("=== Tessera SSH Server Example ===");
    println!();

    // A real server loads a persistent host key so its identity survives restarts.
    let host_key = Arc::new(Ed25519HostKey::generate(&SystemRandomSource::new())?);
    println!("Host key: {}", fingerprint(&host_key.public_key_bytes()));

    let server = SshServer::bind(
        &bind_addr,
        host_key,
        Arc::new(SimpleHandler),
        TransportConfig::default(),
    )
    .await?;
    println!("Listening on {}", server.local_addr()?);
    println!("Credentials: testuser / testpass");
    println!();

    loop {
        match server.accept().await {
            Ok(transport) => {
                println!("Client connected: {}", transport.remote_version());
                tokio::spawn(async move {
                    transport.wait_closed().await;
                    println!("Client disconnected");
                });
            }
            Err(e) => eprintln!("Handshake failed: {}", e),
        }
    }
}
