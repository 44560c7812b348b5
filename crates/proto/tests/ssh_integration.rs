//! End-to-end sessions between a tessera client and a tessera server.
//!
//! These tests cover the complete protocol flow:
//! - version exchange and key exchange (group1, group14, group exchange)
//! - password authentication, including a rejected first attempt
//! - command execution with stdout, stderr and exit status
//! - manual key re-exchange in the middle of a transfer

mod common;

use common::*;
use sha2::{Digest, Sha256};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tessera_platform::{ChannelError, TesseraError};
use tessera_proto::ssh::auth_handler::AuthResult;
use tessera_proto::ssh::config::TransportConfig;
use tessera_proto::ssh::connection::ChannelType;
use tessera_proto::ssh::transport::SessionState;
use tokio::time::timeout;

fn group1() -> TransportConfig {
    TransportConfig::default().with_kex(&["diffie-hellman-group1-sha1"])
}

#[tokio::test]
async fn test_group1_password_exec_echo() -> TestResult {
    init_tracing();
    let addr = spawn_tcp_server(TransportConfig::default(), Arc::new(TestServer::new())).await?;
    let client = connect(&addr, group1()).await?;

    let negotiated = client.transport().negotiated().ok_or("no algorithms")?;
    assert_eq!(negotiated.kex, "diffie-hellman-group1-sha1");
    assert_eq!(client.transport().state(), SessionState::KeysActive);

    let result = timeout(STEP, client.authenticate_password(USER, PASSWORD)).await??;
    assert_eq!(result, AuthResult::Success);
    assert_eq!(client.transport().state(), SessionState::Authenticated);

    let output = timeout(STEP, client.execute("echo hi")).await??;
    assert_eq!(output.stdout, b"hi\n");
    assert!(output.stderr.is_empty());
    assert_eq!(output.exit_status, Some(0));

    client.close().await;
    assert_eq!(client.transport().state(), SessionState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_wrong_password_then_right_one() -> TestResult {
    init_tracing();
    let handler = Arc::new(TestServer::new());
    let addr = spawn_tcp_server(TransportConfig::default(), handler.clone()).await?;
    let client = connect(&addr, TransportConfig::default()).await?;

    let err = timeout(STEP, client.authenticate_password(USER, "wrong"))
        .await?
        .unwrap_err();
    match err {
        TesseraError::Auth(e) => assert!(e.allowed_methods.contains(&"password".to_string())),
        other => panic!("expected an auth failure, got {:?}", other),
    }
    assert!(!client.transport().is_authenticated());
    assert!(client.transport().is_active());

    let result = timeout(STEP, client.authenticate_password(USER, PASSWORD)).await??;
    assert_eq!(result, AuthResult::Success);
    assert_eq!(handler.password_attempts.load(Ordering::SeqCst), 2);

    let output = timeout(STEP, client.execute("echo still here")).await??;
    assert_eq!(output.stdout, b"still here\n");
    assert!(output.success());
    Ok(())
}

#[tokio::test]
async fn test_rekey_mid_transfer_preserves_data() -> TestResult {
    init_tracing();
    let (client, server) = duplex_pair(
        TransportConfig::default(),
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;
    let session_id = client.session_id();

    let channel = timeout(STEP, client.open_session()).await??;
    timeout(STEP, channel.exec("cat")).await??;

    let data = pattern(1 << 20);
    let expected = Sha256::digest(&data);
    let reader = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.read_to_end().await })
    };

    let (first, second) = data.split_at(data.len() / 2);
    timeout(STEP, channel.sendall(first)).await??;
    timeout(STEP, client.rekey()).await??;
    timeout(STEP, channel.sendall(second)).await??;
    timeout(STEP, channel.shutdown_write()).await??;

    let echoed = timeout(STEP, reader).await???;
    assert_eq!(echoed.len(), data.len());
    assert_eq!(Sha256::digest(&echoed), expected);
    assert_eq!(timeout(STEP, channel.recv_exit_status()).await??, Some(0));

    assert_eq!(client.kex_rounds(), 2);
    assert_eq!(server.kex_rounds(), 2);
    assert_eq!(client.session_id(), session_id);
    assert_eq!(client.state(), SessionState::Authenticated);

    let output = timeout(STEP, client.run_command("echo after")).await??;
    assert_eq!(output.stdout, b"after\n");
    Ok(())
}

#[tokio::test]
async fn test_group_exchange_kex() -> TestResult {
    init_tracing();
    let config = TransportConfig::default().with_kex(&["diffie-hellman-group-exchange-sha256"]);
    let (client, server) =
        duplex_pair(config.clone(), config, Arc::new(TestServer::new())).await?;
    let negotiated = client.negotiated().ok_or("no algorithms")?;
    assert_eq!(negotiated.kex, "diffie-hellman-group-exchange-sha256");
    assert_eq!(client.session_id(), server.session_id());

    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;
    timeout(STEP, client.rekey()).await??;
    let output = timeout(STEP, client.run_command("stream 100000")).await??;
    assert_eq!(output.stdout, pattern(100_000));
    Ok(())
}

#[tokio::test]
async fn test_first_client_preference_wins() -> TestResult {
    init_tracing();
    let client_config = TransportConfig::default()
        .with_kex(&["diffie-hellman-group14-sha1", "diffie-hellman-group14-sha256"])
        .with_ciphers(&["aes128-cbc", "aes256-ctr"])
        .with_macs(&["hmac-sha1", "hmac-sha2-256"]);
    let (client, server) = duplex_pair(
        client_config,
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    let negotiated = client.negotiated().ok_or("no algorithms")?;
    assert_eq!(negotiated.kex, "diffie-hellman-group14-sha1");
    assert_eq!(negotiated.cipher_client_to_server.name(), "aes128-cbc");
    assert_eq!(negotiated.mac_server_to_client.name(), "hmac-sha1");
    assert_eq!(server.negotiated(), Some(negotiated));

    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;
    let output = timeout(STEP, client.run_command("echo cbc")).await??;
    assert_eq!(output.stdout, b"cbc\n");
    Ok(())
}

#[tokio::test]
async fn test_stderr_and_exit_status() -> TestResult {
    init_tracing();
    let (client, _server) = duplex_pair(
        TransportConfig::default(),
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;

    let output = timeout(STEP, client.run_command("stderr")).await??;
    assert_eq!(output.stdout, b"out\n");
    assert_eq!(output.stderr, b"oops\n");
    assert_eq!(output.exit_status, Some(3));
    assert!(!output.success());

    let output = timeout(STEP, client.run_command("silent")).await??;
    assert_eq!(output.exit_status, None);
    Ok(())
}

#[tokio::test]
async fn test_channel_requests() -> TestResult {
    init_tracing();
    let (client, _server) = duplex_pair(
        TransportConfig::default(),
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;

    let channel = timeout(STEP, client.open_session()).await??;
    timeout(STEP, channel.request_pty("xterm", 80, 24)).await??;
    timeout(STEP, channel.set_environment_variable("LC_ALL", "C")).await??;
    let err = timeout(STEP, channel.set_environment_variable("PATH", "/tmp"))
        .await?
        .unwrap_err();
    assert!(matches!(err, TesseraError::Channel(ChannelError::RequestDenied(_))));
    let err = timeout(STEP, channel.exec("rm -rf /")).await?.unwrap_err();
    assert!(matches!(err, TesseraError::Channel(ChannelError::RequestDenied(_))));
    assert!(channel.is_active());
    timeout(STEP, channel.close()).await??;

    let echo = timeout(STEP, client.open_subsystem("echo")).await??;
    timeout(STEP, echo.sendall(b"ping")).await??;
    let reply = timeout(STEP, echo.recv(16)).await??;
    assert_eq!(reply, b"ping");
    timeout(STEP, echo.close()).await??;

    assert!(timeout(STEP, client.open_subsystem("sftp")).await?.is_err());
    Ok(())
}

#[tokio::test]
async fn test_channel_open_refused() -> TestResult {
    init_tracing();
    let (client, server) = duplex_pair(
        TransportConfig::default(),
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;

    let err = timeout(STEP, client.open_channel(ChannelType::Unknown("x11-ish".into())))
        .await?
        .unwrap_err();
    match err {
        TesseraError::Channel(ChannelError::OpenFailed { reason_code, .. }) => {
            assert_eq!(reason_code, 3)
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(client.channel_count(), 0);

    // Clients refuse channels opened by the server.
    let err = timeout(STEP, server.open_session()).await?.unwrap_err();
    assert!(matches!(
        err,
        TesseraError::Channel(ChannelError::OpenFailed { reason_code: 1, .. })
    ));
    assert!(client.is_active() && server.is_active());
    Ok(())
}

#[tokio::test]
async fn test_global_requests() -> TestResult {
    init_tracing();
    let (client, _server) = duplex_pair(
        TransportConfig::default(),
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;

    // Refused until authenticated.
    let reply = timeout(STEP, client.global_request("ping@tessera", b"x", true)).await??;
    assert_eq!(reply, None);

    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;
    let (a, b) = tokio::join!(
        client.global_request("ping@tessera", b"one", true),
        client.global_request("unknown@tessera", b"", true),
    );
    assert_eq!(a?.as_deref(), Some(&b"one"[..]));
    assert_eq!(b?, None);
    assert_eq!(
        timeout(STEP, client.global_request("ping@tessera", b"", false)).await??,
        None
    );
    Ok(())
}

#[tokio::test]
async fn test_close_wakes_blocked_readers() -> TestResult {
    init_tracing();
    let (client, server) = duplex_pair(
        TransportConfig::default(),
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;
    let channel = timeout(STEP, client.open_session()).await??;
    timeout(STEP, channel.exec("cat")).await??;

    let reader = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.recv(1024).await })
    };
    tokio::task::yield_now().await;
    server.close().await;

    let read = timeout(STEP, reader).await??;
    assert!(matches!(read, Err(TesseraError::SessionClosed(Some(_)))), "{:?}", read);
    timeout(STEP, client.wait_closed()).await?;
    assert!(channel.is_closed());
    assert!(matches!(
        channel.send(b"late").await,
        Err(TesseraError::SessionClosed(_)) | Err(TesseraError::Channel(_))
    ));
    assert!(client.last_error().is_some());
    Ok(())
}

#[tokio::test]
async fn test_keepalive_keeps_session_usable() -> TestResult {
    init_tracing();
    let config = TransportConfig::default()
        .with_keepalive_interval(std::time::Duration::from_millis(20));
    let (client, _server) =
        duplex_pair(config, TransportConfig::default(), Arc::new(TestServer::new())).await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let output = timeout(STEP, client.run_command("echo alive")).await??;
    assert_eq!(output.stdout, b"alive\n");
    Ok(())
}

#[tokio::test]
async fn test_run_command_reports_session_death() -> TestResult {
    init_tracing();
    let (client, server) = duplex_pair(
        TransportConfig::default(),
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;

    let run = {
        let client = client.clone();
        tokio::spawn(async move { client.run_command("hang").await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    server.close().await;

    // A dead session must not look like a command that finished.
    let result = timeout(STEP, run).await??;
    assert!(
        matches!(result, Err(TesseraError::SessionClosed(Some(_)))),
        "{:?}",
        result
    );
    Ok(())
}

#[tokio::test]
async fn test_delayed_zlib_with_rekey() -> TestResult {
    init_tracing();
    let client_config = TransportConfig::default().with_compression(&["zlib@openssh.com"]);
    let (client, server) = duplex_pair(
        client_config,
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    let negotiated = client.negotiated().ok_or("no algorithms")?;
    assert_eq!(negotiated.compression_client_to_server.name(), "zlib@openssh.com");
    assert_eq!(negotiated.compression_server_to_client.name(), "zlib@openssh.com");

    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;
    let output = timeout(STEP, client.run_command("stream 300000")).await??;
    assert_eq!(output.stdout, pattern(300_000));

    let channel = timeout(STEP, client.open_session()).await??;
    timeout(STEP, channel.exec("cat")).await??;
    let data = pattern(1 << 19);
    let reader = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.read_to_end().await })
    };
    let (first, second) = data.split_at(data.len() / 3);
    timeout(STEP, channel.sendall(first)).await??;
    timeout(STEP, client.rekey()).await??;
    timeout(STEP, channel.sendall(second)).await??;
    timeout(STEP, channel.shutdown_write()).await??;
    let echoed = timeout(STEP, reader).await???;
    assert_eq!(Sha256::digest(&echoed), Sha256::digest(&data));

    assert_eq!(client.kex_rounds(), 2);
    assert!(server.is_active());
    Ok(())
}
