//! Packet layer and transport behaviour under concurrency: sequence
//! numbering, flow control with small windows, and automatic rekeying.

mod common;

use common::*;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tessera_platform::SystemRandomSource;
use tessera_proto::ssh::config::TransportConfig;
use tessera_proto::ssh::message::MessageType;
use tessera_proto::ssh::packet::{Packetizer, RekeyPolicy};
use tokio::time::timeout;

#[tokio::test]
async fn test_concurrent_senders_share_one_sequence() -> TestResult {
    init_tracing();
    let (a, b) = tokio::io::duplex(1 << 16);
    let sender = Arc::new(Packetizer::from_stream(
        a,
        RekeyPolicy::default(),
        SystemRandomSource::shared(),
    ));
    let receiver = Packetizer::from_stream(b, RekeyPolicy::default(), SystemRandomSource::shared());

    let mut tasks = Vec::new();
    for task in 0u8..8 {
        let sender = Arc::clone(&sender);
        tasks.push(tokio::spawn(async move {
            let mut sequences = Vec::new();
            for n in 0u8..50 {
                let payload = [MessageType::Ignore as u8, task, n, task ^ n];
                sequences.push(sender.send_message(&payload).await?);
            }
            Ok::<_, tessera_platform::TesseraError>(sequences)
        }));
    }

    let mut last_from = [None::<u8>; 8];
    for expected in 0u32..400 {
        let msg = timeout(STEP, receiver.read_message()).await??;
        assert_eq!(msg.sequence, expected);
        let (task, n) = (msg.payload[1], msg.payload[2]);
        assert_eq!(msg.payload[3], task ^ n, "payload torn");
        // Each task's messages arrive in its own send order.
        if let Some(prev) = last_from[task as usize] {
            assert_eq!(n, prev + 1);
        }
        last_from[task as usize] = Some(n);
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await??);
    }
    all.sort_unstable();
    assert_eq!(all, (0u32..400).collect::<Vec<_>>());
    assert_eq!(sender.outbound_sequence().await, 400);
    Ok(())
}

#[tokio::test]
async fn test_small_window_bulk_transfer() -> TestResult {
    init_tracing();
    let small = TransportConfig::default()
        .with_window_size(4096)
        .with_max_packet_size(1024);
    let (client, _server) =
        duplex_pair(small.clone(), small, Arc::new(TestServer::new())).await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;

    let output = timeout(STEP, client.run_command("stream 300000")).await??;
    assert_eq!(output.stdout.len(), 300_000);
    assert_eq!(output.stdout, pattern(300_000));

    let channel = timeout(STEP, client.open_session()).await??;
    timeout(STEP, channel.exec("cat")).await??;
    let sent = n_random_bytes(200_000);
    let reader = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.read_to_end().await })
    };
    for chunk in sent.chunks(7_000) {
        let n = timeout(STEP, channel.send(chunk)).await??;
        // One call never exceeds the peer's packet size.
        assert!(n <= 1024 - 9 && n > 0);
        timeout(STEP, channel.sendall(&chunk[n..])).await??;
    }
    timeout(STEP, channel.shutdown_write()).await??;
    let echoed = timeout(STEP, reader).await???;
    assert_eq!(echoed, sent);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_senders_on_one_channel() -> TestResult {
    init_tracing();
    let small = TransportConfig::default()
        .with_window_size(2048)
        .with_max_packet_size(512);
    let (client, _server) =
        duplex_pair(small.clone(), small, Arc::new(TestServer::new())).await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;

    let channel = timeout(STEP, client.open_session()).await??;
    timeout(STEP, channel.exec("cat")).await??;
    let reader = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.read_to_end().await })
    };

    let mut writers = Vec::new();
    for byte in [b'a', b'b', b'c', b'd'] {
        let channel = channel.clone();
        writers.push(tokio::spawn(async move {
            channel.sendall(&vec![byte; 20_000]).await
        }));
    }
    for writer in writers {
        timeout(STEP, writer).await???;
    }
    timeout(STEP, channel.shutdown_write()).await??;

    let echoed = timeout(STEP, reader).await???;
    assert_eq!(echoed.len(), 80_000);
    for byte in [b'a', b'b', b'c', b'd'] {
        assert_eq!(echoed.iter().filter(|b| **b == byte).count(), 20_000);
    }
    Ok(())
}

#[tokio::test]
async fn test_parallel_channels() -> TestResult {
    init_tracing();
    let (client, _server) = duplex_pair(
        TransportConfig::default(),
        TransportConfig::default(),
        Arc::new(TestServer::new()),
    )
    .await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;

    let mut runs = Vec::new();
    for i in 0..6 {
        let client = client.clone();
        runs.push(tokio::spawn(async move {
            client.run_command(&format!("echo {}", i)).await
        }));
    }
    for (i, run) in runs.into_iter().enumerate() {
        let output = timeout(STEP, run).await???;
        assert_eq!(output.stdout, format!("{}\n", i).into_bytes());
    }
    // Fully closed channels leave the table.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(client.channel_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_packet_threshold_triggers_rekey() -> TestResult {
    init_tracing();
    let eager = TransportConfig::default()
        .with_max_packet_size(1024)
        .with_rekey(RekeyPolicy {
            max_packets: 64,
            max_bytes: 1 << 30,
            grace_packets: 20,
        });
    let (client, server) =
        duplex_pair(eager, TransportConfig::default(), Arc::new(TestServer::new())).await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;
    let session_id = client.session_id();

    let output = timeout(STEP, client.run_command("stream 200000")).await??;
    assert_eq!(output.stdout, pattern(200_000));

    assert!(client.kex_rounds() > 1, "no rekey after {} rounds", client.kex_rounds());
    assert_eq!(client.session_id(), session_id);
    assert!(client.is_active(), "{:?}", client.last_error());
    assert!(server.is_active());
    Ok(())
}

#[tokio::test]
async fn test_small_grace_survives_bulk_transfer() -> TestResult {
    init_tracing();
    // Both directions are saturated with channel data when the threshold
    // trips; only non-data packets after our KEXINIT count against grace.
    let eager = TransportConfig::default()
        .with_max_packet_size(1024)
        .with_rekey(RekeyPolicy {
            max_packets: 40,
            max_bytes: 1 << 30,
            grace_packets: 5,
        });
    let (client, server) =
        duplex_pair(eager, TransportConfig::default(), Arc::new(TestServer::new())).await?;
    timeout(STEP, client.auth_password(USER, PASSWORD)).await??;

    let channel = timeout(STEP, client.open_session()).await??;
    timeout(STEP, channel.exec("cat")).await??;
    let data = pattern(300_000);
    let reader = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.read_to_end().await })
    };
    timeout(STEP, channel.sendall(&data)).await??;
    timeout(STEP, channel.shutdown_write()).await??;
    let echoed = timeout(STEP, reader).await???;
    assert_eq!(echoed, data);

    assert!(client.kex_rounds() > 2, "only {} rounds", client.kex_rounds());
    assert!(client.is_active(), "{:?}", client.last_error());
    assert!(server.is_active());
    Ok(())
}

fn n_random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x7e55e4a);
    (0..len).map(|_| rng.gen()).collect()
}
