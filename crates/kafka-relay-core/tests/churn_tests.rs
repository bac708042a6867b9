//! Connection churn and sustained throughput.
//!
//! The churn cycle count defaults to a CI-friendly value; set
//! `KAFKA_RELAY_CHURN_CYCLES=100000` for the full run:
//! `cargo test --release --test churn_tests -- --nocapture`

use std::time::Duration;

use bytes::{BufMut, BytesMut};

use kafka_relay_core::testing::{
    api_keys, responses, wait_for, RelayTestHarness, TestHarnessBuilder,
};
use kafka_relay_core::ProxyMetrics;

const LIMIT: Duration = Duration::from_secs(10);

fn churn_cycles() -> usize {
    std::env::var("KAFKA_RELAY_CHURN_CYCLES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(2_000)
}

#[cfg(target_os = "linux")]
fn open_descriptors() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_close_cycles_do_not_leak_descriptors() {
    let cycles = churn_cycles();
    // Hung-up clients may still hold a slot while the next ones arrive.
    let harness = TestHarnessBuilder::new()
        .max_connections(cycles + 100)
        .build()
        .await;
    let metrics = harness.metrics();
    let request = responses::raw_request(api_keys::FETCH, 12, 1, b"churn");

    // Warm up the runtime so its own descriptors are in the baseline.
    for _ in 0..20 {
        let mut client = harness.connect(1).await;
        client.send(&request).await.unwrap();
        client.recv_within(LIMIT).await.unwrap().unwrap();
    }
    assert!(wait_for(LIMIT, || metrics.active_connection_pairs.get() == 0).await);
    let baseline = open_descriptors();

    for cycle in 0..cycles {
        let broker_id = if cycle % 2 == 0 { 1 } else { 2 };
        let mut client = harness.connect(broker_id).await;
        if cycle % 10 == 0 {
            // Some cycles exchange a frame, the rest hang up at once.
            client.send(&request).await.unwrap();
            client.recv_within(LIMIT).await.unwrap().unwrap();
        }
        drop(client);
    }

    assert!(
        wait_for(LIMIT, || metrics.active_connection_pairs.get() == 0).await,
        "pairs still open: {}",
        metrics.active_connection_pairs.get()
    );
    assert!(
        wait_for(LIMIT, || open_descriptors() <= baseline + 4).await,
        "descriptors grew from {baseline} to {}",
        open_descriptors()
    );
    assert_eq!(harness.manager.active_pairs(), 0);

    let accepted = ProxyMetrics::counter_value(&metrics.connections_accepted, "1")
        + ProxyMetrics::counter_value(&metrics.connections_accepted, "2");
    assert_eq!(accepted as usize, cycles + 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pipelined_clients_lose_nothing() {
    const CLIENTS: i32 = 4;
    const FRAMES: i32 = 5_000;
    const WINDOW: usize = 250;

    let harness = RelayTestHarness::new().await;
    let mut tasks = Vec::new();

    for client_no in 0..CLIENTS {
        let mut client = harness.connect(1 + client_no % 2).await;
        tasks.push(tokio::spawn(async move {
            let mut received = 0;
            // Pipeline a window of frames at a time so neither socket buffer fills.
            for window in (0..FRAMES).collect::<Vec<_>>().chunks(WINDOW) {
                let mut wire = BytesMut::new();
                for id in window {
                    let payload = [client_no.to_be_bytes(), id.to_be_bytes()].concat();
                    let request = responses::raw_request(api_keys::FETCH, 12, *id, &payload);
                    wire.put_u32(request.len() as u32);
                    wire.extend_from_slice(&request);
                }
                client.send_raw(&wire).await.unwrap();

                for _ in window {
                    let Ok(Some(frame)) = client.recv_within(LIMIT).await else {
                        return received;
                    };
                    let id = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                    assert_eq!(id, received, "client {client_no} saw a gap or duplicate");
                    received += 1;
                }
            }
            received
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), FRAMES);
    }

    let metrics = harness.metrics();
    let total = u64::from((CLIENTS * FRAMES) as u32);
    assert_eq!(
        ProxyMetrics::counter_value(&metrics.frames_relayed, "client_to_broker"),
        total
    );
    assert!(
        wait_for(LIMIT, || {
            ProxyMetrics::counter_value(&metrics.frames_relayed, "broker_to_client") == total
        })
        .await
    );
}
