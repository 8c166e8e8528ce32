use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde_json::Value;

use axon::protocol::{Action, ProtocolMessage};
use axon::transport::{ConnectionState, TransportConnection};

#[derive(Clone)]
pub struct LoadConfig {
    pub url: String,
    pub connections: usize,
    pub messages_per_sec: u64,
    pub duration: Duration,
    pub channel: String,
    pub payload: Value,
}

/// Drives `connections` concurrent publishers, each attaching to the soak
/// channel and publishing the payload at the configured rate while a receive
/// task counts acks.
pub async fn run_load_test(config: LoadConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Testing {} with {} connections at {} msg/s for {:?}",
        config.url, config.connections, config.messages_per_sec, config.duration
    );

    let mut workers = Vec::with_capacity(config.connections);

    for worker in 0..config.connections {
        let config = config.clone();

        workers.push(tokio::spawn(async move {
            if let Err(e) = run_connection(worker, config).await {
                error!("[worker {}] failed: {}", worker, e);
            }
        }));

        // Ramp up instead of stampeding the server.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for worker in workers {
        let _ = worker.await;
    }

    info!("All connections closed.");

    Ok(())
}

async fn run_connection(
    worker: usize,
    config: LoadConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let conn = Arc::new(TransportConnection::new(config.url.clone()));
    let failed = Arc::new(AtomicBool::new(false));
    let acked = Arc::new(AtomicU64::new(0));

    {
        let failed = Arc::clone(&failed);
        conn.on_state_change(Box::new(move |state, fault| match state {
            ConnectionState::Error => {
                match fault {
                    Some(fault) => error!("[worker {}] connection error: {}", worker, fault),
                    None => error!("[worker {}] connection error", worker),
                }
                failed.store(true, Ordering::Relaxed);
            }
            other => debug!("[worker {}] state: {:?}", worker, other),
        }));
    }

    conn.connect();

    let receive_conn = Arc::clone(&conn);
    let receive_acked = Arc::clone(&acked);
    let receive = tokio::spawn(async move {
        let result = receive_conn.receive(|text| match ProtocolMessage::decode(&text) {
            Ok(msg) if msg.action == Action::Ack => {
                debug!("[worker {}] acked up to serial {}", worker, msg.msg_serial);
                receive_acked.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e) => warn!("[worker {}] undecodable message: {}", worker, e),
        });

        if let Err(e) = result.await {
            debug!("[worker {}] receive loop ended: {}", worker, e);
        }
    });

    conn.send_text(ProtocolMessage::attach(&config.channel).encode()?)?;

    let start = Instant::now();
    let mut serial = 0i64;
    let period = (1_000_000 / config.messages_per_sec.max(1)).max(1);
    let mut ticker = tokio::time::interval(Duration::from_micros(period));

    while start.elapsed() < config.duration && !failed.load(Ordering::Relaxed) {
        ticker.tick().await;

        let msg = ProtocolMessage::message(&config.channel, serial, config.payload.clone());
        conn.send_text(msg.encode()?)?;
        serial += 1;
    }

    conn.disconnect().await;
    let _ = receive.await;

    info!(
        "[worker {}] sent {} messages, {} ack envelopes, {} left in queue",
        worker,
        serial,
        acked.load(Ordering::Relaxed),
        conn.queue_depth()
    );

    Ok(())
}
