//! Cancellation of a large in-flight message: the sender's completion fires
//! with `Canceled`, the receiver never sees the message.

use anyhow::Result;
use mprpc::{Configuration, DnsResolver, Protocol, Service};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Stream {
    bytes: Vec<u8>,
}

#[tokio::test]
async fn cancel_mid_stream_reaches_neither_side() -> Result<()> {
    init_tracing();
    let received = Arc::new(AtomicUsize::new(0));
    let received_server = received.clone();

    let mut proto = Protocol::new(1, 0);
    proto
        .register::<Stream>(1, "Stream")
        .with_receive(move |_ctx, _msg: Stream| {
            received_server.fetch_add(1, Ordering::SeqCst);
        });
    let server = Service::start(
        Configuration::new(Arc::new(proto)).with_listener("127.0.0.1:0"),
    )
    .await?;
    let addr = server.start_status().listen_addrs[0].to_string();

    let mut proto = Protocol::new(1, 0);
    proto.register::<Stream>(1, "Stream");
    let client = Service::start(
        Configuration::new(Arc::new(proto)).with_resolver(Arc::new(DnsResolver::new())),
    )
    .await?;

    // Large enough to span thousands of packets: the cancel lands while
    // fragments are still being emitted.
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    let msg_id = client.send_request(
        addr.as_str(),
        Stream {
            bytes: vec![0x42; 8 * 1024 * 1024],
        },
        move |_ctx, _sent: Option<Stream>, recv: Option<Stream>, err| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send((err.cloned(), recv.is_some()));
            }
        },
    )?;
    client.cancel_message(addr.as_str(), msg_id)?;

    let (err, got_response) = tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("completion within deadline")?;
    assert!(
        matches!(err, Some(mprpc::Error::Canceled)),
        "expected Canceled, got {:?}",
        err
    );
    assert!(!got_response);

    // The peer must never dispatch the canceled message.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(received.load(Ordering::SeqCst), 0);

    // Cancellation is idempotent at any state.
    client.cancel_message(addr.as_str(), msg_id)?;

    client.stop().await;
    server.stop().await;
    Ok(())
}
