//! Keep-alive sustains an idle connection; the server tolerates the
//! configured number of keep-alive-only inactivity windows.

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
struct Ping {
    idx: u32,
}

#[tokio::test]
async fn idle_connection_survives_on_keepalive() -> Result<()> {
    init_tracing();
    let stops = Arc::new(AtomicUsize::new(0));
    let stops_server = stops.clone();

    let mut proto = Protocol::new(1, 0);
    proto
        .register::<Ping>(1, "Ping")
        .with_receive(|ctx, msg: Ping| {
            ctx.service()
                .send_response(ctx, msg)
                .expect("response admitted");
        });
    // Timers scaled down from the production defaults so the test runs in
    // seconds: the client keeps alive every 100ms, the server windows are
    // 500ms and tolerate 4 keep-alive-only windows in a row.
    let mut server_config =
        Configuration::new(Arc::new(proto)).with_listener("127.0.0.1:0");
    server_config.inactivity_timeout = Duration::from_millis(500);
    server_config.inactivity_keepalive_count = 4;
    server_config.keepalive_timeout = Duration::ZERO;
    server_config.connection_hooks.on_stop = Some(Arc::new(move |_ctx, err| {
        if err.is_some() {
            stops_server.fetch_add(1, Ordering::SeqCst);
        }
    }));
    let server = Service::start(server_config).await?;
    let addr = server.start_status().listen_addrs[0].to_string();

    let mut proto = Protocol::new(1, 0);
    proto.register::<Ping>(1, "Ping");
    let mut client_config =
        Configuration::new(Arc::new(proto)).with_resolver(Arc::new(DnsResolver::new()));
    client_config.keepalive_timeout = Duration::from_millis(100);
    client_config.inactivity_timeout = Duration::from_secs(60);
    let client = Service::start(client_config).await?;

    let round_trip = |idx: u32| {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        client
            .send_request(
                addr.as_str(),
                Ping { idx },
                move |_ctx, _sent: Option<Ping>, recv: Option<Ping>, err| {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send((recv, err.cloned()));
                    }
                },
            )
            .expect("request admitted");
        rx
    };

    // Establish the connection with one exchange.
    let (recv, err) = tokio::time::timeout(Duration::from_secs(5), round_trip(1))
        .await
        .expect("first round trip")?;
    assert!(err.is_none());
    assert_eq!(recv.map(|p| p.idx), Some(1));

    // Stay application-idle across three full inactivity windows.
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert_eq!(
        stops.load(Ordering::SeqCst),
        0,
        "server failed the idle connection"
    );

    // The connection is still usable afterwards.
    let (recv, err) = tokio::time::timeout(Duration::from_secs(5), round_trip(2))
        .await
        .expect("second round trip")?;
    assert!(err.is_none());
    assert_eq!(recv.map(|p| p.idx), Some(2));

    client.stop().await;
    server.stop().await;
    Ok(())
}
