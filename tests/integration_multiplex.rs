//! Many concurrent requests on one connection: all complete, responses may
//! arrive in any order.

use anyhow::Result;
use mprpc::{Configuration, DnsResolver, Protocol, Service};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Request {
    idx: u32,
    payload: Vec<u8>,
}

#[tokio::test]
async fn ten_requests_back_to_back_all_complete() -> Result<()> {
    init_tracing();
    let mut proto = Protocol::new(1, 0);
    proto
        .register::<Request>(1, "Request")
        .with_receive(|ctx, msg: Request| {
            ctx.service()
                .send_response(ctx, msg)
                .expect("response admitted");
        });
    let server = Service::start(
        Configuration::new(Arc::new(proto)).with_listener("127.0.0.1:0"),
    )
    .await?;
    let addr = server.start_status().listen_addrs[0].to_string();

    let mut proto = Protocol::new(1, 0);
    proto.register::<Request>(1, "Request");
    let client = Service::start(
        Configuration::new(Arc::new(proto)).with_resolver(Arc::new(DnsResolver::new())),
    )
    .await?;

    let completed: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    for idx in 0..10u32 {
        let completed = completed.clone();
        // Vary payload sizes so the responses genuinely interleave across
        // packets rather than each fitting a single one.
        let payload = vec![idx as u8; 20_000 + (idx as usize % 3) * 40_000];
        client.send_request(
            addr.as_str(),
            Request { idx, payload },
            move |_ctx, sent: Option<Request>, recv: Option<Request>, err| {
                assert!(err.is_none(), "request {} failed: {:?}", idx, err);
                let sent = sent.expect("sent message returned");
                let recv = recv.expect("response present");
                assert_eq!(sent.idx, idx);
                assert_eq!(recv.idx, idx, "response id must match its request");
                assert_eq!(recv.payload, sent.payload);
                completed.lock().unwrap().push(idx);
            },
        )?;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if completed.lock().unwrap().len() == 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {} of 10 requests completed",
            completed.lock().unwrap().len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut ids = completed.lock().unwrap().clone();
    ids.sort_unstable();
    assert_eq!(ids, (0..10).collect::<Vec<_>>());

    client.stop().await;
    server.stop().await;
    Ok(())
}
