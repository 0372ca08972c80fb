//! Relay: peer A reaches peer B through relay node R. R forwards framed
//! packets by name without ever deserializing the payload type (it is not
//! even registered there).

use anyhow::Result;
use mprpc::{
    BasicRelayEngine, Configuration, DnsResolver, MessageFlags, Protocol, Service,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Control message peers send the relay node to claim their relay name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Register {
    name: String,
}

/// Application payload relayed from A to B; the relay node does not know
/// this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payload {
    text: String,
    blob: Vec<u8>,
}

const REGISTER_TYPE: u16 = 1;
const PAYLOAD_TYPE: u16 = 2;

async fn start_relay_node() -> Result<Service> {
    let mut proto = Protocol::new(1, 0);
    proto
        .register::<Register>(REGISTER_TYPE, "Register")
        .with_receive(|ctx, msg: Register| {
            ctx.register_relay_name(&msg.name)
                .expect("relay name registered");
        });
    // Deliberately no Payload registration: the relay must forward frames
    // it cannot decode.
    let mut config = Configuration::new(Arc::new(proto)).with_listener("127.0.0.1:0");
    config.relay = Some(BasicRelayEngine::new());
    Ok(Service::start(config).await?)
}

async fn start_peer() -> Result<(Service, Arc<Mutex<Vec<(Payload, MessageFlags)>>>)> {
    let received: Arc<Mutex<Vec<(Payload, MessageFlags)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_hook = received.clone();

    let mut proto = Protocol::new(1, 0);
    proto.register::<Register>(REGISTER_TYPE, "Register");
    proto
        .register::<Payload>(PAYLOAD_TYPE, "Payload")
        .with_receive(move |ctx, msg: Payload| {
            received_hook
                .lock()
                .unwrap()
                .push((msg, ctx.request_flags()));
        });
    let service = Service::start(
        Configuration::new(Arc::new(proto)).with_resolver(Arc::new(DnsResolver::new())),
    )
    .await?;
    Ok((service, received))
}

#[tokio::test]
async fn message_reaches_peer_through_relay_node() -> Result<()> {
    init_tracing();
    let relay = start_relay_node().await?;
    let relay_addr = relay.start_status().listen_addrs[0].to_string();

    let (peer_b, received_b) = start_peer().await?;
    let (peer_a, _received_a) = start_peer().await?;

    // B claims its name on the relay node, then A addresses it by name.
    peer_b.send_message(
        relay_addr.as_str(),
        Register {
            name: "b".to_owned(),
        },
        MessageFlags::empty(),
    )?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // A multi-packet payload exercises framed forwarding, not just a
    // single-fragment shortcut.
    let sent = Payload {
        text: "across the boundary".to_owned(),
        blob: (0..60_000u32).map(|i| i as u8).collect(),
    };
    peer_a.send_relayed_message(
        relay_addr.as_str(),
        "b",
        sent.clone(),
        MessageFlags::empty(),
    )?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if !received_b.lock().unwrap().is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "relayed message never arrived"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (got, flags) = received_b.lock().unwrap().remove(0);
    assert_eq!(got, sent, "payload must survive the relay byte-identical");
    assert!(
        flags.has(MessageFlags::RELAYED),
        "delivery must be marked as relayed"
    );

    // The relay node moved packets without invoking any deserializer: its
    // statistics show relayed traffic, not received messages of that type.
    let stats = relay.statistic();
    assert!(stats.messages_relayed >= 1);

    peer_a.stop().await;
    peer_b.stop().await;
    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn relaying_to_an_unknown_name_delivers_nothing() -> Result<()> {
    init_tracing();
    let relay = start_relay_node().await?;
    let relay_addr = relay.start_status().listen_addrs[0].to_string();
    let (peer_a, _) = start_peer().await?;

    peer_a.send_relayed_message(
        relay_addr.as_str(),
        "nobody",
        Payload {
            text: "void".to_owned(),
            blob: vec![0; 128],
        },
        MessageFlags::empty(),
    )?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The message is dropped at the relay; nothing was forwarded.
    assert_eq!(relay.statistic().messages_relayed, 0);

    peer_a.stop().await;
    relay.stop().await;
    Ok(())
}
