//! Synchronous request/reply correlation.

use serde::{Deserialize, Serialize};

use msgport::{
    processor_fn, LocalHub, Payload, Protocol, TransportClient, TransportConfig, TransportError,
    TransportServer,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config(protocol: Protocol) -> TransportConfig {
    TransportConfig::new(protocol)
        .with_core_pool_size(1)
        .with_max_pool_size(2)
}

#[tokio::test]
async fn ping_gets_the_literal_pong_back() {
    init_tracing();
    let processor = processor_fn(|message| {
        assert_eq!(message, Payload::from("ping"));
        Ok(Some(Payload::from("pong")))
    });
    let server = TransportServer::new(
        test_config(Protocol::Tcp).with_sync(true).with_textline(true),
        processor,
    )
    .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TransportClient::new(
        test_config(Protocol::Tcp)
            .with_port(port)
            .with_sync(true)
            .with_textline(true),
    )
    .unwrap();
    client.start().await.unwrap();

    let reply = client.request("ping").await.unwrap();
    assert_eq!(reply, Payload::from("pong"));

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn local_sync_exchange_correlates() {
    init_tracing();
    let hub = LocalHub::new();
    let processor = processor_fn(|message| {
        let text = message.into_text()?;
        Ok(Some(Payload::from(format!("{} indeed", text))))
    });
    let server = TransportServer::new(
        test_config(Protocol::Local)
            .with_local_address_name("sync")
            .with_sync(true)
            .with_textline(true),
        processor,
    )
    .unwrap()
    .with_hub(hub.clone());
    server.start().await.unwrap();

    let client = TransportClient::new(
        test_config(Protocol::Local)
            .with_local_address_name("sync")
            .with_sync(true)
            .with_textline(true),
    )
    .unwrap()
    .with_hub(hub);
    client.start().await.unwrap();

    let reply = client.request("it works").await.unwrap();
    assert_eq!(reply, Payload::from("it works indeed"));

    client.stop().await;
    server.stop().await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
    confirmed: bool,
}

#[tokio::test]
async fn structured_payload_round_trips_with_one_field_changed() {
    init_tracing();
    let hub = LocalHub::new();
    let processor = processor_fn(|message| {
        let mut order: Order = serde_json::from_slice(&message.to_bytes())
            .map_err(|e| TransportError::conversion_error(e.to_string()))?;
        order.confirmed = true;
        let body = serde_json::to_vec(&order)
            .map_err(|e| TransportError::conversion_error(e.to_string()))?;
        Ok(Some(Payload::from(body)))
    });
    let server = TransportServer::new(
        test_config(Protocol::Local)
            .with_local_address_name("orders")
            .with_sync(true),
        processor,
    )
    .unwrap()
    .with_hub(hub.clone());
    server.start().await.unwrap();

    let client = TransportClient::new(
        test_config(Protocol::Local)
            .with_local_address_name("orders")
            .with_sync(true),
    )
    .unwrap()
    .with_hub(hub);
    client.start().await.unwrap();

    let order = Order {
        id: 7,
        item: "beer".to_string(),
        confirmed: false,
    };
    let reply = client
        .request(serde_json::to_vec(&order).unwrap())
        .await
        .unwrap();
    let echoed: Order = serde_json::from_slice(&reply.to_bytes()).unwrap();

    assert_eq!(
        echoed,
        Order {
            confirmed: true,
            ..order
        }
    );

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn concurrent_producers_each_get_their_own_reply() {
    init_tracing();
    let processor = processor_fn(|message| {
        let text = message.into_text()?;
        Ok(Some(Payload::from(format!("{}-pong", text))))
    });
    let server = TransportServer::new(
        test_config(Protocol::Tcp).with_sync(true).with_textline(true),
        processor,
    )
    .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let mut tasks = Vec::new();
    for i in 0..8 {
        tasks.push(tokio::spawn(async move {
            let client = TransportClient::new(
                test_config(Protocol::Tcp)
                    .with_port(port)
                    .with_sync(true)
                    .with_textline(true),
            )
            .unwrap();
            client.start().await.unwrap();
            let reply = client.request(format!("req-{}", i)).await.unwrap();
            client.stop().await;
            (i, reply)
        }));
    }

    for task in tasks {
        let (i, reply) = task.await.unwrap();
        assert_eq!(reply, Payload::from(format!("req-{}-pong", i)));
    }

    server.stop().await;
}

#[tokio::test]
async fn silent_peer_times_out_when_configured() {
    init_tracing();
    // sync endpoint whose processor never produces a reply
    let processor = processor_fn(|_message| Ok(None));
    let server = TransportServer::new(
        test_config(Protocol::Tcp).with_sync(true).with_textline(true),
        processor,
    )
    .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TransportClient::new(
        test_config(Protocol::Tcp)
            .with_port(port)
            .with_sync(true)
            .with_textline(true)
            .with_request_timeout_millis(200),
    )
    .unwrap();
    client.start().await.unwrap();

    let err = client.request("anyone there").await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout { .. }));

    client.stop().await;
    server.stop().await;
}
