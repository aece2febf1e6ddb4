//! Round-trip delivery across all three transports.

use std::sync::Arc;

use tokio::sync::mpsc;

use msgport::{
    processor_fn, LocalHub, MessageProcessor, Payload, Protocol, TransportClient, TransportConfig,
    TransportServer,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Lean pool sizing so every test does not spin up large runtimes.
fn test_config(protocol: Protocol) -> TransportConfig {
    TransportConfig::new(protocol)
        .with_core_pool_size(1)
        .with_max_pool_size(2)
}

/// Processor that records every inbound message and produces no reply.
fn capture_processor() -> (Arc<dyn MessageProcessor>, mpsc::UnboundedReceiver<Payload>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let processor = processor_fn(move |message| {
        let _ = tx.send(message);
        Ok(None)
    });
    (processor, rx)
}

#[tokio::test]
async fn tcp_delivers_bytes_unchanged() {
    init_tracing();
    let (processor, mut received) = capture_processor();
    let server = TransportServer::new(test_config(Protocol::Tcp).with_sync(false), processor)
        .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TransportClient::new(
        test_config(Protocol::Tcp).with_port(port).with_sync(false),
    )
    .unwrap();
    client.start().await.unwrap();

    let body = vec![0x00u8, 0x01, 0xfe, 0xff];
    client.dispatch(body.clone()).await.unwrap();

    let message = received.recv().await.unwrap();
    assert_eq!(message.to_bytes().as_ref(), &body[..]);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn udp_delivers_bytes_unchanged() {
    init_tracing();
    let (processor, mut received) = capture_processor();
    let server = TransportServer::new(test_config(Protocol::Udp).with_sync(false), processor)
        .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TransportClient::new(
        test_config(Protocol::Udp).with_port(port).with_sync(false),
    )
    .unwrap();
    client.start().await.unwrap();

    let body = b"datagram payload".to_vec();
    client.dispatch(body.clone()).await.unwrap();

    let message = received.recv().await.unwrap();
    assert_eq!(message.to_bytes().as_ref(), &body[..]);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn local_delivers_bytes_unchanged() {
    init_tracing();
    let hub = LocalHub::new();
    let (processor, mut received) = capture_processor();
    let server = TransportServer::new(
        test_config(Protocol::Local)
            .with_local_address_name("roundtrip")
            .with_sync(false),
        processor,
    )
    .unwrap()
    .with_hub(hub.clone());
    server.start().await.unwrap();

    let client = TransportClient::new(
        test_config(Protocol::Local)
            .with_local_address_name("roundtrip")
            .with_sync(false),
    )
    .unwrap()
    .with_hub(hub);
    client.start().await.unwrap();

    let body = b"in-process payload".to_vec();
    client.dispatch(body.clone()).await.unwrap();

    let message = received.recv().await.unwrap();
    assert_eq!(message.to_bytes().as_ref(), &body[..]);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn textline_appends_delimiter_and_decodes_back() {
    init_tracing();
    let (processor, mut received) = capture_processor();
    let server = TransportServer::new(
        test_config(Protocol::Tcp).with_sync(false).with_textline(true),
        processor,
    )
    .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TransportClient::new(
        test_config(Protocol::Tcp)
            .with_port(port)
            .with_sync(false)
            .with_textline(true),
    )
    .unwrap();
    client.start().await.unwrap();

    client.dispatch("first line").await.unwrap();
    client.dispatch("second line").await.unwrap();

    // the delimiter went on the wire and came back off
    assert_eq!(received.recv().await.unwrap(), Payload::from("first line"));
    assert_eq!(received.recv().await.unwrap(), Payload::from("second line"));

    client.stop().await;
    server.stop().await;
}
