//! Relay over a real socket: axum acceptor on one side, tungstenite client on the other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cradle::{EchoWorker, Envelope, RelayConfig, RelayService, WorkerRouter};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

async fn start(follow_up: bool) -> (SocketAddr, Arc<RelayService>, JoinHandle<anyhow::Result<()>>) {
    let router = WorkerRouter::new().route("chat", EchoWorker::new().with_follow_up(follow_up));
    let config = RelayConfig::default().with_poll_interval(Duration::from_millis(20));
    let service = Arc::new(RelayService::new(router, config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(cradle::transport::serve_on(
        listener,
        Arc::clone(&service),
        Duration::from_secs(2),
    ));
    (addr, service, server)
}

/// Collect envelopes until the server closes the socket.
async fn read_until_close<S>(socket: &mut S) -> Vec<Envelope>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut envelopes = Vec::new();
    loop {
        match tokio::time::timeout(WAIT, socket.next()).await.expect("server never closed") {
            Some(Ok(Message::Binary(data))) => envelopes.push(serde_json::from_slice(&data).unwrap()),
            Some(Ok(Message::Text(text))) => panic!("unexpected text frame: {text:?}"),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return envelopes,
            Some(Ok(_)) => {}
        }
    }
}

#[tokio::test]
async fn echo_over_websocket() {
    let (addr, service, server) = start(false).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/main"))
        .await
        .unwrap();
    socket
        .send(Message::text(r#"{"function":"chat","main_input":"hello"}"#))
        .await
        .unwrap();

    let replies = read_until_close(&mut socket).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].chatbot, vec![("hello".to_string(), "hello".to_string())]);
    assert!(!replies[0].is_terminate());

    service.trigger_shutdown();
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn sentinel_from_client_closes_follow_up_session() {
    let (addr, service, server) = start(true).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/main"))
        .await
        .unwrap();
    socket
        .send(Message::text(r#"{"main_input":"first"}"#))
        .await
        .unwrap();

    let first = tokio::time::timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
    assert!(first.is_binary());

    let sentinel = String::from_utf8(Envelope::terminate().to_json_bytes().unwrap()).unwrap();
    socket.send(Message::text(sentinel)).await.unwrap();

    let rest = read_until_close(&mut socket).await;
    assert!(rest.is_empty());

    tokio::time::timeout(WAIT, async {
        while service.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection still tracked after close");

    service.trigger_shutdown();
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn unknown_function_closes_without_reply() {
    let (addr, service, server) = start(false).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/main"))
        .await
        .unwrap();
    socket
        .send(Message::text(r#"{"function":"summarize","main_input":"x"}"#))
        .await
        .unwrap();

    assert!(read_until_close(&mut socket).await.is_empty());

    service.trigger_shutdown();
    tokio::time::timeout(WAIT, server).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn server_shutdown_closes_open_sessions() {
    let (addr, service, server) = start(true).await;

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/main"))
        .await
        .unwrap();
    socket
        .send(Message::text(r#"{"main_input":"stay"}"#))
        .await
        .unwrap();
    let first = tokio::time::timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
    assert!(first.is_binary());

    service.trigger_shutdown();

    let closed_with_frame = loop {
        match tokio::time::timeout(WAIT, socket.next()).await.expect("session never closed") {
            Some(Ok(Message::Close(_))) => break true,
            None | Some(Err(_)) => break false,
            Some(Ok(_)) => {}
        }
    };
    assert!(closed_with_frame);

    tokio::time::timeout(WAIT, server).await.unwrap().unwrap().unwrap();
    assert_eq!(service.active_connections(), 0);
}
