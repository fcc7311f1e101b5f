// tests/pubsub_receive.rs

//! End-to-end `Receive` behavior: dispatches `message` pushes to the
//! caller's handler and returns cleanly once the server confirms the
//! subscription count has dropped back to zero.

mod support;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spineldb_client::command::Command;
use spineldb_client::config::{Address, ClientOptions};
use spineldb_client::Client;

fn opts_for(addr: std::net::SocketAddr) -> ClientOptions {
    let mut opts = ClientOptions::default();
    opts.addresses = vec![Address::Tcp { host: addr.ip().to_string(), port: addr.port() }];
    opts.dial_timeout = Duration::from_secs(2);
    opts
}

#[tokio::test]
async fn receive_dispatches_messages_and_returns_on_unsubscribe() {
    // One HELLO handshake for the client's shared pipelining wire (dialed
    // eagerly by `Client::connect`), one more for the dedicated wire that
    // `receive` borrows to run SUBSCRIBE.
    let script = VecDeque::from([
        support::reply("HELLO", support::hello3_reply()),
        support::reply("HELLO", support::hello3_reply()),
    ]);
    let server = support::MockServer::start(script).await;
    let addr = server.addr;

    let client = Arc::new(Client::connect(opts_for(addr)).await.unwrap());
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = received.clone();

    let (_cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    let client_for_task = client.clone();
    let handle = tokio::spawn(async move {
        client_for_task
            .receive(Command::new(["SUBSCRIBE", "ch"]), move |msg| {
                if let Ok(payload) = msg.into_array().map(|v| v.last().cloned()) {
                    if let Some(m) = payload {
                        if let Ok(s) = m.into_string() {
                            received_clone.lock().unwrap().push(s);
                        }
                    }
                }
            }, cancel_rx)
            .await
    });

    // Give the subscribe command a moment to be sent, then simulate the
    // server's acknowledgment, one message, and a clean unsubscribe.
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.push(b">3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n".to_vec());
    server.push(b">3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n".to_vec());
    server.push(b">3\r\n$11\r\nunsubscribe\r\n$2\r\nch\r\n:0\r\n".to_vec());

    let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(*received.lock().unwrap(), vec!["hello".to_string()]);
}
