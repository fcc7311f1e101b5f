// tests/wire_handshake.rs

//! End-to-end handshake and pipelining behavior of [`Wire`] against a
//! scripted mock server: RESP3 negotiation, command/reply round-trips, and
//! contiguous `DoMulti` pipelining.

mod support;

use std::collections::VecDeque;
use std::time::Duration;

use spineldb_client::command::Command;
use spineldb_client::config::{Address, ClientOptions};
use spineldb_client::wire::Wire;

fn opts_for(addr: std::net::SocketAddr) -> ClientOptions {
    let mut opts = ClientOptions::default();
    opts.addresses = vec![Address::Tcp { host: addr.ip().to_string(), port: addr.port() }];
    opts.dial_timeout = Duration::from_secs(2);
    opts
}

#[tokio::test]
async fn hello3_negotiates_resp3() {
    let script = VecDeque::from([support::reply("HELLO", support::hello3_reply())]);
    let server = support::MockServer::start(script).await;
    let addr = server.addr;

    let wire = Wire::connect(&Address::Tcp { host: addr.ip().to_string(), port: addr.port() }, &opts_for(addr))
        .await
        .unwrap();
    assert_eq!(wire.protocol_version(), 3);
}

#[tokio::test]
async fn hello_rejection_falls_back_to_resp2_auth_select() {
    let script = VecDeque::from([
        support::reply("HELLO", b"-ERR unknown command 'HELLO'\r\n".to_vec()),
        support::reply("SELECT", support::simple_ok()),
    ]);
    let server = support::MockServer::start(script).await;
    let addr = server.addr;

    let mut opts = opts_for(addr);
    opts.database = 1;
    let wire = Wire::connect(&Address::Tcp { host: addr.ip().to_string(), port: addr.port() }, &opts)
        .await
        .unwrap();
    assert_eq!(wire.protocol_version(), 2);
}

#[tokio::test]
async fn do_one_round_trips_a_command() {
    let script = VecDeque::from([
        support::reply("HELLO", support::hello3_reply()),
        support::reply("GET", support::bulk("hello")),
    ]);
    let server = support::MockServer::start(script).await;
    let addr = server.addr;

    let wire = Wire::connect(&Address::Tcp { host: addr.ip().to_string(), port: addr.port() }, &opts_for(addr))
        .await
        .unwrap();
    let msg = wire.do_one(Command::new(["GET", "k"])).await.unwrap();
    assert_eq!(msg.into_string().unwrap(), "hello");
}

#[tokio::test]
async fn do_multi_preserves_submission_order() {
    let script = VecDeque::from([
        support::reply("HELLO", support::hello3_reply()),
        support::reply("SET", support::simple_ok()),
        support::reply("INCR", support::integer(1)),
        support::reply("GET", support::bulk("1")),
    ]);
    let server = support::MockServer::start(script).await;
    let addr = server.addr;

    let wire = Wire::connect(&Address::Tcp { host: addr.ip().to_string(), port: addr.port() }, &opts_for(addr))
        .await
        .unwrap();
    let replies = wire
        .do_multi(vec![
            Command::new(["SET", "k", "0"]),
            Command::new(["INCR", "k"]),
            Command::new(["GET", "k"]),
        ])
        .await
        .unwrap();

    assert_eq!(replies.len(), 3);
    assert_eq!(replies[2].clone().into_string().unwrap(), "1");
}

#[tokio::test]
async fn wire_close_fails_subsequent_calls() {
    let script = VecDeque::from([support::reply("HELLO", support::hello3_reply())]);
    let server = support::MockServer::start(script).await;
    let addr = server.addr;

    let wire = Wire::connect(&Address::Tcp { host: addr.ip().to_string(), port: addr.port() }, &opts_for(addr))
        .await
        .unwrap();
    wire.close(spineldb_client::Error::ConnectionClosed("test teardown".into()));
    assert!(wire.is_closed());
    let err = wire.do_one(Command::new(["PING"])).await;
    assert!(err.is_err());
}
