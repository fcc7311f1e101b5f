// tests/facade_topology.rs

//! `DoCache`/`DoMultiCache`/`DoStream` are only meaningful on a connection the
//! client fully owns, so topologies other than single-node (and, for CSC,
//! standalone-with-replicas) reject them immediately without touching the
//! wire.

mod support;

use std::collections::VecDeque;
use std::time::Duration;

use spineldb_client::command::{Cacheable, Command};
use spineldb_client::config::{Address, ClientOptions};
use spineldb_client::{Client, Error};

#[tokio::test]
async fn sentinel_mode_rejects_do_cache_and_do_multi_cache_and_do_stream() {
    let script = VecDeque::from([support::reply(
        "SENTINEL",
        support::array(vec![support::bulk("10.0.0.9"), support::bulk("6380")]),
    )]);
    let server = support::MockServer::start(script).await;
    let addr = server.addr;

    let mut opts = ClientOptions::default();
    opts.addresses = vec![Address::Tcp { host: addr.ip().to_string(), port: addr.port() }];
    opts.dial_timeout = Duration::from_secs(2);
    opts.sentinel_master_name = Some("mymaster".to_string());

    let client = Client::connect(opts).await.unwrap();

    let cacheable = Cacheable::new(Command::new(["GET", "k"])).unwrap();
    let cache_err = client.do_cached(cacheable, Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(cache_err, Error::Config(_)));

    let multi_cache_err = client.do_multi_cached(vec![]).await.unwrap_err();
    assert!(matches!(multi_cache_err, Error::Config(_)));

    let mut sink = Vec::new();
    let stream_err = client.do_stream(Command::new(["GET", "k"]), &mut sink).await.unwrap_err();
    assert!(matches!(stream_err, Error::Config(_)));
}
