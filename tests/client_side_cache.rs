// tests/client_side_cache.rs

//! End-to-end client-side-cache behavior: a miss fetches and populates, a
//! subsequent hit skips the wire entirely, and a server-pushed `invalidate`
//! frame evicts the entry so the next read is a fresh miss.

mod support;

use std::collections::VecDeque;
use std::time::Duration;

use spineldb_client::command::{Cacheable, Command};
use spineldb_client::config::{Address, ClientOptions};
use spineldb_client::Client;

fn opts_for(addr: std::net::SocketAddr) -> ClientOptions {
    let mut opts = ClientOptions::default();
    opts.addresses = vec![Address::Tcp { host: addr.ip().to_string(), port: addr.port() }];
    opts.dial_timeout = Duration::from_secs(2);
    opts.enable_client_side_caching = true;
    opts
}

#[tokio::test]
async fn miss_then_hit_then_invalidation_forces_a_fresh_fetch() {
    let script = VecDeque::from([
        support::reply("HELLO", support::hello3_reply()),
        support::reply("CLIENT", support::simple_ok()), // CLIENT TRACKING ON
        support::reply("CLIENT", support::simple_ok()), // CLIENT CACHING YES
        support::reply("GET", support::bulk("v1")),
        support::reply("CLIENT", support::simple_ok()), // CLIENT CACHING YES (after invalidation)
        support::reply("GET", support::bulk("v2")),
    ]);
    let server = support::MockServer::start(script).await;
    let addr = server.addr;

    let client = Client::connect(opts_for(addr)).await.unwrap();
    let cacheable = Cacheable::new(Command::new(["GET", "k"])).unwrap();

    let first = client.do_cached(cacheable.clone(), Duration::from_secs(30)).await.unwrap();
    assert_eq!(first.clone().into_string().unwrap(), "v1");
    assert!(!first.is_cache_hit());

    let second = client.do_cached(cacheable.clone(), Duration::from_secs(30)).await.unwrap();
    assert_eq!(second.into_string().unwrap(), "v1");

    // Server pushes an invalidation frame for the cached key.
    server.push(b">2\r\n$10\r\ninvalidate\r\n*1\r\n$1\r\nk\r\n".to_vec());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let third = client.do_cached(cacheable, Duration::from_secs(30)).await.unwrap();
    assert_eq!(third.into_string().unwrap(), "v2");
}
