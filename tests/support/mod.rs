// tests/support/mod.rs

//! A minimal hand-rolled RESP2 server used to drive the client against
//! scripted replies without a real Redis-compatible server in the sandbox.
//! Parses only the inbound shape the client ever sends (arrays of bulk
//! strings) and writes back whatever raw bytes the test script supplies.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

/// One scripted exchange: match on the received command's name (case
/// insensitive) and write `reply` back verbatim.
pub struct Scripted {
    pub command: &'static str,
    pub reply: Vec<u8>,
}

pub fn reply(command: &'static str, reply: impl Into<Vec<u8>>) -> Scripted {
    Scripted { command, reply: reply.into() }
}

const PUSH_CHANNEL_CAPACITY: usize = 64;

/// Spawns a TCP server on an ephemeral port that accepts any number of
/// connections, all consuming the same scripted reply queue in arrival order
/// (a client that owns a shared pipelining wire *and* a dedicated one makes
/// two connections; each handshakes against the next entries in `script`).
/// If a command doesn't match the next scripted entry's name the server
/// replies with the scripted bytes anyway — name is informational for
/// readability, not a hard match, since some tests script replies ahead of
/// knowing the exact args.
pub struct MockServer {
    pub addr: std::net::SocketAddr,
    push_tx: broadcast::Sender<Vec<u8>>,
}

impl MockServer {
    pub async fn start(script: VecDeque<Scripted>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(Mutex::new(script));
        let (push_tx, _) = broadcast::channel::<Vec<u8>>(PUSH_CHANNEL_CAPACITY);
        let push_tx_for_accept = push_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let script = script.clone();
                let mut push_rx = push_tx_for_accept.subscribe();
                tokio::spawn(async move {
                    let mut stream = stream;
                    let mut buf = Vec::new();
                    loop {
                        tokio::select! {
                            biased;
                            Ok(bytes) = push_rx.recv() => {
                                if stream.write_all(&bytes).await.is_err() {
                                    return;
                                }
                            }
                            cmd = read_command(&mut stream, &mut buf) => {
                                let Some(_args) = cmd else { return };
                                // No scripted reply for this command (e.g. a
                                // SUBSCRIBE whose ack arrives as a push frame,
                                // not a reply): nothing to write back, keep
                                // the connection open for pushes.
                                let Some(entry) = script.lock().await.pop_front() else { continue };
                                if stream.write_all(&entry.reply).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        MockServer { addr, push_tx }
    }

    /// Pushes a raw out-of-band frame (e.g. an `invalidate` push or a
    /// pub/sub `message`) to every connected client at any point, independent
    /// of the command/reply script.
    pub fn push(&self, raw: impl Into<Vec<u8>>) {
        let _ = self.push_tx.send(raw.into());
    }
}

/// Reads one RESP array-of-bulk-strings frame (`*N\r\n($len\r\n<bytes>\r\n)*N`)
/// and returns the decoded argument list, or `None` on EOF.
async fn read_command(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Vec<Vec<u8>>> {
    let header = read_line(stream, buf).await?;
    if header.first()? != &b'*' {
        return None;
    }
    let n: usize = std::str::from_utf8(&header[1..]).ok()?.trim().parse().ok()?;
    let mut args = Vec::with_capacity(n);
    for _ in 0..n {
        let len_line = read_line(stream, buf).await?;
        if len_line.first()? != &b'$' {
            return None;
        }
        let len: usize = std::str::from_utf8(&len_line[1..]).ok()?.trim().parse().ok()?;
        let payload = read_exact_from_buf(stream, buf, len + 2).await?;
        args.push(payload[..len].to_vec());
    }
    Some(args)
}

async fn read_line(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    loop {
        if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf[..pos].to_vec();
            buf.drain(..pos + 2);
            return Some(line);
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_exact_from_buf(stream: &mut TcpStream, buf: &mut Vec<u8>, n: usize) -> Option<Vec<u8>> {
    while buf.len() < n {
        let mut chunk = [0u8; 1024];
        let got = stream.read(&mut chunk).await.ok()?;
        if got == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..got]);
    }
    let out = buf[..n].to_vec();
    buf.drain(..n);
    Some(out)
}

pub fn hello3_reply() -> Vec<u8> {
    b"%7\r\n\
$6\r\nserver\r\n$6\r\nredis\r\n\
$7\r\nversion\r\n$5\r\n7.4.0\r\n\
$5\r\nproto\r\n:3\r\n\
$2\r\nid\r\n:1\r\n\
$4\r\nmode\r\n$10\r\nstandalone\r\n\
$4\r\nrole\r\n$6\r\nmaster\r\n\
$7\r\nmodules\r\n*0\r\n"
        .to_vec()
}

pub fn simple_ok() -> Vec<u8> {
    b"+OK\r\n".to_vec()
}

pub fn bulk(s: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", s.len(), s).into_bytes()
}

pub fn integer(n: i64) -> Vec<u8> {
    format!(":{n}\r\n").into_bytes()
}

pub fn array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend(item);
    }
    out
}
