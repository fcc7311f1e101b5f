// src/wire/handshake.rs

//! The connection-setup sequence run once per freshly dialed [`super::Wire`],
//! before the writer/reader loops take over: protocol negotiation (`HELLO`,
//! falling back to RESP2 `AUTH`/`SELECT` the way the teacher's
//! `warden::client::WardenClient` issues a bare command and reads back a
//! single reply), then optional `CLIENT TRACKING ON` for client-side caching.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio_util::codec::Framed;
use tracing::debug;

use crate::config::ClientOptions;
use crate::error::Error;
use crate::resp::{Message, OutboundCommand, RespCodec, Value};

use super::transport::Transport;

#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub protocol_version: u8,
    pub availability_zone: Option<String>,
}

fn command(args: &[&str]) -> OutboundCommand {
    OutboundCommand(args.iter().map(|a| Bytes::copy_from_slice(a.as_bytes())).collect())
}

async fn roundtrip(
    framed: &mut Framed<Transport, RespCodec>,
    cmd: OutboundCommand,
) -> Result<Message, Error> {
    framed.send(cmd).await?;
    let reply = framed.next().await.ok_or_else(|| Error::closed("peer closed during handshake"))??;
    reply.into_result()
}

/// Runs the handshake and returns the protocol version actually negotiated.
/// A RESP3-incapable server (or one that rejects `HELLO`) downgrades cleanly
/// to RESP2, matching spec §4.3's "HELLO may fail; fall back, do not abort".
pub async fn perform(
    framed: &mut Framed<Transport, RespCodec>,
    opts: &ClientOptions,
) -> Result<HandshakeInfo, Error> {
    let protocol_version = if opts.protocol >= 3 {
        match try_hello3(framed, opts).await {
            Ok(()) => 3,
            Err(e) => {
                debug!("HELLO 3 failed ({e}), falling back to RESP2");
                framed.codec_mut().protocol_version = 2;
                legacy_auth_and_select(framed, opts).await?;
                2
            }
        }
    } else {
        legacy_auth_and_select(framed, opts).await?;
        2
    };

    if opts.enable_client_side_caching {
        if protocol_version < 3 {
            return Err(Error::Config(
                "client-side caching requires RESP3; the server does not support HELLO".into(),
            ));
        }
        roundtrip(framed, command(&["CLIENT", "TRACKING", "ON"])).await?;
    }

    let availability_zone = if opts.enable_replica_az_info {
        probe_availability_zone(framed).await
    } else {
        None
    };

    Ok(HandshakeInfo { protocol_version, availability_zone })
}

/// Issues `INFO server` and looks for an `availability_zone:` field, the way
/// cloud-managed Redis-compatible deployments surface placement info for
/// AZ-aware replica selection (spec §4.3/§4.8 `EnableReplicaAZInfo`). Best
/// effort: a server that omits the field, or fails the command, just leaves
/// this `None` rather than failing the handshake.
async fn probe_availability_zone(framed: &mut Framed<Transport, RespCodec>) -> Option<String> {
    let reply = roundtrip(framed, command(&["INFO", "server"])).await.ok()?;
    let text = reply.into_string().ok()?;
    text.lines()
        .find_map(|line| line.strip_prefix("availability_zone:"))
        .map(|zone| zone.trim().to_string())
}

async fn try_hello3(
    framed: &mut Framed<Transport, RespCodec>,
    opts: &ClientOptions,
) -> Result<(), Error> {
    let mut args: Vec<Bytes> = vec![Bytes::from_static(b"HELLO"), Bytes::from_static(b"3")];
    if let Some(password) = &opts.password {
        args.push(Bytes::from_static(b"AUTH"));
        args.push(Bytes::copy_from_slice(opts.username.as_deref().unwrap_or("default").as_bytes()));
        args.push(Bytes::copy_from_slice(password.as_bytes()));
    }
    let reply = roundtrip(framed, OutboundCommand(args)).await?;
    let map = reply.into_map()?;
    let negotiated = map
        .get(&Bytes::from_static(b"proto"))
        .cloned()
        .map(|m| m.into_i64())
        .transpose()?
        .unwrap_or(2);
    if negotiated != 3 {
        return Err(Error::Protocol(format!("server negotiated protocol {negotiated}, expected 3")));
    }
    framed.codec_mut().protocol_version = 3;

    if opts.database != 0 {
        roundtrip(framed, command(&["SELECT", &opts.database.to_string()])).await?;
    }
    Ok(())
}

async fn legacy_auth_and_select(
    framed: &mut Framed<Transport, RespCodec>,
    opts: &ClientOptions,
) -> Result<(), Error> {
    if let Some(password) = &opts.password {
        let reply = match &opts.username {
            Some(user) => {
                roundtrip(framed, command(&["AUTH", user, password])).await
            }
            None => roundtrip(framed, command(&["AUTH", password])).await,
        };
        reply?;
    }
    if opts.database != 0 {
        roundtrip(framed, command(&["SELECT", &opts.database.to_string()])).await?;
    }
    Ok(())
}

pub(super) fn is_pong(msg: &Message) -> bool {
    matches!(&msg.value, Value::SimpleString(b) if b.eq_ignore_ascii_case(b"PONG"))
}
