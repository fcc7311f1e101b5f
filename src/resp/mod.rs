// src/resp/mod.rs

//! The RESP2/RESP3 wire codec (component C1 of the spec): [`Message`]/[`Value`]
//! for the decoded side, [`RespCodec`]/[`OutboundCommand`] for the
//! `tokio_util::codec::{Encoder, Decoder}` pair that drives a `Framed` transport.

mod codec;
mod message;

pub use codec::{OutboundCommand, RespCodec};
pub use message::{Message, Value};
