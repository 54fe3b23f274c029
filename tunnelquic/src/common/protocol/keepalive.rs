// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Application-level liveness probing on a dedicated stream.
//!
//! The initiator opens a stream and sends a framed Ping; the responder answers
//! with a framed Pong. After that the two sides trade raw `ping`/`pong` bytes
//! until either side stops. A first reply that is not a Pong closes the whole
//! connection.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
  common::protocol::{
    message::{Message, MessageType},
    tunnel::{close_code, ArcTunnel, ClientKey, TunnelError},
  },
  util::tunnel_stream::{StreamId, WrappedStream},
};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const PING: &[u8] = b"ping";
pub const PONG: &[u8] = b"pong";
const REPLY_BUFFER_SIZE: usize = 1024;

#[derive(thiserror::Error, Debug)]
pub enum KeepaliveError {
  #[error("failed to open keepalive stream: {0}")]
  OpenStream(#[source] TunnelError),
  #[error("keepalive stream failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("keepalive stream closed by peer")]
  Closed,
  #[error("keepalive ping was answered with {0}")]
  ProtocolViolation(String),
}

/// Answers a Ping already read from `stream`; returns how many raw pings were answered
#[tracing::instrument(level = "debug", skip(stream), fields(stream_id = stream.id()), err)]
pub async fn respond(stream: &mut WrappedStream, client_key: &ClientKey) -> Result<u64, KeepaliveError> {
  Message::pong(stream.id(), Vec::new()).write_to(stream).await?;
  let mut buf = [0u8; REPLY_BUFFER_SIZE];
  let mut answered = 0u64;
  loop {
    let read = stream.read(&mut buf).await?;
    if read == 0 {
      tracing::debug!(answered, "keepalive initiator finished");
      return Ok(answered);
    }
    tracing::trace!(received = %String::from_utf8_lossy(&buf[..read]), "keepalive ping");
    stream.write_all(PONG).await?;
    stream.flush().await?;
    answered += 1;
  }
}

/// Sends a Ping on `stream`, then pings every `interval` until the stream fails.
///
/// Only returns once the exchange ends, always with an error describing why.
pub async fn ping_loop<S>(
  stream: &mut S,
  stream_id: StreamId,
  interval: Duration,
) -> Result<(), KeepaliveError>
where
  S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
  Message::ping(stream_id, Vec::new()).write_to(stream).await?;
  match Message::read_from(stream).await {
    Ok(reply) if reply.kind() == MessageType::Pong => {
      tracing::debug!(%reply, "keepalive established");
    }
    Ok(reply) => return Err(KeepaliveError::ProtocolViolation(reply.to_string())),
    Err(error) if error.is_end_of_stream() => return Err(KeepaliveError::Closed),
    Err(error) => return Err(KeepaliveError::ProtocolViolation(error.to_string())),
  }
  let mut buf = [0u8; REPLY_BUFFER_SIZE];
  loop {
    tokio::time::sleep(interval).await;
    stream.write_all(PING).await?;
    stream.flush().await?;
    let read = stream.read(&mut buf).await?;
    if read == 0 {
      return Err(KeepaliveError::Closed);
    }
    tracing::trace!(reply = %String::from_utf8_lossy(&buf[..read]), "keepalive reply");
  }
}

/// Runs the initiator side over a fresh stream of `tunnel`.
///
/// A protocol violation closes the whole connection with the keepalive close code.
#[tracing::instrument(level = "debug", skip(tunnel), fields(tunnel = %tunnel.id()))]
pub async fn run_keepalive(tunnel: ArcTunnel, interval: Duration) -> KeepaliveError {
  let mut stream = match tunnel.open_link().await {
    Ok(stream) => stream,
    Err(error) => return KeepaliveError::OpenStream(error),
  };
  let stream_id = stream.id();
  let outcome = match ping_loop(&mut stream, stream_id, interval).await {
    Ok(()) => KeepaliveError::Closed,
    Err(error) => error,
  };
  if let KeepaliveError::ProtocolViolation(reply) = &outcome {
    tracing::warn!(%reply, "keepalive peer misbehaved; closing connection");
    tunnel.close(close_code::KEEPALIVE_VIOLATION, "keepalive ping was not answered with a pong");
  }
  let _ = stream.close().await;
  outcome
}
