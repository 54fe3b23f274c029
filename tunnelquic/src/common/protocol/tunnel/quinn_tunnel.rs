// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![forbid(unused_imports, dead_code)]
use futures::{future::BoxFuture, FutureExt};

use std::net::SocketAddr;

use crate::{
  common::protocol::tunnel::{Tunnel, TunnelError, TunnelId},
  util::tunnel_stream::WrappedStream,
};

/// A tunnel backed by one QUIC connection
pub struct QuinnTunnel {
  id: TunnelId,
  connection: quinn::Connection,
}

impl QuinnTunnel {
  pub fn new(id: TunnelId, connection: quinn::Connection) -> Self {
    Self { id, connection }
  }
}

impl std::fmt::Debug for QuinnTunnel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QuinnTunnel")
      .field("id", &self.id)
      .field("remote", &self.connection.remote_address())
      .finish()
  }
}

impl Tunnel for QuinnTunnel {
  fn id(&self) -> TunnelId {
    self.id
  }

  fn addr(&self) -> SocketAddr {
    self.connection.remote_address()
  }

  fn open_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>> {
    let connection = self.connection.clone();
    async move {
      let pair = connection.open_bi().await?;
      Ok(WrappedStream::from_quinn(pair))
    }
    .boxed()
  }

  fn accept_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>> {
    let connection = self.connection.clone();
    async move {
      let pair = connection.accept_bi().await?;
      Ok(WrappedStream::from_quinn(pair))
    }
    .boxed()
  }

  fn close(&self, code: u32, reason: &str) {
    self
      .connection
      .close(quinn::VarInt::from_u32(code), reason.as_bytes());
  }

  fn closed(&self) -> BoxFuture<'static, TunnelError> {
    let connection = self.connection.clone();
    async move { connection.closed().await.into() }.boxed()
  }
}

impl From<quinn::ConnectionError> for TunnelError {
  fn from(connection_error: quinn::ConnectionError) -> Self {
    match connection_error {
      quinn::ConnectionError::VersionMismatch => Self::TransportError,
      quinn::ConnectionError::TransportError(_) => Self::TransportError,
      quinn::ConnectionError::ConnectionClosed(_) => Self::ConnectionClosed,
      quinn::ConnectionError::ApplicationClosed(close) => Self::ApplicationClosed {
        code: close.error_code.into_inner(),
        reason: String::from_utf8_lossy(&close.reason).into_owned(),
      },
      quinn::ConnectionError::Reset => Self::TransportError,
      quinn::ConnectionError::TimedOut => Self::TimedOut,
      quinn::ConnectionError::LocallyClosed => Self::LocallyClosed,
    }
  }
}
