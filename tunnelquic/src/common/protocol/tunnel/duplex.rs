// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![forbid(unused_imports, dead_code)]
use std::{
  net::{Ipv4Addr, SocketAddr},
  sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
  },
};

use futures::{future::BoxFuture, FutureExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::{
  common::protocol::tunnel::{Tunnel, TunnelError, TunnelId},
  util::tunnel_stream::{StreamId, WrappedStream},
};

const DUPLEX_BUFFER_SIZE: usize = 64 * 1024;

/// Remote address each side of a [channel] reports for its peer
pub const LISTENER_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
pub const CONNECTOR_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::LOCALHOST), 40001);

/// Which end of an entangled pair a tunnel is
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TunnelSide {
  Connect,
  Listen,
}

#[derive(Debug, Clone)]
struct CloseRecord {
  closed_by: TunnelSide,
  code: u32,
  reason: String,
}

/// Close state shared by both ends of an entangled pair
#[derive(Default)]
struct SharedClose {
  token: CancellationToken,
  record: Mutex<Option<CloseRecord>>,
}

impl SharedClose {
  fn error_for(&self, side: TunnelSide) -> TunnelError {
    let record = self.record.lock().expect("Mutex poisoned").clone();
    match record {
      Some(record) if record.closed_by == side => TunnelError::LocallyClosed,
      Some(record) => TunnelError::ApplicationClosed {
        code: record.code as u64,
        reason: record.reason,
      },
      None => TunnelError::ConnectionClosed,
    }
  }
}

/// An in-memory tunnel; streams opened on one side are accepted on the other.
///
/// Stream ids follow QUIC client/server numbering so both ends agree on them.
pub struct DuplexTunnel {
  id: TunnelId,
  side: TunnelSide,
  remote: SocketAddr,
  next_stream: AtomicI64,
  channel_to_remote: UnboundedSender<WrappedStream>,
  incoming: Arc<tokio::sync::Mutex<UnboundedReceiver<WrappedStream>>>,
  close: Arc<SharedClose>,
}

impl DuplexTunnel {
  /// The code and reason the connection was closed with, if it has been
  pub fn close_reason(&self) -> Option<(u32, String)> {
    self
      .close
      .record
      .lock()
      .expect("Mutex poisoned")
      .as_ref()
      .map(|record| (record.code, record.reason.clone()))
  }

  pub fn is_closed(&self) -> bool {
    self.close.token.is_cancelled()
  }
}

impl Tunnel for DuplexTunnel {
  fn id(&self) -> TunnelId {
    self.id
  }

  fn addr(&self) -> SocketAddr {
    self.remote
  }

  fn open_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>> {
    if self.close.token.is_cancelled() {
      return futures::future::ready(Err(self.close.error_for(self.side))).boxed();
    }
    let id: StreamId = self.next_stream.fetch_add(4, Ordering::Relaxed);
    let (local, remote) = WrappedStream::duplex(id, DUPLEX_BUFFER_SIZE);
    futures::future::ready(
      self
        .channel_to_remote
        .send(remote)
        .map_err(|_| TunnelError::ConnectionClosed)
        .map(|_| local),
    )
    .boxed()
  }

  fn accept_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>> {
    let incoming = Arc::clone(&self.incoming);
    let close = Arc::clone(&self.close);
    let side = self.side;
    async move {
      let mut incoming = incoming.lock().await;
      tokio::select! {
        biased;
        _ = close.token.cancelled() => Err(close.error_for(side)),
        next = incoming.recv() => next.ok_or(TunnelError::ConnectionClosed),
      }
    }
    .boxed()
  }

  fn close(&self, code: u32, reason: &str) {
    {
      let mut record = self.close.record.lock().expect("Mutex poisoned");
      if record.is_none() {
        *record = Some(CloseRecord {
          closed_by: self.side,
          code,
          reason: reason.to_string(),
        });
      }
    }
    self.close.token.cancel();
  }

  fn closed(&self) -> BoxFuture<'static, TunnelError> {
    let close = Arc::clone(&self.close);
    let side = self.side;
    async move {
      close.token.cancelled().await;
      close.error_for(side)
    }
    .boxed()
  }
}

/// Two entangled tunnels, each accepting what the other opens
pub struct EntangledTunnels {
  pub listener: DuplexTunnel,
  pub connector: DuplexTunnel,
}

impl From<EntangledTunnels> for (DuplexTunnel, DuplexTunnel) {
  fn from(tunnels: EntangledTunnels) -> Self {
    (tunnels.listener, tunnels.connector)
  }
}

pub fn channel() -> EntangledTunnels {
  channel_with_ids(TunnelId::new(0), TunnelId::new(1))
}

/// Produces two entangled tunnels with the given ids
pub fn channel_with_ids(listener_id: TunnelId, connector_id: TunnelId) -> EntangledTunnels {
  fn duplex_for(
    id: TunnelId,
    up: UnboundedSender<WrappedStream>,
    down: UnboundedReceiver<WrappedStream>,
    side: TunnelSide,
    close: Arc<SharedClose>,
  ) -> DuplexTunnel {
    let (first_stream, remote) = match side {
      TunnelSide::Connect => (0, LISTENER_ADDR),
      TunnelSide::Listen => (1, CONNECTOR_ADDR),
    };
    DuplexTunnel {
      id,
      side,
      remote,
      next_stream: AtomicI64::new(first_stream),
      channel_to_remote: up,
      incoming: Arc::new(tokio::sync::Mutex::new(down)),
      close,
    }
  }
  let close = Arc::new(SharedClose::default());
  let (left_up, right_down) = mpsc::unbounded_channel::<WrappedStream>();
  let (right_up, left_down) = mpsc::unbounded_channel::<WrappedStream>();
  EntangledTunnels {
    listener: duplex_for(
      listener_id,
      left_up,
      left_down,
      TunnelSide::Listen,
      Arc::clone(&close),
    ),
    connector: duplex_for(connector_id, right_up, right_down, TunnelSide::Connect, close),
  }
}

#[cfg(test)]
mod tests {
  use super::{DuplexTunnel, EntangledTunnels, CONNECTOR_ADDR};
  use crate::common::protocol::tunnel::{Tunnel, TunnelError};
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn duplex_tunnel() {
    let (a_tun, b_tun): (DuplexTunnel, DuplexTunnel) = super::channel().into();

    let fut = async move {
      let mut opened = b_tun.open_link().await.unwrap();
      let mut accepted = a_tun.accept_link().await.unwrap();
      assert_eq!(opened.id(), 0);
      assert_eq!(accepted.id(), 0);
      opened.write_all(b"hello").await.unwrap();
      let mut buf = [0u8; 5];
      accepted.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"hello");

      let reverse = a_tun.open_link().await.unwrap();
      assert_eq!(reverse.id(), 1);
      assert_eq!(b_tun.open_link().await.unwrap().id(), 4);
      assert_eq!(b_tun.accept_link().await.unwrap().id(), 1);
      assert_eq!(a_tun.addr(), CONNECTOR_ADDR);

      drop(b_tun); // Dropping the connector ends incoming streams for the listener, after queued ones
      assert_eq!(a_tun.accept_link().await.unwrap().id(), 4);
      assert_eq!(
        a_tun.accept_link().await.unwrap_err(),
        TunnelError::ConnectionClosed
      );
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("DuplexTunnel test may be failing due to an await deadlock");
  }

  #[tokio::test]
  async fn close_is_visible_to_both_sides() {
    let EntangledTunnels {
      listener: server,
      connector: client,
    } = super::channel();

    let fut = async move {
      let pending_accept = client.accept_link();
      server.close(401, "failed authentication");
      server.close(0, "ignored second close");
      assert_eq!(
        pending_accept.await.unwrap_err(),
        TunnelError::ApplicationClosed {
          code: 401,
          reason: "failed authentication".into(),
        }
      );
      assert_eq!(server.closed().await, TunnelError::LocallyClosed);
      assert!(client.open_link().await.is_err());
      assert_eq!(
        client.close_reason(),
        Some((401, "failed authentication".to_string()))
      );
      assert!(client.is_closed());
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("Close propagation deadlocked");
  }
}
