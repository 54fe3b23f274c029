// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! A dialed tunnel stream presented as an ordinary byte connection.

use std::{
  future::Future,
  io::{Error as IOError, ErrorKind},
  pin::Pin,
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  time::{Instant, Sleep},
};

use crate::{
  common::protocol::message::{ConnectTarget, Message},
  util::tunnel_stream::{StreamId, TunnelStream, WrappedStream},
};

/// A stream on which a Connect request has been sent.
///
/// Reads and writes go straight to the underlying tunnel stream. The local and
/// peer addresses both report the dialed target.
pub struct TunnelConnection {
  stream: WrappedStream,
  target: ConnectTarget,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}

impl TunnelConnection {
  /// Sends the Connect request for `target` as the first bytes of `stream`
  pub async fn open(mut stream: WrappedStream, target: ConnectTarget) -> Result<Self, IOError> {
    let request = Message::connect(stream.id(), target.clone());
    if let Err(error) = request.write_to(&mut stream).await {
      let _ = stream.close().await;
      return Err(error);
    }
    tracing::trace!(%request, "connect request sent");
    Ok(Self {
      stream,
      target,
      read_deadline: None,
      write_deadline: None,
    })
  }

  pub fn stream_id(&self) -> StreamId {
    self.stream.id()
  }

  pub fn target(&self) -> &ConnectTarget {
    &self.target
  }

  pub fn local_addr(&self) -> &ConnectTarget {
    &self.target
  }

  pub fn peer_addr(&self) -> &ConnectTarget {
    &self.target
  }

  /// Applies the same deadline to reads and writes; `None` clears both
  pub fn set_deadline(&mut self, deadline: Option<Instant>) {
    self.set_read_deadline(deadline);
    self.set_write_deadline(deadline);
  }

  pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
    self.read_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
  }

  pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
    self.write_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
  }

  /// Closes this stream only; the tunnel carrying it stays up
  pub async fn close(&mut self) -> Result<(), IOError> {
    self.stream.close().await
  }

  pub fn into_inner(self) -> WrappedStream {
    self.stream
  }
}

fn deadline_expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
  match deadline {
    Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
    None => false,
  }
}

fn timed_out(direction: &str) -> IOError {
  IOError::new(ErrorKind::TimedOut, format!("{} deadline exceeded", direction))
}

impl std::fmt::Debug for TunnelConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TunnelConnection")
      .field("stream_id", &self.stream.id())
      .field("target", &self.target.to_string())
      .finish_non_exhaustive()
  }
}

impl AsyncRead for TunnelConnection {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    if deadline_expired(&mut this.read_deadline, cx) {
      return Poll::Ready(Err(timed_out("read")));
    }
    AsyncRead::poll_read(Pin::new(&mut this.stream), cx, buf)
  }
}

impl AsyncWrite for TunnelConnection {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.get_mut();
    if deadline_expired(&mut this.write_deadline, cx) {
      return Poll::Ready(Err(timed_out("write")));
    }
    AsyncWrite::poll_write(Pin::new(&mut this.stream), cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    if deadline_expired(&mut this.write_deadline, cx) {
      return Poll::Ready(Err(timed_out("write")));
    }
    AsyncWrite::poll_flush(Pin::new(&mut this.stream), cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    AsyncWrite::poll_shutdown(Pin::new(&mut self.get_mut().stream), cx)
  }
}

impl TunnelStream for TunnelConnection {}

#[cfg(test)]
mod tests {
  use super::TunnelConnection;
  use crate::{
    common::protocol::message::{ConnectTarget, Message, MessageType},
    util::tunnel_stream::WrappedStream,
  };
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn open_sends_connect_before_data() {
    let (near, mut far) = WrappedStream::duplex(8, 1024);
    let mut connection = TunnelConnection::open(near, ConnectTarget::new("tcp", "10.0.0.1:22"))
      .await
      .unwrap();
    assert_eq!(connection.stream_id(), 8);
    assert_eq!(connection.peer_addr().to_string(), "tcp/10.0.0.1:22");
    assert_eq!(connection.local_addr(), connection.peer_addr());
    connection.write_all(b"SSH-2.0").await.unwrap();

    let request = Message::read_from(&mut far).await.unwrap();
    assert_eq!(request.kind(), MessageType::Connect);
    assert_eq!(request.stream_id(), 8);
    assert_eq!(request.target().unwrap().address(), "10.0.0.1:22");
    let mut buf = [0u8; 7];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"SSH-2.0");

    far.write_all(b"reply").await.unwrap();
    let mut buf = [0u8; 5];
    connection.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"reply");
  }

  #[tokio::test]
  async fn read_deadline_times_out_and_can_be_cleared() {
    let (near, mut far) = WrappedStream::duplex(0, 1024);
    let mut connection = TunnelConnection::open(near, ConnectTarget::new("tcp", "a:1"))
      .await
      .unwrap();
    connection.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(20)));
    let mut buf = [0u8; 1];
    let error = connection.read(&mut buf).await.unwrap_err();
    assert_eq!(error.kind(), std::io::ErrorKind::TimedOut);

    connection.set_deadline(None);
    let _request = Message::read_from(&mut far).await.unwrap();
    far.write_all(b"x").await.unwrap();
    connection.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");
  }
}
