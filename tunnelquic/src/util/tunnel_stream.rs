// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Identifier of a stream within its transport connection, as carried in message headers
pub type StreamId = i64;

/// A duplex stream abstracting over a connection, allowing use of memory streams, TCP sockets, and Quinn streams
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<'stream, TInner: TunnelStream + ?Sized + 'stream> TunnelStream for &'stream mut TInner {}
impl<TInner: TunnelStream + ?Sized> TunnelStream for Box<TInner> {}
impl TunnelStream for tokio::net::TcpStream {}
impl TunnelStream for tokio::io::DuplexStream {}

/// One bidirectional stream of a tunnel, tagged with the id its transport assigned to it
pub enum WrappedStream {
  Quinn {
    id: StreamId,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
  },
  /// Split halves from any other transport, for embedders supplying their own [Tunnel] implementation.
  ///
  /// Build with [WrappedStream::boxed]. Closing shuts down the write half only.
  ///
  /// [Tunnel]: crate::common::protocol::tunnel::Tunnel
  Boxed {
    id: StreamId,
    recv: Box<dyn AsyncRead + Send + Unpin + 'static>,
    send: Box<dyn AsyncWrite + Send + Unpin + 'static>,
  },
  DuplexStream {
    id: StreamId,
    stream: tokio::io::DuplexStream,
  },
}

impl WrappedStream {
  #[cfg(test)]
  /// Asserts that WrappedStream complies with TunnelStream, Send, and Unpin traits
  fn _assert_traits() {
    let _x: &(dyn TunnelStream + Send + Unpin) = &WrappedStream::DuplexStream {
      id: 0,
      stream: tokio::io::duplex(64).0,
    };
    unreachable!("Compile-time static assertion function should never be called");
  }

  /// Wraps a Quinn bidirectional stream pair, using the raw QUIC stream id
  pub fn from_quinn((send, recv): (quinn::SendStream, quinn::RecvStream)) -> Self {
    // QUIC stream ids are 62-bit, so they always fit in the signed header field
    let id = quinn::VarInt::from(send.id()).into_inner() as StreamId;
    WrappedStream::Quinn { id, send, recv }
  }

  /// Produces two connected in-memory streams sharing the same stream id
  pub fn duplex(id: StreamId, max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (
      WrappedStream::DuplexStream { id, stream: a },
      WrappedStream::DuplexStream { id, stream: b },
    )
  }

  /// Wraps the read and write halves of a stream from another transport
  pub fn boxed<R, W>(id: StreamId, recv: R, send: W) -> Self
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    WrappedStream::Boxed {
      id,
      recv: Box::new(recv),
      send: Box::new(send),
    }
  }

  pub fn id(&self) -> StreamId {
    match self {
      WrappedStream::Quinn { id, .. } => *id,
      WrappedStream::Boxed { id, .. } => *id,
      WrappedStream::DuplexStream { id, .. } => *id,
    }
  }

  /// Finishes the sending side and stops the receiving side of the stream.
  ///
  /// The parent transport connection is left untouched.
  pub async fn close(&mut self) -> Result<(), IOError> {
    let finished = self.shutdown().await;
    if let WrappedStream::Quinn { recv, .. } = self {
      // Already-stopped or reset streams have nothing left to stop
      let _ = recv.stop(quinn::VarInt::from_u32(0));
    }
    finished
  }
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kind = match self {
      WrappedStream::Quinn { .. } => "Quinn",
      WrappedStream::Boxed { .. } => "Boxed",
      WrappedStream::DuplexStream { .. } => "DuplexStream",
    };
    f.debug_struct("WrappedStream")
      .field("kind", &kind)
      .field("id", &self.id())
      .finish()
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn { ref mut recv, .. } => AsyncRead::poll_read(Pin::new(recv), cx, buf),
      WrappedStream::Boxed { ref mut recv, .. } => {
        AsyncRead::poll_read(Pin::new(&mut *recv), cx, buf)
      }
      WrappedStream::DuplexStream { ref mut stream, .. } => {
        AsyncRead::poll_read(Pin::new(stream), cx, buf)
      }
    }
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn { ref mut send, .. } => AsyncWrite::poll_write(Pin::new(send), cx, buf),
      WrappedStream::Boxed { ref mut send, .. } => {
        AsyncWrite::poll_write(Pin::new(&mut *send), cx, buf)
      }
      WrappedStream::DuplexStream { ref mut stream, .. } => {
        AsyncWrite::poll_write(Pin::new(stream), cx, buf)
      }
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn { ref mut send, .. } => AsyncWrite::poll_flush(Pin::new(send), cx),
      WrappedStream::Boxed { ref mut send, .. } => AsyncWrite::poll_flush(Pin::new(&mut *send), cx),
      WrappedStream::DuplexStream { ref mut stream, .. } => {
        AsyncWrite::poll_flush(Pin::new(stream), cx)
      }
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Quinn { ref mut send, .. } => AsyncWrite::poll_shutdown(Pin::new(send), cx),
      WrappedStream::Boxed { ref mut send, .. } => {
        AsyncWrite::poll_shutdown(Pin::new(&mut *send), cx)
      }
      WrappedStream::DuplexStream { ref mut stream, .. } => {
        AsyncWrite::poll_shutdown(Pin::new(stream), cx)
      }
    }
  }
}

impl TunnelStream for WrappedStream {}
