// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

#![warn(unused_imports, dead_code, unused_variables)]

use std::{net::SocketAddr, sync::Arc};

use futures::future::BoxFuture;

use crate::util::tunnel_stream::WrappedStream;

pub mod duplex;
pub mod id;
pub mod quinn_tunnel;
pub mod registry;

pub use self::id::{TunnelId, TunnelIdGenerator};
pub use self::quinn_tunnel::QuinnTunnel;
pub type ArcTunnel = Arc<dyn Tunnel + Send + Sync + 'static>;

/// Application error codes used when closing a whole transport connection
pub mod close_code {
  /// Orderly shutdown by either peer
  pub const GRACEFUL: u32 = 0;
  /// The keepalive responder answered with something other than a pong
  pub const KEEPALIVE_VIOLATION: u32 = 1;
  /// The server dropped every connection of a client key on request
  pub const SESSION_REMOVED: u32 = 200;
  /// The first stream of a connection did not carry an authentication request
  pub const PROTOCOL_VIOLATION: u32 = 400;
  /// The credential presented on the first stream was refused
  pub const AUTHENTICATION_FAILED: u32 = 401;
}

/// The name a client's connections are registered under
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
#[repr(transparent)]
pub struct ClientKey(Arc<str>);

impl ClientKey {
  pub fn new<T: Into<String>>(t: T) -> ClientKey {
    ClientKey(Arc::from(t.into()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl From<&str> for ClientKey {
  fn from(s: &str) -> Self {
    ClientKey::new(s)
  }
}

impl From<String> for ClientKey {
  fn from(s: String) -> Self {
    ClientKey::new(s)
  }
}

impl std::fmt::Debug for ClientKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("ClientKey").field(&self.as_str()).finish()
  }
}

impl std::fmt::Display for ClientKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Connection closed by application with code {code}: {reason}")]
  ApplicationClosed { code: u64, reason: String },
  #[error("Connection timed out")]
  TimedOut,
  #[error("Transport error encountered")]
  TransportError,
  #[error("Connection closed locally")]
  LocallyClosed,
}

impl TunnelError {
  /// The application close code, when the peer closed the connection with one
  pub fn application_code(&self) -> Option<u64> {
    match self {
      TunnelError::ApplicationClosed { code, .. } => Some(*code),
      _ => None,
    }
  }
}

/// A multiplexed transport connection carrying bidirectional streams
pub trait Tunnel: Send + Sync {
  fn id(&self) -> TunnelId;

  /// The remote address of the connection
  fn addr(&self) -> SocketAddr;

  fn open_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>>;

  /// Waits for the peer to open a stream; fails once the connection is gone
  fn accept_link(&self) -> BoxFuture<'static, Result<WrappedStream, TunnelError>>;

  /// Closes the whole connection with an application error code; streams die with it
  fn close(&self, code: u32, reason: &str);

  /// Resolves with the reason once the connection has closed
  fn closed(&self) -> BoxFuture<'static, TunnelError>;
}
