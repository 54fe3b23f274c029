// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};

use crate::common::protocol::{
  connection::TunnelConnection,
  message::ConnectTarget,
  tunnel::{
    registry::{SessionLookupError, SessionRegistry},
    ArcTunnel, ClientKey, TunnelError, TunnelId,
  },
};

#[derive(thiserror::Error, Debug)]
pub enum DialError {
  #[error(transparent)]
  NoSession(#[from] SessionLookupError),
  #[error("failed to open stream: {0}")]
  OpenStream(#[source] TunnelError),
  #[error("failed to send connect request: {0}")]
  Request(#[source] std::io::Error),
}

/// A dial function, as handed to code that only needs to make outbound connections
pub type DialFn =
  Arc<dyn Fn(String, String) -> BoxFuture<'static, Result<TunnelConnection, DialError>> + Send + Sync>;

/// Dials through one specific connection
#[derive(Clone)]
pub struct ConnectionDialer {
  client_key: ClientKey,
  tunnel: ArcTunnel,
}

impl ConnectionDialer {
  pub fn new(client_key: ClientKey, tunnel: ArcTunnel) -> Self {
    Self { client_key, tunnel }
  }

  pub fn client_key(&self) -> &ClientKey {
    &self.client_key
  }

  pub fn tunnel_id(&self) -> TunnelId {
    self.tunnel.id()
  }

  /// Opens a stream and asks the far side to connect it to `protocol`/`address`
  #[tracing::instrument(level = "debug", skip(self), fields(client = %self.client_key, tunnel = %self.tunnel.id()), err)]
  pub async fn dial(&self, protocol: &str, address: &str) -> Result<TunnelConnection, DialError> {
    let stream = self
      .tunnel
      .open_link()
      .await
      .map_err(DialError::OpenStream)?;
    TunnelConnection::open(stream, ConnectTarget::new(protocol, address))
      .await
      .map_err(DialError::Request)
  }
}

impl std::fmt::Debug for ConnectionDialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionDialer")
      .field("client_key", &self.client_key)
      .field("tunnel", &self.tunnel.id())
      .finish()
  }
}

/// Dials by client key, resolving the key to a live connection on every call
#[derive(Clone)]
pub struct Dialer {
  registry: Arc<SessionRegistry>,
  client_key: ClientKey,
}

impl Dialer {
  pub fn new(registry: Arc<SessionRegistry>, client_key: ClientKey) -> Self {
    Self {
      registry,
      client_key,
    }
  }

  pub fn client_key(&self) -> &ClientKey {
    &self.client_key
  }

  pub async fn dial(&self, protocol: &str, address: &str) -> Result<TunnelConnection, DialError> {
    let dialer = self.registry.get_dialer(&self.client_key)?;
    dialer.dial(protocol, address).await
  }

  pub fn into_dial_fn(self) -> DialFn {
    Arc::new(move |protocol: String, address: String| {
      let dialer = self.clone();
      async move { dialer.dial(&protocol, &address).await }.boxed()
    })
  }
}

impl std::fmt::Debug for Dialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Dialer")
      .field("client_key", &self.client_key)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::{DialError, Dialer};
  use crate::common::protocol::{
    message::{Message, MessageType},
    tunnel::{
      duplex, registry::SessionRegistry, close_code, ArcTunnel, ClientKey, Tunnel, TunnelError,
    },
  };
  use std::{sync::Arc, time::Duration};

  #[tokio::test]
  async fn dial_without_session_fails_lazily() {
    let registry = Arc::new(SessionRegistry::new());
    let dialer = Dialer::new(registry.clone(), ClientKey::from("late"));
    let error = dialer.dial("tcp", "a:1").await.unwrap_err();
    assert!(matches!(error, DialError::NoSession(_)));
    assert_eq!(error.to_string(), "failed to find session for client late");

    // The same dialer starts working once the key registers
    let tunnels = duplex::channel();
    registry.add(ClientKey::from("late"), Arc::new(tunnels.listener) as ArcTunnel);
    let dial = dialer.into_dial_fn();
    let fut = async move {
      let connection = dial("tcp".into(), "a:1".into()).await.unwrap();
      let mut accepted = tunnels.connector.accept_link().await.unwrap();
      assert_eq!(accepted.id(), connection.stream_id());
      let request = Message::read_from(&mut accepted).await.unwrap();
      assert_eq!(request.kind(), MessageType::Connect);
      assert_eq!(request.payload(), b"tcp/a:1");
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("Dial deadlocked");
  }

  #[tokio::test]
  async fn dial_on_closed_connection_reports_open_failure() {
    let registry = Arc::new(SessionRegistry::new());
    let tunnels = duplex::channel();
    let listener: ArcTunnel = Arc::new(tunnels.listener);
    registry.add(ClientKey::from("c1"), listener.clone());
    tunnels.connector.close(close_code::GRACEFUL, "bye");
    let error = Dialer::new(registry, ClientKey::from("c1"))
      .dial("tcp", "a:1")
      .await
      .unwrap_err();
    match error {
      DialError::OpenStream(TunnelError::ApplicationClosed { code, .. }) => assert_eq!(code, 0),
      other => panic!("Expected stream open failure, got {:?}", other),
    }
  }
}
