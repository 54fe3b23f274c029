// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Per-connection stream dispatch.
//!
//! Every connection starts either awaiting authentication (server side) or
//! already serving under a known key (client side). While serving, each
//! incoming stream is handled concurrently: its first message is decoded,
//! offered to the hijacker, and then routed by type.

use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
  common::{
    authentication::{
      Authorization, Authorizer, Hijack, Hijacker, PassthroughHijacker, AUTH_FAILED, AUTH_OK,
    },
    protocol::{
      keepalive,
      message::{Message, MessageError, MessageType},
      proxy_tcp::{proxy_connect, OutboundConnector, TcpOutboundConnector},
      tunnel::{
        close_code, registry::SessionRegistry, ArcTunnel, ClientKey, TunnelError,
      },
    },
  },
  util::tunnel_stream::WrappedStream,
};

/// Where a connection's dispatcher begins
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchState {
  /// The first stream must carry an Auth message before anything else is served
  AwaitingAuth,
  /// Streams are served immediately under the given key
  Serving(ClientKey),
}

#[derive(thiserror::Error, Debug)]
pub enum AuthenticationError {
  #[error("the first stream must be used for authorization verification, received {0}")]
  NotAuthentication(MessageType),
  #[error("failed to read authentication request: {0}")]
  Framing(#[source] MessageError),
  #[error("failed authentication")]
  Rejected,
  #[error("authorizer failed: {0:#}")]
  Authorizer(anyhow::Error),
  #[error("failed to answer authentication request: {0}")]
  Io(#[source] std::io::Error),
  #[error("connection ended before authentication: {0}")]
  Tunnel(#[source] TunnelError),
}

/// Why a serving connection stopped accepting streams
#[derive(Debug)]
pub enum DispatchExit {
  Closed(TunnelError),
  Cancelled,
}

pub struct StreamDispatcher {
  registry: Arc<SessionRegistry>,
  authorizer: Arc<dyn Authorizer>,
  hijacker: Arc<dyn Hijacker>,
  connector: Arc<dyn OutboundConnector>,
}

impl std::fmt::Debug for StreamDispatcher {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamDispatcher")
      .field("registry", &self.registry)
      .field("authorizer", &self.authorizer)
      .field("hijacker", &self.hijacker)
      .finish_non_exhaustive()
  }
}

impl StreamDispatcher {
  pub fn new(registry: Arc<SessionRegistry>, authorizer: Arc<dyn Authorizer>) -> Self {
    Self {
      registry,
      authorizer,
      hijacker: Arc::new(PassthroughHijacker),
      connector: Arc::new(TcpOutboundConnector::default()),
    }
  }

  pub fn with_hijacker(mut self, hijacker: Arc<dyn Hijacker>) -> Self {
    self.hijacker = hijacker;
    self
  }

  pub fn with_connector(mut self, connector: Arc<dyn OutboundConnector>) -> Self {
    self.connector = connector;
    self
  }

  pub fn registry(&self) -> &Arc<SessionRegistry> {
    &self.registry
  }

  /// Drives one connection from `initial` until it stops accepting streams.
  ///
  /// The connection is registered while serving and deregistered afterwards.
  /// Failed authentication closes the connection and is returned as an error.
  pub async fn run(
    self: Arc<Self>,
    tunnel: ArcTunnel,
    initial: DispatchState,
    shutdown: CancellationToken,
  ) -> Result<DispatchExit, AuthenticationError> {
    let id = tunnel.id();
    let remote = tunnel_addr(&tunnel);
    async move {
      let client_key = match initial {
        DispatchState::AwaitingAuth => {
          self
            .authenticate(&tunnel)
            .instrument(tracing::debug_span!("authentication", ?id))
            .await?
        }
        DispatchState::Serving(client_key) => client_key,
      };
      self.registry.add(client_key.clone(), Arc::clone(&tunnel));
      let exit = self
        .serve(&tunnel, &client_key, shutdown)
        .instrument(tracing::debug_span!("request_handling", client = %client_key))
        .await;
      self.registry.deregister(&client_key, id);
      tracing::debug!(?exit, "connection stopped serving");
      Ok(exit)
    }
    .instrument(tracing::debug_span!("tunnel", ?id, %remote))
    .await
  }

  async fn authenticate(&self, tunnel: &ArcTunnel) -> Result<ClientKey, AuthenticationError> {
    let mut stream = tunnel
      .accept_link()
      .await
      .map_err(AuthenticationError::Tunnel)?;
    let result = self.authenticate_stream(tunnel, &mut stream).await;
    // The response must reach the peer before the connection can be closed
    let _ = stream.close().await;
    match &result {
      Ok(client_key) => tracing::debug!(client = %client_key, "authenticated"),
      Err(error @ AuthenticationError::NotAuthentication(_))
      | Err(error @ AuthenticationError::Framing(_)) => {
        tracing::debug!(%error, "protocol violation on authentication stream");
        tunnel.close(
          close_code::PROTOCOL_VIOLATION,
          "the first stream must be used for authorization verification",
        );
      }
      Err(error @ AuthenticationError::Tunnel(_)) => {
        tracing::debug!(%error, "connection lost during authentication");
      }
      Err(error) => {
        tracing::info!(%error, "authentication failed");
        tunnel.close(close_code::AUTHENTICATION_FAILED, "failed authentication");
      }
    }
    result
  }

  async fn authenticate_stream(
    &self,
    tunnel: &ArcTunnel,
    stream: &mut WrappedStream,
  ) -> Result<ClientKey, AuthenticationError> {
    let request = Message::read_from(stream)
      .await
      .map_err(AuthenticationError::Framing)?;
    if request.kind() != MessageType::Auth {
      return Err(AuthenticationError::NotAuthentication(request.kind()));
    }
    match self.authorizer.authorize(request.payload()).await {
      Ok(Authorization::Authorized { client_key }) => {
        stream
          .write_all(AUTH_OK)
          .await
          .map_err(AuthenticationError::Io)?;
        let client_key = client_key
          .filter(|key| !key.is_empty())
          .unwrap_or_else(|| ClientKey::new(tunnel_addr(tunnel)));
        Ok(client_key)
      }
      Ok(Authorization::Rejected) => {
        let _ = stream.write_all(AUTH_FAILED).await;
        Err(AuthenticationError::Rejected)
      }
      Err(error) => {
        let _ = stream.write_all(AUTH_FAILED).await;
        Err(AuthenticationError::Authorizer(error))
      }
    }
  }

  async fn serve(
    self: &Arc<Self>,
    tunnel: &ArcTunnel,
    client_key: &ClientKey,
    shutdown: CancellationToken,
  ) -> DispatchExit {
    loop {
      let stream = tokio::select! {
        _ = shutdown.cancelled() => return DispatchExit::Cancelled,
        accepted = tunnel.accept_link() => match accepted {
          Ok(stream) => stream,
          Err(error) => return DispatchExit::Closed(error),
        },
      };
      let this = Arc::clone(self);
      let client_key = client_key.clone();
      let span = tracing::debug_span!("stream", stream_id = stream.id());
      tokio::spawn(
        async move {
          let handled = AssertUnwindSafe(this.handle_stream(stream, client_key))
            .catch_unwind()
            .await;
          if handled.is_err() {
            tracing::error!("stream handler panicked");
          }
        }
        .instrument(span),
      );
    }
  }

  async fn handle_stream(&self, mut stream: WrappedStream, client_key: ClientKey) {
    let message = match Message::read_from(&mut stream).await {
      Ok(message) => message,
      Err(error) => {
        tracing::debug!(%error, "dropping stream with unreadable request");
        let _ = stream.close().await;
        return;
      }
    };
    tracing::trace!(%message, "dispatching");
    let (message, mut stream) = match self.hijacker.hijack(message, stream).await {
      Hijack::Continue(message, stream) => (message, stream),
      Hijack::Handled => {
        tracing::trace!("stream taken by hijacker");
        return;
      }
    };
    match (message.kind(), message.target()) {
      (MessageType::Connect, Some(target)) => {
        if let Err(error) = proxy_connect(stream, target, self.connector.as_ref()).await {
          tracing::debug!(%error, "connect request failed");
        }
      }
      (MessageType::Ping, _) => {
        if let Err(error) = keepalive::respond(&mut stream, &client_key).await {
          tracing::debug!(%error, "keepalive responder stopped");
        }
        let _ = stream.close().await;
      }
      (kind, _) => {
        tracing::debug!(%kind, "ignoring stream");
        let _ = stream.close().await;
      }
    }
  }
}

fn tunnel_addr(tunnel: &ArcTunnel) -> String {
  tunnel.addr().to_string()
}
