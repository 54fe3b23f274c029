// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Accepting, authenticating, and tracking client connections, and dialing back through them

use std::{net::SocketAddr, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::{
  authentication::{AllowAllAuthorizer, Authorizer, Hijacker},
  daemon::{DispatchExit, DispatchState, StreamDispatcher},
  protocol::{
    proxy_tcp::OutboundConnector,
    tunnel::{
      close_code,
      registry::{SessionLookupError, SessionRegistry},
      ArcTunnel, ClientKey, QuinnTunnel, Tunnel, TunnelId, TunnelIdGenerator,
    },
    ConnectionDialer, Dialer,
  },
};

pub struct ServerBuilder {
  bind_addr: SocketAddr,
  server_config: quinn::ServerConfig,
  authorizer: Arc<dyn Authorizer>,
  hijacker: Option<Arc<dyn Hijacker>>,
  connector: Option<Arc<dyn OutboundConnector>>,
}

impl ServerBuilder {
  pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
    self.authorizer = authorizer;
    self
  }

  pub fn hijacker(mut self, hijacker: Arc<dyn Hijacker>) -> Self {
    self.hijacker = Some(hijacker);
    self
  }

  pub fn connector(mut self, connector: Arc<dyn OutboundConnector>) -> Self {
    self.connector = Some(connector);
    self
  }

  /// Binds the QUIC endpoint; connections are not accepted until [`Server::run`]
  pub fn bind(self) -> std::io::Result<Server> {
    let endpoint = quinn::Endpoint::server(self.server_config, self.bind_addr)?;
    let registry = Arc::new(SessionRegistry::new());
    let mut dispatcher = StreamDispatcher::new(Arc::clone(&registry), self.authorizer);
    if let Some(hijacker) = self.hijacker {
      dispatcher = dispatcher.with_hijacker(hijacker);
    }
    if let Some(connector) = self.connector {
      dispatcher = dispatcher.with_connector(connector);
    }
    Ok(Server {
      endpoint,
      registry,
      dispatcher: Arc::new(dispatcher),
      tunnel_ids: TunnelIdGenerator::default(),
    })
  }
}

pub struct Server {
  endpoint: quinn::Endpoint,
  registry: Arc<SessionRegistry>,
  dispatcher: Arc<StreamDispatcher>,
  tunnel_ids: TunnelIdGenerator,
}

impl Server {
  /// Defaults to authorizing every peer under its own address
  pub fn builder(bind_addr: SocketAddr, server_config: quinn::ServerConfig) -> ServerBuilder {
    ServerBuilder {
      bind_addr,
      server_config,
      authorizer: Arc::new(AllowAllAuthorizer::new()),
      hijacker: None,
      connector: None,
    }
  }

  pub fn bind(
    bind_addr: SocketAddr,
    server_config: quinn::ServerConfig,
    authorizer: Arc<dyn Authorizer>,
  ) -> std::io::Result<Server> {
    Self::builder(bind_addr, server_config)
      .authorizer(authorizer)
      .bind()
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.endpoint.local_addr()
  }

  pub fn sessions(&self) -> &Arc<SessionRegistry> {
    &self.registry
  }

  /// A dialer for `client_key`, resolving its connection on each dial
  pub fn dialer(&self, client_key: impl Into<ClientKey>) -> Dialer {
    Dialer::new(Arc::clone(&self.registry), client_key.into())
  }

  pub fn get_dialer(&self, client_key: &ClientKey) -> Result<ConnectionDialer, SessionLookupError> {
    self.registry.get_dialer(client_key)
  }

  pub fn has_session(&self, client_key: &ClientKey) -> bool {
    self.registry.has_session(client_key)
  }

  /// Closes every connection of `client_key`
  pub fn remove(&self, client_key: &ClientKey) -> usize {
    self.registry.remove(client_key)
  }

  /// Accepts connections until `shutdown` fires or the endpoint closes
  pub async fn run(&self, shutdown: CancellationToken) {
    let local_addr = self.endpoint.local_addr().ok();
    async {
      tracing::info!("accepting connections");
      loop {
        let connecting = tokio::select! {
          _ = shutdown.cancelled() => break,
          incoming = self.endpoint.accept() => match incoming {
            Some(connecting) => connecting,
            None => break,
          },
        };
        let id = self.tunnel_ids.next();
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = shutdown.child_token();
        tokio::spawn(
          handle_connection(id, connecting, dispatcher, shutdown)
            .instrument(tracing::info_span!("connection", %id)),
        );
      }
      tracing::info!("stopped accepting connections");
    }
    .instrument(tracing::info_span!("server", ?local_addr))
    .await
  }

  /// Closes every connection and waits for the endpoint to drain
  pub async fn shutdown(&self) {
    self
      .endpoint
      .close(quinn::VarInt::from_u32(close_code::GRACEFUL), b"server shutting down");
    self.endpoint.wait_idle().await;
  }
}

async fn handle_connection(
  id: TunnelId,
  connecting: quinn::Connecting,
  dispatcher: Arc<StreamDispatcher>,
  shutdown: CancellationToken,
) {
  let remote = connecting.remote_address();
  let connection = match connecting.await {
    Ok(connection) => connection,
    Err(error) => {
      tracing::warn!(%remote, %error, "handshake failed");
      return;
    }
  };
  let tunnel: ArcTunnel = Arc::new(QuinnTunnel::new(id, connection));
  match dispatcher
    .run(Arc::clone(&tunnel), DispatchState::AwaitingAuth, shutdown)
    .await
  {
    Ok(DispatchExit::Cancelled) => {
      tunnel.close(close_code::GRACEFUL, "server shutting down");
    }
    Ok(DispatchExit::Closed(reason)) => {
      tracing::info!(%remote, %reason, "connection closed");
    }
    Err(error) => {
      tracing::info!(%remote, %error, "connection rejected");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::Server;
  use crate::{
    client::{self, ClientOptions, ConnectError},
    common::{
      authentication::{authorizer_fn, Authorization},
      protocol::{
        proxy_tcp::OutboundConnector,
        tunnel::ClientKey,
        ConnectTarget,
      },
      tls,
    },
    util::tunnel_stream::TunnelStream,
  };
  use futures::future::{BoxFuture, FutureExt};
  use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
  };
  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
  };
  use tokio_util::sync::CancellationToken;

  async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let (mut socket, _) = match listener.accept().await {
          Ok(accepted) => accepted,
          Err(_) => break,
        };
        tokio::spawn(async move {
          let (mut reader, mut writer) = socket.split();
          let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
      }
    });
    addr
  }

  /// Records requested targets and dials a fixed local address instead
  #[derive(Debug)]
  struct RedirectingConnector {
    to: SocketAddr,
    requested: Mutex<Vec<ConnectTarget>>,
  }

  impl OutboundConnector for RedirectingConnector {
    fn connect<'a>(
      &'a self,
      target: &'a ConnectTarget,
    ) -> BoxFuture<'a, std::io::Result<Box<dyn TunnelStream + 'static>>> {
      self
        .requested
        .lock()
        .expect("Mutex poisoned")
        .push(target.clone());
      let to = self.to;
      async move {
        let stream = tokio::net::TcpStream::connect(to).await?;
        Ok(Box::new(stream) as Box<dyn TunnelStream>)
      }
      .boxed()
    }
  }

  fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
  }

  fn client_options() -> ClientOptions {
    ClientOptions {
      bind_addr: loopback(),
      ..ClientOptions::default()
    }
  }

  #[tokio::test]
  async fn dials_both_ways_over_quic() {
    crate::init_test_logging();
    let fut = async move {
      let echo = echo_server().await;
      let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
      let connector = Arc::new(RedirectingConnector {
        to: target.local_addr().unwrap(),
        requested: Mutex::new(Vec::new()),
      });
      let authorizer = authorizer_fn(|credential: &[u8]| {
        Ok(match credential {
          b"secret" => Authorization::authorized("c1"),
          _ => Authorization::Rejected,
        })
      });
      let server = Arc::new(
        Server::builder(loopback(), tls::self_signed_server_config("localhost").unwrap())
          .authorizer(Arc::new(authorizer))
          .connector(connector.clone())
          .bind()
          .unwrap(),
      );
      let server_addr = server.local_addr().unwrap();
      let shutdown = CancellationToken::new();
      let serving = tokio::spawn({
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        async move { server.run(shutdown).await }
      });

      let session = client::connect(server_addr, b"secret", client_options())
        .await
        .unwrap();
      let key = ClientKey::from("c1");
      while !server.has_session(&key) {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }

      // Client to server: the server dials the requested target on the client's behalf
      let request: Vec<u8> = (0..100u8).collect();
      let reply: Vec<u8> = (0..50u8).rev().collect();
      let target_side = tokio::spawn({
        let reply = reply.clone();
        async move {
          let (mut socket, _) = target.accept().await.unwrap();
          let mut received = vec![0u8; 100];
          socket.read_exact(&mut received).await.unwrap();
          socket.write_all(&reply).await.unwrap();
          received
        }
      });
      let mut outbound = session.dial("tcp", "example.com:80").await.unwrap();
      outbound.write_all(&request).await.unwrap();
      let mut answered = vec![0u8; 50];
      outbound.read_exact(&mut answered).await.unwrap();
      assert_eq!(answered, reply);
      assert_eq!(target_side.await.unwrap(), request);
      assert_eq!(
        connector.requested.lock().expect("Mutex poisoned").as_slice(),
        &[ConnectTarget::new("tcp", "example.com:80")]
      );

      // Server to client: the client dials locally on the server's behalf
      let mut inbound = server
        .dialer("c1")
        .dial("tcp", &echo.to_string())
        .await
        .unwrap();
      let mut buf = [0u8; 5];
      inbound.write_all(b"world").await.unwrap();
      inbound.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"world");

      assert_eq!(server.remove(&key), 1);
      let closed = session.closed().await;
      assert_eq!(closed.application_code(), Some(200));
      session.close().await;

      shutdown.cancel();
      serving.await.unwrap();
      server.shutdown().await;
    };
    tokio::time::timeout(Duration::from_secs(10), fut)
      .await
      .expect("QUIC round trip deadlocked");
  }

  #[tokio::test]
  async fn wrong_credential_is_rejected() {
    crate::init_test_logging();
    let fut = async move {
      let authorizer = authorizer_fn(|credential: &[u8]| {
        Ok(match credential {
          b"secret" => Authorization::authorized("c1"),
          _ => Authorization::Rejected,
        })
      });
      let server = Arc::new(
        Server::bind(
          loopback(),
          tls::self_signed_server_config("localhost").unwrap(),
          Arc::new(authorizer),
        )
        .unwrap(),
      );
      let server_addr = server.local_addr().unwrap();
      let shutdown = CancellationToken::new();
      let serving = tokio::spawn({
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        async move { server.run(shutdown).await }
      });

      match client::connect(server_addr, b"wrong", client_options()).await {
        Err(ConnectError::AuthenticationFailed { response }) => assert_eq!(&response, b"failed"),
        other => panic!("Expected rejection, got {:?}", other.map(|_| ())),
      }
      assert!(server.sessions().client_keys().is_empty());

      shutdown.cancel();
      serving.await.unwrap();
      server.shutdown().await;
    };
    tokio::time::timeout(Duration::from_secs(10), fut)
      .await
      .expect("Rejected handshake deadlocked");
  }
}
