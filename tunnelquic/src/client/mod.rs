// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Establishing client sessions: connect, authenticate, then serve the server's streams

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{io::AsyncReadExt, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::{
  authentication::{FixedIdentityAuthorizer, Hijacker, PassthroughHijacker, AUTH_OK},
  daemon::{AuthenticationError, DispatchExit, DispatchState, StreamDispatcher},
  protocol::{
    keepalive::{self, KeepaliveError, KEEPALIVE_INTERVAL},
    message::Message,
    proxy_tcp::{OutboundConnector, TcpOutboundConnector},
    tunnel::{
      close_code, registry::SessionRegistry, ArcTunnel, ClientKey, QuinnTunnel, Tunnel, TunnelError,
      TunnelId,
    },
    ConnectionDialer, DialError, TunnelConnection,
  },
  tls,
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Key the client registers its own connection under
pub const LOCAL_IDENTITY: &str = "local";
const AUTH_RESPONSE_LIMIT: u64 = 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
  #[error("failed to bind local endpoint: {0}")]
  Bind(#[source] std::io::Error),
  #[error("failed to start connection: {0}")]
  Connect(#[from] quinn::ConnectError),
  #[error("connection failed: {0}")]
  Connection(#[from] quinn::ConnectionError),
  #[error("handshake did not complete within {0:?}")]
  HandshakeTimeout(Duration),
  #[error("failed to open authentication stream: {0}")]
  OpenStream(#[source] TunnelError),
  #[error("authentication exchange failed: {0}")]
  Io(#[from] std::io::Error),
  #[error("server authorization failed")]
  AuthenticationFailed { response: Vec<u8> },
}

/// Behaviour of an established session, independent of its transport
#[derive(Clone)]
pub struct SessionOptions {
  /// Interval of the keepalive stream; `None` disables it
  pub keepalive: Option<Duration>,
  pub local_identity: ClientKey,
  pub hijacker: Arc<dyn Hijacker>,
  pub connector: Arc<dyn OutboundConnector>,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self {
      keepalive: Some(KEEPALIVE_INTERVAL),
      local_identity: ClientKey::from(LOCAL_IDENTITY),
      hijacker: Arc::new(PassthroughHijacker),
      connector: Arc::new(TcpOutboundConnector::default()),
    }
  }
}

impl std::fmt::Debug for SessionOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SessionOptions")
      .field("keepalive", &self.keepalive)
      .field("local_identity", &self.local_identity)
      .field("hijacker", &self.hijacker)
      .finish_non_exhaustive()
  }
}

#[derive(Clone)]
pub struct ClientOptions {
  pub bind_addr: SocketAddr,
  /// Name presented for TLS server name indication and verification
  pub server_name: String,
  pub client_config: quinn::ClientConfig,
  pub handshake_timeout: Duration,
  pub session: SessionOptions,
}

impl Default for ClientOptions {
  fn default() -> Self {
    Self {
      bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
      server_name: tls::DEFAULT_SERVER_NAME.to_string(),
      client_config: tls::insecure_client_config(),
      handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
      session: SessionOptions::default(),
    }
  }
}

impl std::fmt::Debug for ClientOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ClientOptions")
      .field("bind_addr", &self.bind_addr)
      .field("server_name", &self.server_name)
      .field("handshake_timeout", &self.handshake_timeout)
      .field("session", &self.session)
      .finish_non_exhaustive()
  }
}

/// Presents `credential` on a fresh stream and requires an `ok` verdict
pub async fn authenticate(tunnel: &dyn Tunnel, credential: &[u8]) -> Result<(), ConnectError> {
  let mut stream = tunnel.open_link().await.map_err(ConnectError::OpenStream)?;
  let exchange = async {
    Message::auth(stream.id(), credential.to_vec())
      .write_to(&mut stream)
      .await?;
    let mut response = Vec::new();
    (&mut stream)
      .take(AUTH_RESPONSE_LIMIT)
      .read_to_end(&mut response)
      .await?;
    Ok::<_, ConnectError>(response)
  };
  let result = match exchange.await {
    Ok(response) if response == AUTH_OK => Ok(()),
    Ok(response) => Err(ConnectError::AuthenticationFailed { response }),
    Err(error) => Err(error),
  };
  let _ = stream.close().await;
  result
}

/// Dials `server_addr`, authenticates with `credential`, and starts serving the connection
#[tracing::instrument(level = "info", skip(credential, options), fields(server_name = %options.server_name), err)]
pub async fn connect(
  server_addr: SocketAddr,
  credential: &[u8],
  options: ClientOptions,
) -> Result<ClientSession, ConnectError> {
  let mut endpoint = quinn::Endpoint::client(options.bind_addr).map_err(ConnectError::Bind)?;
  endpoint.set_default_client_config(options.client_config.clone());
  let connecting = endpoint.connect(server_addr, &options.server_name)?;
  let connection = tokio::time::timeout(options.handshake_timeout, connecting)
    .await
    .map_err(|_| ConnectError::HandshakeTimeout(options.handshake_timeout))??;
  tracing::debug!(remote = %connection.remote_address(), "handshake complete");
  let tunnel: ArcTunnel = Arc::new(QuinnTunnel::new(TunnelId::new(0), connection));
  let mut session = ClientSession::establish(tunnel, credential, options.session).await?;
  session.endpoint = Some(endpoint);
  Ok(session)
}

/// An authenticated connection to a server, serving the streams the server opens
pub struct ClientSession {
  endpoint: Option<quinn::Endpoint>,
  tunnel: ArcTunnel,
  registry: Arc<SessionRegistry>,
  local_identity: ClientKey,
  shutdown: CancellationToken,
  dispatcher: JoinHandle<Result<DispatchExit, AuthenticationError>>,
  keepalive: Option<JoinHandle<KeepaliveError>>,
}

impl ClientSession {
  /// Authenticates over an existing tunnel, then starts its dispatcher and keepalive
  pub async fn establish(
    tunnel: ArcTunnel,
    credential: &[u8],
    options: SessionOptions,
  ) -> Result<Self, ConnectError> {
    if let Err(error) = authenticate(tunnel.as_ref(), credential).await {
      tracing::warn!(%error, "authentication failed");
      tunnel.close(close_code::GRACEFUL, "authentication failed");
      return Err(error);
    }
    tracing::info!("authenticated with server");
    Ok(Self::start(tunnel, options))
  }

  fn start(tunnel: ArcTunnel, options: SessionOptions) -> Self {
    let registry = Arc::new(SessionRegistry::new());
    let authorizer = Arc::new(FixedIdentityAuthorizer::new(options.local_identity.clone()));
    let dispatcher = StreamDispatcher::new(Arc::clone(&registry), authorizer)
      .with_hijacker(options.hijacker)
      .with_connector(options.connector);
    let shutdown = CancellationToken::new();
    let dispatcher = tokio::spawn(Arc::new(dispatcher).run(
      Arc::clone(&tunnel),
      DispatchState::Serving(options.local_identity.clone()),
      shutdown.clone(),
    ));
    let keepalive = options.keepalive.map(|interval| {
      let tunnel = Arc::clone(&tunnel);
      tokio::spawn(
        async move {
          let stopped = keepalive::run_keepalive(tunnel, interval).await;
          tracing::debug!(reason = %stopped, "keepalive stopped");
          stopped
        }
        .instrument(tracing::debug_span!("keepalive")),
      )
    });
    Self {
      endpoint: None,
      tunnel,
      registry,
      local_identity: options.local_identity,
      shutdown,
      dispatcher,
      keepalive,
    }
  }

  pub fn tunnel(&self) -> &ArcTunnel {
    &self.tunnel
  }

  pub fn local_identity(&self) -> &ClientKey {
    &self.local_identity
  }

  /// Connections the client is serving, keyed by its local identity
  pub fn registry(&self) -> &Arc<SessionRegistry> {
    &self.registry
  }

  /// A dialer reaching through this session to whatever the server can connect to
  pub fn dialer(&self) -> ConnectionDialer {
    ConnectionDialer::new(self.local_identity.clone(), Arc::clone(&self.tunnel))
  }

  pub async fn dial(&self, protocol: &str, address: &str) -> Result<TunnelConnection, DialError> {
    self.dialer().dial(protocol, address).await
  }

  /// Resolves once the underlying connection has closed
  pub async fn closed(&self) -> TunnelError {
    self.tunnel.closed().await
  }

  /// Stops serving, closes the connection, and waits for the endpoint to drain
  pub async fn close(self) {
    self.shutdown.cancel();
    if let Some(keepalive) = &self.keepalive {
      keepalive.abort();
    }
    self.tunnel.close(close_code::GRACEFUL, "client closing");
    if let Err(error) = self.dispatcher.await {
      tracing::debug!(%error, "dispatcher task failed");
    }
    if let Some(endpoint) = self.endpoint {
      endpoint.wait_idle().await;
    }
  }
}

impl std::fmt::Debug for ClientSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ClientSession")
      .field("tunnel", &self.tunnel.id())
      .field("remote", &self.tunnel.addr())
      .field("local_identity", &self.local_identity)
      .finish_non_exhaustive()
  }
}
