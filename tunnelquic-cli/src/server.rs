// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tunnelquic::{
  common::{
    authentication::{Authorizer, CredentialKeyAuthorizer, SharedSecretAuthorizer},
    protocol::{tunnel::ClientKey, Dialer},
    tls,
  },
  server::Server,
};

const PROBE_BACKOFF_START: Duration = Duration::from_millis(500);
const PROBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Repeatedly dials a target through one client's tunnel and reports what answers
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ProbeArgs {
  pub client_key: String,
  pub target: String,
  pub interval: Duration,
}

/// Parameters used to run a tunnel server
#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ServerArgs {
  pub bind_addr: SocketAddr,
  pub cert: Option<(PathBuf, PathBuf)>,
  pub san: String,
  /// `(client_key, secret)` pairs; when empty, credentials are taken as client keys
  pub secrets: Vec<(String, String)>,
  pub probe: Option<ProbeArgs>,
}

fn build_authorizer(secrets: &[(String, String)]) -> Arc<dyn Authorizer> {
  if secrets.is_empty() {
    return Arc::new(CredentialKeyAuthorizer);
  }
  let authorizer = secrets
    .iter()
    .fold(SharedSecretAuthorizer::new(), |authorizer, (key, secret)| {
      authorizer.with_secret(secret.as_bytes().to_vec(), ClientKey::from(key.as_str()))
    });
  Arc::new(authorizer)
}

fn build_quinn_config(config: &ServerArgs) -> Result<quinn::ServerConfig> {
  match &config.cert {
    Some((cert, key)) => {
      tls::load_server_config(cert, key).context("Failed loading certificate and private key")
    }
    None => {
      tracing::warn!(san = %config.san, "no certificate given, generating a self-signed one");
      tls::self_signed_server_config(&config.san).context("Self-signed certificate generation failed")
    }
  }
}

/// Run a tunnel server until interrupted
#[tracing::instrument(skip(config), fields(bind = %config.bind_addr), err)]
pub async fn server_main(config: self::ServerArgs) -> Result<()> {
  let quinn_config = build_quinn_config(&config)?;
  let server = Arc::new(
    Server::builder(config.bind_addr, quinn_config)
      .authorizer(build_authorizer(&config.secrets))
      .bind()
      .context("Failed binding QUIC endpoint")?,
  );
  tracing::info!(local_addr = ?server.local_addr().ok(), "server listening");

  let (shutdown, sigint_handler_task) = {
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    let sigint_handler_task = tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    });
    (shutdown, sigint_handler_task)
  };

  let probe_task = config.probe.clone().map(|probe| {
    let dialer = server.dialer(probe.client_key.as_str());
    let server = Arc::clone(&server);
    let shutdown = shutdown.child_token();
    tokio::task::spawn(
      async move {
        tokio::select! {
          _ = shutdown.cancelled() => {},
          _ = probe_loop(&server, dialer, &probe) => {},
        }
      }
      .instrument(tracing::info_span!("probe")),
    )
  });

  server.run(shutdown.clone()).await;
  server.shutdown().await;

  if let Some(probe_task) = probe_task {
    probe_task.abort();
    let _ = probe_task.await;
  }
  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;

  Ok(())
}

async fn wait_for_session(server: &Server, client_key: &ClientKey) {
  let mut backoff = PROBE_BACKOFF_START;
  while !server.has_session(client_key) {
    tracing::debug!(client = %client_key, ?backoff, "waiting for client session");
    tokio::time::sleep(backoff).await;
    backoff = std::cmp::min(backoff * 2, PROBE_BACKOFF_MAX);
  }
}

async fn probe_loop(server: &Server, dialer: Dialer, probe: &ProbeArgs) {
  let client_key = ClientKey::from(probe.client_key.as_str());
  loop {
    wait_for_session(server, &client_key).await;
    match probe_once(&dialer, &probe.target).await {
      Ok(status) => tracing::info!(target = %probe.target, %status, "probe answered"),
      Err(error) => tracing::warn!(target = %probe.target, error = %format!("{:#}", error), "probe failed"),
    }
    tokio::time::sleep(probe.interval).await;
  }
}

async fn probe_once(dialer: &Dialer, target: &str) -> Result<String> {
  let connection = dialer.dial("tcp", target).await?;
  let mut connection = BufReader::new(connection);
  let host = target.rsplit_once(':').map_or(target, |(host, _port)| host);
  let request = format!("HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", host);
  connection.get_mut().write_all(request.as_bytes()).await?;
  connection.get_mut().flush().await?;
  let mut status = String::new();
  connection
    .read_line(&mut status)
    .await
    .context("Failed reading response status")?;
  let mut connection = connection.into_inner();
  let _ = connection.close().await;
  Ok(status.trim_end().to_string())
}
