// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{net::SocketAddr, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tunnelquic::{
  client::{self, ClientOptions, SessionOptions},
  common::tls,
};

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ClientArgs {
  pub authority_cert: Option<PathBuf>,
  pub server_addr: SocketAddr,
  pub server_san: String,
  pub credential: String,
  pub keepalive: bool,
}

fn build_options(config: &ClientArgs) -> Result<ClientOptions> {
  let client_config = match &config.authority_cert {
    Some(authority) => tls::client_config_with_authority(authority)
      .context("Failed loading certificate authority")?,
    None => {
      tracing::warn!("no authority given, server certificates will not be verified");
      tls::insecure_client_config()
    }
  };
  let defaults = SessionOptions::default();
  Ok(ClientOptions {
    server_name: config.server_san.clone(),
    client_config,
    session: SessionOptions {
      keepalive: defaults.keepalive.filter(|_| config.keepalive),
      ..defaults
    },
    ..ClientOptions::default()
  })
}

/// Connect to a server and serve its requests until interrupted or disconnected
#[tracing::instrument(skip(config), fields(server = %config.server_addr), err)]
pub async fn client_main(config: ClientArgs) -> Result<()> {
  let options = build_options(&config)?;
  let session = client::connect(config.server_addr, config.credential.as_bytes(), options)
    .await
    .context("Failed establishing session")?;

  let shutdown = CancellationToken::new();
  let sigint_handler_task = {
    let shutdown_trigger = shutdown.clone();
    tokio::task::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::trace!("SIGINT detected, initiating graceful shutdown");
      shutdown_trigger.cancel();
    })
  };

  tokio::select! {
    _ = shutdown.cancelled() => {
      tracing::info!("closing session");
    }
    reason = session.closed() => {
      tracing::info!(%reason, "session ended by server");
    }
  }
  session.close().await;

  sigint_handler_task.abort();
  let _cancelled = sigint_handler_task.await;
  Ok(())
}
