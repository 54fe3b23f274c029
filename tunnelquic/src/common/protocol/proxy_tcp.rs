// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};
use std::{
  io::{Error as IOError, ErrorKind},
  net::SocketAddr,
};
use tokio::net::TcpStream;
use tracing_futures::Instrument;

use crate::{
  common::protocol::message::ConnectTarget,
  util::{
    splice_streams,
    tunnel_stream::{TunnelStream, WrappedStream},
    SpliceEnd,
  },
};

/// Makes the local connection a Connect request asks for
pub trait OutboundConnector: Send + Sync + 'static {
  fn connect<'a>(
    &'a self,
    target: &'a ConnectTarget,
  ) -> BoxFuture<'a, Result<Box<dyn TunnelStream + 'static>, IOError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressFamily {
  Any,
  V4,
  V6,
}

/// Dials `tcp`, `tcp4`, and `tcp6` targets with the system resolver
#[derive(Debug, Default, Clone)]
pub struct TcpOutboundConnector {
  pub local_only: bool,
}

impl TcpOutboundConnector {
  pub fn new(local_only: bool) -> Self {
    Self { local_only }
  }

  fn family_of(protocol: &str) -> Option<AddressFamily> {
    match protocol {
      "tcp" => Some(AddressFamily::Any),
      "tcp4" => Some(AddressFamily::V4),
      "tcp6" => Some(AddressFamily::V6),
      _ => None,
    }
  }

  async fn resolve(&self, address: &str, family: AddressFamily) -> Result<Vec<SocketAddr>, IOError> {
    let mut addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
      .await?
      .filter(|addr| match family {
        AddressFamily::Any => true,
        AddressFamily::V4 => addr.is_ipv4(),
        AddressFamily::V6 => addr.is_ipv6(),
      })
      .collect();
    if self.local_only {
      addrs.retain(|addr| addr.ip().is_loopback());
    }
    if addrs.is_empty() {
      return Err(IOError::new(
        ErrorKind::AddrNotAvailable,
        format!("no usable addresses for {}", address),
      ));
    }
    Ok(addrs)
  }
}

impl OutboundConnector for TcpOutboundConnector {
  fn connect<'a>(
    &'a self,
    target: &'a ConnectTarget,
  ) -> BoxFuture<'a, Result<Box<dyn TunnelStream + 'static>, IOError>> {
    async move {
      let family = Self::family_of(target.protocol()).ok_or_else(|| {
        IOError::new(
          ErrorKind::Unsupported,
          format!("unsupported protocol {:?}", target.protocol()),
        )
      })?;
      let addrs = self.resolve(target.address(), family).await?;
      tracing::debug!(?addrs, "connecting to proxy destination");
      let stream = TcpStream::connect(addrs.as_slice()).await?;
      Ok(Box::new(stream) as Box<dyn TunnelStream>)
    }
    .boxed()
  }
}

/// Serves a Connect request: dials `target` and splices it with the tunnel stream.
///
/// When dialing fails the tunnel stream is closed and the error returned.
pub async fn proxy_connect(
  mut stream: WrappedStream,
  target: &ConnectTarget,
  connector: &dyn OutboundConnector,
) -> Result<SpliceEnd, IOError> {
  let span = tracing::debug_span!("proxy_tcp", stream_id = stream.id(), %target);
  async move {
    let outbound = match connector.connect(target).await {
      Ok(outbound) => outbound,
      Err(error) => {
        tracing::debug!(%error, "failed to connect to proxy destination");
        let _ = stream.close().await;
        return Err(error);
      }
    };
    tracing::debug!("performing proxy streaming");
    let end = splice_streams(stream, outbound).await;
    tracing::debug!(?end, "closing stream");
    end
  }
  .instrument(span)
  .await
}
