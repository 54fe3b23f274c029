// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};

use crate::{
  common::protocol::{message::Message, tunnel::ClientKey},
  util::tunnel_stream::WrappedStream,
};

/// Response written on the authentication stream when a credential is accepted
pub const AUTH_OK: &[u8] = b"ok";
/// Response written on the authentication stream when a credential is refused
pub const AUTH_FAILED: &[u8] = b"failed";

/// The verdict of an [Authorizer] on one credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
  /// Accepted; `None` or an empty key registers the connection under its peer address
  Authorized { client_key: Option<ClientKey> },
  Rejected,
}

impl Authorization {
  pub fn authorized(client_key: impl Into<ClientKey>) -> Self {
    Authorization::Authorized {
      client_key: Some(client_key.into()),
    }
  }

  pub fn authorized_as_peer() -> Self {
    Authorization::Authorized { client_key: None }
  }
}

/// Decides whether a credential may open a session, and under which key
pub trait Authorizer: std::fmt::Debug + Send + Sync + 'static {
  fn authorize<'a>(&'a self, credential: &'a [u8]) -> BoxFuture<'a, anyhow::Result<Authorization>>;
}

/// Adapts a plain function into an [Authorizer]
pub struct FnAuthorizer<F>(F);

pub fn authorizer_fn<F>(f: F) -> FnAuthorizer<F>
where
  F: Fn(&[u8]) -> anyhow::Result<Authorization> + Send + Sync + 'static,
{
  FnAuthorizer(f)
}

impl<F> std::fmt::Debug for FnAuthorizer<F> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({})", std::any::type_name::<Self>())
  }
}

impl<F> Authorizer for FnAuthorizer<F>
where
  F: Fn(&[u8]) -> anyhow::Result<Authorization> + Send + Sync + 'static,
{
  fn authorize<'a>(&'a self, credential: &'a [u8]) -> BoxFuture<'a, anyhow::Result<Authorization>> {
    futures::future::ready((self.0)(credential)).boxed()
  }
}

/// What a [Hijacker] did with a stream
pub enum Hijack {
  /// Hand the message and stream back to normal dispatch
  Continue(Message, WrappedStream),
  /// The hijacker took the stream; dispatch drops it from consideration
  Handled,
}

impl std::fmt::Debug for Hijack {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Hijack::Continue(message, stream) => f
        .debug_tuple("Continue")
        .field(message)
        .field(stream)
        .finish(),
      Hijack::Handled => f.write_str("Handled"),
    }
  }
}

/// Sees every decoded stream-opening message before the dispatcher does
pub trait Hijacker: std::fmt::Debug + Send + Sync + 'static {
  fn hijack(&self, message: Message, stream: WrappedStream) -> BoxFuture<'static, Hijack>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughHijacker;

impl Hijacker for PassthroughHijacker {
  fn hijack(&self, message: Message, stream: WrappedStream) -> BoxFuture<'static, Hijack> {
    futures::future::ready(Hijack::Continue(message, stream)).boxed()
  }
}

/// Adapts a function returning a future into a [Hijacker]
pub struct FnHijacker<F>(F);

pub fn hijacker_fn<F>(f: F) -> FnHijacker<F>
where
  F: Fn(Message, WrappedStream) -> BoxFuture<'static, Hijack> + Send + Sync + 'static,
{
  FnHijacker(f)
}

impl<F> std::fmt::Debug for FnHijacker<F> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({})", std::any::type_name::<Self>())
  }
}

impl<F> Hijacker for FnHijacker<F>
where
  F: Fn(Message, WrappedStream) -> BoxFuture<'static, Hijack> + Send + Sync + 'static,
{
  fn hijack(&self, message: Message, stream: WrappedStream) -> BoxFuture<'static, Hijack> {
    (self.0)(message, stream)
  }
}
