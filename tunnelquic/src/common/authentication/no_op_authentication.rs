// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};

use super::traits::{Authorization, Authorizer};
use crate::common::protocol::tunnel::ClientKey;

/// Accepts every credential, registering each connection under its peer address
#[derive(Default, Clone, Copy)]
pub struct AllowAllAuthorizer;

impl AllowAllAuthorizer {
  pub fn new() -> AllowAllAuthorizer {
    AllowAllAuthorizer
  }
}

impl std::fmt::Debug for AllowAllAuthorizer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({})", std::any::type_name::<AllowAllAuthorizer>())
  }
}

impl Authorizer for AllowAllAuthorizer {
  fn authorize<'a>(&'a self, _credential: &'a [u8]) -> BoxFuture<'a, anyhow::Result<Authorization>> {
    futures::future::ready(Ok(Authorization::authorized_as_peer())).boxed()
  }
}

/// Accepts every credential under one fixed key.
///
/// Clients use this for the connection back to their server, whose streams
/// need no authentication.
#[derive(Debug, Clone)]
pub struct FixedIdentityAuthorizer {
  identity: ClientKey,
}

impl FixedIdentityAuthorizer {
  pub fn new(identity: ClientKey) -> Self {
    Self { identity }
  }
}

impl Authorizer for FixedIdentityAuthorizer {
  fn authorize<'a>(&'a self, _credential: &'a [u8]) -> BoxFuture<'a, anyhow::Result<Authorization>> {
    futures::future::ready(Ok(Authorization::authorized(self.identity.clone()))).boxed()
  }
}
