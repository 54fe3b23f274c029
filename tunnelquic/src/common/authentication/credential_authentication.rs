// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::collections::HashMap;

use futures::future::{BoxFuture, FutureExt};

use super::traits::{Authorization, Authorizer};
use crate::common::protocol::tunnel::ClientKey;

/// Uses the credential itself as the client key; empty or non-UTF-8 credentials are refused
#[derive(Debug, Default, Clone, Copy)]
pub struct CredentialKeyAuthorizer;

impl Authorizer for CredentialKeyAuthorizer {
  fn authorize<'a>(&'a self, credential: &'a [u8]) -> BoxFuture<'a, anyhow::Result<Authorization>> {
    let verdict = match std::str::from_utf8(credential) {
      Ok(key) if !key.is_empty() => Authorization::authorized(key),
      _ => Authorization::Rejected,
    };
    futures::future::ready(Ok(verdict)).boxed()
  }
}

/// Maps known shared secrets to the client keys they grant
#[derive(Clone, Default)]
pub struct SharedSecretAuthorizer {
  secrets: HashMap<Vec<u8>, ClientKey>,
}

impl SharedSecretAuthorizer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_secret(mut self, secret: impl Into<Vec<u8>>, client_key: impl Into<ClientKey>) -> Self {
    self.secrets.insert(secret.into(), client_key.into());
    self
  }

  pub fn len(&self) -> usize {
    self.secrets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.secrets.is_empty()
  }
}

impl std::fmt::Debug for SharedSecretAuthorizer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    // Secrets stay out of logs
    f.debug_struct("SharedSecretAuthorizer")
      .field("clients", &self.secrets.values().collect::<Vec<_>>())
      .finish()
  }
}

impl Authorizer for SharedSecretAuthorizer {
  fn authorize<'a>(&'a self, credential: &'a [u8]) -> BoxFuture<'a, anyhow::Result<Authorization>> {
    let verdict = match self.secrets.get(credential) {
      Some(client_key) => Authorization::authorized(client_key.clone()),
      None => Authorization::Rejected,
    };
    futures::future::ready(Ok(verdict)).boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::{CredentialKeyAuthorizer, SharedSecretAuthorizer};
  use crate::common::authentication::traits::{Authorization, Authorizer};

  #[tokio::test]
  async fn credential_becomes_key() {
    let authorizer = CredentialKeyAuthorizer;
    assert_eq!(
      authorizer.authorize(b"c1").await.unwrap(),
      Authorization::authorized("c1")
    );
    assert_eq!(authorizer.authorize(b"").await.unwrap(), Authorization::Rejected);
    assert_eq!(
      authorizer.authorize(&[0xff, 0xfe]).await.unwrap(),
      Authorization::Rejected
    );
  }

  #[tokio::test]
  async fn shared_secrets_map_to_keys() {
    let authorizer = SharedSecretAuthorizer::new()
      .with_secret("hunter2", "alice")
      .with_secret(b"s3cret".to_vec(), "bob");
    assert_eq!(authorizer.len(), 2);
    assert_eq!(
      authorizer.authorize(b"s3cret").await.unwrap(),
      Authorization::authorized("bob")
    );
    assert_eq!(
      authorizer.authorize(b"alice").await.unwrap(),
      Authorization::Rejected
    );
    let rendered = format!("{:?}", authorizer);
    assert!(!rendered.contains("hunter2"));
  }
}
