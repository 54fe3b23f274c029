// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Tracks the live, authenticated connections of every client key.
//!
//! A key may hold several connections at once; the first one registered is
//! used when dialing until it goes away. The registry lock only guards the
//! map itself, and is never held while a connection is being closed.

use std::{collections::HashMap, sync::Mutex};

use crate::common::protocol::{
  dialer::ConnectionDialer,
  tunnel::{close_code, ArcTunnel, ClientKey, TunnelId},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionLookupError {
  #[error("failed to find session for client {0}")]
  NoSession(ClientKey),
}

pub const SESSION_REMOVED_REASON: &str = "the server actively removes the connection.";

#[derive(Default)]
pub struct SessionRegistry {
  sessions: Mutex<HashMap<ClientKey, Vec<ArcTunnel>>>,
}

impl SessionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Appends a connection to a key's list, creating the list if needed
  #[tracing::instrument(level = "debug", skip(self, tunnel), fields(tunnel = %tunnel.id()))]
  pub fn add(&self, client_key: ClientKey, tunnel: ArcTunnel) {
    let mut sessions = self.sessions.lock().expect("Mutex poisoned");
    let connections = sessions.entry(client_key).or_insert_with(Vec::new);
    connections.push(tunnel);
    tracing::debug!(connections = connections.len(), "registered connection");
  }

  /// Closes every connection of a key and forgets the key; returns how many were closed
  #[tracing::instrument(level = "debug", skip(self))]
  pub fn remove(&self, client_key: &ClientKey) -> usize {
    let removed = self
      .sessions
      .lock()
      .expect("Mutex poisoned")
      .remove(client_key)
      .unwrap_or_default();
    for tunnel in removed.iter() {
      tracing::debug!(tunnel = %tunnel.id(), "closing removed connection");
      tunnel.close(close_code::SESSION_REMOVED, SESSION_REMOVED_REASON);
    }
    removed.len()
  }

  /// Forgets one connection of a key without closing it.
  ///
  /// The key itself is dropped once its last connection is gone.
  pub fn deregister(&self, client_key: &ClientKey, tunnel_id: TunnelId) -> bool {
    let mut sessions = self.sessions.lock().expect("Mutex poisoned");
    let connections = match sessions.get_mut(client_key) {
      Some(connections) => connections,
      None => return false,
    };
    let before = connections.len();
    connections.retain(|tunnel| tunnel.id() != tunnel_id);
    let removed = connections.len() != before;
    if connections.is_empty() {
      sessions.remove(client_key);
    }
    if removed {
      tracing::debug!(client = %client_key, tunnel = %tunnel_id, "deregistered connection");
    }
    removed
  }

  /// Builds a dialer bound to the earliest registered connection of a key
  pub fn get_dialer(&self, client_key: &ClientKey) -> Result<ConnectionDialer, SessionLookupError> {
    let sessions = self.sessions.lock().expect("Mutex poisoned");
    sessions
      .get(client_key)
      .and_then(|connections| connections.first())
      .map(|tunnel| ConnectionDialer::new(client_key.clone(), tunnel.clone()))
      .ok_or_else(|| SessionLookupError::NoSession(client_key.clone()))
  }

  pub fn has_session(&self, client_key: &ClientKey) -> bool {
    self
      .sessions
      .lock()
      .expect("Mutex poisoned")
      .get(client_key)
      .map_or(false, |connections| !connections.is_empty())
  }

  pub fn connection_count(&self, client_key: &ClientKey) -> usize {
    self
      .sessions
      .lock()
      .expect("Mutex poisoned")
      .get(client_key)
      .map_or(0, Vec::len)
  }

  pub fn client_keys(&self) -> Vec<ClientKey> {
    self
      .sessions
      .lock()
      .expect("Mutex poisoned")
      .keys()
      .cloned()
      .collect()
  }
}

impl std::fmt::Debug for SessionRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let sessions = self.sessions.lock().expect("Mutex poisoned");
    f.debug_map()
      .entries(
        sessions
          .iter()
          .map(|(key, connections)| (key, connections.len())),
      )
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::{SessionLookupError, SessionRegistry};
  use crate::common::protocol::tunnel::{
    close_code,
    duplex::{channel_with_ids, DuplexTunnel},
    ArcTunnel, ClientKey, TunnelId,
  };
  use std::sync::Arc;

  fn pair(listener_id: u64) -> (Arc<DuplexTunnel>, DuplexTunnel) {
    let tunnels = channel_with_ids(TunnelId::new(listener_id), TunnelId::new(1000 + listener_id));
    (Arc::new(tunnels.listener), tunnels.connector)
  }

  #[test]
  fn lookup_of_unknown_key_fails() {
    let registry = SessionRegistry::new();
    let key = ClientKey::from("missing");
    let error = registry.get_dialer(&key).unwrap_err();
    assert_eq!(error, SessionLookupError::NoSession(key.clone()));
    assert_eq!(error.to_string(), "failed to find session for client missing");
    assert!(!registry.has_session(&key));
    assert_eq!(registry.remove(&key), 0);
  }

  #[test]
  fn dialer_targets_first_registered_connection() {
    let registry = SessionRegistry::new();
    let key = ClientKey::from("c1");
    let (first, _first_remote) = pair(1);
    let (second, _second_remote) = pair(2);
    registry.add(key.clone(), first.clone() as ArcTunnel);
    registry.add(key.clone(), second.clone() as ArcTunnel);
    assert_eq!(registry.connection_count(&key), 2);
    assert_eq!(registry.get_dialer(&key).unwrap().tunnel_id(), TunnelId::new(1));

    assert!(registry.deregister(&key, TunnelId::new(1)));
    assert_eq!(registry.get_dialer(&key).unwrap().tunnel_id(), TunnelId::new(2));
    assert!(!first.is_closed(), "Deregistering must not close the connection");

    assert!(registry.deregister(&key, TunnelId::new(2)));
    assert!(!registry.has_session(&key));
    assert!(registry.client_keys().is_empty());
  }

  #[test]
  fn remove_closes_every_connection_of_the_key() {
    let registry = SessionRegistry::new();
    let key = ClientKey::from("c1");
    let other = ClientKey::from("c2");
    let (first, _r1) = pair(1);
    let (second, _r2) = pair(2);
    let (unrelated, _r3) = pair(3);
    registry.add(key.clone(), first.clone() as ArcTunnel);
    registry.add(key.clone(), second.clone() as ArcTunnel);
    registry.add(other.clone(), unrelated.clone() as ArcTunnel);

    assert_eq!(registry.remove(&key), 2);
    assert!(!registry.has_session(&key));
    assert!(registry.get_dialer(&key).is_err());
    for tunnel in [&first, &second] {
      let (code, _) = tunnel.close_reason().unwrap();
      assert_eq!(code, close_code::SESSION_REMOVED);
    }
    assert!(!unrelated.is_closed());
    assert!(registry.has_session(&other));
  }
}
