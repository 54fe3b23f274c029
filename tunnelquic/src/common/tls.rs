// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! QUIC endpoint configuration: transport tuning, server certificates, and client trust.

use std::{
  fs::File,
  io::BufReader,
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use quinn::{IdleTimeout, TransportConfig, VarInt};

/// Transport-level keepalive, independent of the application keepalive stream
pub const TRANSPORT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 30_000;
pub const DEFAULT_SERVER_NAME: &str = "localhost";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("failed to read {path:?}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("no certificates found in {0:?}")]
  NoCertificates(PathBuf),
  #[error("no private key found in {0:?}")]
  NoPrivateKey(PathBuf),
  #[error("invalid TLS configuration: {0}")]
  Rustls(#[from] rustls::Error),
  #[error("failed to generate certificate: {0}")]
  CertificateGeneration(#[from] rcgen::RcgenError),
}

pub fn transport_config() -> TransportConfig {
  let mut transport_config = TransportConfig::default();
  transport_config.keep_alive_interval(Some(TRANSPORT_KEEP_ALIVE_INTERVAL));
  transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(
    MAX_IDLE_TIMEOUT_MILLIS,
  ))));
  transport_config
}

fn server_config_from(
  cert_chain: Vec<rustls::Certificate>,
  key: rustls::PrivateKey,
) -> Result<quinn::ServerConfig, ConfigError> {
  let mut server_config = quinn::ServerConfig::with_single_cert(cert_chain, key)?;
  server_config.transport_config(Arc::new(transport_config()));
  Ok(server_config)
}

/// A server configuration with a freshly generated self-signed certificate for `subject_alt_name`
pub fn self_signed_server_config(subject_alt_name: &str) -> Result<quinn::ServerConfig, ConfigError> {
  let cert = rcgen::generate_simple_self_signed(vec![subject_alt_name.to_string()])?;
  let cert_der = cert.serialize_der()?;
  let key = rustls::PrivateKey(cert.serialize_private_key_der());
  server_config_from(vec![rustls::Certificate(cert_der)], key)
}

fn open_pem(path: &Path) -> Result<BufReader<File>, ConfigError> {
  File::open(path)
    .map(BufReader::new)
    .map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })
}

fn load_certificates(path: &Path) -> Result<Vec<rustls::Certificate>, ConfigError> {
  let certs = rustls_pemfile::certs(&mut open_pem(path)?).map_err(|source| ConfigError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  if certs.is_empty() {
    return Err(ConfigError::NoCertificates(path.to_path_buf()));
  }
  Ok(certs.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<rustls::PrivateKey, ConfigError> {
  let items = rustls_pemfile::read_all(&mut open_pem(path)?).map_err(|source| ConfigError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  items
    .into_iter()
    .find_map(|item| match item {
      rustls_pemfile::Item::PKCS8Key(key)
      | rustls_pemfile::Item::RSAKey(key)
      | rustls_pemfile::Item::ECKey(key) => Some(rustls::PrivateKey(key)),
      _ => None,
    })
    .ok_or_else(|| ConfigError::NoPrivateKey(path.to_path_buf()))
}

/// A server configuration from a PEM certificate chain and PEM private key
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<quinn::ServerConfig, ConfigError> {
  let cert_chain = load_certificates(cert_path)?;
  let key = load_private_key(key_path)?;
  server_config_from(cert_chain, key)
}

struct SkipServerVerification;

impl SkipServerVerification {
  fn new() -> Arc<Self> {
    Arc::new(Self)
  }
}

impl rustls::client::ServerCertVerifier for SkipServerVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::Certificate,
    _intermediates: &[rustls::Certificate],
    _server_name: &rustls::ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: std::time::SystemTime,
  ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::ServerCertVerified::assertion())
  }
}

fn client_config_from(crypto: rustls::ClientConfig) -> quinn::ClientConfig {
  let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
  client_config.transport_config(Arc::new(transport_config()));
  client_config
}

/// A client configuration that accepts any server certificate
pub fn insecure_client_config() -> quinn::ClientConfig {
  let crypto = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_custom_certificate_verifier(SkipServerVerification::new())
    .with_no_client_auth();
  client_config_from(crypto)
}

/// A client configuration trusting only the certificates in the PEM file at `authority_path`
pub fn client_config_with_authority(authority_path: &Path) -> Result<quinn::ClientConfig, ConfigError> {
  let mut roots = rustls::RootCertStore::empty();
  for cert in load_certificates(authority_path)? {
    roots.add(&cert)?;
  }
  let crypto = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  Ok(client_config_from(crypto))
}

#[cfg(test)]
mod tests {
  use super::{
    client_config_with_authority, load_server_config, self_signed_server_config, ConfigError,
  };
  use std::path::Path;

  #[test]
  fn loads_pem_files() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = std::env::temp_dir().join(format!("tunnelquic-tls-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let cert_path = dir.join("server.pub.pem");
    let key_path = dir.join("server.priv.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();

    load_server_config(&cert_path, &key_path).unwrap();
    client_config_with_authority(&cert_path).unwrap();
    assert!(matches!(
      load_server_config(&cert_path, &cert_path),
      Err(ConfigError::NoPrivateKey(_))
    ));
    assert!(matches!(
      client_config_with_authority(&key_path),
      Err(ConfigError::NoCertificates(_))
    ));
    let _ = std::fs::remove_dir_all(&dir);
  }

  #[test]
  fn generates_self_signed_config() {
    self_signed_server_config("localhost").unwrap();
  }

  #[test]
  fn missing_files_name_the_path() {
    let error = load_server_config(
      Path::new("/nonexistent/cert.pem"),
      Path::new("/nonexistent/key.pem"),
    )
    .unwrap_err();
    match error {
      ConfigError::Io { path, .. } => assert_eq!(path, Path::new("/nonexistent/cert.pem")),
      other => panic!("Expected an I/O error, got {:?}", other),
    }
  }
}
