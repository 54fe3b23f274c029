// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::{net::SocketAddr, path::Path, time::Duration};

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

/// Parses `key=secret` pairs for the shared-secret authorizer
pub fn parse_secret(v: &str) -> Result<(String, String)> {
  match v.split_once('=') {
    None => Err(AnyErr::msg("Could not match '=' in secret mapping")),
    Some(("", _)) => Err(AnyErr::msg("Client key must not be empty")),
    Some((_, "")) => Err(AnyErr::msg("Secret must not be empty")),
    Some((key, secret)) => Ok((key.to_string(), secret.to_string())),
  }
}

pub fn parse_seconds(v: &str) -> Result<Duration> {
  let seconds = v.parse::<u64>()?;
  if seconds == 0 {
    return Err(AnyErr::msg("Interval must be at least one second"));
  }
  Ok(Duration::from_secs(seconds))
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_secret(v: &str) -> Result<(), String> {
  parse_secret(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_seconds(v: &str) -> Result<(), String> {
  parse_seconds(v).map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
  use super::{parse_seconds, parse_secret, parse_socketaddr};
  use std::time::Duration;

  #[test]
  fn secrets_need_both_halves() {
    assert_eq!(
      parse_secret("c1=hunter2").unwrap(),
      ("c1".to_string(), "hunter2".to_string())
    );
    assert_eq!(
      parse_secret("c1=a=b").unwrap(),
      ("c1".to_string(), "a=b".to_string())
    );
    assert!(parse_secret("c1").is_err());
    assert!(parse_secret("=secret").is_err());
    assert!(parse_secret("c1=").is_err());
  }

  #[test]
  fn parses_literal_addresses() {
    assert_eq!(
      parse_socketaddr("127.0.0.1:3000").unwrap(),
      "127.0.0.1:3000".parse().unwrap()
    );
    assert!(parse_socketaddr("not an address").is_err());
  }

  #[test]
  fn intervals_are_positive_seconds() {
    assert_eq!(parse_seconds("5").unwrap(), Duration::from_secs(5));
    assert!(parse_seconds("0").is_err());
    assert!(parse_seconds("-1").is_err());
  }
}
