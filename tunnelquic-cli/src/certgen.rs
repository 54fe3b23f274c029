// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use std::{
  fs,
  path::{Path, PathBuf},
};
use tracing::instrument;

fn with_suffix(path: &Path, suffix: &str) -> Result<PathBuf> {
  let file_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .context("Certificate path must end in a UTF-8 file name")?;
  Ok(path.with_file_name(format!("{}{}", file_name, suffix)))
}

/// Writes `<path>.pub.pem` and `<path>.priv.pem` for a self-signed certificate naming `host_san`
#[instrument]
pub fn certgen_main(output_base_path: PathBuf, host_san: String) -> Result<(PathBuf, PathBuf)> {
  if let Some(parent) = output_base_path.parent() {
    fs::create_dir_all(parent).context("Directory creation must succeed for certs")?;
  }
  let cert =
    rcgen::generate_simple_self_signed(vec![host_san]).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  let public_path = with_suffix(&output_base_path, ".pub.pem")?;
  let private_path = with_suffix(&output_base_path, ".priv.pem")?;
  fs::write(&public_path, &public_pem).context("Failed writing public key")?;
  fs::write(&private_path, &private_pem).context("Failed writing private key")?;
  tracing::info!(public = ?public_path, private = ?private_path, "certificate written");
  Ok((public_path, private_path))
}

#[cfg(test)]
mod tests {
  use super::certgen_main;

  #[test]
  fn written_pair_loads_as_server_config() {
    let dir = std::env::temp_dir().join(format!("tunnelquic-certgen-{}", std::process::id()));
    let (public, private) = certgen_main(dir.join("server"), "localhost".into()).unwrap();
    assert!(public.ends_with("server.pub.pem"));
    assert!(private.ends_with("server.priv.pem"));
    tunnelquic::common::tls::load_server_config(&public, &private).unwrap();
    tunnelquic::common::tls::client_config_with_authority(&public).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
  }
}
