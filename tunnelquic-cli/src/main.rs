// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use std::{path::PathBuf, time::Duration};

use validators::{
  parse_seconds, parse_secret, parse_socketaddr, validate_existing_file, validate_seconds,
  validate_secret, validate_socketaddr,
};

mod certgen;
mod client;
mod server;
mod validators;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("client")
        .alias("-c")
        .about("Connect to a server and serve the connections it requests")
        .arg(
          Arg::new("authority")
            .long("authority")
            .short('a')
            .help("PEM certificate to verify the server against; verification is skipped if absent")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("server")
            .long("server")
            .short('s')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .default_value("localhost"),
        )
        .arg(
          Arg::new("credential")
            .long("credential")
            .short('k')
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("no-keepalive")
            .long("no-keepalive")
            .help("Do not open a keepalive stream to the server")
            .takes_value(false),
        ),
    )
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Accept client connections and dial through them")
        .arg(
          Arg::new("bind")
            .long("bind")
            .short('b')
            .validator(validate_socketaddr)
            .default_value("0.0.0.0:3000")
            .takes_value(true),
        )
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("key"),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .requires("cert"),
        )
        .arg(
          Arg::new("san")
            .long("san")
            .help("Subject name of the generated certificate when none is given")
            .takes_value(true)
            .default_value("localhost"),
        )
        .arg(
          Arg::new("secret")
            .long("secret")
            .help("Accept clients presenting <secret> under <key>, as key=secret; repeatable")
            .validator(validate_secret)
            .takes_value(true)
            .multiple_occurrences(true),
        )
        .arg(
          Arg::new("probe-client")
            .long("probe-client")
            .takes_value(true)
            .requires("probe-target"),
        )
        .arg(
          Arg::new("probe-target")
            .long("probe-target")
            .takes_value(true)
            .requires("probe-client"),
        )
        .arg(
          Arg::new("probe-interval")
            .long("probe-interval")
            .help("Seconds between probes")
            .validator(validate_seconds)
            .takes_value(true)
            .default_value("5"),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
  args
    .value_of(name)
    .ok_or_else(|| anyhow::Error::msg(format!("Missing required argument {}", name)))
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    authority_cert: args.value_of("authority").map(PathBuf::from),
    server_addr: parse_socketaddr(required(args, "server")?)?,
    server_san: required(args, "san")?.into(),
    credential: required(args, "credential")?.into(),
    keepalive: !args.is_present("no-keepalive"),
  })
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  let cert = match (args.value_of("cert"), args.value_of("key")) {
    (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
    _ => None,
  };
  let secrets = args
    .values_of("secret")
    .map(|values| values.map(parse_secret).collect::<Result<Vec<_>>>())
    .transpose()?
    .unwrap_or_default();
  let probe = match (args.value_of("probe-client"), args.value_of("probe-target")) {
    (Some(client_key), Some(target)) => Some(server::ProbeArgs {
      client_key: client_key.into(),
      target: target.into(),
      interval: args
        .value_of("probe-interval")
        .map(parse_seconds)
        .transpose()?
        .unwrap_or(Duration::from_secs(5)),
    }),
    _ => None,
  };

  Ok(server::ServerArgs {
    bind_addr: parse_socketaddr(required(args, "bind")?)?,
    cert,
    san: required(args, "san")?.into(),
    secrets,
    probe,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!(bind = %config.bind_addr, secrets = config.secrets.len(), "Running as server");
      server::server_main(config).await
    }
    Some(("client", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!(server = %config.server_addr, "Running as client");
      client::client_main(config).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      let path = required(opts, "path")?;
      let san = required(opts, "san")?;
      certgen::certgen_main(path.into(), san.into()).map(|_| ())
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
