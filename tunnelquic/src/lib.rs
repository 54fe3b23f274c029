// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Reverse tunnels over QUIC.
//!
//! A client dials out to a server and authenticates on the first stream; after that
//! either side may open streams asking the other to connect somewhere on its behalf.

pub mod common;
pub mod util;

pub mod client;
pub mod server;

pub use client::{connect, ClientOptions, ClientSession, SessionOptions};
pub use server::{Server, ServerBuilder};

#[cfg(test)]
pub(crate) fn init_test_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}
