// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire messages, transports, and the stream-level protocols carried over them

// Stream lifetime:
//
// - the opener writes one framed message as the first bytes of a new stream
// - the acceptor decodes exactly that message and routes on its type
// - - Connect: the acceptor dials the named target and splices it with the stream
// - - Ping: the acceptor answers and the stream becomes a keepalive channel
// - - anything else is closed
//
// Authentication happens once per connection, on its first stream, before any of this

pub mod connection;
pub mod dialer;
pub mod keepalive;
pub mod message;
pub mod proxy_tcp;
pub mod tunnel;

pub use connection::TunnelConnection;
pub use dialer::{ConnectionDialer, DialError, Dialer};
pub use message::{ConnectTarget, Message, MessageError, MessageType};
