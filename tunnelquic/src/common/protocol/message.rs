// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Framed control messages exchanged at the head of every tunnel stream.
//!
//! A message is three signed zig-zag varints (stream id, message type, payload
//! length) followed by exactly `payload length` bytes of payload. Decoding reads
//! only the bytes belonging to one message, leaving anything after it on the
//! stream for whoever consumes the stream next.

use std::fmt::{self, Display};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::tunnel_stream::StreamId;

/// Largest encoding of a 64-bit varint
pub const MAX_VARINT_LEN: usize = 10;

/// Largest payload accepted from the wire
pub const MAX_PAYLOAD_LENGTH: usize = 16 * 1024 * 1024;

/// Separates protocol from address in Connect payloads
pub const CONNECT_SEPARATOR: char = '/';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
  Auth,
  Connect,
  Other,
  Ping,
  Pong,
  Error,
  /// An ordinal this side does not know; carried through unchanged
  Unknown(i64),
}

impl MessageType {
  pub fn ordinal(self) -> i64 {
    match self {
      MessageType::Auth => 1,
      MessageType::Connect => 2,
      MessageType::Other => 3,
      MessageType::Ping => 4,
      MessageType::Pong => 5,
      MessageType::Error => 6,
      MessageType::Unknown(ordinal) => ordinal,
    }
  }

  pub fn from_ordinal(ordinal: i64) -> Self {
    match ordinal {
      1 => MessageType::Auth,
      2 => MessageType::Connect,
      3 => MessageType::Other,
      4 => MessageType::Ping,
      5 => MessageType::Pong,
      6 => MessageType::Error,
      other => MessageType::Unknown(other),
    }
  }
}

/// Honors width and alignment flags so log lines can line up on the stream id
impl Display for MessageType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MessageType::Auth => f.pad("AUTH"),
      MessageType::Connect => f.pad("CONNECT"),
      MessageType::Other => f.pad("OTHER"),
      MessageType::Ping => f.pad("PING"),
      MessageType::Pong => f.pad("PONG"),
      MessageType::Error => f.pad("ERROR"),
      MessageType::Unknown(ordinal) => f.pad(&format!("UNKNOWN({})", ordinal)),
    }
  }
}

/// The `protocol/address` pair a Connect message asks the far side to dial
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectTarget {
  protocol: String,
  address: String,
}

impl ConnectTarget {
  pub fn new(protocol: impl Into<String>, address: impl Into<String>) -> Self {
    Self {
      protocol: protocol.into(),
      address: address.into(),
    }
  }

  /// Splits a payload on its first `/`; the address may itself contain further slashes
  pub fn parse(payload: &[u8]) -> Result<Self, MessageError> {
    let text = std::str::from_utf8(payload).map_err(MessageError::InvalidTarget)?;
    match text.split_once(CONNECT_SEPARATOR) {
      Some((protocol, address)) => Ok(Self::new(protocol, address)),
      None => Err(MessageError::MissingSeparator),
    }
  }

  pub fn protocol(&self) -> &str {
    &self.protocol
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  pub fn to_payload(&self) -> Vec<u8> {
    self.to_string().into_bytes()
  }
}

impl Display for ConnectTarget {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}{}{}", self.protocol, CONNECT_SEPARATOR, self.address)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
  StreamId,
  MessageType,
  PayloadLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextExpected {
  Header(HeaderField),
  Payload { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
  #[error("Stream ended while expecting {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: std::io::Error,
  },
  #[error("Varint for {0:?} does not fit in 64 bits")]
  VarintOverflow(HeaderField),
  #[error("Negative payload length {0}")]
  NegativeLength(i64),
  #[error("Payload length of {received} bytes exceeds the maximum of {maximum}")]
  MaxLengthExceeded { maximum: usize, received: u64 },
  #[error("failed to parse connect address: missing '/' separator")]
  MissingSeparator,
  #[error("failed to parse connect address: {0}")]
  InvalidTarget(#[source] std::str::Utf8Error),
}

impl MessageError {
  /// True when the stream ran dry rather than carrying malformed data
  pub fn is_end_of_stream(&self) -> bool {
    matches!(self, MessageError::UnexpectedEnd { .. })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
  stream_id: StreamId,
  kind: MessageType,
  payload: Vec<u8>,
  target: Option<ConnectTarget>,
}

impl Message {
  /// Builds a message of any type; Connect payloads must hold a `protocol/address` pair
  pub fn new(
    stream_id: StreamId,
    kind: MessageType,
    payload: Vec<u8>,
  ) -> Result<Self, MessageError> {
    let target = match kind {
      MessageType::Connect => Some(ConnectTarget::parse(&payload)?),
      _ => None,
    };
    Ok(Self {
      stream_id,
      kind,
      payload,
      target,
    })
  }

  fn unchecked(stream_id: StreamId, kind: MessageType, payload: Vec<u8>) -> Self {
    Self {
      stream_id,
      kind,
      payload,
      target: None,
    }
  }

  pub fn auth(stream_id: StreamId, credential: Vec<u8>) -> Self {
    Self::unchecked(stream_id, MessageType::Auth, credential)
  }

  pub fn connect(stream_id: StreamId, target: ConnectTarget) -> Self {
    Self {
      stream_id,
      kind: MessageType::Connect,
      payload: target.to_payload(),
      target: Some(target),
    }
  }

  pub fn ping(stream_id: StreamId, payload: Vec<u8>) -> Self {
    Self::unchecked(stream_id, MessageType::Ping, payload)
  }

  pub fn pong(stream_id: StreamId, payload: Vec<u8>) -> Self {
    Self::unchecked(stream_id, MessageType::Pong, payload)
  }

  pub fn other(stream_id: StreamId, payload: Vec<u8>) -> Self {
    Self::unchecked(stream_id, MessageType::Other, payload)
  }

  pub fn error(stream_id: StreamId, description: impl Into<String>) -> Self {
    Self::unchecked(stream_id, MessageType::Error, description.into().into_bytes())
  }

  pub fn stream_id(&self) -> StreamId {
    self.stream_id
  }

  pub fn kind(&self) -> MessageType {
    self.kind
  }

  pub fn payload(&self) -> &[u8] {
    &self.payload
  }

  /// Present exactly when the message is a Connect
  pub fn target(&self) -> Option<&ConnectTarget> {
    self.target.as_ref()
  }

  /// Serializes the message; the length field always reflects the current payload
  pub fn to_bytes(&self) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN * 3 + self.payload.len());
    put_varint(&mut buf, self.stream_id);
    put_varint(&mut buf, self.kind.ordinal());
    put_varint(&mut buf, self.payload.len() as i64);
    buf.extend_from_slice(&self.payload);
    buf
  }

  /// Writes the whole encoded message and flushes it
  pub async fn write_to<W: AsyncWrite + Unpin + ?Sized>(
    &self,
    writer: &mut W,
  ) -> Result<(), std::io::Error> {
    writer.write_all(&self.to_bytes()).await?;
    writer.flush().await
  }

  /// Reads exactly one message from the head of `reader`, consuming nothing past its payload
  pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
  ) -> Result<Self, MessageError> {
    let stream_id = read_varint(reader, HeaderField::StreamId).await?;
    let kind = MessageType::from_ordinal(read_varint(reader, HeaderField::MessageType).await?);
    let length = read_varint(reader, HeaderField::PayloadLength).await?;
    if length < 0 {
      return Err(MessageError::NegativeLength(length));
    }
    if length as u64 > MAX_PAYLOAD_LENGTH as u64 {
      return Err(MessageError::MaxLengthExceeded {
        maximum: MAX_PAYLOAD_LENGTH,
        received: length as u64,
      });
    }
    let length = length as usize;
    let mut payload = Vec::with_capacity(length.min(64 * 1024));
    let received = (&mut *reader)
      .take(length as u64)
      .read_to_end(&mut payload)
      .await;
    match received {
      Ok(count) if count == length => {}
      Ok(_) => {
        return Err(MessageError::UnexpectedEnd {
          expected: NextExpected::Payload { length },
          error: std::io::ErrorKind::UnexpectedEof.into(),
        })
      }
      Err(error) => {
        return Err(MessageError::UnexpectedEnd {
          expected: NextExpected::Payload { length },
          error,
        })
      }
    }
    Self::new(stream_id, kind, payload)
  }
}

/// Payloads other than Connect targets are summarized by length; they may carry credentials
impl Display for Message {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match (&self.kind, &self.target) {
      (MessageType::Connect, Some(target)) => {
        write!(f, "{:<7} [{}]: {}", self.kind, self.stream_id, target)
      }
      _ => write!(
        f,
        "{:<7} [{}]: {} bytes",
        self.kind,
        self.stream_id,
        self.payload.len()
      ),
    }
  }
}

/// Appends `value` as a zig-zag signed varint
pub fn put_varint(buf: &mut Vec<u8>, value: i64) {
  let mut zigzag = ((value << 1) ^ (value >> 63)) as u64;
  while zigzag >= 0x80 {
    buf.push((zigzag as u8) | 0x80);
    zigzag >>= 7;
  }
  buf.push(zigzag as u8);
}

async fn read_varint<R: AsyncRead + Unpin + ?Sized>(
  reader: &mut R,
  field: HeaderField,
) -> Result<i64, MessageError> {
  let mut unsigned: u64 = 0;
  let mut shift = 0u32;
  for index in 0..MAX_VARINT_LEN {
    // One byte at a time so the payload that follows is never consumed here
    let byte = reader
      .read_u8()
      .await
      .map_err(|error| MessageError::UnexpectedEnd {
        expected: NextExpected::Header(field),
        error,
      })?;
    if byte < 0x80 {
      if index == MAX_VARINT_LEN - 1 && byte > 1 {
        return Err(MessageError::VarintOverflow(field));
      }
      unsigned |= (byte as u64) << shift;
      let signed = ((unsigned >> 1) as i64) ^ -((unsigned & 1) as i64);
      return Ok(signed);
    }
    unsigned |= ((byte & 0x7f) as u64) << shift;
    shift += 7;
  }
  Err(MessageError::VarintOverflow(field))
}

#[cfg(test)]
mod tests {
  use super::{
    put_varint, ConnectTarget, HeaderField, Message, MessageError, MessageType, NextExpected,
    MAX_PAYLOAD_LENGTH,
  };
  use tokio::io::AsyncReadExt;

  #[test]
  fn varints_match_reference_encoding() {
    let cases: &[(i64, &[u8])] = &[
      (0, &[0x00]),
      (-1, &[0x01]),
      (1, &[0x02]),
      (2, &[0x04]),
      (63, &[0x7e]),
      (-64, &[0x7f]),
      (64, &[0x80, 0x01]),
      (300, &[0xd8, 0x04]),
    ];
    for (value, expected) in cases {
      let mut buf = Vec::new();
      put_varint(&mut buf, *value);
      assert_eq!(&buf[..], *expected, "encoding of {}", value);
    }
    let mut buf = Vec::new();
    put_varint(&mut buf, i64::MIN);
    assert_eq!(buf.len(), super::MAX_VARINT_LEN);
  }

  #[test]
  fn encodes_auth_header() {
    let bytes = Message::auth(0, b"secret".to_vec()).to_bytes();
    assert_eq!(&bytes[..3], &[0x00, 0x02, 0x0c]);
    assert_eq!(&bytes[3..], b"secret");
  }

  #[tokio::test]
  async fn connect_round_trip_exposes_target() {
    let message = Message::connect(4, ConnectTarget::new("tcp", "example.com:80"));
    let bytes = message.to_bytes();
    let decoded = Message::read_from(&mut &bytes[..]).await.unwrap();
    assert_eq!(decoded.stream_id(), 4);
    assert_eq!(decoded.kind(), MessageType::Connect);
    assert_eq!(decoded.payload(), b"tcp/example.com:80");
    let target = decoded.target().unwrap();
    assert_eq!(target.protocol(), "tcp");
    assert_eq!(target.address(), "example.com:80");
    assert_eq!(decoded.to_string(), "CONNECT [4]: tcp/example.com:80");
  }

  #[tokio::test]
  async fn every_kind_survives_encoding_at_boundary_sizes() {
    let kinds = [
      MessageType::Auth,
      MessageType::Other,
      MessageType::Ping,
      MessageType::Pong,
      MessageType::Error,
      MessageType::Unknown(42),
    ];
    // One- and two-byte length varints split at 128; 64 KiB is the usual stream chunk
    let sizes = [0usize, 127, 128, 65536, 65537];
    let ids = [i64::MIN, -1, 0, 1, i64::MAX];

    let mut originals = Vec::new();
    for kind in kinds {
      for size in sizes {
        for id in ids {
          let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
          originals.push(Message::new(id, kind, payload).unwrap());
        }
      }
    }
    for id in ids {
      originals.push(Message::connect(id, ConnectTarget::new("tcp", "example.com:80")));
      let long_host = format!("{}:443", "h".repeat(70_000));
      originals.push(Message::connect(id, ConnectTarget::new("tcp", long_host)));
      originals.push(Message::error(id, "dial refused"));
    }

    for original in originals {
      let bytes = original.to_bytes();
      let mut written = Vec::new();
      original.write_to(&mut written).await.unwrap();
      assert_eq!(written, bytes, "write_to and to_bytes disagree for {}", original);

      let mut reader = &bytes[..];
      let decoded = Message::read_from(&mut reader).await.unwrap();
      assert!(reader.is_empty(), "{} left bytes unread", original);
      assert_eq!(decoded, original);
      assert_eq!(decoded.to_bytes(), bytes);
    }
  }

  #[test]
  fn display_aligns_kinds_and_hides_payloads() {
    assert_eq!(
      Message::auth(0, b"secret".to_vec()).to_string(),
      "AUTH    [0]: 6 bytes"
    );
    assert_eq!(Message::ping(8, Vec::new()).to_string(), "PING    [8]: 0 bytes");
    assert_eq!(
      Message::error(-3, "refused").to_string(),
      "ERROR   [-3]: 7 bytes"
    );
    assert_eq!(
      Message::connect(1, ConnectTarget::new("udp", "10.0.0.1:53")).to_string(),
      "CONNECT [1]: udp/10.0.0.1:53"
    );
    let unknown = Message::new(2, MessageType::Unknown(42), vec![1]).unwrap();
    assert_eq!(unknown.to_string(), "UNKNOWN(42) [2]: 1 bytes");
    assert_eq!(MessageType::Pong.to_string(), "PONG");
  }

  #[test]
  fn connect_target_splits_on_first_separator() {
    let target = ConnectTarget::parse(b"unix//var/run/socket").unwrap();
    assert_eq!(target.protocol(), "unix");
    assert_eq!(target.address(), "/var/run/socket");
    assert!(matches!(
      ConnectTarget::parse(b"noseparator"),
      Err(MessageError::MissingSeparator)
    ));
    assert!(matches!(
      ConnectTarget::parse(&[0x74, 0x2f, 0xff]),
      Err(MessageError::InvalidTarget(_))
    ));
  }

  #[tokio::test]
  async fn decode_leaves_trailing_bytes_unread() {
    let mut bytes = Message::ping(8, Vec::new()).to_bytes();
    bytes.extend_from_slice(b"ping");
    let mut reader = &bytes[..];
    let decoded = Message::read_from(&mut reader).await.unwrap();
    assert_eq!(decoded.kind(), MessageType::Ping);
    assert!(decoded.payload().is_empty());
    let mut rest = Vec::new();
    reader.read_to_end(&mut rest).await.unwrap();
    assert_eq!(&rest, b"ping");
  }

  #[tokio::test]
  async fn unknown_types_are_carried_through() {
    let mut bytes = Vec::new();
    put_varint(&mut bytes, 12);
    put_varint(&mut bytes, 42);
    put_varint(&mut bytes, 1);
    bytes.push(b'x');
    let decoded = Message::read_from(&mut &bytes[..]).await.unwrap();
    assert_eq!(decoded.kind(), MessageType::Unknown(42));
    assert_eq!(decoded.kind().ordinal(), 42);
    assert_eq!(decoded.to_bytes(), bytes);
  }

  #[tokio::test]
  async fn truncated_payload_is_an_error() {
    let bytes = Message::other(1, b"abcdef".to_vec()).to_bytes();
    let truncated = &bytes[..bytes.len() - 2];
    match Message::read_from(&mut &truncated[..]).await {
      Err(MessageError::UnexpectedEnd {
        expected: NextExpected::Payload { length: 6 },
        ..
      }) => {}
      other => panic!("Expected truncated payload error, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn empty_stream_reports_missing_header() {
    let error = Message::read_from(&mut &b""[..]).await.unwrap_err();
    assert!(error.is_end_of_stream());
    assert!(matches!(
      error,
      MessageError::UnexpectedEnd {
        expected: NextExpected::Header(HeaderField::StreamId),
        ..
      }
    ));
  }

  #[tokio::test]
  async fn rejects_bad_lengths() {
    let mut negative = Vec::new();
    put_varint(&mut negative, 0);
    put_varint(&mut negative, MessageType::Other.ordinal());
    put_varint(&mut negative, -3);
    assert!(matches!(
      Message::read_from(&mut &negative[..]).await,
      Err(MessageError::NegativeLength(-3))
    ));

    let mut oversized = Vec::new();
    put_varint(&mut oversized, 0);
    put_varint(&mut oversized, MessageType::Other.ordinal());
    put_varint(&mut oversized, MAX_PAYLOAD_LENGTH as i64 + 1);
    assert!(matches!(
      Message::read_from(&mut &oversized[..]).await,
      Err(MessageError::MaxLengthExceeded { .. })
    ));
  }

  #[tokio::test]
  async fn rejects_overlong_varints() {
    let bytes = [0xffu8; 11];
    assert!(matches!(
      Message::read_from(&mut &bytes[..]).await,
      Err(MessageError::VarintOverflow(HeaderField::StreamId))
    ));
  }
}
