// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::Either;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub mod tunnel_stream;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Upper bound on how long a spliced side may take to acknowledge its close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Which side of a splice reached end-of-stream first, and how many bytes it had sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpliceEnd {
  LeftFinished { bytes: u64 },
  RightFinished { bytes: u64 },
}

/// Copies bytes in both directions between `left` and `right` until either
/// direction ends, then closes both.
///
/// Unlike a bidirectional copy, a half-close on one side tears down the whole
/// splice; the direction still in flight is abandoned.
#[tracing::instrument(level = "trace", err, skip(left, right))]
pub async fn splice_streams<Left, Right>(left: Left, right: Right) -> Result<SpliceEnd, std::io::Error>
where
  Left: AsyncRead + AsyncWrite + Unpin,
  Right: AsyncRead + AsyncWrite + Unpin,
{
  let (left_reader, mut left_writer) = tokio::io::split(left);
  let (right_reader, mut right_writer) = tokio::io::split(right);
  let mut left_reader = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, left_reader);
  let mut right_reader = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, right_reader);
  let outcome = {
    let left_to_right = tokio::io::copy_buf(&mut left_reader, &mut right_writer);
    let right_to_left = tokio::io::copy_buf(&mut right_reader, &mut left_writer);
    futures::pin_mut!(left_to_right, right_to_left);
    match futures::future::select(left_to_right, right_to_left).await {
      Either::Left((copied, _)) => copied.map(|bytes| SpliceEnd::LeftFinished { bytes }),
      Either::Right((copied, _)) => copied.map(|bytes| SpliceEnd::RightFinished { bytes }),
    }
  };
  tracing::trace!(?outcome, "splice ended; closing both sides");
  let _ = tokio::time::timeout(SHUTDOWN_GRACE, left_writer.shutdown()).await;
  let _ = tokio::time::timeout(SHUTDOWN_GRACE, right_writer.shutdown()).await;
  if let Err(error) = &outcome {
    tracing::debug!(%error, "splice copy failed");
  }
  outcome
}
