//! Single-range `bytes=` request support, so video playback can seek.
//!
//! The blob store only hands out a forward-only decrypting stream, so
//! ranges are served by discarding the prefix and capping the length
//! rather than seeking the underlying file.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use std::io;

/// An inclusive byte range already validated against the payload length.
#[derive(Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeError {
    /// Present but not a well-formed single `bytes=` range.
    Malformed,
    /// The range lies entirely outside the payload.
    Unsatisfiable,
}

/// Resolve a `Range` header against the decrypted payload length.
/// `Ok(None)` means serve the full payload. Multi-part ranges are not
/// supported; an end past the payload is clamped.
pub fn parse(header: Option<&str>, total: u64) -> Result<Option<ByteRange>, RangeError> {
    let Some(header) = header else {
        return Ok(None);
    };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return Err(RangeError::Malformed);
    };
    if spec.contains(',') {
        return Err(RangeError::Malformed);
    }

    let mut parts = spec.trim().splitn(2, '-');
    let first = parts.next().unwrap_or_default();
    let last = parts.next().ok_or(RangeError::Malformed)?;

    if first.is_empty() {
        // bytes=-N, the last N bytes
        let suffix: u64 = last.parse().map_err(|_| RangeError::Malformed)?;
        if suffix == 0 {
            return Ok(None);
        }
        if total == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(Some(ByteRange {
            start: total.saturating_sub(suffix),
            end: total - 1,
        }));
    }

    let start: u64 = first.parse().map_err(|_| RangeError::Malformed)?;
    if start >= total {
        return Err(RangeError::Unsatisfiable);
    }
    let end = if last.is_empty() {
        total - 1
    } else {
        let end: u64 = last.parse().map_err(|_| RangeError::Malformed)?;
        if end < start {
            return Err(RangeError::Unsatisfiable);
        }
        end.min(total - 1)
    };

    Ok(Some(ByteRange { start, end }))
}

/// Skip the first `range.start` bytes of a forward-only stream and stop
/// after the range length, slicing chunks instead of buffering them.
pub fn slice_stream(
    stream: BoxStream<'static, io::Result<Bytes>>,
    range: &ByteRange,
) -> BoxStream<'static, io::Result<Bytes>> {
    futures::stream::try_unfold(
        (stream, range.start, range.len()),
        |(mut stream, mut skip, mut remaining)| async move {
            if remaining == 0 {
                return Ok(None);
            }
            while let Some(chunk) = stream.try_next().await? {
                if (chunk.len() as u64) <= skip {
                    skip -= chunk.len() as u64;
                    continue;
                }
                let mut chunk = if skip > 0 {
                    chunk.slice(skip as usize..)
                } else {
                    chunk
                };
                skip = 0;
                if (chunk.len() as u64) > remaining {
                    chunk = chunk.slice(..remaining as usize);
                }
                remaining -= chunk.len() as u64;
                return Ok(Some((chunk, (stream, skip, remaining))));
            }
            Ok(None)
        },
    )
    .boxed()
}
