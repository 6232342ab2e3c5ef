//! NDJSON codec for backend output streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length so that an unterminated or oversized message from a misbehaving
//! backend cannot exhaust memory.
//!
//! # Usage
//!
//! Use [`StreamCodec`] as the codec parameter for
//! [`tokio_util::codec::FramedRead`]. A trailing line without a final `\n`
//! is still yielded at end of stream via [`Decoder::decode_eof`].
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_relay::stream::codec::StreamCodec;
//!
//! let lines = FramedRead::with_capacity(child_stdout, StreamCodec::new(), 8192);
//! ```

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length accepted by the codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited codec for backend output.
///
/// Lines longer than the configured limit yield
/// [`AppError::Parsing`]`("line too long: …")`; the codec then discards input
/// up to the next newline and resumes, so one oversized message is counted
/// as malformed without ending the stream. A line that is not valid UTF-8
/// is consumed and reported the same way. Read failures map to
/// [`AppError::Io`].
#[derive(Debug)]
pub struct StreamCodec(LinesCodec);

impl StreamCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_line_bytes(max: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max))
    }
}

impl Default for StreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for StreamCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Parsing("line too long: exceeded configured limit".into())
        }
        LinesCodecError::Io(io_err) if io_err.kind() == io::ErrorKind::InvalidData => {
            AppError::Parsing(format!("invalid line encoding: {io_err}"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
