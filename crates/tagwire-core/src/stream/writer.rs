use std::io::{self, Write};

use tagwire_crypto::{FrameCipher, SecretBytes, Tag, compute_tag, derive_tag_key};
use tagwire_proto::{
    FrameHeader, MAC_LENGTH, MAX_FRAME_LENGTH, ProtocolError, encode_frame, frame_aad, frame_iv,
};

use super::{StreamConfig, StreamError, frame_key};
use crate::context::ConnectionContext;

/// Outgoing half of a secured connection.
///
/// Written bytes are buffered until a frame is full. A full frame is only
/// sealed once more data arrives, so the last frame of the stream can
/// always carry the final flag.
///
/// - [`flush`](Write::flush) seals buffered data as a padded non-final
///   frame and flushes the sink. The stream stays open.
/// - [`close`](Self::close) seals the final frame. Dropping the writer
///   without closing leaves the peer with a truncated stream.
///
/// Any error poisons the writer: later writes fail with
/// `StreamError::Closed`.
pub struct StreamWriter<W> {
    sink: W,
    cipher: FrameCipher,
    tag: Option<Tag>,
    frame_length: usize,
    max_payload: usize,
    pending: Vec<u8>,
    frame: Vec<u8>,
    frame_number: u64,
    closed: bool,
    failed: bool,
}

impl<W: Write> StreamWriter<W> {
    /// Writer sealing frames with `frame_key`, sending `tag` first if one
    /// is given.
    ///
    /// `config` must already be valid.
    pub fn new(sink: W, frame_key: &SecretBytes, tag: Option<Tag>, config: StreamConfig) -> Self {
        let max_payload = FrameHeader::max_payload_length(config.frame_length)
            .min(FrameHeader::MAX_ENCODABLE_LENGTH);
        Self {
            sink,
            cipher: FrameCipher::new(frame_key),
            tag,
            frame_length: config.frame_length,
            max_payload,
            pending: Vec::with_capacity(max_payload),
            frame: Vec::with_capacity(config.frame_length),
            frame_number: 0,
            closed: false,
            failed: false,
        }
    }

    pub(super) fn for_context(sink: W, ctx: &ConnectionContext, config: StreamConfig) -> Self {
        let tag = ctx
            .is_initiator()
            .then(|| compute_tag(&derive_tag_key(&ctx.secret, ctx.alice), ctx.stream_number));
        Self::new(sink, &frame_key(ctx, ctx.is_initiator()), tag, config)
    }

    /// Seal the final frame and flush the sink. Idempotent.
    ///
    /// # Errors
    ///
    /// - `StreamError::Io` if the sink fails
    /// - `StreamError::FrameCounterExhausted` if no frame number is left
    pub fn close(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Ok(());
        }
        self.ensure_usable()?;
        self.guard(|w| {
            w.write_frame(true)?;
            w.sink.flush()?;
            Ok(())
        })?;
        self.closed = true;
        Ok(())
    }

    /// Frames sealed so far.
    pub fn frames_written(&self) -> u64 {
        self.frame_number
    }

    /// True once [`close`](Self::close) succeeded.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Underlying sink.
    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    /// Unwrap the sink. Buffered data that was not flushed is discarded.
    pub fn into_inner(self) -> W {
        self.sink
    }

    fn ensure_usable(&self) -> Result<(), StreamError> {
        if self.closed || self.failed { Err(StreamError::Closed) } else { Ok(()) }
    }

    fn guard<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        let result = op(self);
        if let Err(e) = &result {
            self.failed = true;
            self.pending.clear();
            tracing::debug!(frame = self.frame_number, error = %e, "secured writer failed");
        }
        result
    }

    fn write_tag(&mut self) -> Result<(), StreamError> {
        if let Some(tag) = self.tag.take() {
            self.sink.write_all(tag.as_bytes())?;
        }
        Ok(())
    }

    fn write_frame(&mut self, is_final: bool) -> Result<(), StreamError> {
        let frame_number = self.frame_number;
        let Ok(number) = u32::try_from(frame_number) else {
            return Err(StreamError::FrameCounterExhausted);
        };

        self.write_tag()?;

        self.frame.clear();
        let plaintext_length =
            encode_frame(&mut self.frame, &self.pending, is_final, self.frame_length)
                .map_err(|source| StreamError::Format { frame_number, source })?;
        let Ok(aad_length) = u16::try_from(plaintext_length) else {
            let source = ProtocolError::FrameTooLong { size: plaintext_length, max: MAX_FRAME_LENGTH };
            return Err(StreamError::Format { frame_number, source });
        };

        let mac = self
            .cipher
            .seal_in_place(&frame_iv(number), &frame_aad(number, aad_length), &mut self.frame)
            .map_err(|_| StreamError::Encryption { frame_number })?;
        self.frame.extend_from_slice(&mac);
        debug_assert!(self.frame.len() <= self.frame_length);
        debug_assert!(is_final || self.frame.len() == self.frame_length);
        debug_assert!(self.frame.len() >= MAC_LENGTH);

        self.sink.write_all(&self.frame)?;
        self.pending.clear();
        self.frame_number += 1;
        Ok(())
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ensure_usable()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let accepted = self.guard(|w| {
            let mut accepted = 0;
            while accepted < buf.len() {
                if w.pending.len() == w.max_payload {
                    w.write_frame(false)?;
                }
                let take = (w.max_payload - w.pending.len()).min(buf.len() - accepted);
                w.pending.extend_from_slice(&buf[accepted..accepted + take]);
                accepted += take;
            }
            Ok(accepted)
        })?;
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return self.sink.flush();
        }
        self.ensure_usable()?;

        self.guard(|w| {
            w.write_tag()?;
            if !w.pending.is_empty() {
                w.write_frame(false)?;
            }
            w.sink.flush()?;
            Ok(())
        })?;
        Ok(())
    }
}
