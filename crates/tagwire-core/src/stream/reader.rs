use std::io::{self, Read};

use bytes::{Buf, BytesMut};
use tagwire_crypto::{FrameCipher, SecretBytes};
use tagwire_proto::{
    HEADER_LENGTH, MAC_LENGTH, MAX_FRAME_LENGTH, ProtocolError, decode_frame, frame_aad, frame_iv,
};

use super::{StreamConfig, StreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Open,
    /// Final frame consumed, or the peer closed before sending any frame
    Finished,
    Failed,
}

/// Incoming half of a secured connection.
///
/// Frames are authenticated before any of their payload is returned. Once
/// a frame fails, the reader is dead: every later read fails with
/// `StreamError::Closed`.
pub struct StreamReader<R> {
    source: R,
    cipher: FrameCipher,
    frame_length: usize,
    frame: Vec<u8>,
    payload: BytesMut,
    frame_number: u64,
    state: ReadState,
}

/// Read until `buf` is full or the source reports end of stream.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl<R: Read> StreamReader<R> {
    /// Reader opening frames with `frame_key`.
    ///
    /// `config` must already be valid.
    pub fn new(source: R, frame_key: &SecretBytes, config: StreamConfig) -> Self {
        Self {
            source,
            cipher: FrameCipher::new(frame_key),
            frame_length: config.frame_length,
            frame: vec![0u8; config.frame_length],
            payload: BytesMut::with_capacity(config.frame_length),
            frame_number: 0,
            state: ReadState::Open,
        }
    }

    /// Frames authenticated so far.
    pub fn frames_read(&self) -> u64 {
        self.frame_number
    }

    /// True once the final frame has been consumed.
    pub fn is_finished(&self) -> bool {
        self.state == ReadState::Finished
    }

    /// Unwrap the source.
    pub fn into_inner(self) -> R {
        self.source
    }

    /// Read, authenticate and decode the next frame into `payload`.
    fn read_frame(&mut self) -> Result<(), StreamError> {
        let frame_number = self.frame_number;
        let Ok(number) = u32::try_from(frame_number) else {
            return Err(StreamError::FrameCounterExhausted);
        };

        let filled = read_full(&mut self.source, &mut self.frame)?;
        if filled == 0 && frame_number == 0 {
            // Peer closed without sending anything
            self.state = ReadState::Finished;
            return Ok(());
        }
        if filled < HEADER_LENGTH + MAC_LENGTH {
            return Err(StreamError::Truncated { frame_number });
        }

        let body_length = filled - MAC_LENGTH;
        let (body, rest) = self.frame.split_at_mut(body_length);
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&rest[..MAC_LENGTH]);

        let Ok(aad_length) = u16::try_from(body_length) else {
            let source = ProtocolError::FrameTooLong { size: body_length, max: MAX_FRAME_LENGTH };
            return Err(StreamError::Format { frame_number, source });
        };
        self.cipher
            .open_in_place(&frame_iv(number), &frame_aad(number, aad_length), body, &mac)
            .map_err(|_| StreamError::Authentication { frame_number })?;

        let decoded = decode_frame(body, self.frame_length)
            .map_err(|source| StreamError::Format { frame_number, source })?;
        self.payload.extend_from_slice(decoded.payload);
        if decoded.is_final {
            self.state = ReadState::Finished;
        }

        self.frame_number += 1;
        Ok(())
    }

    fn fail(&mut self, err: &StreamError) {
        self.state = ReadState::Failed;
        self.payload.clear();
        self.frame.fill(0);

        if err.is_integrity_failure() {
            tracing::warn!(frame = self.frame_number, error = %err, "secured stream integrity failure");
        } else {
            tracing::debug!(frame = self.frame_number, error = %err, "secured stream read failed");
        }
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if !self.payload.is_empty() {
                let n = buf.len().min(self.payload.len());
                buf[..n].copy_from_slice(&self.payload[..n]);
                self.payload.advance(n);
                return Ok(n);
            }

            match self.state {
                ReadState::Finished => return Ok(0),
                ReadState::Failed => return Err(StreamError::Closed.into()),
                ReadState::Open => {},
            }

            if let Err(e) = self.read_frame() {
                self.fail(&e);
                return Err(e.into());
            }
        }
    }
}
