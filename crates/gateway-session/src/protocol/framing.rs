//! Transport framing for envelopes.
//!
//! The gateway delimits envelopes on the TLS stream with SLIP byte stuffing.
//! [`FrameCodec`] abstracts the framing so a session can be driven over a
//! different scheme; [`EnvelopeFraming`] adapts any of them to
//! `tokio_util::codec`.

use crate::error::FrameError;
use crate::protocol::codec::MAX_ENVELOPE_LEN;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Frame delimiter.
pub const END: u8 = 0xC0;

/// Escape byte.
pub const ESC: u8 = 0xDB;

/// Escaped [`END`].
pub const ESC_END: u8 = 0xDC;

/// Escaped [`ESC`].
pub const ESC_ESC: u8 = 0xDD;

/// Turns envelopes into transport frames and back.
pub trait FrameCodec: Send + 'static {
    /// Append the frame for `envelope` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be framed.
    fn pack(&mut self, envelope: &[u8], dst: &mut BytesMut) -> Result<(), FrameError>;

    /// Take the next complete envelope out of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. On error the offending
    /// frame has already been consumed, so decoding can continue.
    ///
    /// # Errors
    ///
    /// Returns an error if the next frame is malformed.
    fn unpack(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError>;
}

impl<C: FrameCodec + ?Sized> FrameCodec for Box<C> {
    fn pack(&mut self, envelope: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        (**self).pack(envelope, dst)
    }

    fn unpack(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        (**self).unpack(src)
    }
}

/// SLIP (RFC 1055) framing.
#[derive(Debug, Clone)]
pub struct SlipCodec {
    max_frame_size: usize,
    /// Set after an oversized frame was dropped before its END arrived.
    discarding: bool,
}

impl SlipCodec {
    /// Create a new SLIP codec sized for gateway envelopes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_ENVELOPE_LEN,
            discarding: false,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    fn unescape(&self, raw: &[u8]) -> Result<Bytes, FrameError> {
        let mut frame = BytesMut::with_capacity(raw.len());
        let mut bytes = raw.iter().copied();

        while let Some(byte) = bytes.next() {
            if byte == ESC {
                match bytes.next() {
                    Some(ESC_END) => frame.put_u8(END),
                    Some(ESC_ESC) => frame.put_u8(ESC),
                    Some(other) => return Err(FrameError::InvalidEscape(other)),
                    None => return Err(FrameError::TruncatedEscape),
                }
            } else {
                frame.put_u8(byte);
            }
        }

        if frame.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }

        Ok(frame.freeze())
    }
}

impl Default for SlipCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec for SlipCodec {
    fn pack(&mut self, envelope: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        if envelope.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: envelope.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(envelope.len() * 2 + 2);
        dst.put_u8(END);
        for &byte in envelope {
            match byte {
                END => dst.put_slice(&[ESC, ESC_END]),
                ESC => dst.put_slice(&[ESC, ESC_ESC]),
                _ => dst.put_u8(byte),
            }
        }
        dst.put_u8(END);

        Ok(())
    }

    fn unpack(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if self.discarding {
            let Some(end) = src.iter().position(|&byte| byte == END) else {
                src.clear();
                return Ok(None);
            };
            src.advance(end + 1);
            self.discarding = false;
        }

        // Empty frames between delimiters carry nothing.
        match src.iter().position(|&byte| byte != END) {
            Some(start) => src.advance(start),
            None => {
                src.clear();
                return Ok(None);
            }
        }

        let Some(end) = src.iter().position(|&byte| byte == END) else {
            // Every envelope byte escapes to at most two.
            let limit = self.max_frame_size * 2;
            if src.len() > limit {
                let size = src.len();
                src.clear();
                self.discarding = true;
                return Err(FrameError::FrameTooLarge {
                    size,
                    max: self.max_frame_size,
                });
            }
            return Ok(None);
        };

        let raw = src.split_to(end + 1);
        self.unescape(&raw[..end]).map(Some)
    }
}

/// Adapts a [`FrameCodec`] to `tokio_util::codec`.
///
/// Malformed frames are yielded as `Ok(Err(_))` items so one bad frame does
/// not end the stream; only I/O failures do.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeFraming<C> {
    inner: C,
}

impl<C: FrameCodec> EnvelopeFraming<C> {
    /// Wrap a frame codec.
    pub const fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C: FrameCodec> Decoder for EnvelopeFraming<C> {
    type Item = Result<Bytes, FrameError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.unpack(src) {
            Ok(Some(envelope)) => Ok(Some(Ok(envelope))),
            Ok(None) => Ok(None),
            Err(e) => Ok(Some(Err(e))),
        }
    }
}

impl<C: FrameCodec> Encoder<Bytes> for EnvelopeFraming<C> {
    type Error = io::Error;

    fn encode(&mut self, envelope: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner
            .pack(&envelope, dst)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}
