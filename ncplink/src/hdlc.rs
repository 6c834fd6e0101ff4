//! HDLC-style byte framing
//!
//! Frames are delimited by a flag byte, escape-protected, and carry a
//! trailing 16-bit frame check (X.25 parameters: reflected polynomial,
//! init 0xFFFF, complemented on the wire, little-endian).
//!
//! The encoder writes into a caller-supplied chunk and reports
//! [`BufferExhausted`] when the chunk must be drained before the stream can
//! continue; every operation is all-or-nothing so a retry after draining
//! resumes cleanly. The decoder consumes one byte at a time, never blocks
//! and never allocates.

const FLAG: u8 = 0x7e;
const ESCAPE: u8 = 0x7d;
const ESCAPE_XOR: u8 = 0x20;
const XON: u8 = 0x11;
const XOFF: u8 = 0x13;
const VENDOR_SPECIFIC: u8 = 0xf8;

const FCS_INIT: u16 = 0xffff;
const FCS_GOOD: u16 = 0xf0b8;
const FCS_POLY: u16 = 0x8408;

fn fcs_update(fcs: u16, byte: u8) -> u16 {
    let mut fcs = fcs ^ byte as u16;
    for _ in 0..8 {
        fcs = if fcs & 1 != 0 { (fcs >> 1) ^ FCS_POLY } else { fcs >> 1 };
    }
    fcs
}

const fn needs_escape(byte: u8) -> bool {
    matches!(byte, FLAG | ESCAPE | XON | XOFF | VENDOR_SPECIFIC)
}

/// The output chunk is full; drain it and retry the failed operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BufferExhausted;

/// A caller-owned output window the encoder writes into.
pub struct Chunk<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Chunk<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.len
    }

    fn push(&mut self, byte: u8) {
        self.buf[self.len] = byte;
        self.len += 1;
    }
}

/// Streaming frame encoder.
pub struct Encoder {
    fcs: u16,
}

impl Encoder {
    pub fn new() -> Self {
        Self { fcs: FCS_INIT }
    }

    /// Opens a frame by emitting the flag byte.
    pub fn start(&mut self, out: &mut Chunk<'_>) -> Result<(), BufferExhausted> {
        if out.remaining() < 1 {
            return Err(BufferExhausted);
        }

        self.fcs = FCS_INIT;
        out.push(FLAG);
        Ok(())
    }

    /// Encodes one payload byte. On [`BufferExhausted`] nothing was
    /// consumed; drain the chunk and retry the same byte.
    pub fn encode(&mut self, byte: u8, out: &mut Chunk<'_>) -> Result<(), BufferExhausted> {
        let needed = if needs_escape(byte) { 2 } else { 1 };
        if out.remaining() < needed {
            return Err(BufferExhausted);
        }

        self.fcs = fcs_update(self.fcs, byte);
        if needed == 2 {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
        Ok(())
    }

    /// Closes the frame: emits the complemented frame check and the end
    /// flag. Idempotent under retry after [`BufferExhausted`].
    pub fn finalize(&mut self, out: &mut Chunk<'_>) -> Result<(), BufferExhausted> {
        let fcs = !self.fcs;
        let bytes = [fcs as u8, (fcs >> 8) as u8];

        let mut needed = 1;
        for byte in bytes {
            needed += if needs_escape(byte) { 2 } else { 1 };
        }
        if out.remaining() < needed {
            return Err(BufferExhausted);
        }

        for byte in bytes {
            if needs_escape(byte) {
                out.push(ESCAPE);
                out.push(byte ^ ESCAPE_XOR);
            } else {
                out.push(byte);
            }
        }
        out.push(FLAG);
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode failure for the frame in progress.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// The frame check did not validate.
    Fcs,
    /// The decoded frame exceeded the buffer.
    TooLong,
    /// The frame ended before a frame check could be present.
    Truncated,
}

/// Streaming frame decoder over an owned scratch buffer.
///
/// A delivered frame stays valid in the scratch buffer only until the next
/// byte is pushed.
pub struct Decoder<const N: usize> {
    buf: [u8; N],
    len: usize,
    fcs: u16,
    synced: bool,
    escaped: bool,
}

impl<const N: usize> Decoder<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            fcs: FCS_INIT,
            synced: false,
            escaped: false,
        }
    }

    pub fn reset(&mut self) {
        self.len = 0;
        self.fcs = FCS_INIT;
        self.synced = false;
        self.escaped = false;
    }

    fn restart(&mut self) {
        self.len = 0;
        self.fcs = FCS_INIT;
        self.escaped = false;
    }

    /// Number of bytes accumulated for the frame in progress.
    pub fn in_progress(&self) -> usize {
        self.len
    }

    /// The scratch prefix holding the most recently delivered frame.
    pub fn frame(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    /// Consumes one byte. `Ok(Some(len))` delivers a check-valid frame of
    /// `len` bytes (frame check stripped) in the scratch buffer.
    pub fn push(&mut self, byte: u8) -> Result<Option<usize>, DecodeError> {
        if !self.synced {
            if byte == FLAG {
                self.synced = true;
                self.restart();
            }
            return Ok(None);
        }

        match byte {
            FLAG => {
                if self.escaped {
                    // A flag may not follow an escape.
                    self.restart();
                    return Err(DecodeError::Truncated);
                }

                let len = self.len;
                let fcs = self.fcs;
                self.restart();

                match len {
                    0 => Ok(None), // back-to-back flags
                    1 => Err(DecodeError::Truncated),
                    _ if fcs == FCS_GOOD => Ok(Some(len - 2)),
                    _ => Err(DecodeError::Fcs),
                }
            }
            ESCAPE => {
                self.escaped = true;
                Ok(None)
            }
            mut byte => {
                if self.escaped {
                    byte ^= ESCAPE_XOR;
                    self.escaped = false;
                }

                if self.len == N {
                    self.restart();
                    return Err(DecodeError::TooLong);
                }

                self.buf[self.len] = byte;
                self.len += 1;
                self.fcs = fcs_update(self.fcs, byte);
                Ok(None)
            }
        }
    }
}

impl<const N: usize> Default for Decoder<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::vec;
    use std::vec::Vec;

    fn encode_frame(payload: &[u8]) -> Vec<u8> {
        let mut storage = [0u8; 512];
        let mut out = Chunk::new(&mut storage);
        let mut encoder = Encoder::new();

        encoder.start(&mut out).unwrap();
        for &byte in payload {
            encoder.encode(byte, &mut out).unwrap();
        }
        encoder.finalize(&mut out).unwrap();
        out.as_slice().to_vec()
    }

    fn decode_stream(stream: &[u8]) -> (Vec<Vec<u8>>, usize) {
        let mut decoder: Decoder<256> = Decoder::new();
        let mut frames = Vec::new();
        let mut errors = 0;

        for &byte in stream {
            match decoder.push(byte) {
                Ok(Some(len)) => frames.push(decoder.frame(len).to_vec()),
                Ok(None) => {}
                Err(_) => errors += 1,
            }
        }
        (frames, errors)
    }

    #[test]
    fn test_round_trip() {
        let payload = [0x82, 0x02, 0x52, 0x00, 0x41];
        let wire = encode_frame(&payload);
        let (frames, errors) = decode_stream(&wire);

        assert_eq!(errors, 0);
        assert_eq!(frames, [payload.to_vec()]);
    }

    #[test]
    fn test_escaped_bytes_round_trip() {
        let payload = [0x7e, 0x7d, 0x11, 0x13, 0xf8, 0x00, 0xff];
        let wire = encode_frame(&payload);

        // Every special byte must have been expanded.
        assert!(wire.len() >= 1 + payload.len() + 5 + 2 + 1);
        for window in wire[1..wire.len() - 1].windows(1) {
            if window[0] == 0x7e {
                panic!("unescaped flag inside frame body");
            }
        }

        let (frames, errors) = decode_stream(&wire);
        assert_eq!(errors, 0);
        assert_eq!(frames, [payload.to_vec()]);
    }

    #[test]
    fn test_boundaries_preserved_across_frames() {
        let mut wire = encode_frame(&[1, 2, 3]);
        wire.extend_from_slice(&encode_frame(&[4, 5]));

        let (frames, errors) = decode_stream(&wire);
        assert_eq!(errors, 0);
        assert_eq!(frames, [[1, 2, 3].to_vec(), [4, 5].to_vec()]);
    }

    #[test]
    fn test_bad_fcs_is_an_error() {
        let mut wire = encode_frame(&[1, 2, 3]);
        let corrupt = wire.len() - 4;
        wire[corrupt] ^= 0x01;

        let (frames, errors) = decode_stream(&wire);
        assert!(frames.is_empty());
        assert_eq!(errors, 1);
    }

    #[test]
    fn test_leading_noise_ignored_until_sync() {
        let mut wire = vec![0x55, 0xaa, 0x13];
        wire.extend_from_slice(&encode_frame(&[9, 9]));

        let (frames, errors) = decode_stream(&wire);
        assert_eq!(errors, 0);
        assert_eq!(frames, [[9, 9].to_vec()]);
    }

    #[test]
    fn test_overlong_frame_is_an_error() {
        let mut decoder: Decoder<16> = Decoder::new();
        decoder.push(FLAG).unwrap();

        let mut result = Ok(None);
        for _ in 0..32 {
            result = decoder.push(0x42);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(DecodeError::TooLong));
    }

    #[test]
    fn test_encoder_resumes_after_exhaustion() {
        let payload: Vec<u8> = (0u8..=63).collect();
        let mut storage = [0u8; 16];
        let mut out = Chunk::new(&mut storage);
        let mut encoder = Encoder::new();
        let mut wire = Vec::new();

        encoder.start(&mut out).unwrap();
        for &byte in &payload {
            loop {
                match encoder.encode(byte, &mut out) {
                    Ok(()) => break,
                    Err(BufferExhausted) => {
                        wire.extend_from_slice(out.as_slice());
                        out.clear();
                    }
                }
            }
        }
        loop {
            match encoder.finalize(&mut out) {
                Ok(()) => break,
                Err(BufferExhausted) => {
                    wire.extend_from_slice(out.as_slice());
                    out.clear();
                }
            }
        }
        wire.extend_from_slice(out.as_slice());

        let (frames, errors) = decode_stream(&wire);
        assert_eq!(errors, 0);
        assert_eq!(frames, [payload]);
    }
}
