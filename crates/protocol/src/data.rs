//! Data frame encoding/decoding
//!
//! A data frame carries one micro-batch's activations around the ring:
//! `u32 cycle_id | u32 batch_id | u32 n_tokens | u32 n_bytes | bytes`.
//!
//! The payload is the activation block (`n_tokens * hidden_dim`
//! little-endian `f16` values) followed by one [`TokenMeta`] record per
//! token (position, sequence, flags). `n_bytes` covers both blocks.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use half::f16;
use std::io::{Cursor, Read, Write};

use crate::constants::{
    DATA_HEADER_SIZE, MAX_FRAME_BYTES, META_FLAG_LOGITS, TOKEN_META_SIZE,
};
use crate::error::{ProtocolError, Result};

/// Per-token metadata carried alongside the activation block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenMeta {
    /// KV position of this token
    pub pos: i32,
    /// Owning sequence
    pub seq_id: u32,
    /// Flag bits; see `META_FLAG_LOGITS`
    pub flags: u8,
}

impl TokenMeta {
    pub fn new(pos: i32, seq_id: u32) -> Self {
        Self {
            pos,
            seq_id,
            flags: 0,
        }
    }

    pub fn with_logits(mut self) -> Self {
        self.flags |= META_FLAG_LOGITS;
        self
    }

    /// Whether the head should extract logits for this token
    pub fn wants_logits(&self) -> bool {
        self.flags & META_FLAG_LOGITS != 0
    }
}

/// Decoded payload of a data frame
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationPayload {
    /// Activations, `metas.len() * hidden_dim`, row-major
    pub activations: Vec<f16>,
    /// One record per token, in batch order
    pub metas: Vec<TokenMeta>,
}

impl ActivationPayload {
    /// Payload size on the wire for `n_tokens` tokens of width `hidden_dim`
    pub fn wire_size(n_tokens: usize, hidden_dim: usize) -> usize {
        n_tokens * hidden_dim * 2 + n_tokens * TOKEN_META_SIZE
    }

    /// Encode to bytes; `hidden_dim` must divide the activation length
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(self.activations.len() * 2 + self.metas.len() * TOKEN_META_SIZE);
        for a in &self.activations {
            buf.write_u16::<LittleEndian>(a.to_bits()).unwrap();
        }
        for m in &self.metas {
            buf.write_i32::<LittleEndian>(m.pos).unwrap();
            buf.write_u32::<LittleEndian>(m.seq_id).unwrap();
            buf.write_u8(m.flags).unwrap();
        }
        buf
    }

    /// Decode from bytes given the token count and hidden dimension
    pub fn decode(data: &[u8], n_tokens: usize, hidden_dim: usize) -> Result<Self> {
        let need = Self::wire_size(n_tokens, hidden_dim);
        if data.len() < need {
            return Err(ProtocolError::BufferTooShort {
                need,
                have: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let mut activations = Vec::with_capacity(n_tokens * hidden_dim);
        for _ in 0..n_tokens * hidden_dim {
            activations.push(f16::from_bits(cursor.read_u16::<LittleEndian>()?));
        }

        let mut metas = Vec::with_capacity(n_tokens);
        for _ in 0..n_tokens {
            let pos = cursor.read_i32::<LittleEndian>()?;
            let seq_id = cursor.read_u32::<LittleEndian>()?;
            let flags = cursor.read_u8()?;
            metas.push(TokenMeta { pos, seq_id, flags });
        }

        Ok(Self { activations, metas })
    }
}

/// A complete data frame
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    /// Which ring traversal this batch is on
    pub cycle_id: u32,
    /// Head-assigned micro-batch id, monotone per submission
    pub batch_id: u32,
    /// Token count in the payload
    pub n_tokens: u32,
    /// Raw payload bytes (activation block + meta block)
    pub payload: Vec<u8>,
}

impl DataFrame {
    /// Build a frame from a decoded payload
    pub fn new(cycle_id: u32, batch_id: u32, payload: &ActivationPayload) -> Self {
        Self {
            cycle_id,
            batch_id,
            n_tokens: payload.metas.len() as u32,
            payload: payload.encode(),
        }
    }

    /// Decode this frame's payload
    pub fn decode_payload(&self, hidden_dim: usize) -> Result<ActivationPayload> {
        let payload =
            ActivationPayload::decode(&self.payload, self.n_tokens as usize, hidden_dim)?;
        let expected = ActivationPayload::wire_size(self.n_tokens as usize, hidden_dim);
        if self.payload.len() != expected {
            return Err(ProtocolError::PayloadLengthMismatch {
                expected,
                got: self.payload.len(),
            });
        }
        Ok(payload)
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DATA_HEADER_SIZE + self.payload.len());
        buf.write_u32::<LittleEndian>(self.cycle_id).unwrap();
        buf.write_u32::<LittleEndian>(self.batch_id).unwrap();
        buf.write_u32::<LittleEndian>(self.n_tokens).unwrap();
        buf.write_u32::<LittleEndian>(self.payload.len() as u32)
            .unwrap();
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Write the frame to a stream
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Read one frame from a stream, blocking until all bytes arrive
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; DATA_HEADER_SIZE];
        reader.read_exact(&mut header)?;

        let mut cursor = Cursor::new(&header[..]);
        let cycle_id = cursor.read_u32::<LittleEndian>()?;
        let batch_id = cursor.read_u32::<LittleEndian>()?;
        let n_tokens = cursor.read_u32::<LittleEndian>()?;
        let n_bytes = cursor.read_u32::<LittleEndian>()? as usize;

        if n_bytes > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                got: n_bytes,
                limit: MAX_FRAME_BYTES,
            });
        }

        let mut payload = vec![0u8; n_bytes];
        reader.read_exact(&mut payload)?;

        Ok(Self {
            cycle_id,
            batch_id,
            n_tokens,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(n_tokens: usize, hidden_dim: usize) -> ActivationPayload {
        let activations = (0..n_tokens * hidden_dim)
            .map(|i| f16::from_f32(i as f32 * 0.25))
            .collect();
        let metas = (0..n_tokens)
            .map(|i| {
                let m = TokenMeta::new(i as i32, 1);
                if i == n_tokens - 1 {
                    m.with_logits()
                } else {
                    m
                }
            })
            .collect();
        ActivationPayload { activations, metas }
    }

    #[test]
    fn test_payload_roundtrip() {
        let payload = sample_payload(4, 8);
        let encoded = payload.encode();
        assert_eq!(encoded.len(), ActivationPayload::wire_size(4, 8));

        let decoded = ActivationPayload::decode(&encoded, 4, 8).unwrap();
        assert_eq!(decoded, payload);
        assert!(decoded.metas[3].wants_logits());
        assert!(!decoded.metas[0].wants_logits());
    }

    #[test]
    fn test_frame_roundtrip() {
        let payload = sample_payload(3, 16);
        let frame = DataFrame::new(1, 42, &payload);

        let mut stream = Vec::new();
        frame.write_to(&mut stream).unwrap();

        let decoded = DataFrame::read_from(&mut Cursor::new(stream)).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.decode_payload(16).unwrap(), payload);
    }

    #[test]
    fn test_truncated_payload() {
        let payload = sample_payload(2, 8);
        let encoded = payload.encode();

        let result = ActivationPayload::decode(&encoded[..10], 2, 8);
        assert!(matches!(result, Err(ProtocolError::BufferTooShort { .. })));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut stream = Vec::new();
        stream.write_u32::<LittleEndian>(0).unwrap();
        stream.write_u32::<LittleEndian>(0).unwrap();
        stream.write_u32::<LittleEndian>(1).unwrap();
        stream
            .write_u32::<LittleEndian>(MAX_FRAME_BYTES as u32 + 1)
            .unwrap();

        let result = DataFrame::read_from(&mut Cursor::new(stream));
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { .. })));
    }
}
