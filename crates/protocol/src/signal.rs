//! Signal frame encoding/decoding
//!
//! Signal frames are fixed 17-byte control messages:
//! `u8 kind | u32 seq_id | i32 p0 | i32 p1 | i32 delta_or_divisor`.
//!
//! The head originates every frame; downstream nodes apply it to their local
//! KV cache before the next data frame that depends on it, then forward it.
//! A `STOP` frame circulates once and terminates the ring.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use crate::constants::{SignalKind, SIGNAL_FRAME_SIZE};
use crate::error::{ProtocolError, Result};

/// A complete signal frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalFrame {
    /// Frame kind
    pub kind: SignalKind,
    /// Affected sequence (source sequence for `Copy`)
    pub seq_id: u32,
    /// Range start, inclusive; negative means 0
    pub p0: i32,
    /// Range end, exclusive; negative means unbounded
    pub p1: i32,
    /// Shift delta for `Add`, divisor for `Divide`, destination sequence
    /// for `Copy`; 0 otherwise
    pub delta_or_divisor: i32,
}

impl SignalFrame {
    /// A frame affecting the whole of `seq_id`
    pub fn whole_sequence(kind: SignalKind, seq_id: u32) -> Self {
        Self {
            kind,
            seq_id,
            p0: -1,
            p1: -1,
            delta_or_divisor: 0,
        }
    }

    /// The ring-terminating frame
    pub fn stop() -> Self {
        Self::whole_sequence(SignalKind::Stop, 0)
    }

    /// Encode the frame to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SIGNAL_FRAME_SIZE);
        buf.write_u8(self.kind.to_u8()).unwrap();
        buf.write_u32::<LittleEndian>(self.seq_id).unwrap();
        buf.write_i32::<LittleEndian>(self.p0).unwrap();
        buf.write_i32::<LittleEndian>(self.p1).unwrap();
        buf.write_i32::<LittleEndian>(self.delta_or_divisor).unwrap();
        buf
    }

    /// Decode a frame from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < SIGNAL_FRAME_SIZE {
            return Err(ProtocolError::BufferTooShort {
                need: SIGNAL_FRAME_SIZE,
                have: data.len(),
            });
        }

        let mut cursor = Cursor::new(data);
        let kind_raw = cursor.read_u8()?;
        let kind =
            SignalKind::from_u8(kind_raw).ok_or(ProtocolError::UnknownSignalKind(kind_raw))?;
        let seq_id = cursor.read_u32::<LittleEndian>()?;
        let p0 = cursor.read_i32::<LittleEndian>()?;
        let p1 = cursor.read_i32::<LittleEndian>()?;
        let delta_or_divisor = cursor.read_i32::<LittleEndian>()?;

        Ok(Self {
            kind,
            seq_id,
            p0,
            p1,
            delta_or_divisor,
        })
    }

    /// Write the frame to a stream
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Read one frame from a stream, blocking until all bytes arrive
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; SIGNAL_FRAME_SIZE];
        reader.read_exact(&mut buf)?;
        Self::decode(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_roundtrip() {
        let frame = SignalFrame {
            kind: SignalKind::Add,
            seq_id: 3,
            p0: 16,
            p1: 152,
            delta_or_divisor: -120,
        };

        let encoded = frame.encode();
        assert_eq!(encoded.len(), SIGNAL_FRAME_SIZE);

        let decoded = SignalFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_stop_roundtrip() {
        let frame = SignalFrame::stop();
        let decoded = SignalFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.kind, SignalKind::Stop);
    }

    #[test]
    fn test_unknown_kind() {
        let mut encoded = SignalFrame::stop().encode();
        encoded[0] = 42;

        let result = SignalFrame::decode(&encoded);
        assert!(matches!(result, Err(ProtocolError::UnknownSignalKind(42))));
    }

    #[test]
    fn test_stream_roundtrip() {
        let frames = vec![
            SignalFrame::whole_sequence(SignalKind::Clear, 0),
            SignalFrame {
                kind: SignalKind::Copy,
                seq_id: 0,
                p0: 0,
                p1: 64,
                delta_or_divisor: 5,
            },
            SignalFrame::stop(),
        ];

        let mut stream = Vec::new();
        for f in &frames {
            f.write_to(&mut stream).unwrap();
        }

        let mut cursor = Cursor::new(stream);
        for f in &frames {
            let got = SignalFrame::read_from(&mut cursor).unwrap();
            assert_eq!(&got, f);
        }
    }
}
