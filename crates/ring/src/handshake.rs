//! Bring-up handshake
//!
//! Before binary frames flow, the signal link carries length-prefixed JSON
//! messages relayed around the ring: every worker's `Hello` travels hop by
//! hop to the head; the head answers with one `Assign` that circulates back
//! around. When the head sees its own `Assign` return, every rank has its
//! windows and the links switch to frame mode.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use ringlm_model::ModelConfig;
use ringlm_planner::{Assignment, DeviceProfile};

use crate::error::{Result, RingError};

/// Upper bound on a handshake message, guards against corrupt prefixes
const MAX_HANDSHAKE_BYTES: usize = 1 << 20;

/// A bring-up message on the signal link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMsg {
    /// Worker introduces itself; relayed until the head has every profile
    Hello { rank: usize, profile: DeviceProfile },
    /// The head's plan; circulates once around the ring
    Assign {
        assignment: Assignment,
        model: ModelConfig,
    },
}

/// Write one length-prefixed message
pub fn write_handshake<W: Write>(writer: &mut W, msg: &HandshakeMsg) -> Result<()> {
    let body = serde_json::to_vec(msg)?;
    writer.write_u32::<LittleEndian>(body.len() as u32)?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed message, blocking until complete
pub fn read_handshake<R: Read>(reader: &mut R) -> Result<HandshakeMsg> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    if len > MAX_HANDSHAKE_BYTES {
        return Err(RingError::BringUp(format!(
            "handshake message of {len} bytes exceeds limit"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(serde_json::from_slice(&body)?)
}
