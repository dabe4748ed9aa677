//! Wire formats for the ring transport.
//!
//! Two independent point-to-point links connect each node pair:
//!
//! - the **data port** carries activation frames
//!   (`cycle_id | batch_id | n_tokens | n_bytes | bytes`),
//! - the **signal port** carries small control frames for KV-cache
//!   mutations and the ring-terminating `STOP`.
//!
//! Both formats are fixed-schema little-endian. Frames are written and read
//! over any ordered, reliable byte stream; in practice a `TcpStream` per
//! direction.

pub mod constants;
pub mod data;
pub mod error;
pub mod signal;

pub use constants::SignalKind;
pub use data::{ActivationPayload, DataFrame, TokenMeta};
pub use error::{ProtocolError, Result};
pub use signal::SignalFrame;
