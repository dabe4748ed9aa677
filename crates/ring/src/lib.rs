//! Ring transport runtime and the KV-cache control plane.
//!
//! Nodes form a directed cycle `0 -> 1 -> ... -> N-1 -> 0` with two TCP
//! links per hop: the data port carries activation frames, the signal port
//! carries KV mutations and `STOP`. Bring-up relays a JSON handshake around
//! the signal ring (worker profiles in, the planner's assignment out); after
//! that both links switch to the binary frame formats.
//!
//! The control plane is single-writer: the head originates every mutation,
//! applies it locally, and flushes it down the signal egress before any
//! data frame that depends on it. Each worker applies mutations in arrival
//! order before touching the next data frame, then forwards them; frames
//! circulate exactly once.

mod bringup;
mod config;
mod control;
mod error;
mod handshake;
mod queue;
mod transport;

pub use bringup::{head_bringup, worker_bringup};
pub use config::RingConfig;
pub use control::{frame_to_mutation, mutation_to_frame, SignalBroadcaster, SignalIngress};
pub use error::{Result, RingError};
pub use handshake::{read_handshake, write_handshake, HandshakeMsg};
pub use queue::SharedQueue;
pub use transport::{spawn_data_reader, spawn_data_writer, RingTransport};
