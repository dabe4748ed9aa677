//! Head-node serving: the slot scheduler and its HTTP surface.
//!
//! The scheduler multiplexes many concurrent generation requests onto a
//! fixed set of inference slots sharing one KV cache. It runs as a single
//! cooperative loop on a dedicated thread: tasks come in through a queue,
//! results stream back through per-task channels, and every pipeline step
//! goes through the head engine. The axum layer on top reproduces the
//! completion/embedding/rerank/slot-management endpoint set, with SSE
//! streaming for incremental tokens.

pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod routes;
pub mod sampler;
pub mod scheduler;
pub mod slot;
pub mod state;
pub mod stream;
pub mod task;
pub mod update_slots;

pub use config::ServerConfig;
pub use error::{ErrorKind, Result, ServerError};
pub use scheduler::SchedulerHandle;
pub use state::AppState;
pub use update_slots::DraftModel;
