//! Application state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ringlm_model::Tokenizer;

use crate::config::ServerConfig;
use crate::scheduler::SchedulerHandle;

/// Server metadata for `/props` and `/v1/models`
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub version: String,
    pub model_alias: String,
    pub started_at: Instant,
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<ServerConfig>,

    /// The slot scheduler on its dedicated thread
    pub scheduler: Arc<SchedulerHandle>,

    /// Head-node tokenizer
    pub tokenizer: Arc<dyn Tokenizer>,

    /// Server info
    pub info: Arc<ServerInfo>,

    /// Whether the model is loaded and the ring is up
    pub ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        scheduler: Arc<SchedulerHandle>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Self {
        let info = ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_alias: config.model_alias.clone(),
            started_at: Instant::now(),
        };

        Self {
            config: Arc::new(config),
            scheduler,
            tokenizer,
            info: Arc::new(info),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.info.started_at.elapsed()
    }
}
