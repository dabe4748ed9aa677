//! Server configuration

use std::path::PathBuf;

/// Head-node configuration: the HTTP surface plus the serving knobs the
/// scheduler reads
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind address
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// Bearer key protecting everything except `/health` and `/v1/models`
    pub api_key: Option<String>,
    /// Model alias reported by `/v1/models` and completions
    pub model_alias: String,

    /// Context size per slot
    pub n_ctx_slot: usize,
    /// Logical batch bound per decode call
    pub n_batch: usize,
    /// Number of parallel slots
    pub n_parallel: usize,
    /// Default new-token budget; -1 is unlimited
    pub n_predict: i32,
    /// Tokens kept from the start of the prompt on context shift
    pub n_keep: i32,
    /// Discard a middle window instead of erroring when a slot outgrows
    /// its context
    pub context_shift: bool,

    /// Minimum similarity for longest-common-prefix slot selection
    pub slot_prompt_similarity: f32,
    /// Directory for slot save/restore files; `None` disables persistence
    pub slot_save_path: Option<PathBuf>,

    /// System prompt evaluated once into sequence 0
    pub system_prompt: Option<String>,

    /// Group-attention factor; 1 disables self-extend
    pub ga_n: i32,
    /// Group-attention width
    pub ga_w: i32,

    /// Enable `/metrics`
    pub metrics: bool,
    /// Enable the embedding endpoints
    pub embedding: bool,
    /// Enable the rerank endpoints
    pub rerank: bool,

    /// Draft-model speculation defaults
    pub spec_n_min: usize,
    pub spec_n_max: usize,
    pub spec_p_min: f32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            api_key: None,
            model_alias: "ringlm".to_string(),
            n_ctx_slot: 4096,
            n_batch: 2048,
            n_parallel: 1,
            n_predict: -1,
            n_keep: 0,
            context_shift: true,
            slot_prompt_similarity: 0.5,
            slot_save_path: None,
            system_prompt: None,
            ga_n: 1,
            ga_w: 512,
            metrics: false,
            embedding: false,
            rerank: false,
            spec_n_min: 5,
            spec_n_max: 16,
            spec_p_min: 0.9,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
