//! Inference slots
//!
//! A slot is a server-side reservation multiplexing one sequence onto the
//! shared KV cache. State moves `Idle -> ProcessingPrompt -> DonePrompt ->
//! Generating -> Idle`; ownership by a task is exclusive and transfers
//! atomically under the scheduler's single thread.

use serde_json::{json, Value};
use std::time::Instant;

use ringlm_kv::SelfExtend;
use ringlm_model::Token;

use crate::sampler::Sampler;
use crate::stream::{find_any_partial_stop, find_full_stop, incomplete_utf8_suffix};
use crate::task::{CompletionMode, SlotParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    ProcessingPrompt,
    DonePrompt,
    Generating,
}

/// Why a slot stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    None,
    Eos,
    Word,
    Limit,
}

pub struct Slot {
    pub id: usize,
    /// Owning task; -1 when idle
    pub task_id: i32,
    pub state: SlotState,
    pub params: SlotParams,
    pub mode: CompletionMode,

    /// The raw prompt as submitted (string, token array or mixed)
    pub prompt: Option<Value>,
    pub prompt_tokens: Vec<Token>,
    /// Materialised prefix currently resident in the KV cache
    pub cache_tokens: Vec<Token>,

    pub n_past: i32,
    pub n_decoded: i32,
    pub n_prompt_tokens: usize,
    pub n_prompt_tokens_processed: usize,
    /// Index of this slot's logits row in the in-flight decode, if any
    pub batch_index: Option<usize>,

    pub sampled: Token,
    pub generated_bytes: Vec<u8>,
    pub generated_tokens: Vec<Token>,
    /// Bytes of `generated_bytes` already emitted to the client
    pub n_sent_bytes: usize,

    pub has_next_token: bool,
    pub truncated: bool,
    pub stop_reason: StopReason,
    pub stopping_word: String,

    pub sampler: Option<Sampler>,

    /// Group-attention state; `ga.enabled()` gates the self-extend path
    pub ga: SelfExtend,
    pub n_past_se: i32,

    pub t_last_used: Instant,
    pub t_start_process_prompt: Instant,
    pub t_start_generation: Instant,
    pub t_prompt_processing_ms: f64,
    pub t_token_generation_ms: f64,
}

impl Slot {
    pub fn new(id: usize, ga_n: i32, ga_w: i32) -> Self {
        let now = Instant::now();
        Self {
            id,
            task_id: -1,
            state: SlotState::Idle,
            params: SlotParams::default(),
            mode: CompletionMode::Normal,
            prompt: None,
            prompt_tokens: Vec::new(),
            cache_tokens: Vec::new(),
            n_past: 0,
            n_decoded: 0,
            n_prompt_tokens: 0,
            n_prompt_tokens_processed: 0,
            batch_index: None,
            sampled: 0,
            generated_bytes: Vec::new(),
            generated_tokens: Vec::new(),
            n_sent_bytes: 0,
            has_next_token: true,
            truncated: false,
            stop_reason: StopReason::None,
            stopping_word: String::new(),
            sampler: None,
            ga: SelfExtend::new(ga_n, ga_w),
            n_past_se: 0,
            t_last_used: now,
            t_start_process_prompt: now,
            t_start_generation: now,
            t_prompt_processing_ms: 0.0,
            t_token_generation_ms: 0.0,
        }
    }

    /// The KV sequence this slot writes; sequence 0 is the system prompt
    pub fn seq_id(&self) -> u32 {
        self.id as u32 + 1
    }

    pub fn is_processing(&self) -> bool {
        self.state != SlotState::Idle
    }

    /// Clear per-request state; the cache prefix survives for reuse
    pub fn reset(&mut self) {
        self.n_prompt_tokens = 0;
        self.n_prompt_tokens_processed = 0;
        self.n_past = 0;
        self.n_decoded = 0;
        self.batch_index = None;
        self.sampled = 0;
        self.generated_bytes.clear();
        self.generated_tokens.clear();
        self.n_sent_bytes = 0;
        self.has_next_token = true;
        self.truncated = false;
        self.stop_reason = StopReason::None;
        self.stopping_word.clear();
        self.ga.reset();
        self.n_past_se = 0;
    }

    /// Whether the per-request or server-wide predict budget remains
    pub fn has_budget(&self, server_n_predict: i32) -> bool {
        let budget = if self.params.n_predict >= 0 {
            self.params.n_predict
        } else {
            server_n_predict
        };
        budget < 0 || self.n_decoded < budget
    }

    /// Position counter the next token decodes at (the self-extend shadow
    /// when group attention is active)
    pub fn next_position(&self) -> i32 {
        if self.n_past_se > 0 {
            self.n_past_se
        } else {
            self.n_past
        }
    }

    /// Scan for stop strings after a token appended `last_token_len`
    /// bytes. Full matches finalise the slot; a partial match returns the
    /// byte position where emission must hold.
    pub fn find_stop(&mut self, last_token_len: usize) -> Option<usize> {
        if self.params.stop.is_empty() {
            return None;
        }

        if let Some((pos, word)) =
            find_full_stop(&self.params.stop, &self.generated_bytes, last_token_len)
        {
            self.generated_bytes.truncate(pos);
            self.stop_reason = StopReason::Word;
            self.stopping_word = word;
            self.has_next_token = false;
            return Some(pos);
        }

        find_any_partial_stop(&self.params.stop, &self.generated_bytes)
    }

    /// The chunk of generated bytes safe to emit now: past what was
    /// already sent, not beyond `hold_at` (partial stop match), and never
    /// ending inside a UTF-8 code point.
    pub fn drainable_text(&mut self, hold_at: Option<usize>) -> Option<String> {
        let limit = hold_at.unwrap_or(self.generated_bytes.len());
        let safe = &self.generated_bytes[..limit];
        let end = safe.len() - incomplete_utf8_suffix(safe);
        if end <= self.n_sent_bytes {
            return None;
        }

        let chunk = &self.generated_bytes[self.n_sent_bytes..end];
        let text = String::from_utf8_lossy(chunk).into_owned();
        self.n_sent_bytes = end;
        Some(text)
    }

    /// Flush everything not yet emitted, including an incomplete trailing
    /// sequence (stream close only)
    pub fn drain_rest(&mut self) -> Option<String> {
        if self.n_sent_bytes >= self.generated_bytes.len() {
            return None;
        }
        let chunk = &self.generated_bytes[self.n_sent_bytes..];
        let text = String::from_utf8_lossy(chunk).into_owned();
        self.n_sent_bytes = self.generated_bytes.len();
        Some(text)
    }

    /// Timings block for final responses
    pub fn formatted_timings(&self) -> Value {
        let n_prompt = self.n_prompt_tokens_processed.max(1) as f64;
        let n_gen = self.n_decoded.max(1) as f64;
        json!({
            "prompt_n": self.n_prompt_tokens_processed,
            "prompt_ms": self.t_prompt_processing_ms,
            "prompt_per_token_ms": self.t_prompt_processing_ms / n_prompt,
            "prompt_per_second": 1e3 / self.t_prompt_processing_ms.max(1e-9) * n_prompt,
            "predicted_n": self.n_decoded,
            "predicted_ms": self.t_token_generation_ms,
            "predicted_per_token_ms": self.t_token_generation_ms / n_gen,
            "predicted_per_second": 1e3 / self.t_token_generation_ms.max(1e-9) * n_gen,
        })
    }

    /// Generation settings block echoed in responses
    pub fn formatted_generation_settings(&self, n_ctx_slot: usize, model_alias: &str) -> Value {
        let s = &self.params.sampling;
        json!({
            "n_ctx": n_ctx_slot,
            "model": model_alias,
            "seed": s.seed,
            "seed_cur": self.sampler.as_ref().map(|smpl| smpl.seed()).unwrap_or(0),
            "temperature": s.temperature,
            "top_k": s.top_k,
            "top_p": s.top_p,
            "min_p": s.min_p,
            "tfs_z": s.tfs_z,
            "typical_p": s.typical_p,
            "repeat_last_n": s.repeat_last_n,
            "repeat_penalty": s.repeat_penalty,
            "presence_penalty": s.presence_penalty,
            "frequency_penalty": s.frequency_penalty,
            "mirostat": s.mirostat,
            "mirostat_tau": s.mirostat_tau,
            "mirostat_eta": s.mirostat_eta,
            "penalize_nl": s.penalize_nl,
            "stop": self.params.stop,
            "max_tokens": self.params.n_predict,
            "n_keep": self.params.n_keep,
            "n_discard": self.params.n_discard,
            "stream": self.params.stream,
            "n_probs": s.n_probs,
            "grammar": s.grammar,
        })
    }
}
