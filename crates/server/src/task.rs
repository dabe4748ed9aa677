//! Tasks and results
//!
//! A task is the unit of work submitted to the scheduler; results flow
//! back through the result hub as JSON, one-shot or streamed. Ids are
//! monotonically assigned by the task queue.

use serde_json::Value;

use crate::sampler::SamplingParams;

/// What kind of completion a slot runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Normal,
    Embedding,
    Infill,
}

/// Speculative-decoding sub-parameters
#[derive(Debug, Clone, Copy)]
pub struct SpeculativeParams {
    /// Skip speculation when fewer than this many draft tokens fit
    pub n_min: usize,
    /// Most draft tokens proposed per step
    pub n_max: usize,
    /// Draft probability floor; below it the draft stops proposing
    pub p_min: f32,
}

impl Default for SpeculativeParams {
    fn default() -> Self {
        Self {
            n_min: 5,
            n_max: 16,
            p_min: 0.9,
        }
    }
}

/// Per-request slot parameters
#[derive(Debug, Clone)]
pub struct SlotParams {
    pub stream: bool,
    /// Reuse the KV prefix shared with the previous prompt on this slot
    pub cache_prompt: bool,
    /// New-token budget; -1 is unlimited
    pub n_predict: i32,
    /// Tokens kept from the start of the prompt on context shift
    pub n_keep: i32,
    /// Tokens discarded past `n_keep` on context shift; 0 means half the
    /// remainder
    pub n_discard: i32,
    /// Stop strings
    pub stop: Vec<String>,
    pub sampling: SamplingParams,
    pub speculative: SpeculativeParams,
    /// Pin the request to a slot; `None` lets the scheduler pick
    pub slot_id: Option<usize>,
}

impl Default for SlotParams {
    fn default() -> Self {
        Self {
            stream: false,
            cache_prompt: true,
            n_predict: -1,
            n_keep: 0,
            n_discard: 0,
            stop: Vec::new(),
            sampling: SamplingParams::default(),
            speculative: SpeculativeParams::default(),
            slot_id: None,
        }
    }
}

/// A completion-type task
#[derive(Debug, Clone)]
pub struct CompletionTask {
    /// String, token array, or a mixed array of both
    pub prompt: Value,
    pub params: SlotParams,
    pub mode: CompletionMode,
}

/// A LoRA adapter registration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoraAdapter {
    pub id: usize,
    pub path: String,
    pub scale: f32,
}

/// Everything the scheduler can be asked to do
#[derive(Debug, Clone)]
pub enum TaskPayload {
    Completion(Box<CompletionTask>),
    Cancel { target: i32 },
    /// Posted by the scheduler to itself when a slot is released, so
    /// deferred work re-enters the queue without a callback cycle
    NextResponse,
    Metrics,
    SlotSave { slot_id: usize, filename: String },
    SlotRestore { slot_id: usize, filename: String },
    SlotErase { slot_id: usize },
    SetLora { adapters: Vec<LoraAdapter> },
}

/// A queued unit of work
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i32,
    pub payload: TaskPayload,
}

/// One response frame for a task; `stop` marks the final frame
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub id: i32,
    pub stop: bool,
    pub error: bool,
    pub data: Value,
}

impl TaskResult {
    pub fn partial(id: i32, data: Value) -> Self {
        Self {
            id,
            stop: false,
            error: false,
            data,
        }
    }

    pub fn finished(id: i32, data: Value) -> Self {
        Self {
            id,
            stop: true,
            error: false,
            data,
        }
    }

    pub fn failed(id: i32, data: Value) -> Self {
        Self {
            id,
            stop: false,
            error: true,
            data,
        }
    }
}
