//! The slot scheduler
//!
//! A single cooperative loop on a dedicated thread multiplexes every
//! request onto the slot array. Tasks arrive through the queue (cancels
//! at the front), results leave through per-task channels. Pipeline steps
//! go through the head engine; every cache mutation is broadcast through
//! the control plane before the data that depends on it.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use ringlm_engine::HeadEngine;
use ringlm_kv::KvMutation;
use ringlm_model::{Token, Tokenizer};

use crate::config::ServerConfig;
use crate::error::{format_error_response, ErrorKind};
use crate::metrics::ServerMetrics;
use crate::queue::{ResultHub, TaskQueue};
use crate::sampler::Sampler;
use crate::slot::{Slot, SlotState, StopReason};
use crate::task::{CompletionTask, LoraAdapter, Task, TaskPayload, TaskResult};
use crate::update_slots::DraftModel;

/// Shared handle the HTTP layer talks to
pub struct SchedulerHandle {
    pub queue: Arc<TaskQueue>,
    pub results: Arc<ResultHub>,
    pub idle_slots: AtomicUsize,
    pub total_slots: usize,
    /// Registered adapters, written by the scheduler on `SetLora`
    pub lora: Mutex<Vec<LoraAdapter>>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// Start the scheduler thread
    pub fn spawn(
        engine: HeadEngine,
        tokenizer: Arc<dyn Tokenizer>,
        config: ServerConfig,
        draft: Option<DraftModel>,
    ) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new());
        let results = ResultHub::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let total_slots = config.n_parallel.max(1);

        let handle = Arc::new(Self {
            queue: queue.clone(),
            results: results.clone(),
            idle_slots: AtomicUsize::new(total_slots),
            total_slots,
            lora: Mutex::new(Vec::new()),
            shutdown: shutdown.clone(),
            thread: Mutex::new(None),
        });

        let ctx_handle = handle.clone();
        let thread = std::thread::Builder::new()
            .name("slot-scheduler".into())
            .spawn(move || {
                let ctx = SchedulerContext::new(
                    engine, tokenizer, config, draft, queue, results, shutdown, ctx_handle,
                );
                ctx.run();
            })
            .expect("spawn slot-scheduler");

        *handle.thread.lock() = Some(thread);
        handle
    }

    /// Queue a task and open its result channel
    pub fn submit(
        &self,
        payload: TaskPayload,
    ) -> (i32, tokio::sync::mpsc::UnboundedReceiver<TaskResult>) {
        let id = self.queue.next_id();
        let rx = self.results.register(id);
        self.queue.post(Task { id, payload });
        (id, rx)
    }

    /// Queue a cancellation for a running task
    pub fn cancel(&self, target: i32) -> (i32, tokio::sync::mpsc::UnboundedReceiver<TaskResult>) {
        self.submit(TaskPayload::Cancel { target })
    }

    /// Ask the scheduler to wind down and wait for it
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.close();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

pub(crate) struct SchedulerContext {
    pub config: ServerConfig,
    pub engine: HeadEngine,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub queue: Arc<TaskQueue>,
    pub results: Arc<ResultHub>,
    pub slots: Vec<Slot>,
    pub metrics: ServerMetrics,
    pub draft: Option<DraftModel>,
    pub system_tokens: Vec<Token>,
    pub system_needs_update: bool,
    shutdown: Arc<AtomicBool>,
    handle: Arc<SchedulerHandle>,
}

impl SchedulerContext {
    #[allow(clippy::too_many_arguments)]
    fn new(
        engine: HeadEngine,
        tokenizer: Arc<dyn Tokenizer>,
        config: ServerConfig,
        draft: Option<DraftModel>,
        queue: Arc<TaskQueue>,
        results: Arc<ResultHub>,
        shutdown: Arc<AtomicBool>,
        handle: Arc<SchedulerHandle>,
    ) -> Self {
        let slots = (0..config.n_parallel.max(1))
            .map(|id| Slot::new(id, config.ga_n, config.ga_w))
            .collect();
        let system_needs_update = config.system_prompt.is_some();

        Self {
            config,
            engine,
            tokenizer,
            queue,
            results,
            slots,
            metrics: ServerMetrics::default(),
            draft,
            system_tokens: Vec::new(),
            system_needs_update,
            shutdown,
            handle,
        }
    }

    fn any_active(&self) -> bool {
        self.slots.iter().any(|s| s.is_processing())
    }

    fn publish_idle_count(&self) {
        let idle = self.slots.iter().filter(|s| !s.is_processing()).count();
        self.handle.idle_slots.store(idle, Ordering::SeqCst);
    }

    /// The cooperative loop: drain tasks, then run one update-slots
    /// iteration; block on the queue only when every slot is idle
    fn run(mut self) {
        tracing::info!(slots = self.slots.len(), "slot scheduler running");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            while let Some(task) = self.queue.try_pop() {
                self.process_task(task);
            }

            if !self.any_active() {
                self.publish_idle_count();
                match self.queue.pop() {
                    Some(task) => {
                        self.process_task(task);
                        continue;
                    }
                    None => break,
                }
            }

            self.publish_idle_count();
            if let Err(e) = self.update_slots() {
                tracing::error!(error = %e, "pipeline failure, stopping");
                let ids: Vec<i32> = self
                    .slots
                    .iter()
                    .filter(|s| s.is_processing())
                    .map(|s| s.task_id)
                    .collect();
                for task_id in ids {
                    self.send_error(task_id, &e.to_string(), ErrorKind::Server);
                }
                break;
            }
        }

        self.publish_idle_count();
        if let Err(e) = self.engine.stop() {
            tracing::warn!(error = %e, "engine stop failed");
        }
        tracing::info!("slot scheduler stopped");
    }

    // ------------------------------------------------------------------
    // task dispatch
    // ------------------------------------------------------------------

    fn process_task(&mut self, task: Task) {
        match task.payload.clone() {
            TaskPayload::Completion(completion) => {
                self.dispatch_completion(task, *completion);
            }
            TaskPayload::Cancel { target } => {
                self.cancel_task(task.id, target);
            }
            TaskPayload::NextResponse => {
                self.queue.kick_deferred();
            }
            TaskPayload::Metrics => {
                let data = self.metrics_snapshot();
                self.metrics.reset_bucket();
                self.results.send(TaskResult::finished(task.id, data));
            }
            TaskPayload::SlotSave { slot_id, filename } => {
                let result = self.slot_save(slot_id, &filename);
                self.reply_slot_action(task.id, slot_id, result);
            }
            TaskPayload::SlotRestore { slot_id, filename } => {
                let result = self.slot_restore(slot_id, &filename);
                self.reply_slot_action(task.id, slot_id, result);
            }
            TaskPayload::SlotErase { slot_id } => {
                let result = self.slot_erase(slot_id);
                self.reply_slot_action(task.id, slot_id, result);
            }
            TaskPayload::SetLora { adapters } => {
                tracing::info!(n = adapters.len(), "adapters set");
                *self.handle.lora.lock() = adapters;
                self.results
                    .send(TaskResult::finished(task.id, json!({"success": true})));
            }
        }
    }

    fn dispatch_completion(&mut self, task: Task, completion: CompletionTask) {
        // pick the slot: explicit id, else longest common prefix, else
        // least recently used idle
        let slot_idx = match completion.params.slot_id {
            Some(id) => {
                if id >= self.slots.len() {
                    self.send_error(
                        task.id,
                        &format!("invalid slot id {id}"),
                        ErrorKind::InvalidRequest,
                    );
                    return;
                }
                if self.slots[id].is_processing() {
                    self.queue.defer(task);
                    return;
                }
                Some(id)
            }
            None => self.select_slot(&completion.prompt),
        };

        let Some(slot_idx) = slot_idx else {
            // every slot busy
            self.queue.defer(task);
            return;
        };

        if let Err(message) = self.launch_slot(slot_idx, task.id, completion) {
            self.send_error(task.id, &message, ErrorKind::InvalidRequest);
        }
    }

    /// LCP-then-LRU slot selection. Token-array prompts never join the
    /// similarity match; they fall through to LRU.
    fn select_slot(&self, prompt: &Value) -> Option<usize> {
        let threshold = self.config.slot_prompt_similarity;

        if threshold > 0.0 {
            if let Some(prompt_str) = prompt.as_str() {
                let mut best: Option<(usize, usize)> = None; // (lcp, slot)
                for slot in &self.slots {
                    if slot.is_processing() {
                        continue;
                    }
                    let Some(cached) = slot.prompt.as_ref().and_then(Value::as_str) else {
                        continue;
                    };
                    if cached.is_empty() {
                        continue;
                    }

                    let lcp = common_prefix_len(cached.as_bytes(), prompt_str.as_bytes());
                    let similarity = lcp as f32 / cached.len() as f32;
                    if similarity > threshold && best.map_or(true, |(b, _)| lcp > b) {
                        best = Some((lcp, slot.id));
                    }
                }
                if let Some((lcp, id)) = best {
                    tracing::debug!(slot = id, lcp, "selected slot by prompt similarity");
                    return Some(id);
                }
            }
        }

        self.slots
            .iter()
            .filter(|s| !s.is_processing())
            .min_by_key(|s| s.t_last_used)
            .map(|s| s.id)
    }

    fn launch_slot(
        &mut self,
        slot_idx: usize,
        task_id: i32,
        completion: CompletionTask,
    ) -> Result<(), String> {
        if !matches!(
            completion.prompt,
            Value::String(_) | Value::Array(_) | Value::Number(_)
        ) {
            return Err("prompt must be a string, an array, or a single token".into());
        }

        let slot = &mut self.slots[slot_idx];
        slot.reset();
        slot.task_id = task_id;
        slot.mode = completion.mode;
        slot.params = completion.params;
        slot.prompt = Some(completion.prompt);
        slot.prompt_tokens.clear();
        slot.sampler = Some(Sampler::new(slot.params.sampling.clone()));
        slot.state = SlotState::ProcessingPrompt;
        slot.t_start_process_prompt = Instant::now();
        slot.t_last_used = Instant::now();

        tracing::info!(slot = slot_idx, task = task_id, "slot launched");
        Ok(())
    }

    fn cancel_task(&mut self, cancel_id: i32, target: i32) {
        let Some(slot_idx) = self.slots.iter().position(|s| s.task_id == target) else {
            // already finished or never started; drop any waiter
            self.results.unregister(target);
            self.results
                .send(TaskResult::finished(cancel_id, json!({"cancelled": true})));
            return;
        };

        let seq = self.slots[slot_idx].seq_id();
        // clear the sequence everywhere; each rank drops its pending
        // activations for it
        if let Err(e) = self.engine.broadcast(KvMutation::remove_all(seq)) {
            tracing::warn!(error = %e, "cancel broadcast failed");
        }
        self.engine.purge_seq(seq);

        self.slots[slot_idx].cache_tokens.clear();
        self.results.unregister(target);
        self.release_slot(slot_idx);

        self.results
            .send(TaskResult::finished(cancel_id, json!({"cancelled": true})));
        tracing::info!(slot = slot_idx, task = target, "task cancelled");
    }

    // ------------------------------------------------------------------
    // slot persistence and metrics
    // ------------------------------------------------------------------

    fn persistence_path(&self, filename: &str) -> Result<std::path::PathBuf, String> {
        let Some(dir) = &self.config.slot_save_path else {
            return Err("slot persistence is disabled".into());
        };
        if filename.contains("..") || filename.contains('/') {
            return Err("invalid filename".into());
        }
        Ok(dir.join(filename))
    }

    fn slot_save(&mut self, slot_id: usize, filename: &str) -> Result<Value, String> {
        let path = self.persistence_path(filename)?;
        let slot = self.slots.get(slot_id).ok_or("invalid slot id")?;
        let seq = slot.seq_id();

        let t_start = Instant::now();
        let n_saved = self
            .engine
            .kv()
            .lock()
            .seq_save(seq, &path)
            .map_err(|e| e.to_string())?;
        let tokens_path = path.with_extension("tokens.json");
        std::fs::write(
            &tokens_path,
            serde_json::to_vec(&slot.cache_tokens).map_err(|e| e.to_string())?,
        )
        .map_err(|e| e.to_string())?;

        Ok(json!({
            "id_slot": slot_id,
            "filename": filename,
            "n_saved": n_saved,
            "timings": { "save_ms": t_start.elapsed().as_secs_f64() * 1e3 }
        }))
    }

    fn slot_restore(&mut self, slot_id: usize, filename: &str) -> Result<Value, String> {
        let path = self.persistence_path(filename)?;
        let seq = self
            .slots
            .get(slot_id)
            .ok_or("invalid slot id")?
            .seq_id();

        let t_start = Instant::now();
        let n_restored = self
            .engine
            .kv()
            .lock()
            .seq_restore(seq, &path)
            .map_err(|e| e.to_string())?;

        let tokens_path = path.with_extension("tokens.json");
        let tokens: Vec<Token> = std::fs::read(&tokens_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();

        let slot = &mut self.slots[slot_id];
        slot.cache_tokens = tokens;
        slot.cache_tokens.truncate(n_restored);
        slot.n_past = slot.cache_tokens.len() as i32;

        Ok(json!({
            "id_slot": slot_id,
            "filename": filename,
            "n_restored": n_restored,
            "timings": { "restore_ms": t_start.elapsed().as_secs_f64() * 1e3 }
        }))
    }

    fn slot_erase(&mut self, slot_id: usize) -> Result<Value, String> {
        let slot = self.slots.get_mut(slot_id).ok_or("invalid slot id")?;
        let seq = slot.seq_id();
        let n_erased = slot.cache_tokens.len();
        slot.cache_tokens.clear();
        slot.n_past = 0;

        self.engine
            .broadcast(KvMutation::remove_all(seq))
            .map_err(|e| e.to_string())?;

        Ok(json!({ "id_slot": slot_id, "n_erased": n_erased }))
    }

    fn reply_slot_action(&self, task_id: i32, slot_id: usize, result: Result<Value, String>) {
        match result {
            Ok(data) => self.results.send(TaskResult::finished(task_id, data)),
            Err(message) => {
                let kind = if message.contains("invalid slot") {
                    ErrorKind::InvalidRequest
                } else {
                    ErrorKind::Server
                };
                tracing::warn!(slot = slot_id, error = %message, "slot action failed");
                self.send_error(task_id, &message, kind);
            }
        }
    }

    fn metrics_snapshot(&self) -> Value {
        let slots: Vec<Value> = self
            .slots
            .iter()
            .map(|s| {
                json!({
                    "id": s.id,
                    "id_task": s.task_id,
                    "state": (match s.state {
                        SlotState::Idle => "idle",
                        SlotState::ProcessingPrompt => "processing_prompt",
                        SlotState::DonePrompt => "done_prompt",
                        SlotState::Generating => "generating",
                    }),
                    "n_past": s.n_past,
                    "n_decoded": s.n_decoded,
                    "n_ctx": self.config.n_ctx_slot,
                    "cache_tokens": s.cache_tokens.len(),
                    "truncated": s.truncated,
                    "stopped_word": s.stop_reason == StopReason::Word,
                })
            })
            .collect();

        json!({
            "slots": slots,
            "idle": self.slots.iter().filter(|s| !s.is_processing()).count(),
            "processing": self.slots.iter().filter(|s| s.is_processing()).count(),
            "n_prompt_tokens_processed_total": self.metrics.n_prompt_tokens_processed_total,
            "t_prompt_processing_total": self.metrics.t_prompt_processing_total_ms,
            "n_tokens_predicted_total": self.metrics.n_tokens_predicted_total,
            "t_tokens_generation_total": self.metrics.t_tokens_generation_total_ms,
            "n_prompt_tokens_processed": self.metrics.n_prompt_tokens_processed,
            "t_prompt_processing": self.metrics.t_prompt_processing_ms,
            "n_tokens_predicted": self.metrics.n_tokens_predicted,
            "t_tokens_generation": self.metrics.t_tokens_generation_ms,
            "n_decode_total": self.metrics.n_decode_total,
            "n_busy_slots_total": self.metrics.n_busy_slots_total,
            "uptime_s": self.metrics.t_start.elapsed().as_secs(),
        })
    }

    // ------------------------------------------------------------------
    // result helpers
    // ------------------------------------------------------------------

    pub(crate) fn send_error(&self, task_id: i32, message: &str, kind: ErrorKind) {
        tracing::error!(task = task_id, error = message, "task failed");
        self.results.send(TaskResult::failed(
            task_id,
            format_error_response(message, kind),
        ));
    }
}

/// Byte-level longest common prefix
pub(crate) fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Token-level longest common prefix
pub(crate) fn common_token_prefix(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
