//! The update-slots iteration: batch building, prompt processing with
//! cache reuse, context shift, sampling, speculative decoding and
//! completion streaming. One call runs one cooperative step for every
//! active slot.

use half::f16;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ringlm_backend::{Accel, Backend, Batch, BatchEntry};
use ringlm_engine::EngineError;
use ringlm_kv::{KvCache, KvMutation};
use ringlm_model::{Token, Tokenizer, WeightStore};

use crate::error::ErrorKind;
use crate::scheduler::{common_token_prefix, SchedulerContext};
use crate::slot::{SlotState, StopReason};
use crate::task::{CompletionMode, TaskResult};

/// Grammar-rejection resample attempts before giving up on the constraint
const GRAMMAR_RESAMPLE_MAX: usize = 4;

impl SchedulerContext {
    /// One cooperative iteration over every active slot
    pub(crate) fn update_slots(&mut self) -> Result<(), EngineError> {
        if self.system_needs_update {
            self.update_system_prompt()?;
        }

        let sys = self.system_tokens.len() as i32;
        let mut entries: Vec<BatchEntry> = Vec::new();

        // generating slots first: one token each
        for slot_idx in 0..self.slots.len() {
            if self.slots[slot_idx].state != SlotState::Generating {
                continue;
            }

            self.shift_context_if_needed(slot_idx)?;
            if !self.slots[slot_idx].has_next_token {
                self.finalize_slot(slot_idx);
                continue;
            }

            self.apply_self_extend(slot_idx)?;

            let slot = &mut self.slots[slot_idx];
            let entry =
                BatchEntry::new(slot.sampled, sys + slot.next_position(), slot.seq_id())
                    .with_logits();
            slot.batch_index = Some(entries.len());
            entries.push(entry);
            slot.cache_tokens.push(slot.sampled);
            slot.n_past += 1;
            if slot.ga.enabled() {
                slot.n_past_se += 1;
            }
        }

        // prompt processing fills what is left of the batch
        for slot_idx in 0..self.slots.len() {
            if entries.len() >= self.config.n_batch {
                break;
            }
            if self.slots[slot_idx].state != SlotState::ProcessingPrompt {
                continue;
            }
            self.process_prompt(slot_idx, sys, &mut entries)?;
        }

        if entries.is_empty() {
            return Ok(());
        }

        let rows = self.decode_with_retry(&entries)?;
        let busy = self.slots.iter().filter(|s| s.is_processing()).count();
        self.metrics.on_decoded(busy);

        // hand each slot its logits row
        for slot_idx in 0..self.slots.len() {
            let Some(batch_index) = self.slots[slot_idx].batch_index.take() else {
                continue;
            };
            let Some(row) = rows.get(&batch_index) else {
                continue;
            };
            let row = row.clone();

            match self.slots[slot_idx].state {
                SlotState::DonePrompt => {
                    if self.slots[slot_idx].mode == CompletionMode::Embedding {
                        self.finish_embedding(slot_idx, &row);
                        continue;
                    }
                    {
                        let slot = &mut self.slots[slot_idx];
                        slot.state = SlotState::Generating;
                        slot.t_prompt_processing_ms =
                            slot.t_start_process_prompt.elapsed().as_secs_f64() * 1e3;
                        slot.t_start_generation = Instant::now();
                        self.metrics.on_prompt_eval(&self.slots[slot_idx]);
                    }
                    self.sample_and_process(slot_idx, &row)?;
                }
                SlotState::Generating => {
                    self.sample_and_process(slot_idx, &row)?;
                }
                _ => {}
            }

            if !self.slots[slot_idx].has_next_token {
                self.finalize_slot(slot_idx);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // system prompt
    // ------------------------------------------------------------------

    /// Reset the cache, evaluate the system prompt into sequence 0, copy
    /// it into every slot's sequence
    fn update_system_prompt(&mut self) -> Result<(), EngineError> {
        self.engine.broadcast(KvMutation::Clear)?;
        for slot in &mut self.slots {
            slot.cache_tokens.clear();
        }

        self.system_tokens = match &self.config.system_prompt {
            Some(text) if !text.is_empty() => self.tokenizer.tokenize(text, true),
            _ => Vec::new(),
        };

        if !self.system_tokens.is_empty() {
            let mut batch = Batch::new();
            for (i, &token) in self.system_tokens.iter().enumerate() {
                batch.push(BatchEntry::new(token, i as i32, 0));
            }
            self.engine.decode(&batch)?;

            for slot in &self.slots {
                self.engine.broadcast(KvMutation::Copy {
                    src: 0,
                    dst: slot.seq_id(),
                    p0: -1,
                    p1: -1,
                })?;
            }
            tracing::info!(tokens = self.system_tokens.len(), "system prompt evaluated");
        }

        self.system_needs_update = false;
        Ok(())
    }

    // ------------------------------------------------------------------
    // context shift and self-extend
    // ------------------------------------------------------------------

    /// Discard a middle window when the slot is about to outgrow its
    /// context; with shifting disabled the slot ends truncated
    fn shift_context_if_needed(&mut self, slot_idx: usize) -> Result<(), EngineError> {
        let sys = self.system_tokens.len() as i32;
        let n_ctx_slot = self.config.n_ctx_slot as i32;

        let slot = &self.slots[slot_idx];
        if slot.ga.enabled() || sys + slot.n_past + 1 < n_ctx_slot {
            return Ok(());
        }

        if !self.config.context_shift {
            let slot = &mut self.slots[slot_idx];
            slot.truncated = true;
            slot.stop_reason = StopReason::Limit;
            slot.has_next_token = false;
            return Ok(());
        }

        let seq = slot.seq_id();
        let n_past = slot.n_past;
        let n_keep = slot.params.n_keep.clamp(0, n_past);
        let n_left = n_past - n_keep;
        let n_discard = if slot.params.n_discard > 0 {
            slot.params.n_discard.min(n_left)
        } else {
            (n_left + 1) / 2
        };

        tracing::warn!(
            slot = slot_idx,
            n_keep,
            n_left,
            n_discard,
            "context shift"
        );

        self.engine.broadcast(KvMutation::Remove {
            seq,
            p0: sys + n_keep,
            p1: sys + n_keep + n_discard,
        })?;
        self.engine.broadcast(KvMutation::Add {
            seq,
            p0: sys + n_keep + n_discard,
            p1: sys + n_past,
            delta: -n_discard,
        })?;

        let slot = &mut self.slots[slot_idx];
        let keep = n_keep as usize;
        let discard = n_discard as usize;
        if slot.cache_tokens.len() > keep + discard {
            slot.cache_tokens.drain(keep..keep + discard);
        } else {
            slot.cache_tokens.truncate(keep);
        }
        slot.n_past -= n_discard;
        slot.truncated = true;
        Ok(())
    }

    /// Fold KV positions back under the trained context via the group
    /// attention transform, broadcasting each mutation
    fn apply_self_extend(&mut self, slot_idx: usize) -> Result<(), EngineError> {
        let slot = &mut self.slots[slot_idx];
        if !slot.ga.enabled() {
            return Ok(());
        }
        let seq = slot.seq_id();
        let mut n_past_se = slot.n_past_se;
        let mutations = slot.ga.advance(seq, &mut n_past_se);
        slot.n_past_se = n_past_se;

        for mutation in mutations {
            self.engine.broadcast(mutation)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // prompt processing
    // ------------------------------------------------------------------

    fn process_prompt(
        &mut self,
        slot_idx: usize,
        sys: i32,
        entries: &mut Vec<BatchEntry>,
    ) -> Result<(), EngineError> {
        if self.slots[slot_idx].prompt_tokens.is_empty() {
            if let Err(message) = self.prepare_prompt(slot_idx) {
                let task_id = self.slots[slot_idx].task_id;
                self.release_slot(slot_idx);
                self.send_error(task_id, &message, ErrorKind::InvalidRequest);
                return Ok(());
            }
            // an empty prompt completes immediately
            if self.slots[slot_idx].state == SlotState::Idle {
                return Ok(());
            }
            // stale tail beyond the reused prefix goes away at every rank
            let slot = &self.slots[slot_idx];
            self.engine.broadcast(KvMutation::Remove {
                seq: slot.seq_id(),
                p0: sys + slot.n_past,
                p1: -1,
            })?;
        }

        let slot = &mut self.slots[slot_idx];
        while (slot.n_past as usize) < slot.n_prompt_tokens
            && entries.len() < self.config.n_batch
        {
            let token = slot.prompt_tokens[slot.n_past as usize];
            entries.push(BatchEntry::new(token, sys + slot.n_past, slot.seq_id()));
            slot.cache_tokens.push(token);
            slot.n_past += 1;
            slot.n_prompt_tokens_processed += 1;
        }

        if slot.n_past as usize == slot.n_prompt_tokens {
            slot.state = SlotState::DonePrompt;
            if slot.ga.enabled() {
                slot.n_past_se = slot.n_past;
            }
            // only the last prompt token's logits are extracted
            let last = entries.len() - 1;
            entries[last].logits = true;
            slot.batch_index = Some(last);
        }
        Ok(())
    }

    /// Tokenise and validate a freshly-launched prompt; decides how much
    /// of the cached prefix survives
    fn prepare_prompt(&mut self, slot_idx: usize) -> Result<(), String> {
        let prompt = self.slots[slot_idx]
            .prompt
            .clone()
            .ok_or("slot has no prompt")?;
        let mut tokens = self.tokenize_prompt(&prompt)?;

        if tokens.is_empty() {
            // nothing to evaluate: answer immediately with an empty
            // completion
            let task_id = self.slots[slot_idx].task_id;
            let data = self.final_response_data(slot_idx, "");
            self.results.send(TaskResult::finished(task_id, data));
            self.release_slot(slot_idx);
            return Ok(());
        }

        let n_ctx_slot = self.config.n_ctx_slot;
        let slot = &mut self.slots[slot_idx];

        if slot.mode == CompletionMode::Embedding && tokens.len() > self.config.n_batch {
            return Err(format!(
                "embedding prompt of {} tokens exceeds the batch size {}",
                tokens.len(),
                self.config.n_batch
            ));
        }

        if tokens.len() >= n_ctx_slot {
            if !self.config.context_shift {
                return Err(
                    "the request exceeds the available context size, \
                     try increasing it or enabling context shift"
                        .into(),
                );
            }
            if !slot.ga.enabled() {
                // keep n_keep plus the right half of what fits
                let n_keep = slot.params.n_keep.clamp(0, n_ctx_slot as i32 - 1) as usize;
                let n_left = n_ctx_slot - n_keep;
                let n_block = (n_left / 2).max(1);
                let cut_from = n_keep + n_block;
                let tail_start = tokens.len() - (n_ctx_slot - cut_from).min(tokens.len());

                let mut truncated_tokens = tokens[..n_keep].to_vec();
                truncated_tokens.extend_from_slice(&tokens[tail_start..]);
                tokens = truncated_tokens;
                slot.truncated = true;
            }
        }

        // penalty window sees the prompt
        if let Some(sampler) = slot.sampler.as_mut() {
            for &t in &tokens {
                sampler.accept(t);
            }
        }

        slot.n_prompt_tokens = tokens.len();

        // cache reuse: keep the longest token prefix shared with what is
        // already resident, always leaving at least one token to decode
        slot.n_past = if slot.params.cache_prompt && !slot.ga.enabled() {
            let lcp = common_token_prefix(&slot.cache_tokens, &tokens);
            lcp.min(tokens.len() - 1) as i32
        } else {
            0
        };
        slot.cache_tokens.truncate(slot.n_past as usize);
        slot.prompt_tokens = tokens;

        tracing::debug!(
            slot = slot_idx,
            n_prompt = slot.n_prompt_tokens,
            reused = slot.n_past,
            "prompt prepared"
        );
        Ok(())
    }

    /// Accept a prompt as a string, a token array, a single token, or a
    /// mixed array of strings and tokens
    fn tokenize_prompt(&self, prompt: &Value) -> Result<Vec<Token>, String> {
        let vocab = self.tokenizer.vocab_size() as u64;
        match prompt {
            Value::String(text) => Ok(self.tokenizer.tokenize(text, true)),
            Value::Number(n) => {
                let token = n.as_u64().filter(|&t| t < vocab).ok_or("invalid token id")?;
                Ok(vec![token as Token])
            }
            Value::Array(parts) => {
                let mut tokens = Vec::new();
                let mut first = true;
                for part in parts {
                    match part {
                        Value::String(text) => {
                            tokens.extend(self.tokenizer.tokenize(text, first));
                        }
                        Value::Number(n) => {
                            let token =
                                n.as_u64().filter(|&t| t < vocab).ok_or("invalid token id")?;
                            tokens.push(token as Token);
                        }
                        _ => return Err("prompt array may hold strings and tokens only".into()),
                    }
                    first = false;
                }
                Ok(tokens)
            }
            _ => Err("prompt must be a string, an array, or a single token".into()),
        }
    }

    // ------------------------------------------------------------------
    // decoding
    // ------------------------------------------------------------------

    /// Decode the batch, halving on a full cache and retrying from the
    /// failed offset; a slot that still fails at size 1 ends with a
    /// server error
    fn decode_with_retry(
        &mut self,
        entries: &[BatchEntry],
    ) -> Result<HashMap<usize, Vec<f16>>, EngineError> {
        let mut rows: HashMap<usize, Vec<f16>> = HashMap::new();
        let mut pending: Vec<(usize, BatchEntry)> =
            entries.iter().copied().enumerate().collect();
        let mut n_batch_eff = self.config.n_batch.max(1);
        let mut i = 0usize;

        while i < pending.len() {
            let window = &pending[i..(i + n_batch_eff).min(pending.len())];
            let batch = Batch {
                entries: window.iter().map(|(_, e)| *e).collect(),
            };

            match self.engine.decode_activations(&batch) {
                Ok(decoded) => {
                    for (local, row) in decoded {
                        rows.insert(window[local].0, row);
                    }
                    i += window.len();
                }
                Err(EngineError::KvFull { offset }) if n_batch_eff > 1 => {
                    n_batch_eff /= 2;
                    tracing::warn!(
                        offset,
                        retry_batch = n_batch_eff,
                        "KV cache full, halving the micro-batch"
                    );
                }
                Err(EngineError::KvFull { offset }) => {
                    // unrecoverable for the owning slot
                    let seq = window[offset.min(window.len() - 1)].1.seq;
                    let slot_idx = (seq as usize).saturating_sub(1);
                    tracing::error!(slot = slot_idx, "KV cache full at micro-batch size 1");

                    if slot_idx < self.slots.len() {
                        let task_id = self.slots[slot_idx].task_id;
                        let _ = self.engine.broadcast(KvMutation::remove_all(seq));
                        self.slots[slot_idx].cache_tokens.clear();
                        self.slots[slot_idx].batch_index = None;
                        self.release_slot(slot_idx);
                        self.send_error(
                            task_id,
                            "no free space in the KV cache",
                            ErrorKind::Server,
                        );
                    }

                    // drop the failed slot's remaining work, keep the rest
                    let tail: Vec<(usize, BatchEntry)> = pending[i..]
                        .iter()
                        .filter(|(_, e)| e.seq != seq)
                        .copied()
                        .collect();
                    pending.truncate(i);
                    pending.extend(tail);
                }
                Err(other) => return Err(other),
            }
        }

        Ok(rows)
    }

    // ------------------------------------------------------------------
    // sampling and emission
    // ------------------------------------------------------------------

    fn sample_and_process(
        &mut self,
        slot_idx: usize,
        row: &[f16],
    ) -> Result<(), EngineError> {
        let token = self.sample_row(slot_idx, row);
        self.process_token(slot_idx, token);

        if self.slots[slot_idx].has_next_token && self.can_speculate(slot_idx) {
            self.speculative_step(slot_idx)?;
        }
        Ok(())
    }

    /// Project and sample one row, resampling while the grammar rejects
    fn sample_row(&mut self, slot_idx: usize, row: &[f16]) -> Token {
        let mut logits = self.engine.core().backend.project(row);
        let slot = &mut self.slots[slot_idx];
        let Some(sampler) = slot.sampler.as_mut() else {
            return 0;
        };

        let mut token = sampler.sample(&logits);
        for _ in 0..GRAMMAR_RESAMPLE_MAX {
            if sampler.grammar_accepts(&self.tokenizer.token_bytes(token)) {
                break;
            }
            // slow path: mask the rejected token and draw again
            logits[token as usize] = f32::NEG_INFINITY;
            token = sampler.sample(&logits);
        }
        sampler.accept(token);
        token
    }

    /// Record a sampled token, run stop/budget/limit checks, stream what
    /// is safe to emit
    fn process_token(&mut self, slot_idx: usize, token: Token) {
        let piece = self.tokenizer.token_bytes(token);
        let is_eog = self.tokenizer.is_eog(token);
        let n_ctx_train = self.engine.core().model.n_ctx_train;
        let server_n_predict = self.config.n_predict;
        let n_ctx_slot = self.config.n_ctx_slot;

        let slot = &mut self.slots[slot_idx];
        slot.sampled = token;
        slot.n_decoded += 1;
        slot.generated_tokens.push(token);
        slot.generated_bytes.extend_from_slice(&piece);

        let hold = slot.find_stop(piece.len());

        if is_eog && slot.has_next_token {
            slot.stop_reason = StopReason::Eos;
            slot.has_next_token = false;
        }

        if slot.has_next_token && !slot.has_budget(server_n_predict) {
            slot.stop_reason = StopReason::Limit;
            slot.has_next_token = false;
        }

        // hard cap so an EOS-less model cannot run forever
        if slot.n_decoded >= n_ctx_slot as i32 {
            slot.truncated = true;
            slot.stop_reason = StopReason::Limit;
            slot.has_next_token = false;
        }
        if slot.params.n_predict < 0
            && server_n_predict < 0
            && !slot.ga.enabled()
            && slot.n_prompt_tokens as i32 + slot.n_decoded >= n_ctx_train as i32
        {
            slot.truncated = true;
            slot.stop_reason = StopReason::Limit;
            slot.has_next_token = false;
        }

        if slot.params.stream {
            let hold = if slot.has_next_token { hold } else { None };
            if let Some(text) = slot.drainable_text(hold) {
                let data = json!({
                    "content": text,
                    "id_slot": slot.id,
                    "stop": false,
                });
                let task_id = slot.task_id;
                self.results.send(TaskResult::partial(task_id, data));
            }
        }
    }

    // ------------------------------------------------------------------
    // speculative decoding
    // ------------------------------------------------------------------

    fn can_speculate(&self, slot_idx: usize) -> bool {
        let slot = &self.slots[slot_idx];
        self.draft.is_some()
            && slot.params.speculative.n_max > 0
            && slot.params.cache_prompt
            && slot.state == SlotState::Generating
            && slot.mode == CompletionMode::Normal
    }

    /// Draft, verify in one ring pass, accept the longest matching run,
    /// roll the cache back past it everywhere
    fn speculative_step(&mut self, slot_idx: usize) -> Result<(), EngineError> {
        let sys = self.system_tokens.len() as i32;
        let (seq, sampled, n_past, spec) = {
            let slot = &self.slots[slot_idx];
            (
                slot.seq_id(),
                slot.sampled,
                slot.n_past,
                slot.params.speculative,
            )
        };

        let draft_tokens = {
            let mut ctx: Vec<Token> = self.slots[slot_idx].cache_tokens.clone();
            ctx.push(sampled);
            let Some(draft) = self.draft.as_ref() else {
                return Ok(());
            };
            draft.propose(seq, &ctx, spec.n_max, spec.p_min)
        };
        if draft_tokens.len() < spec.n_min {
            return Ok(());
        }

        // one batch: the accepted token plus the whole draft
        let mut batch = Batch::new();
        batch.push(BatchEntry::new(sampled, sys + n_past, seq).with_logits());
        for (j, &t) in draft_tokens.iter().enumerate() {
            batch.push(BatchEntry::new(t, sys + n_past + 1 + j as i32, seq).with_logits());
        }
        let decoded = self.decode_with_retry(&batch.entries)?;
        self.metrics.on_decoded(1);

        // the sampled token's cell is now resident
        {
            let slot = &mut self.slots[slot_idx];
            slot.cache_tokens.push(sampled);
            slot.n_past += 1;
        }

        let mut n_accepted = 0usize;
        for (j, &draft_token) in draft_tokens.iter().enumerate() {
            let Some(row) = decoded.get(&j).cloned() else {
                break;
            };
            let token = self.sample_row(slot_idx, &row);
            self.process_token(slot_idx, token);

            if token != draft_token {
                break;
            }
            n_accepted += 1;
            let slot = &mut self.slots[slot_idx];
            slot.cache_tokens.push(token);
            slot.n_past += 1;
            if !self.slots[slot_idx].has_next_token {
                break;
            }
        }

        // whole draft accepted: the last verification row yields one more
        // token for free; its cell is decoded on the next iteration
        if n_accepted == draft_tokens.len() && self.slots[slot_idx].has_next_token {
            if let Some(row) = decoded.get(&draft_tokens.len()).cloned() {
                let token = self.sample_row(slot_idx, &row);
                self.process_token(slot_idx, token);
            }
        }

        // drop the rejected tail of the draft at every rank
        let n_past = self.slots[slot_idx].n_past;
        self.engine.broadcast(KvMutation::Remove {
            seq,
            p0: sys + n_past,
            p1: -1,
        })?;

        tracing::debug!(
            slot = slot_idx,
            n_draft = draft_tokens.len(),
            n_accepted,
            "speculative step"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // completion and release
    // ------------------------------------------------------------------

    fn finish_embedding(&mut self, slot_idx: usize, row: &[f16]) {
        let task_id = self.slots[slot_idx].task_id;
        let embedding: Vec<f32> = row.iter().map(|x| x.to_f32()).collect();
        let data = json!({
            "embedding": embedding,
            "id_slot": slot_idx,
            "tokens_evaluated": self.slots[slot_idx].n_prompt_tokens,
        });
        self.results.send(TaskResult::finished(task_id, data));
        self.release_slot(slot_idx);
    }

    fn final_response_data(&self, slot_idx: usize, content: &str) -> Value {
        let slot = &self.slots[slot_idx];
        json!({
            "content": content,
            "id_slot": slot.id,
            "stop": true,
            "model": self.config.model_alias,
            "tokens_predicted": slot.n_decoded,
            "tokens_evaluated": slot.n_prompt_tokens,
            "generation_settings":
                slot.formatted_generation_settings(self.config.n_ctx_slot, &self.config.model_alias),
            "prompt": slot.prompt.clone().unwrap_or(Value::Null),
            "truncated": slot.truncated,
            "stopped_eos": slot.stop_reason == StopReason::Eos,
            "stopped_word": slot.stop_reason == StopReason::Word,
            "stopped_limit": slot.stop_reason == StopReason::Limit,
            "stopping_word": slot.stopping_word,
            "tokens_cached": slot.cache_tokens.len(),
            "timings": slot.formatted_timings(),
        })
    }

    /// Send the final frame and hand the slot back
    fn finalize_slot(&mut self, slot_idx: usize) {
        {
            let slot = &mut self.slots[slot_idx];
            slot.t_token_generation_ms =
                slot.t_start_generation.elapsed().as_secs_f64() * 1e3;
        }
        self.metrics.on_prediction(&self.slots[slot_idx]);

        let task_id = self.slots[slot_idx].task_id;
        let data = if self.slots[slot_idx].params.stream {
            // flush everything left, then close the stream
            if let Some(text) = self.slots[slot_idx].drain_rest() {
                self.results.send(TaskResult::partial(
                    task_id,
                    json!({"content": text, "id_slot": slot_idx, "stop": false}),
                ));
            }
            self.final_response_data(slot_idx, "")
        } else {
            let content =
                String::from_utf8_lossy(&self.slots[slot_idx].generated_bytes).into_owned();
            self.final_response_data(slot_idx, &content)
        };

        self.results.send(TaskResult::finished(task_id, data));
        self.release_slot(slot_idx);
    }

    /// Return a slot to the pool. The wake-up for deferred work goes
    /// through the queue as a task rather than a callback.
    pub(crate) fn release_slot(&mut self, slot_idx: usize) {
        let slot = &mut self.slots[slot_idx];
        tracing::info!(
            slot = slot_idx,
            task = slot.task_id,
            n_past = slot.n_past,
            truncated = slot.truncated,
            "slot released"
        );
        slot.state = SlotState::Idle;
        slot.task_id = -1;
        slot.t_last_used = Instant::now();

        let id = self.queue.next_id();
        self.queue.post(crate::task::Task {
            id,
            payload: crate::task::TaskPayload::NextResponse,
        });
    }
}

/// The speculative draft model: a whole small model resident on rank 0,
/// decoded locally, never through the ring.
pub struct DraftModel {
    backend: Backend,
    store: Arc<WeightStore>,
    kv: Mutex<KvCache>,
    cache_tokens: Mutex<HashMap<u32, Vec<Token>>>,
}

impl DraftModel {
    pub fn new(store: Arc<WeightStore>, accel: Accel, n_ctx_slot: usize) -> Result<Self, ringlm_backend::BackendError> {
        let config = store.config().clone();
        let backend = Backend::new(accel, config.clone())?;
        let kv = Mutex::new(KvCache::new(config.n_layers, n_ctx_slot, config.hidden_dim));
        Ok(Self {
            backend,
            store,
            kv,
            cache_tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Greedily propose up to `n_max` continuation tokens for `ctx`,
    /// stopping when the draft's own confidence drops below `p_min`
    pub fn propose(&self, seq: u32, ctx: &[Token], n_max: usize, p_min: f32) -> Vec<Token> {
        if ctx.is_empty() || n_max == 0 {
            return Vec::new();
        }

        let mut kv = self.kv.lock();
        let mut cache = self.cache_tokens.lock();
        let cached = cache.entry(seq).or_default();

        // sync the draft cache to the target context
        let lcp = common_token_prefix(cached, ctx).min(ctx.len() - 1);
        if kv
            .apply(KvMutation::Remove {
                seq,
                p0: lcp as i32,
                p1: -1,
            })
            .is_err()
        {
            return Vec::new();
        }
        cached.truncate(lcp);

        let mut batch = Batch::new();
        for (i, &token) in ctx.iter().enumerate().skip(lcp) {
            let entry = BatchEntry::new(token, i as i32, seq);
            batch.push(if i == ctx.len() - 1 {
                entry.with_logits()
            } else {
                entry
            });
        }

        let mut proposed = Vec::new();
        let mut pos = ctx.len() as i32;

        loop {
            let rows = match self.backend.decode_local(&self.store, &batch, &mut kv) {
                Ok(ringlm_backend::ComputeOutcome::Logits(rows)) => rows,
                _ => break,
            };
            let Some(row) = rows.last() else {
                break;
            };

            let (token, prob) = greedy_with_prob(&row.values);
            if prob < p_min || proposed.len() >= n_max {
                break;
            }
            proposed.push(token);

            batch = Batch::new();
            batch.push(BatchEntry::new(token, pos, seq).with_logits());
            pos += 1;
        }

        // roll the draft back to the verified context; accepted tokens
        // re-enter through the prefix sync next round
        let _ = kv.apply(KvMutation::Remove {
            seq,
            p0: ctx.len() as i32,
            p1: -1,
        });
        *cached = ctx.to_vec();

        proposed
    }
}

fn greedy_with_prob(logits: &[f32]) -> (Token, f32) {
    let mut best = 0usize;
    for (i, &v) in logits.iter().enumerate() {
        if v > logits[best] {
            best = i;
        }
    }
    let max = logits[best];
    let denom: f32 = logits.iter().map(|&v| (v - max).exp()).sum();
    (best as Token, 1.0 / denom.max(f32::MIN_POSITIVE))
}
