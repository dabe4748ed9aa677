//! Head-side engine: drives whole forward passes around the ring

use half::f16;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ringlm_backend::{Batch, BatchEntry, LogitsRow};
use ringlm_kv::{KvCache, KvMutation};
use ringlm_protocol::{ActivationPayload, DataFrame, TokenMeta};
use ringlm_ring::{
    spawn_data_reader, spawn_data_writer, RingTransport, SharedQueue, SignalBroadcaster,
    SignalIngress,
};

use crate::core::{strip_seq, NodeCore};
use crate::error::{EngineError, Result};

/// One chunk of a micro-batch in flight around the ring
struct ChunkState {
    /// Indices into the originally submitted batch, aligned with `entries`
    orig_idx: Vec<usize>,
    entries: Vec<BatchEntry>,
    activations: Vec<f16>,
}

/// The head's pipeline engine.
///
/// `decode` splits a micro-batch into up to `C` chunks and keeps them all
/// in flight; each return triggers the head's next-cycle slice for that
/// chunk. Single-node rings short-circuit the transport entirely.
pub struct HeadEngine {
    core: NodeCore,
    ingress: Option<Arc<SharedQueue<DataFrame>>>,
    egress: Option<Arc<SharedQueue<DataFrame>>>,
    broadcaster: SignalBroadcaster,
    signal_ingress: Option<SignalIngress>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    next_batch_id: AtomicU32,
}

impl HeadEngine {
    /// Wire the head into the ring. `transport` is `None` on a
    /// single-node deployment.
    pub fn new(core: NodeCore, transport: Option<RingTransport>) -> Self {
        match transport {
            None => {
                let broadcaster = SignalBroadcaster::new(core.kv.clone(), None);
                Self {
                    core,
                    ingress: None,
                    egress: None,
                    broadcaster,
                    signal_ingress: None,
                    reader: None,
                    writer: None,
                    next_batch_id: AtomicU32::new(0),
                }
            }
            Some(transport) => {
                let capacity = core.config.queue_capacity.max(
                    core.assignment.cycles as usize + 1,
                );
                let ingress = Arc::new(SharedQueue::new(capacity));
                let egress = Arc::new(SharedQueue::new(capacity));

                let reader = spawn_data_reader(transport.data_in, ingress.clone());
                let writer = spawn_data_writer(transport.data_out, egress.clone());

                let broadcaster =
                    SignalBroadcaster::new(core.kv.clone(), Some(transport.signal_out));
                // frames that circled back stop here; mutations were
                // applied at origination
                let signal_ingress = SignalIngress::spawn(
                    transport.signal_in,
                    None,
                    core.kv.clone(),
                    |_| {},
                    || {},
                );

                Self {
                    core,
                    ingress: Some(ingress),
                    egress: Some(egress),
                    broadcaster,
                    signal_ingress: Some(signal_ingress),
                    reader: Some(reader),
                    writer: Some(writer),
                    next_batch_id: AtomicU32::new(0),
                }
            }
        }
    }

    /// The head's KV shard, shared with the control plane
    pub fn kv(&self) -> Arc<Mutex<KvCache>> {
        self.core.kv.clone()
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    /// Originate a cache mutation: apply locally, broadcast, flush. Always
    /// called before the data frame that depends on it.
    pub fn broadcast(&self, mutation: KvMutation) -> Result<()> {
        self.broadcaster.broadcast(mutation)?;
        Ok(())
    }

    /// Drop queued activations of a cancelled sequence
    pub fn purge_seq(&self, seq: u32) {
        let hidden_dim = self.core.model.hidden_dim;
        if let Some(ingress) = &self.ingress {
            ingress.for_each_mut(|frame| strip_seq(frame, seq, hidden_dim));
        }
        if let Some(egress) = &self.egress {
            egress.for_each_mut(|frame| strip_seq(frame, seq, hidden_dim));
        }
    }

    /// Run one full forward pass for a micro-batch and return the logits
    /// of every flagged entry, in batch order.
    pub fn decode(&self, batch: &Batch) -> Result<Vec<LogitsRow>> {
        Ok(self
            .decode_activations(batch)?
            .into_iter()
            .map(|(index, row)| LogitsRow {
                index,
                values: self.core.backend.project(&row),
            })
            .collect())
    }

    /// Run one full forward pass and return the final activation row of
    /// every flagged entry (embedding mode skips the output projection)
    pub fn decode_activations(&self, batch: &Batch) -> Result<Vec<(usize, Vec<f16>)>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let cycles = self.core.assignment.cycles;
        let distributed = self.ingress.is_some();
        let d = self.core.model.hidden_dim;

        // split into up to C chunks, each within the physical bound
        let chunk_size = batch
            .len()
            .div_ceil(cycles as usize)
            .clamp(1, self.core.config.n_ubatch);

        let mut rows: Vec<(usize, Vec<f16>)> = Vec::new();

        if !distributed {
            // all windows are local; chunks run back to back
            for (chunk_start, entries) in batch
                .entries
                .chunks(chunk_size)
                .enumerate()
                .map(|(i, c)| (i * chunk_size, c))
            {
                let sub = Batch {
                    entries: entries.to_vec(),
                };
                let mut acts = self.core.backend.embed(&sub);
                for cycle in 0..cycles {
                    self.core.acquire_cycle_refs(cycle);
                    self.offset_kv_full(
                        self.core.process_slice(cycle, &mut acts, entries),
                        chunk_start,
                    )?;
                }
                for (i, entry) in entries.iter().enumerate() {
                    if entry.logits {
                        rows.push((chunk_start + i, acts[i * d..(i + 1) * d].to_vec()));
                    }
                }
            }
            rows.sort_by_key(|r| r.0);
            return Ok(rows);
        }

        // distributed: keep up to C chunks in flight around the ring
        let mut chunks = batch
            .entries
            .chunks(chunk_size)
            .enumerate()
            .map(|(i, c)| (i * chunk_size, c));
        let mut active: HashMap<u32, ChunkState> = HashMap::new();

        for _ in 0..cycles {
            let Some((chunk_start, entries)) = chunks.next() else {
                break;
            };
            self.launch_chunk(chunk_start, entries, &mut active)?;
        }

        let ingress = self.ingress.as_ref().ok_or(EngineError::Stopped)?;
        while !active.is_empty() {
            let frame = ingress.pop().ok_or(EngineError::Stopped)?;
            let Some(mut chunk) = active.remove(&frame.batch_id) else {
                tracing::warn!(batch_id = frame.batch_id, "orphan frame dropped");
                continue;
            };

            let payload = frame.decode_payload(self.core.model.hidden_dim)?;
            align_chunk(&mut chunk, &payload);

            let cycle = frame.cycle_id;
            if cycle + 1 < cycles {
                let next = cycle + 1;
                self.core.acquire_cycle_refs(next);
                let chunk_start = chunk.orig_idx.first().copied().unwrap_or(0);
                self.offset_kv_full(
                    self.core
                        .process_slice(next, &mut chunk.activations, &chunk.entries),
                    chunk_start,
                )?;
                self.emit(next, frame.batch_id, &chunk)?;
                active.insert(frame.batch_id, chunk);
            } else {
                for (i, entry) in chunk.entries.iter().enumerate() {
                    if entry.logits {
                        rows.push((
                            chunk.orig_idx[i],
                            chunk.activations[i * d..(i + 1) * d].to_vec(),
                        ));
                    }
                }
                if let Some((chunk_start, entries)) = chunks.next() {
                    self.launch_chunk(chunk_start, entries, &mut active)?;
                }
            }
        }

        rows.sort_by_key(|r| r.0);
        Ok(rows)
    }

    /// Send `STOP` around the ring and tear the transport down
    pub fn stop(mut self) -> Result<()> {
        self.broadcaster.stop()?;

        if let Some(egress) = &self.egress {
            egress.close();
        }
        if let Some(ingress) = &self.ingress {
            ingress.close();
        }
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(signal) = self.signal_ingress.take() {
            let _ = signal.join();
        }
        self.core.shutdown();
        Ok(())
    }

    /// Embed a fresh chunk, run the head's cycle-0 slice, and put it on
    /// the ring
    fn launch_chunk(
        &self,
        chunk_start: usize,
        entries: &[BatchEntry],
        active: &mut HashMap<u32, ChunkState>,
    ) -> Result<()> {
        let sub = Batch {
            entries: entries.to_vec(),
        };
        let mut chunk = ChunkState {
            orig_idx: (chunk_start..chunk_start + entries.len()).collect(),
            entries: entries.to_vec(),
            activations: self.core.backend.embed(&sub),
        };

        self.core.acquire_cycle_refs(0);
        self.offset_kv_full(
            self.core
                .process_slice(0, &mut chunk.activations, &chunk.entries),
            chunk_start,
        )?;

        let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
        self.emit(0, batch_id, &chunk)?;
        active.insert(batch_id, chunk);
        Ok(())
    }

    fn emit(&self, cycle: u32, batch_id: u32, chunk: &ChunkState) -> Result<()> {
        let egress = self.egress.as_ref().ok_or(EngineError::Stopped)?;
        let payload = ActivationPayload {
            activations: chunk.activations.clone(),
            metas: chunk
                .entries
                .iter()
                .map(|e| {
                    let meta = TokenMeta::new(e.pos, e.seq);
                    if e.logits {
                        meta.with_logits()
                    } else {
                        meta
                    }
                })
                .collect(),
        };
        if !egress.push(DataFrame::new(cycle, batch_id, &payload)) {
            return Err(EngineError::Stopped);
        }
        Ok(())
    }

    /// Re-base a chunk-relative KV-full offset onto the submitted batch
    fn offset_kv_full(&self, result: Result<()>, chunk_start: usize) -> Result<()> {
        result.map_err(|e| match e {
            EngineError::KvFull { offset } => EngineError::KvFull {
                offset: chunk_start + offset,
            },
            other => other,
        })
    }
}

/// Keep only the chunk entries that survived the traversal (a rank may
/// have dropped cancelled sequences), and adopt the returned activations
fn align_chunk(chunk: &mut ChunkState, payload: &ActivationPayload) {
    if payload.metas.len() == chunk.entries.len() {
        chunk.activations = payload.activations.clone();
        return;
    }

    let mut kept_entries = Vec::with_capacity(payload.metas.len());
    let mut kept_idx = Vec::with_capacity(payload.metas.len());
    let mut cursor = 0usize;
    for meta in &payload.metas {
        while cursor < chunk.entries.len() {
            let e = chunk.entries[cursor];
            cursor += 1;
            if e.seq == meta.seq_id && e.pos == meta.pos {
                kept_entries.push(e);
                kept_idx.push(chunk.orig_idx[cursor - 1]);
                break;
            }
        }
    }

    chunk.entries = kept_entries;
    chunk.orig_idx = kept_idx;
    chunk.activations = payload.activations.clone();
}

