//! Worker-side engine: the relay loop

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ringlm_backend::BatchEntry;
use ringlm_protocol::{ActivationPayload, DataFrame};
use ringlm_ring::{spawn_data_writer, RingTransport, SharedQueue, SignalIngress};

use crate::core::{strip_seq, NodeCore};
use crate::error::{EngineError, Result};

/// A non-head node. `run` blocks until `STOP` circulates or the transport
/// fails; either way the node exits its relay loop cleanly.
pub struct WorkerEngine {
    core: Arc<NodeCore>,
    ingress: Arc<SharedQueue<DataFrame>>,
    egress: Arc<SharedQueue<DataFrame>>,
    signal_ingress: SignalIngress,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WorkerEngine {
    /// Wire a worker into the ring and start its transport threads
    pub fn new(core: NodeCore, transport: RingTransport) -> Self {
        let core = Arc::new(core);
        let capacity = core
            .config
            .queue_capacity
            .max(core.assignment.cycles as usize + 1);
        let ingress: Arc<SharedQueue<DataFrame>> = Arc::new(SharedQueue::new(capacity));
        let egress: Arc<SharedQueue<DataFrame>> = Arc::new(SharedQueue::new(capacity));

        // ingress reader counts tile references as frames arrive, so a
        // queued frame pins the tiles its cycle needs
        let reader = {
            let core = core.clone();
            let queue = ingress.clone();
            let mut stream = transport.data_in;
            thread::Builder::new()
                .name("engine-data-in".into())
                .spawn(move || loop {
                    match DataFrame::read_from(&mut stream) {
                        Ok(frame) => {
                            core.acquire_cycle_refs(frame.cycle_id);
                            if !queue.push(frame) {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "data ingress closed");
                            queue.close();
                            break;
                        }
                    }
                })
                .expect("spawn engine-data-in")
        };
        let writer = spawn_data_writer(transport.data_out, egress.clone());

        // the signal ingress applies mutations ahead of the compute loop
        // and forwards them; a whole-sequence removal also drops queued
        // activations of that sequence
        let signal_ingress = {
            let queue = ingress.clone();
            let purge_core = core.clone();
            let stop_queue = ingress.clone();
            SignalIngress::spawn(
                transport.signal_in,
                Some(transport.signal_out),
                core.kv.clone(),
                move |seq| {
                    let hidden_dim = purge_core.model.hidden_dim;
                    queue.for_each_mut(|frame| strip_seq(frame, seq, hidden_dim));
                },
                move || stop_queue.close(),
            )
        };

        Self {
            core,
            ingress,
            egress,
            signal_ingress,
            reader,
            writer,
        }
    }

    /// Relay until the ring stops. Decode failures are fatal for the node.
    pub fn run(self) -> Result<()> {
        let hidden_dim = self.core.model.hidden_dim;

        loop {
            if self.signal_ingress.is_stopped() {
                break;
            }
            let Some(frame) = self.ingress.pop() else {
                break;
            };

            let payload = frame.decode_payload(hidden_dim)?;
            let entries: Vec<BatchEntry> = payload
                .metas
                .iter()
                .map(|m| {
                    let mut e = BatchEntry::new(0, m.pos, m.seq_id);
                    e.logits = m.wants_logits();
                    e
                })
                .collect();

            let mut activations = payload.activations;
            self.core
                .process_slice(frame.cycle_id, &mut activations, &entries)?;

            let out = ActivationPayload {
                activations,
                metas: payload.metas,
            };
            if !self
                .egress
                .push(DataFrame::new(frame.cycle_id, frame.batch_id, &out))
            {
                return Err(EngineError::Stopped);
            }
        }

        self.egress.close();
        self.ingress.close();
        let _ = self.writer.join();
        let _ = self.reader.join();
        let _ = self.signal_ingress.join();

        tracing::info!(rank = self.core.rank, "worker engine stopped");
        Ok(())
    }
}
