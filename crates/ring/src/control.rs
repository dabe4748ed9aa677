//! KV control plane
//!
//! The head originates every cache mutation; workers apply and forward.
//! Ordering invariant: a mutation with effective position <= p is applied
//! at a rank before that rank processes an activation at position p. The
//! head guarantees it by flushing the signal egress before emitting the
//! dependent data frame; workers guarantee it by applying every queued
//! signal before touching the next data frame (the ingress thread applies
//! synchronously, ahead of the compute loop's frame pop).

use parking_lot::Mutex;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ringlm_kv::{KvCache, KvMutation};
use ringlm_protocol::{SignalFrame, SignalKind};

use crate::error::{Result, RingError};

/// Encode a mutation for the signal port. `Copy` packs its destination
/// sequence into the delta field.
pub fn mutation_to_frame(mutation: KvMutation) -> SignalFrame {
    match mutation {
        KvMutation::Clear => SignalFrame {
            kind: SignalKind::Clear,
            seq_id: 0,
            p0: -1,
            p1: -1,
            delta_or_divisor: 0,
        },
        KvMutation::Remove { seq, p0, p1 } => SignalFrame {
            kind: SignalKind::Remove,
            seq_id: seq,
            p0,
            p1,
            delta_or_divisor: 0,
        },
        KvMutation::Copy { src, dst, p0, p1 } => SignalFrame {
            kind: SignalKind::Copy,
            seq_id: src,
            p0,
            p1,
            delta_or_divisor: dst as i32,
        },
        KvMutation::Add { seq, p0, p1, delta } => SignalFrame {
            kind: SignalKind::Add,
            seq_id: seq,
            p0,
            p1,
            delta_or_divisor: delta,
        },
        KvMutation::Divide {
            seq,
            p0,
            p1,
            divisor,
        } => SignalFrame {
            kind: SignalKind::Divide,
            seq_id: seq,
            p0,
            p1,
            delta_or_divisor: divisor,
        },
    }
}

/// Decode a signal frame back into a mutation; `None` for `STOP`
pub fn frame_to_mutation(frame: &SignalFrame) -> Option<KvMutation> {
    match frame.kind {
        SignalKind::Clear => Some(KvMutation::Clear),
        SignalKind::Remove => Some(KvMutation::Remove {
            seq: frame.seq_id,
            p0: frame.p0,
            p1: frame.p1,
        }),
        SignalKind::Copy => Some(KvMutation::Copy {
            src: frame.seq_id,
            dst: frame.delta_or_divisor as u32,
            p0: frame.p0,
            p1: frame.p1,
        }),
        SignalKind::Add => Some(KvMutation::Add {
            seq: frame.seq_id,
            p0: frame.p0,
            p1: frame.p1,
            delta: frame.delta_or_divisor,
        }),
        SignalKind::Divide => Some(KvMutation::Divide {
            seq: frame.seq_id,
            p0: frame.p0,
            p1: frame.p1,
            divisor: frame.delta_or_divisor,
        }),
        SignalKind::Stop => None,
    }
}

/// Head-side originator: applies locally, then flushes down the ring
pub struct SignalBroadcaster {
    kv: Arc<Mutex<KvCache>>,
    /// `None` on a single-node ring
    egress: Option<Mutex<TcpStream>>,
}

impl SignalBroadcaster {
    pub fn new(kv: Arc<Mutex<KvCache>>, egress: Option<TcpStream>) -> Self {
        Self {
            kv,
            egress: egress.map(Mutex::new),
        }
    }

    /// Apply a mutation locally and broadcast it. Flushes before returning
    /// so a subsequent data frame cannot overtake it at the next hop.
    pub fn broadcast(&self, mutation: KvMutation) -> Result<()> {
        self.kv.lock().apply(mutation)?;

        if let Some(egress) = &self.egress {
            let mut stream = egress.lock();
            mutation_to_frame(mutation).write_to(&mut *stream)?;
            stream.flush()?;
        }
        Ok(())
    }

    /// Send `STOP` around the ring once
    pub fn stop(&self) -> Result<()> {
        if let Some(egress) = &self.egress {
            let mut stream = egress.lock();
            SignalFrame::stop().write_to(&mut *stream)?;
            stream.flush()?;
        }
        Ok(())
    }
}

/// Worker-side (and head-side return path) signal ingress thread
pub struct SignalIngress {
    handle: JoinHandle<Result<()>>,
    stopped: Arc<AtomicBool>,
}

impl SignalIngress {
    /// Spawn the ingress loop.
    ///
    /// Every mutation is applied to `kv` in arrival order. On a worker,
    /// `forward` carries the frame on to the next hop; the head passes
    /// `None` so frames that circled back are dropped. Whole-sequence
    /// removals additionally invoke `on_seq_cleared` so the engine can drop
    /// pending activations for cancelled sequences; `on_stop` fires once
    /// when `STOP` arrives so the compute loop can be unblocked.
    pub fn spawn(
        mut ingress: TcpStream,
        forward: Option<TcpStream>,
        kv: Arc<Mutex<KvCache>>,
        on_seq_cleared: impl Fn(u32) + Send + 'static,
        on_stop: impl FnOnce() + Send + 'static,
    ) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_flag = stopped.clone();

        let handle = thread::Builder::new()
            .name("ring-signal-in".into())
            .spawn(move || -> Result<()> {
                let mut forward = forward;
                loop {
                    let frame = SignalFrame::read_from(&mut ingress)?;

                    if frame.kind == SignalKind::Stop {
                        if let Some(out) = forward.as_mut() {
                            frame.write_to(out)?;
                            out.flush()?;
                        }
                        stopped_flag.store(true, Ordering::SeqCst);
                        on_stop();
                        tracing::info!("STOP received, signal ingress exiting");
                        return Ok(());
                    }

                    let Some(mutation) = frame_to_mutation(&frame) else {
                        continue;
                    };
                    kv.lock().apply(mutation)?;

                    if let KvMutation::Remove { seq, p0, p1 } = mutation {
                        if p0 <= 0 && p1 < 0 {
                            on_seq_cleared(seq);
                        }
                    }

                    if let Some(out) = forward.as_mut() {
                        frame.write_to(out)?;
                        out.flush()?;
                    }
                }
            })
            .expect("spawn ring-signal-in");

        Self { handle, stopped }
    }

    /// Whether `STOP` has circulated through this node
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for the thread; `Ok` only after a clean `STOP`
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .map_err(|_| RingError::BringUp("signal ingress panicked".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let out = TcpStream::connect(addr).unwrap();
        let (inn, _) = listener.accept().unwrap();
        (inn, out)
    }

    fn filled_cache() -> KvCache {
        let mut kv = KvCache::new(1, 64, 2);
        for pos in 0..8 {
            kv.write(0, 1, pos, vec![f16::from_f32(1.0); 2], vec![f16::from_f32(2.0); 2])
                .unwrap();
        }
        kv
    }

    #[test]
    fn test_mutation_frame_roundtrip() {
        let mutations = [
            KvMutation::Clear,
            KvMutation::Remove { seq: 3, p0: 0, p1: 16 },
            KvMutation::Copy { src: 0, dst: 5, p0: -1, p1: -1 },
            KvMutation::Add { seq: 2, p0: 16, p1: 255, delta: -120 },
            KvMutation::Divide { seq: 1, p0: 0, p1: 512, divisor: 4 },
        ];

        for m in mutations {
            let frame = mutation_to_frame(m);
            let decoded = SignalFrame::decode(&frame.encode()).unwrap();
            assert_eq!(frame_to_mutation(&decoded), Some(m));
        }
        assert_eq!(frame_to_mutation(&SignalFrame::stop()), None);
    }

    #[test]
    fn test_broadcast_applies_and_forwards() {
        let (worker_in, head_out) = loopback_pair();

        let head_kv = Arc::new(Mutex::new(filled_cache()));
        let worker_kv = Arc::new(Mutex::new(filled_cache()));

        let head = SignalBroadcaster::new(head_kv.clone(), Some(head_out));
        let worker = SignalIngress::spawn(worker_in, None, worker_kv.clone(), |_| {}, || {});

        head.broadcast(KvMutation::Remove { seq: 1, p0: 2, p1: 5 })
            .unwrap();
        head.broadcast(KvMutation::Add {
            seq: 1,
            p0: 5,
            p1: -1,
            delta: -3,
        })
        .unwrap();
        head.stop().unwrap();

        worker.join().unwrap();

        // both ranks end with identical cells
        let head_kv = head_kv.lock();
        let worker_kv = worker_kv.lock();
        assert_eq!(head_kv.cells(0, 1), worker_kv.cells(0, 1));
        assert_eq!(head_kv.seq_len(1), 5);
    }

    #[test]
    fn test_cancel_triggers_cleared_hook() {
        let (worker_in, head_out) = loopback_pair();
        let worker_kv = Arc::new(Mutex::new(filled_cache()));
        let cleared: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

        let hook = {
            let cleared = cleared.clone();
            move |seq: u32| cleared.lock().push(seq)
        };
        let worker = SignalIngress::spawn(worker_in, None, worker_kv.clone(), hook, || {});

        let head = SignalBroadcaster::new(Arc::new(Mutex::new(filled_cache())), Some(head_out));
        head.broadcast(KvMutation::remove_all(1)).unwrap();
        head.stop().unwrap();

        worker.join().unwrap();
        assert_eq!(*cleared.lock(), vec![1]);
        assert_eq!(worker_kv.lock().seq_len(1), 0);
    }
}
