//! End-to-end ring tests: N nodes wired over loopback TCP inside one
//! process, driven by the head engine exactly as a deployment would be.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use half::f16;
use ringlm_backend::{Accel, Backend, Batch, BatchEntry, LogitsRow};
use ringlm_engine::{EngineConfig, HeadEngine, NodeCore, WorkerEngine};
use ringlm_kv::KvMutation;
use ringlm_model::{ArtifactBuilder, ModelConfig, WeightStore};
use ringlm_planner::Assignment;
use ringlm_ring::RingTransport;

fn test_model(n_layers: usize, hidden_dim: usize) -> ModelConfig {
    ModelConfig {
        n_layers,
        hidden_dim,
        vocab_size: 260,
        n_ctx_train: 4096,
        weight_seed: 17,
    }
}

fn write_artifact(name: &str, model: &ModelConfig) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(name);
    ArtifactBuilder::new(model.clone()).write(&path).unwrap();
    path
}

fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let out = TcpStream::connect(addr).unwrap();
    out.set_nodelay(true).unwrap();
    let (inn, _) = listener.accept().unwrap();
    (inn, out)
}

/// Wire N nodes into a directed ring; index i gets its transport
fn wire_ring(n: usize) -> Vec<RingTransport> {
    let mut data_in: Vec<Option<TcpStream>> = (0..n).map(|_| None).collect();
    let mut data_out: Vec<Option<TcpStream>> = (0..n).map(|_| None).collect();
    let mut signal_in: Vec<Option<TcpStream>> = (0..n).map(|_| None).collect();
    let mut signal_out: Vec<Option<TcpStream>> = (0..n).map(|_| None).collect();

    for i in 0..n {
        let next = (i + 1) % n;
        let (d_in, d_out) = loopback_pair();
        data_out[i] = Some(d_out);
        data_in[next] = Some(d_in);
        let (s_in, s_out) = loopback_pair();
        signal_out[i] = Some(s_out);
        signal_in[next] = Some(s_in);
    }

    (0..n)
        .map(|i| {
            RingTransport::new(
                data_in[i].take().unwrap(),
                data_out[i].take().unwrap(),
                signal_in[i].take().unwrap(),
                signal_out[i].take().unwrap(),
            )
        })
        .collect()
}

/// Even split of `n_layers` over `n` nodes
fn even_counts(n_layers: u32, n: usize) -> Vec<u32> {
    let base = n_layers / n as u32;
    let extra = n_layers % n as u32;
    (0..n as u32)
        .map(|i| base + if i < extra { 1 } else { 0 })
        .collect()
}

struct Cluster {
    head: HeadEngine,
    workers: Vec<thread::JoinHandle<()>>,
}

fn start_cluster(
    model: &ModelConfig,
    artifact: &std::path::Path,
    n: usize,
    cycles: u32,
    n_ctx_slot: usize,
) -> Cluster {
    let counts = even_counts(model.n_layers as u32, n);
    let assignment = Assignment::from_counts(counts, vec![0; n], cycles);
    assignment.validate().unwrap();

    let engine_config = EngineConfig::default();

    if n == 1 {
        let store = Arc::new(WeightStore::open(artifact).unwrap());
        let backend = Backend::new(Accel::Cpu, model.clone()).unwrap();
        let core = NodeCore::new(engine_config, assignment, 0, backend, store, n_ctx_slot);
        return Cluster {
            head: HeadEngine::new(core, None),
            workers: Vec::new(),
        };
    }

    let mut transports: Vec<Option<RingTransport>> =
        wire_ring(n).into_iter().map(Some).collect();

    let mut workers = Vec::new();
    for rank in 1..n {
        let store = Arc::new(WeightStore::open(artifact).unwrap());
        let backend = Backend::new(Accel::Cpu, model.clone()).unwrap();
        let core = NodeCore::new(
            engine_config.clone(),
            assignment.clone(),
            rank,
            backend,
            store,
            n_ctx_slot,
        );
        let transport = transports[rank].take().unwrap();
        workers.push(
            thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn(move || {
                    WorkerEngine::new(core, transport).run().unwrap();
                })
                .unwrap(),
        );
    }

    let store = Arc::new(WeightStore::open(artifact).unwrap());
    let backend = Backend::new(Accel::Cpu, model.clone()).unwrap();
    let core = NodeCore::new(engine_config, assignment, 0, backend, store, n_ctx_slot);
    let head = HeadEngine::new(core, Some(transports[0].take().unwrap()));

    Cluster { head, workers }
}

impl Cluster {
    fn shutdown(self) {
        self.head.stop().unwrap();
        for w in self.workers {
            w.join().unwrap();
        }
    }
}

fn prompt_batch(len: usize, seq: u32) -> Batch {
    let mut batch = Batch::new();
    for i in 0..len {
        let entry = BatchEntry::new((i % 200) as u32, i as i32, seq);
        batch.push(if i == len - 1 {
            entry.with_logits()
        } else {
            entry
        });
    }
    batch
}

fn argmax(row: &LogitsRow) -> u32 {
    let mut best = 0usize;
    for (i, &v) in row.values.iter().enumerate() {
        if v > row.values[best] {
            best = i;
        }
    }
    best as u32
}

/// Decode a prompt then generate greedily for `steps` tokens
fn run_generation(head: &HeadEngine, prompt_len: usize, steps: usize, seq: u32) -> Vec<u32> {
    let rows = head.decode(&prompt_batch(prompt_len, seq)).unwrap();
    assert_eq!(rows.len(), 1);

    let mut tokens = Vec::new();
    let mut next = argmax(&rows[0]);
    let mut pos = prompt_len as i32;
    for _ in 0..steps {
        tokens.push(next);
        let mut batch = Batch::new();
        batch.push(BatchEntry::new(next, pos, seq).with_logits());
        let rows = head.decode(&batch).unwrap();
        assert_eq!(rows.len(), 1);
        next = argmax(&rows[0]);
        pos += 1;
    }
    tokens
}

#[test]
fn test_ring_completes_across_sizes_and_cycles() {
    // bounded-steps property over the whole cluster-size x cycle-count x
    // prompt-length grid; a narrow model keeps the 2048-token prompts
    // affordable, and one cluster serves all three lengths on separate
    // sequences
    let model = test_model(8, 4);
    let artifact = write_artifact("ringlm-grid.rlmw", &model);

    for &n in &[2usize, 3, 4, 8] {
        for &cycles in &[1u32, 2, 4] {
            let cluster = start_cluster(&model, &artifact, n, cycles, 4096);
            for (i, &prompt_len) in [1usize, 64, 2048].iter().enumerate() {
                // the long prompt dominates runtime; one generated token
                // already proves the traversal drains
                let steps = if prompt_len >= 2048 { 1 } else { 3 };
                let seq = i as u32 + 1;
                let tokens = run_generation(&cluster.head, prompt_len, steps, seq);
                assert_eq!(tokens.len(), steps, "n={n} cycles={cycles} p={prompt_len}");
            }
            cluster.shutdown();
        }
    }

    let _ = std::fs::remove_file(&artifact);
}

#[test]
fn test_two_node_matches_single_node_reference() {
    // the S1 property: a 16:16 split over two nodes produces the exact
    // token sequence of the single-node reference
    let model = test_model(32, 8);
    let artifact = write_artifact("ringlm-s1.rlmw", &model);

    let single = start_cluster(&model, &artifact, 1, 1, 512);
    let expected = run_generation(&single.head, 9, 8, 1);
    single.shutdown();

    let pair = start_cluster(&model, &artifact, 2, 1, 512);
    let got = run_generation(&pair.head, 9, 8, 1);
    pair.shutdown();

    assert_eq!(expected, got);

    let _ = std::fs::remove_file(&artifact);
}

#[test]
fn test_mutations_stay_coherent_through_generation() {
    // decode, shift the context via the control plane, decode again; the
    // ring keeps producing and the result is deterministic
    let model = test_model(8, 8);
    let artifact = write_artifact("ringlm-coherent.rlmw", &model);

    let run = |name: &str| {
        let _ = name;
        let cluster = start_cluster(&model, &artifact, 3, 1, 512);
        let rows = cluster.head.decode(&prompt_batch(32, 1)).unwrap();
        let first = argmax(&rows[0]);

        // discard [8, 16) and close the hole
        cluster
            .head
            .broadcast(KvMutation::Remove { seq: 1, p0: 8, p1: 16 })
            .unwrap();
        cluster
            .head
            .broadcast(KvMutation::Add {
                seq: 1,
                p0: 16,
                p1: 32,
                delta: -8,
            })
            .unwrap();

        let mut batch = Batch::new();
        batch.push(BatchEntry::new(first, 24, 1).with_logits());
        let rows = cluster.head.decode(&batch).unwrap();
        let second = argmax(&rows[0]);
        cluster.shutdown();
        (first, second)
    };

    assert_eq!(run("a"), run("b"));

    let _ = std::fs::remove_file(&artifact);
}

#[test]
fn test_kv_full_surfaces_offset() {
    let model = test_model(4, 8);
    let artifact = write_artifact("ringlm-kvfull.rlmw", &model);

    // room for 8 cells per sequence; a 12-token prompt must fail at 8
    let cluster = start_cluster(&model, &artifact, 1, 1, 8);
    let err = cluster.head.decode(&prompt_batch(12, 1)).unwrap_err();
    match err {
        ringlm_engine::EngineError::KvFull { offset } => assert_eq!(offset, 8),
        other => panic!("expected KvFull, got {other}"),
    }
    cluster.shutdown();

    let _ = std::fs::remove_file(&artifact);
}

#[test]
fn test_activation_precision_is_f16_end_to_end() {
    // a value that survives the wire must equal its local counterpart
    let x = f16::from_f32(0.12345);
    assert_eq!(f16::from_bits(x.to_bits()), x);
}
