//! ringlm node binary
//!
//! Every node of the ring runs this binary. Rank 0 is the head: it
//! collects worker profiles, runs the workload planner, distributes the
//! assignment, then serves the HTTP surface on top of the slot
//! scheduler. Every other rank joins the ring and relays pipeline
//! frames until `STOP` circulates.
//!
//! Exit codes: 0 on clean shutdown, 1 on startup failure.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ringlm_backend::{Accel, Backend};
use ringlm_engine::{EngineConfig, HeadEngine, NodeCore, WorkerEngine};
use ringlm_model::{ByteTokenizer, Tokenizer, WeightStore};
use ringlm_planner::{plan, prefetch_horizon, Assignment, DeviceProfile, OsClass, PlannerConfig};
use ringlm_ring::{head_bringup, worker_bringup, RingConfig, RingTransport};
use ringlm_server::{routes, AppState, DraftModel, SchedulerHandle, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "ringlm", about = "distributed piped-ring inference node")]
struct Args {
    /// Model artifact path
    #[arg(long, short = 'm')]
    model: PathBuf,

    /// Draft model artifact for speculative decoding (head only)
    #[arg(long)]
    model_draft: Option<PathBuf>,

    // ring topology
    /// Cluster size
    #[arg(long, default_value_t = 1)]
    n_world: usize,
    /// This node's rank; 0 is the head
    #[arg(long, default_value_t = 0)]
    rank: usize,
    /// Pinned per-node layer windows, comma separated; a 0 entry forces
    /// re-planning
    #[arg(long, value_delimiter = ',')]
    n_layer_window: Vec<u32>,
    /// Head address
    #[arg(long, default_value = "127.0.0.1")]
    master_ip: String,
    /// Address of the next node in the ring
    #[arg(long, default_value = "127.0.0.1")]
    next_node_ip: String,
    /// Activation link port
    #[arg(long, default_value_t = 9000)]
    data_port: u16,
    /// Control link port
    #[arg(long, default_value_t = 10000)]
    signal_port: u16,

    // pipeline knobs
    /// Overlap weight prefetching with compute
    #[arg(long, default_value_t = false)]
    prefetch: bool,
    /// Keep output weights resident in Metal memory
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    keep_out_in_metal: bool,
    /// Run the output layer on CUDA
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set)]
    keep_out_in_cuda: bool,
    /// Bias layers toward (>1) or away from (<1) the head
    #[arg(long, default_value_t = 1.01)]
    master_priority: f64,
    /// Accelerator memory budget, GiB
    #[arg(long, default_value_t = 999)]
    gpu_mem: u64,
    /// Cycle count; 0 lets the planner pick
    #[arg(long, default_value_t = 0)]
    n_cycles: u32,

    // serving shape
    /// Context size per slot
    #[arg(long, default_value_t = 4096)]
    n_ctx: usize,
    /// Logical batch bound
    #[arg(long, default_value_t = 2048)]
    n_batch: usize,
    /// Physical micro-batch bound
    #[arg(long, default_value_t = 512)]
    n_ubatch: usize,
    /// Parallel slot count
    #[arg(long, default_value_t = 1)]
    n_parallel: usize,
    /// Default new-token budget; -1 is unlimited
    #[arg(long, default_value_t = -1)]
    n_predict: i32,
    /// Tokens kept on context shift
    #[arg(long, default_value_t = 0)]
    n_keep: i32,
    /// Group-attention factor; 1 disables self-extend
    #[arg(long, default_value_t = 1)]
    grp_attn_n: i32,
    /// Group-attention width
    #[arg(long, default_value_t = 512)]
    grp_attn_w: i32,

    // HTTP surface
    /// HTTP bind host (head only)
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// HTTP port (head only)
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Bearer key protecting the API
    #[arg(long)]
    api_key: Option<String>,
    /// Model name reported to clients
    #[arg(long, default_value = "ringlm")]
    alias: String,
    /// Enable /metrics
    #[arg(long, default_value_t = false)]
    metrics: bool,
    /// Enable the embedding endpoints
    #[arg(long, default_value_t = false)]
    embedding: bool,
    /// Enable the rerank endpoints
    #[arg(long, default_value_t = false)]
    rerank: bool,
    /// Directory for slot save/restore files
    #[arg(long)]
    slot_save_path: Option<PathBuf>,
    /// Minimum similarity for prompt-based slot reuse
    #[arg(long, default_value_t = 0.5)]
    slot_prompt_similarity: f32,
    /// System prompt evaluated once at startup
    #[arg(long)]
    system_prompt: Option<String>,
    /// Disable context shifting
    #[arg(long, default_value_t = false)]
    no_context_shift: bool,

    // device profile
    /// Accelerator: cpu, cuda, metal or none
    #[arg(long, default_value = "cpu")]
    accel: String,
    /// Sustained CPU throughput, layer-steps per second
    #[arg(long, default_value_t = 8.0)]
    flops_cpu: f64,
    /// Sustained GPU throughput, layer-steps per second
    #[arg(long, default_value_t = 0.0)]
    flops_gpu: f64,
    /// Free host memory, GiB
    #[arg(long, default_value_t = 8)]
    ram_gb: u64,
    /// Free accelerator memory, GiB
    #[arg(long, default_value_t = 0)]
    vram_gb: u64,
    /// Sustained disk read bandwidth, MB/s
    #[arg(long, default_value_t = 500.0)]
    disk_mbps: f64,

    /// Write a synthetic artifact to --model and exit. Format:
    /// n_layers:hidden_dim:vocab_size:n_ctx_train:seed
    #[arg(long)]
    synthesize: Option<String>,
}

fn synthesize_model(spec: &str, path: &PathBuf) -> anyhow::Result<()> {
    let parts: Vec<u64> = spec
        .split(':')
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| anyhow::anyhow!("--synthesize wants n_layers:hidden:vocab:ctx:seed"))?;
    let [n_layers, hidden_dim, vocab_size, n_ctx_train, seed] = parts.as_slice() else {
        anyhow::bail!("--synthesize wants exactly five fields");
    };

    let config = ringlm_model::ModelConfig {
        n_layers: *n_layers as usize,
        hidden_dim: *hidden_dim as usize,
        vocab_size: *vocab_size as usize,
        n_ctx_train: *n_ctx_train as usize,
        weight_seed: *seed,
    };
    ringlm_model::ArtifactBuilder::new(config).write(path)?;
    tracing::info!(path = %path.display(), "artifact written");
    Ok(())
}

fn os_class() -> OsClass {
    if cfg!(target_os = "macos") {
        OsClass::Macos
    } else if cfg!(target_os = "windows") {
        OsClass::Windows
    } else if cfg!(target_os = "android") {
        OsClass::Android
    } else {
        OsClass::Linux
    }
}

fn device_profile(args: &Args, accel: Accel, output_bytes: u64) -> DeviceProfile {
    let mut vram_free = (args.vram_gb << 30).min(args.gpu_mem << 30);
    // pinned output weights shrink what the planner may offload
    if (accel == Accel::Metal && args.keep_out_in_metal)
        || (accel == Accel::Cuda && args.keep_out_in_cuda)
    {
        vram_free = vram_free.saturating_sub(output_bytes);
    }

    DeviceProfile {
        name: format!("rank-{}", args.rank),
        flops_cpu: args.flops_cpu,
        flops_gpu: args.flops_gpu,
        ram_free: args.ram_gb << 30,
        vram_free,
        disk_read_bw: args.disk_mbps * 1e6,
        os_class: os_class(),
        has_uma: accel.has_uma(),
    }
}

fn planner_config(args: &Args, store: &WeightStore) -> PlannerConfig {
    let model = store.config();
    let draft_model_bytes = args
        .model_draft
        .as_ref()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    // n_cycles > 0 pins the cycle count; 0 leaves it to the search
    let (cycle_min, cycle_max) = if args.n_cycles > 0 {
        (args.n_cycles, args.n_cycles)
    } else {
        (1, 4)
    };

    PlannerConfig {
        layer_bytes: model.tile_bytes() as u64,
        kv_bytes_per_layer: (args.n_ctx * model.hidden_dim * 2 * 2) as u64,
        cycle_min,
        cycle_max,
        master_priority: args.master_priority,
        draft_model_bytes,
        ..PlannerConfig::default()
    }
}

/// The operator pinned every window: skip the solver
fn pinned_assignment(args: &Args) -> Option<Assignment> {
    if args.n_layer_window.len() != args.n_world
        || args.n_layer_window.iter().any(|&w| w == 0)
    {
        return None;
    }
    let cycles = args.n_cycles.max(1);
    Some(Assignment::from_counts(
        args.n_layer_window.clone(),
        vec![0; args.n_world],
        cycles,
    ))
}

fn run_worker(args: Args) -> anyhow::Result<()> {
    tracing::info!(
        rank = args.rank,
        master = %args.master_ip,
        next = %args.next_node_ip,
        "joining ring"
    );
    let store = Arc::new(WeightStore::open(&args.model)?);
    let accel = Accel::parse(&args.accel)
        .ok_or_else(|| anyhow::anyhow!("unknown accelerator '{}'", args.accel))?;
    let output_bytes = (store.config().vocab_size * store.config().hidden_dim * 2) as u64;
    let profile = device_profile(&args, accel, output_bytes);

    let ring = RingConfig {
        rank: args.rank,
        n_world: args.n_world,
        bind_ip: "0.0.0.0".to_string(),
        next_node_ip: args.next_node_ip.clone(),
        data_port: args.data_port,
        signal_port: args.signal_port,
    };

    let mut transport = RingTransport::connect(&ring)?;
    let (assignment, model) = worker_bringup(&mut transport, args.rank, profile.clone())?;
    if model != *store.config() {
        anyhow::bail!("model mismatch between head and this node");
    }

    let planner_cfg = planner_config(&args, &store);
    let backend = Backend::new(accel, model)?;
    let core = NodeCore::new(
        EngineConfig {
            prefetch: args.prefetch,
            prefetch_horizon: prefetch_horizon(&profile, &planner_cfg),
            n_ubatch: args.n_ubatch,
            ..EngineConfig::default()
        },
        assignment,
        args.rank,
        backend,
        store,
        args.n_ctx,
    );

    WorkerEngine::new(core, transport).run()?;
    Ok(())
}

fn run_head(args: Args) -> anyhow::Result<()> {
    let store = Arc::new(WeightStore::open(&args.model)?);
    let accel = Accel::parse(&args.accel)
        .ok_or_else(|| anyhow::anyhow!("unknown accelerator '{}'", args.accel))?;
    let model = store.config().clone();
    let output_bytes = (model.vocab_size * model.hidden_dim * 2) as u64;
    let profile = device_profile(&args, accel, output_bytes);
    let planner_cfg = planner_config(&args, &store);
    let head_horizon = prefetch_horizon(&profile, &planner_cfg);

    let (assignment, transport) = if args.n_world > 1 {
        let ring = RingConfig {
            rank: 0,
            n_world: args.n_world,
            bind_ip: "0.0.0.0".to_string(),
            next_node_ip: args.next_node_ip.clone(),
            data_port: args.data_port,
            signal_port: args.signal_port,
        };
        let mut transport = RingTransport::connect(&ring)?;
        let assignment = head_bringup(
            &mut transport,
            args.n_world,
            profile,
            &planner_cfg,
            &model,
            pinned_assignment(&args),
        )?;
        (assignment, Some(transport))
    } else {
        let assignment = match pinned_assignment(&args) {
            Some(a) => a,
            None => plan(model.n_layers as u32, &[profile], &planner_cfg)?,
        };
        (assignment, None)
    };

    let backend = Backend::new(accel, model.clone())?;
    let core = NodeCore::new(
        EngineConfig {
            prefetch: args.prefetch,
            prefetch_horizon: head_horizon,
            n_ubatch: args.n_ubatch,
            ..EngineConfig::default()
        },
        assignment,
        0,
        backend,
        store,
        args.n_ctx,
    );
    let engine = HeadEngine::new(core, transport);

    let draft = match &args.model_draft {
        Some(path) => {
            let draft_store = Arc::new(WeightStore::open(path)?);
            Some(DraftModel::new(draft_store, accel, args.n_ctx)?)
        }
        None => None,
    };

    let tokenizer: Arc<dyn Tokenizer> = Arc::new(ByteTokenizer::new(model.vocab_size)?);
    let server_config = ServerConfig {
        host: args.host.clone(),
        port: args.port,
        api_key: args.api_key.clone(),
        model_alias: args.alias.clone(),
        n_ctx_slot: args.n_ctx,
        n_batch: args.n_batch,
        n_parallel: args.n_parallel,
        n_predict: args.n_predict,
        n_keep: args.n_keep,
        context_shift: !args.no_context_shift,
        slot_prompt_similarity: args.slot_prompt_similarity,
        slot_save_path: args.slot_save_path.clone(),
        system_prompt: args.system_prompt.clone(),
        ga_n: args.grp_attn_n,
        ga_w: args.grp_attn_w,
        metrics: args.metrics,
        embedding: args.embedding,
        rerank: args.rerank,
        ..ServerConfig::default()
    };

    let scheduler = SchedulerHandle::spawn(
        engine,
        tokenizer.clone(),
        server_config.clone(),
        draft,
    );
    let state = AppState::new(server_config.clone(), scheduler.clone(), tokenizer);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let app = routes::create_router(state).layer(TraceLayer::new_for_http());
        let addr: SocketAddr = server_config.bind_address().parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(%addr, "head serving");

        // first SIGINT winds down cooperatively, a second one exits hard
        let interrupts = Arc::new(AtomicUsize::new(0));
        let shutdown_scheduler = scheduler.clone();
        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = shutdown_flag.clone();
        let counter = interrupts.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    tracing::info!("interrupt: draining and shutting down");
                    flag.store(true, Ordering::SeqCst);
                } else {
                    tracing::warn!("second interrupt: exiting now");
                    std::process::exit(130);
                }
            }
        });

        let serve = axum::serve(listener, app).with_graceful_shutdown({
            let flag = shutdown_flag.clone();
            async move {
                while !flag.load(Ordering::SeqCst) {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        });
        serve.await?;

        shutdown_scheduler.shutdown();
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ringlm=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(
        rank = args.rank,
        n_world = args.n_world,
        model = %args.model.display(),
        "ringlm starting"
    );

    let result = if let Some(spec) = args.synthesize.clone() {
        synthesize_model(&spec, &args.model)
    } else if args.rank == 0 {
        run_head(args)
    } else {
        run_worker(args)
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}
