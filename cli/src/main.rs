//! bioflux CLI: drive the batching and offload engine from the terminal.
//!
//! Usage:
//! ```bash
//! # Simulate a burst of mutation-rate slider events
//! bioflux mutate --count 200 --interval-ms 5 --strategy weighted
//!
//! # Render a few frames of random organism geometry into a logging context
//! bioflux draw --frames 30 --calls 40
//!
//! # Run neural propagation through the worker (or the fallback path)
//! bioflux offload --steps 10 --seed 7 [--no-worker]
//! ```
//!
//! Logging is controlled through `RUST_LOG` (default `warn`).

use std::collections::BTreeMap;
use std::env;
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use bioflux_batch::draw::{BufferId, BufferKind, DrawMode, GraphicsError};
use bioflux_batch::{
    BatchConfig, DrawBatchConfig, DrawCall, DrawCallBatchAdapter, GraphicsContext, MutationBatchAdapter,
    MutationBatchConfig, OrganismState, PrimitiveType, TokioFrameScheduler, UniformValue,
};
use bioflux_core::{CombinationStrategy, Priority, Severity, TracingReporter};
use bioflux_offload::{
    AsyncComputeOffload, EdgeSpec, NeuralComputeService, NodeSpec, OffloadConfig, OffloadError,
    ThreadWorkerSpawner, WorkerChannels, WorkerSpawner,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "mutate" => cmd_mutate(&args[2..]).await,
        "draw" => cmd_draw(&args[2..]).await,
        "offload" => cmd_offload(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("bioflux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("bioflux {}", env!("CARGO_PKG_VERSION"));
    println!("Adaptive batching and worker offload for a digital organism\n");
    println!("USAGE:");
    println!("    bioflux <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    mutate     Batch a burst of mutation-rate changes");
    println!("    draw       Merge per-frame draw calls into one draw per primitive");
    println!("    offload    Run neural propagation on the worker with local fallback");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("MUTATE FLAGS:");
    println!("    --count <N>          Number of slider events        [default: 50]");
    println!("    --interval-ms <MS>   Gap between events             [default: 10]");
    println!("    --strategy <NAME>    average|max|sum|weighted       [default: weighted]");
    println!("    --seed <N>           RNG seed                       [default: 1]\n");
    println!("DRAW FLAGS:");
    println!("    --frames <N>         Frames to render               [default: 10]");
    println!("    --calls <N>          Draw calls per frame           [default: 24]");
    println!("    --seed <N>           RNG seed                       [default: 1]\n");
    println!("OFFLOAD FLAGS:");
    println!("    --steps <N>          Propagate/mutate rounds        [default: 10]");
    println!("    --seed <N>           Kernel seed                    [default: 1]");
    println!("    --timeout-ms <MS>    Per-request deadline           [default: 500]");
    println!("    --no-worker          Force the fallback path");
}

// ─── mutate ───────────────────────────────────────────────────────────────────

async fn cmd_mutate(args: &[String]) -> Result<()> {
    let count: usize = parse_flag_or(args, "--count", 50)?;
    let interval = Duration::from_millis(parse_flag_or(args, "--interval-ms", 10)?);
    let strategy = match parse_flag(args, "--strategy") {
        Some(name) => name.parse::<CombinationStrategy>().map_err(|e| anyhow!(e))?,
        None => CombinationStrategy::default(),
    };
    let mut rng = StdRng::seed_from_u64(parse_flag_or(args, "--seed", 1)?);

    let organism = OrganismState::new(0.01);
    let reporter = Arc::new(TracingReporter::new());
    let adapter = MutationBatchAdapter::new(
        MutationBatchConfig {
            batch: BatchConfig::default(),
            strategy,
            ..Default::default()
        },
        Arc::new(organism.clone()),
        reporter.clone(),
    );

    println!("Sending {count} mutation events every {}ms ({strategy})...", interval.as_millis());
    for i in 0..count {
        let priority = if i % 25 == 24 { Priority::High } else { Priority::Normal };
        adapter.add_mutation(rng.gen_range(0.0..0.2), priority).await?;
        tokio::time::sleep(interval).await;
    }
    adapter.flush_batch().await?;
    adapter.dispose();

    let stats = adapter.statistics();
    let snap = organism.snapshot();
    println!("  Requests:          {}", stats.total_requests);
    println!("  Batches applied:   {}", stats.total_batches);
    println!("  Failed flushes:    {}", stats.failed_flushes);
    println!("  Compression:       {:.2}x", stats.compression_ratio());
    println!("  Avg batch size:    {:.2}", stats.average_batch_size);
    println!("  Mutation rate:     {:.4}", snap.mutation_rate);
    println!("  Reported errors:   {}", reporter.count(Severity::Error));
    Ok(())
}

// ─── draw ─────────────────────────────────────────────────────────────────────

/// Graphics context that logs submissions instead of touching a GPU.
#[derive(Default)]
struct LoggingContext {
    next_buffer: AtomicU64,
    bytes_uploaded: AtomicU64,
    draws: AtomicU64,
}

impl GraphicsContext for LoggingContext {
    fn create_buffer(&self, kind: BufferKind) -> Result<BufferId, GraphicsError> {
        let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed) + 1);
        tracing::debug!(buffer = id.0, ?kind, "buffer created");
        Ok(id)
    }

    fn write_buffer(&self, id: BufferId, data: &[u8]) -> Result<(), GraphicsError> {
        self.bytes_uploaded.fetch_add(data.len() as u64, Ordering::Relaxed);
        tracing::trace!(buffer = id.0, bytes = data.len(), "buffer upload");
        Ok(())
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), GraphicsError> {
        tracing::debug!(buffer = id.0, "buffer destroyed");
        Ok(())
    }

    fn set_uniforms(&self, uniforms: &BTreeMap<String, UniformValue>) -> Result<(), GraphicsError> {
        tracing::trace!(?uniforms, "uniforms set");
        Ok(())
    }

    fn draw(&self, primitive: PrimitiveType, mode: DrawMode) -> Result<(), GraphicsError> {
        self.draws.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(%primitive, ?mode, "draw");
        Ok(())
    }
}

fn random_call(rng: &mut StdRng) -> DrawCall {
    match rng.gen_range(0..3) {
        0 => {
            let vertices = (0..6).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            DrawCall::new(PrimitiveType::Triangles, vertices)
                .with_indices(vec![0, 1, 2])
                .with_uniform("u_energy", UniformValue::Number(rng.gen_range(0.0..1.0)))
        }
        1 => {
            let vertices = (0..4).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
            DrawCall::new(PrimitiveType::Lines, vertices)
        }
        _ => DrawCall::new(PrimitiveType::Points, vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)])
            .with_uniform("u_glow", UniformValue::Flag(true)),
    }
}

async fn cmd_draw(args: &[String]) -> Result<()> {
    let frames: usize = parse_flag_or(args, "--frames", 10)?;
    let calls: usize = parse_flag_or(args, "--calls", 24)?;
    let mut rng = StdRng::seed_from_u64(parse_flag_or(args, "--seed", 1)?);

    let context = Arc::new(LoggingContext::default());
    let scheduler = Arc::new(TokioFrameScheduler::default());
    let adapter = DrawCallBatchAdapter::new(
        context.clone(),
        scheduler,
        DrawBatchConfig::default(),
        Arc::new(TracingReporter::new()),
    )
    .context("creating draw batch adapter")?;

    println!("Rendering {frames} frames of {calls} draw calls...");
    for _ in 0..frames {
        for _ in 0..calls {
            adapter.add_draw_call(random_call(&mut rng), Priority::Normal).await?;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    adapter.flush().await?;

    let stats = adapter.stats();
    println!("  Draw calls:        {}", stats.total_draw_calls);
    println!("  GPU draws:         {}", stats.total_batches);
    println!("  Compression:       {:.2}x", stats.compression_ratio);
    println!("  Bytes uploaded:    {}", context.bytes_uploaded.load(Ordering::Relaxed));
    adapter.dispose();
    Ok(())
}

// ─── offload ──────────────────────────────────────────────────────────────────

struct DisabledWorkers;

impl WorkerSpawner for DisabledWorkers {
    fn spawn(&self, _capacity: usize) -> Result<WorkerChannels, OffloadError> {
        Err(OffloadError::Spawn("disabled with --no-worker".into()))
    }
}

async fn cmd_offload(args: &[String]) -> Result<()> {
    let steps: usize = parse_flag_or(args, "--steps", 10)?;
    let seed: u64 = parse_flag_or(args, "--seed", 1)?;
    let timeout = Duration::from_millis(parse_flag_or(args, "--timeout-ms", 500)?);
    let spawner: Arc<dyn WorkerSpawner> = if args.iter().any(|a| a == "--no-worker") {
        Arc::new(DisabledWorkers)
    } else {
        Arc::new(ThreadWorkerSpawner::new(seed))
    };

    let reporter = Arc::new(TracingReporter::new());
    let offload = AsyncComputeOffload::new(spawner, OffloadConfig::default(), reporter.clone());
    println!("Worker state: {}", offload.start());
    let service = NeuralComputeService::new(offload, seed, timeout, reporter);

    let nodes = vec![
        NodeSpec::new("light"),
        NodeSpec::new("food"),
        NodeSpec::new("hunger").with_bias(0.2),
        NodeSpec::new("move").with_bias(-0.1),
    ];
    let edges = vec![
        EdgeSpec::new("light", "move", 0.6),
        EdgeSpec::new("food", "hunger", -0.7),
        EdgeSpec::new("hunger", "move", 0.8),
    ];
    service.init_network("organism", nodes, edges).await?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut last = BTreeMap::new();
    for _ in 0..steps {
        let inputs = BTreeMap::from([
            ("light".to_string(), rng.gen_range(0.0..1.0)),
            ("food".to_string(), rng.gen_range(0.0..1.0)),
        ]);
        let out = service.propagate("organism", inputs).await?;
        service.mutate("organism", 0.2).await?;
        tracing::debug!(path = %out.path, "step complete");
        last = out.value;
    }

    let activity = service.activity("organism").await?;
    let stats = service.offload().stats();
    println!("Final activations:");
    println!("{}", serde_json::to_string_pretty(&last)?);
    println!("  Activity:          {:.4} (via {})", activity.value.activity, activity.path);
    println!("  Edge strength:     {:.4}", activity.value.edge_strength);
    println!("  Worker completed:  {}", stats.completed);
    println!("  Worker timeouts:   {}", stats.timeouts);
    println!("  Avg processing:    {:.3}ms", stats.average_processing_ms);
    Ok(())
}

// ─── flags ────────────────────────────────────────────────────────────────────

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_flag_or<T>(args: &[String], flag: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match parse_flag(args, flag) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("invalid value for {flag}: {raw} ({e})")),
        None => Ok(default),
    }
}
