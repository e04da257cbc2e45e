use std::time::{Duration, Instant};

use anyhow::{Result, ensure};
use backend::{BackendKind, ContextConfig, HandleConfig, InputBuffers, NNOutput, Runtime};
use log::info;
use model::Model;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::Env;

pub struct Opts {
    pub backend: BackendKind,
    pub batch_size: usize,
    pub iters: usize,
}

/// Stages a random full board position in every slot, channel 0 flagging the board.
fn fill_random(buffers: &mut InputBuffers, rng: &mut StdRng) {
    let area = buffers.width() * buffers.height();

    for n in 0..buffers.max_batch_size() {
        let slot = buffers.spatial_slot_mut(n);
        slot[..area].fill(1.0);
        for v in &mut slot[area..] {
            *v = if rng.random_bool(0.2) { 1.0 } else { 0.0 };
        }

        for v in buffers.global_slot_mut(n) {
            *v = rng.random_range(-1.0..1.0);
        }
    }
}

/// Evaluates `opts.iters` random batches and reports the latency of each.
pub fn run(path: &str, opts: &Opts, env: &Env) -> Result<()> {
    ensure!(opts.batch_size > 0 && opts.iters > 0, "batch and iters must be positive");

    let model = model::load_model_file(path)?;
    let runtime = Runtime::initialize()?;
    let cfg = ContextConfig {
        backend: opts.backend,
        width: env.width,
        height: env.height,
        tuner_file: env.tuner_file.clone(),
        ..ContextConfig::default()
    };
    let ctx = runtime.create_context(&cfg, &model)?;

    let mut handle = ctx.create_handle(&HandleConfig {
        max_batch_size: opts.batch_size,
        require_exact_size: true,
        ..HandleConfig::default()
    })?;

    let mut buffers = InputBuffers::new(&model, opts.batch_size, env.width, env.height)?;
    let mut outputs = vec![NNOutput::new(&model, env.width, env.height); opts.batch_size];
    let mut rng = StdRng::seed_from_u64(0);

    // first batch pays for the allocations
    fill_random(&mut buffers, &mut rng);
    handle.evaluate(&mut buffers, opts.batch_size, &mut outputs)?;

    let mut total = Duration::ZERO;
    for iter in 0..opts.iters {
        fill_random(&mut buffers, &mut rng);

        let start = Instant::now();
        handle.evaluate(&mut buffers, opts.batch_size, &mut outputs)?;
        let elapsed = start.elapsed();
        total += elapsed;

        info!(iter = iter, micros = elapsed.as_micros() as u64; "evaluated batch");
    }

    report(&model, opts, total);
    Ok(())
}

fn report(model: &Model, opts: &Opts, total: Duration) {
    let per_batch = total / opts.iters as u32;
    let positions = (opts.batch_size * opts.iters) as f64 / total.as_secs_f64();

    println!(
        "{} on {}: batch {} x {} iters, {per_batch:?} per batch, {positions:.1} positions/s",
        model.name(),
        opts.backend.name(),
        opts.batch_size,
        opts.iters,
    );
}
