#![allow(dead_code)]

use std::sync::OnceLock;

use backend::{
    BackendKind, ComputeContext, ContextConfig, HandleConfig, InputBuffers, NNOutput, Runtime,
};
use model::{
    Model,
    synth::{SynthConfig, random_model},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Every test of a binary shares one runtime, only one can be alive at a time.
pub fn runtime() -> &'static Runtime {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();
        Runtime::initialize().unwrap()
    })
}

pub fn model(cfg: &SynthConfig, seed: u64) -> Model {
    Model::new(random_model(cfg, seed)).unwrap()
}

pub fn config(backend: BackendKind, width: usize, height: usize) -> ContextConfig {
    ContextConfig {
        backend,
        width,
        height,
        threads_per_device: 2,
        ..ContextConfig::default()
    }
}

/// Fills slot `n` with a random position on the top left `board_w x board_h` corner.
///
/// Laid out `(C, H, W)`, channel 0 flags the on board cells.
pub fn fill_slot(
    buffers: &mut InputBuffers,
    n: usize,
    (board_w, board_h): (usize, usize),
    seed: u64,
) {
    let (w, h) = (buffers.width(), buffers.height());
    let channels = buffers.spatial_len() / (w * h);
    let mut rng = StdRng::seed_from_u64(seed);

    let slot = buffers.spatial_slot_mut(n);
    for c in 0..channels {
        for y in 0..h {
            for x in 0..w {
                let on_board = y < board_h && x < board_w;
                slot[(c * h + y) * w + x] = match (on_board, c) {
                    (false, _) => 0.0,
                    (true, 0) => 1.0,
                    (true, _) if rng.random_bool(0.3) => 1.0,
                    _ => 0.0,
                };
            }
        }
    }

    for g in buffers.global_slot_mut(n) {
        *g = rng.random_range(-1.0..1.0);
    }
}

/// Fills every slot with a full board position.
pub fn fill_all(buffers: &mut InputBuffers, seed: u64) {
    let board = (buffers.width(), buffers.height());
    for n in 0..buffers.max_batch_size() {
        fill_slot(buffers, n, board, seed + n as u64);
    }
}

pub fn outputs(ctx: &ComputeContext<'_>, n: usize) -> Vec<NNOutput> {
    vec![NNOutput::new(ctx.model(), ctx.width(), ctx.height()); n]
}

/// Evaluates the first `n` slots with a fresh handle.
pub fn evaluate(
    ctx: &ComputeContext<'_>,
    cfg: &HandleConfig,
    buffers: &mut InputBuffers,
    n: usize,
) -> Vec<NNOutput> {
    let mut handle = ctx.create_handle(cfg).unwrap();
    let mut outputs = outputs(ctx, n);
    handle.evaluate(buffers, n, &mut outputs).unwrap();
    outputs
}

pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

fn max_abs(a: &[f32]) -> f32 {
    a.iter().map(|x| x.abs()).fold(0.0, f32::max)
}

/// Asserts two outputs agree within `tol`, relative to the magnitude of `expected`.
pub fn assert_close(expected: &NNOutput, got: &NNOutput, tol: f32) {
    let fields: [(&str, &[f32], &[f32]); 4] = [
        ("policy", &expected.policy, &got.policy),
        ("value", &expected.value, &got.value),
        ("score value", &expected.score_value, &got.score_value),
        ("ownership", &expected.ownership, &got.ownership),
    ];

    for (name, expected, got) in fields {
        let diff = max_abs_diff(expected, got);
        let bound = tol * (1.0 + max_abs(expected));
        assert!(diff <= bound, "{name} differs by {diff}, more than {bound}");
    }
}

pub fn all_finite(output: &NNOutput) -> bool {
    output
        .policy
        .iter()
        .chain(&output.value)
        .chain(&output.score_value)
        .chain(&output.ownership)
        .all(|v| v.is_finite())
}
