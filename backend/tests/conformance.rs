use backend::{BackendKind, LayerCase, LayerHarness, Symmetry};
use model::{
    desc::{BlockDesc, ModelDesc},
    synth::{SynthConfig, random_model},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

const BACKENDS: [BackendKind; 2] = [BackendKind::Reference, BackendKind::Gemm];

fn desc() -> ModelDesc {
    random_model(&SynthConfig::default(), 42)
}

fn case(use_fp16: bool, use_nhwc: bool) -> LayerCase {
    LayerCase {
        batch_size: 3,
        width: 5,
        height: 4,
        use_fp16,
        use_nhwc,
    }
}

fn random(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.random_range(-1.0..1.0)).collect()
}

/// Every cell on the board but the last column of the second position.
fn mask(case: &LayerCase) -> Vec<f32> {
    let (h, w) = (case.height, case.width);
    (0..case.batch_size * h * w)
        .map(|i| if i / (h * w) == 1 && i % w == w - 1 { 0.0 } else { 1.0 })
        .collect()
}

/// Reorders `(N, C, H, W)` data to `(N, H, W, C)`.
fn to_nhwc(data: &[f32], case: &LayerCase, channels: usize) -> Vec<f32> {
    let (n, h, w) = (case.batch_size, case.height, case.width);
    let mut out = vec![0.0; data.len()];
    for b in 0..n {
        for c in 0..channels {
            for p in 0..h * w {
                out[(b * h * w + p) * channels + c] = data[(b * channels + c) * h * w + p];
            }
        }
    }
    out
}

fn assert_close(expected: &[f32], got: &[f32], tol: f32) {
    assert_eq!(expected.len(), got.len());
    for (i, (e, g)) in expected.iter().zip(got).enumerate() {
        assert!((e - g).abs() <= tol * (1.0 + e.abs()), "{i}: expected {e}, got {g}");
    }
}

/// Runs a layer on every variant and layout, checking they all match the reference NCHW run.
fn check_layer<F>(in_channels: usize, out_channels: usize, tol: f32, run: F)
where
    F: Fn(&LayerHarness, &LayerCase, &[f32], &[f32], &mut Vec<f32>) -> backend::Result<bool>,
{
    let nchw = case(false, false);
    let input = random(nchw.len(in_channels), 7);
    let mask = mask(&nchw);

    let mut expected = Vec::new();
    let reference = LayerHarness::new(BackendKind::Reference);
    assert!(run(&reference, &nchw, &input, &mask, &mut expected).unwrap());
    assert!(expected.iter().all(|v| v.is_finite()));

    for kind in BACKENDS {
        let harness = LayerHarness::new(kind);
        let mut output = Vec::new();

        assert!(run(&harness, &nchw, &input, &mask, &mut output).unwrap());
        assert_close(&expected, &output, tol);

        let nhwc = case(false, true);
        let input = to_nhwc(&input, &nhwc, in_channels);
        assert!(run(&harness, &nhwc, &input, &mask, &mut output).unwrap());
        assert_close(&to_nhwc(&expected, &nhwc, out_channels), &output, tol);
    }
}

#[test]
fn convolutions_agree() {
    let desc = desc();
    let layers = [&desc.trunk.initial_conv, &desc.policy_head.p2_conv, &desc.value_head.v1_conv];

    for conv in layers {
        check_layer(conv.in_channels, conv.out_channels, 1e-5, |h, case, input, _, output| {
            h.test_evaluate_conv(conv, case, input, output)
        });
    }
}

#[test]
fn batch_norms_agree() {
    let desc = desc();
    let bn = &desc.trunk.trunk_tip_bn;

    check_layer(bn.num_channels, bn.num_channels, 1e-6, |h, case, input, mask, output| {
        h.test_evaluate_batch_norm(bn, case, input, mask, output)
    });
}

#[test]
fn residual_blocks_agree() {
    let desc = desc();
    let trunk = desc.trunk.trunk_num_channels;
    let mut seen = (false, false);

    for block in &desc.trunk.blocks {
        match block {
            BlockDesc::Ordinary(block) => {
                seen.0 = true;
                check_layer(trunk, trunk, 1e-4, |h, case, input, mask, output| {
                    h.test_evaluate_residual_block(block, case, input, mask, output)
                });
            }
            BlockDesc::GlobalPooling(block) => {
                seen.1 = true;
                check_layer(trunk, trunk, 1e-4, |h, case, input, mask, output| {
                    h.test_evaluate_global_pooling_residual_block(block, case, input, mask, output)
                });
            }
        }
    }

    assert_eq!(seen, (true, true));
}

#[test]
fn off_board_cells_do_not_leak_into_the_board() {
    let desc = desc();
    let trunk = desc.trunk.trunk_num_channels;
    let case = case(false, false);
    let mask = mask(&case);
    let area = case.width * case.height;
    let off_board = |i: usize| mask[(i / (trunk * area)) * area + i % area] == 0.0;

    let input = random(case.len(trunk), 3);
    let mut noisy = input.clone();
    for (i, v) in noisy.iter_mut().enumerate() {
        if off_board(i) {
            *v += 100.0;
        }
    }

    let harness = LayerHarness::new(BackendKind::Gemm);
    for block in &desc.trunk.blocks {
        let BlockDesc::GlobalPooling(block) = block else {
            continue;
        };

        let (mut clean_out, mut noisy_out) = (Vec::new(), Vec::new());
        let run = |input: &[f32], output: &mut Vec<f32>| {
            harness
                .test_evaluate_global_pooling_residual_block(block, &case, input, &mask, output)
                .unwrap()
        };
        assert!(run(&input, &mut clean_out));
        assert!(run(&noisy, &mut noisy_out));

        for (i, (clean, noisy)) in clean_out.iter().zip(&noisy_out).enumerate() {
            if !off_board(i) {
                assert_eq!(clean, noisy, "{i}");
            }
        }
    }
}

#[test]
fn half_precision_stays_close() {
    let desc = desc();
    let conv = &desc.trunk.initial_conv;
    let input = random(case(false, false).len(conv.in_channels), 11);

    let harness = LayerHarness::new(BackendKind::Gemm);
    let mut fp32 = Vec::new();
    let mut fp16 = Vec::new();
    assert!(harness.test_evaluate_conv(conv, &case(false, false), &input, &mut fp32).unwrap());
    assert!(harness.test_evaluate_conv(conv, &case(true, false), &input, &mut fp16).unwrap());

    assert_close(&fp32, &fp16, 2e-2);
    assert_ne!(fp32, fp16);
}

#[test]
fn reference_declines_every_half_precision_layer() {
    let desc = desc();
    let harness = LayerHarness::new(BackendKind::Reference);
    let fp16 = case(true, false);
    let trunk = desc.trunk.trunk_num_channels;
    let conv = &desc.trunk.initial_conv;
    let bn = &desc.trunk.trunk_tip_bn;

    let conv_input = random(fp16.len(conv.in_channels), 1);
    let input = random(fp16.len(trunk), 2);
    let mask = mask(&fp16);
    let untouched = vec![7.0; 3];
    let mut output = untouched.clone();

    assert!(!harness.test_evaluate_conv(conv, &fp16, &conv_input, &mut output).unwrap());
    assert_eq!(output, untouched);

    assert!(!harness.test_evaluate_batch_norm(bn, &fp16, &input, &mask, &mut output).unwrap());
    assert_eq!(output, untouched);

    for block in &desc.trunk.blocks {
        let ran = match block {
            BlockDesc::Ordinary(b) => {
                harness.test_evaluate_residual_block(b, &fp16, &input, &mask, &mut output)
            }
            BlockDesc::GlobalPooling(b) => harness
                .test_evaluate_global_pooling_residual_block(b, &fp16, &input, &mask, &mut output),
        };
        assert!(!ran.unwrap(), "{}", block.name());
        assert_eq!(output, untouched);
    }

    let flip = [true, false, false];
    assert!(
        !harness
            .test_evaluate_symmetry(flip, false, trunk, &fp16, &input, &mut output)
            .unwrap()
    );
    assert_eq!(output, untouched);
}

#[test]
fn symmetries_round_trip_in_both_layouts() {
    let channels = 2;
    for nhwc in [false, true] {
        let case = LayerCase {
            width: 4,
            height: 4,
            ..case(false, nhwc)
        };
        let input = random(case.len(channels), 5);

        for sym in Symmetry::ALL {
            let harness = LayerHarness::new(BackendKind::Gemm);
            let mut moved = Vec::new();
            let mut back = Vec::new();

            let run = |inverse: bool, input: &[f32], output: &mut Vec<f32>| {
                harness
                    .test_evaluate_symmetry(sym.flags(), inverse, channels, &case, input, output)
                    .unwrap()
            };
            assert!(run(false, &input, &mut moved));
            assert!(run(true, &moved, &mut back));
            assert_eq!(back, input, "{sym:?}");
            if !sym.is_identity() {
                assert_ne!(moved, input, "{sym:?}");
            }
        }
    }
}
