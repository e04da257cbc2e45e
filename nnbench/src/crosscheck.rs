use anyhow::Result;
use backend::{BackendKind, LayerCase, LayerHarness};
use model::desc::{BlockDesc, ModelDesc};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::Env;

const BATCH_SIZE: usize = 2;

/// One configuration a layer is run with.
#[derive(Debug, Clone, Copy)]
struct Variant {
    kind: BackendKind,
    use_fp16: bool,
    use_nhwc: bool,
}

impl Variant {
    fn all() -> impl Iterator<Item = Variant> {
        [BackendKind::Reference, BackendKind::Gemm]
            .into_iter()
            .flat_map(|kind| {
                [(false, false), (false, true), (true, false), (true, true)]
                    .map(|(use_fp16, use_nhwc)| Variant {
                        kind,
                        use_fp16,
                        use_nhwc,
                    })
            })
    }

    fn case(self, env: &Env) -> LayerCase {
        LayerCase {
            batch_size: BATCH_SIZE,
            width: env.width,
            height: env.height,
            use_fp16: self.use_fp16,
            use_nhwc: self.use_nhwc,
        }
    }

    fn label(self) -> String {
        format!(
            "{}/{}/{}",
            self.kind.name(),
            if self.use_fp16 { "fp16" } else { "fp32" },
            if self.use_nhwc { "nhwc" } else { "nchw" },
        )
    }
}

type RunLayer<'d> =
    Box<dyn Fn(&LayerHarness, &LayerCase, &[f32], &[f32], &mut Vec<f32>) -> Ran + 'd>;

type Ran = backend::Result<bool>;

fn boxed<'d, F>(run: F) -> RunLayer<'d>
where
    F: Fn(&LayerHarness, &LayerCase, &[f32], &[f32], &mut Vec<f32>) -> Ran + 'd,
{
    Box::new(run)
}

/// A layer of the model together with its channel counts.
struct Layer<'d> {
    name: String,
    in_channels: usize,
    out_channels: usize,
    run: RunLayer<'d>,
}

fn layers(desc: &ModelDesc) -> Vec<Layer<'_>> {
    let mut layers = Vec::new();

    for conv in desc.conv_layers() {
        layers.push(Layer {
            name: conv.name.clone(),
            in_channels: conv.in_channels,
            out_channels: conv.out_channels,
            run: boxed(move |h, case, x, _, out| h.test_evaluate_conv(conv, case, x, out)),
        });
    }

    for bn in desc.batch_norm_layers() {
        layers.push(Layer {
            name: bn.name.clone(),
            in_channels: bn.num_channels,
            out_channels: bn.num_channels,
            run: boxed(move |h, case, x, mask, out| {
                h.test_evaluate_batch_norm(bn, case, x, mask, out)
            }),
        });
    }

    let trunk = desc.trunk.trunk_num_channels;
    for block in &desc.trunk.blocks {
        let run = match block {
            BlockDesc::Ordinary(b) => boxed(move |h, case, x, mask, out| {
                h.test_evaluate_residual_block(b, case, x, mask, out)
            }),
            BlockDesc::GlobalPooling(b) => boxed(move |h, case, x, mask, out| {
                h.test_evaluate_global_pooling_residual_block(b, case, x, mask, out)
            }),
        };

        layers.push(Layer {
            name: block.name().to_string(),
            in_channels: trunk,
            out_channels: trunk,
            run,
        });
    }

    layers
}

/// Reorders `(N, C, H, W)` data to `(N, H, W, C)`, or back if `inverse`.
fn reorder(data: &[f32], channels: usize, area: usize, inverse: bool) -> Vec<f32> {
    let mut out = vec![0.0; data.len()];
    for n in 0..data.len() / (channels * area) {
        for c in 0..channels {
            for p in 0..area {
                let nchw = (n * channels + c) * area + p;
                let nhwc = (n * area + p) * channels + c;
                if inverse {
                    out[nchw] = data[nhwc];
                } else {
                    out[nhwc] = data[nchw];
                }
            }
        }
    }
    out
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

/// Runs every layer on every variant and prints how far each strays from the reference.
pub fn run(path: &str, env: &Env) -> Result<()> {
    let model = model::load_model_file(path)?;
    let desc = model.desc();
    let area = env.width * env.height;
    let mut rng = StdRng::seed_from_u64(0);

    // the last column is off the board
    let mask: Vec<f32> = (0..BATCH_SIZE * area)
        .map(|i| if i % env.width == env.width - 1 { 0.0 } else { 1.0 })
        .collect();

    println!("{:<32} {:<20} {:>12}", "layer", "variant", "max diff");
    for layer in layers(desc) {
        let input: Vec<f32> = (0..BATCH_SIZE * layer.in_channels * area)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();

        let reference = LayerHarness::new(BackendKind::Reference);
        let nchw = Variant {
            kind: BackendKind::Reference,
            use_fp16: false,
            use_nhwc: false,
        };
        let mut expected = Vec::new();
        (layer.run)(&reference, &nchw.case(env), &input, &mask, &mut expected)?;

        for variant in Variant::all() {
            let harness = LayerHarness::new(variant.kind);
            let x = if variant.use_nhwc {
                reorder(&input, layer.in_channels, area, false)
            } else {
                input.clone()
            };

            let mut output = Vec::new();
            if !(layer.run)(&harness, &variant.case(env), &x, &mask, &mut output)? {
                println!("{:<32} {:<20} {:>12}", layer.name, variant.label(), "skipped");
                continue;
            }

            if variant.use_nhwc {
                output = reorder(&output, layer.out_channels, area, true);
            }
            let diff = max_abs_diff(&expected, &output);
            println!("{:<32} {:<20} {:>12.3e}", layer.name, variant.label(), diff);
        }
    }

    Ok(())
}
