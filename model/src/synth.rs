//! Deterministic random models, used for benchmarking and testing backends.

use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal, Uniform};

use crate::{
    desc::{
        ActivationKind, BatchNormLayerDesc, BlockDesc, ConvLayerDesc,
        GlobalPoolingResidualBlockDesc, MatBiasLayerDesc, MatMulLayerDesc, ModelDesc,
        PolicyHeadDesc, ResidualBlockDesc, TrunkDesc, ValueHeadDesc,
    },
    loader::MAX_MODEL_VERSION,
    rules::RuleSupport,
};

/// The shape of a synthesized model.
#[derive(Debug, Clone)]
pub struct SynthConfig {
    pub name: String,
    pub version: i32,
    pub num_input_channels: usize,
    pub num_input_global_channels: usize,
    pub trunk_channels: usize,
    pub num_blocks: usize,
    /// Every `gpool_every`-th block is a global pooling block, `0` disables them.
    pub gpool_every: usize,
    pub regular_channels: usize,
    pub gpool_channels: usize,
    pub p1_channels: usize,
    pub g1_channels: usize,
    pub v1_channels: usize,
    pub v2_channels: usize,
    pub num_score_value_channels: usize,
    pub conv_size: usize,
    pub activation: ActivationKind,
    /// Makes every kernel invariant under the eight board symmetries.
    pub symmetric_kernels: bool,
    pub rules: RuleSupport,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".into(),
            version: MAX_MODEL_VERSION,
            num_input_channels: 6,
            num_input_global_channels: 4,
            trunk_channels: 8,
            num_blocks: 3,
            gpool_every: 2,
            regular_channels: 8,
            gpool_channels: 4,
            p1_channels: 4,
            g1_channels: 4,
            v1_channels: 4,
            v2_channels: 8,
            num_score_value_channels: 4,
            conv_size: 3,
            activation: ActivationKind::Relu,
            symmetric_kernels: false,
            rules: RuleSupport::all(),
        }
    }
}

/// Generates the weights of a synthesized model.
struct Synth<R: Rng> {
    rng: R,
    symmetric: bool,
}

impl<R: Rng> Synth<R> {
    fn normal(&mut self, n: usize, std_dev: f32) -> Vec<f32> {
        // SAFETY: std_dev is always a finite positive number here.
        let dist = Normal::new(0.0, std_dev).unwrap();
        dist.sample_iter(&mut self.rng).take(n).collect()
    }

    fn uniform(&mut self, n: usize, low: f32, high: f32) -> Vec<f32> {
        // SAFETY: callers always pass low < high.
        let dist = Uniform::new(low, high).unwrap();
        dist.sample_iter(&mut self.rng).take(n).collect()
    }

    fn conv(
        &mut self,
        name: String,
        size: usize,
        cin: usize,
        cout: usize,
        gain: f32,
    ) -> ConvLayerDesc {
        let fan_in = cin * size * size;
        let std_dev = gain * (2.0 / fan_in as f32).sqrt();
        let mut weights = self.normal(cout * fan_in, std_dev);

        if self.symmetric {
            weights
                .chunks_exact_mut(size * size)
                .for_each(|kernel| symmetrize(kernel, size));
        }

        ConvLayerDesc::new(name, (size, size), cin, cout, weights)
    }

    fn bn(&mut self, name: String, c: usize) -> BatchNormLayerDesc {
        BatchNormLayerDesc {
            name,
            num_channels: c,
            epsilon: 1e-5,
            has_scale: true,
            has_bias: true,
            mean: self.normal(c, 0.1),
            variance: self.uniform(c, 0.5, 1.5),
            scale: self.uniform(c, 0.8, 1.2),
            bias: self.normal(c, 0.1),
        }
    }

    fn matmul(&mut self, name: String, cin: usize, cout: usize) -> MatMulLayerDesc {
        MatMulLayerDesc {
            name,
            in_channels: cin,
            out_channels: cout,
            weights: self.normal(cin * cout, (1.0 / cin as f32).sqrt()),
        }
    }

    fn bias(&mut self, name: String, c: usize) -> MatBiasLayerDesc {
        MatBiasLayerDesc {
            name,
            num_channels: c,
            weights: self.normal(c, 0.1),
        }
    }
}

/// Averages a square kernel over the dihedral group so it commutes with board symmetries.
fn symmetrize(kernel: &mut [f32], size: usize) {
    let src = kernel.to_vec();
    let last = size - 1;

    for y in 0..size {
        for x in 0..size {
            let images = [
                (y, x),
                (y, last - x),
                (last - y, x),
                (last - y, last - x),
                (x, y),
                (x, last - y),
                (last - x, y),
                (last - x, last - y),
            ];
            kernel[y * size + x] =
                images.iter().map(|&(iy, ix)| src[iy * size + ix]).sum::<f32>() / 8.0;
        }
    }
}

/// Synthesizes a random model.
///
/// # Arguments
/// * `cfg` - The shape of the model.
/// * `seed` - The seed of the weight generator, equal seeds give equal models.
///
/// # Returns
/// A consistent model description.
pub fn random_model(cfg: &SynthConfig, seed: u64) -> ModelDesc {
    let mut s = Synth {
        rng: StdRng::seed_from_u64(seed),
        symmetric: cfg.symmetric_kernels,
    };

    let k = cfg.conv_size;
    let trunk = cfg.trunk_channels;
    let (regular, gpool) = (cfg.regular_channels, cfg.gpool_channels);
    let act = cfg.activation;

    let blocks = (0..cfg.num_blocks)
        .map(|i| {
            let name = format!("trunk.block{i}");
            let is_gpool = cfg.gpool_every > 0 && (i + 1) % cfg.gpool_every == 0;

            if is_gpool {
                BlockDesc::GlobalPooling(GlobalPoolingResidualBlockDesc {
                    pre_bn: s.bn(format!("{name}.pre_bn"), trunk),
                    pre_activation: act,
                    regular_conv: s.conv(format!("{name}.regular_conv"), k, trunk, regular, 1.0),
                    gpool_conv: s.conv(format!("{name}.gpool_conv"), k, trunk, gpool, 1.0),
                    gpool_bn: s.bn(format!("{name}.gpool_bn"), gpool),
                    gpool_activation: act,
                    gpool_to_bias_mul: s.matmul(
                        format!("{name}.gpool_to_bias_mul"),
                        3 * gpool,
                        regular,
                    ),
                    mid_bn: s.bn(format!("{name}.mid_bn"), regular),
                    mid_activation: act,
                    final_conv: s.conv(format!("{name}.final_conv"), k, regular, trunk, 0.5),
                    name,
                })
            } else {
                BlockDesc::Ordinary(ResidualBlockDesc {
                    pre_bn: s.bn(format!("{name}.pre_bn"), trunk),
                    pre_activation: act,
                    regular_conv: s.conv(format!("{name}.regular_conv"), k, trunk, regular, 1.0),
                    mid_bn: s.bn(format!("{name}.mid_bn"), regular),
                    mid_activation: act,
                    final_conv: s.conv(format!("{name}.final_conv"), k, regular, trunk, 0.5),
                    name,
                })
            }
        })
        .collect();

    let trunk_desc = TrunkDesc {
        name: "trunk".into(),
        trunk_num_channels: trunk,
        initial_conv: s.conv("trunk.initial_conv".into(), k, cfg.num_input_channels, trunk, 1.0),
        initial_matmul: s.matmul(
            "trunk.initial_matmul".into(),
            cfg.num_input_global_channels,
            trunk,
        ),
        blocks,
        trunk_tip_bn: s.bn("trunk.tip_bn".into(), trunk),
        trunk_tip_activation: act,
    };

    let policy_head = PolicyHeadDesc {
        name: "policy".into(),
        p1_conv: s.conv("policy.p1_conv".into(), 1, trunk, cfg.p1_channels, 1.0),
        g1_conv: s.conv("policy.g1_conv".into(), 1, trunk, cfg.g1_channels, 1.0),
        g1_bn: s.bn("policy.g1_bn".into(), cfg.g1_channels),
        g1_activation: act,
        gpool_to_bias_mul: s.matmul(
            "policy.gpool_to_bias_mul".into(),
            3 * cfg.g1_channels,
            cfg.p1_channels,
        ),
        p1_bn: s.bn("policy.p1_bn".into(), cfg.p1_channels),
        p1_activation: act,
        p2_conv: s.conv("policy.p2_conv".into(), 1, cfg.p1_channels, 1, 1.0),
        gpool_to_pass_mul: s.matmul("policy.gpool_to_pass_mul".into(), 3 * cfg.g1_channels, 1),
    };

    let value_head = ValueHeadDesc {
        name: "value".into(),
        v1_conv: s.conv("value.v1_conv".into(), 1, trunk, cfg.v1_channels, 1.0),
        v1_bn: s.bn("value.v1_bn".into(), cfg.v1_channels),
        v1_activation: act,
        v2_mul: s.matmul("value.v2_mul".into(), 3 * cfg.v1_channels, cfg.v2_channels),
        v2_bias: s.bias("value.v2_bias".into(), cfg.v2_channels),
        v2_activation: act,
        v3_mul: s.matmul("value.v3_mul".into(), cfg.v2_channels, 3),
        v3_bias: s.bias("value.v3_bias".into(), 3),
        sv3_mul: s.matmul(
            "value.sv3_mul".into(),
            cfg.v2_channels,
            cfg.num_score_value_channels,
        ),
        sv3_bias: s.bias("value.sv3_bias".into(), cfg.num_score_value_channels),
        v_ownership_conv: s.conv("value.v_ownership_conv".into(), 1, cfg.v1_channels, 1, 1.0),
    };

    ModelDesc {
        name: cfg.name.clone(),
        version: cfg.version,
        num_input_channels: cfg.num_input_channels,
        num_input_global_channels: cfg.num_input_global_channels,
        rules: cfg.rules.clone(),
        trunk: trunk_desc,
        policy_head,
        value_head,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::Weighted;

    #[test]
    fn synthesized_models_are_consistent() {
        let desc = random_model(&SynthConfig::default(), 3);
        desc.validate().unwrap();
        assert!(matches!(desc.trunk.blocks[1], BlockDesc::GlobalPooling(_)));
    }

    #[test]
    fn every_layer_is_listed() {
        let desc = random_model(&SynthConfig::default(), 3);

        // initial, 2 + 3 + 2 in the blocks, 5 in the heads
        assert_eq!(desc.conv_layers().len(), 13);
        assert_eq!(desc.batch_norm_layers().len(), 11);
        assert_eq!(desc.conv_layers()[0].name, desc.trunk.initial_conv.name);
    }

    #[test]
    fn equal_seeds_give_equal_models() {
        let cfg = SynthConfig::default();
        assert_eq!(random_model(&cfg, 11), random_model(&cfg, 11));
        assert_ne!(random_model(&cfg, 11), random_model(&cfg, 12));
    }

    #[test]
    fn tensor_names_are_unique() {
        let desc = random_model(&SynthConfig::default(), 0);
        let mut names: Vec<_> = desc.tensors().into_iter().map(|t| t.name).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn symmetric_kernels_are_invariant_under_transpose_and_flips() {
        let mut kernel: Vec<f32> = (0..9).map(|i| i as f32).collect();
        symmetrize(&mut kernel, 3);

        for y in 0..3 {
            for x in 0..3 {
                assert_eq!(kernel[y * 3 + x], kernel[x * 3 + y]);
                assert_eq!(kernel[y * 3 + x], kernel[y * 3 + (2 - x)]);
            }
        }
    }
}
