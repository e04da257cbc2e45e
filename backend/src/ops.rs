//! Layers and blocks shared by every backend variant, built on top of `Kernels`.

use model::desc::{
    ActivationKind, BatchNormLayerDesc, ConvLayerDesc, GlobalPoolingResidualBlockDesc,
    MatBiasLayerDesc, MatMulLayerDesc, ResidualBlockDesc,
};
use ndarray::{
    Array2, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut4, Axis, Zip, parallel::prelude::*,
};

use crate::{
    kernels::Kernels,
    layout::{Layout, Precision},
    tuning::TuneParams,
};

/// How a layer runs on one device.
#[derive(Clone, Copy)]
pub(crate) struct Exec<'k> {
    pub kernels: &'k dyn Kernels,
    pub precision: Precision,
    /// The memory order of every activation buffer.
    pub layout: Layout,
    pub tune: TuneParams,
}

/// The cells of each position that lie on the board.
#[derive(Clone, Copy)]
pub(crate) struct Mask<'a> {
    /// `(N, H, W)` ones and zeros, `None` when every cell is on the board.
    pub cells: Option<ArrayView3<'a, f32>>,
    /// Amount of on board cells of each position.
    pub counts: &'a [f32],
}

/// The scratch planes a residual block works in.
///
/// Each plane holds at least `N * C * H * W` elements for the widest layer of the block.
pub(crate) struct BlockScratch<'s> {
    pub pre: &'s mut [f32],
    pub mid: &'s mut [f32],
    pub aux: &'s mut [f32],
    pub workspace: &'s mut Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pooling {
    /// Mean, size scaled mean and max.
    Trunk,
    /// Mean, size scaled mean and quadratically size scaled mean.
    Value,
}

impl Exec<'_> {
    pub fn conv(
        &self,
        desc: &ConvLayerDesc,
        x: ArrayView4<'_, f32>,
        mut out: ArrayViewMut4<'_, f32>,
        workspace: &mut Vec<f32>,
    ) {
        self.kernels
            .conv(desc, x, out.view_mut(), workspace, &self.tune);
        self.precision.round_array(out);
    }

    pub fn matmul(&self, desc: &MatMulLayerDesc, x: ArrayView2<'_, f32>) -> Array2<f32> {
        // SAFETY: validated layers hold exactly in * out weights.
        let weights =
            ArrayView2::from_shape((desc.in_channels, desc.out_channels), &desc.weights).unwrap();

        let mut out = Array2::zeros((x.nrows(), desc.out_channels));
        self.kernels.matmul(weights, x, out.view_mut());
        self.precision.round_array(out.view_mut());
        out
    }

    /// Adds a bias to every row of `x` and activates it.
    pub fn mat_bias(
        &self,
        desc: &MatBiasLayerDesc,
        activation: ActivationKind,
        x: &mut Array2<f32>,
    ) {
        for mut row in x.rows_mut() {
            for (v, &b) in row.iter_mut().zip(&desc.weights) {
                *v = self.precision.round(activation.apply(*v + b));
            }
        }
    }

    /// Batch normalizes and activates `x` in place, zeroing the off board cells.
    pub fn normalize(
        &self,
        desc: &BatchNormLayerDesc,
        activation: ActivationKind,
        mut x: ArrayViewMut4<'_, f32>,
        mask: Mask<'_>,
    ) {
        let (scale, bias) = desc.merged();
        let precision = self.precision;

        x.axis_iter_mut(Axis(1))
            .into_par_iter()
            .enumerate()
            .for_each(|(c, mut plane)| {
                let (s, b) = (scale[c], bias[c]);
                let f = |v: f32| precision.round(activation.apply(v * s + b));

                match mask.cells {
                    Some(cells) => Zip::from(&mut plane)
                        .and(&cells)
                        .for_each(|v, &m| *v = f(*v) * m),
                    None => plane.mapv_inplace(f),
                }
            });
    }

    /// Adds a per position, per channel `(N, C)` bias to every cell of `x`.
    pub fn add_channel_bias(&self, mut x: ArrayViewMut4<'_, f32>, bias: ArrayView2<'_, f32>) {
        let precision = self.precision;

        for (mut x, bias) in x.outer_iter_mut().zip(bias.outer_iter()) {
            for (mut plane, &b) in x.outer_iter_mut().zip(bias.iter()) {
                plane.mapv_inplace(|v| precision.round(v + b));
            }
        }
    }

    /// `trunk += residual`
    pub fn add_residual(&self, mut trunk: ArrayViewMut4<'_, f32>, residual: ArrayView4<'_, f32>) {
        let precision = self.precision;
        Zip::from(&mut trunk)
            .and(&residual)
            .par_for_each(|t, &r| *t = precision.round(*t + r));
    }

    /// Summarizes every channel of `x` with three board wide statistics over the on board cells.
    ///
    /// # Returns
    /// An `(N, 3 * C)` matrix, each of the three statistics taking a contiguous run of `C` columns.
    pub fn global_pool(
        &self,
        x: ArrayView4<'_, f32>,
        mask: Mask<'_>,
        pooling: Pooling,
    ) -> Array2<f32> {
        let (n, c, _, _) = x.dim();
        let mut out = Array2::zeros((n, 3 * c));

        for (i, (x, mut out)) in x.outer_iter().zip(out.outer_iter_mut()).enumerate() {
            let count = mask.counts[i];
            let size_scale = (count.sqrt() - 14.0) * 0.1;
            let cells = mask.cells.map(|m| m.index_axis_move(Axis(0), i));

            for (ch, plane) in x.outer_iter().enumerate() {
                let (sum, max) = match cells {
                    Some(cells) => Zip::from(&plane).and(&cells).fold(
                        (0.0f32, f32::NEG_INFINITY),
                        |(sum, max), &v, &m| {
                            if m > 0.0 { (sum + v * m, max.max(v)) } else { (sum, max) }
                        },
                    ),
                    None => plane.fold((0.0f32, f32::NEG_INFINITY), |(sum, max), &v| {
                        (sum + v, max.max(v))
                    }),
                };

                let mean = if count > 0.0 { sum / count } else { 0.0 };
                let third = match pooling {
                    Pooling::Trunk if max.is_finite() => max,
                    Pooling::Trunk => 0.0,
                    Pooling::Value => mean * (size_scale * size_scale - 0.1),
                };

                out[ch] = self.precision.round(mean);
                out[c + ch] = self.precision.round(mean * size_scale);
                out[2 * c + ch] = self.precision.round(third);
            }
        }

        out
    }

    /// Runs an ordinary residual block, updating `trunk` in place.
    pub fn residual_block(
        &self,
        desc: &ResidualBlockDesc,
        mut trunk: ArrayViewMut4<'_, f32>,
        mask: Mask<'_>,
        scratch: BlockScratch<'_>,
    ) {
        let (n, c, h, w) = trunk.dim();
        let BlockScratch {
            pre,
            mid,
            aux,
            workspace,
        } = scratch;

        let mut x = self.layout.view_mut(pre, (n, c, h, w));
        x.assign(&trunk);
        self.normalize(&desc.pre_bn, desc.pre_activation, x.view_mut(), mask);

        let mut regular = self
            .layout
            .view_mut(mid, (n, desc.regular_conv.out_channels, h, w));
        self.conv(&desc.regular_conv, x.view(), regular.view_mut(), workspace);
        self.normalize(&desc.mid_bn, desc.mid_activation, regular.view_mut(), mask);

        let mut residual = self.layout.view_mut(aux, (n, c, h, w));
        self.conv(&desc.final_conv, regular.view(), residual.view_mut(), workspace);
        self.add_residual(trunk.view_mut(), residual.view());
    }

    /// Runs a residual block whose middle activations get a bias pooled from a side branch.
    pub fn global_pooling_residual_block(
        &self,
        desc: &GlobalPoolingResidualBlockDesc,
        mut trunk: ArrayViewMut4<'_, f32>,
        mask: Mask<'_>,
        scratch: BlockScratch<'_>,
    ) {
        let (n, c, h, w) = trunk.dim();
        let BlockScratch {
            pre,
            mid,
            aux,
            workspace,
        } = scratch;

        let mut x = self.layout.view_mut(pre, (n, c, h, w));
        x.assign(&trunk);
        self.normalize(&desc.pre_bn, desc.pre_activation, x.view_mut(), mask);

        let mut regular = self
            .layout
            .view_mut(mid, (n, desc.regular_conv.out_channels, h, w));
        self.conv(&desc.regular_conv, x.view(), regular.view_mut(), workspace);

        let mut gpool = self
            .layout
            .view_mut(aux, (n, desc.gpool_conv.out_channels, h, w));
        self.conv(&desc.gpool_conv, x.view(), gpool.view_mut(), workspace);
        self.normalize(&desc.gpool_bn, desc.gpool_activation, gpool.view_mut(), mask);

        let pooled = self.global_pool(gpool.view(), mask, Pooling::Trunk);
        let bias = self.matmul(&desc.gpool_to_bias_mul, pooled.view());
        self.add_channel_bias(regular.view_mut(), bias.view());
        self.normalize(&desc.mid_bn, desc.mid_activation, regular.view_mut(), mask);

        let mut residual = self.layout.view_mut(pre, (n, c, h, w));
        self.conv(&desc.final_conv, regular.view(), residual.view_mut(), workspace);
        self.add_residual(trunk.view_mut(), residual.view());
    }
}

#[cfg(test)]
mod tests {
    use model::desc::BatchNormLayerDesc;
    use ndarray::{Array3, Array4};

    use super::*;
    use crate::kernels::{GemmKernels, ReferenceKernels};

    fn exec(kernels: &dyn Kernels, layout: Layout) -> Exec<'_> {
        Exec {
            kernels,
            precision: Precision::Fp32,
            layout,
            tune: TuneParams::default(),
        }
    }

    #[test]
    fn normalization_zeroes_off_board_cells() {
        let mut bn = BatchNormLayerDesc::identity("bn", 2);
        bn.bias = vec![1.0, -1.0];
        bn.has_bias = true;

        let mut x = Array4::from_elem((1, 2, 2, 2), 0.5);
        let cells = ndarray::array![[[1.0, 0.0], [1.0, 1.0]]];
        let counts = [3.0];
        let mask = Mask {
            cells: Some(cells.view()),
            counts: &counts,
        };

        let exec = exec(&ReferenceKernels, Layout::Nchw);
        exec.normalize(&bn, ActivationKind::Relu, x.view_mut(), mask);

        let scale = 1.0 / (1.0f32 + bn.epsilon).sqrt();
        let on = 0.5 * scale + 1.0;
        assert_eq!(x.slice(ndarray::s![0, 0, .., ..]), ndarray::array![[on, 0.0], [on, on]]);
        // relu clamps the second channel everywhere
        assert!(x.slice(ndarray::s![0, 1, .., ..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn trunk_pooling_only_sees_board_cells() {
        let x = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0, 9.0, 3.0, 5.0]).unwrap();
        let cells: Array3<f32> = ndarray::array![[[1.0, 0.0], [1.0, 1.0]]];
        let counts = [3.0];
        let mask = Mask {
            cells: Some(cells.view()),
            counts: &counts,
        };

        let exec = exec(&ReferenceKernels, Layout::Nchw);
        let pooled = exec.global_pool(x.view(), mask, Pooling::Trunk);
        let mean = 3.0;
        assert_eq!(pooled[[0, 0]], mean);
        assert!((pooled[[0, 1]] - mean * (3.0f32.sqrt() - 14.0) * 0.1).abs() < 1e-6);
        assert_eq!(pooled[[0, 2]], 5.0);
    }

    #[test]
    fn value_pooling_scales_quadratically() {
        let x = Array4::from_elem((1, 1, 3, 3), 2.0);
        let counts = [9.0];
        let mask = Mask {
            cells: None,
            counts: &counts,
        };

        let pooled = exec(&GemmKernels, Layout::Nhwc).global_pool(x.view(), mask, Pooling::Value);
        let size_scale: f32 = (3.0 - 14.0) * 0.1;
        assert_eq!(pooled[[0, 0]], 2.0);
        assert!((pooled[[0, 2]] - 2.0 * (size_scale * size_scale - 0.1)).abs() < 1e-6);
    }

    #[test]
    fn empty_boards_pool_to_zero() {
        let x = Array4::from_elem((1, 1, 2, 2), 4.0);
        let cells = Array3::zeros((1, 2, 2));
        let counts = [0.0];
        let mask = Mask {
            cells: Some(cells.view()),
            counts: &counts,
        };

        let exec = exec(&ReferenceKernels, Layout::Nchw);
        let pooled = exec.global_pool(x.view(), mask, Pooling::Trunk);
        assert!(pooled.iter().all(|&v| v == 0.0));
    }
}
