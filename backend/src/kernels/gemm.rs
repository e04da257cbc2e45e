use model::desc::ConvLayerDesc;
use ndarray::{
    ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4, Axis, linalg, parallel::prelude::*,
};

use super::{Kernels, shifted, tap_offset};
use crate::{BackendKind, layout::Layout, tuning::TuneParams};

/// Lowers convolutions to a single matrix product over the whole batch.
///
/// The batch and the board cells form the rows of the product, so one call covers every
/// position of the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct GemmKernels;

impl GemmKernels {
    /// Unrolls the receptive field of every cell into a row, columns ordered `(in, y, x)`.
    fn im2col(desc: &ConvLayerDesc, x: ArrayView4<'_, f32>, mut cols: ArrayViewMut2<'_, f32>) {
        let (_, cin, h, w) = x.dim();
        let (ky, kx) = (desc.conv_y_size, desc.conv_x_size);
        let area = h * w;

        cols.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(row, mut col)| {
                let (n, cell) = (row / area, row % area);
                let (y, xx) = (cell / w, cell % w);
                let mut i = 0;

                for ic in 0..cin {
                    for ty in 0..ky {
                        let sy = shifted(y, tap_offset(ty, ky, desc.dilation_y), h);
                        for tx in 0..kx {
                            let sx = shifted(xx, tap_offset(tx, kx, desc.dilation_x), w);
                            col[i] = match (sy, sx) {
                                (Some(sy), Some(sx)) => x[[n, ic, sy, sx]],
                                _ => 0.0,
                            };
                            i += 1;
                        }
                    }
                }
            });
    }
}

impl Kernels for GemmKernels {
    fn kind(&self) -> BackendKind {
        BackendKind::Gemm
    }

    fn supports_fp16(&self) -> bool {
        true
    }

    fn preferred_layout(&self) -> Layout {
        Layout::Nhwc
    }

    fn is_tunable(&self) -> bool {
        true
    }

    fn conv_workspace_len(&self, desc: &ConvLayerDesc, n: usize, h: usize, w: usize) -> usize {
        let k = desc.in_channels * desc.conv_y_size * desc.conv_x_size;
        n * h * w * (k + desc.out_channels)
    }

    fn conv(
        &self,
        desc: &ConvLayerDesc,
        x: ArrayView4<'_, f32>,
        mut out: ArrayViewMut4<'_, f32>,
        workspace: &mut Vec<f32>,
        tune: &TuneParams,
    ) {
        let (n, cin, h, w) = x.dim();
        let rows = n * h * w;
        let k = cin * desc.conv_y_size * desc.conv_x_size;
        let cout = desc.out_channels;

        let needed = self.conv_workspace_len(desc, n, h, w);
        if workspace.len() < needed {
            workspace.resize(needed, 0.0);
        }

        let (cols, res) = workspace[..needed].split_at_mut(rows * k);

        // SAFETY: both halves were cut to exactly rows * k and rows * cout elements.
        let mut cols = ArrayViewMut2::from_shape((rows, k), cols).unwrap();
        let mut res = ArrayViewMut2::from_shape((rows, cout), res).unwrap();
        // SAFETY: the layer was validated, its weights are exactly cout * k long.
        let weights = ArrayView2::from_shape((cout, k), &desc.weights).unwrap();
        let weights = weights.t();

        Self::im2col(desc, x, cols.view_mut());

        let chunk = tune.rows_per_task.max(1);
        cols.axis_chunks_iter(Axis(0), chunk)
            .into_par_iter()
            .zip(res.axis_chunks_iter_mut(Axis(0), chunk).into_par_iter())
            .for_each(|(cols, mut res)| {
                linalg::general_mat_mul(1.0, &cols, &weights, 0.0, &mut res);
            });

        // SAFETY: res holds exactly n * h * w * cout contiguous elements.
        let res = res
            .view()
            .into_shape_with_order((n, h, w, cout))
            .unwrap()
            .permuted_axes([0, 3, 1, 2]);
        out.assign(&res);
    }

    fn matmul(
        &self,
        weights: ArrayView2<'_, f32>,
        x: ArrayView2<'_, f32>,
        mut out: ArrayViewMut2<'_, f32>,
    ) {
        linalg::general_mat_mul(1.0, &x, &weights, 0.0, &mut out);
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array4;

    use super::*;
    use crate::kernels::ReferenceKernels;

    fn layer(size: usize, dilation: usize) -> ConvLayerDesc {
        let (cin, cout) = (3, 2);
        let weights = (0..cout * cin * size * size)
            .map(|i| ((i * 7) % 11) as f32 / 10.0 - 0.5)
            .collect();
        let mut desc = ConvLayerDesc::new("conv", (size, size), cin, cout, weights);
        desc.dilation_y = dilation;
        desc.dilation_x = dilation;
        desc
    }

    fn input() -> Array4<f32> {
        Array4::from_shape_fn((2, 3, 5, 4), |(n, c, y, x)| {
            ((n * 31 + c * 17 + y * 5 + x) % 13) as f32 / 6.0 - 1.0
        })
    }

    fn run(kernels: &dyn Kernels, desc: &ConvLayerDesc, rows_per_task: usize) -> Array4<f32> {
        let x = input();
        let mut out = Array4::from_elem((2, desc.out_channels, 5, 4), f32::NAN);
        let params = TuneParams { rows_per_task };
        kernels.conv(desc, x.view(), out.view_mut(), &mut Vec::new(), &params);
        out
    }

    #[test]
    fn gemm_matches_direct_loops() {
        for (size, dilation) in [(1, 1), (3, 1), (3, 2), (5, 1)] {
            let desc = layer(size, dilation);
            let expected = run(&ReferenceKernels, &desc, 1);
            let got = run(&GemmKernels, &desc, 7);

            let diff = (&expected - &got).mapv(f32::abs).fold(0.0f32, |a, &b| a.max(b));
            assert!(diff < 1e-5, "size {size} dilation {dilation}: {diff}");
        }
    }

    #[test]
    fn row_chunking_does_not_change_results() {
        let desc = layer(3, 1);
        assert_eq!(run(&GemmKernels, &desc, 1), run(&GemmKernels, &desc, 1024));
    }

    #[test]
    fn matmul_matches_direct_loops() {
        let weights = ndarray::array![[1.0, -2.0], [0.5, 0.0], [3.0, 1.0]];
        let x = ndarray::array![[1.0, 2.0, 3.0], [0.0, -1.0, 1.0]];
        let mut expected = ndarray::Array2::zeros((2, 2));
        let mut got = ndarray::Array2::zeros((2, 2));

        ReferenceKernels.matmul(weights.view(), x.view(), expected.view_mut());
        GemmKernels.matmul(weights.view(), x.view(), got.view_mut());
        assert_eq!(expected, got);
        assert_eq!(got, ndarray::array![[11.0, 1.0], [2.5, 1.0]]);
    }
}
