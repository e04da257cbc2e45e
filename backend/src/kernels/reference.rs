use model::desc::ConvLayerDesc;
use ndarray::{ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4, Axis, parallel::prelude::*};

use super::{Kernels, shifted, tap_offset};
use crate::{BackendKind, layout::Layout, tuning::TuneParams};

/// Direct loop kernels, the ground truth other variants are checked against.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernels;

impl Kernels for ReferenceKernels {
    fn kind(&self) -> BackendKind {
        BackendKind::Reference
    }

    fn supports_fp16(&self) -> bool {
        false
    }

    fn preferred_layout(&self) -> Layout {
        Layout::Nchw
    }

    fn is_tunable(&self) -> bool {
        false
    }

    fn conv_workspace_len(&self, _desc: &ConvLayerDesc, _n: usize, _h: usize, _w: usize) -> usize {
        0
    }

    fn conv(
        &self,
        desc: &ConvLayerDesc,
        x: ArrayView4<'_, f32>,
        mut out: ArrayViewMut4<'_, f32>,
        _workspace: &mut Vec<f32>,
        _tune: &TuneParams,
    ) {
        let (_, cin, h, w) = x.dim();
        let cout = desc.out_channels;
        let (ky, kx) = (desc.conv_y_size, desc.conv_x_size);
        let weights = &desc.weights;

        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(x.axis_iter(Axis(0)).into_par_iter())
            .for_each(|(mut out, x)| {
                for oc in 0..cout {
                    for y in 0..h {
                        for xx in 0..w {
                            let mut acc = 0.0;

                            for ic in 0..cin {
                                let base = (oc * cin + ic) * ky * kx;
                                for ty in 0..ky {
                                    let dy = tap_offset(ty, ky, desc.dilation_y);
                                    let Some(sy) = shifted(y, dy, h) else {
                                        continue;
                                    };

                                    for tx in 0..kx {
                                        let dx = tap_offset(tx, kx, desc.dilation_x);
                                        if let Some(sx) = shifted(xx, dx, w) {
                                            acc += weights[base + ty * kx + tx] * x[[ic, sy, sx]];
                                        }
                                    }
                                }
                            }

                            out[[oc, y, xx]] = acc;
                        }
                    }
                }
            });
    }

    fn matmul(
        &self,
        weights: ArrayView2<'_, f32>,
        x: ArrayView2<'_, f32>,
        mut out: ArrayViewMut2<'_, f32>,
    ) {
        let (cin, cout) = weights.dim();

        for (x, mut out) in x.outer_iter().zip(out.outer_iter_mut()) {
            for o in 0..cout {
                out[o] = (0..cin).map(|i| x[i] * weights[[i, o]]).sum();
            }
        }
    }
}
