//! The per variant compute primitives.
//!
//! Everything above the convolution and matrix multiplication (normalization, activations,
//! pooling, block composition) is shared between variants, see `ops`.

mod gemm;
mod reference;

use model::desc::ConvLayerDesc;
use ndarray::{ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4};

pub use gemm::GemmKernels;
pub use reference::ReferenceKernels;

use crate::{BackendKind, layout::Layout, tuning::TuneParams};

/// Compute primitives of a backend variant.
///
/// Tensors are logical `(N, C, H, W)` views whatever their memory order is.
pub trait Kernels: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the variant can run with half precision activations and weights.
    fn supports_fp16(&self) -> bool;

    /// The layout this variant runs fastest with.
    fn preferred_layout(&self) -> Layout;

    /// Whether `TuneParams` have any effect on this variant.
    fn is_tunable(&self) -> bool;

    /// Amount of scratch elements `conv` needs for the given layer and batch.
    fn conv_workspace_len(&self, desc: &ConvLayerDesc, n: usize, h: usize, w: usize) -> usize;

    /// Zero padded "same" convolution, every element of `out` is overwritten.
    ///
    /// # Arguments
    /// * `desc` - The layer, its weights are laid out `(out, in, y, x)`.
    /// * `x` - The `(N, in, H, W)` input.
    /// * `out` - The `(N, out, H, W)` output.
    /// * `workspace` - Scratch memory, grown when too small.
    /// * `tune` - The tuned parameters of the device.
    fn conv(
        &self,
        desc: &ConvLayerDesc,
        x: ArrayView4<'_, f32>,
        out: ArrayViewMut4<'_, f32>,
        workspace: &mut Vec<f32>,
        tune: &TuneParams,
    );

    /// Computes `out = x * weights`.
    ///
    /// # Arguments
    /// * `weights` - The `(in, out)` weights.
    /// * `x` - The `(N, in)` input.
    /// * `out` - The `(N, out)` output, overwritten.
    fn matmul(
        &self,
        weights: ArrayView2<'_, f32>,
        x: ArrayView2<'_, f32>,
        out: ArrayViewMut2<'_, f32>,
    );
}

/// Creates the kernels of the given variant.
pub fn for_kind(kind: BackendKind) -> Box<dyn Kernels> {
    match kind {
        BackendKind::Reference => Box::new(ReferenceKernels),
        BackendKind::Gemm => Box::new(GemmKernels),
    }
}

/// Offset of the `tap`-th kernel tap from the center along an axis, scaled by `dilation`.
#[inline]
pub(crate) fn tap_offset(tap: usize, size: usize, dilation: usize) -> isize {
    (tap as isize - (size / 2) as isize) * dilation as isize
}

/// `pos + offset` if it lands inside `0..len`.
#[inline]
pub(crate) fn shifted(pos: usize, offset: isize, len: usize) -> Option<usize> {
    let p = pos as isize + offset;
    (0..len as isize).contains(&p).then_some(p as usize)
}
