//! Single layer entry points, bypassing models and handles, used to check backend variants
//! against each other.
//!
//! Every entry point returns `Ok(false)` when the variant doesn't implement the requested
//! configuration, leaving the output untouched. That is an expected outcome, callers skip the
//! comparison.

use model::desc::{
    ActivationKind, BatchNormLayerDesc, ConvLayerDesc, GlobalPoolingResidualBlockDesc,
    ResidualBlockDesc, Weighted,
};
use ndarray::ArrayView3;

use crate::{
    BackendErr, BackendKind, Result,
    error::ensure,
    kernels::{self, Kernels},
    layout::{Dims, Layout, Precision},
    ops::{BlockScratch, Exec, Mask},
    symmetry::Symmetry,
    tuning::TuneParams,
};

/// The batch and configuration a single layer is evaluated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerCase {
    pub batch_size: usize,
    pub width: usize,
    pub height: usize,
    pub use_fp16: bool,
    /// Whether the input, mask aside, and the output are laid out `(N, H, W, C)`.
    pub use_nhwc: bool,
}

impl LayerCase {
    /// The logical `(N, C, H, W)` dims of a tensor with `channels` channels.
    pub fn dims(&self, channels: usize) -> Dims {
        (self.batch_size, channels, self.height, self.width)
    }

    pub fn len(&self, channels: usize) -> usize {
        self.batch_size * channels * self.height * self.width
    }
}

/// Runs single layers on one backend variant.
pub struct LayerHarness {
    kernels: Box<dyn Kernels>,
}

fn check_len(what: &str, got: usize, expected: usize) -> Result<()> {
    ensure(got == expected, || {
        format!("the {what} buffer holds {got} values instead of {expected}")
    })
}

fn check_layer(result: model::Result<()>) -> Result<()> {
    result.map_err(|e| BackendErr::Precondition(e.to_string()))
}

/// A copy of a layer with its weights rounded to `precision`.
fn rounded<T: Weighted + Clone>(desc: &T, precision: Precision) -> T {
    let mut desc = desc.clone();
    for tensor in desc.tensors_mut() {
        precision.round_slice(tensor.data);
    }
    desc
}

/// The amount of on board cells of each position of an `(N, H, W)` mask.
fn counts(mask: &[f32], batch_size: usize) -> Vec<f32> {
    mask.chunks_exact(mask.len() / batch_size)
        .map(|cells| cells.iter().sum())
        .collect()
}

impl LayerHarness {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kernels: kernels::for_kind(kind),
        }
    }

    pub fn backend(&self) -> BackendKind {
        self.kernels.kind()
    }

    /// The execution settings of a case, `None` if the variant declines it.
    fn exec(&self, case: &LayerCase) -> Result<Option<Exec<'_>>> {
        ensure(
            case.batch_size > 0 && case.width > 0 && case.height > 0,
            || format!("empty case {case:?}"),
        )?;

        if case.use_fp16 && !self.kernels.supports_fp16() {
            return Ok(None);
        }

        Ok(Some(Exec {
            kernels: self.kernels.as_ref(),
            precision: if case.use_fp16 { Precision::Fp16 } else { Precision::Fp32 },
            layout: Layout::from_nhwc(case.use_nhwc),
            tune: TuneParams::default(),
        }))
    }

    /// Convolves `input` with a single layer.
    ///
    /// # Arguments
    /// * `desc` - The layer.
    /// * `case` - The batch and configuration to run with.
    /// * `input` - The `(N, in, H, W)` input.
    /// * `output` - Resized to and filled with the `(N, out, H, W)` output.
    ///
    /// # Returns
    /// Whether the variant ran the layer, or a `Precondition` error if a buffer is mis-sized.
    pub fn test_evaluate_conv(
        &self,
        desc: &ConvLayerDesc,
        case: &LayerCase,
        input: &[f32],
        output: &mut Vec<f32>,
    ) -> Result<bool> {
        check_layer(desc.validate())?;
        check_len("input", input.len(), case.len(desc.in_channels))?;
        let Some(exec) = self.exec(case)? else {
            return Ok(false);
        };

        let desc = rounded(desc, exec.precision);
        let mut x = input.to_vec();
        exec.precision.round_slice(&mut x);

        output.clear();
        output.resize(case.len(desc.out_channels), 0.0);
        exec.conv(
            &desc,
            exec.layout.view(&x, case.dims(desc.in_channels)),
            exec.layout.view_mut(output, case.dims(desc.out_channels)),
            &mut Vec::new(),
        );
        Ok(true)
    }

    /// Batch normalizes `input` without any activation, zeroing the cells off the board.
    ///
    /// # Arguments
    /// * `desc` - The layer.
    /// * `case` - The batch and configuration to run with.
    /// * `input` - The `(N, C, H, W)` input.
    /// * `mask` - The `(N, H, W)` on board mask.
    /// * `output` - Resized to and filled with the `(N, C, H, W)` output.
    pub fn test_evaluate_batch_norm(
        &self,
        desc: &BatchNormLayerDesc,
        case: &LayerCase,
        input: &[f32],
        mask: &[f32],
        output: &mut Vec<f32>,
    ) -> Result<bool> {
        check_layer(desc.validate())?;
        check_len("input", input.len(), case.len(desc.num_channels))?;
        check_len("mask", mask.len(), case.len(1))?;
        let Some(exec) = self.exec(case)? else {
            return Ok(false);
        };

        let desc = rounded(desc, exec.precision);
        output.clear();
        output.extend_from_slice(input);
        exec.precision.round_slice(output);

        let counts = counts(mask, case.batch_size);
        exec.normalize(
            &desc,
            ActivationKind::Identity,
            exec.layout.view_mut(output, case.dims(desc.num_channels)),
            mask_of(mask, case, &counts),
        );
        Ok(true)
    }

    /// Runs an ordinary residual block on `input`.
    ///
    /// # Arguments
    /// * `desc` - The block.
    /// * `case` - The batch and configuration to run with.
    /// * `input` - The `(N, C, H, W)` trunk.
    /// * `mask` - The `(N, H, W)` on board mask.
    /// * `output` - Resized to and filled with the updated `(N, C, H, W)` trunk.
    pub fn test_evaluate_residual_block(
        &self,
        desc: &ResidualBlockDesc,
        case: &LayerCase,
        input: &[f32],
        mask: &[f32],
        output: &mut Vec<f32>,
    ) -> Result<bool> {
        let trunk = desc.pre_bn.num_channels;
        check_layer(desc.validate(trunk))?;
        check_len("input", input.len(), case.len(trunk))?;
        check_len("mask", mask.len(), case.len(1))?;
        let Some(exec) = self.exec(case)? else {
            return Ok(false);
        };

        let desc = rounded(desc, exec.precision);
        let widest = trunk.max(desc.regular_conv.out_channels);
        let mut pre = vec![0.0; case.len(widest)];
        let mut mid = pre.clone();
        let mut aux = pre.clone();
        let mut workspace = Vec::new();

        output.clear();
        output.extend_from_slice(input);
        exec.precision.round_slice(output);

        let counts = counts(mask, case.batch_size);
        exec.residual_block(
            &desc,
            exec.layout.view_mut(output, case.dims(trunk)),
            mask_of(mask, case, &counts),
            BlockScratch {
                pre: &mut pre[..],
                mid: &mut mid[..],
                aux: &mut aux[..],
                workspace: &mut workspace,
            },
        );
        Ok(true)
    }

    /// Runs a global pooling residual block on `input`.
    ///
    /// # Arguments
    /// * `desc` - The block.
    /// * `case` - The batch and configuration to run with.
    /// * `input` - The `(N, C, H, W)` trunk.
    /// * `mask` - The `(N, H, W)` on board mask.
    /// * `output` - Resized to and filled with the updated `(N, C, H, W)` trunk.
    pub fn test_evaluate_global_pooling_residual_block(
        &self,
        desc: &GlobalPoolingResidualBlockDesc,
        case: &LayerCase,
        input: &[f32],
        mask: &[f32],
        output: &mut Vec<f32>,
    ) -> Result<bool> {
        let trunk = desc.pre_bn.num_channels;
        check_layer(desc.validate(trunk))?;
        check_len("input", input.len(), case.len(trunk))?;
        check_len("mask", mask.len(), case.len(1))?;
        let Some(exec) = self.exec(case)? else {
            return Ok(false);
        };

        let desc = rounded(desc, exec.precision);
        let widest = trunk
            .max(desc.regular_conv.out_channels)
            .max(desc.gpool_conv.out_channels);
        let mut pre = vec![0.0; case.len(widest)];
        let mut mid = pre.clone();
        let mut aux = pre.clone();
        let mut workspace = Vec::new();

        output.clear();
        output.extend_from_slice(input);
        exec.precision.round_slice(output);

        let counts = counts(mask, case.batch_size);
        exec.global_pooling_residual_block(
            &desc,
            exec.layout.view_mut(output, case.dims(trunk)),
            mask_of(mask, case, &counts),
            BlockScratch {
                pre: &mut pre[..],
                mid: &mut mid[..],
                aux: &mut aux[..],
                workspace: &mut workspace,
            },
        );
        Ok(true)
    }

    /// Applies a board symmetry, or its inverse, to raw channel data.
    ///
    /// # Arguments
    /// * `symmetry` - The `[flip_y, flip_x, transpose]` selector.
    /// * `inverse` - Whether to undo the symmetry instead.
    /// * `channels` - Amount of channels of the data.
    /// * `case` - The batch and configuration, `width` and `height` being the untransformed ones.
    /// * `input` - The `(N, C, H, W)` data, or its transformed `(N, C, H', W')` form if `inverse`.
    /// * `output` - Resized to and filled with the other form.
    pub fn test_evaluate_symmetry(
        &self,
        symmetry: [bool; 3],
        inverse: bool,
        channels: usize,
        case: &LayerCase,
        input: &[f32],
        output: &mut Vec<f32>,
    ) -> Result<bool> {
        check_len("input", input.len(), case.len(channels))?;
        let Some(exec) = self.exec(case)? else {
            return Ok(false);
        };

        let symmetry = Symmetry::from_flags(symmetry);
        let (n, h, w) = (case.batch_size, case.height, case.width);
        let (th, tw) = symmetry.output_dims(h, w);
        let (src_dims, dst_dims) = if inverse {
            ((n, channels, th, tw), (n, channels, h, w))
        } else {
            ((n, channels, h, w), (n, channels, th, tw))
        };

        let mut x = input.to_vec();
        exec.precision.round_slice(&mut x);
        output.clear();
        output.resize(x.len(), 0.0);

        let src = exec.layout.view(&x, src_dims);
        let dst = exec.layout.view_mut(output, dst_dims);
        if inverse {
            symmetry.invert(src, dst);
        } else {
            symmetry.apply(src, dst);
        }
        Ok(true)
    }
}

fn mask_of<'a>(mask: &'a [f32], case: &LayerCase, counts: &'a [f32]) -> Mask<'a> {
    // SAFETY: the mask length was checked against the case.
    let cells = ArrayView3::from_shape((case.batch_size, case.height, case.width), mask).unwrap();
    Mask {
        cells: Some(cells),
        counts,
    }
}
