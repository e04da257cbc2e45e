use model::desc::{ActivationKind, BlockDesc, ModelDesc, Weighted};
use ndarray::{ArrayView2, ArrayView3, ArrayViewMut2, ArrayViewMut3, Axis, s};

use crate::{
    NNOutput,
    kernels::Kernels,
    layout::{Layout, Precision},
    ops::{BlockScratch, Exec, Mask, Pooling},
    symmetry::Symmetry,
};

/// A batch staged by the caller.
pub(crate) struct Batch<'b> {
    /// The `(N, C, H, W)` spatial features, in `layout` order.
    pub spatial: &'b [f32],
    /// The `(N, G)` global features.
    pub global: &'b [f32],
    pub num_filled: usize,
    pub layout: Layout,
    pub symmetry: Symmetry,
}

/// Buffers sized once for the largest batch a handle accepts.
#[derive(Debug, Default)]
struct Scratch {
    input: Vec<f32>,
    trunk: Vec<f32>,
    pre: Vec<f32>,
    mid: Vec<f32>,
    aux: Vec<f32>,
    mask: Vec<f32>,
    counts: Vec<f32>,
    workspace: Vec<f32>,
}

/// The weights of a model as cached on one device, plus the memory it evaluates in.
#[derive(Debug)]
pub(crate) struct DeviceNet {
    desc: ModelDesc,
    width: usize,
    height: usize,
    exact: bool,
    scratch: Scratch,
}

impl DeviceNet {
    /// Caches the model for a device.
    ///
    /// # Arguments
    /// * `desc` - The model.
    /// * `kernels` - The variant the net will run on, it decides the workspace size.
    /// * `precision` - The precision the weights are rounded to.
    /// * `max_batch_size` - The largest batch the scratch memory must fit.
    /// * `width` - The board width.
    /// * `height` - The board height.
    /// * `exact` - Whether masking is skipped.
    pub fn new(
        desc: &ModelDesc,
        kernels: &dyn Kernels,
        precision: Precision,
        max_batch_size: usize,
        width: usize,
        height: usize,
        exact: bool,
    ) -> Self {
        let mut desc = desc.clone();
        if precision.is_reduced() {
            for tensor in desc.tensors_mut() {
                precision.round_slice(tensor.data);
            }
        }

        let area = width * height;
        let widest = desc
            .conv_layers()
            .iter()
            .map(|c| c.in_channels.max(c.out_channels))
            .max()
            .unwrap_or(0)
            .max(desc.trunk.trunk_num_channels);

        let workspace = desc
            .conv_layers()
            .iter()
            .map(|c| kernels.conv_workspace_len(c, max_batch_size, height, width))
            .max()
            .unwrap_or(0);

        let plane = max_batch_size * widest * area;
        let scratch = Scratch {
            input: vec![0.0; max_batch_size * desc.num_input_channels * area],
            trunk: vec![0.0; max_batch_size * desc.trunk.trunk_num_channels * area],
            pre: vec![0.0; plane],
            mid: vec![0.0; plane],
            aux: vec![0.0; plane],
            mask: vec![0.0; max_batch_size * area],
            counts: vec![0.0; max_batch_size],
            workspace: vec![0.0; workspace],
        };

        Self {
            desc,
            width,
            height,
            exact,
            scratch,
        }
    }

    /// Evaluates a batch, writing one output per filled slot.
    ///
    /// The caller checks the batch and the outputs against the sizes the net was built for.
    pub fn forward(&mut self, exec: &Exec<'_>, batch: Batch<'_>, outputs: &mut [NNOutput]) {
        let Self {
            desc,
            width,
            height,
            exact,
            scratch,
        } = self;

        let Scratch {
            input,
            trunk,
            pre,
            mid,
            aux,
            mask: mask_buf,
            counts,
            workspace,
        } = scratch;

        let (n, h, w) = (batch.num_filled, *height, *width);
        let area = h * w;

        let staged = batch.layout.view(batch.spatial, (n, desc.num_input_channels, h, w));
        let mut x = exec
            .layout
            .view_mut(input, (n, desc.num_input_channels, h, w));
        batch.symmetry.apply(staged, x.view_mut());
        exec.precision.round_array(x.view_mut());

        // the first spatial feature flags the cells that lie on the board
        if *exact {
            counts[..n].fill(area as f32);
        } else {
            // SAFETY: the mask buffer is cut to exactly n * h * w elements.
            let mut cells =
                ArrayViewMut3::from_shape((n, h, w), &mut mask_buf[..n * area]).unwrap();
            cells.assign(&x.index_axis(Axis(1), 0));
            for (count, plane) in counts.iter_mut().zip(cells.outer_iter()) {
                *count = plane.sum();
            }
        }

        let mask = Mask {
            // SAFETY: the mask buffer is cut to exactly n * h * w elements.
            cells: (!*exact)
                .then(|| ArrayView3::from_shape((n, h, w), &mask_buf[..n * area]).unwrap()),
            counts: &counts[..n],
        };

        // trunk
        let trunk_desc = &desc.trunk;
        let mut t = exec
            .layout
            .view_mut(trunk, (n, trunk_desc.trunk_num_channels, h, w));
        exec.conv(&trunk_desc.initial_conv, x.view(), t.view_mut(), workspace);

        // SAFETY: the global features hold exactly n * G elements.
        let mut global =
            ArrayView2::from_shape((n, desc.num_input_global_channels), batch.global)
                .unwrap()
                .to_owned();
        exec.precision.round_array(global.view_mut());
        let bias = exec.matmul(&trunk_desc.initial_matmul, global.view());
        exec.add_channel_bias(t.view_mut(), bias.view());

        for block in &trunk_desc.blocks {
            let scratch = BlockScratch {
                pre: &mut pre[..],
                mid: &mut mid[..],
                aux: &mut aux[..],
                workspace: &mut *workspace,
            };

            match block {
                BlockDesc::Ordinary(b) => exec.residual_block(b, t.view_mut(), mask, scratch),
                BlockDesc::GlobalPooling(b) => {
                    exec.global_pooling_residual_block(b, t.view_mut(), mask, scratch)
                }
            }
        }

        exec.normalize(
            &trunk_desc.trunk_tip_bn,
            trunk_desc.trunk_tip_activation,
            t.view_mut(),
            mask,
        );
        let t = t.view();

        // policy head
        let ph = &desc.policy_head;
        let mut p1 = exec.layout.view_mut(pre, (n, ph.p1_conv.out_channels, h, w));
        exec.conv(&ph.p1_conv, t, p1.view_mut(), workspace);

        let mut g1 = exec.layout.view_mut(mid, (n, ph.g1_conv.out_channels, h, w));
        exec.conv(&ph.g1_conv, t, g1.view_mut(), workspace);
        exec.normalize(&ph.g1_bn, ph.g1_activation, g1.view_mut(), mask);

        let pooled = exec.global_pool(g1.view(), mask, Pooling::Trunk);
        let bias = exec.matmul(&ph.gpool_to_bias_mul, pooled.view());
        exec.add_channel_bias(p1.view_mut(), bias.view());
        exec.normalize(&ph.p1_bn, ph.p1_activation, p1.view_mut(), mask);

        let mut policy = exec.layout.view_mut(aux, (n, 1, h, w));
        exec.conv(&ph.p2_conv, p1.view(), policy.view_mut(), workspace);
        let pass = exec.matmul(&ph.gpool_to_pass_mul, pooled.view());

        // value head
        let vh = &desc.value_head;
        let mut v1 = exec.layout.view_mut(pre, (n, vh.v1_conv.out_channels, h, w));
        exec.conv(&vh.v1_conv, t, v1.view_mut(), workspace);
        exec.normalize(&vh.v1_bn, vh.v1_activation, v1.view_mut(), mask);

        let pooled = exec.global_pool(v1.view(), mask, Pooling::Value);
        let mut v2 = exec.matmul(&vh.v2_mul, pooled.view());
        exec.mat_bias(&vh.v2_bias, vh.v2_activation, &mut v2);

        let mut value = exec.matmul(&vh.v3_mul, v2.view());
        exec.mat_bias(&vh.v3_bias, ActivationKind::Identity, &mut value);
        let mut score_value = exec.matmul(&vh.sv3_mul, v2.view());
        exec.mat_bias(&vh.sv3_bias, ActivationKind::Identity, &mut score_value);

        let mut ownership = exec.layout.view_mut(mid, (n, 1, h, w));
        exec.conv(&vh.v_ownership_conv, v1.view(), ownership.view_mut(), workspace);

        for (i, out) in outputs.iter_mut().enumerate() {
            // SAFETY: the outputs were checked to fit an h x w board.
            let cells = ArrayViewMut2::from_shape((h, w), &mut out.policy[..area]).unwrap();
            batch
                .symmetry
                .invert_plane(policy.slice(s![i, 0, .., ..]), cells);
            out.policy[area] = pass[[i, 0]];

            // SAFETY: same as above.
            let cells = ArrayViewMut2::from_shape((h, w), &mut out.ownership[..]).unwrap();
            batch
                .symmetry
                .invert_plane(ownership.slice(s![i, 0, .., ..]), cells);

            out.value = [value[[i, 0]], value[[i, 1]], value[[i, 2]]];
            for (dst, &src) in out.score_value.iter_mut().zip(score_value.row(i)) {
                *dst = src;
            }
        }
    }
}
