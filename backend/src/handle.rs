use std::{cell::Cell, marker::PhantomData, time::Instant};

use log::{debug, info};

use crate::{
    BackendErr, ComputeContext, HandleConfig, InputBuffers, NNOutput, Result,
    error::ensure,
    layout::Layout,
    network::{Batch, DeviceNet},
    ops::Exec,
    tuning::TuneParams,
};

thread_local! {
    static HANDLE_BOUND: Cell<bool> = const { Cell::new(false) };
}

/// A per thread evaluator of a compute context.
///
/// A handle can't leave the thread that created it, and that thread can't own a second one
/// besides it. It keeps its own copy of the weights and all the memory an evaluation needs.
pub struct ComputeHandle<'c> {
    ctx: &'c ComputeContext<'c>,
    device: usize,
    net: DeviceNet,
    tune: TuneParams,
    max_batch_size: usize,
    input_layout: Layout,
    _thread_bound: PhantomData<*const ()>,
}

impl<'c> ComputeHandle<'c> {
    pub(crate) fn new(ctx: &'c ComputeContext<'c>, cfg: &HandleConfig) -> Result<Self> {
        if HANDLE_BOUND.get() {
            return Err(BackendErr::HandleAlreadyBound);
        }

        if cfg.max_batch_size == 0 {
            return Err(BackendErr::InvalidConfig(
                "a handle needs a max batch size of at least 1".into(),
            ));
        }

        let device = ctx.device_slot(cfg.device_index)?;
        let index = ctx.device(device).index;
        let net = DeviceNet::new(
            ctx.model().desc(),
            ctx.kernels(),
            ctx.precision(),
            cfg.max_batch_size,
            ctx.width(),
            ctx.height(),
            cfg.require_exact_size,
        );

        HANDLE_BOUND.set(true);
        info!(
            device = index,
            max_batch_size = cfg.max_batch_size,
            exact = cfg.require_exact_size,
            nhwc_inputs = cfg.inputs_use_nhwc;
            "created compute handle"
        );

        Ok(Self {
            ctx,
            device,
            net,
            tune: ctx.tune_params(index),
            max_batch_size: cfg.max_batch_size,
            input_layout: Layout::from_nhwc(cfg.inputs_use_nhwc),
            _thread_bound: PhantomData,
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// The index of the device this handle runs on.
    pub fn device_index(&self) -> usize {
        self.ctx.device(self.device).index
    }

    /// Evaluates the first `num_filled` slots of `buffers` as one batch.
    ///
    /// The symmetry selected in `buffers` is applied to every input and undone on the spatial
    /// outputs, so `outputs[i]` always matches the orientation of slot `i`.
    ///
    /// # Arguments
    /// * `buffers` - The staged batch, sized for this handle's context and model.
    /// * `num_filled` - How many slots hold a position, between 1 and the max batch size.
    /// * `outputs` - Exactly `num_filled` outputs created for this model and board size.
    ///
    /// # Returns
    /// A `Precondition` error if any size doesn't match, in which case no output is written.
    pub fn evaluate(
        &mut self,
        buffers: &mut InputBuffers,
        num_filled: usize,
        outputs: &mut [NNOutput],
    ) -> Result<()> {
        let ctx = self.ctx;
        let model = ctx.model();
        let (w, h) = (ctx.width(), ctx.height());
        let area = w * h;

        ensure(num_filled >= 1 && num_filled <= self.max_batch_size, || {
            format!(
                "a batch of {num_filled} doesn't fit a handle of max batch size {}",
                self.max_batch_size
            )
        })?;
        ensure(num_filled <= buffers.max_batch_size(), || {
            format!(
                "only {} slots were staged for a batch of {num_filled}",
                buffers.max_batch_size()
            )
        })?;
        ensure(outputs.len() == num_filled, || {
            format!("{} outputs for a batch of {num_filled}", outputs.len())
        })?;
        ensure(buffers.width() == w && buffers.height() == h, || {
            format!(
                "inputs staged for {}x{} on a {w}x{h} context",
                buffers.width(),
                buffers.height()
            )
        })?;
        ensure(
            buffers.spatial_len() == model.num_input_channels() * area
                && buffers.global_len() == model.num_input_global_channels(),
            || format!("inputs weren't staged for model {}", model.name()),
        )?;

        let num_score_value_channels = model.num_score_value_channels();
        ensure(
            outputs.iter().all(|o| o.fits(area, num_score_value_channels)),
            || format!("outputs weren't created for a {w}x{h} board of model {}", model.name()),
        )?;

        let symmetry = buffers.symmetry();
        ensure(!symmetry.transpose || w == h, || {
            format!("can't transpose a non square {w}x{h} board")
        })?;

        let exec = Exec {
            kernels: ctx.kernels(),
            precision: ctx.precision(),
            layout: ctx.layout(),
            tune: self.tune,
        };
        let batch = Batch {
            spatial: buffers.spatial_prefix(num_filled),
            global: buffers.global_prefix(num_filled),
            num_filled,
            layout: self.input_layout,
            symmetry,
        };

        let device = ctx.device(self.device);
        let net = &mut self.net;
        let start = Instant::now();
        device.pool.install(|| net.forward(&exec, batch, outputs));

        debug!(
            device = device.index,
            batch = num_filled;
            "evaluated batch in {:?}",
            start.elapsed()
        );
        Ok(())
    }
}

impl Drop for ComputeHandle<'_> {
    fn drop(&mut self) {
        HANDLE_BOUND.set(false);
        debug!(device = self.device_index(); "released compute handle");
    }
}
