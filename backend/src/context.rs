use std::marker::PhantomData;

use log::{info, warn};
use model::Model;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::{
    BackendErr, BackendKind, ComputeHandle, ContextConfig, HandleConfig, LayoutMode,
    PrecisionMode, Result, Runtime,
    config::MAX_BOARD_LEN,
    kernels::{self, Kernels},
    layout::{Layout, Precision},
    tuning::{self, TuneKey, TuneParams, Tuner},
};

/// One compute device, a dedicated pool of workers.
#[derive(Debug)]
pub(crate) struct Device {
    pub index: usize,
    pub pool: ThreadPool,
}

/// The state shared by every compute handle evaluating a model.
///
/// A context is `Sync`, every search thread borrows it to create its own handle.
pub struct ComputeContext<'a> {
    model: &'a Model,
    kernels: Box<dyn Kernels>,
    devices: Vec<Device>,
    num_devices: usize,
    width: usize,
    height: usize,
    precision: Precision,
    layout: Layout,
    retune_per_size: bool,
    model_tag: String,
    tuner: Tuner,
    _runtime: PhantomData<&'a Runtime>,
}

/// Maps the requested device indices to actual devices.
///
/// `-1` stands for the default device, repeated devices are only kept once and an empty request
/// gets the default device.
pub(crate) fn resolve_devices(requested: &[i32], available: usize) -> Result<Vec<usize>> {
    if available == 0 {
        return Err(BackendErr::InvalidConfig("there are no devices".into()));
    }

    let mut devices = Vec::with_capacity(requested.len().max(1));
    for &index in requested {
        let device = match index {
            -1 => 0,
            i if i >= 0 && (i as usize) < available => i as usize,
            _ => {
                return Err(BackendErr::DeviceUnavailable {
                    requested: index,
                    available,
                });
            }
        };

        if !devices.contains(&device) {
            devices.push(device);
        }
    }

    if devices.is_empty() {
        devices.push(0);
    }
    Ok(devices)
}

pub(crate) fn negotiate_precision(mode: PrecisionMode, kernels: &dyn Kernels) -> Precision {
    match mode {
        PrecisionMode::ForceFp32 | PrecisionMode::Auto => Precision::Fp32,
        PrecisionMode::PreferFp16 if kernels.supports_fp16() => Precision::Fp16,
        PrecisionMode::PreferFp16 => {
            warn!(
                "the {} backend has no fp16 support, falling back to fp32",
                kernels.kind().name()
            );
            Precision::Fp32
        }
    }
}

pub(crate) fn negotiate_layout(mode: LayoutMode, kernels: &dyn Kernels) -> Layout {
    match mode {
        LayoutMode::Nchw => Layout::Nchw,
        LayoutMode::Nhwc => Layout::Nhwc,
        LayoutMode::Auto => kernels.preferred_layout(),
    }
}

fn check_board(width: usize, height: usize) -> Result<()> {
    let valid = 1..=MAX_BOARD_LEN;
    if !valid.contains(&width) || !valid.contains(&height) {
        return Err(BackendErr::InvalidConfig(format!(
            "board size {width}x{height} is outside 1x1..{MAX_BOARD_LEN}x{MAX_BOARD_LEN}"
        )));
    }

    Ok(())
}

impl<'a> ComputeContext<'a> {
    pub(crate) fn new(
        _runtime: &'a Runtime,
        cfg: &ContextConfig,
        model: &'a Model,
    ) -> Result<Self> {
        check_board(cfg.width, cfg.height)?;

        let kernels = kernels::for_kind(cfg.backend);
        let indices = resolve_devices(&cfg.device_indices, cfg.num_devices)?;

        let devices = indices
            .into_iter()
            .map(|index| -> Result<Device> {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(cfg.threads_per_device)
                    .thread_name(move |i| format!("nn-device{index}-worker{i}"))
                    .build()?;
                Ok(Device { index, pool })
            })
            .collect::<Result<Vec<_>>>()?;

        let precision = negotiate_precision(cfg.precision, kernels.as_ref());
        let layout = negotiate_layout(cfg.layout, kernels.as_ref());

        let ctx = Self {
            model,
            kernels,
            devices,
            num_devices: cfg.num_devices,
            width: cfg.width,
            height: cfg.height,
            precision,
            layout,
            retune_per_size: cfg.retune_per_size,
            model_tag: tuning::model_tag(model.desc()),
            tuner: Tuner::open(cfg.tuner_file.clone()),
            _runtime: PhantomData,
        };

        ctx.ensure_tuned(cfg.width, cfg.height)?;

        info!(
            backend = ctx.backend().name(),
            width = ctx.width,
            height = ctx.height,
            fp16 = precision.is_reduced(),
            nhwc = (layout == Layout::Nhwc);
            "created compute context for model {} on devices {:?}",
            model.name(),
            ctx.devices()
        );
        Ok(ctx)
    }

    pub fn model(&self) -> &'a Model {
        self.model
    }

    pub fn backend(&self) -> BackendKind {
        self.kernels.kind()
    }

    /// The indices of the devices this context runs on.
    pub fn devices(&self) -> Vec<usize> {
        self.devices.iter().map(|d| d.index).collect()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Whether activations and weights are kept in half precision.
    pub fn uses_fp16(&self) -> bool {
        self.precision.is_reduced()
    }

    /// Whether activations are laid out `(N, H, W, C)`.
    pub fn uses_nhwc(&self) -> bool {
        self.layout == Layout::Nhwc
    }

    pub(crate) fn kernels(&self) -> &dyn Kernels {
        self.kernels.as_ref()
    }

    pub(crate) fn precision(&self) -> Precision {
        self.precision
    }

    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }

    fn tune_key(&self, device: usize, width: usize, height: usize) -> TuneKey {
        TuneKey {
            backend: self.backend(),
            model: self.model_tag.clone(),
            device,
            size: self.retune_per_size.then_some((width, height)),
        }
    }

    /// Tunes every device for the given board size unless already tuned.
    ///
    /// Without per size tuning every device is tuned once and the result reused for any size.
    /// With it, sizes other than the context's own are tuned ahead of time for later contexts of
    /// the same model sharing the tuner file.
    ///
    /// # Arguments
    /// * `width` - The board width.
    /// * `height` - The board height.
    ///
    /// # Returns
    /// An error if the size is invalid or the tuner file can't be written.
    pub fn ensure_tuned(&self, width: usize, height: usize) -> Result<()> {
        check_board(width, height)?;

        for device in &self.devices {
            let key = self.tune_key(device.index, width, height);
            self.tuner.get_or_tune(key, || {
                tuning::tune(
                    self.kernels(),
                    &device.pool,
                    self.model.desc(),
                    width,
                    height,
                    self.layout,
                )
            })?;
        }

        Ok(())
    }

    /// The tuned parameters of a device for the context's board size.
    pub(crate) fn tune_params(&self, device: usize) -> TuneParams {
        self.tuner
            .get(&self.tune_key(device, self.width, self.height))
            .unwrap_or_default()
    }

    /// Finds the position of a device in `devices`, `-1` being the first one.
    pub(crate) fn device_slot(&self, index: i32) -> Result<usize> {
        let found = match index {
            -1 => Some(0),
            i if i >= 0 => self.devices.iter().position(|d| d.index == i as usize),
            _ => None,
        };

        found.ok_or(BackendErr::DeviceUnavailable {
            requested: index,
            available: self.num_devices,
        })
    }

    pub(crate) fn device(&self, slot: usize) -> &Device {
        &self.devices[slot]
    }

    /// Creates a compute handle bound to the calling thread.
    ///
    /// # Arguments
    /// * `cfg` - The configuration of the handle.
    ///
    /// # Returns
    /// The handle, or `HandleAlreadyBound` if this thread already owns one.
    pub fn create_handle(&self, cfg: &HandleConfig) -> Result<ComputeHandle<'_>> {
        ComputeHandle::new(self, cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{GemmKernels, ReferenceKernels};

    #[test]
    fn default_devices_are_resolved() {
        assert_eq!(resolve_devices(&[-1], 2).unwrap(), vec![0]);
        assert_eq!(resolve_devices(&[], 2).unwrap(), vec![0]);
        assert_eq!(resolve_devices(&[1, -1, 1, 0], 2).unwrap(), vec![1, 0]);
    }

    #[test]
    fn missing_devices_are_unavailable() {
        assert!(matches!(
            resolve_devices(&[0, 2], 2),
            Err(BackendErr::DeviceUnavailable { requested: 2, available: 2 })
        ));
        assert!(matches!(
            resolve_devices(&[-3], 2),
            Err(BackendErr::DeviceUnavailable { requested: -3, .. })
        ));
        assert!(matches!(resolve_devices(&[-1], 0), Err(BackendErr::InvalidConfig(_))));
    }

    #[test]
    fn precision_follows_the_variant() {
        let (reference, gemm) = (&ReferenceKernels as &dyn Kernels, &GemmKernels as &dyn Kernels);

        assert_eq!(negotiate_precision(PrecisionMode::PreferFp16, reference), Precision::Fp32);
        assert_eq!(negotiate_precision(PrecisionMode::PreferFp16, gemm), Precision::Fp16);
        assert_eq!(negotiate_precision(PrecisionMode::Auto, gemm), Precision::Fp32);
        assert_eq!(negotiate_precision(PrecisionMode::ForceFp32, gemm), Precision::Fp32);
    }

    #[test]
    fn automatic_layout_is_the_preferred_one() {
        assert_eq!(negotiate_layout(LayoutMode::Auto, &ReferenceKernels), Layout::Nchw);
        assert_eq!(negotiate_layout(LayoutMode::Auto, &GemmKernels), Layout::Nhwc);
        assert_eq!(negotiate_layout(LayoutMode::Nchw, &GemmKernels), Layout::Nchw);
    }

    #[test]
    fn boards_must_fit() {
        assert!(check_board(19, 19).is_ok());
        assert!(check_board(MAX_BOARD_LEN, 1).is_ok());
        assert!(check_board(0, 19).is_err());
        assert!(check_board(19, MAX_BOARD_LEN + 1).is_err());
    }
}
