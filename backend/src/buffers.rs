use model::Model;

use crate::{BackendErr, Result, symmetry::Symmetry};

/// Host side staging memory for a batch of positions.
///
/// Slot `n` of each buffer is a disjoint area of one allocation, so several producers can fill
/// different slots and the whole batch is handed to `evaluate` without copies.
#[derive(Debug, Clone)]
pub struct InputBuffers {
    max_batch_size: usize,
    width: usize,
    height: usize,
    spatial_len: usize,
    global_len: usize,
    spatial: Vec<f32>,
    global: Vec<f32>,
    symmetries: [bool; 3],
}

impl InputBuffers {
    /// Allocates zeroed buffers for `max_batch_size` positions of the given board size.
    ///
    /// # Arguments
    /// * `model` - The model the inputs are meant for, it fixes the amount of features.
    /// * `max_batch_size` - Amount of slots.
    /// * `width` - The board width.
    /// * `height` - The board height.
    ///
    /// # Returns
    /// The buffers, or `InvalidConfig` if any size is zero.
    pub fn new(model: &Model, max_batch_size: usize, width: usize, height: usize) -> Result<Self> {
        if max_batch_size == 0 || width == 0 || height == 0 {
            return Err(BackendErr::InvalidConfig(format!(
                "input buffers need a positive batch and board size, \
                 got batch {max_batch_size} of {width}x{height}"
            )));
        }

        let spatial_len = model.num_input_channels() * width * height;
        let global_len = model.num_input_global_channels();

        Ok(Self {
            max_batch_size,
            width,
            height,
            spatial_len,
            global_len,
            spatial: vec![0.0; max_batch_size * spatial_len],
            global: vec![0.0; max_batch_size * global_len],
            symmetries: [false; 3],
        })
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Amount of spatial features per slot, `C * H * W`.
    pub fn spatial_len(&self) -> usize {
        self.spatial_len
    }

    /// Amount of global features per slot.
    pub fn global_len(&self) -> usize {
        self.global_len
    }

    fn check_slot(&self, n: usize) {
        assert!(
            n < self.max_batch_size,
            "slot {n} out of range for a batch of {}",
            self.max_batch_size
        );
    }

    /// The spatial features of slot `n`.
    ///
    /// # Panics
    /// If `n` isn't smaller than the max batch size.
    pub fn spatial_slot_mut(&mut self, n: usize) -> &mut [f32] {
        self.check_slot(n);
        let len = self.spatial_len;
        &mut self.spatial[n * len..(n + 1) * len]
    }

    /// The global features of slot `n`.
    ///
    /// # Panics
    /// If `n` isn't smaller than the max batch size.
    pub fn global_slot_mut(&mut self, n: usize) -> &mut [f32] {
        self.check_slot(n);
        let len = self.global_len;
        &mut self.global[n * len..(n + 1) * len]
    }

    pub fn spatial_slot(&self, n: usize) -> &[f32] {
        self.check_slot(n);
        &self.spatial[n * self.spatial_len..(n + 1) * self.spatial_len]
    }

    pub fn global_slot(&self, n: usize) -> &[f32] {
        self.check_slot(n);
        &self.global[n * self.global_len..(n + 1) * self.global_len]
    }

    /// The `[flip_y, flip_x, transpose]` selector applied to the whole batch.
    pub fn symmetries_mut(&mut self) -> &mut [bool; 3] {
        &mut self.symmetries
    }

    pub fn symmetries(&self) -> [bool; 3] {
        self.symmetries
    }

    pub(crate) fn symmetry(&self) -> Symmetry {
        Symmetry::from_flags(self.symmetries)
    }

    /// The spatial features of the first `n` slots.
    pub(crate) fn spatial_prefix(&self, n: usize) -> &[f32] {
        &self.spatial[..n * self.spatial_len]
    }

    /// The global features of the first `n` slots.
    pub(crate) fn global_prefix(&self, n: usize) -> &[f32] {
        &self.global[..n * self.global_len]
    }

    /// Zeroes every slot and resets the symmetry.
    pub fn clear(&mut self) {
        self.spatial.fill(0.0);
        self.global.fill(0.0);
        self.symmetries = [false; 3];
    }
}

#[cfg(test)]
mod tests {
    use model::synth::{SynthConfig, random_model};

    use super::*;

    fn model() -> Model {
        Model::new(random_model(&SynthConfig::default(), 0)).unwrap()
    }

    #[test]
    fn slots_are_disjoint() {
        let model = model();
        let mut buffers = InputBuffers::new(&model, 3, 5, 4).unwrap();
        assert_eq!(buffers.spatial_len(), 6 * 5 * 4);
        assert_eq!(buffers.global_len(), 4);

        for n in 0..3 {
            buffers.spatial_slot_mut(n).fill(n as f32 + 1.0);
            buffers.global_slot_mut(n).fill(-(n as f32) - 1.0);
        }

        for n in 0..3 {
            assert!(buffers.spatial_slot(n).iter().all(|&v| v == n as f32 + 1.0));
            assert!(buffers.global_slot(n).iter().all(|&v| v == -(n as f32) - 1.0));
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn slots_past_the_batch_panic() {
        let model = model();
        let mut buffers = InputBuffers::new(&model, 2, 5, 5).unwrap();
        buffers.spatial_slot_mut(2);
    }

    #[test]
    fn empty_batches_are_rejected() {
        assert!(matches!(
            InputBuffers::new(&model(), 0, 19, 19),
            Err(BackendErr::InvalidConfig(_))
        ));
    }

    #[test]
    fn clearing_resets_everything() {
        let model = model();
        let mut buffers = InputBuffers::new(&model, 1, 3, 3).unwrap();
        buffers.spatial_slot_mut(0)[4] = 1.0;
        buffers.symmetries_mut()[2] = true;

        buffers.clear();
        assert!(buffers.spatial_slot(0).iter().all(|&v| v == 0.0));
        assert_eq!(buffers.symmetries(), [false; 3]);
    }
}
