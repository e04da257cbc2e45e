use half::f16;
use ndarray::{ArrayView4, ArrayViewMut, ArrayViewMut4, Dimension};

/// The memory order of a `(N, C, H, W)` activation tensor.
///
/// Kernels always see the logical `(N, C, H, W)` axes, an `Nhwc` buffer just gets
/// its axes permuted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Nchw,
    Nhwc,
}

/// The arithmetic precision of the activations and weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Fp32,
    Fp16,
}

/// `(N, C, H, W)`
pub type Dims = (usize, usize, usize, usize);

impl Layout {
    pub fn from_nhwc(nhwc: bool) -> Self {
        if nhwc { Layout::Nhwc } else { Layout::Nchw }
    }

    /// Views the first `n * c * h * w` elements of `data` as a logical `(N, C, H, W)` tensor.
    ///
    /// # Panics
    /// If `data` is shorter than the tensor.
    pub fn view(self, data: &[f32], (n, c, h, w): Dims) -> ArrayView4<'_, f32> {
        let data = &data[..n * c * h * w];

        // SAFETY: the slice was just cut to exactly the tensor's amount of elements.
        match self {
            Layout::Nchw => ArrayView4::from_shape((n, c, h, w), data).unwrap(),
            Layout::Nhwc => ArrayView4::from_shape((n, h, w, c), data)
                .unwrap()
                .permuted_axes([0, 3, 1, 2]),
        }
    }

    /// Mutable counterpart of `view`.
    ///
    /// # Panics
    /// If `data` is shorter than the tensor.
    pub fn view_mut(self, data: &mut [f32], (n, c, h, w): Dims) -> ArrayViewMut4<'_, f32> {
        let data = &mut data[..n * c * h * w];

        // SAFETY: the slice was just cut to exactly the tensor's amount of elements.
        match self {
            Layout::Nchw => ArrayViewMut4::from_shape((n, c, h, w), data).unwrap(),
            Layout::Nhwc => ArrayViewMut4::from_shape((n, h, w, c), data)
                .unwrap()
                .permuted_axes([0, 3, 1, 2]),
        }
    }
}

impl Precision {
    pub fn is_reduced(self) -> bool {
        self == Precision::Fp16
    }

    /// Rounds a value to what this precision can represent.
    #[inline]
    pub fn round(self, x: f32) -> f32 {
        match self {
            Precision::Fp32 => x,
            Precision::Fp16 => f16::from_f32(x).to_f32(),
        }
    }

    pub fn round_slice(self, xs: &mut [f32]) {
        if self.is_reduced() {
            xs.iter_mut().for_each(|x| *x = self.round(*x));
        }
    }

    pub fn round_array<D: Dimension>(self, mut xs: ArrayViewMut<'_, f32, D>) {
        if self.is_reduced() {
            xs.mapv_inplace(|x| self.round(x));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_layouts_agree_on_logical_indices() {
        let (n, c, h, w) = (2, 3, 2, 4);
        let nchw: Vec<f32> = (0..n * c * h * w).map(|i| i as f32).collect();

        let mut nhwc = vec![0.0; nchw.len()];
        Layout::Nhwc
            .view_mut(&mut nhwc, (n, c, h, w))
            .assign(&Layout::Nchw.view(&nchw, (n, c, h, w)));

        // channel is the fastest moving axis once stored as nhwc
        assert_eq!(nhwc[..3], [0.0, 8.0, 16.0]);
        assert_eq!(
            Layout::Nhwc.view(&nhwc, (n, c, h, w))[[1, 2, 1, 3]],
            Layout::Nchw.view(&nchw, (n, c, h, w))[[1, 2, 1, 3]]
        );
    }

    #[test]
    fn views_ignore_trailing_capacity() {
        let data = vec![1.0; 100];
        assert_eq!(Layout::Nchw.view(&data, (1, 2, 3, 4)).len(), 24);
    }

    #[test]
    fn half_rounding_is_lossy_but_close() {
        let x = 0.1f32;
        let rounded = Precision::Fp16.round(x);
        assert_ne!(rounded, x);
        assert!((rounded - x).abs() < 1e-4);
        assert_eq!(Precision::Fp32.round(x), x);
    }
}
