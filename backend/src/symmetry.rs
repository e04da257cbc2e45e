use ndarray::{ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4};

/// One of the eight board symmetries.
///
/// Applied to a board it first mirrors columns, then rows and finally transposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Symmetry {
    pub flip_y: bool,
    pub flip_x: bool,
    pub transpose: bool,
}

impl Symmetry {
    /// Every symmetry, the identity first.
    pub const ALL: [Symmetry; 8] = {
        let mut all = [Symmetry {
            flip_y: false,
            flip_x: false,
            transpose: false,
        }; 8];

        let mut i = 0;
        while i < 8 {
            all[i] = Symmetry::from_flags([i & 1 != 0, i & 2 != 0, i & 4 != 0]);
            i += 1;
        }
        all
    };

    /// Builds a symmetry from the `[flip_y, flip_x, transpose]` selector of an input batch.
    pub const fn from_flags(flags: [bool; 3]) -> Self {
        Self {
            flip_y: flags[0],
            flip_x: flags[1],
            transpose: flags[2],
        }
    }

    pub const fn flags(self) -> [bool; 3] {
        [self.flip_y, self.flip_x, self.transpose]
    }

    pub fn is_identity(self) -> bool {
        !(self.flip_y || self.flip_x || self.transpose)
    }

    /// The `(height, width)` of an `h x w` board after this symmetry.
    pub fn output_dims(self, h: usize, w: usize) -> (usize, usize) {
        if self.transpose { (w, h) } else { (h, w) }
    }

    /// Where the cell `(y, x)` of an `h x w` board ends up.
    #[inline]
    pub fn map(self, y: usize, x: usize, h: usize, w: usize) -> (usize, usize) {
        let y = if self.flip_y { h - 1 - y } else { y };
        let x = if self.flip_x { w - 1 - x } else { x };
        if self.transpose { (x, y) } else { (y, x) }
    }

    /// Writes the transformed `src` plane into `dst`.
    ///
    /// # Arguments
    /// * `src` - An `(H, W)` plane.
    /// * `dst` - The `output_dims(H, W)` plane to write.
    pub fn apply_plane(self, src: ArrayView2<'_, f32>, mut dst: ArrayViewMut2<'_, f32>) {
        let (h, w) = src.dim();
        debug_assert_eq!(dst.dim(), self.output_dims(h, w));

        for y in 0..h {
            for x in 0..w {
                let (ty, tx) = self.map(y, x, h, w);
                dst[[ty, tx]] = src[[y, x]];
            }
        }
    }

    /// Undoes this symmetry, the inverse of `apply_plane`.
    ///
    /// # Arguments
    /// * `src` - A transformed plane, of dims `output_dims(H, W)`.
    /// * `dst` - The `(H, W)` plane to write back in the original orientation.
    pub fn invert_plane(self, src: ArrayView2<'_, f32>, mut dst: ArrayViewMut2<'_, f32>) {
        let (h, w) = dst.dim();
        debug_assert_eq!(src.dim(), self.output_dims(h, w));

        for y in 0..h {
            for x in 0..w {
                let (ty, tx) = self.map(y, x, h, w);
                dst[[y, x]] = src[[ty, tx]];
            }
        }
    }

    /// Transforms every plane of a logical `(N, C, H, W)` tensor.
    pub fn apply(self, src: ArrayView4<'_, f32>, mut dst: ArrayViewMut4<'_, f32>) {
        if self.is_identity() {
            dst.assign(&src);
            return;
        }

        for (src, mut dst) in src.outer_iter().zip(dst.outer_iter_mut()) {
            for (src, dst) in src.outer_iter().zip(dst.outer_iter_mut()) {
                self.apply_plane(src, dst);
            }
        }
    }

    /// Undoes `apply` on every plane of a logical `(N, C, H', W')` tensor.
    pub fn invert(self, src: ArrayView4<'_, f32>, mut dst: ArrayViewMut4<'_, f32>) {
        if self.is_identity() {
            dst.assign(&src);
            return;
        }

        for (src, mut dst) in src.outer_iter().zip(dst.outer_iter_mut()) {
            for (src, dst) in src.outer_iter().zip(dst.outer_iter_mut()) {
                self.invert_plane(src, dst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;

    use super::*;

    fn board() -> Array2<f32> {
        Array2::from_shape_fn((2, 3), |(y, x)| (y * 3 + x) as f32)
    }

    #[test]
    fn every_symmetry_is_distinct() {
        let all: std::collections::HashSet<_> = Symmetry::ALL.into_iter().collect();
        assert_eq!(all.len(), 8);
        assert!(Symmetry::ALL[0].is_identity());
    }

    #[test]
    fn flips_happen_before_the_transpose() {
        let sym = Symmetry::from_flags([false, true, true]);
        let src = board();
        let mut dst = Array2::zeros(sym.output_dims(2, 3));
        sym.apply_plane(src.view(), dst.view_mut());

        // mirrored columns: [[2, 1, 0], [5, 4, 3]], then transposed
        assert_eq!(dst, ndarray::array![[2.0, 5.0], [1.0, 4.0], [0.0, 3.0]]);
    }

    #[test]
    fn inverting_restores_the_plane() {
        let src = board();
        for sym in Symmetry::ALL {
            let mut moved = Array2::zeros(sym.output_dims(2, 3));
            sym.apply_plane(src.view(), moved.view_mut());

            let mut back = Array2::zeros((2, 3));
            sym.invert_plane(moved.view(), back.view_mut());
            assert_eq!(back, src, "{sym:?}");
        }
    }
}
