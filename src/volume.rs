//! Dense single precision volumes.
//!
//! A [`Volume`] of dims `[M, N, P]` stores voxel `(x, y, z)` at `x + y*M + z*M*N`, i.e. with
//! strides `(1, M, M*N)`. The first axis is contiguous, which fixes the axis ordering of
//! the transforms in [`crate::engine::fft`] and the byte layout of raw scratch files.

use crate::error::{DeconvError, Result};
use ndarray::{Array3, ArrayView3};
use rayon::prelude::*;
use std::ops::{Index, IndexMut};

/// Extent of a volume along x, y and z.
pub type Dims = [usize; 3];

/// Number of voxels of a volume with the given dims.
pub fn voxel_count(dims: Dims) -> usize {
    dims[0] * dims[1] * dims[2]
}

/// A dense `f32` volume with strides `(1, M, M*N)`.
///
/// Volumes are moved between pipeline stages, never shared. Cloning is explicit and
/// only done where two logically distinct buffers are needed.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    dims: Dims,
    data: Vec<f32>,
}

impl Volume {
    pub fn zeros(dims: Dims) -> Volume {
        Volume::constant(dims, 0.0)
    }

    pub fn constant(dims: Dims, value: f32) -> Volume {
        Volume {
            dims,
            data: vec![value; voxel_count(dims)],
        }
    }

    /// Wraps a buffer laid out with strides `(1, M, M*N)`.
    pub fn from_vec(dims: Dims, data: Vec<f32>) -> Result<Volume> {
        if data.len() != voxel_count(dims) {
            return Err(DeconvError::Shape(format!(
                "{} values cannot form a {}x{}x{} volume",
                data.len(),
                dims[0],
                dims[1],
                dims[2]
            )));
        }
        Ok(Volume { dims, data })
    }

    pub fn from_fn<F>(dims: Dims, f: F) -> Volume
    where
        F: Fn(usize, usize, usize) -> f32,
    {
        let mut data = Vec::with_capacity(voxel_count(dims));
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    data.push(f(x, y, z));
                }
            }
        }
        Volume { dims, data }
    }

    /// Converts a C-order `(P, N, M)` array, whose memory order equals the volume layout.
    pub fn from_array(array: Array3<f32>) -> Volume {
        let (p, n, m) = array.dim();
        let data = if array.is_standard_layout() {
            array.into_iter().collect()
        } else {
            array.as_standard_layout().iter().copied().collect()
        };
        Volume {
            dims: [m, n, p],
            data,
        }
    }

    /// Views the volume as a C-order `(P, N, M)` array.
    pub fn as_array(&self) -> Result<ArrayView3<'_, f32>> {
        let [m, n, p] = self.dims;
        ArrayView3::from_shape((p, n, m), &self.data)
            .map_err(|err| DeconvError::Shape(err.to_string()))
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Linear index of voxel `(x, y, z)`.
    #[inline]
    pub fn offset(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(
            x < self.dims[0] && y < self.dims[1] && z < self.dims[2],
            "voxel ({x}, {y}, {z}) outside of {:?}",
            self.dims
        );
        x + self.dims[0] * (y + self.dims[1] * z)
    }

    /// Index of the central voxel, `((M-1)/2, (N-1)/2, (P-1)/2)`.
    pub fn center(&self) -> Dims {
        [
            (self.dims[0] - 1) / 2,
            (self.dims[1] - 1) / 2,
            (self.dims[2] - 1) / 2,
        ]
    }

    pub fn sum(&self) -> f64 {
        ordered_reduce::ordered_total(&self.data)
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f64
    }

    pub fn min(&self) -> f32 {
        self.data.par_iter().cloned().reduce(|| f32::INFINITY, f32::min)
    }

    pub fn max(&self) -> f32 {
        self.data
            .par_iter()
            .cloned()
            .reduce(|| f32::NEG_INFINITY, f32::max)
    }

    /// Scales the volume to unit sum. Volumes summing to zero are left untouched.
    pub fn normalize_sum1(&mut self) {
        let sum = self.sum();
        if sum != 0.0 {
            let inv = (1.0 / sum) as f32;
            self.scale(inv);
        }
    }

    pub fn scale(&mut self, factor: f32) {
        self.data.par_iter_mut().for_each(|v| *v *= factor);
    }

    pub fn add_scalar(&mut self, value: f32) {
        self.data.par_iter_mut().for_each(|v| *v += value);
    }

    /// Applies `f` to every voxel.
    pub fn map_inplace<F>(&mut self, f: F)
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        self.data.par_iter_mut().for_each(|v| *v = f(*v));
    }

    /// Raises every value below `floor` to `floor`.
    pub fn clamp_min(&mut self, floor: f32) {
        self.data.par_iter_mut().for_each(|v| {
            if *v < floor {
                *v = floor
            }
        });
    }

    /// `false` if any voxel is NaN or infinite.
    pub fn all_finite(&self) -> bool {
        self.data.par_iter().all(|v| v.is_finite())
    }

    /// Number of voxels exactly equal to `value`.
    pub fn count_equal(&self, value: f32) -> usize {
        self.data.par_iter().filter(|&&v| v == value).count()
    }

    /// Copies `source` into this volume with its first voxel at `origin`.
    ///
    /// # Panics
    /// If `source` does not fit at `origin`.
    pub fn insert(&mut self, source: &Volume, origin: Dims) {
        let [sm, sn, sp] = source.dims;
        assert!(
            (0..3).all(|a| origin[a] + source.dims[a] <= self.dims[a]),
            "cannot insert {:?} at {:?} into {:?}",
            source.dims,
            origin,
            self.dims
        );
        if sm == 0 {
            return;
        }
        for z in 0..sp {
            for y in 0..sn {
                let src = source.offset(0, y, z);
                let dst = self.offset(origin[0], origin[1] + y, origin[2] + z);
                self.data[dst..dst + sm].copy_from_slice(&source.data[src..src + sm]);
            }
        }
    }

    /// Copies the cuboid starting at `origin` with the given extent into a new volume.
    ///
    /// # Panics
    /// If the cuboid is not inside the volume.
    pub fn cuboid(&self, origin: Dims, extent: Dims) -> Volume {
        assert!(
            (0..3).all(|a| origin[a] + extent[a] <= self.dims[a]),
            "cuboid {:?}+{:?} outside of {:?}",
            origin,
            extent,
            self.dims
        );
        let mut out = Volume::zeros(extent);
        let [em, en, ep] = extent;
        if em == 0 {
            return out;
        }
        for z in 0..ep {
            for y in 0..en {
                let src = self.offset(origin[0], origin[1] + y, origin[2] + z);
                let dst = out.offset(0, y, z);
                out.data[dst..dst + em].copy_from_slice(&self.data[src..src + em]);
            }
        }
        out
    }

    /// The `[m, n, p]` block at the origin.
    pub fn subregion(&self, extent: Dims) -> Volume {
        self.cuboid([0, 0, 0], extent)
    }

    /// Zero pads the volume to `dims`, keeping the data at the origin.
    pub fn expand(&self, dims: Dims) -> Volume {
        let mut out = Volume::zeros(dims);
        out.insert(self, [0, 0, 0]);
        out
    }

    /// Point reflection through the center: `out(x, y, z) = in(M-1-x, N-1-y, P-1-z)`.
    pub fn flipped(&self) -> Volume {
        let [m, n, p] = self.dims;
        let mut data = vec![0.0; self.data.len()];
        data.par_chunks_mut((m * n).max(1))
            .enumerate()
            .for_each(|(z, plane)| {
                let src_z = p - 1 - z;
                for y in 0..n {
                    let src_row = (n - 1 - y + n * src_z) * m;
                    for x in 0..m {
                        plane[x + y * m] = self.data[src_row + m - 1 - x];
                    }
                }
            });
        Volume {
            dims: self.dims,
            data,
        }
    }

    /// Circular shift, voxel `(x, y, z)` moves to `(x+sx, y+sy, z+sz)` modulo the dims.
    pub fn circshift(&self, shift: [isize; 3]) -> Volume {
        let [m, n, p] = self.dims;
        if self.data.is_empty() {
            return self.clone();
        }
        let sx = shift[0].rem_euclid(m as isize) as usize;
        let sy = shift[1].rem_euclid(n as isize) as usize;
        let sz = shift[2].rem_euclid(p as isize) as usize;
        let mut data = vec![0.0; self.data.len()];
        data.par_chunks_mut(m * n).enumerate().for_each(|(z, plane)| {
            let src_z = (z + p - sz) % p;
            for y in 0..n {
                let src_y = (y + n - sy) % n;
                let src_row = (src_y + n * src_z) * m;
                let dst_row = &mut plane[y * m..(y + 1) * m];
                // rotate the row right by sx
                dst_row[sx..].copy_from_slice(&self.data[src_row..src_row + m - sx]);
                dst_row[..sx].copy_from_slice(&self.data[src_row + m - sx..src_row + m]);
            }
        });
        Volume {
            dims: self.dims,
            data,
        }
    }
}

impl Index<[usize; 3]> for Volume {
    type Output = f32;

    fn index(&self, index: [usize; 3]) -> &f32 {
        &self.data[self.offset(index[0], index[1], index[2])]
    }
}

impl IndexMut<[usize; 3]> for Volume {
    fn index_mut(&mut self, index: [usize; 3]) -> &mut f32 {
        let offset = self.offset(index[0], index[1], index[2]);
        &mut self.data[offset]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(dims: Dims) -> Volume {
        Volume::from_fn(dims, |x, y, z| (x + 10 * y + 100 * z) as f32)
    }

    #[test]
    fn test_first_axis_is_contiguous() {
        let v = ramp([4, 3, 2]);
        assert_eq!(v.as_slice()[1], 1.0);
        assert_eq!(v.as_slice()[4], 10.0);
        assert_eq!(v.as_slice()[12], 100.0);
        assert_eq!(v[[3, 2, 1]], 123.0);
    }

    #[test]
    fn test_circshift_by_axis_multiple_is_identity() {
        let v = ramp([5, 4, 3]);
        assert_eq!(v.circshift([5, -8, 6]), v);
        assert_eq!(v.circshift([0, 0, 0]), v);
    }

    #[test]
    fn test_circshift_moves_voxels() {
        let v = ramp([5, 4, 3]);
        let s = v.circshift([2, -1, 1]);
        assert_eq!(s[[2, 3, 1]], v[[0, 0, 0]]);
        assert_eq!(s[[0, 0, 0]], v[[3, 1, 2]]);
        assert_eq!(s.circshift([-2, 1, -1]), v);
    }

    #[test]
    fn test_flip_is_point_reflection() {
        let v = ramp([3, 4, 2]);
        let f = v.flipped();
        assert_eq!(f[[0, 0, 0]], v[[2, 3, 1]]);
        assert_eq!(f[[1, 2, 0]], v[[1, 1, 1]]);
        assert_eq!(f.flipped(), v);
    }

    #[test]
    fn test_insert_and_cuboid_roundtrip() {
        let small = ramp([2, 3, 2]);
        let mut big = Volume::zeros([5, 5, 4]);
        big.insert(&small, [1, 2, 1]);
        assert_eq!(big[[1, 2, 1]], small[[0, 0, 0]]);
        assert_eq!(big[[0, 0, 0]], 0.0);
        assert_eq!(big.cuboid([1, 2, 1], [2, 3, 2]), small);
        assert_eq!(small.expand([4, 4, 4]).subregion([2, 3, 2]), small);
    }

    #[test]
    fn test_normalize_and_reductions() {
        let mut v = Volume::constant([2, 2, 2], 3.0);
        v[[1, 1, 1]] = -1.0;
        assert_eq!(v.min(), -1.0);
        assert_eq!(v.max(), 3.0);
        assert_eq!(v.count_equal(3.0), 7);
        v.clamp_min(0.0);
        v.normalize_sum1();
        approx::assert_abs_diff_eq!(v.sum(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_array_conversion_keeps_memory_order() {
        let v = ramp([4, 3, 2]);
        let array = v.as_array().unwrap().to_owned();
        assert_eq!(array.dim(), (2, 3, 4));
        assert_eq!(array[[1, 2, 3]], v[[3, 2, 1]]);
        assert_eq!(Volume::from_array(array), v);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(Volume::from_vec([2, 2, 2], vec![0.0; 7]).is_err());
        assert!(Volume::from_vec([2, 2, 2], vec![0.0; 8]).is_ok());
    }

    #[test]
    fn test_non_finite_detection() {
        let mut v = Volume::zeros([3, 3, 3]);
        assert!(v.all_finite());
        v[[1, 1, 1]] = f32::NAN;
        assert!(!v.all_finite());
    }
}
