//! Out-of-core processing of large volumes.
//!
//! The volume is split along X and Y into tiles whose interiors are disjoint and cover the
//! whole volume. Each tile is processed together with a halo of `padding` voxels, but only
//! its interior is written back, so that results near the tile seams match a whole-volume
//! run. Z is never split.

use crate::context::ExecutionContext;
use crate::error::{DeconvError, Result};
use crate::io::RawScratch;
use crate::psf;
use crate::volume::{Dims, Volume};

/// A sub-volume in global coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Origin of the cuboid that is read and processed, halo included.
    pub padded_origin: Dims,
    pub padded_extent: Dims,
    /// Origin of the part of the result that is kept.
    pub interior_origin: Dims,
    pub interior_extent: Dims,
}

impl Tile {
    /// Position of the interior inside the padded cuboid.
    pub fn interior_offset(&self) -> Dims {
        [0, 1, 2].map(|a| self.interior_origin[a] - self.padded_origin[a])
    }

    pub fn contains(&self, voxel: Dims) -> bool {
        (0..3).all(|a| {
            voxel[a] >= self.interior_origin[a]
                && voxel[a] < self.interior_origin[a] + self.interior_extent[a]
        })
    }
}

/// `parts` nearly equal intervals `[k X / parts, (k+1) X / parts)` of `0..len`.
fn split_axis(len: usize, parts: usize) -> Vec<(usize, usize)> {
    (0..parts)
        .map(|k| (k * len / parts, (k + 1) * len / parts))
        .collect()
}

/// Splits a volume of `dims` into tiles.
///
/// # Arguments
/// - `dims`: Size of the whole volume.
/// - `max_size`: Largest interior extent along X and Y. Each of the two axes is split into
///   `ceil(X / max_size)` parts.
/// - `padding`: Halo added on each side in X and Y, clamped to the volume.
///
/// # Returns
/// Tiles ordered with X varying fastest, or a `Configuration` error if `max_size` is 0 or
/// the volume would fit into a single tile.
pub fn partition(dims: Dims, max_size: usize, padding: usize) -> Result<Vec<Tile>> {
    if max_size == 0 {
        return Err(DeconvError::Configuration(
            "the maximum tile size must be positive".to_string(),
        ));
    }
    let [m, n, p] = dims;
    let xs = split_axis(m, m.div_ceil(max_size));
    let ys = split_axis(n, n.div_ceil(max_size));
    if xs.len() * ys.len() <= 1 {
        return Err(DeconvError::Configuration(format!(
            "a volume of {dims:?} fits into a single tile of {max_size}, tiling is not needed"
        )));
    }
    let mut tiles = Vec::with_capacity(xs.len() * ys.len());
    for &(y0, y1) in &ys {
        for &(x0, x1) in &xs {
            let px0 = x0.saturating_sub(padding);
            let px1 = (x1 + padding).min(m);
            let py0 = y0.saturating_sub(padding);
            let py1 = (y1 + padding).min(n);
            tiles.push(Tile {
                padded_origin: [px0, py0, 0],
                padded_extent: [px1 - px0, py1 - py0, p],
                interior_origin: [x0, y0, 0],
                interior_extent: [x1 - x0, y1 - y0, p],
            });
        }
    }
    Ok(tiles)
}

/// Crops a copy of a prepared PSF to what a tile can use and renormalises it.
pub fn tile_psf(psf: &Volume, tile: &Tile, ctx: &ExecutionContext) -> Result<Volume> {
    let mut cropped = psf::autocrop_by_image(psf.clone(), tile.padded_extent, ctx);
    psf::normalize(&mut cropped)?;
    Ok(cropped)
}

/// Runs `processor` on every tile and writes the interiors of its results to `output`.
///
/// Tiles are processed one after the other. The processor receives the padded cuboid read
/// from `source` and must return a volume of the same dims.
pub fn run_tiled<F>(
    tiles: &[Tile],
    source: &mut RawScratch,
    output: &mut RawScratch,
    ctx: &ExecutionContext,
    mut processor: F,
) -> Result<()>
where
    F: FnMut(&Tile, Volume) -> Result<Volume>,
{
    if source.dims() != output.dims() {
        return Err(DeconvError::Shape(format!(
            "tiling {:?} into an output of {:?}",
            source.dims(),
            output.dims()
        )));
    }
    for (i, tile) in tiles.iter().enumerate() {
        ctx.info(&format!(
            "Tile {}/{}: {:?} at {:?}",
            i + 1,
            tiles.len(),
            tile.padded_extent,
            tile.padded_origin
        ));
        let block = source.read_cuboid(tile.padded_origin, tile.padded_extent)?;
        let result = processor(tile, block)?;
        if result.dims() != tile.padded_extent {
            return Err(DeconvError::Shape(format!(
                "tile processor returned {:?} for a tile of {:?}",
                result.dims(),
                tile.padded_extent
            )));
        }
        let interior = result.cuboid(tile.interior_offset(), tile.interior_extent);
        output.write_cuboid(tile.interior_origin, &interior)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeconvConfig, IterationPolicy, MethodKind};
    use crate::methods::deconvolve;

    #[test]
    fn test_partition_rejects_degenerate_requests() {
        assert!(matches!(
            partition([10, 10, 3], 0, 2),
            Err(DeconvError::Configuration(_))
        ));
        assert!(matches!(
            partition([10, 10, 3], 10, 2),
            Err(DeconvError::Configuration(_))
        ));
    }

    #[test]
    fn test_partition_covers_volume_exactly_once() {
        for (dims, max, padding) in [
            ([10, 7, 2], 4, 2),
            ([33, 5, 1], 16, 20),
            ([100, 101, 3], 30, 0),
        ] {
            let tiles = partition(dims, max, padding).unwrap();
            assert_eq!(
                tiles.len(),
                dims[0].div_ceil(max) * dims[1].div_ceil(max)
            );
            for z in 0..dims[2] {
                for y in 0..dims[1] {
                    for x in 0..dims[0] {
                        let owners = tiles.iter().filter(|t| t.contains([x, y, z])).count();
                        assert_eq!(owners, 1, "voxel {:?}", [x, y, z]);
                    }
                }
            }
            for t in &tiles {
                assert!(t.interior_extent[0] <= max && t.interior_extent[1] <= max);
                for a in 0..3 {
                    assert!(t.padded_origin[a] <= t.interior_origin[a]);
                    assert!(t.padded_origin[a] + t.padded_extent[a] <= dims[a]);
                    assert!(
                        t.interior_origin[a] + t.interior_extent[a]
                            <= t.padded_origin[a] + t.padded_extent[a]
                    );
                }
            }
        }
    }

    #[test]
    fn test_partition_order_is_x_fastest() {
        let tiles = partition([8, 8, 1], 4, 1).unwrap();
        let origins: Vec<_> = tiles.iter().map(|t| t.interior_origin).collect();
        assert_eq!(
            origins,
            vec![[0, 0, 0], [4, 0, 0], [0, 4, 0], [4, 4, 0]]
        );
        assert_eq!(tiles[0].padded_extent, [5, 5, 1]);
        assert_eq!(tiles[3].padded_origin, [3, 3, 0]);
    }

    #[test]
    fn test_every_voxel_written_by_its_owner() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new(1).unwrap();
        let dims = [11, 9, 2];
        let tiles = partition(dims, 4, 3).unwrap();
        let mut source =
            RawScratch::from_volume(&dir.path().join("in.raw"), &Volume::zeros(dims)).unwrap();
        let mut output = RawScratch::create_zeroed(&dir.path().join("out.raw"), dims).unwrap();

        let mut calls = 0;
        run_tiled(&tiles, &mut source, &mut output, &ctx, |tile, block| {
            calls += 1;
            let index = tiles.iter().position(|t| t == tile).unwrap();
            Ok(Volume::constant(block.dims(), (index + 1) as f32))
        })
        .unwrap();
        assert_eq!(calls, tiles.len());

        let result = output.read_all().unwrap();
        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    let owner = tiles.iter().position(|t| t.contains([x, y, z])).unwrap();
                    assert_eq!(result[[x, y, z]], (owner + 1) as f32);
                }
            }
        }
    }

    #[test]
    fn test_processor_must_keep_dims() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new(1).unwrap();
        let dims = [8, 8, 1];
        let tiles = partition(dims, 4, 1).unwrap();
        let mut source =
            RawScratch::from_volume(&dir.path().join("in.raw"), &Volume::zeros(dims)).unwrap();
        let mut output = RawScratch::create_zeroed(&dir.path().join("out.raw"), dims).unwrap();
        let result = run_tiled(&tiles, &mut source, &mut output, &ctx, |_, _| {
            Ok(Volume::zeros([1, 1, 1]))
        });
        assert!(matches!(result, Err(DeconvError::Shape(_))));
    }

    /// Squared relative difference between a tiled and a whole-volume run of three
    /// Richardson-Lucy iterations with a PSF of radius 2 in X and Y.
    fn tiled_difference(padding: usize) -> f64 {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new(2).unwrap();
        let dims = [32, 32, 4];
        let image = Volume::from_fn(dims, |x, y, z| {
            let bump = |c: f32, w: f32, v: usize| (-(v as f32 - c).powi(2) / w).exp();
            100.0
                + 500.0 * bump(10.0, 8.0, x) * bump(12.0, 8.0, y) * bump(1.5, 2.0, z)
                + 300.0 * bump(20.0, 4.0, x) * bump(22.0, 6.0, y)
        });
        let mut psf = Volume::from_fn([5, 5, 3], |x, y, z| {
            let d2 = (x as f32 - 2.0).powi(2) + (y as f32 - 2.0).powi(2);
            (-d2 / 2.0 - (z as f32 - 1.0).powi(2)).exp()
        });
        psf.normalize_sum1();
        let config = DeconvConfig {
            policy: IterationPolicy::Fixed(3),
            method: MethodKind::RichardsonLucy,
            ..Default::default()
        };

        let whole = deconvolve(&image, &psf, &config, &ctx).unwrap().unwrap();

        let tiles = partition(dims, 16, padding).unwrap();
        let mut source = RawScratch::from_volume(&dir.path().join("in.raw"), &image).unwrap();
        let mut output = RawScratch::create_zeroed(&dir.path().join("out.raw"), dims).unwrap();
        run_tiled(&tiles, &mut source, &mut output, &ctx, |tile, block| {
            let psf = tile_psf(&psf, tile, &ctx)?;
            deconvolve(&block, &psf, &config, &ctx)?
                .ok_or_else(|| DeconvError::Psf("not centered".to_string()))
        })
        .unwrap();
        let tiled = output.read_all().unwrap();

        let (mut diff, mut norm) = (0.0f64, 0.0f64);
        for (a, b) in whole.as_slice().iter().zip(tiled.as_slice()) {
            diff += ((a - b) as f64).powi(2);
            norm += (*a as f64).powi(2);
        }
        diff / norm
    }

    #[test]
    fn test_tiled_matches_whole_volume_in_interiors() {
        // three iterations reach 2 + 4 + 4 voxels in from the halo edge
        let error = tiled_difference(12);
        assert!(error < 1e-8, "relative error {error}");
    }

    #[test]
    fn test_halo_below_psf_radius_changes_the_result() {
        let padded = tiled_difference(12);
        let error = tiled_difference(0);
        assert!(error > 1e-8, "relative error {error}");
        assert!(error > padded);
    }
}
