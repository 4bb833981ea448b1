//! Reading and writing volumes.
//!
//! Volumes are exchanged as `.npy` files holding a C-order `(P, N, M)` array, whose memory
//! order is the volume layout. For tiled runs the image and the result are kept in raw
//! scratch files of little-endian `f32` values, which are read and written one cuboid at a
//! time.

use crate::config::OutputFormat;
use crate::error::{DeconvError, Result};
use crate::volume::{voxel_count, Dims, Volume};
use memmap2::{Mmap, MmapMut};
use ndarray::{ArrayBase, ArrayD, ArrayViewD, ArrayViewMut3, Axis, Ix3, IxDyn, RawData};
use ndarray_npy::{
    read_npy, write_npy, write_zeroed_npy, ReadNpyError, ReadableElement, ViewElement,
    ViewMutElement, ViewMutNpyExt, ViewNpyExt, WritableElement,
};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Largest value of a 16 bit output.
const U16_MAX: f32 = 65535.0;

/// Storage backend for input and output volumes.
pub trait VolumeStore {
    /// Dims of the stored volume without reading its data.
    fn dims(&self, path: &Path) -> Result<Dims>;

    fn read_volume(&self, path: &Path) -> Result<Volume>;

    fn write_volume(&self, path: &Path, volume: &Volume, format: OutputFormat) -> Result<()>;

    /// Copies the volume at `path` into a new raw scratch file at `raw`.
    fn to_raw(&self, path: &Path, raw: &Path) -> Result<RawScratch> {
        RawScratch::from_volume(raw, &self.read_volume(path)?)
    }

    /// Writes the content of a raw scratch file to `path`.
    fn from_raw(&self, raw: &mut RawScratch, path: &Path, format: OutputFormat) -> Result<()> {
        let volume = raw.read_all()?;
        self.write_volume(path, &volume, format)
    }
}

/// Factor applied before converting to 16 bit, so that the maximum fits.
pub fn u16_scale(max: f32) -> f32 {
    if max > U16_MAX {
        U16_MAX / max
    } else {
        1.0
    }
}

fn to_u16(value: f32, scale: f32) -> u16 {
    (value * scale).round().clamp(0.0, U16_MAX) as u16
}

fn volume_dims(shape: &[usize], path: &Path) -> Result<Dims> {
    match *shape {
        [n, m] => Ok([m, n, 1]),
        [p, n, m] => Ok([m, n, p]),
        _ => Err(DeconvError::format(
            path,
            format!("expected a 2D or 3D array, found shape {shape:?}"),
        )),
    }
}

/// Treats a 2D array as a single plane.
fn into_3d<S: RawData>(array: ArrayBase<S, IxDyn>, path: &Path) -> Result<ArrayBase<S, Ix3>> {
    let array = match array.ndim() {
        2 => array.insert_axis(Axis(0)),
        3 => array,
        d => {
            return Err(DeconvError::format(
                path,
                format!("expected a 2D or 3D array, found {d} dimensions"),
            ))
        }
    };
    array
        .into_dimensionality::<Ix3>()
        .map_err(|err| DeconvError::format(path, err))
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|err| DeconvError::io(path, err))?;
    // the file is not modified while mapped
    unsafe { Mmap::map(&file) }.map_err(|err| DeconvError::io(path, err))
}

/// Shape of the mapped array if it can be viewed as elements of type `A`.
fn viewed_shape<A: ViewElement>(bytes: &[u8]) -> Option<Vec<usize>> {
    ArrayViewD::<A>::view_npy(bytes)
        .ok()
        .map(|view| view.shape().to_vec())
}

/// Reads the array as `A` and converts it, `None` if it holds another element type.
fn read_converted<A, F>(path: &Path, convert: F) -> Result<Option<ArrayD<f32>>>
where
    A: ReadableElement + Clone,
    F: Fn(A) -> f32,
{
    match read_npy::<_, ArrayD<A>>(path) {
        Ok(array) => Ok(Some(array.mapv(convert))),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(err) => Err(DeconvError::format(path, err)),
    }
}

/// Creates a zeroed `.npy` file of the scratch dims and fills it plane by plane.
fn fill_npy<A, F>(raw: &mut RawScratch, path: &Path, convert: F) -> Result<()>
where
    A: WritableElement + ViewMutElement,
    F: Fn(f32) -> A,
{
    let [m, n, p] = raw.dims();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|err| DeconvError::io(path, err))?;
    write_zeroed_npy::<A, _>(&file, Ix3(p, n, m)).map_err(|err| DeconvError::format(path, err))?;
    // the file is only accessed through this map until it is flushed
    let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|err| DeconvError::io(path, err))?;
    {
        let mut view = ArrayViewMut3::<A>::view_mut_npy(&mut map[..])
            .map_err(|err| DeconvError::format(path, err))?;
        for (z, mut target) in view.outer_iter_mut().enumerate() {
            let plane = raw.read_cuboid([0, 0, z], [m, n, 1])?;
            for (dst, &src) in target.iter_mut().zip(plane.as_slice()) {
                *dst = convert(src);
            }
        }
    }
    map.flush().map_err(|err| DeconvError::io(path, err))
}

/// `.npy` backend. Reads `f32`, `f64`, `u16` and `u8` arrays of two or three dimensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpyStore;

impl VolumeStore for NpyStore {
    fn dims(&self, path: &Path) -> Result<Dims> {
        let map = map_file(path)?;
        let shape = viewed_shape::<f32>(&map)
            .or_else(|| viewed_shape::<u16>(&map))
            .or_else(|| viewed_shape::<f64>(&map))
            .or_else(|| viewed_shape::<u8>(&map));
        match shape {
            Some(shape) => volume_dims(&shape, path),
            // byte-swapped or unaligned data cannot be viewed in place
            None => Ok(self.read_volume(path)?.dims()),
        }
    }

    fn read_volume(&self, path: &Path) -> Result<Volume> {
        let array = match read_npy::<_, ArrayD<f32>>(path) {
            Ok(array) => array,
            Err(ReadNpyError::WrongDescriptor(descr)) => {
                if let Some(array) = read_converted(path, |v: f64| v as f32)? {
                    array
                } else if let Some(array) = read_converted(path, |v: u16| v as f32)? {
                    array
                } else if let Some(array) = read_converted(path, |v: u8| v as f32)? {
                    array
                } else {
                    return Err(DeconvError::format(
                        path,
                        format!("unsupported element type {descr:?}"),
                    ));
                }
            }
            Err(err) => return Err(DeconvError::format(path, err)),
        };
        Ok(Volume::from_array(into_3d(array, path)?))
    }

    fn write_volume(&self, path: &Path, volume: &Volume, format: OutputFormat) -> Result<()> {
        let npy_err = |err: ndarray_npy::WriteNpyError| DeconvError::format(path, err);
        match format {
            OutputFormat::F32 => write_npy(path, &volume.as_array()?).map_err(npy_err),
            OutputFormat::U16 => {
                let scale = u16_scale(volume.max());
                if scale != 1.0 {
                    log::info!("scaling output by {scale} to fit 16 bit");
                }
                let array = volume.as_array()?.mapv(|v| to_u16(v, scale));
                write_npy(path, &array).map_err(npy_err)
            }
        }
    }

    fn to_raw(&self, path: &Path, raw: &Path) -> Result<RawScratch> {
        let map = map_file(path)?;
        let Ok(view) = ArrayViewD::<f32>::view_npy(&map) else {
            return RawScratch::from_volume(raw, &self.read_volume(path)?);
        };
        let view = into_3d(view, path)?;
        let (p, n, m) = view.dim();
        let mut scratch = RawScratch::create_zeroed(raw, [m, n, p])?;
        for (z, plane) in view.outer_iter().enumerate() {
            let plane = Volume::from_vec([m, n, 1], plane.iter().copied().collect())?;
            scratch.write_cuboid([0, 0, z], &plane)?;
        }
        Ok(scratch)
    }

    fn from_raw(&self, raw: &mut RawScratch, path: &Path, format: OutputFormat) -> Result<()> {
        match format {
            OutputFormat::F32 => fill_npy(raw, path, |v| v),
            OutputFormat::U16 => {
                let scale = u16_scale(raw.max()?);
                if scale != 1.0 {
                    log::info!("scaling output by {scale} to fit 16 bit");
                }
                fill_npy(raw, path, |v| to_u16(v, scale))
            }
        }
    }
}

/// Uncompressed little-endian `f32` file of a volume, with strides `(1, M, M*N)`.
#[derive(Debug)]
pub struct RawScratch {
    path: PathBuf,
    dims: Dims,
    file: File,
}

impl RawScratch {
    /// Creates a scratch file of `dims` filled with zeros.
    pub fn create_zeroed(path: &Path, dims: Dims) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| DeconvError::io(path, err))?;
        file.set_len(4 * voxel_count(dims) as u64)
            .map_err(|err| DeconvError::io(path, err))?;
        Ok(RawScratch {
            path: path.to_path_buf(),
            dims,
            file,
        })
    }

    pub fn from_volume(path: &Path, volume: &Volume) -> Result<Self> {
        let mut scratch = RawScratch::create_zeroed(path, volume.dims())?;
        scratch.write_cuboid([0, 0, 0], volume)?;
        Ok(scratch)
    }

    /// Opens an existing scratch file, which must hold exactly `dims` values.
    pub fn open(path: &Path, dims: Dims) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| DeconvError::io(path, err))?;
        let len = file
            .metadata()
            .map_err(|err| DeconvError::io(path, err))?
            .len();
        if len != 4 * voxel_count(dims) as u64 {
            return Err(DeconvError::format(
                path,
                format!("{len} bytes cannot hold a {dims:?} volume"),
            ));
        }
        Ok(RawScratch {
            path: path.to_path_buf(),
            dims,
            file,
        })
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_cuboid(&self, origin: Dims, extent: Dims) -> Result<()> {
        if (0..3).any(|a| origin[a] + extent[a] > self.dims[a]) {
            return Err(DeconvError::Shape(format!(
                "cuboid {origin:?}+{extent:?} outside of the {:?} scratch volume",
                self.dims
            )));
        }
        Ok(())
    }

    fn byte_offset(&self, x: usize, y: usize, z: usize) -> u64 {
        4 * (x + self.dims[0] * (y + self.dims[1] * z)) as u64
    }

    /// Reads the cuboid at `origin` with the given extent, one row at a time.
    pub fn read_cuboid(&mut self, origin: Dims, extent: Dims) -> Result<Volume> {
        self.check_cuboid(origin, extent)?;
        let [em, en, ep] = extent;
        let mut data = Vec::with_capacity(voxel_count(extent));
        let mut row = vec![0u8; 4 * em];
        for z in 0..ep {
            for y in 0..en {
                let offset = self.byte_offset(origin[0], origin[1] + y, origin[2] + z);
                self.file
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| self.file.read_exact(&mut row))
                    .map_err(|err| DeconvError::io(&self.path, err))?;
                data.extend(
                    row.chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                );
            }
        }
        Volume::from_vec(extent, data)
    }

    /// Writes `volume` with its first voxel at `origin`.
    pub fn write_cuboid(&mut self, origin: Dims, volume: &Volume) -> Result<()> {
        let extent = volume.dims();
        self.check_cuboid(origin, extent)?;
        let [em, en, ep] = extent;
        let mut row = Vec::with_capacity(4 * em);
        for z in 0..ep {
            for y in 0..en {
                row.clear();
                let start = volume.offset(0, y, z);
                for v in &volume.as_slice()[start..start + em] {
                    row.extend_from_slice(&v.to_le_bytes());
                }
                let offset = self.byte_offset(origin[0], origin[1] + y, origin[2] + z);
                self.file
                    .seek(SeekFrom::Start(offset))
                    .and_then(|_| self.file.write_all(&row))
                    .map_err(|err| DeconvError::io(&self.path, err))?;
            }
        }
        Ok(())
    }

    pub fn read_all(&mut self) -> Result<Volume> {
        self.read_cuboid([0, 0, 0], self.dims)
    }

    /// Largest value, read one plane at a time.
    pub fn max(&mut self) -> Result<f32> {
        let [m, n, p] = self.dims;
        let mut max = f32::NEG_INFINITY;
        for z in 0..p {
            max = max.max(self.read_cuboid([0, 0, z], [m, n, 1])?.max());
        }
        Ok(max)
    }

    /// Deletes the file. Failures are logged and otherwise ignored.
    pub fn remove(self) {
        let RawScratch { path, file, .. } = self;
        drop(file);
        if let Err(err) = std::fs::remove_file(&path) {
            log::warn!("could not remove scratch file {path:?}: {err}");
        }
    }
}
