//! NIfTI volumes and their voxel grids.
//!
//! Arrays are kept in NIfTI index order `(i, j, k[, t])`; the voxel-to-world
//! affine comes from the sform when present, then the qform, then `pixdim`.

use std::fmt;
use std::path::Path;

use nalgebra::{Matrix3, Matrix4, Point3};
use ndarray::{Array3, Array4, ArrayView3, ArrayViewMut3, Axis, Ix3, Ix4, Zip};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::error::{PipelineError, Result};

/// `NiftiHeader` is a large stack object; keep it boxed so volumes move cheaply.
type BoxedHeader = Box<NiftiHeader>;

/// Tolerance (mm) used when comparing two affines.
const AFFINE_TOLERANCE: f64 = 1e-3;

/// Shape and voxel-to-world affine of a 3-D volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub shape: [usize; 3],
    pub affine: Matrix4<f64>,
}

impl Grid {
    pub fn new(shape: [usize; 3], affine: Matrix4<f64>) -> Self {
        Self { shape, affine }
    }

    pub fn same_as(&self, other: &Grid) -> bool {
        self.shape == other.shape
            && self
                .affine
                .iter()
                .zip(other.affine.iter())
                .all(|(a, b)| (a - b).abs() <= AFFINE_TOLERANCE)
    }

    pub fn ensure_same(&self, other: &Grid) -> Result<()> {
        if self.same_as(other) {
            Ok(())
        } else {
            Err(PipelineError::GridMismatch {
                expected: self.to_string(),
                found: other.to_string(),
            })
        }
    }

    #[inline]
    pub fn voxel_to_world(&self, (i, j, k): (f64, f64, f64)) -> Point3<f64> {
        self.affine.transform_point(&Point3::new(i, j, k))
    }

    /// Volume of one voxel in mm³.
    pub fn voxel_volume(&self) -> f64 {
        self.affine.fixed_view::<3, 3>(0, 0).clone_owned().determinant().abs()
    }
}

impl fmt::Display for Grid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x, y, z] = self.shape;
        let origin = self.affine.column(3);
        write!(
            f,
            "{x}x{y}x{z} voxels, origin ({:.2}, {:.2}, {:.2}), voxel {:.3} mm³",
            origin[0],
            origin[1],
            origin[2],
            self.voxel_volume()
        )
    }
}

/// Voxel-to-world affine of a header.
pub fn header_affine(h: &NiftiHeader) -> Matrix4<f64> {
    if h.sform_code > 0 {
        let rows = [h.srow_x, h.srow_y, h.srow_z];
        let mut m = Matrix4::identity();
        for (r, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                m[(r, c)] = *v as f64;
            }
        }
        return m;
    }

    let [_, dx, dy, dz, ..] = h.pixdim;
    let (dx, dy, dz) = (dx as f64, dy as f64, dz as f64);

    if h.qform_code > 0 {
        let (b, c, d) = (h.quatern_b as f64, h.quatern_c as f64, h.quatern_d as f64);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let rotation = Matrix3::new(
            a * a + b * b - c * c - d * d,
            2.0 * (b * c - a * d),
            2.0 * (b * d + a * c),
            2.0 * (b * c + a * d),
            a * a + c * c - b * b - d * d,
            2.0 * (c * d - a * b),
            2.0 * (b * d - a * c),
            2.0 * (c * d + a * b),
            a * a + d * d - c * c - b * b,
        );
        let qfac = if h.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let scaled = rotation * Matrix3::from_diagonal(&nalgebra::Vector3::new(dx, dy, qfac * dz));
        let mut m = scaled.to_homogeneous();
        m[(0, 3)] = h.quatern_x as f64;
        m[(1, 3)] = h.quatern_y as f64;
        m[(2, 3)] = h.quatern_z as f64;
        return m;
    }

    let safe = |v: f64| if v > 0.0 { v } else { 1.0 };
    Matrix4::new_nonuniform_scaling(&nalgebra::Vector3::new(safe(dx), safe(dy), safe(dz)))
}

fn header_from_affine(shape: &[usize], affine: &Matrix4<f64>) -> NiftiHeader {
    let mut header = NiftiHeader::default();
    header.dim = [0; 8];
    header.dim[0] = shape.len() as u16;
    for (slot, len) in header.dim.iter_mut().skip(1).zip(shape) {
        *slot = *len as u16;
    }
    header.sform_code = 1;
    header.qform_code = 0;
    let rows = [&mut header.srow_x, &mut header.srow_y, &mut header.srow_z];
    for (r, row) in rows.into_iter().enumerate() {
        for (c, v) in row.iter_mut().enumerate() {
            *v = affine[(r, c)] as f32;
        }
    }
    header.pixdim = [1.0; 8];
    for axis in 0..3 {
        header.pixdim[axis + 1] = affine.fixed_view::<3, 1>(0, axis).norm() as f32;
    }
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    // mm + seconds
    header.xyzt_units = 2 | 8;
    header
}

fn read_ndarray(path: &Path) -> Result<(BoxedHeader, ndarray::ArrayD<f32>)> {
    let obj = ReaderOptions::new().read_file(path)?;
    let mut header = Box::new(obj.header().clone());
    let data = obj.into_volume().into_ndarray::<f32>()?;
    // Intensities are already rescaled by the reader.
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;
    Ok((header, data))
}

fn shape_error(path: &Path, wanted: &str, shape: &[usize]) -> PipelineError {
    PipelineError::GridMismatch {
        expected: format!("{wanted} volume at {}", path.display()),
        found: format!("shape {shape:?}"),
    }
}

/// A 3-D scalar volume (intensities or labels stored as `f32`).
#[derive(Debug, Clone)]
pub struct Volume {
    header: BoxedHeader,
    data: Array3<f32>,
}

impl Volume {
    /// Open a `.nii` / `.nii.gz` file. A 4-D file with a single frame is accepted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (header, data) = read_ndarray(path)?;
        let shape = data.shape().to_vec();
        let data = match shape.len() {
            3 => data
                .into_dimensionality::<Ix3>()
                .map_err(|_| shape_error(path, "3-D", &shape))?,
            4 if shape[3] == 1 => data
                .into_dimensionality::<Ix4>()
                .map_err(|_| shape_error(path, "3-D", &shape))?
                .index_axis_move(Axis(3), 0),
            _ => return Err(shape_error(path, "3-D", &shape)),
        };
        Ok(Self { header, data })
    }

    pub fn from_array(data: Array3<f32>, affine: Matrix4<f64>) -> Self {
        let header = Box::new(header_from_affine(data.shape(), &affine));
        Self { header, data }
    }

    /// A volume on the same grid carrying new voxel values.
    pub fn with_data(&self, data: Array3<f32>) -> Result<Self> {
        if data.shape() != self.data.shape() {
            return Err(PipelineError::GridMismatch {
                expected: format!("shape {:?}", self.data.shape()),
                found: format!("shape {:?}", data.shape()),
            });
        }
        Ok(Self {
            header: self.header.clone(),
            data,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        WriterOptions::new(path.as_ref())
            .reference_header(&self.header)
            .write_nifti(&self.data)?;
        Ok(())
    }

    #[inline]
    pub fn data(&self) -> ArrayView3<'_, f32> {
        self.data.view()
    }

    #[inline]
    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, f32> {
        self.data.view_mut()
    }

    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        let s = self.data.shape();
        [s[0], s[1], s[2]]
    }

    #[inline]
    pub fn affine(&self) -> Matrix4<f64> {
        header_affine(&self.header)
    }

    pub fn grid(&self) -> Grid {
        Grid::new(self.shape(), self.affine())
    }

    /// Label id stored at `idx` (labels are stored as floats and rounded).
    #[inline]
    pub fn label_at(&self, idx: (usize, usize, usize)) -> i32 {
        self.data[idx].round() as i32
    }

    /// Sorted set of distinct label values, background included.
    pub fn distinct_labels(&self) -> Vec<i32> {
        let mut labels: Vec<i32> = self.data.iter().map(|v| v.round() as i32).collect();
        labels.sort_unstable();
        labels.dedup();
        labels
    }
}

/// A 4-D series; the last axis indexes frames.
#[derive(Debug, Clone)]
pub struct Volume4 {
    header: BoxedHeader,
    data: Array4<f32>,
}

impl Volume4 {
    /// Open a 4-D series. A 3-D file is read as a single frame.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (header, data) = read_ndarray(path)?;
        let shape = data.shape().to_vec();
        let data = match shape.len() {
            3 => data
                .into_dimensionality::<Ix3>()
                .map_err(|_| shape_error(path, "4-D", &shape))?
                .insert_axis(Axis(3)),
            4 => data
                .into_dimensionality::<Ix4>()
                .map_err(|_| shape_error(path, "4-D", &shape))?,
            _ => return Err(shape_error(path, "4-D", &shape)),
        };
        Ok(Self { header, data })
    }

    pub fn from_array(data: Array4<f32>, affine: Matrix4<f64>) -> Self {
        let header = Box::new(header_from_affine(data.shape(), &affine));
        Self { header, data }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        WriterOptions::new(path.as_ref())
            .reference_header(&self.header)
            .write_nifti(&self.data)?;
        Ok(())
    }

    #[inline]
    pub fn n_frames(&self) -> usize {
        self.data.shape()[3]
    }

    /// The 3-D sub-volume of frame `t`. Panics when `t` is out of range.
    #[inline]
    pub fn frame(&self, t: usize) -> ArrayView3<'_, f32> {
        self.data.index_axis(Axis(3), t)
    }

    pub fn grid(&self) -> Grid {
        let s = self.data.shape();
        Grid::new([s[0], s[1], s[2]], header_affine(&self.header))
    }

    /// Frame average weighted by `weights` (one per frame).
    pub fn weighted_mean(&self, weights: &[f64]) -> Result<Volume> {
        if weights.len() != self.n_frames() {
            return Err(PipelineError::FrameCountMismatch {
                volumes: self.n_frames(),
                declared: weights.len(),
            });
        }
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(PipelineError::FrameMetadata(
                "frame weights must sum to a positive value".into(),
            ));
        }
        let grid = self.grid();
        let mut acc = Array3::<f32>::zeros(grid.shape);
        for (t, w) in weights.iter().enumerate() {
            let w = (*w / total) as f32;
            Zip::from(&mut acc)
                .and(&self.frame(t))
                .for_each(|a, &v| *a += w * v);
        }
        Ok(Volume::from_array(acc, grid.affine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn shifted(origin: [f64; 3], spacing: f64) -> Matrix4<f64> {
        let mut m = Matrix4::identity() * spacing;
        m[(3, 3)] = 1.0;
        m[(0, 3)] = origin[0];
        m[(1, 3)] = origin[1];
        m[(2, 3)] = origin[2];
        m
    }

    #[test]
    fn save_and_reopen_keeps_grid_and_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vol.nii.gz");
        let data = Array3::from_shape_fn((4, 5, 6), |(i, j, k)| (i * 100 + j * 10 + k) as f32);
        let affine = shifted([-10.0, -12.0, 4.0], 2.0);
        Volume::from_array(data.clone(), affine).save(&path).unwrap();

        let reopened = Volume::open(&path).unwrap();
        assert_eq!(reopened.shape(), [4, 5, 6]);
        assert!(reopened.grid().same_as(&Grid::new([4, 5, 6], affine)));
        assert_abs_diff_eq!(reopened.data()[(3, 2, 1)], 321.0);
        assert_abs_diff_eq!(reopened.grid().voxel_volume(), 8.0, epsilon = 1e-6);
    }

    #[test]
    fn qform_affine_is_used_without_sform() {
        let mut h = NiftiHeader::default();
        h.sform_code = 0;
        h.qform_code = 1;
        h.pixdim = [1.0, 2.0, 3.0, 4.0, 1.0, 1.0, 1.0, 1.0];
        h.quatern_b = 0.0;
        h.quatern_c = 0.0;
        h.quatern_d = 0.0;
        h.quatern_x = 5.0;
        h.quatern_y = 6.0;
        h.quatern_z = 7.0;
        let m = header_affine(&h);
        assert_abs_diff_eq!(m[(0, 0)], 2.0);
        assert_abs_diff_eq!(m[(1, 1)], 3.0);
        assert_abs_diff_eq!(m[(2, 2)], 4.0);
        assert_abs_diff_eq!(m[(2, 3)], 7.0);
    }

    #[test]
    fn weighted_mean_uses_normalised_weights() {
        let mut data = Array4::<f32>::zeros((2, 2, 2, 2));
        data.index_axis_mut(Axis(3), 0).fill(1.0);
        data.index_axis_mut(Axis(3), 1).fill(4.0);
        let series = Volume4::from_array(data, Matrix4::identity());
        let mean = series.weighted_mean(&[60.0, 120.0]).unwrap();
        assert_abs_diff_eq!(mean.data()[(1, 1, 1)], 3.0, epsilon = 1e-6);

        assert!(matches!(
            series.weighted_mean(&[1.0]),
            Err(PipelineError::FrameCountMismatch { volumes: 2, declared: 1 })
        ));
    }

    #[test]
    fn distinct_labels_rounds_values() {
        let data = Array3::from_shape_vec((1, 1, 4), vec![0.0, 11.0001, 10.9999, 50.0]).unwrap();
        let vol = Volume::from_array(data, Matrix4::identity());
        assert_eq!(vol.distinct_labels(), vec![0, 11, 50]);
    }
}
