//! Animated GIF overlays for checking registrations by eye.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use image::codecs::gif::{GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{Delay, Frame, Rgba, RgbaImage};
use ndarray::{ArrayView3, Axis};

use crate::error::Result;
use crate::resample::{resample, Interpolator};
use crate::volume::Volume;

#[derive(Debug, Clone)]
pub struct GifOptions {
    /// Number of axial slices shown.
    pub slices: usize,
    pub frame_delay_ms: u32,
    /// Opacity of the overlay, 0..1.
    pub alpha: f32,
    /// Shortest side of the rendered frame in pixels.
    pub min_size: u32,
}

impl Default for GifOptions {
    fn default() -> Self {
        Self {
            slices: 15,
            frame_delay_ms: 200,
            alpha: 0.45,
            min_size: 256,
        }
    }
}

/// Intensity window `[low, high]` from the 1st and 99th percentile of non-zero voxels.
fn window(data: &ArrayView3<f32>) -> (f32, f32) {
    let mut values: Vec<f32> = data.iter().copied().filter(|v| v.is_finite() && *v != 0.0).collect();
    if values.is_empty() {
        return (0.0, 1.0);
    }
    values.sort_unstable_by(f32::total_cmp);
    let at = |q: f64| values[((values.len() - 1) as f64 * q).round() as usize];
    let (low, high) = (at(0.01), at(0.99));
    if high > low {
        (low, high)
    } else {
        (low, low + 1.0)
    }
}

fn scale(v: f32, (low, high): (f32, f32)) -> f32 {
    ((v - low) / (high - low)).clamp(0.0, 1.0)
}

/// Evenly spaced slice indices covering the middle 80% of the volume.
fn slice_indices(depth: usize, count: usize) -> Vec<usize> {
    if depth == 0 || count == 0 {
        return Vec::new();
    }
    let lo = depth as f64 * 0.1;
    let hi = depth as f64 * 0.9;
    let count = count.min(depth);
    let mut idx: Vec<usize> = (0..count)
        .map(|n| {
            let t = if count == 1 { 0.5 } else { n as f64 / (count - 1) as f64 };
            ((lo + t * (hi - lo)).floor() as usize).min(depth - 1)
        })
        .collect();
    idx.dedup();
    idx
}

fn render_slice(
    base: &ArrayView3<f32>,
    overlay: &ArrayView3<f32>,
    k: usize,
    windows: ((f32, f32), (f32, f32)),
    opts: &GifOptions,
) -> RgbaImage {
    let base = base.index_axis(Axis(2), k);
    let over = overlay.index_axis(Axis(2), k);
    let (nx, ny) = base.dim();

    // Rows run posterior to anterior in voxel space; flip so anterior is up.
    let mut img = RgbaImage::from_fn(nx as u32, ny as u32, |x, y| {
        let (i, j) = (x as usize, ny - 1 - y as usize);
        let grey = scale(base[(i, j)], windows.0);
        let red = scale(over[(i, j)], windows.1) * opts.alpha;
        let mix = |c: f32| ((grey * (1.0 - red) + c * red) * 255.0).round() as u8;
        Rgba([mix(1.0), mix(0.0), mix(0.0), 255])
    });

    let shortest = nx.min(ny).max(1) as u32;
    if shortest < opts.min_size {
        let factor = opts.min_size.div_ceil(shortest);
        img = imageops::resize(&img, nx as u32 * factor, ny as u32 * factor, FilterType::Nearest);
    }
    img
}

/// Write an animated GIF of `overlay` (red) over `reference` (grey).
///
/// The overlay is resampled onto the reference grid when the grids differ.
pub fn volume_to_gif(reference: &Path, overlay: &Path, out: &Path, opts: &GifOptions) -> Result<()> {
    let base = Volume::open(reference)?;
    let mut over = Volume::open(overlay)?;
    let grid = base.grid();
    if !grid.same_as(&over.grid()) {
        over = resample(&over, &grid, &[], Interpolator::Linear)?;
    }

    let (b, o) = (base.data(), over.data());
    let windows = (window(&b), window(&o));
    let delay = Delay::from_numer_denom_ms(opts.frame_delay_ms, 1);
    let frames: Vec<Frame> = slice_indices(grid.shape[2], opts.slices)
        .into_iter()
        .map(|k| Frame::from_parts(render_slice(&b, &o, k, windows, opts), 0, 0, delay))
        .collect();

    let mut encoder = GifEncoder::new(BufWriter::new(File::create(out)?));
    encoder.set_repeat(Repeat::Infinite)?;
    encoder.encode_frames(frames)?;
    tracing::debug!(qc = %out.display(), "wrote QC animation");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix4;
    use ndarray::Array3;
    use tempfile::tempdir;

    #[test]
    fn slices_stay_inside_the_volume() {
        let idx = slice_indices(20, 15);
        assert!(!idx.is_empty());
        assert!(idx.iter().all(|k| *k >= 2 && *k < 20));
        assert!(idx.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(slice_indices(3, 15).len(), 3);
        assert!(slice_indices(0, 5).is_empty());
    }

    #[test]
    fn writes_a_gif() {
        let dir = tempdir().unwrap();
        let data = Array3::from_shape_fn((8, 8, 8), |(i, j, k)| (i + j + k) as f32);
        let a = dir.path().join("a.nii.gz");
        let b = dir.path().join("b.nii.gz");
        Volume::from_array(data.clone(), Matrix4::identity()).save(&a).unwrap();
        Volume::from_array(data.mapv(|v| if v > 10.0 { 1.0 } else { 0.0 }), Matrix4::identity())
            .save(&b)
            .unwrap();

        let out = dir.path().join("qc.gif");
        volume_to_gif(&a, &b, &out, &GifOptions::default()).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        assert_eq!(&bytes[..3], b"GIF");
    }
}
