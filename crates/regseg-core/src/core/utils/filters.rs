use crate::core::models::image::{ImageGeometry, Volume};
use nalgebra::Vector3;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const MAX_KERNEL_RADIUS: usize = 64;

/// Trilinear interpolation at a continuous index. Indices further than half a voxel
/// outside the buffer return `outside`; indices inside that margin are clamped onto the
/// outermost voxel centres.
pub fn trilinear(
    data: &[f64],
    geometry: &ImageGeometry,
    idx: &Vector3<f64>,
    outside: f64,
) -> f64 {
    for axis in 0..3 {
        let upper = geometry.size[axis] as f64 - 0.5;
        if !(idx[axis] >= -0.5 && idx[axis] <= upper) {
            return outside;
        }
    }
    trilinear_clamped(data, geometry, idx)
}

/// Trilinear interpolation with border replication.
pub fn trilinear_clamped(data: &[f64], geometry: &ImageGeometry, idx: &Vector3<f64>) -> f64 {
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    let mut frac = [0.0f64; 3];
    for axis in 0..3 {
        let max = (geometry.size[axis] - 1) as f64;
        let x = if idx[axis].is_nan() {
            0.0
        } else {
            idx[axis].clamp(0.0, max)
        };
        let base = x.floor();
        lo[axis] = base as usize;
        hi[axis] = (lo[axis] + 1).min(geometry.size[axis] - 1);
        frac[axis] = x - base;
    }

    let at = |i: usize, j: usize, k: usize| data[geometry.linear_index([i, j, k])];

    let c00 = at(lo[0], lo[1], lo[2]) * (1.0 - frac[0]) + at(hi[0], lo[1], lo[2]) * frac[0];
    let c10 = at(lo[0], hi[1], lo[2]) * (1.0 - frac[0]) + at(hi[0], hi[1], lo[2]) * frac[0];
    let c01 = at(lo[0], lo[1], hi[2]) * (1.0 - frac[0]) + at(hi[0], lo[1], hi[2]) * frac[0];
    let c11 = at(lo[0], hi[1], hi[2]) * (1.0 - frac[0]) + at(hi[0], hi[1], hi[2]) * frac[0];

    let c0 = c00 * (1.0 - frac[1]) + c10 * frac[1];
    let c1 = c01 * (1.0 - frac[1]) + c11 * frac[1];
    c0 * (1.0 - frac[2]) + c1 * frac[2]
}

pub fn resample(source: &Volume<f64>, target: &ImageGeometry, outside: f64) -> Volume<f64> {
    let indices = 0..target.num_voxels();

    #[cfg(feature = "parallel")]
    let indices = indices.into_par_iter();

    let data: Vec<f64> = indices
        .map(|linear| {
            let point = target.voxel_center(target.index_of(linear));
            source.sample(&point, outside)
        })
        .collect();

    Volume::from_fn(target.clone(), |idx| data[target.linear_index(idx)])
}

fn gaussian_kernel(pixel_sigma: f64) -> Vec<f64> {
    let radius = ((3.0 * pixel_sigma).ceil() as usize).min(MAX_KERNEL_RADIUS);
    let two_sigma2 = 2.0 * pixel_sigma * pixel_sigma;
    let mut kernel: Vec<f64> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-x * x / two_sigma2).exp()
        })
        .collect();
    let sum: f64 = kernel.iter().sum();
    for w in &mut kernel {
        *w /= sum;
    }
    kernel
}

/// Separable Gaussian filter with `sigma` in physical units; borders are replicated.
pub fn gaussian_smooth(volume: &Volume<f64>, sigma: f64) -> Volume<f64> {
    let geometry = volume.geometry().clone();
    let mut data = volume.data().to_vec();

    for axis in 0..3 {
        let pixel_sigma = sigma / geometry.spacing[axis];
        if pixel_sigma <= 1.0e-6 || geometry.size[axis] < 2 {
            continue;
        }
        let kernel = gaussian_kernel(pixel_sigma);
        data = convolve_axis(&data, &geometry, axis, &kernel);
    }

    Volume::from_fn(geometry.clone(), |idx| data[geometry.linear_index(idx)])
}

fn convolve_axis(data: &[f64], geometry: &ImageGeometry, axis: usize, kernel: &[f64]) -> Vec<f64> {
    let radius = (kernel.len() / 2) as isize;
    let len = geometry.size[axis] as isize;
    let indices = 0..geometry.num_voxels();

    #[cfg(feature = "parallel")]
    let indices = indices.into_par_iter();

    indices
        .map(|linear| {
            let idx = geometry.index_of(linear);
            let centre = idx[axis] as isize;
            kernel
                .iter()
                .enumerate()
                .map(|(k, w)| {
                    let pos = (centre + k as isize - radius).clamp(0, len - 1) as usize;
                    let mut neighbour = idx;
                    neighbour[axis] = pos;
                    w * data[geometry.linear_index(neighbour)]
                })
                .sum::<f64>()
        })
        .collect()
}
