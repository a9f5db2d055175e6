use crate::core::models::contour::Contour;
use crate::core::models::ids::RegionId;
use crate::core::models::image::{ImageGeometry, Volume};
use crate::core::utils::geometry::ray_x_intersection;
use nalgebra::Point3;
use tracing::{debug, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Rasterizes closed contours into a labelled volume on a supersampled copy of the
/// reference grid.
#[derive(Debug, Clone)]
pub struct RegionPartitioner {
    geometry: ImageGeometry,
}

impl RegionPartitioner {
    pub fn new(reference: &ImageGeometry, sampling_factor: f64) -> Self {
        Self {
            geometry: reference.supersampled(sampling_factor),
        }
    }

    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    /// Labels every voxel of the working grid. Contours claim voxels in index order and a
    /// voxel keeps the first region that claims it; unclaimed voxels fall into the last
    /// (background) region.
    pub fn partition(&self, contours: &[Contour]) -> RegionPartition {
        let background = contours.len();
        let mut labels = vec![background; self.geometry.num_voxels()];

        for (index, contour) in contours.iter().enumerate() {
            let inside = self.rasterize(contour);
            for (label, _) in labels
                .iter_mut()
                .zip(inside.iter())
                .filter(|(label, inside)| **inside && **label == background)
            {
                *label = index;
            }
        }

        let partition = RegionPartition {
            geometry: self.geometry.clone(),
            labels,
            num_regions: contours.len() + 1,
        };
        debug!(
            "Partitioned {} voxels into {} regions.",
            partition.labels.len(),
            partition.num_regions
        );
        partition
    }

    /// Even-odd inside test of a single contour, one ray along x per (y, z) row.
    fn rasterize(&self, contour: &Contour) -> Vec<bool> {
        let [nx, ny, nz] = self.geometry.size;
        let points = contour.points();
        let triangles = contour.triangles();
        let first = self.geometry.first_pixel_center();
        let spacing = self.geometry.spacing;

        let (lo, hi) = contour.bounding_box();
        let misses_domain = (0..3).any(|axis| {
            let last = first[axis] + (self.geometry.size[axis] - 1) as f64 * spacing[axis];
            hi[axis] < first[axis] || lo[axis] > last
        });
        if misses_domain {
            return vec![false; nx * ny * nz];
        }

        // Triangles bucketed by the z rows their extent covers.
        let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); nz];
        for (t, tri) in triangles.iter().enumerate() {
            let (lo, hi) = tri.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |acc, &v| {
                (acc.0.min(points[v].z), acc.1.max(points[v].z))
            });
            let k_lo = ((lo - first.z) / spacing.z).ceil().max(0.0);
            let k_hi = ((hi - first.z) / spacing.z).floor();
            if k_hi < 0.0 || k_lo > (nz - 1) as f64 {
                continue;
            }
            for bucket in &mut buckets[k_lo as usize..=(k_hi as usize).min(nz - 1)] {
                bucket.push(t);
            }
        }

        let mut inside = vec![false; nx * ny * nz];

        #[cfg(not(feature = "parallel"))]
        let iterator = inside.chunks_mut(nx);

        #[cfg(feature = "parallel")]
        let iterator = inside.par_chunks_mut(nx);

        iterator.enumerate().for_each(|(row, cells)| {
            let (j, k) = (row % ny, row / ny);
            let y = first.y + j as f64 * spacing.y;
            let z = first.z + k as f64 * spacing.z;
            if y < lo.y || y > hi.y {
                return;
            }

            let mut hits: Vec<f64> = buckets[k]
                .iter()
                .filter_map(|&t| {
                    let [a, b, c] = triangles[t];
                    let (pa, pb, pc) = (&points[a], &points[b], &points[c]);
                    if y < pa.y.min(pb.y).min(pc.y) || y > pa.y.max(pb.y).max(pc.y) {
                        return None;
                    }
                    ray_x_intersection(pa, pb, pc, y, z)
                })
                .collect();
            if hits.len() < 2 {
                return;
            }
            hits.sort_by(f64::total_cmp);

            let mut crossed = 0;
            for (i, cell) in cells.iter_mut().enumerate() {
                let x = first.x + i as f64 * spacing.x;
                while crossed < hits.len() && hits[crossed] <= x {
                    crossed += 1;
                }
                *cell = crossed % 2 == 1;
            }
        });

        inside
    }
}

/// Region label of every voxel of the working grid.
#[derive(Debug, Clone)]
pub struct RegionPartition {
    geometry: ImageGeometry,
    labels: Vec<usize>,
    num_regions: usize,
}

impl RegionPartition {
    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    pub fn background(&self) -> RegionId {
        RegionId(self.num_regions - 1)
    }

    /// Label of the voxel nearest to `point`; points off the grid belong to the
    /// background region.
    pub fn region_at(&self, point: &Point3<f64>) -> RegionId {
        let idx = self.geometry.physical_to_continuous_index(point);
        let mut voxel = [0usize; 3];
        for axis in 0..3 {
            let rounded = idx[axis].round();
            if !(rounded >= 0.0 && rounded <= (self.geometry.size[axis] - 1) as f64) {
                return self.background();
            }
            voxel[axis] = rounded as usize;
        }
        RegionId(self.labels[self.geometry.linear_index(voxel)])
    }

    pub fn voxel_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.num_regions];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }

    /// Regions that claimed no voxel. Each one is reported with a warning.
    pub fn empty_regions(&self) -> Vec<RegionId> {
        let empty: Vec<RegionId> = self
            .voxel_counts()
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(region, _)| RegionId(region))
            .collect();
        for region in &empty {
            warn!("{} is empty after rasterization.", region);
        }
        empty
    }

    /// Fraction of each `target` voxel covered by each region, obtained by linearly
    /// resampling the binary region masks. Returned region-major.
    pub fn probability_maps(&self, target: &ImageGeometry) -> Vec<Vec<f64>> {
        (0..self.num_regions)
            .map(|region| {
                let mask = Volume::from_fn(self.geometry.clone(), |idx| {
                    if self.labels[self.geometry.linear_index(idx)] == region {
                        1.0
                    } else {
                        0.0
                    }
                });
                mask.resampled(target, 0.0).into_data()
            })
            .collect()
    }
}
