use crate::core::utils::filters;
use nalgebra::{Matrix3, Point3, Vector3};
use thiserror::Error;

const DIRECTION_TOLERANCE: f64 = 1.0e-6;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    #[error("Buffer holds {actual} voxels but the geometry requires {expected}")]
    BufferSize { expected: usize, actual: usize },

    #[error("Invalid image size {size:?}: every axis needs at least one voxel")]
    EmptySize { size: [usize; 3] },

    #[error("Invalid spacing {spacing:?}: every axis must be strictly positive")]
    InvalidSpacing { spacing: [f64; 3] },

    #[error("Direction matrix is not a signed axis permutation and cannot be canonicalized")]
    ObliqueDirection,

    #[error("Contour mesh has no vertices or no triangles")]
    EmptyMesh,

    #[error("Triangle {triangle} references vertex {vertex}, but the mesh has {num_vertices} vertices")]
    InvalidTriangle {
        triangle: usize,
        vertex: usize,
        num_vertices: usize,
    },
}

/// Sampling grid of a volume. `origin` is the physical position of the centre of the
/// first voxel, columns of `direction` are the physical directions of the index axes.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageGeometry {
    pub size: [usize; 3],
    pub spacing: Vector3<f64>,
    pub origin: Point3<f64>,
    pub direction: Matrix3<f64>,
}

impl ImageGeometry {
    pub fn new(
        size: [usize; 3],
        spacing: Vector3<f64>,
        origin: Point3<f64>,
    ) -> Result<Self, GeometryError> {
        Self::with_direction(size, spacing, origin, Matrix3::identity())
    }

    pub fn with_direction(
        size: [usize; 3],
        spacing: Vector3<f64>,
        origin: Point3<f64>,
        direction: Matrix3<f64>,
    ) -> Result<Self, GeometryError> {
        if size.iter().any(|&s| s == 0) {
            return Err(GeometryError::EmptySize { size });
        }
        if spacing.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(GeometryError::InvalidSpacing {
                spacing: [spacing.x, spacing.y, spacing.z],
            });
        }
        Ok(Self {
            size,
            spacing,
            origin,
            direction,
        })
    }

    #[inline]
    pub fn num_voxels(&self) -> usize {
        self.size[0] * self.size[1] * self.size[2]
    }

    #[inline]
    pub fn linear_index(&self, idx: [usize; 3]) -> usize {
        idx[0] + self.size[0] * (idx[1] + self.size[1] * idx[2])
    }

    #[inline]
    pub fn index_of(&self, linear: usize) -> [usize; 3] {
        let plane = self.size[0] * self.size[1];
        let k = linear / plane;
        let rem = linear % plane;
        [rem % self.size[0], rem / self.size[0], k]
    }

    pub fn index_to_physical(&self, idx: &Vector3<f64>) -> Point3<f64> {
        self.origin + self.direction * idx.component_mul(&self.spacing)
    }

    pub fn voxel_center(&self, idx: [usize; 3]) -> Point3<f64> {
        self.index_to_physical(&Vector3::new(idx[0] as f64, idx[1] as f64, idx[2] as f64))
    }

    /// Inverse of [`index_to_physical`](Self::index_to_physical) for orthonormal directions.
    pub fn physical_to_continuous_index(&self, point: &Point3<f64>) -> Vector3<f64> {
        (self.direction.transpose() * (point - self.origin)).component_div(&self.spacing)
    }

    /// Whether the continuous index of `point` lies within the voxel-centre box
    /// `[0, size - 1]` on every axis.
    pub fn contains_center_box(&self, point: &Point3<f64>) -> bool {
        let idx = self.physical_to_continuous_index(point);
        (0..3).all(|i| idx[i] >= 0.0 && idx[i] <= (self.size[i] - 1) as f64)
    }

    pub fn first_pixel_center(&self) -> Point3<f64> {
        self.origin
    }

    pub fn last_pixel_center(&self) -> Point3<f64> {
        self.index_to_physical(&Vector3::new(
            (self.size[0] - 1) as f64,
            (self.size[1] - 1) as f64,
            (self.size[2] - 1) as f64,
        ))
    }

    /// Physical corner of the imaged domain (outer edge of the first voxel).
    pub fn domain_start(&self) -> Point3<f64> {
        self.index_to_physical(&Vector3::repeat(-0.5))
    }

    /// Physical extent of the imaged domain along each index axis.
    pub fn extent(&self) -> Vector3<f64> {
        Vector3::new(
            self.size[0] as f64 * self.spacing.x,
            self.size[1] as f64 * self.spacing.y,
            self.size[2] as f64 * self.spacing.z,
        )
    }

    pub fn voxel_volume(&self) -> f64 {
        self.spacing.x * self.spacing.y * self.spacing.z
    }

    /// Grid covering the same physical domain with `factor` times as many voxels per axis.
    pub fn supersampled(&self, factor: f64) -> Self {
        let extent = self.extent();
        let mut size = [1usize; 3];
        let mut spacing = Vector3::zeros();
        for i in 0..3 {
            size[i] = ((self.size[i] as f64 * factor).floor() as usize).max(1);
            spacing[i] = extent[i] / size[i] as f64;
        }
        let origin = self.domain_start() + self.direction * (spacing * 0.5);
        Self {
            size,
            spacing,
            origin,
            direction: self.direction,
        }
    }

    pub fn same_grid(&self, other: &Self) -> bool {
        let tol = DIRECTION_TOLERANCE;
        self.size == other.size
            && (self.spacing - other.spacing).amax() < tol
            && (self.origin - other.origin).amax() < tol
            && (self.direction - other.direction).amax() < tol
    }

    pub fn is_axis_aligned(&self) -> bool {
        (self.direction - Matrix3::identity()).amax() < DIRECTION_TOLERANCE
    }

    /// For each physical axis, the index axis mapped onto it and the orientation sign.
    fn axis_permutation(&self) -> Result<[(usize, f64); 3], GeometryError> {
        let mut mapping = [(0usize, 1.0f64); 3];
        let mut used = [false; 3];
        for (row, slot) in mapping.iter_mut().enumerate() {
            let mut found = None;
            for col in 0..3 {
                let v = self.direction[(row, col)];
                if (v.abs() - 1.0).abs() < DIRECTION_TOLERANCE {
                    if found.is_some() || used[col] {
                        return Err(GeometryError::ObliqueDirection);
                    }
                    found = Some((col, v.signum()));
                } else if v.abs() > DIRECTION_TOLERANCE {
                    return Err(GeometryError::ObliqueDirection);
                }
            }
            let (col, sign) = found.ok_or(GeometryError::ObliqueDirection)?;
            used[col] = true;
            *slot = (col, sign);
        }
        Ok(mapping)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T> {
    geometry: ImageGeometry,
    data: Vec<T>,
}

impl<T: Copy> Volume<T> {
    pub fn new(geometry: ImageGeometry, data: Vec<T>) -> Result<Self, GeometryError> {
        let expected = geometry.num_voxels();
        if data.len() != expected {
            return Err(GeometryError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { geometry, data })
    }

    pub fn filled(geometry: ImageGeometry, value: T) -> Self {
        let data = vec![value; geometry.num_voxels()];
        Self { geometry, data }
    }

    pub fn from_fn(geometry: ImageGeometry, f: impl Fn([usize; 3]) -> T) -> Self {
        let data = (0..geometry.num_voxels())
            .map(|i| f(geometry.index_of(i)))
            .collect();
        Self { geometry, data }
    }

    #[inline]
    pub fn geometry(&self) -> &ImageGeometry {
        &self.geometry
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    #[inline]
    pub fn get(&self, idx: [usize; 3]) -> T {
        self.data[self.geometry.linear_index(idx)]
    }

    pub fn into_data(self) -> Vec<T> {
        self.data
    }

    /// Reorders the buffer so that the direction becomes the identity while every voxel
    /// keeps its physical position.
    ///
    /// Only axis-aligned orientations (a signed permutation of the axes) can be
    /// reordered; an oblique direction matrix yields
    /// [`GeometryError::ObliqueDirection`] instead of being resampled.
    pub fn canonicalized(self) -> Result<Self, GeometryError> {
        if self.geometry.is_axis_aligned() {
            return Ok(self);
        }
        let mapping = self.geometry.axis_permutation()?;
        let old = &self.geometry;

        let mut size = [0usize; 3];
        let mut spacing = Vector3::zeros();
        let mut origin = old.origin;
        for (axis, &(col, sign)) in mapping.iter().enumerate() {
            size[axis] = old.size[col];
            spacing[axis] = old.spacing[col];
            if sign < 0.0 {
                origin[axis] -= (old.size[col] - 1) as f64 * old.spacing[col];
            }
        }
        let geometry = ImageGeometry {
            size,
            spacing,
            origin,
            direction: Matrix3::identity(),
        };

        let data = (0..geometry.num_voxels())
            .map(|linear| {
                let new_idx = geometry.index_of(linear);
                let mut old_idx = [0usize; 3];
                for (axis, &(col, sign)) in mapping.iter().enumerate() {
                    old_idx[col] = if sign > 0.0 {
                        new_idx[axis]
                    } else {
                        old.size[col] - 1 - new_idx[axis]
                    };
                }
                self.data[old.linear_index(old_idx)]
            })
            .collect();

        Ok(Self { geometry, data })
    }
}

impl Volume<f64> {
    /// Trilinear sample; `outside` is returned beyond half a voxel of the buffer.
    pub fn sample(&self, point: &Point3<f64>, outside: f64) -> f64 {
        let idx = self.geometry.physical_to_continuous_index(point);
        filters::trilinear(&self.data, &self.geometry, &idx, outside)
    }

    /// Resamples onto `target` with trilinear interpolation.
    pub fn resampled(&self, target: &ImageGeometry, outside: f64) -> Volume<f64> {
        filters::resample(self, target, outside)
    }
}

/// Scalar volume every region statistic is evaluated on. Always stored with an identity
/// direction; volumes with an oblique orientation are rejected rather than resampled.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    volume: Volume<f64>,
    min_value: f64,
    max_value: f64,
}

impl ReferenceImage {
    pub fn new(volume: Volume<f64>) -> Result<Self, GeometryError> {
        let volume = volume.canonicalized()?;
        let (min_value, max_value) = value_range(volume.data());
        Ok(Self {
            volume,
            min_value,
            max_value,
        })
    }

    /// Applies an isotropic Gaussian filter with standard deviation `sigma` in physical
    /// units. A non-positive sigma leaves the image untouched.
    pub fn smoothed(self, sigma: f64) -> Self {
        if !(sigma > 0.0) {
            return self;
        }
        let volume = filters::gaussian_smooth(&self.volume, sigma);
        let (min_value, max_value) = value_range(volume.data());
        Self {
            volume,
            min_value,
            max_value,
        }
    }

    #[inline]
    pub fn geometry(&self) -> &ImageGeometry {
        self.volume.geometry()
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        self.volume.data()
    }

    pub fn volume(&self) -> &Volume<f64> {
        &self.volume
    }

    /// Linearly interpolated intensity, replicating border voxels.
    pub fn value_at(&self, point: &Point3<f64>) -> f64 {
        let idx = self.geometry().physical_to_continuous_index(point);
        filters::trilinear_clamped(self.volume.data(), self.geometry(), &idx)
    }

    pub fn intensity_range(&self) -> (f64, f64) {
        (self.min_value, self.max_value)
    }
}

fn value_range(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Per-voxel probability that a voxel belongs to the background (non-tissue).
#[derive(Debug, Clone)]
pub struct ProbabilityMap {
    volume: Volume<f64>,
}

impl ProbabilityMap {
    pub fn zeros(geometry: ImageGeometry) -> Self {
        Self {
            volume: Volume::filled(geometry, 0.0),
        }
    }

    pub fn from_background(volume: Volume<f64>) -> Result<Self, GeometryError> {
        let mut volume = volume.canonicalized()?;
        for w in volume.data_mut() {
            *w = w.clamp(0.0, 1.0);
        }
        Ok(Self { volume })
    }

    /// Builds the background map as the complement of a tissue probability mask.
    pub fn from_tissue_mask(mask: Volume<f64>) -> Result<Self, GeometryError> {
        let mut volume = mask.canonicalized()?;
        for w in volume.data_mut() {
            *w = (1.0 - *w).clamp(0.0, 1.0);
        }
        Ok(Self { volume })
    }

    /// Returns the map on `geometry`, resampling only if the grids differ.
    pub fn aligned_to(self, geometry: &ImageGeometry) -> Self {
        if self.volume.geometry().same_grid(geometry) {
            return self;
        }
        Self {
            volume: self.volume.resampled(geometry, 0.0),
        }
    }

    #[inline]
    pub fn geometry(&self) -> &ImageGeometry {
        self.volume.geometry()
    }

    #[inline]
    pub fn weights(&self) -> &[f64] {
        self.volume.data()
    }

    pub fn weight_at(&self, point: &Point3<f64>) -> f64 {
        self.volume.sample(point, 0.0)
    }
}
