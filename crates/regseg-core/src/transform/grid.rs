use super::sparse::TransformError;
use crate::core::models::image::ImageGeometry;
use nalgebra::{Point3, Vector3};

const GRID_TOLERANCE: f64 = 1.0e-6;

/// Regular lattice of control points. Cells tile the physical extent of the image the
/// grid was built for and every control point sits at the centre of its cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlGrid {
    size: [usize; 3],
    spacing: Vector3<f64>,
    origin: Point3<f64>,
}

impl ControlGrid {
    pub fn new(
        size: [usize; 3],
        spacing: Vector3<f64>,
        origin: Point3<f64>,
    ) -> Result<Self, TransformError> {
        if size.iter().any(|&s| s == 0) || spacing.iter().any(|&s| !(s > 0.0)) {
            return Err(TransformError::InvalidGrid { size });
        }
        Ok(Self {
            size,
            spacing,
            origin,
        })
    }

    /// Grid with `size` points per axis spanning the domain of `geometry`.
    pub fn covering(geometry: &ImageGeometry, size: [usize; 3]) -> Result<Self, TransformError> {
        if size.iter().any(|&s| s == 0) {
            return Err(TransformError::InvalidGrid { size });
        }
        let extent = geometry.extent();
        let spacing = Vector3::new(
            extent.x / size[0] as f64,
            extent.y / size[1] as f64,
            extent.z / size[2] as f64,
        );
        let origin = geometry.domain_start() + spacing * 0.5;
        Self::new(size, spacing, origin)
    }

    #[inline]
    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    #[inline]
    pub fn spacing(&self) -> &Vector3<f64> {
        &self.spacing
    }

    #[inline]
    pub fn origin(&self) -> &Point3<f64> {
        &self.origin
    }

    #[inline]
    pub fn num_points(&self) -> usize {
        self.size[0] * self.size[1] * self.size[2]
    }

    #[inline]
    pub fn linear_index(&self, idx: [usize; 3]) -> usize {
        idx[0] + self.size[0] * (idx[1] + self.size[1] * idx[2])
    }

    #[inline]
    pub fn index_of(&self, linear: usize) -> [usize; 3] {
        let plane = self.size[0] * self.size[1];
        let rem = linear % plane;
        [rem % self.size[0], rem / self.size[0], linear / plane]
    }

    pub fn point(&self, idx: [usize; 3]) -> Point3<f64> {
        self.origin
            + Vector3::new(idx[0] as f64, idx[1] as f64, idx[2] as f64).component_mul(&self.spacing)
    }

    pub fn points(&self) -> Vec<Point3<f64>> {
        (0..self.num_points())
            .map(|i| self.point(self.index_of(i)))
            .collect()
    }

    pub fn continuous_index(&self, point: &Point3<f64>) -> Vector3<f64> {
        (point - self.origin).component_div(&self.spacing)
    }

    /// Explains the first mismatch between two grids, if any.
    pub fn mismatch(&self, other: &Self) -> Option<&'static str> {
        if self.size != other.size {
            Some("size")
        } else if (self.spacing - other.spacing).amax() > GRID_TOLERANCE {
            Some("spacing")
        } else if (self.origin - other.origin).amax() > GRID_TOLERANCE {
            Some("origin")
        } else {
            None
        }
    }
}

/// Vector-valued samples at the control points, stored axis-major
/// (`axis * num_points + point`).
#[derive(Debug, Clone, PartialEq)]
pub struct VectorField {
    grid: ControlGrid,
    components: Vec<f64>,
}

impl VectorField {
    pub fn zeros(grid: ControlGrid) -> Self {
        let components = vec![0.0; 3 * grid.num_points()];
        Self { grid, components }
    }

    pub fn new(grid: ControlGrid, components: Vec<f64>) -> Result<Self, TransformError> {
        let expected = 3 * grid.num_points();
        if components.len() != expected {
            return Err(TransformError::BufferLength {
                expected,
                actual: components.len(),
            });
        }
        Ok(Self { grid, components })
    }

    pub fn from_fn(grid: ControlGrid, f: impl Fn(&Point3<f64>) -> Vector3<f64>) -> Self {
        let n = grid.num_points();
        let mut components = vec![0.0; 3 * n];
        for i in 0..n {
            let v = f(&grid.point(grid.index_of(i)));
            for axis in 0..3 {
                components[axis * n + i] = v[axis];
            }
        }
        Self { grid, components }
    }

    #[inline]
    pub fn grid(&self) -> &ControlGrid {
        &self.grid
    }

    #[inline]
    pub fn components(&self) -> &[f64] {
        &self.components
    }

    pub fn axis(&self, axis: usize) -> &[f64] {
        let n = self.grid.num_points();
        &self.components[axis * n..(axis + 1) * n]
    }

    pub fn at_node(&self, linear: usize) -> Vector3<f64> {
        let n = self.grid.num_points();
        Vector3::new(
            self.components[linear],
            self.components[n + linear],
            self.components[2 * n + linear],
        )
    }

    pub fn into_components(self) -> Vec<f64> {
        self.components
    }
}
