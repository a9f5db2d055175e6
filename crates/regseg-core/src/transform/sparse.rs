use super::basis;
use super::grid::{ControlGrid, VectorField};
use nalgebra::{Point3, Vector3};
use sprs::{CsMat, TriMat};
use thiserror::Error;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const NEIGHBOUR_REACH: isize = 2;
const CG_MAX_ITERATIONS: usize = 500;
const CG_TOLERANCE: f64 = 1.0e-14;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    #[error("Invalid control grid of size {size:?}")]
    InvalidGrid { size: [usize; 3] },

    #[error("Field is not sampled on the control grid: {property} differs")]
    IncompatibleGrid { property: &'static str },

    #[error("Buffer has {actual} values but {expected} were expected")]
    BufferLength { expected: usize, actual: usize },
}

/// `W` and `Wᵗ` for one (grid, sample set) pair.
#[derive(Debug, Clone)]
struct WeightCache {
    forward: CsMat<f64>,
    adjoint: CsMat<f64>,
}

impl WeightCache {
    fn build(grid: &ControlGrid, points: &[Point3<f64>]) -> Self {
        let rows = sample_rows(grid, points);
        let mut forward = TriMat::new((points.len(), grid.num_points()));
        let mut adjoint = TriMat::new((grid.num_points(), points.len()));
        for (r, row) in rows.iter().enumerate() {
            for &(c, w) in row {
                forward.add_triplet(r, c, w);
                adjoint.add_triplet(c, r, w);
            }
        }
        let forward: CsMat<f64> = forward.to_csr();
        let adjoint: CsMat<f64> = adjoint.to_csr();
        debug!(
            "Built sparse weight matrix: {} samples x {} control points, {} non-zeros.",
            points.len(),
            grid.num_points(),
            forward.nnz()
        );
        Self { forward, adjoint }
    }
}

/// Non-zero basis weights of every control point near each sample.
fn sample_rows(grid: &ControlGrid, points: &[Point3<f64>]) -> Vec<Vec<(usize, f64)>> {
    #[cfg(not(feature = "parallel"))]
    let iterator = points.iter();

    #[cfg(feature = "parallel")]
    let iterator = points.par_iter();

    iterator.map(|p| neighbour_weights(grid, p)).collect()
}

fn neighbour_weights(grid: &ControlGrid, point: &Point3<f64>) -> Vec<(usize, f64)> {
    let ci = grid.continuous_index(point);
    let size = grid.size();
    let mut ranges = [(0usize, 0usize); 3];
    for axis in 0..3 {
        let base = ci[axis].floor() as isize;
        let hi = (base + NEIGHBOUR_REACH).min(size[axis] as isize - 1);
        let lo = (base - NEIGHBOUR_REACH).max(0);
        if lo > hi {
            return Vec::new();
        }
        ranges[axis] = (lo as usize, hi as usize);
    }

    let mut row = Vec::new();
    for k in ranges[2].0..=ranges[2].1 {
        for j in ranges[1].0..=ranges[1].1 {
            for i in ranges[0].0..=ranges[0].1 {
                let offset = point - grid.point([i, j, k]);
                let w = basis::weight(&offset, grid.spacing());
                if w > 0.0 {
                    row.push((grid.linear_index([i, j, k]), w));
                }
            }
        }
    }
    row
}

/// `out = matrix * x`, one task per row.
fn mul_vec(matrix: &CsMat<f64>, x: &[f64], out: &mut [f64]) {
    #[cfg(not(feature = "parallel"))]
    let rows = out.iter_mut().enumerate();

    #[cfg(feature = "parallel")]
    let rows = out.par_iter_mut().enumerate();

    rows.for_each(|(r, y)| {
        *y = matrix
            .outer_view(r)
            .map(|row| row.iter().map(|(c, &w)| w * x[c]).sum::<f64>())
            .unwrap_or(0.0);
    });
}

fn check_len(values: &[f64], expected: usize) -> Result<(), TransformError> {
    if values.len() != expected {
        return Err(TransformError::BufferLength {
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}

/// Maps coefficients on a coarse control grid to values at arbitrary sample points and
/// back, through a compactly supported cubic basis.
///
/// All buffers are axis-major: component `axis` of entry `i` lives at
/// `axis * len + i`.
#[derive(Debug, Clone)]
pub struct SparseInterpolationTransform {
    grid: ControlGrid,
    coefficients: Vec<f64>,
    sample_points: Vec<Point3<f64>>,
    sample_weights: Option<WeightCache>,
    node_weights: Option<WeightCache>,
}

impl SparseInterpolationTransform {
    pub fn new(grid: ControlGrid) -> Self {
        let coefficients = vec![0.0; 3 * grid.num_points()];
        Self {
            grid,
            coefficients,
            sample_points: Vec::new(),
            sample_weights: None,
            node_weights: None,
        }
    }

    #[inline]
    pub fn control_grid(&self) -> &ControlGrid {
        &self.grid
    }

    #[inline]
    pub fn num_control_points(&self) -> usize {
        self.grid.num_points()
    }

    #[inline]
    pub fn num_samples(&self) -> usize {
        self.sample_points.len()
    }

    #[inline]
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    pub fn set_coefficients(&mut self, coefficients: Vec<f64>) -> Result<(), TransformError> {
        check_len(&coefficients, 3 * self.grid.num_points())?;
        self.coefficients = coefficients;
        Ok(())
    }

    /// Replaces the control grid. Coefficients are reset and every weight matrix is
    /// discarded.
    pub fn set_control_grid(&mut self, grid: ControlGrid) {
        if self.grid.mismatch(&grid).is_none() {
            return;
        }
        self.coefficients = vec![0.0; 3 * grid.num_points()];
        self.grid = grid;
        self.sample_weights = None;
        self.node_weights = None;
    }

    #[inline]
    pub fn sample_points(&self) -> &[Point3<f64>] {
        &self.sample_points
    }

    /// Sets the off-grid sample points. The sample weight matrix is rebuilt lazily on the
    /// next product if the set changed.
    pub fn set_sample_points(&mut self, points: Vec<Point3<f64>>) {
        if points == self.sample_points {
            return;
        }
        self.sample_points = points;
        self.sample_weights = None;
    }

    /// Weight matrix of the basis evaluated at `points`, one row per point and one column
    /// per control point.
    pub fn build_weights(&self, points: &[Point3<f64>]) -> CsMat<f64> {
        WeightCache::build(&self.grid, points).forward
    }

    pub fn weight_matrix(&mut self) -> &CsMat<f64> {
        &self.sample_cache().forward
    }

    fn sample_cache(&mut self) -> &WeightCache {
        let (grid, points) = (&self.grid, &self.sample_points);
        self.sample_weights
            .get_or_insert_with(|| WeightCache::build(grid, points))
    }

    fn node_cache(&mut self) -> &WeightCache {
        let grid = &self.grid;
        self.node_weights
            .get_or_insert_with(|| WeightCache::build(grid, &grid.points()))
    }

    /// Values at the sample points, `W · c` per axis.
    pub fn interpolate(&mut self, coefficients: &[f64]) -> Result<Vec<f64>, TransformError> {
        let p = self.grid.num_points();
        check_len(coefficients, 3 * p)?;
        let n = self.sample_points.len();
        let cache = self.sample_cache();
        let mut out = vec![0.0; 3 * n];
        for axis in 0..3 {
            mul_vec(
                &cache.forward,
                &coefficients[axis * p..(axis + 1) * p],
                &mut out[axis * n..(axis + 1) * n],
            );
        }
        Ok(out)
    }

    /// Accumulates sample values onto the control points, `Wᵗ · v` per axis.
    pub fn splat(&mut self, values: &[f64]) -> Result<Vec<f64>, TransformError> {
        let n = self.sample_points.len();
        check_len(values, 3 * n)?;
        let p = self.grid.num_points();
        let cache = self.sample_cache();
        let mut out = vec![0.0; 3 * p];
        for axis in 0..3 {
            mul_vec(
                &cache.adjoint,
                &values[axis * n..(axis + 1) * n],
                &mut out[axis * p..(axis + 1) * p],
            );
        }
        Ok(out)
    }

    /// Dense field at the control points produced by `coefficients`.
    pub fn field_at_nodes(&mut self, coefficients: &[f64]) -> Result<VectorField, TransformError> {
        let p = self.grid.num_points();
        check_len(coefficients, 3 * p)?;
        let cache = self.node_cache();
        let mut out = vec![0.0; 3 * p];
        for axis in 0..3 {
            mul_vec(
                &cache.forward,
                &coefficients[axis * p..(axis + 1) * p],
                &mut out[axis * p..(axis + 1) * p],
            );
        }
        VectorField::new(self.grid.clone(), out)
    }

    /// Field value at an arbitrary physical point for the stored coefficients.
    pub fn evaluate(&self, point: &Point3<f64>) -> Vector3<f64> {
        let p = self.grid.num_points();
        neighbour_weights(&self.grid, point)
            .into_iter()
            .fold(Vector3::zeros(), |acc, (c, w)| {
                acc + Vector3::new(
                    self.coefficients[c],
                    self.coefficients[p + c],
                    self.coefficients[2 * p + c],
                ) * w
            })
    }

    /// Least-squares coefficients reproducing `field` at the control points, solved with
    /// conjugate gradients on the normal equations `BᵗB c = Bᵗ f` of the node weight
    /// matrix `B`.
    pub fn compute_coefficients(&mut self, field: &VectorField) -> Result<Vec<f64>, TransformError> {
        if let Some(property) = self.grid.mismatch(field.grid()) {
            return Err(TransformError::IncompatibleGrid { property });
        }
        let p = self.grid.num_points();
        let cache = self.node_cache();
        let mut coefficients = vec![0.0; 3 * p];
        for axis in 0..3 {
            let solution = solve_normal_equations(cache, field.axis(axis));
            coefficients[axis * p..(axis + 1) * p].copy_from_slice(&solution);
        }
        Ok(coefficients)
    }
}

/// Least-squares coefficients for values sampled at the rows of `cache.forward`.
fn solve_normal_equations(cache: &WeightCache, target: &[f64]) -> Vec<f64> {
    let (samples, n) = cache.forward.shape();
    debug_assert_eq!(target.len(), samples);
    let normal = |x: &[f64]| -> Vec<f64> {
        let mut tmp = vec![0.0; samples];
        mul_vec(&cache.forward, x, &mut tmp);
        let mut out = vec![0.0; n];
        mul_vec(&cache.adjoint, &tmp, &mut out);
        out
    };
    let dot = |a: &[f64], b: &[f64]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>();

    let mut x = vec![0.0; n];
    let mut r = vec![0.0; n];
    mul_vec(&cache.adjoint, target, &mut r);
    let mut d = r.clone();
    let mut rr = dot(&r, &r);
    let stop = rr * CG_TOLERANCE;

    for _ in 0..CG_MAX_ITERATIONS {
        if rr <= stop || rr == 0.0 {
            break;
        }
        let ad = normal(&d);
        let dad = dot(&d, &ad);
        if dad <= 0.0 {
            break;
        }
        let step = rr / dad;
        for i in 0..n {
            x[i] += step * d[i];
            r[i] -= step * ad[i];
        }
        let rr_next = dot(&r, &r);
        let beta = rr_next / rr;
        for i in 0..n {
            d[i] = r[i] + beta * d[i];
        }
        rr = rr_next;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn grid() -> ControlGrid {
        ControlGrid::new([5, 4, 3], Vector3::new(2.0, 2.0, 3.0), Point3::new(1.0, 1.0, 1.5))
            .unwrap()
    }

    fn random_points(rng: &mut StdRng, count: usize) -> Vec<Point3<f64>> {
        (0..count)
            .map(|_| {
                Point3::new(
                    rng.gen_range(0.0..10.0),
                    rng.gen_range(0.0..8.0),
                    rng.gen_range(0.0..9.0),
                )
            })
            .collect()
    }

    #[test]
    fn weights_are_bounded_and_rows_are_sparse() {
        let mut rng = StdRng::seed_from_u64(7);
        let transform = SparseInterpolationTransform::new(grid());
        let w = transform.build_weights(&random_points(&mut rng, 200));
        assert_eq!(w.rows(), 200);
        assert_eq!(w.cols(), 60);
        for row in w.outer_iterator() {
            assert!(row.nnz() <= 27);
            for (_, &v) in row.iter() {
                assert!(v > 0.0 && v <= 4.0 / 6.0 + 1e-15);
            }
        }
    }

    #[test]
    fn node_weight_matrix_is_scaled_identity() {
        let g = grid();
        let transform = SparseInterpolationTransform::new(g.clone());
        let w = transform.build_weights(&g.points());
        assert_eq!(w.nnz(), g.num_points());
        for (r, row) in w.outer_iterator().enumerate() {
            let (c, &v) = row.iter().next().unwrap();
            assert_eq!(c, r);
            assert!((v - 4.0 / 6.0).abs() < 1e-15);
        }
    }

    #[test]
    fn coefficients_round_trip_a_dense_field() {
        let g = grid();
        let field = VectorField::from_fn(g.clone(), |p| {
            Vector3::new((p.x * 0.3).sin(), p.y * 0.1 - p.z * 0.05, (p.x * p.z * 0.02).cos())
        });
        let mut transform = SparseInterpolationTransform::new(g);
        let coefficients = transform.compute_coefficients(&field).unwrap();
        let reproduced = transform.field_at_nodes(&coefficients).unwrap();

        let mean_error = field
            .components()
            .iter()
            .zip(reproduced.components())
            .map(|(a, b)| (a - b).abs())
            .sum::<f64>()
            / field.components().len() as f64;
        assert!(mean_error < 1e-5);
    }

    #[test]
    fn normal_equations_are_solved_for_scattered_samples() {
        let mut rng = StdRng::seed_from_u64(11);
        let g = grid();
        let cache = WeightCache::build(&g, &random_points(&mut rng, 800));
        let coupled = cache.forward.outer_iterator().filter(|row| row.nnz() > 1).count();
        assert!(coupled > 400);

        let truth: Vec<f64> = (0..g.num_points()).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let mut target = vec![0.0; cache.forward.rows()];
        mul_vec(&cache.forward, &truth, &mut target);

        let solution = solve_normal_equations(&cache, &target);
        assert_eq!(solution.len(), g.num_points());
        let mut fitted = vec![0.0; target.len()];
        mul_vec(&cache.forward, &solution, &mut fitted);
        let misfit: Vec<f64> = fitted.iter().zip(&target).map(|(a, b)| a - b).collect();

        let mut gradient = vec![0.0; g.num_points()];
        mul_vec(&cache.adjoint, &misfit, &mut gradient);
        let mut rhs = vec![0.0; g.num_points()];
        mul_vec(&cache.adjoint, &target, &mut rhs);
        let norm = |v: &[f64]| v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!(norm(&gradient) <= 1e-5 * norm(&rhs));
    }

    #[test]
    fn compute_coefficients_rejects_foreign_grid() {
        let mut transform = SparseInterpolationTransform::new(grid());
        let other = ControlGrid::new([5, 4, 3], Vector3::new(2.0, 2.0, 3.0), Point3::origin())
            .unwrap();
        let result = transform.compute_coefficients(&VectorField::zeros(other));
        assert_eq!(
            result.unwrap_err(),
            TransformError::IncompatibleGrid { property: "origin" }
        );
    }

    #[test]
    fn splat_is_adjoint_of_interpolate() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut transform = SparseInterpolationTransform::new(grid());
        transform.set_sample_points(random_points(&mut rng, 150));

        let c: Vec<f64> = (0..3 * transform.num_control_points())
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let v: Vec<f64> = (0..3 * transform.num_samples())
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();

        let wc = transform.interpolate(&c).unwrap();
        let wtv = transform.splat(&v).unwrap();
        let lhs: f64 = wc.iter().zip(&v).map(|(a, b)| a * b).sum();
        let rhs: f64 = c.iter().zip(&wtv).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-9 * lhs.abs().max(1.0));
    }

    #[test]
    fn evaluate_matches_interpolate_at_samples() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut transform = SparseInterpolationTransform::new(grid());
        let points = random_points(&mut rng, 20);
        transform.set_sample_points(points.clone());
        let c: Vec<f64> = (0..3 * transform.num_control_points())
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        transform.set_coefficients(c.clone()).unwrap();

        let values = transform.interpolate(&c).unwrap();
        let n = points.len();
        for (i, p) in points.iter().enumerate() {
            let direct = transform.evaluate(p);
            for axis in 0..3 {
                assert!((direct[axis] - values[axis * n + i]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn changing_sample_points_rebuilds_weights() {
        let mut transform = SparseInterpolationTransform::new(grid());
        transform.set_sample_points(vec![Point3::new(1.0, 1.0, 1.5)]);
        assert_eq!(transform.weight_matrix().rows(), 1);
        transform.set_sample_points(vec![Point3::new(1.0, 1.0, 1.5), Point3::new(3.0, 3.0, 3.0)]);
        assert_eq!(transform.weight_matrix().rows(), 2);
    }

    #[test]
    fn interpolate_checks_buffer_length() {
        let mut transform = SparseInterpolationTransform::new(grid());
        let result = transform.interpolate(&[0.0; 5]);
        assert!(matches!(result, Err(TransformError::BufferLength { .. })));
    }
}
