use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpectralError {
    #[error("Regularization denominator is not finite on axis {axis} at frequency {frequency:?}")]
    NonFiniteDenominator { axis: usize, frequency: [usize; 3] },

    #[error("Spectral update produced a non-finite coefficient on axis {axis}")]
    NonFiniteCoefficient { axis: usize },

    #[error("Buffer has {actual} values but {expected} were expected")]
    BufferLength { expected: usize, actual: usize },
}

/// Step and regularization weights entering the frequency-domain solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralParameters {
    pub step_size: f64,
    pub step_factor: f64,
    pub param_factor: f64,
    pub alpha: [f64; 3],
    pub beta: [f64; 3],
}

impl SpectralParameters {
    #[inline]
    pub fn tau(&self) -> f64 {
        self.step_size * self.step_factor
    }
}

/// Forward and inverse 1-D plans for each axis of a 3-D lattice.
struct FftPlans {
    size: [usize; 3],
    forward: [Arc<dyn Fft<f64>>; 3],
    inverse: [Arc<dyn Fft<f64>>; 3],
}

impl FftPlans {
    fn new(size: [usize; 3]) -> Self {
        let mut planner = FftPlanner::new();
        let forward = size.map(|n| planner.plan_fft_forward(n));
        let inverse = size.map(|n| planner.plan_fft_inverse(n));
        Self {
            size,
            forward,
            inverse,
        }
    }

    fn len(&self) -> usize {
        self.size.iter().product()
    }

    /// In-place separable 3-D transform. The inverse is normalized by the total size.
    fn process(&self, data: &mut [Complex<f64>], inverse: bool) {
        for axis in 0..3 {
            let plan = if inverse {
                &self.inverse[axis]
            } else {
                &self.forward[axis]
            };
            self.process_axis(data, axis, plan);
        }
        if inverse {
            let norm = 1.0 / self.len() as f64;
            for c in data.iter_mut() {
                *c *= norm;
            }
        }
    }

    fn process_axis(&self, data: &mut [Complex<f64>], axis: usize, plan: &Arc<dyn Fft<f64>>) {
        let [nx, ny, _] = self.size;
        let n = self.size[axis];
        if n < 2 {
            return;
        }
        let stride = match axis {
            0 => 1,
            1 => nx,
            _ => nx * ny,
        };
        let starts: Vec<usize> = (0..data.len())
            .filter(|&i| match axis {
                0 => i % nx == 0,
                1 => (i / nx) % ny == 0,
                _ => i / (nx * ny) == 0,
            })
            .collect();

        let source: &[Complex<f64>] = data;
        #[cfg(not(feature = "parallel"))]
        let iterator = starts.iter();

        #[cfg(feature = "parallel")]
        let iterator = starts.par_iter();

        let lines: Vec<Vec<Complex<f64>>> = iterator
            .map(|&start| {
                let mut line: Vec<Complex<f64>> =
                    (0..n).map(|k| source[start + k * stride]).collect();
                plan.process(&mut line);
                line
            })
            .collect();

        for (&start, line) in starts.iter().zip(lines) {
            for (k, value) in line.into_iter().enumerate() {
                data[start + k * stride] = value;
            }
        }
    }
}

/// Solves the regularized update `(I/τ + α − β Δ) c' = c/τ ± g` on a periodic control
/// lattice by diagonalizing it with the discrete Fourier transform. The per-axis
/// denominator is cached until the lattice size or any parameter changes.
pub struct SpectralSolver {
    size: [usize; 3],
    parameters: SpectralParameters,
    plans: FftPlans,
    denominator: Option<[Vec<f64>; 3]>,
}

impl fmt::Debug for SpectralSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralSolver")
            .field("size", &self.size)
            .field("parameters", &self.parameters)
            .field("denominator_cached", &self.denominator.is_some())
            .finish()
    }
}

impl SpectralSolver {
    pub fn new(size: [usize; 3], parameters: SpectralParameters) -> Self {
        Self {
            size,
            parameters,
            plans: FftPlans::new(size),
            denominator: None,
        }
    }

    #[inline]
    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    #[inline]
    pub fn parameters(&self) -> &SpectralParameters {
        &self.parameters
    }

    #[inline]
    pub fn is_denominator_cached(&self) -> bool {
        self.denominator.is_some()
    }

    pub fn set_parameters(&mut self, parameters: SpectralParameters) {
        if parameters != self.parameters {
            self.parameters = parameters;
            self.denominator = None;
        }
    }

    pub fn set_size(&mut self, size: [usize; 3]) {
        if size != self.size {
            self.size = size;
            self.plans = FftPlans::new(size);
            self.denominator = None;
        }
    }

    fn build_denominator(&self) -> Result<[Vec<f64>; 3], SpectralError> {
        let p = &self.parameters;
        let n: usize = self.size.iter().product();
        let [nx, ny, _] = self.size;
        let mut out: [Vec<f64>; 3] = Default::default();

        for (axis, buffer) in out.iter_mut().enumerate() {
            let init = 1.0 / p.tau() + p.alpha[axis] * p.param_factor;
            let beta = p.beta[axis] * p.param_factor;
            *buffer = if beta != 0.0 {
                (0..n)
                    .map(|linear| {
                        let idx = [linear % nx, (linear / nx) % ny, linear / (nx * ny)];
                        let laplacian: f64 = (0..3)
                            .map(|a| 2.0 * (2.0 * PI * idx[a] as f64 / self.size[a] as f64).cos() - 2.0)
                            .sum();
                        1.0 / (init - beta * laplacian)
                    })
                    .collect()
            } else {
                vec![1.0 / init; n]
            };

            if let Some(linear) = buffer.iter().position(|d| !d.is_finite()) {
                return Err(SpectralError::NonFiniteDenominator {
                    axis,
                    frequency: [linear % nx, (linear / nx) % ny, linear / (nx * ny)],
                });
            }
        }
        debug!("Spectral denominator built for a {:?} lattice.", self.size);
        Ok(out)
    }

    /// Computes the next axis-major coefficients from the current ones and the gradient
    /// on the control lattice. Nothing is returned unless all three axes succeed.
    pub fn update(
        &mut self,
        parameters: &[f64],
        gradient: &[f64],
        change_direction: bool,
    ) -> Result<Vec<f64>, SpectralError> {
        let n = self.plans.len();
        for buffer in [parameters, gradient] {
            if buffer.len() != 3 * n {
                return Err(SpectralError::BufferLength {
                    expected: 3 * n,
                    actual: buffer.len(),
                });
            }
        }

        let denominator = match self.denominator.take() {
            Some(cached) => cached,
            None => self.build_denominator()?,
        };
        let result = self.solve(&denominator, parameters, gradient, change_direction);
        self.denominator = Some(denominator);
        result
    }

    fn solve(
        &self,
        denominator: &[Vec<f64>; 3],
        parameters: &[f64],
        gradient: &[f64],
        change_direction: bool,
    ) -> Result<Vec<f64>, SpectralError> {
        let n = self.plans.len();
        let inv_tau = 1.0 / self.parameters.tau();
        let sign = if change_direction { -1.0 } else { 1.0 };
        let mut next = vec![0.0; 3 * n];

        for axis in 0..3 {
            let range = axis * n..(axis + 1) * n;
            let mut spectrum: Vec<Complex<f64>> = parameters[range.clone()]
                .iter()
                .zip(&gradient[range.clone()])
                .map(|(&c, &g)| Complex::new(c * inv_tau + sign * g, 0.0))
                .collect();

            self.plans.process(&mut spectrum, false);
            for (value, &d) in spectrum.iter_mut().zip(&denominator[axis]) {
                *value *= d;
            }
            self.plans.process(&mut spectrum, true);

            for (slot, value) in next[range].iter_mut().zip(&spectrum) {
                if !value.re.is_finite() {
                    return Err(SpectralError::NonFiniteCoefficient { axis });
                }
                *slot = value.re;
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parameters(alpha: f64, beta: f64) -> SpectralParameters {
        SpectralParameters {
            step_size: 0.5,
            step_factor: 1.0,
            param_factor: 1.0,
            alpha: [alpha; 3],
            beta: [beta; 3],
        }
    }

    fn ramp(len: usize, scale: f64) -> Vec<f64> {
        (0..len).map(|i| ((i * 7 % 11) as f64 - 5.0) * scale).collect()
    }

    #[test]
    fn fft_round_trip_recovers_input() {
        let plans = FftPlans::new([4, 3, 5]);
        let original: Vec<Complex<f64>> = ramp(60, 0.3)
            .into_iter()
            .map(|v| Complex::new(v, 0.0))
            .collect();
        let mut data = original.clone();
        plans.process(&mut data, false);
        plans.process(&mut data, true);
        for (a, b) in original.iter().zip(&data) {
            assert!((a - b).norm() < 1e-12);
        }
    }

    #[test]
    fn fft_of_constant_concentrates_in_dc_term() {
        let plans = FftPlans::new([3, 2, 2]);
        let mut data = vec![Complex::new(2.0, 0.0); 12];
        plans.process(&mut data, false);
        assert!((data[0].re - 24.0).abs() < 1e-12);
        assert!(data[1..].iter().all(|c| c.norm() < 1e-12));
    }

    #[test]
    fn unregularized_update_is_explicit_gradient_step() {
        let size = [4, 4, 4];
        let mut solver = SpectralSolver::new(size, parameters(0.0, 0.0));
        let c = ramp(192, 0.1);
        let g = ramp(192, -0.02);

        let forward = solver.update(&c, &g, false).unwrap();
        let backward = solver.update(&c, &g, true).unwrap();
        let tau = 0.5;
        for i in 0..192 {
            assert!((forward[i] - (c[i] + tau * g[i])).abs() < 1e-12);
            assert!((backward[i] - (c[i] - tau * g[i])).abs() < 1e-12);
        }
    }

    #[test]
    fn alpha_only_update_is_uniform_shrinkage() {
        let mut solver = SpectralSolver::new([3, 3, 3], parameters(2.0, 0.0));
        let c = ramp(81, 1.0);
        let zero = vec![0.0; 81];
        let next = solver.update(&c, &zero, false).unwrap();
        // (c / tau) / (1 / tau + alpha) with tau = 0.5, alpha = 2.
        for i in 0..81 {
            assert!((next[i] - c[i] * 2.0 / 4.0).abs() < 1e-12);
        }
    }

    #[test]
    fn beta_smooths_but_preserves_constant_component() {
        let mut solver = SpectralSolver::new([4, 4, 4], parameters(0.0, 1.0));
        let mut c = vec![1.0; 192];
        c[5] = 3.0;
        let zero = vec![0.0; 192];
        let next = solver.update(&c, &zero, false).unwrap();

        let mean_before: f64 = c[..64].iter().sum::<f64>() / 64.0;
        let mean_after: f64 = next[..64].iter().sum::<f64>() / 64.0;
        assert!((mean_before - mean_after).abs() < 1e-12);
        assert!(next[5] < 3.0 && next[5] > 1.0);
        assert!(next[..64].iter().all(|&v| v >= 1.0 - 1e-12));
        assert!(next[64..].iter().all(|&v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn denominator_is_cached_until_parameters_change() {
        let mut solver = SpectralSolver::new([2, 2, 2], parameters(1.0, 1.0));
        assert!(!solver.is_denominator_cached());
        solver.update(&[0.0; 24], &[0.0; 24], false).unwrap();
        assert!(solver.is_denominator_cached());

        solver.set_parameters(parameters(1.0, 1.0));
        assert!(solver.is_denominator_cached());

        solver.set_parameters(parameters(0.5, 1.0));
        assert!(!solver.is_denominator_cached());

        solver.update(&[0.0; 24], &[0.0; 24], false).unwrap();
        solver.set_size([2, 2, 3]);
        assert!(!solver.is_denominator_cached());
    }

    #[test]
    fn non_finite_denominator_is_reported() {
        let params = SpectralParameters {
            step_size: f64::INFINITY,
            ..parameters(0.0, 0.0)
        };
        let mut solver = SpectralSolver::new([2, 2, 2], params);
        let result = solver.update(&[0.0; 24], &[0.0; 24], false);
        assert!(matches!(
            result,
            Err(SpectralError::NonFiniteDenominator { axis: 0, .. })
        ));
        assert!(!solver.is_denominator_cached());
    }

    #[test]
    fn non_finite_gradient_fails_the_whole_update() {
        let mut solver = SpectralSolver::new([2, 2, 2], parameters(1.0, 1.0));
        let mut g = vec![0.0; 24];
        g[20] = f64::NAN;
        let result = solver.update(&[1.0; 24], &g, false);
        assert_eq!(result, Err(SpectralError::NonFiniteCoefficient { axis: 2 }));
    }

    #[test]
    fn update_checks_buffer_lengths() {
        let mut solver = SpectralSolver::new([2, 2, 2], parameters(1.0, 1.0));
        let result = solver.update(&[0.0; 24], &[0.0; 23], false);
        assert_eq!(
            result,
            Err(SpectralError::BufferLength {
                expected: 24,
                actual: 23
            })
        );
    }
}
