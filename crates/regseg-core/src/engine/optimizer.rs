use super::config::{OptimizationConfig, RegularizationConfig};
use super::error::EngineError;
use super::functional::EnergyFunctional;
use super::progress::{Progress, ProgressReporter};
use super::regularization::regularization_energy;
use super::spectral::{SpectralError, SpectralParameters, SpectralSolver};
use super::state::{IterationRecord, StopCondition};
use crate::transform::grid::{ControlGrid, VectorField};
use crate::transform::sparse::SparseInterpolationTransform;
use nalgebra::Vector3;
use tracing::{debug, info, warn};

/// Largest per-iteration displacement of a control point, as a fraction of the grid
/// spacing, that keeps the deformation invertible.
const DIFFEOMORPHIC_FRACTION: f64 = 0.4;

/// Gradient-flow optimizer whose update is a regularized linear solve on the control
/// lattice, carried out in the frequency domain.
pub struct SpectralOptimizer {
    functional: EnergyFunctional,
    transform: SparseInterpolationTransform,
    solver: SpectralSolver,
    config: OptimizationConfig,
    initial_coefficients: Vec<f64>,
    last_field: VectorField,
    max_displacement: Vector3<f64>,
    is_diffeomorphic: bool,
    regularization: Option<f64>,
    history: Vec<IterationRecord>,
    stop_condition: Option<StopCondition>,
}

impl SpectralOptimizer {
    pub fn new(
        functional: EnergyFunctional,
        regularization: RegularizationConfig,
        config: OptimizationConfig,
    ) -> Result<Self, EngineError> {
        let grid = ControlGrid::covering(functional.reference_geometry(), config.grid_size)?;
        let mut transform = SparseInterpolationTransform::new(grid.clone());
        transform.set_sample_points(functional.prior_points());

        let parameters = SpectralParameters {
            step_size: config.step_size,
            step_factor: config.step_factor,
            param_factor: config.param_factor,
            alpha: [regularization.alpha; 3],
            beta: [regularization.beta; 3],
        };
        let solver = SpectralSolver::new(config.grid_size, parameters);

        info!(
            grid_size = ?config.grid_size,
            samples = transform.num_samples(),
            "Spectral optimizer initialized."
        );
        Ok(Self {
            functional,
            solver,
            initial_coefficients: vec![0.0; 3 * grid.num_points()],
            last_field: VectorField::zeros(grid.clone()),
            max_displacement: grid.spacing() * DIFFEOMORPHIC_FRACTION,
            transform,
            config,
            is_diffeomorphic: true,
            regularization: None,
            history: Vec::new(),
            stop_condition: None,
        })
    }

    pub fn functional(&self) -> &EnergyFunctional {
        &self.functional
    }

    pub fn functional_mut(&mut self) -> &mut EnergyFunctional {
        &mut self.functional
    }

    pub fn transform(&self) -> &SparseInterpolationTransform {
        &self.transform
    }

    pub fn control_grid(&self) -> &ControlGrid {
        self.transform.control_grid()
    }

    pub fn parameters(&self) -> &SpectralParameters {
        self.solver.parameters()
    }

    pub fn is_diffeomorphic(&self) -> bool {
        self.is_diffeomorphic
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn stop_condition(&self) -> Option<&StopCondition> {
        self.stop_condition.as_ref()
    }

    pub fn initial_coefficients(&self) -> &[f64] {
        &self.initial_coefficients
    }

    /// Starts the deformation from `field`, a dense displacement field sampled at the
    /// control points.
    pub fn set_initial_field(&mut self, field: &VectorField) -> Result<(), EngineError> {
        self.initial_coefficients = self.transform.compute_coefficients(field)?;
        self.regularization = None;
        self.push_displacements()?;
        info!("Initial displacement field installed.");
        Ok(())
    }

    pub fn set_step_size(&mut self, step_size: f64) {
        self.update_parameters(|p| p.step_size = step_size);
    }

    pub fn set_alpha(&mut self, alpha: [f64; 3]) {
        self.update_parameters(|p| p.alpha = alpha);
    }

    pub fn set_beta(&mut self, beta: [f64; 3]) {
        self.update_parameters(|p| p.beta = beta);
    }

    fn update_parameters(&mut self, change: impl FnOnce(&mut SpectralParameters)) {
        let mut parameters = *self.solver.parameters();
        change(&mut parameters);
        self.solver.set_parameters(parameters);
        self.regularization = None;
    }

    /// Rebuilds the control grid with a new number of points per axis. The current and
    /// initial coefficients are reset.
    pub fn set_grid_size(&mut self, size: [usize; 3]) -> Result<(), EngineError> {
        let grid = ControlGrid::covering(self.functional.reference_geometry(), size)?;
        self.transform.set_control_grid(grid.clone());
        self.solver.set_size(size);
        self.config.grid_size = size;
        self.initial_coefficients = vec![0.0; 3 * grid.num_points()];
        self.max_displacement = grid.spacing() * DIFFEOMORPHIC_FRACTION;
        self.last_field = VectorField::zeros(grid);
        self.regularization = None;
        self.push_displacements()
    }

    /// Coefficients of the total deformation, initial plus current.
    pub fn total_coefficients(&self) -> Vec<f64> {
        self.initial_coefficients
            .iter()
            .zip(self.transform.coefficients())
            .map(|(a, b)| a + b)
            .collect()
    }

    /// Functional gradient splatted onto the control lattice, axis-major.
    pub fn compute_derivative(&mut self) -> Result<Vec<f64>, EngineError> {
        let vertex_gradient = self.functional.compute_derivative()?;
        Ok(self.transform.splat(&vertex_gradient)?)
    }

    /// Next coefficients from the current ones and a lattice gradient. The stored
    /// coefficients are not touched.
    pub fn spectral_update(
        &mut self,
        gradient: &[f64],
        change_direction: bool,
    ) -> Result<Vec<f64>, SpectralError> {
        self.solver
            .update(self.transform.coefficients(), gradient, change_direction)
    }

    /// Installs `next` as the current coefficients and propagates the deformation to the
    /// functional.
    pub fn post_iteration(&mut self, next: Vec<f64>) -> Result<IterationRecord, EngineError> {
        let field = self.transform.field_at_nodes(&next)?;
        self.transform.set_coefficients(next)?;

        let num_nodes = field.grid().num_points();
        let mut total_change = 0.0;
        for node in 0..num_nodes {
            let change = field.at_node(node) - self.last_field.at_node(node);
            total_change += change.norm();
            if self.is_diffeomorphic
                && (0..3).any(|axis| change[axis].abs() > self.max_displacement[axis])
            {
                warn!(node, "Control point moved beyond the diffeomorphic bound.");
                self.is_diffeomorphic = false;
            }
        }
        let mean_change = total_change / num_nodes as f64;
        if total_change != 0.0 {
            self.regularization = None;
        }
        self.last_field = field;

        self.push_displacements()?;

        let value = if self.config.lightweight_convergence {
            mean_change.ln_1p()
        } else {
            self.total_energy()?
        };

        let record = IterationRecord {
            iteration: self.history.len() + 1,
            value,
            mean_change,
            is_diffeomorphic: self.is_diffeomorphic,
        };
        self.history.push(record.clone());
        Ok(record)
    }

    fn push_displacements(&mut self) -> Result<(), EngineError> {
        let total = self.total_coefficients();
        let displacements = self.transform.interpolate(&total)?;
        self.functional.set_current_displacements(&displacements)
    }

    /// Regularization energy of the total deformation, cached until the field changes.
    pub fn regularization_energy(&mut self) -> Result<f64, EngineError> {
        if let Some(energy) = self.regularization {
            return Ok(energy);
        }
        let total = self.total_coefficients();
        let field = self.transform.field_at_nodes(&total)?;
        let energy = regularization_energy(&field, self.solver.parameters());
        self.regularization = Some(energy);
        Ok(energy)
    }

    /// Functional value plus regularization energy.
    pub fn total_energy(&mut self) -> Result<f64, EngineError> {
        Ok(self.functional.value()? + self.regularization_energy()?)
    }

    /// Iterates until convergence, the iteration limit, a diffeomorphism violation (when
    /// configured to stop on it) or a failed update.
    pub fn run(&mut self, reporter: &ProgressReporter) -> Result<StopCondition, EngineError> {
        let max_iterations = self.config.max_iterations;
        let threshold = self.config.convergence_threshold;
        let mut stop = StopCondition::MaximumIterations {
            iterations: max_iterations,
        };

        for iter in 0..max_iterations {
            let gradient = self.compute_derivative()?;
            let next = match self.spectral_update(&gradient, false) {
                Ok(next) => next,
                Err(err) => {
                    warn!(iteration = iter + 1, "Spectral update failed: {}", err);
                    self.stop_condition = Some(StopCondition::UpdateParametersError {
                        reason: err.to_string(),
                    });
                    return Err(err.into());
                }
            };
            let record = self.post_iteration(next)?;

            debug!(
                iteration = record.iteration,
                value = record.value,
                mean_change = record.mean_change,
                "Iteration finished."
            );
            reporter.report(Progress::IterationFinished {
                iteration: record.iteration,
                value: record.value,
                mean_change: record.mean_change,
            });

            if !record.is_diffeomorphic && self.config.stop_on_non_diffeomorphic {
                stop = StopCondition::NonDiffeomorphic {
                    iteration: record.iteration,
                };
                break;
            }
            if record.mean_change < threshold {
                stop = StopCondition::Converged {
                    mean_change: record.mean_change,
                    threshold,
                };
                break;
            }
        }

        if !self.is_diffeomorphic {
            reporter.report(Progress::Warning(
                "Deformation is not guaranteed to be diffeomorphic.".to_string(),
            ));
        }
        info!(iterations = self.history.len(), "{}", stop);
        self.stop_condition = Some(stop.clone());
        Ok(stop)
    }

    /// Dense total deformation at the control points.
    pub fn total_field(&mut self) -> Result<VectorField, EngineError> {
        let total = self.total_coefficients();
        Ok(self.transform.field_at_nodes(&total)?)
    }

    /// Consumes the optimizer, returning the functional and a transform whose stored
    /// coefficients describe the total deformation.
    pub fn into_parts(self) -> Result<(EnergyFunctional, SparseInterpolationTransform), EngineError> {
        let total = self.total_coefficients();
        let mut transform = self.transform;
        transform.set_coefficients(total)?;
        Ok((self.functional, transform))
    }
}
