use crate::core::models::contour::Contour;
use crate::core::models::image::{ProbabilityMap, ReferenceImage};
use crate::engine::config::RegistrationConfig;
use crate::engine::energy::SampleEnergy;
use crate::engine::error::EngineError;
use crate::engine::functional::{EnergyFunctional, FunctionalDiagnostics, RegionEnergy};
use crate::engine::optimizer::SpectralOptimizer;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::state::{IterationRecord, StopCondition};
use crate::transform::grid::VectorField;
use crate::transform::sparse::SparseInterpolationTransform;
use nalgebra::{Point3, Vector3};
use tracing::{info, instrument};

/// Everything a registration starts from.
pub struct RegistrationInputs {
    pub reference: ReferenceImage,
    /// Prior contours in region order; the background region is implicit.
    pub contours: Vec<Contour>,
    pub background: Option<ProbabilityMap>,
    pub energy: Box<dyn SampleEnergy>,
    /// Displacement at the control points to start from. Its grid must match the one
    /// covering the reference image with the configured grid size.
    pub initial_field: Option<VectorField>,
}

impl RegistrationInputs {
    pub fn new(
        reference: ReferenceImage,
        contours: Vec<Contour>,
        energy: Box<dyn SampleEnergy>,
    ) -> Self {
        Self {
            reference,
            contours,
            background: None,
            energy,
            initial_field: None,
        }
    }

    pub fn with_background(mut self, background: ProbabilityMap) -> Self {
        self.background = Some(background);
        self
    }

    pub fn with_initial_field(mut self, field: VectorField) -> Self {
        self.initial_field = Some(field);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RegistrationResult {
    /// Transform holding the total deformation; evaluable at any physical point.
    pub transform: SparseInterpolationTransform,
    /// Total deformation sampled at the control points.
    pub field: VectorField,
    pub contours: Vec<Contour>,
    pub region_energies: Vec<RegionEnergy>,
    pub functional_energy: f64,
    pub regularization_energy: f64,
    pub stop_condition: StopCondition,
    pub history: Vec<IterationRecord>,
    pub is_diffeomorphic: bool,
    pub diagnostics: FunctionalDiagnostics,
}

impl RegistrationResult {
    pub fn displacement_at(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.transform.evaluate(point)
    }

    pub fn total_energy(&self) -> f64 {
        self.functional_energy + self.regularization_energy
    }
}

#[instrument(skip_all, name = "registration_workflow")]
pub fn run(
    inputs: RegistrationInputs,
    config: &RegistrationConfig,
    reporter: &ProgressReporter,
) -> Result<RegistrationResult, EngineError> {
    let RegistrationInputs {
        reference,
        contours,
        background,
        energy,
        initial_field,
    } = inputs;

    // === Phase 0: Preparation ===
    reporter.report(Progress::PhaseStart {
        name: "Preparation",
    });
    info!(
        contours = contours.len(),
        smoothing_sigma = config.functional.smoothing_sigma,
        "Preparing the energy functional."
    );
    let functional =
        EnergyFunctional::new(reference, contours, background, energy, &config.functional)?;
    report_diagnostics(functional.diagnostics(), reporter);
    reporter.report(Progress::PhaseFinish);

    // === Phase 1: Optimizer initialization ===
    reporter.report(Progress::PhaseStart {
        name: "Optimizer Initialization",
    });
    let mut optimizer = SpectralOptimizer::new(
        functional,
        config.regularization,
        config.optimization.clone(),
    )?;
    if let Some(field) = &initial_field {
        optimizer.set_initial_field(field)?;
    }
    let initial_energy = optimizer.total_energy()?;
    info!(energy = initial_energy, "Initial energy calculated.");
    reporter.report(Progress::PhaseFinish);

    // === Phase 2: Spectral optimization ===
    reporter.report(Progress::PhaseStart {
        name: "Spectral Optimization",
    });
    let stop_condition = optimizer.run(reporter)?;
    reporter.report(Progress::Message(stop_condition.description()));
    reporter.report(Progress::PhaseFinish);

    // === Phase 3: Collect results ===
    let result = finalize_results(optimizer, stop_condition, reporter)?;
    info!(
        total_energy = result.total_energy(),
        iterations = result.history.len(),
        "Workflow complete."
    );
    Ok(result)
}

fn finalize_results(
    mut optimizer: SpectralOptimizer,
    stop_condition: StopCondition,
    reporter: &ProgressReporter,
) -> Result<RegistrationResult, EngineError> {
    reporter.report(Progress::PhaseStart {
        name: "Finalization",
    });

    let functional_energy = optimizer.functional_mut().value()?;
    let regularization_energy = optimizer.regularization_energy()?;
    let field = optimizer.total_field()?;
    let history = optimizer.history().to_vec();
    let is_diffeomorphic = optimizer.is_diffeomorphic();

    let (mut functional, transform) = optimizer.into_parts()?;
    functional.update_contours()?;
    let region_energies = functional.region_energies().to_vec();
    let diagnostics = functional.diagnostics().clone();
    report_diagnostics(&diagnostics, reporter);

    reporter.report(Progress::PhaseFinish);
    Ok(RegistrationResult {
        transform,
        field,
        contours: functional.into_contours(),
        region_energies,
        functional_energy,
        regularization_energy,
        stop_condition,
        history,
        is_diffeomorphic,
        diagnostics,
    })
}

fn report_diagnostics(diagnostics: &FunctionalDiagnostics, reporter: &ProgressReporter) {
    if !diagnostics.clamped_vertices.is_empty() {
        reporter.report(Progress::Warning(format!(
            "{} vertices are clamped to the image border.",
            diagnostics.clamped_vertices.len()
        )));
    }
    for region in &diagnostics.empty_regions {
        reporter.report(Progress::Warning(format!("{} is empty.", region)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::ids::RegionId;
    use crate::core::models::image::{ImageGeometry, Volume};
    use crate::engine::energy::{MahalanobisModel, RegionModel};
    use crate::transform::grid::ControlGrid;
    use std::sync::Mutex;

    const CENTER: f64 = 9.5;

    fn reference() -> ReferenceImage {
        let geometry =
            ImageGeometry::new([20, 20, 20], Vector3::new(1.0, 1.0, 1.0), Point3::origin()).unwrap();
        let center = Point3::new(CENTER, CENTER, CENTER);
        let g = geometry.clone();
        let volume = Volume::from_fn(geometry, |idx| {
            if (g.voxel_center(idx) - center).norm() < 5.0 {
                100.0
            } else {
                0.0
            }
        });
        ReferenceImage::new(volume).unwrap()
    }

    fn inputs() -> RegistrationInputs {
        let model = MahalanobisModel::new(vec![
            RegionModel {
                mean: 100.0,
                variance: 100.0,
            },
            RegionModel {
                mean: 0.0,
                variance: 100.0,
            },
        ])
        .unwrap();
        let contour = Contour::icosphere(Point3::new(CENTER, CENTER, CENTER), 3.0, 2);
        RegistrationInputs::new(reference(), vec![contour], Box::new(model))
    }

    fn config() -> RegistrationConfig {
        RegistrationConfig::builder()
            .alpha(0.0)
            .beta(0.0)
            .step_size(2.5e-4)
            .max_iterations(4)
            .convergence_threshold(0.0)
            .build()
            .unwrap()
    }

    #[test]
    fn registration_reports_phases_and_iterations() {
        let events = Mutex::new(Vec::new());
        let reporter = ProgressReporter::with_callback(Box::new(|event| {
            events.lock().unwrap().push(event);
        }));

        let result = run(inputs(), &config(), &reporter).unwrap();
        assert_eq!(result.stop_condition, StopCondition::MaximumIterations { iterations: 4 });
        assert_eq!(result.history.len(), 4);

        let events = events.lock().unwrap().clone();
        let phases: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                Progress::PhaseStart { name } => Some(*name),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                "Preparation",
                "Optimizer Initialization",
                "Spectral Optimization",
                "Finalization"
            ]
        );
        let iterations = events
            .iter()
            .filter(|e| matches!(e, Progress::IterationFinished { .. }))
            .count();
        assert_eq!(iterations, 4);
    }

    #[test]
    fn registration_grows_an_undersized_contour() {
        let initial_volume = inputs().contours[0].enclosed_volume();
        let result = run(inputs(), &config(), &ProgressReporter::new()).unwrap();

        assert_eq!(result.contours.len(), 1);
        assert!(result.contours[0].enclosed_volume() > initial_volume);
        assert_eq!(result.region_energies.len(), 2);
        assert_eq!(result.regularization_energy, 0.0);
        assert!(result.is_diffeomorphic);

        let probe = Point3::new(CENTER + 3.0, CENTER, CENTER);
        assert!(result.displacement_at(&probe).x > 0.0);
    }

    #[test]
    fn initial_field_on_a_foreign_grid_is_rejected() {
        let grid = ControlGrid::new([5, 5, 5], Vector3::new(4.0, 4.0, 4.0), Point3::origin())
            .unwrap();
        let inputs = inputs().with_initial_field(VectorField::zeros(grid));
        let err = run(inputs, &config(), &ProgressReporter::new()).unwrap_err();
        assert!(matches!(err, EngineError::Transform { .. }));
    }

    #[test]
    fn saturated_background_is_reported_in_diagnostics() {
        let full = Volume::filled(reference().geometry().clone(), 1.0);
        let inputs = inputs().with_background(ProbabilityMap::from_background(full).unwrap());
        let result = run(inputs, &config(), &ProgressReporter::new()).unwrap();
        assert_eq!(result.functional_energy, 0.0);
        assert_eq!(result.diagnostics.off_mask_vertices.len(), 1);
        assert!(result.diagnostics.off_mask_vertices[0] > 0);
    }

    #[test]
    fn closures_can_drive_a_registration() {
        let energy: Box<dyn SampleEnergy> = Box::new(|value: f64, region: RegionId| {
            let mean = if region.index() == 0 { 100.0 } else { 0.0 };
            (value - mean).abs()
        });
        let contour = Contour::icosphere(Point3::new(CENTER, CENTER, CENTER), 3.0, 2);
        let inputs = RegistrationInputs::new(reference(), vec![contour], energy);
        let result = run(inputs, &config(), &ProgressReporter::new()).unwrap();
        assert_eq!(result.history.len(), 4);
        assert!(result.history.iter().all(|r| r.mean_change.is_finite()));
    }
}
