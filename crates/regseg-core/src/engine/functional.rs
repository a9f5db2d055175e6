use super::cache::CacheValidity;
use super::config::{ConfigError, FunctionalConfig};
use super::energy::SampleEnergy;
use super::error::EngineError;
use super::partition::{RegionPartition, RegionPartitioner};
use crate::core::models::contour::Contour;
use crate::core::models::ids::{ContourId, RegionId, VertexId};
use crate::core::models::image::{ImageGeometry, ProbabilityMap, ReferenceImage};
use nalgebra::{Point3, Vector3};
use std::iter::Sum;
use std::ops::Add;
use tracing::{debug, info, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const MIN_DISPLACEMENT: f64 = 1e-8;
const MIN_REGION_WEIGHT: f64 = 1e-8;
const MIN_GRADIENT: f64 = 1e-5;
const BACKGROUND_ON: f64 = 1e-3;
const BACKGROUND_SATURATED: f64 = 0.999;
const OFF_MASK_TOLERANCE: f64 = 1e-5;
const BACKGROUND_GRADIENT_PENALTY: f64 = 100.0;

/// Outward normal and scalar speed of a vertex. The descent direction is
/// `magnitude * normal`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VertexGradient {
    pub normal: Vector3<f64>,
    pub magnitude: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegionEnergy {
    pub energy: f64,
    /// Physical volume, weighted by region probability and tissue probability.
    pub volume: f64,
}

impl Add for RegionEnergy {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            energy: self.energy + other.energy,
            volume: self.volume + other.volume,
        }
    }
}

impl Sum for RegionEnergy {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, term| acc + term)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionalDiagnostics {
    pub invalid_vertices: usize,
    pub clamped_vertices: Vec<VertexId>,
    /// Per contour, vertices sitting where the background mask is saturated.
    pub off_mask_vertices: Vec<usize>,
    pub gradient_outliers: usize,
    pub empty_regions: Vec<RegionId>,
}

#[derive(Debug, Clone, Copy)]
struct VertexState {
    contour: ContourId,
    outer: Option<RegionId>,
    clamped: bool,
}

impl VertexState {
    #[inline]
    fn is_mobile(&self) -> bool {
        self.outer.is_some() && !self.clamped
    }
}

/// Region-based energy of the partition induced by a set of contours, and its
/// derivative with respect to vertex positions.
pub struct EnergyFunctional {
    reference: ReferenceImage,
    background: ProbabilityMap,
    use_background: bool,
    energy: Box<dyn SampleEnergy>,
    contours: Vec<Contour>,
    offsets: Vec<usize>,
    vertices: Vec<VertexState>,
    displacements: Vec<f64>,
    partitioner: RegionPartitioner,
    partition: Option<RegionPartition>,
    region_energies: Vec<RegionEnergy>,
    gradients: Vec<VertexGradient>,
    max_energy: f64,
    decile_threshold: f64,
    cache: CacheValidity,
    diagnostics: FunctionalDiagnostics,
}

impl EnergyFunctional {
    pub fn new(
        reference: ReferenceImage,
        contours: Vec<Contour>,
        background: Option<ProbabilityMap>,
        energy: Box<dyn SampleEnergy>,
        config: &FunctionalConfig,
    ) -> Result<Self, EngineError> {
        if contours.is_empty() {
            return Err(ConfigError::InvalidParameter {
                name: "contours",
                reason: "at least one contour is required".to_string(),
            }
            .into());
        }

        let reference = reference.smoothed(config.smoothing_sigma);
        let geometry = reference.geometry().clone();
        let (background, use_background) = match background {
            Some(map) => (map.aligned_to(&geometry), true),
            None => (ProbabilityMap::zeros(geometry.clone()), false),
        };

        let mut offsets = Vec::with_capacity(contours.len() + 1);
        offsets.push(0);
        let mut vertices = Vec::new();
        for (c, contour) in contours.iter().enumerate() {
            offsets.push(offsets[c] + contour.num_vertices());
            vertices.extend((0..contour.num_vertices()).map(|_| VertexState {
                contour: ContourId(c),
                outer: None,
                clamped: false,
            }));
        }
        let num_vertices = vertices.len();
        let num_regions = contours.len() + 1;

        let (lo, hi) = reference.intensity_range();
        let max_energy = (0..num_regions)
            .flat_map(|r| [energy.energy(lo, RegionId(r)), energy.energy(hi, RegionId(r))])
            .filter(|e| e.is_finite())
            .fold(0.0f64, f64::max);

        let mut functional = Self {
            partitioner: RegionPartitioner::new(&geometry, config.sampling_factor),
            reference,
            background,
            use_background,
            energy,
            contours,
            offsets,
            vertices,
            displacements: vec![0.0; 3 * num_vertices],
            partition: None,
            region_energies: vec![RegionEnergy::default(); num_regions],
            gradients: Vec::new(),
            max_energy,
            decile_threshold: config.decile_threshold,
            cache: CacheValidity::stale(),
            diagnostics: FunctionalDiagnostics::default(),
        };

        functional.compute_current_regions()?;
        functional.classify_vertices(config.probe_distance);
        Ok(functional)
    }

    /// Decides once which vertices are allowed to move: a vertex is valid when a probe
    /// along the inward normal lands in its own region and a probe along the outward
    /// normal lands in a different one.
    fn classify_vertices(&mut self, probe: f64) {
        let Some(partition) = &self.partition else {
            return;
        };
        for (c, contour) in self.contours.iter().enumerate() {
            let own = ContourId(c).region();
            for (i, (point, normal)) in contour.points().iter().zip(contour.normals()).enumerate() {
                let inner = partition.region_at(&(point - normal * probe));
                let outer = partition.region_at(&(point + normal * probe));
                if inner == own && outer != inner {
                    self.vertices[self.offsets[c] + i].outer = Some(outer);
                }
            }
        }

        let invalid = self.vertices.iter().filter(|v| v.outer.is_none()).count();
        self.diagnostics.invalid_vertices = invalid;
        if invalid > 0 {
            warn!(
                "{} of {} vertices are not on a region boundary and will not move.",
                invalid,
                self.vertices.len()
            );
        }
        info!(
            "Initialized {} contours with {} vertices.",
            self.contours.len(),
            self.vertices.len()
        );
    }

    #[inline]
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    #[inline]
    pub fn num_regions(&self) -> usize {
        self.contours.len() + 1
    }

    pub fn reference(&self) -> &ReferenceImage {
        &self.reference
    }

    pub fn uses_background(&self) -> bool {
        self.use_background
    }

    pub fn max_energy(&self) -> f64 {
        self.max_energy
    }

    pub fn displacements(&self) -> &[f64] {
        &self.displacements
    }

    pub fn contour_of(&self, vertex: VertexId) -> ContourId {
        self.vertices[vertex.0].contour
    }

    /// Region on the outer side of a valid vertex; `None` for vertices that never move.
    pub fn outer_region(&self, vertex: VertexId) -> Option<RegionId> {
        self.vertices[vertex.0].outer
    }

    pub fn prior_points(&self) -> Vec<Point3<f64>> {
        self.contours
            .iter()
            .flat_map(|c| c.prior_points().iter().copied())
            .collect()
    }

    pub fn gradients(&self) -> &[VertexGradient] {
        &self.gradients
    }

    pub fn region_energies(&self) -> &[RegionEnergy] {
        &self.region_energies
    }

    pub fn partition(&self) -> Option<&RegionPartition> {
        self.partition.as_ref()
    }

    pub fn diagnostics(&self) -> &FunctionalDiagnostics {
        &self.diagnostics
    }

    pub fn into_contours(self) -> Vec<Contour> {
        self.contours
    }

    /// Stores a new axis-major displacement buffer (`axis * num_vertices + vertex`).
    /// Vertices whose displacement changed by less than a negligible amount keep their
    /// previous value; any change marks every derived quantity stale.
    pub fn set_current_displacements(&mut self, values: &[f64]) -> Result<(), EngineError> {
        let n = self.num_vertices();
        if values.len() != 3 * n {
            return Err(ConfigError::LengthMismatch {
                name: "displacements",
                expected: 3 * n,
                actual: values.len(),
            }
            .into());
        }

        let mut changed = 0;
        for v in 0..n {
            let delta = Vector3::new(
                values[v] - self.displacements[v],
                values[n + v] - self.displacements[n + v],
                values[2 * n + v] - self.displacements[2 * n + v],
            );
            if delta.norm() > MIN_DISPLACEMENT {
                for axis in 0..3 {
                    self.displacements[axis * n + v] = values[axis * n + v];
                }
                changed += 1;
            }
        }

        if changed > 0 {
            self.cache.invalidate();
        }
        debug!("Updated displacements of {} vertices.", changed);
        Ok(())
    }

    /// Moves every contour to its prior points plus the current displacements, clamping
    /// vertices that left the image domain onto the border pixel centres.
    pub fn update_contours(&mut self) -> Result<&[Contour], EngineError> {
        if self.cache.displacements_pending() {
            let n = self.vertices.len();
            let geometry = self.reference.geometry();
            let displacements = &self.displacements;
            let states = &mut self.vertices;
            let mut clamped = Vec::new();

            for (c, contour) in self.contours.iter_mut().enumerate() {
                let offset = self.offsets[c];
                let mut points = Vec::with_capacity(contour.num_vertices());
                for (i, prior) in contour.prior_points().iter().enumerate() {
                    let v = offset + i;
                    let moved = prior
                        + Vector3::new(
                            displacements[v],
                            displacements[n + v],
                            displacements[2 * n + v],
                        );
                    let (point, was_clamped) = clamp_to_domain(geometry, &moved);
                    states[v].clamped = was_clamped;
                    if was_clamped {
                        clamped.push(VertexId(v));
                    }
                    points.push(point);
                }
                contour.set_points(points)?;
            }

            if !clamped.is_empty() {
                warn!(
                    "{} vertices were moved off the image domain and clamped to its border.",
                    clamped.len()
                );
            }
            self.diagnostics.clamped_vertices = clamped;
            self.cache.mark_displacements_applied();
        }
        Ok(&self.contours)
    }

    /// Rebuilds the partition from the current contours. Returns the regions that ended
    /// up empty.
    pub fn compute_current_regions(&mut self) -> Result<Vec<RegionId>, EngineError> {
        self.update_contours()?;
        let partition = self.partitioner.partition(&self.contours);
        let empty = partition.empty_regions();
        self.diagnostics.empty_regions = empty.clone();
        self.partition = Some(partition);
        self.cache.mark_regions_built();
        Ok(empty)
    }

    /// Total energy of the current partition.
    pub fn value(&mut self) -> Result<f64, EngineError> {
        if self.cache.displacements_pending() || self.cache.regions_stale() {
            self.compute_current_regions()?;
        }
        if self.cache.energy_stale() {
            self.compute_region_energies()?;
        }
        Ok(self.region_energies.iter().map(|r| r.energy).sum())
    }

    fn compute_region_energies(&mut self) -> Result<(), EngineError> {
        let partition = self
            .partition
            .as_ref()
            .ok_or_else(|| EngineError::Internal("partition requested before rasterization".into()))?;
        let geometry = self.reference.geometry();
        let maps = partition.probability_maps(geometry);
        let values = self.reference.values();
        let background = self.background.weights();
        let voxel_volume = geometry.voxel_volume();

        let energies: Vec<RegionEnergy> = maps
            .iter()
            .enumerate()
            .map(|(r, map)| {
                let iterator = 0..values.len();

                #[cfg(feature = "parallel")]
                let iterator = iterator.into_par_iter();

                let total: RegionEnergy = iterator
                    .map(|i| {
                        let bg = if self.use_background { background[i] } else { 0.0 };
                        self.voxel_contribution(values[i], map[i], bg, RegionId(r))
                    })
                    .sum();
                RegionEnergy {
                    energy: total.energy,
                    volume: total.volume * voxel_volume,
                }
            })
            .collect();

        debug!(
            "Region energies: {:?}",
            energies.iter().map(|r| r.energy).collect::<Vec<_>>()
        );
        self.region_energies = energies;
        self.cache.mark_energy_computed();
        Ok(())
    }

    /// Where the background is partially present the statistical energy is replaced by
    /// the maximum energy and the region weight is scaled by the tissue probability.
    #[inline]
    fn voxel_contribution(&self, value: f64, weight: f64, bg: f64, region: RegionId) -> RegionEnergy {
        if !(bg < BACKGROUND_SATURATED) || weight < MIN_REGION_WEIGHT {
            return RegionEnergy::default();
        }
        let (energy, weight) = if bg > BACKGROUND_ON {
            (self.max_energy, weight * (1.0 - bg))
        } else {
            (self.energy.energy(value, region), weight)
        };
        RegionEnergy {
            energy: weight * energy,
            volume: weight,
        }
    }

    /// Per-vertex descent vectors, axis-major (`axis * num_vertices + vertex`). Vertices
    /// that were classified invalid or are clamped to the domain border contribute zero.
    pub fn compute_derivative(&mut self) -> Result<Vec<f64>, EngineError> {
        self.update_contours()?;

        let samples: Vec<(Point3<f64>, Vector3<f64>)> = self
            .contours
            .iter()
            .flat_map(|c| c.points().iter().copied().zip(c.normals().iter().copied()))
            .collect();

        #[cfg(not(feature = "parallel"))]
        let iterator = samples.iter().zip(self.vertices.iter());

        #[cfg(feature = "parallel")]
        let iterator = samples.par_iter().zip(self.vertices.par_iter());

        let evaluated: Vec<(VertexGradient, f64)> = iterator
            .map(|((point, normal), state)| {
                let bg = self.background_at(point);
                let magnitude = if state.is_mobile() {
                    self.vertex_speed(point, bg, state)
                } else {
                    0.0
                };
                (
                    VertexGradient {
                        normal: *normal,
                        magnitude,
                    },
                    bg,
                )
            })
            .collect();

        let n = self.num_vertices();
        let mut derivative = vec![0.0; 3 * n];
        let mut off_mask = vec![0usize; self.contours.len()];
        for (v, (gradient, bg)) in evaluated.iter().enumerate() {
            for axis in 0..3 {
                derivative[axis * n + v] = gradient.magnitude * gradient.normal[axis];
            }
            if self.use_background && 1.0 - bg < OFF_MASK_TOLERANCE {
                off_mask[self.vertices[v].contour.0] += 1;
            }
        }
        for (c, count) in off_mask.iter().enumerate().filter(|(_, count)| **count > 0) {
            debug!("{} has {} vertices outside the tissue mask.", ContourId(c), count);
        }

        self.gradients = evaluated.into_iter().map(|(gradient, _)| gradient).collect();
        self.diagnostics.off_mask_vertices = off_mask;
        self.diagnostics.gradient_outliers = count_outliers(&self.gradients, self.decile_threshold);
        Ok(derivative)
    }

    fn vertex_speed(&self, point: &Point3<f64>, bg: f64, state: &VertexState) -> f64 {
        let inner = state.contour.region();
        let Some(outer) = state.outer else {
            return 0.0;
        };
        if outer == inner {
            return 0.0;
        }
        let value = self.reference.value_at(point);
        let mut speed = self.energy.energy(value, outer);
        if bg < BACKGROUND_ON {
            speed -= self.energy.energy(value, inner);
        } else {
            speed += BACKGROUND_GRADIENT_PENALTY * bg.min(1.0) * self.max_energy;
        }
        if speed.abs() > MIN_GRADIENT { speed } else { 0.0 }
    }

    #[inline]
    fn background_at(&self, point: &Point3<f64>) -> f64 {
        if self.use_background {
            self.background.weight_at(point)
        } else {
            0.0
        }
    }

    /// Energy of assigning `point` to `region`, including the background penalty, which
    /// grows for regions earlier in the contour order.
    pub fn energy_at_point(&self, point: &Point3<f64>, region: RegionId) -> f64 {
        let mut bg = self.background_at(point);
        if bg > 1.0 {
            bg = 1.0;
        } else if bg < BACKGROUND_ON {
            bg = 0.0;
        }
        let num_regions = self.num_regions() as f64;
        let factor = (num_regions - region.index() as f64) / num_regions;
        let value = self.reference.value_at(point);
        self.energy.energy(value, region) + bg * factor * self.max_energy
    }

    pub fn reference_geometry(&self) -> &ImageGeometry {
        self.reference.geometry()
    }
}

fn clamp_to_domain(geometry: &ImageGeometry, point: &Point3<f64>) -> (Point3<f64>, bool) {
    let mut idx = geometry.physical_to_continuous_index(point);
    let mut clamped = false;
    for axis in 0..3 {
        let last = (geometry.size[axis] - 1) as f64;
        if idx[axis] < 0.0 {
            idx[axis] = 0.0;
            clamped = true;
        } else if idx[axis] > last {
            idx[axis] = last;
            clamped = true;
        }
    }
    if clamped {
        (geometry.index_to_physical(&idx), true)
    } else {
        (*point, false)
    }
}

/// Number of gradient magnitudes above the `1 - fraction` quantile.
fn count_outliers(gradients: &[VertexGradient], fraction: f64) -> usize {
    if gradients.is_empty() || !(fraction > 0.0) {
        return 0;
    }
    let mut magnitudes: Vec<f64> = gradients.iter().map(|g| g.magnitude.abs()).collect();
    magnitudes.sort_by(f64::total_cmp);
    let rank = (((1.0 - fraction) * magnitudes.len() as f64).floor() as usize).min(magnitudes.len() - 1);
    let threshold = magnitudes[rank];
    magnitudes.iter().filter(|&&m| m > threshold).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::image::Volume;
    use crate::engine::energy::{MahalanobisModel, RegionModel};

    const CENTER: f64 = 9.5;
    const OBJECT_RADIUS: f64 = 5.0;

    fn geometry() -> ImageGeometry {
        ImageGeometry::new([20, 20, 20], Vector3::new(1.0, 1.0, 1.0), Point3::origin()).unwrap()
    }

    fn reference() -> ReferenceImage {
        let center = Point3::new(CENTER, CENTER, CENTER);
        let g = geometry();
        let volume = Volume::from_fn(g.clone(), |idx| {
            if (g.voxel_center(idx) - center).norm() < OBJECT_RADIUS {
                100.0
            } else {
                0.0
            }
        });
        ReferenceImage::new(volume).unwrap()
    }

    fn model() -> Box<dyn SampleEnergy> {
        Box::new(
            MahalanobisModel::new(vec![
                RegionModel {
                    mean: 100.0,
                    variance: 100.0,
                },
                RegionModel {
                    mean: 0.0,
                    variance: 100.0,
                },
            ])
            .unwrap(),
        )
    }

    fn config() -> FunctionalConfig {
        FunctionalConfig {
            smoothing_sigma: 0.0,
            sampling_factor: 2.0,
            decile_threshold: 0.05,
            probe_distance: 1.0,
        }
    }

    fn sphere(radius: f64) -> Contour {
        Contour::icosphere(Point3::new(CENTER, CENTER, CENTER), radius, 2)
    }

    fn functional(radius: f64, background: Option<ProbabilityMap>) -> EnergyFunctional {
        EnergyFunctional::new(reference(), vec![sphere(radius)], background, model(), &config())
            .unwrap()
    }

    #[test]
    fn new_rejects_empty_contour_list() {
        let result = EnergyFunctional::new(reference(), Vec::new(), None, model(), &config());
        assert!(matches!(result, Err(EngineError::Configuration { .. })));
    }

    #[test]
    fn max_energy_covers_the_intensity_extremes() {
        let functional = functional(3.5, None);
        assert!((functional.max_energy() - 100.0).abs() < 1e-12);
        assert!(!functional.uses_background());
    }

    #[test]
    fn energy_is_lower_when_contour_matches_the_object() {
        let mut small = functional(3.0, None);
        let mut matched = functional(OBJECT_RADIUS, None);
        let small_energy = small.value().unwrap();
        let matched_energy = matched.value().unwrap();
        assert!(
            matched_energy < 0.5 * small_energy,
            "matched {matched_energy}, small {small_energy}"
        );
    }

    #[test]
    fn region_volumes_add_up_to_the_domain() {
        let mut functional = functional(3.5, None);
        functional.value().unwrap();
        let total: f64 = functional.region_energies().iter().map(|r| r.volume).sum();
        assert!((total - 8000.0).abs() < 1e-6);
    }

    #[test]
    fn gradient_pushes_an_undersized_contour_outward() {
        let mut functional = functional(3.0, None);
        let derivative = functional.compute_derivative().unwrap();
        let n = functional.num_vertices();
        assert_eq!(derivative.len(), 3 * n);

        let gradients = functional.gradients();
        assert!(gradients.iter().any(|g| g.magnitude > 0.0));
        for (v, gradient) in gradients.iter().enumerate() {
            assert!(gradient.magnitude >= 0.0);
            let d = Vector3::new(derivative[v], derivative[n + v], derivative[2 * n + v]);
            assert!((d - gradient.normal * gradient.magnitude).norm() < 1e-12);
        }
    }

    #[test]
    fn invalid_vertices_have_zero_gradient() {
        let contours = vec![
            Contour::icosphere(Point3::new(8.0, CENTER, CENTER), 3.0, 2),
            Contour::icosphere(Point3::new(11.0, CENTER, CENTER), 3.0, 2),
        ];
        let energy: Box<dyn SampleEnergy> =
            Box::new(|value: f64, region: RegionId| value + 10.0 * region.index() as f64);
        let mut functional =
            EnergyFunctional::new(reference(), contours, None, energy, &config()).unwrap();
        let derivative = functional.compute_derivative().unwrap();
        let n = functional.num_vertices();

        let invalid: Vec<usize> = (0..n)
            .filter(|&v| functional.outer_region(VertexId(v)).is_none())
            .collect();
        assert!(!invalid.is_empty());
        assert_eq!(functional.diagnostics().invalid_vertices, invalid.len());
        for v in invalid {
            assert_eq!(functional.contour_of(VertexId(v)), ContourId(1));
            assert_eq!(functional.gradients()[v].magnitude, 0.0);
            for axis in 0..3 {
                assert_eq!(derivative[axis * n + v], 0.0);
            }
        }
    }

    #[test]
    fn set_current_displacements_rejects_wrong_length() {
        let mut functional = functional(3.5, None);
        let err = functional.set_current_displacements(&[0.0; 5]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Configuration {
                source: ConfigError::LengthMismatch { actual: 5, .. }
            }
        ));
    }

    #[test]
    fn negligible_displacements_do_not_invalidate_energy() {
        let mut functional = functional(3.5, None);
        let before = functional.value().unwrap();
        let n = functional.num_vertices();
        functional.set_current_displacements(&vec![1e-10; 3 * n]).unwrap();
        assert!(functional.cache.is_fresh());
        assert_eq!(functional.value().unwrap(), before);
    }

    #[test]
    fn displaced_contour_changes_energy() {
        let mut functional = functional(3.0, None);
        let before = functional.value().unwrap();
        let n = functional.num_vertices();
        let mut displacements = vec![0.0; 3 * n];
        let prior = functional.prior_points();
        for (v, p) in prior.iter().enumerate() {
            let outward = (p - Point3::new(CENTER, CENTER, CENTER)).normalize() * 2.0;
            for axis in 0..3 {
                displacements[axis * n + v] = outward[axis];
            }
        }
        functional.set_current_displacements(&displacements).unwrap();
        let after = functional.value().unwrap();
        assert!(after < before, "after {after}, before {before}");
    }

    #[test]
    fn vertex_pushed_off_the_domain_is_clamped_to_the_first_pixel_centre() {
        let mut functional = functional(3.5, None);
        let n = functional.num_vertices();
        let prior = functional.prior_points();
        let target = Point3::new(-0.3, prior[0].y, prior[0].z);
        let mut displacements = vec![0.0; 3 * n];
        for axis in 0..3 {
            displacements[axis * n] = target[axis] - prior[0][axis];
        }
        functional.set_current_displacements(&displacements).unwrap();

        let contours = functional.update_contours().unwrap();
        let moved = contours[0].points()[0];
        assert_eq!(moved.x, 0.0);
        assert!((moved.y - prior[0].y).abs() < 1e-12);
        assert_eq!(contours[0].points()[1], prior[1]);
        assert_eq!(functional.diagnostics().clamped_vertices, vec![VertexId(0)]);

        functional.compute_derivative().unwrap();
        assert_eq!(functional.gradients()[0].magnitude, 0.0);
    }

    #[test]
    fn partial_background_replaces_energy_with_penalty() {
        // Weights are scaled by the tissue probability and the statistical energy is
        // replaced by the maximum energy wherever the background is partially present.
        let half = Volume::filled(geometry(), 0.5);
        let background = ProbabilityMap::from_background(half).unwrap();
        let mut functional = functional(3.5, Some(background));
        assert!(functional.uses_background());

        let total = functional.value().unwrap();
        let expected = 0.5 * 100.0 * 8000.0;
        assert!((total - expected).abs() / expected < 1e-9);

        functional.compute_derivative().unwrap();
        let n = functional.num_vertices();
        for v in (0..n).filter(|&v| functional.outer_region(VertexId(v)).is_some()) {
            assert!(functional.gradients()[v].magnitude >= 0.5 * 100.0 * 100.0);
        }
    }

    #[test]
    fn saturated_background_counts_off_mask_vertices() {
        let full = Volume::filled(geometry(), 1.0);
        let background = ProbabilityMap::from_background(full).unwrap();
        let mut functional = functional(3.5, Some(background));
        assert_eq!(functional.value().unwrap(), 0.0);

        functional.compute_derivative().unwrap();
        assert_eq!(
            functional.diagnostics().off_mask_vertices,
            vec![functional.num_vertices()]
        );
    }

    #[test]
    fn energy_at_point_adds_order_weighted_background_penalty() {
        let plain = functional(3.5, None);
        let point = Point3::new(CENTER, CENTER, CENTER);
        assert!((plain.energy_at_point(&point, RegionId(0)) - 0.0).abs() < 1e-12);
        assert!((plain.energy_at_point(&point, RegionId(1)) - 100.0).abs() < 1e-12);

        let half = Volume::filled(geometry(), 0.5);
        let masked = functional(3.5, Some(ProbabilityMap::from_background(half).unwrap()));
        assert!((masked.energy_at_point(&point, RegionId(0)) - 50.0).abs() < 1e-12);
        assert!((masked.energy_at_point(&point, RegionId(1)) - 125.0).abs() < 1e-12);
    }

    #[test]
    fn outliers_are_magnitudes_above_the_quantile() {
        let gradients: Vec<VertexGradient> = (0..20)
            .map(|i| VertexGradient {
                normal: Vector3::x(),
                magnitude: i as f64,
            })
            .collect();
        assert_eq!(count_outliers(&gradients, 0.1), 1);
        assert_eq!(count_outliers(&gradients, 0.0), 0);
    }
}
