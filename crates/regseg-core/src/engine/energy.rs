use crate::core::models::ids::RegionId;

/// Energy of assigning a voxel with intensity `value` to `region`. Lower is better.
pub trait SampleEnergy: Send + Sync {
    fn energy(&self, value: f64, region: RegionId) -> f64;
}

impl<F> SampleEnergy for F
where
    F: Fn(f64, RegionId) -> f64 + Send + Sync,
{
    #[inline]
    fn energy(&self, value: f64, region: RegionId) -> f64 {
        self(value, region)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionModel {
    pub mean: f64,
    pub variance: f64,
}

/// Squared Mahalanobis distance of the intensity to a per-region Gaussian model,
/// `(v - μ)² / σ²`.
#[derive(Debug, Clone, PartialEq)]
pub struct MahalanobisModel {
    regions: Vec<RegionModel>,
}

impl MahalanobisModel {
    /// Returns `None` if any variance is not strictly positive and finite.
    pub fn new(regions: Vec<RegionModel>) -> Option<Self> {
        if regions
            .iter()
            .any(|r| !(r.variance > 0.0) || !r.variance.is_finite() || !r.mean.is_finite())
        {
            return None;
        }
        Some(Self { regions })
    }

    /// Fits one model per region from labelled intensity samples.
    pub fn from_samples(samples: &[Vec<f64>]) -> Option<Self> {
        let regions = samples
            .iter()
            .map(|values| {
                if values.len() < 2 {
                    return None;
                }
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
                Some(RegionModel { mean, variance })
            })
            .collect::<Option<Vec<_>>>()?;
        Self::new(regions)
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn regions(&self) -> &[RegionModel] {
        &self.regions
    }
}

impl SampleEnergy for MahalanobisModel {
    fn energy(&self, value: f64, region: RegionId) -> f64 {
        match self.regions.get(region.index()) {
            Some(model) => (value - model.mean).powi(2) / model.variance,
            None => f64::INFINITY,
        }
    }
}
