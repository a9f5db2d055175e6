use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("Buffer '{name}' has length {actual}, expected {expected}")]
    LengthMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidParameter {
        name,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionalConfig {
    /// Standard deviation of the Gaussian applied to the reference image, in physical
    /// units. Zero disables smoothing.
    pub smoothing_sigma: f64,
    /// Supersampling factor of the rasterization grid relative to the reference grid.
    pub sampling_factor: f64,
    /// Fraction of the largest vertex gradients reported as outliers.
    pub decile_threshold: f64,
    /// Distance along the normal at which vertex validity is probed.
    pub probe_distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularizationConfig {
    pub alpha: f64,
    pub beta: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationConfig {
    pub grid_size: [usize; 3],
    pub max_iterations: usize,
    pub step_size: f64,
    pub step_factor: f64,
    pub param_factor: f64,
    pub convergence_threshold: f64,
    pub lightweight_convergence: bool,
    pub stop_on_non_diffeomorphic: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationConfig {
    pub functional: FunctionalConfig,
    pub regularization: RegularizationConfig,
    pub optimization: OptimizationConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            functional: FunctionalConfig {
                smoothing_sigma: 0.0,
                sampling_factor: 2.0,
                decile_threshold: 0.05,
                probe_distance: 1.0,
            },
            regularization: RegularizationConfig {
                alpha: 1.0,
                beta: 1.0,
            },
            optimization: OptimizationConfig {
                grid_size: [5, 5, 5],
                max_iterations: 50,
                step_size: 1.0,
                step_factor: 1.0,
                param_factor: 1.0,
                convergence_threshold: 1.0e-4,
                lightweight_convergence: true,
                stop_on_non_diffeomorphic: false,
            },
        }
    }
}

impl RegistrationConfig {
    pub fn builder() -> RegistrationConfigBuilder {
        RegistrationConfigBuilder::new()
    }
}

/// Builder for [`RegistrationConfig`]. Unset parameters keep their defaults.
#[derive(Debug, Default, Clone)]
pub struct RegistrationConfigBuilder {
    smoothing_sigma: Option<f64>,
    sampling_factor: Option<f64>,
    decile_threshold: Option<f64>,
    probe_distance: Option<f64>,
    alpha: Option<f64>,
    beta: Option<f64>,
    grid_size: Option<[usize; 3]>,
    max_iterations: Option<usize>,
    step_size: Option<f64>,
    step_factor: Option<f64>,
    param_factor: Option<f64>,
    convergence_threshold: Option<f64>,
    lightweight_convergence: Option<bool>,
    stop_on_non_diffeomorphic: Option<bool>,
}

impl RegistrationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn smoothing_sigma(mut self, sigma: f64) -> Self {
        self.smoothing_sigma = Some(sigma);
        self
    }
    pub fn sampling_factor(mut self, factor: f64) -> Self {
        self.sampling_factor = Some(factor);
        self
    }
    pub fn decile_threshold(mut self, threshold: f64) -> Self {
        self.decile_threshold = Some(threshold);
        self
    }
    pub fn probe_distance(mut self, distance: f64) -> Self {
        self.probe_distance = Some(distance);
        self
    }
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = Some(alpha);
        self
    }
    pub fn beta(mut self, beta: f64) -> Self {
        self.beta = Some(beta);
        self
    }
    pub fn grid_size(mut self, points_per_axis: usize) -> Self {
        self.grid_size = Some([points_per_axis; 3]);
        self
    }
    pub fn grid_size_per_axis(mut self, size: [usize; 3]) -> Self {
        self.grid_size = Some(size);
        self
    }
    pub fn max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = Some(iterations);
        self
    }
    pub fn step_size(mut self, step: f64) -> Self {
        self.step_size = Some(step);
        self
    }
    pub fn step_factor(mut self, factor: f64) -> Self {
        self.step_factor = Some(factor);
        self
    }
    pub fn param_factor(mut self, factor: f64) -> Self {
        self.param_factor = Some(factor);
        self
    }
    pub fn convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = Some(threshold);
        self
    }
    pub fn lightweight_convergence(mut self, enabled: bool) -> Self {
        self.lightweight_convergence = Some(enabled);
        self
    }
    pub fn stop_on_non_diffeomorphic(mut self, enabled: bool) -> Self {
        self.stop_on_non_diffeomorphic = Some(enabled);
        self
    }

    pub fn build(self) -> Result<RegistrationConfig, ConfigError> {
        let defaults = RegistrationConfig::default();

        let functional = FunctionalConfig {
            smoothing_sigma: non_negative(
                "smoothing-sigma",
                self.smoothing_sigma
                    .unwrap_or(defaults.functional.smoothing_sigma),
            )?,
            sampling_factor: at_least_one(
                "sampling-factor",
                self.sampling_factor
                    .unwrap_or(defaults.functional.sampling_factor),
            )?,
            decile_threshold: unit_interval(
                "decile-threshold",
                self.decile_threshold
                    .unwrap_or(defaults.functional.decile_threshold),
            )?,
            probe_distance: positive(
                "probe-distance",
                self.probe_distance
                    .unwrap_or(defaults.functional.probe_distance),
            )?,
        };

        let regularization = RegularizationConfig {
            alpha: non_negative(
                "alpha",
                self.alpha.unwrap_or(defaults.regularization.alpha),
            )?,
            beta: non_negative("beta", self.beta.unwrap_or(defaults.regularization.beta))?,
        };

        let grid_size = self.grid_size.unwrap_or(defaults.optimization.grid_size);
        if grid_size.iter().any(|&s| s == 0) {
            return Err(invalid(
                "grid-size",
                format!("every axis needs at least one control point, got {:?}", grid_size),
            ));
        }
        let max_iterations = self
            .max_iterations
            .unwrap_or(defaults.optimization.max_iterations);
        if max_iterations == 0 {
            return Err(invalid("max-iterations", "must be at least 1"));
        }

        let optimization = OptimizationConfig {
            grid_size,
            max_iterations,
            step_size: positive(
                "step-size",
                self.step_size.unwrap_or(defaults.optimization.step_size),
            )?,
            step_factor: positive(
                "step-factor",
                self.step_factor
                    .unwrap_or(defaults.optimization.step_factor),
            )?,
            param_factor: non_negative(
                "param-factor",
                self.param_factor
                    .unwrap_or(defaults.optimization.param_factor),
            )?,
            convergence_threshold: non_negative(
                "convergence-threshold",
                self.convergence_threshold
                    .unwrap_or(defaults.optimization.convergence_threshold),
            )?,
            lightweight_convergence: self
                .lightweight_convergence
                .unwrap_or(defaults.optimization.lightweight_convergence),
            stop_on_non_diffeomorphic: self
                .stop_on_non_diffeomorphic
                .unwrap_or(defaults.optimization.stop_on_non_diffeomorphic),
        };

        Ok(RegistrationConfig {
            functional,
            regularization,
            optimization,
        })
    }
}

fn finite(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(invalid(name, format!("must be finite, got {}", value)))
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if finite(name, value)? < 0.0 {
        return Err(invalid(name, format!("must be non-negative, got {}", value)));
    }
    Ok(value)
}

fn positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if finite(name, value)? <= 0.0 {
        return Err(invalid(name, format!("must be positive, got {}", value)));
    }
    Ok(value)
}

fn at_least_one(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if finite(name, value)? < 1.0 {
        return Err(invalid(name, format!("must be at least 1, got {}", value)));
    }
    Ok(value)
}

fn unit_interval(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if !(0.0..=1.0).contains(&finite(name, value)?) {
        return Err(invalid(name, format!("must lie in [0, 1], got {}", value)));
    }
    Ok(value)
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(untagged)]
enum GridSizeValue {
    Uniform(usize),
    PerAxis([usize; 3]),
}

/// Registration settings as read from a TOML file. Every key is optional; unset keys
/// fall back to the builder defaults.
#[derive(Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct PartialRegistrationConfig {
    smoothing_sigma: Option<f64>,
    sampling_factor: Option<f64>,
    decile_threshold: Option<f64>,
    probe_distance: Option<f64>,
    alpha: Option<f64>,
    beta: Option<f64>,
    grid_size: Option<GridSizeValue>,
    max_iterations: Option<usize>,
    step_size: Option<f64>,
    step_factor: Option<f64>,
    param_factor: Option<f64>,
    convergence_threshold: Option<f64>,
    lightweight_convergence: Option<bool>,
    stop_on_non_diffeomorphic: Option<bool>,
}

impl PartialRegistrationConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Applies every key present in the file on top of `builder`.
    pub fn merge_into(self, mut builder: RegistrationConfigBuilder) -> RegistrationConfigBuilder {
        builder.smoothing_sigma = self.smoothing_sigma.or(builder.smoothing_sigma);
        builder.sampling_factor = self.sampling_factor.or(builder.sampling_factor);
        builder.decile_threshold = self.decile_threshold.or(builder.decile_threshold);
        builder.probe_distance = self.probe_distance.or(builder.probe_distance);
        builder.alpha = self.alpha.or(builder.alpha);
        builder.beta = self.beta.or(builder.beta);
        builder.max_iterations = self.max_iterations.or(builder.max_iterations);
        builder.step_size = self.step_size.or(builder.step_size);
        builder.step_factor = self.step_factor.or(builder.step_factor);
        builder.param_factor = self.param_factor.or(builder.param_factor);
        builder.convergence_threshold = self.convergence_threshold.or(builder.convergence_threshold);
        builder.lightweight_convergence = self.lightweight_convergence.or(builder.lightweight_convergence);
        builder.stop_on_non_diffeomorphic = self.stop_on_non_diffeomorphic.or(builder.stop_on_non_diffeomorphic);
        if let Some(size) = self.grid_size {
            builder.grid_size = Some(match size {
                GridSizeValue::Uniform(n) => [n; 3],
                GridSizeValue::PerAxis(axes) => axes,
            });
        }
        builder
    }

    pub fn into_config(self) -> Result<RegistrationConfig, ConfigError> {
        self.merge_into(RegistrationConfigBuilder::new()).build()
    }
}
