use thiserror::Error;

use super::config::ConfigError;
use super::spectral::SpectralError;
use crate::core::models::image::GeometryError;
use crate::transform::sparse::TransformError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {source}")]
    Configuration {
        #[from]
        source: ConfigError,
    },

    #[error("Transform error: {source}")]
    Transform {
        #[from]
        source: TransformError,
    },

    #[error("Numerical failure: {source}")]
    Numerical {
        #[from]
        source: SpectralError,
    },

    #[error("Geometry error: {source}")]
    Geometry {
        #[from]
        source: GeometryError,
    },

    #[error("Internal logic error: {0}")]
    Internal(String),
}
