//! # Core Module
//!
//! This module provides the stateless building blocks of the registration library: the
//! image and contour models every other layer operates on, and the geometric and
//! filtering utilities they rely on.
//!
//! ## Architecture
//!
//! - **Data Models** ([`models`]) - Image geometry and volumes, background probability
//!   maps, closed contour meshes, and the typed identifiers used across the crate
//! - **Utilities** ([`utils`]) - Triangle geometry, ray casting, trilinear sampling,
//!   resampling and Gaussian smoothing
//!
//! Nothing in this layer holds optimization state; the [`crate::engine`] layer owns the
//! caches and the iteration loop.

pub mod models;
pub mod utils;
