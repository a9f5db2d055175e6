//! # regseg
//!
//! Deformable multi-region registration and segmentation. A set of closed contours is
//! evolved inside a reference image so that the partition they induce minimizes a
//! statistical region energy, while the deformation stays smooth and is parameterized on
//! a coarse control lattice.
//!
//! ## Architectural Philosophy
//!
//! The library follows a strict layering:
//!
//! - **[`core`]: The Foundation.** Stateless models (image geometry, volumes, probability
//!   maps, contour meshes) and the geometric and filtering utilities they need.
//!
//! - **[`transform`]: The Parameterization.** The sparse interpolation transform that maps
//!   control-point coefficients to displacements at arbitrary sample points and back.
//!
//! - **[`engine`]: The Logic Core.** The stateful optimization machinery: rasterization,
//!   the energy functional, the frequency-domain solver and the iteration loop.
//!
//! - **[`workflows`]: The Public API.** Complete registration runs tying the layers
//!   together with configuration and progress reporting.

pub mod core;
pub mod engine;
pub mod transform;
pub mod workflows;
