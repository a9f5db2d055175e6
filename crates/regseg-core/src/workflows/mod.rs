//! # Workflows Module
//!
//! High-level entry points that run a complete registration, from input preparation to
//! the final breakdown of energies.
//!
//! ## Architecture
//!
//! - **Registration Workflow** ([`register`]) - Prepares the reference image and the
//!   background map, builds the energy functional and the spectral optimizer, runs the
//!   optimization and collects the deformed contours, the total deformation and the
//!   per-region statistics.
//!
//! Progress is reported through [`crate::engine::progress::ProgressReporter`], which
//! receives one event per phase and one per iteration.

pub mod register;
