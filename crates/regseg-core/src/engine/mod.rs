//! # Engine Module
//!
//! This module implements the stateful optimization engine: the region energy
//! functional, the frequency-domain update and the iteration loop that ties them to the
//! sparse interpolation transform.
//!
//! ## Overview
//!
//! Each iteration follows the same data flow:
//!
//! 1. The [`functional`] evaluates a descent speed at every contour vertex.
//! 2. The transform splats those vertex vectors onto the control lattice.
//! 3. The [`spectral`] solver computes the next coefficients by solving the regularized
//!    system in the frequency domain.
//! 4. The [`optimizer`] installs the coefficients, checks the diffeomorphic bound and
//!    interpolates the new displacements back onto the vertices.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Registration parameters, builder validation and
//!   TOML loading
//! - **Energy Strategies** ([`energy`]) - The per-sample energy trait and the Gaussian
//!   region model
//! - **Partitioning** ([`partition`]) - Contour rasterization into a labelled volume
//! - **Functional** ([`functional`]) - Region energies, vertex gradients and geometric
//!   diagnostics
//! - **Regularization** ([`regularization`]) - Energy of the deformation on the lattice
//! - **Spectral Solve** ([`spectral`]) - FFT plans and the cached denominator
//! - **Optimization Loop** ([`optimizer`]) - Iteration, convergence and stop conditions
//! - **State Tracking** ([`state`]) - Stop conditions and per-iteration records
//! - **Progress Monitoring** ([`progress`]) - Callback-based progress reporting
//! - **Error Handling** ([`error`]) - Engine-level error aggregation
//!
//! ## Caching
//!
//! Every derived quantity has exactly one owner and is rebuilt wholesale when its inputs
//! change: the functional tracks its partition and energies through a single
//! `CacheValidity`, the transform owns its weight matrices and the solver owns
//! its denominator.

pub(crate) mod cache;
pub mod config;
pub mod energy;
pub mod error;
pub mod functional;
pub mod optimizer;
pub mod partition;
pub mod progress;
pub mod regularization;
pub mod spectral;
pub mod state;
