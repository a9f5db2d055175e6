//! # Transform Module
//!
//! This module implements the sparse interpolation transform that parameterizes the
//! deformation on a coarse regular lattice of control points.
//!
//! ## Overview
//!
//! Contour vertices live at arbitrary physical positions, while the optimizer works on a
//! small regular grid where the regularized update can be solved in the frequency domain.
//! The transform bridges the two spaces through a compactly supported radial cubic basis:
//!
//! - **Interpolation** maps control-point coefficients to values at the sample points
//!   (`W · c`).
//! - **Splatting** accumulates values at the sample points back onto the control points
//!   (`Wᵗ · v`), which is the exact adjoint of interpolation.
//! - **Fitting** recovers coefficients from a dense field sampled on the control grid.
//!
//! ## Key Components
//!
//! - [`basis`] - The cubic kernel and the normalized distance it is evaluated on
//! - [`grid`] - Control grid geometry and vector fields sampled on it
//! - [`sparse`] - The transform itself, with its cached sparse weight matrices
//!
//! The weight matrix is cached per (grid, sample set) pair and rebuilt wholesale whenever
//! either changes; it is never patched in place.

pub mod basis;
pub mod grid;
pub mod sparse;
