//! # Core Models Module
//!
//! Fundamental data structures describing the inputs of a registration.
//!
//! ## Key Components
//!
//! - [`image`] - Sampling geometry, typed volumes, the reference image and the background
//!   probability map. Volumes are canonicalized on construction so that every grid the
//!   engine sees has an identity direction. Only axis-aligned orientations are accepted.
//! - [`contour`] - Closed triangle meshes with prior and current vertex positions and
//!   outward unit normals
//! - [`ids`] - Typed indices for contours, regions and vertices
//!
//! ## Conventions
//!
//! Voxel data is stored x-fastest (`i + nx * (j + ny * k)`). The origin of a geometry is
//! the physical position of the centre of the first voxel.

pub mod contour;
pub mod ids;
pub mod image;
