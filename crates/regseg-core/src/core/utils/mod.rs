pub mod filters;
pub mod geometry;
