//! Utility types and functions.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - Math type re-exports from glam plus [`BBox3f`] and [`Ray`]

mod error;
mod math;

pub use error::*;
pub use math::*;
