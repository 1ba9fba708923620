//! Utility helpers.

pub mod json_path;
pub mod time;

pub use json_path::{PathError, PathMapper, Segment};
