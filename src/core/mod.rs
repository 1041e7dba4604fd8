//! Core types for the sandhi-align registration library.
//!
//! This module provides the fundamental types used throughout the library:
//! - [`Point2D`], [`Point`] and [`PointMatch`]: coordinate and correspondence types
//! - [`Rect`] and [`Raster`]: geometry and rendered pixel data
//! - [`Model`] and [`ModelKind`]: parametric 2D transforms with weighted fits
//! - Small numeric helpers in [`math`]

pub mod math;
mod models;
mod point;
mod rect;

pub use models::{Model, ModelKind};
pub use point::{flip_matches, mean_distance, Point, Point2D, PointMatch};
pub use rect::{LayerPatch, Raster, RasterSource, Rect};
