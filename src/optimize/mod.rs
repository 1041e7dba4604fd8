//! Tile graph and its global relaxation.

mod solver;
mod tile;

pub use solver::{OptimizeConfig, OptimizeResult, Termination, TileConfiguration};
pub use tile::Tile;
