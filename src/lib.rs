//! Sandhi-Align - Pairwise registration for tiled serial-section imagery
//!
//! # Architecture
//!
//! The crate is organized into 4 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              montage/  elastic/                     │  ← Pipelines
//! │   (tile montage, linear chaining, elastic series)   │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │           features/  matching/  optimize/           │  ← Algorithms
//! │  (extraction + cache, consensus, graph relaxation)  │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │          context  executor  progress                │  ← Infrastructure
//! │    (shared caches, worker pools, cancellation)      │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                 core/  error                        │  ← Foundation
//! │        (points, models, rasters, results)           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Pipelines
//!
//! ## Montage
//! [`montage::align_tiles`] registers overlapping tiles within one
//! section. Features are extracted once per tile through the
//! fingerprinted [`features::FeatureStore`], every overlapping pair is
//! matched through the correspondence cache, and the tile graph is
//! relaxed by [`optimize::TileConfiguration`] until the mean residual
//! drops below its threshold, the improvement plateaus, or the
//! iteration budget runs out.
//!
//! ## Linear layer chaining
//! [`montage::align_layers_linearly`] matches each section against its
//! predecessor at a working scale and composes the pairwise models into
//! absolute transforms. A pair without a model keeps its relative
//! position rather than failing the series.
//!
//! ## Elastic series
//! [`elastic::align_layers`] deforms whole sections. Consecutive layers
//! inside a neighbor window are pre-registered rigidly, spring meshes
//! are laid over every layer and coupled by block-matched
//! correspondences in both directions, and the coupled system relaxes
//! until its springs settle. The solved meshes export as moving
//! least-squares transforms, one per layer.
//!
//! # Collaborators
//!
//! Pixels come from the enclosing system: every patch carries a
//! [`core::RasterSource`] that renders a bounding box at a scale on
//! demand. Rendering, storage and display stay outside this crate.
//! Long runs report through [`progress::Progress`], which also carries
//! the cooperative cancellation flag every phase polls.

// ============================================================================
// Layer 1: Foundation (no internal deps)
// ============================================================================
pub mod core;
pub mod error;

// ============================================================================
// Layer 2: Infrastructure (depends on core, error)
// ============================================================================
pub mod context;
pub mod executor;
pub mod progress;

// ============================================================================
// Layer 3: Algorithms (depends on core, infrastructure)
// ============================================================================
pub mod features;
pub mod matching;
pub mod optimize;

// ============================================================================
// Layer 4: Pipelines (depends on all layers)
// ============================================================================
pub mod elastic;
pub mod montage;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Foundation
pub use core::{
    flip_matches, mean_distance, LayerPatch, Model, ModelKind, Point, Point2D, PointMatch, Raster,
    RasterSource, Rect,
};
pub use error::{Error, Result};

// Infrastructure
pub use context::AlignContext;
pub use executor::{DefaultExecutorProvider, ExecutorProvider, ExecutorRegistry, PoolSize};
pub use progress::Progress;

// Features and matching
pub use features::{cached_features, Feature, FeatureConfig, FeatureStore};
pub use matching::{match_and_connect, match_pair, ConsensusResult, MatchConfig};

// Tile graph
pub use optimize::{OptimizeConfig, OptimizeResult, Termination, Tile, TileConfiguration};

// Pipelines
pub use elastic::{align_layers, ElasticConfig, ElasticLayer, ElasticResult, MlsTransform};
pub use montage::{align_layers_linearly, align_tiles, MontageConfig, MontageSummary};
