//! Elastic registration of serial sections.
//!
//! Rigid models cannot absorb the local distortions serial sections
//! pick up during cutting and imaging. This module registers a layer
//! series non-rigidly: block correlation finds dense correspondences
//! between neighbouring layers, spring meshes deform each layer toward
//! those correspondences, and the relaxed meshes are exported as
//! smooth full-resolution transforms.

mod aligner;
mod block;
mod identity;
mod mesh;
mod mls;

pub use aligner::{align_layers, ElasticConfig, ElasticLayer, ElasticResult, PairReport};
pub use identity::PointIdentityCache;
pub use mesh::{relax_meshes, CrossSpring, MeshConfig, SpringMesh};
pub use mls::MlsTransform;
