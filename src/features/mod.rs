//! Feature extraction and the parameter-fingerprinted feature cache.

pub(crate) mod cache;
mod extractor;

pub use cache::{cached_features, scaled_fingerprint, FeatureStore};
pub use extractor::{extract, Feature, FeatureConfig};
