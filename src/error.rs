//! Error types for the alignment pipeline.

/// Result type for alignment operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the alignment pipeline.
///
/// Negative geometric outcomes (no model satisfies the inlier thresholds)
/// are *not* errors; those paths return `Ok(None)` and the pair is simply
/// excluded from the graph.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the disk cache or a raster collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cooperative interrupt was observed; the current phase aborted.
    #[error("alignment cancelled")]
    Cancelled,

    /// Configuration rejected before any work was performed.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Fewer correspondences than a model fit requires.
    #[error("not enough points: {required} required, {found} found")]
    NotEnoughPoints { required: usize, found: usize },

    /// The normal equations of a fit were singular (collinear or
    /// coincident points).
    #[error("ill-conditioned point configuration: {0}")]
    IllConditioned(&'static str),

    /// A collaborator reported transient resource exhaustion. The feature
    /// pipeline releases reclaimable caches and retries on this variant.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A worker pool rejected a task submission.
    #[error("worker pool unavailable: {0}")]
    Pool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotEnoughPoints {
            required: 3,
            found: 1,
        };
        assert_eq!(err.to_string(), "not enough points: 3 required, 1 found");

        let err = Error::Cancelled;
        assert_eq!(err.to_string(), "alignment cancelled");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
