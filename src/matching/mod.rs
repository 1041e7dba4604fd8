//! Pairwise correspondence matching: descriptor candidates, consensus
//! filtering and the fingerprinted match cache.

mod candidates;
mod pair;
mod ransac;

pub use candidates::match_candidates;
pub(crate) use pair::match_consensus;
pub use pair::{match_and_connect, match_pair, MatchConfig, PairCache};
pub use ransac::{filter_ransac, ConsensusParams, ConsensusResult};
