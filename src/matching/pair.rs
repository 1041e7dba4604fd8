//! Pairwise matching driver and the two-sided correspondence cache.
//!
//! [`match_and_connect`] is the unit of work the montage driver fans out
//! per overlapping tile pair: fetch features for both tiles, generate
//! ratio-test candidates, run the consensus filter and connect the pair
//! with the surviving correspondences. Accepted sets are cached under
//! the [`MatchConfig`] fingerprint, and an empty cached set is a
//! remembered negative result that skips the whole pipeline on rerun.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::context::AlignContext;
use crate::core::math::Fnv1a;
use crate::core::{flip_matches, Model, ModelKind, Point, Point2D, PointMatch};
use crate::error::{Error, Result};
use crate::features::cache::{
    hashed_id_path, read_f32, read_u16, read_u32, read_u64, MAGIC, VERSION,
};
use crate::features::{cached_features, Feature, FeatureConfig};
use crate::matching::candidates::match_candidates;
use crate::matching::ransac::{filter_ransac, ConsensusParams, ConsensusResult};
use crate::optimize::Tile;

/// Parameters for one pairwise matching pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Feature extraction parameters.
    pub features: FeatureConfig,
    /// Nearest/next-nearest descriptor distance ratio threshold in
    /// (0, 1]; smaller is stricter.
    pub rod: f32,
    /// Inlier residual threshold in pixels.
    pub max_epsilon: f32,
    /// Minimal inliers / candidates ratio.
    pub min_inlier_ratio: f32,
    /// Minimal absolute inlier count.
    pub min_num_inliers: usize,
    /// Model category fitted during the consensus search.
    pub expected_model: ModelKind,
    /// Consensus trial budget.
    pub max_trials: usize,
    /// Trust-filter width as a multiple of the median residual.
    pub max_trust: f32,
    /// Discard near-identity models and retry on the remaining
    /// candidates. Used between tiles that mostly overlap, where the
    /// trivial self-match would otherwise win.
    pub reject_identity: bool,
    /// Maximal displacement in pixels still counting as identity.
    pub identity_tolerance: f32,
    /// Weight assigned to accepted correspondences.
    pub correspondence_weight: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            features: FeatureConfig::default(),
            rod: 0.92,
            max_epsilon: 100.0,
            min_inlier_ratio: 0.2,
            min_num_inliers: 7,
            expected_model: ModelKind::Rigid,
            max_trials: 1000,
            max_trust: 3.0,
            reject_identity: false,
            identity_tolerance: 0.5,
            correspondence_weight: 1.0,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> Result<()> {
        self.features.validate()?;
        if !(self.rod > 0.0 && self.rod <= 1.0) {
            return Err(Error::InvalidConfiguration(
                "rod must be in (0, 1]".into(),
            ));
        }
        if self.max_epsilon <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "max_epsilon must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_inlier_ratio) {
            return Err(Error::InvalidConfiguration(
                "min_inlier_ratio must be in [0, 1]".into(),
            ));
        }
        if self.max_trials == 0 {
            return Err(Error::InvalidConfiguration(
                "max_trials must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Cache validity key, covering every field that changes the
    /// computed correspondence set. `correspondence_weight` stays out:
    /// weights are applied after cache retrieval.
    pub fn fingerprint(&self) -> u64 {
        let mut h = Fnv1a::new();
        h.write_u64(self.features.fingerprint());
        h.write_u32(self.rod.to_bits());
        h.write_u32(self.max_epsilon.to_bits());
        h.write_u32(self.min_inlier_ratio.to_bits());
        h.write_u64(self.min_num_inliers as u64);
        h.write_u64(self.expected_model.to_index() as u64);
        h.write_u64(self.max_trials as u64);
        h.write_u32(self.max_trust.to_bits());
        h.write_u64(u64::from(self.reject_identity));
        h.write_u32(self.identity_tolerance.to_bits());
        h.finish()
    }

    pub fn consensus_params(&self) -> ConsensusParams {
        ConsensusParams {
            max_epsilon: self.max_epsilon,
            min_inlier_ratio: self.min_inlier_ratio,
            min_num_inliers: self.min_num_inliers,
            max_trials: self.max_trials,
            max_trust: self.max_trust,
        }
    }
}

/// Match two feature sets down to a geometrically consistent
/// correspondence set. `None` is a negative result.
pub fn match_pair<R: Rng>(
    rng: &mut R,
    a: &[Feature],
    b: &[Feature],
    config: &MatchConfig,
) -> Option<ConsensusResult> {
    let mut candidates = match_candidates(a, b, config.rod);
    match_consensus(rng, &mut candidates, config)
}

/// Consensus search with the identity-rejection loop.
///
/// When the accepted model moves no inlier farther than
/// `identity_tolerance`, its inliers are removed from the pool and the
/// search reruns on the rest. The pool strictly shrinks each round, so
/// the loop terminates; an exhausted pool is a negative result.
pub(crate) fn match_consensus<R: Rng>(
    rng: &mut R,
    candidates: &mut Vec<PointMatch>,
    config: &MatchConfig,
) -> Option<ConsensusResult> {
    let template = Model::identity(config.expected_model);
    let params = config.consensus_params();
    loop {
        let result = filter_ransac(rng, candidates, &template, &params)?;
        if config.reject_identity
            && result
                .model
                .is_identity_within(&result.inliers, config.identity_tolerance)
        {
            log::info!(
                "Identity transform for {} matches rejected",
                result.inliers.len()
            );
            let mut indices = result.inlier_indices;
            indices.sort_unstable_by(|x, y| y.cmp(x));
            for i in indices {
                candidates.swap_remove(i);
            }
            continue;
        }
        return Some(result);
    }
}

/// Match one tile pair through the correspondence cache and connect the
/// tiles with the result.
///
/// Returns the number of accepted correspondences; zero is a negative
/// result, cached as well so the pair is not retried on the next run.
pub fn match_and_connect(
    context: &AlignContext,
    a: &Tile,
    b: &Tile,
    config: &MatchConfig,
) -> Result<usize> {
    config.validate()?;
    let fingerprint = config.fingerprint();

    if let Some(mut matches) = context.match_cache().get(a.id(), b.id(), fingerprint) {
        log::info!(
            "Point matches for tiles {} and {} fetched from cache",
            a.id(),
            b.id()
        );
        if matches.is_empty() {
            return Ok(0);
        }
        apply_weight(&mut matches, config.correspondence_weight);
        let accepted = matches.len();
        Tile::connect(a, b, matches)?;
        return Ok(accepted);
    }

    context.checkpoint()?;
    let fa = cached_features(context, a.patch(), 1.0, &config.features)?;
    let fb = cached_features(context, b.patch(), 1.0, &config.features)?;
    context.checkpoint()?;

    let mut candidates = match_candidates(&fa, &fb, config.rod);
    let candidate_count = candidates.len();
    let mut rng = StdRng::from_os_rng();

    match match_consensus(&mut rng, &mut candidates, config) {
        Some(found) => {
            log::info!(
                "Model found for tiles {} and {}: {} of {} correspondences, mean residual {:.3} px",
                a.id(),
                b.id(),
                found.inliers.len(),
                candidate_count,
                found.error
            );
            context
                .match_cache()
                .put(a.id(), b.id(), fingerprint, &found.inliers);
            let mut matches = found.inliers;
            apply_weight(&mut matches, config.correspondence_weight);
            let accepted = matches.len();
            Tile::connect(a, b, matches)?;
            Ok(accepted)
        }
        None => {
            log::info!(
                "No model found for tiles {} and {}: {} candidates",
                a.id(),
                b.id(),
                candidate_count
            );
            context.match_cache().put(a.id(), b.id(), fingerprint, &[]);
            Ok(0)
        }
    }
}

fn apply_weight(matches: &mut [PointMatch], weight: f32) {
    for m in matches.iter_mut() {
        m.weight = weight;
    }
}

/// Two-sided correspondence cache.
///
/// One in-memory entry serves both orientations of a pair: matches are
/// held oriented lower id -> higher id and flipped on demand. On disk
/// every pair writes two files, `a_b` and the flipped `b_a`, so all
/// entries belonging to one tile can be invalidated without touching
/// its partners. Missing files, stale fingerprints and parse failures
/// are all plain misses, never errors.
pub struct PairCache {
    root: Option<PathBuf>,
    memory: Mutex<HashMap<(u64, u64), CachedMatches>>,
}

struct CachedMatches {
    fingerprint: u64,
    /// Oriented lower id -> higher id.
    matches: Vec<PointMatch>,
}

impl PairCache {
    /// `root = None` keeps the cache memory-only.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Cached correspondences oriented `a -> b` under this fingerprint.
    /// An empty list is a remembered negative result.
    pub fn get(&self, a: u64, b: u64, fingerprint: u64) -> Option<Vec<PointMatch>> {
        let key = (a.min(b), a.max(b));
        if let Some(entry) = self.memory.lock().get(&key) {
            if entry.fingerprint != fingerprint {
                return None;
            }
            return Some(if a <= b {
                entry.matches.clone()
            } else {
                flip_matches(&entry.matches)
            });
        }
        let path = self.entry_path(a, b)?;
        match read_matches(&path, fingerprint) {
            Ok(Some(matches)) => {
                let forward = if a <= b {
                    matches.clone()
                } else {
                    flip_matches(&matches)
                };
                self.memory.lock().insert(
                    key,
                    CachedMatches {
                        fingerprint,
                        matches: forward,
                    },
                );
                Some(matches)
            }
            Ok(None) => None,
            Err(e) => {
                log::debug!("Point match cache read failed for {:?}: {}", path, e);
                None
            }
        }
    }

    /// Store correspondences oriented `a -> b` on both cache sides. Disk
    /// write failures degrade to memory-only caching and are logged.
    pub fn put(&self, a: u64, b: u64, fingerprint: u64, matches: &[PointMatch]) {
        let key = (a.min(b), a.max(b));
        let forward = if a <= b {
            matches.to_vec()
        } else {
            flip_matches(matches)
        };
        self.memory.lock().insert(
            key,
            CachedMatches {
                fingerprint,
                matches: forward,
            },
        );
        let (Some(path_ab), Some(path_ba)) = (self.entry_path(a, b), self.entry_path(b, a))
        else {
            return;
        };
        let flipped = flip_matches(matches);
        if let Err(e) = write_matches(&path_ab, fingerprint, matches)
            .and_then(|()| write_matches(&path_ba, fingerprint, &flipped))
        {
            log::warn!("Saving point matches failed for tiles {} and {}: {}", a, b, e);
        }
    }

    /// Drop the reclaimable in-memory layer. Disk entries survive.
    pub fn release_memory(&self) {
        let mut memory = self.memory.lock();
        let n = memory.len();
        memory.clear();
        if n > 0 {
            log::info!("Released {} cached correspondence sets", n);
        }
    }

    fn entry_path(&self, a: u64, b: u64) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        Some(hashed_id_path(
            root,
            "pointmatches",
            &format!("{}_{}", a, b),
            "pointmatches",
        ))
    }
}

impl std::fmt::Debug for PairCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairCache")
            .field("root", &self.root)
            .field("cached", &self.memory.lock().len())
            .finish()
    }
}

fn write_matches(path: &Path, fingerprint: u64, matches: &[PointMatch]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&fingerprint.to_le_bytes())?;
    w.write_all(&(matches.len() as u32).to_le_bytes())?;
    for m in matches {
        for p in [&m.p1, &m.p2] {
            w.write_all(&p.local.x.to_le_bytes())?;
            w.write_all(&p.local.y.to_le_bytes())?;
            w.write_all(&p.world.x.to_le_bytes())?;
            w.write_all(&p.world.y.to_le_bytes())?;
        }
        w.write_all(&m.weight.to_le_bytes())?;
    }
    w.flush()
}

/// `Ok(None)` covers every non-error miss: absent file or a fingerprint
/// that no longer matches.
fn read_matches(path: &Path, fingerprint: u64) -> std::io::Result<Option<Vec<PointMatch>>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut r = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad magic",
        ));
    }
    if read_u16(&mut r)? != VERSION {
        return Ok(None);
    }
    if read_u64(&mut r)? != fingerprint {
        return Ok(None);
    }
    let count = read_u32(&mut r)? as usize;
    let mut matches = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        let p1 = read_point(&mut r)?;
        let p2 = read_point(&mut r)?;
        let weight = read_f32(&mut r)?;
        matches.push(PointMatch::with_weight(p1, p2, weight));
    }
    Ok(Some(matches))
}

fn read_point<R: Read>(r: &mut R) -> std::io::Result<Point> {
    let lx = read_f32(r)?;
    let ly = read_f32(r)?;
    let wx = read_f32(r)?;
    let wy = read_f32(r)?;
    Ok(Point::with_world(
        Point2D::new(lx, ly),
        Point2D::new(wx, wy),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Raster, RasterSource, Rect};
    use crate::features::FeatureStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn feature(x: f32, y: f32, hot: usize) -> Feature {
        let mut descriptor = vec![0.0f32; 16];
        descriptor[hot] = 1.0;
        Feature {
            location: Point2D::new(x, y),
            scale: 1.6,
            orientation: 0.0,
            descriptor,
        }
    }

    /// Feature sets with distinct descriptors whose locations differ by
    /// a pure translation, on an integer grid for exact residuals.
    fn translated_sets(n: usize, dx: f32, dy: f32) -> (Vec<Feature>, Vec<Feature>) {
        let a: Vec<Feature> = (0..n)
            .map(|i| feature(10.0 * i as f32, 7.0 * (i % 5) as f32, i % 16))
            .collect();
        let b = a
            .iter()
            .map(|f| {
                let mut shifted = f.clone();
                shifted.location = f.location + Point2D::new(dx, dy);
                shifted
            })
            .collect();
        (a, b)
    }

    fn identity_matches(n: usize) -> Vec<PointMatch> {
        (0..n)
            .map(|i| {
                let p = Point2D::new(3.0 * i as f32, 5.0 * (i % 7) as f32);
                PointMatch::new(Point::new(p), Point::new(p))
            })
            .collect()
    }

    fn translated_matches(n: usize, dx: f32, dy: f32) -> Vec<PointMatch> {
        (0..n)
            .map(|i| {
                let p = Point2D::new(11.0 * i as f32, 4.0 * (i % 6) as f32);
                PointMatch::new(Point::new(p), Point::new(p + Point2D::new(dx, dy)))
            })
            .collect()
    }

    #[test]
    fn test_match_pair_recovers_translation() {
        let (a, b) = translated_sets(12, 7.0, 3.0);
        let config = MatchConfig {
            expected_model: ModelKind::Translation,
            max_epsilon: 1.0,
            ..MatchConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let result = match_pair(&mut rng, &a, &b, &config).unwrap();
        assert_eq!(result.inliers.len(), 12);
        match result.model {
            Model::Translation { dx, dy } => {
                assert!((dx - 7.0).abs() < 1e-4);
                assert!((dy - 3.0).abs() < 1e-4);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_identity_rejection_finds_second_model() {
        let mut candidates = identity_matches(30);
        candidates.extend(translated_matches(12, 20.0, 0.0));
        let config = MatchConfig {
            expected_model: ModelKind::Translation,
            max_epsilon: 1.0,
            min_num_inliers: 8,
            reject_identity: true,
            ..MatchConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(4);
        let result = match_consensus(&mut rng, &mut candidates, &config).unwrap();
        assert_eq!(result.inliers.len(), 12);
        match result.model {
            Model::Translation { dx, dy } => {
                assert!((dx - 20.0).abs() < 1e-4);
                assert!(dy.abs() < 1e-4);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_identity_only_pool_is_negative() {
        let mut candidates = identity_matches(30);
        let config = MatchConfig {
            expected_model: ModelKind::Translation,
            max_epsilon: 1.0,
            reject_identity: true,
            ..MatchConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        assert!(match_consensus(&mut rng, &mut candidates, &config).is_none());
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_fingerprint_ignores_weight_only() {
        let base = MatchConfig::default();
        let mut reweighted = base.clone();
        reweighted.correspondence_weight = 0.5;
        assert_eq!(base.fingerprint(), reweighted.fingerprint());

        let mut stricter = base.clone();
        stricter.rod = 0.8;
        assert_ne!(base.fingerprint(), stricter.fingerprint());
        let mut other_model = base.clone();
        other_model.expected_model = ModelKind::Affine;
        assert_ne!(base.fingerprint(), other_model.fingerprint());
    }

    #[test]
    fn test_pair_cache_serves_both_orientations() {
        let cache = PairCache::new(None);
        let matches = translated_matches(5, 2.0, -1.0);
        cache.put(1, 2, 99, &matches);

        let forward = cache.get(1, 2, 99).unwrap();
        assert_eq!(forward, matches);
        let reversed = cache.get(2, 1, 99).unwrap();
        assert_eq!(reversed.len(), 5);
        assert_eq!(reversed[0].p1, matches[0].p2);
        assert_eq!(reversed[0].p2, matches[0].p1);

        assert!(cache.get(1, 2, 100).is_none());
    }

    #[test]
    fn test_pair_cache_disk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let matches = translated_matches(4, 3.0, 4.0);
        {
            let cache = PairCache::new(Some(dir.path().to_path_buf()));
            cache.put(12, 345, 7, &matches);
        }

        // A fresh cache over the same root reads the reversed file.
        let cache = PairCache::new(Some(dir.path().to_path_buf()));
        let reversed = cache.get(345, 12, 7).unwrap();
        assert_eq!(reversed[0].p1, matches[0].p2);
        // And the forward file under the matching fingerprint only.
        let cache = PairCache::new(Some(dir.path().to_path_buf()));
        assert!(cache.get(12, 345, 8).is_none());
        assert_eq!(cache.get(12, 345, 7).unwrap(), matches);
    }

    #[test]
    fn test_cached_negative_is_empty_not_missing() {
        let cache = PairCache::new(None);
        cache.put(3, 4, 1, &[]);
        let hit = cache.get(3, 4, 1).unwrap();
        assert!(hit.is_empty());
        assert!(cache.get(3, 5, 1).is_none());
    }

    struct CountingSource {
        raster: Raster,
        renders: AtomicUsize,
    }

    impl RasterSource for CountingSource {
        fn render(&self, _bounds: Rect, _scale: f32) -> crate::error::Result<Raster> {
            self.renders.fetch_add(1, Ordering::Relaxed);
            Ok(self.raster.clone())
        }
    }

    fn blank_tile(id: u64, source: &Arc<CountingSource>) -> Tile {
        let patch = crate::core::LayerPatch {
            id,
            bounds: Rect::from_size(64.0, 64.0),
            source: Arc::clone(source) as Arc<dyn RasterSource>,
        };
        Tile::new(id, patch, Model::identity(ModelKind::Rigid))
    }

    #[test]
    fn test_match_and_connect_remembers_negative() {
        let source = Arc::new(CountingSource {
            raster: Raster::new(64, 64),
            renders: AtomicUsize::new(0),
        });
        let context = AlignContext::new(FeatureStore::new(None));
        let a = blank_tile(1, &source);
        let b = blank_tile(2, &source);
        let config = MatchConfig::default();

        // Blank rasters have no features, so no model can be found.
        assert_eq!(match_and_connect(&context, &a, &b, &config).unwrap(), 0);
        assert_eq!(a.connection_count(), 0);
        let renders = source.renders.load(Ordering::Relaxed);
        assert!(renders >= 2);

        // The negative result is cached; nothing is rendered again.
        assert_eq!(match_and_connect(&context, &a, &b, &config).unwrap(), 0);
        assert_eq!(source.renders.load(Ordering::Relaxed), renders);
    }

    #[test]
    fn test_match_and_connect_cache_hit_reconnects() {
        let source = Arc::new(CountingSource {
            raster: Raster::new(64, 64),
            renders: AtomicUsize::new(0),
        });
        let context = AlignContext::new(FeatureStore::new(None));
        let a = blank_tile(1, &source);
        let b = blank_tile(2, &source);
        let config = MatchConfig {
            correspondence_weight: 0.5,
            ..MatchConfig::default()
        };

        let matches = translated_matches(9, 6.0, 1.0);
        context
            .match_cache()
            .put(1, 2, config.fingerprint(), &matches);

        assert_eq!(match_and_connect(&context, &a, &b, &config).unwrap(), 9);
        // Served from the cache without touching the pixels.
        assert_eq!(source.renders.load(Ordering::Relaxed), 0);
        let connected = a.matches_with(2).unwrap();
        assert_eq!(connected.len(), 9);
        // The current weight is applied on retrieval.
        assert!(connected.iter().all(|m| m.weight == 0.5));
        assert!(b.matches_with(1).is_some());
    }
}
