//! Stable point identities across concurrent matching tasks.
//!
//! Block matching jobs run on worker pools and hand back match lists
//! whose endpoints are plain value copies of mesh vertices. The cache
//! assigns every vertex a nonzero id before jobs are dispatched; when
//! results are merged back, [`PointIdentityCache::sync_match`] copies
//! the returned coordinates onto the canonical point for that id and
//! the canonical point back over the endpoint. Matches sharing an id
//! therefore agree bit for bit with the canonical instance after the
//! merge, and springs attached by id all pull on the same vertex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::core::{Point, PointMatch};

/// Registry of canonical points keyed by identity.
///
/// Id 0 means unregistered; [`register`](PointIdentityCache::register)
/// replaces it with a fresh id and never reuses one within the cache's
/// lifetime.
#[derive(Debug)]
pub struct PointIdentityCache {
    next_id: AtomicU64,
    points: Mutex<HashMap<u64, Point>>,
}

impl PointIdentityCache {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            points: Mutex::new(HashMap::new()),
        }
    }

    /// Assign a fresh id to an unregistered point and remember it as
    /// the canonical instance. A point that already carries an id is
    /// left alone.
    pub fn register(&self, point: &mut Point) {
        if point.id != 0 {
            return;
        }
        point.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.points.lock().insert(point.id, *point);
    }

    /// Canonical coordinates for an id, if registered.
    pub fn get(&self, id: u64) -> Option<Point> {
        self.points.lock().get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.lock().is_empty()
    }

    /// Reconcile a returned match with the canonical points.
    ///
    /// For each endpoint with a registered id, the endpoint's
    /// coordinates are copied onto the canonical point and the
    /// canonical point is copied back over the endpoint. The identity
    /// itself is never replaced. Unregistered endpoints (id 0) pass
    /// through untouched.
    pub fn sync_match(&self, m: &mut PointMatch) {
        let mut points = self.points.lock();
        for endpoint in [&mut m.p1, &mut m.p2] {
            if endpoint.id == 0 {
                continue;
            }
            if let Some(canonical) = points.get_mut(&endpoint.id) {
                canonical.local = endpoint.local;
                canonical.world = endpoint.world;
                *endpoint = *canonical;
            }
        }
    }

    /// Forget all registrations once a run's results are merged.
    pub fn clear(&self) {
        self.points.lock().clear();
    }
}

impl Default for PointIdentityCache {
    fn default() -> Self {
        Self::new()
    }
}
