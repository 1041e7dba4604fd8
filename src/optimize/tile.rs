//! Shared tile handles and the connection graph between them.
//!
//! A [`Tile`] wraps one image patch, its current transform and its
//! per-partner correspondence sets behind a mutex. Handles clone cheaply
//! and cross threads freely. Whenever two tiles must be mutated
//! together, the locks are taken in ascending id order; every call path
//! goes through [`lock_pair`], so concurrent matchers touching
//! overlapping pairs cannot deadlock.
//!
//! Correspondences are stored on both endpoints: tile A holds `A -> B`
//! and tile B holds the flipped `B -> A`, so either side can be
//! invalidated or read on its own.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::core::{flip_matches, LayerPatch, Model, Point2D, PointMatch};
use crate::error::{Error, Result};

/// Cheap-to-clone handle onto one tile.
#[derive(Clone)]
pub struct Tile {
    id: u64,
    patch: LayerPatch,
    state: Arc<Mutex<TileState>>,
}

#[derive(Debug)]
struct TileState {
    model: Model,
    /// Partner tile id -> correspondences oriented self -> partner.
    connections: HashMap<u64, Vec<PointMatch>>,
}

impl Tile {
    pub fn new(id: u64, patch: LayerPatch, model: Model) -> Self {
        Self {
            id,
            patch,
            state: Arc::new(Mutex::new(TileState {
                model,
                connections: HashMap::new(),
            })),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn patch(&self) -> &LayerPatch {
        &self.patch
    }

    pub fn model(&self) -> Model {
        self.state.lock().model.clone()
    }

    pub fn set_model(&self, model: Model) {
        self.state.lock().model = model;
    }

    /// Map a point from tile-local to world coordinates under the
    /// current model.
    pub fn transform(&self, p: Point2D) -> Point2D {
        self.state.lock().model.apply(p)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn partner_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().connections.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Correspondences oriented self -> partner, if connected.
    pub fn matches_with(&self, partner: u64) -> Option<Vec<PointMatch>> {
        self.state.lock().connections.get(&partner).cloned()
    }

    /// Snapshot of the model and all connections in one lock
    /// acquisition.
    pub fn snapshot(&self) -> (Model, Vec<(u64, Vec<PointMatch>)>) {
        let state = self.state.lock();
        let mut connections: Vec<(u64, Vec<PointMatch>)> = state
            .connections
            .iter()
            .map(|(&id, m)| (id, m.clone()))
            .collect();
        connections.sort_by_key(|(id, _)| *id);
        (state.model.clone(), connections)
    }

    /// Connect two tiles with `matches` oriented `a -> b`, replacing any
    /// previous correspondence set between them on both endpoints.
    pub fn connect(a: &Tile, b: &Tile, matches: Vec<PointMatch>) -> Result<()> {
        if a.id == b.id {
            return Err(Error::InvalidConfiguration(format!(
                "tile {} cannot connect to itself",
                a.id
            )));
        }
        let flipped = flip_matches(&matches);
        let (mut ga, mut gb) = lock_pair(a, b);
        ga.connections.insert(b.id, matches);
        gb.connections.insert(a.id, flipped);
        Ok(())
    }

    /// Remove the connection between two tiles, if any.
    pub fn disconnect(a: &Tile, b: &Tile) {
        if a.id == b.id {
            return;
        }
        let (mut ga, mut gb) = lock_pair(a, b);
        ga.connections.remove(&b.id);
        gb.connections.remove(&a.id);
    }
}

impl std::fmt::Debug for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tile")
            .field("id", &self.id)
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Lock both tiles, always acquiring the lower id first. The returned
/// guards are in (a, b) order regardless of acquisition order.
fn lock_pair<'a>(a: &'a Tile, b: &'a Tile) -> (MutexGuard<'a, TileState>, MutexGuard<'a, TileState>) {
    debug_assert_ne!(a.id, b.id);
    if a.id < b.id {
        let ga = a.state.lock();
        let gb = b.state.lock();
        (ga, gb)
    } else {
        let gb = b.state.lock();
        let ga = a.state.lock();
        (ga, gb)
    }
}
