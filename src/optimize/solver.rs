//! Global relaxation of the tile connection graph.
//!
//! Tiles with at least one connection are relaxed by Gauss-Seidel
//! sweeps: every sweep refits each movable tile's model to its
//! correspondences, with partner points mapped through the partner's
//! current model. Iteration stops when the weighted mean residual drops
//! below the target, when it stops improving for a configured stretch,
//! or when the iteration budget runs out.
//!
//! The solver works on a snapshot and writes models back to the shared
//! tiles only after a successful run, so a fitting failure or a
//! cancellation mid-run leaves every tile untouched.

use std::collections::{HashMap, HashSet};

use crate::context::AlignContext;
use crate::core::math::mean_and_std;
use crate::core::{Model, Point, PointMatch};
use crate::error::{Error, Result};
use crate::optimize::tile::Tile;

/// Termination thresholds for the relaxation loop.
#[derive(Clone, Debug)]
pub struct OptimizeConfig {
    /// Target weighted mean residual in pixels.
    pub max_epsilon: f32,
    /// Sweep budget.
    pub max_iterations: usize,
    /// Sweeps without improvement before giving up.
    pub max_plateau_width: usize,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            max_epsilon: 100.0,
            max_iterations: 2000,
            max_plateau_width: 200,
        }
    }
}

/// Why the relaxation loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Residual under `max_epsilon`.
    Converged,
    /// No improvement for `max_plateau_width` sweeps.
    Plateau,
    /// Sweep budget exhausted.
    MaxIterations,
}

#[derive(Clone, Debug)]
pub struct OptimizeResult {
    pub iterations: usize,
    pub initial_error: f32,
    pub error: f32,
    pub termination: Termination,
}

/// The participating tiles plus the subset that must not move.
pub struct TileConfiguration {
    tiles: Vec<Tile>,
    fixed: HashSet<u64>,
}

impl TileConfiguration {
    /// Fails when tile ids collide or a fixed tile is not a member.
    pub fn new(tiles: Vec<Tile>, fixed: &[Tile]) -> Result<Self> {
        let mut ids = HashSet::new();
        for tile in &tiles {
            if !ids.insert(tile.id()) {
                return Err(Error::InvalidConfiguration(format!(
                    "duplicate tile id {}",
                    tile.id()
                )));
            }
        }
        let mut fixed_ids = HashSet::new();
        for tile in fixed {
            if !ids.contains(&tile.id()) {
                return Err(Error::InvalidConfiguration(format!(
                    "fixed tile {} is not part of the configuration",
                    tile.id()
                )));
            }
            fixed_ids.insert(tile.id());
        }
        Ok(Self {
            tiles,
            fixed: fixed_ids,
        })
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn is_fixed(&self, id: u64) -> bool {
        self.fixed.contains(&id)
    }

    /// Relax all connected tiles. A run with nothing movable is a no-op.
    pub fn optimize(&self, context: &AlignContext, config: &OptimizeConfig) -> Result<OptimizeResult> {
        let mut nodes = self.build_nodes();
        let movable = nodes.iter().filter(|n| !n.fixed && !n.edges.is_empty()).count();
        if movable == 0 {
            log::info!("Optimizer run with no movable tiles, nothing to do");
            return Ok(OptimizeResult {
                iterations: 0,
                initial_error: 0.0,
                error: 0.0,
                termination: Termination::Converged,
            });
        }

        let initial_error = graph_error(&nodes);
        if initial_error < config.max_epsilon {
            log::info!(
                "Configuration already converged ({:.3} px < {:.3} px)",
                initial_error,
                config.max_epsilon
            );
            return Ok(OptimizeResult {
                iterations: 0,
                initial_error,
                error: initial_error,
                termination: Termination::Converged,
            });
        }

        let mut best = f32::INFINITY;
        let mut plateau = 0usize;
        let mut iterations = 0usize;
        let mut error = initial_error;
        let termination = loop {
            context.checkpoint()?;
            if iterations >= config.max_iterations {
                break Termination::MaxIterations;
            }
            sweep(&mut nodes)?;
            iterations += 1;
            error = graph_error(&nodes);
            if error < config.max_epsilon {
                break Termination::Converged;
            }
            if error < best - 1e-6 {
                best = error;
                plateau = 0;
            } else {
                plateau += 1;
                if plateau >= config.max_plateau_width {
                    break Termination::Plateau;
                }
            }
        };

        for node in &nodes {
            if !node.fixed {
                node.tile.set_model(node.model.clone());
            }
        }
        log::info!(
            "Optimized {} tiles in {} iterations: {:.3} px -> {:.3} px ({:?})",
            nodes.len(),
            iterations,
            initial_error,
            error,
            termination
        );
        Ok(OptimizeResult {
            iterations,
            initial_error,
            error,
            termination,
        })
    }

    /// Relax, then drop correspondences whose residual exceeds
    /// `mean + mean_factor * stddev` and relax again. Returns the final
    /// result and the number of dropped correspondences.
    pub fn optimize_and_filter(
        &self,
        context: &AlignContext,
        config: &OptimizeConfig,
        mean_factor: f32,
    ) -> Result<(OptimizeResult, usize)> {
        let first = self.optimize(context, config)?;

        let by_id: HashMap<u64, &Tile> = self.tiles.iter().map(|t| (t.id(), t)).collect();
        let mut residuals: Vec<f32> = Vec::new();
        let mut pairs: Vec<(&Tile, &Tile, Vec<PointMatch>)> = Vec::new();
        for tile in &self.tiles {
            let (model, connections) = tile.snapshot();
            for (partner_id, matches) in connections {
                // Visit each undirected pair once.
                if partner_id <= tile.id() {
                    continue;
                }
                let Some(&partner) = by_id.get(&partner_id) else {
                    continue;
                };
                let partner_model = partner.model();
                for m in &matches {
                    residuals.push(
                        model
                            .apply(m.p1.local)
                            .distance(&partner_model.apply(m.p2.local)),
                    );
                }
                pairs.push((tile, partner, matches));
            }
        }
        if residuals.is_empty() {
            return Ok((first, 0));
        }

        let (mean, std) = mean_and_std(&residuals);
        let threshold = mean + mean_factor * std;
        let mut dropped = 0usize;
        for (tile, partner, matches) in pairs {
            let model = tile.model();
            let partner_model = partner.model();
            let kept: Vec<PointMatch> = matches
                .iter()
                .filter(|m| {
                    model
                        .apply(m.p1.local)
                        .distance(&partner_model.apply(m.p2.local))
                        <= threshold
                })
                .cloned()
                .collect();
            if kept.len() == matches.len() {
                continue;
            }
            dropped += matches.len() - kept.len();
            if kept.is_empty() {
                Tile::disconnect(tile, partner);
            } else {
                Tile::connect(tile, partner, kept)?;
            }
        }

        if dropped == 0 {
            return Ok((first, 0));
        }
        log::info!(
            "Dropped {} correspondences above {:.3} px, re-optimizing",
            dropped,
            threshold
        );
        let second = self.optimize(context, config)?;
        Ok((second, dropped))
    }

    fn build_nodes(&self) -> Vec<Node> {
        let connected: HashSet<u64> = self
            .tiles
            .iter()
            .filter(|t| t.connection_count() > 0)
            .map(|t| t.id())
            .collect();
        let mut nodes = Vec::new();
        let mut dense: HashMap<u64, usize> = HashMap::new();
        for tile in &self.tiles {
            if !connected.contains(&tile.id()) {
                continue;
            }
            dense.insert(tile.id(), nodes.len());
            let (model, _) = tile.snapshot();
            nodes.push(Node {
                tile: tile.clone(),
                model,
                fixed: self.fixed.contains(&tile.id()),
                edges: Vec::new(),
            });
        }
        for i in 0..nodes.len() {
            let (_, connections) = nodes[i].tile.snapshot();
            for (partner_id, matches) in connections {
                if let Some(&j) = dense.get(&partner_id) {
                    nodes[i].edges.push((j, matches));
                }
            }
        }
        nodes
    }
}

struct Node {
    tile: Tile,
    model: Model,
    fixed: bool,
    /// (partner slot, matches oriented self -> partner)
    edges: Vec<(usize, Vec<PointMatch>)>,
}

/// One Gauss-Seidel sweep: refit every movable tile against its
/// partners' current models.
fn sweep(nodes: &mut [Node]) -> Result<()> {
    let mut assembled: Vec<PointMatch> = Vec::new();
    for i in 0..nodes.len() {
        if nodes[i].fixed || nodes[i].edges.is_empty() {
            continue;
        }
        assembled.clear();
        for (partner, matches) in &nodes[i].edges {
            let partner_model = &nodes[*partner].model;
            for m in matches {
                assembled.push(PointMatch::with_weight(
                    m.p1.clone(),
                    Point::with_world(m.p2.local, partner_model.apply(m.p2.local)),
                    m.weight,
                ));
            }
        }
        let mut model = nodes[i].model.clone();
        model.fit(&assembled)?;
        nodes[i].model = model;
    }
    Ok(())
}

/// Weighted mean residual over every directed correspondence.
fn graph_error(nodes: &[Node]) -> f32 {
    let mut sum = 0.0f64;
    let mut weight = 0.0f64;
    for node in nodes {
        for (partner, matches) in &node.edges {
            let partner_model = &nodes[*partner].model;
            for m in matches {
                let d = node
                    .model
                    .apply(m.p1.local)
                    .distance(&partner_model.apply(m.p2.local));
                sum += f64::from(d) * f64::from(m.weight);
                weight += f64::from(m.weight);
            }
        }
    }
    if weight > 0.0 {
        (sum / weight) as f32
    } else {
        0.0
    }
}
