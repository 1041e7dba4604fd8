//! Spring mesh deformation model for elastic registration.
//!
//! Each layer gets a regular triangulated grid of vertices connected by
//! structural springs at their rest lengths. Block matches add
//! zero-length cross springs between a vertex of one mesh and a passive
//! vertex anchored on another, and relaxation settles the coupled
//! system into a smooth non-rigid alignment.
//!
//! # Algorithm
//!
//! Relaxation is damped explicit integration. Per iteration:
//!
//! ```text
//! f(v)  = Σ springs incident to v:  k * (len - rest) * d̂
//! vel'  = damp * (vel + f)
//! dt    = min(1, max_stretch / max |vel'|)
//! pos'  = pos + vel' * dt
//! ```
//!
//! Passive vertices carry no state of their own: their position is the
//! bilinear interpolation of the four grid vertices around their anchor
//! cell, and forces acting on them are distributed over those vertices
//! with the same weights. Fixed meshes never move but still anchor
//! passive vertices for their neighbours to pull against.
//!
//! The observed error is the weighted mean length of all cross springs,
//! and relaxation stops on the same triple as the tile optimizer:
//! error under threshold, plateau, or iteration budget.

use std::collections::HashMap;

use crate::core::{Model, Point, Point2D, PointMatch};
use crate::error::{Error, Result};
use crate::optimize::{OptimizeConfig, OptimizeResult, Termination};
use crate::progress::Progress;

use super::identity::PointIdentityCache;

/// Mesh geometry and integration parameters shared by all layers of a
/// run.
#[derive(Clone, Debug)]
pub struct MeshConfig {
    /// Number of vertex columns; rows follow the layer aspect ratio.
    pub resolution: usize,
    /// Spring constant of the structural grid springs.
    pub stiffness: f32,
    /// Displacement cap per iteration for the fastest vertex, in
    /// working pixels.
    pub max_stretch: f32,
    /// Velocity damping factor in `(0, 1)`.
    pub damp: f32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            resolution: 16,
            stiffness: 0.1,
            max_stretch: 2000.0,
            damp: 0.6,
        }
    }
}

struct Vertex {
    point: Point,
    velocity: Point2D,
}

struct StructuralSpring {
    a: usize,
    b: usize,
    rest: f32,
}

/// A stateless vertex bilinearly anchored on its host mesh.
struct PassiveVertex {
    slots: [usize; 4],
    weights: [f32; 4],
    world: Point2D,
}

/// Zero-length spring between a grid vertex of one mesh and a passive
/// vertex anchored on another.
///
/// Both endpoints are `(mesh index, slot)` pairs into the mesh slice
/// handed to [`relax_meshes`].
#[derive(Clone, Copy, Debug)]
pub struct CrossSpring {
    /// Active endpoint: `(mesh, vertex)`.
    pub source: (usize, usize),
    /// Anchored endpoint: `(mesh, passive slot)`.
    pub target: (usize, usize),
    /// Spring constant, typically `1 / |layer distance|`.
    pub constant: f32,
    /// Correspondence weight from block matching.
    pub weight: f32,
}

/// Deformable grid over one layer's working-scale bounding box.
pub struct SpringMesh {
    cols: usize,
    rows: usize,
    spacing_x: f32,
    spacing_y: f32,
    stiffness: f32,
    max_stretch: f32,
    damp: f32,
    fixed: bool,
    vertices: Vec<Vertex>,
    by_id: HashMap<u64, usize>,
    structural: Vec<StructuralSpring>,
    passive: Vec<PassiveVertex>,
}

impl SpringMesh {
    /// Build a rest-state grid covering `width` x `height` working
    /// pixels. Row count scales with the aspect ratio so cells stay
    /// near square.
    pub fn new(config: &MeshConfig, width: f32, height: f32, fixed: bool) -> Result<Self> {
        if config.resolution < 2 {
            return Err(Error::InvalidConfiguration(format!(
                "mesh resolution {} below 2",
                config.resolution
            )));
        }
        if !(width > 0.0 && height > 0.0) {
            return Err(Error::InvalidConfiguration(format!(
                "mesh extent {}x{} not positive",
                width, height
            )));
        }
        if !(config.stiffness > 0.0 && config.max_stretch > 0.0) {
            return Err(Error::InvalidConfiguration(
                "mesh stiffness and max stretch must be positive".into(),
            ));
        }
        if !(config.damp > 0.0 && config.damp < 1.0) {
            return Err(Error::InvalidConfiguration(format!(
                "mesh damping {} outside (0, 1)",
                config.damp
            )));
        }

        let cols = config.resolution;
        let rows = ((((cols - 1) as f32) * height / width).round() as usize + 1).max(2);
        let spacing_x = width / (cols - 1) as f32;
        let spacing_y = height / (rows - 1) as f32;

        let mut vertices = Vec::with_capacity(cols * rows);
        for y in 0..rows {
            for x in 0..cols {
                let local = Point2D::new(x as f32 * spacing_x, y as f32 * spacing_y);
                vertices.push(Vertex {
                    point: Point::new(local),
                    velocity: Point2D::ZERO,
                });
            }
        }

        // Horizontal, vertical and both diagonals; the diagonals brace
        // the grid against shear.
        let diagonal = (spacing_x * spacing_x + spacing_y * spacing_y).sqrt();
        let mut structural = Vec::new();
        for y in 0..rows {
            for x in 0..cols {
                let i = y * cols + x;
                if x + 1 < cols {
                    structural.push(StructuralSpring {
                        a: i,
                        b: i + 1,
                        rest: spacing_x,
                    });
                }
                if y + 1 < rows {
                    structural.push(StructuralSpring {
                        a: i,
                        b: i + cols,
                        rest: spacing_y,
                    });
                }
                if x + 1 < cols && y + 1 < rows {
                    structural.push(StructuralSpring {
                        a: i,
                        b: i + cols + 1,
                        rest: diagonal,
                    });
                }
                if x > 0 && y + 1 < rows {
                    structural.push(StructuralSpring {
                        a: i,
                        b: i + cols - 1,
                        rest: diagonal,
                    });
                }
            }
        }

        Ok(Self {
            cols,
            rows,
            spacing_x,
            spacing_y,
            stiffness: config.stiffness,
            max_stretch: config.max_stretch,
            damp: config.damp,
            fixed,
            vertices,
            by_id: HashMap::new(),
            structural,
            passive: Vec::new(),
        })
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of grid vertices.
    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Register every vertex with the identity cache and index it by
    /// its assigned id.
    pub fn register_identities(&mut self, cache: &PointIdentityCache) {
        self.by_id.clear();
        for (i, v) in self.vertices.iter_mut().enumerate() {
            cache.register(&mut v.point);
            self.by_id.insert(v.point.id, i);
        }
    }

    /// Snapshot of the grid vertices, ids included, for handing to
    /// matching tasks.
    pub fn vertices(&self) -> Vec<Point> {
        self.vertices.iter().map(|v| v.point).collect()
    }

    /// Grid slot of the vertex carrying `id`, if registered here.
    pub fn vertex_index(&self, id: u64) -> Option<usize> {
        self.by_id.get(&id).copied()
    }

    /// Anchor a passive vertex at `position` (working-scale local
    /// coordinates, clamped into the grid) and return its slot.
    pub fn add_passive(&mut self, position: Point2D) -> usize {
        let fx = (position.x / self.spacing_x).clamp(0.0, (self.cols - 1) as f32);
        let fy = (position.y / self.spacing_y).clamp(0.0, (self.rows - 1) as f32);
        let cx = (fx.floor() as usize).min(self.cols - 2);
        let cy = (fy.floor() as usize).min(self.rows - 2);
        let u = (fx - cx as f32).clamp(0.0, 1.0);
        let v = (fy - cy as f32).clamp(0.0, 1.0);
        let base = cy * self.cols + cx;
        let slots = [base, base + 1, base + self.cols, base + self.cols + 1];
        let weights = [
            (1.0 - u) * (1.0 - v),
            u * (1.0 - v),
            (1.0 - u) * v,
            u * v,
        ];
        let mut world = Point2D::ZERO;
        for k in 0..4 {
            world = world + self.vertices[slots[k]].point.world * weights[k];
        }
        self.passive.push(PassiveVertex {
            slots,
            weights,
            world,
        });
        self.passive.len() - 1
    }

    /// Number of passive vertices anchored on this mesh.
    pub fn passive_len(&self) -> usize {
        self.passive.len()
    }

    /// Move every vertex to `model.apply(local)` and reset velocities.
    /// Applied after rigid pre-alignment, before relaxation.
    pub fn initialize(&mut self, model: &Model) {
        for v in &mut self.vertices {
            v.point.world = model.apply(v.point.local);
            v.velocity = Point2D::ZERO;
        }
        self.refresh_passive();
    }

    /// One correspondence per vertex, source grid position to deformed
    /// position, for fitting the export transform.
    pub fn control_matches(&self) -> Vec<PointMatch> {
        self.vertices
            .iter()
            .map(|v| {
                PointMatch::new(
                    Point::new(v.point.local),
                    Point::with_world(v.point.local, v.point.world),
                )
            })
            .collect()
    }

    fn refresh_passive(&mut self) {
        let Self {
            vertices, passive, ..
        } = self;
        for p in passive.iter_mut() {
            let mut world = Point2D::ZERO;
            for k in 0..4 {
                world = world + vertices[p.slots[k]].point.world * p.weights[k];
            }
            p.world = world;
        }
    }

    fn accumulate_structural(&self, out: &mut [Point2D]) {
        for s in &self.structural {
            let d = self.vertices[s.b].point.world - self.vertices[s.a].point.world;
            let len = d.length();
            if len <= f32::EPSILON {
                continue;
            }
            let f = d * (self.stiffness * (len - s.rest) / len);
            out[s.a] = out[s.a] + f;
            out[s.b] = out[s.b] - f;
        }
    }
}

impl std::fmt::Debug for SpringMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpringMesh")
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .field("fixed", &self.fixed)
            .field("passive", &self.passive.len())
            .finish()
    }
}

fn check_springs(meshes: &[SpringMesh], springs: &[CrossSpring]) -> Result<()> {
    for s in springs {
        let source_ok = meshes
            .get(s.source.0)
            .is_some_and(|m| s.source.1 < m.vertices.len());
        let target_ok = meshes
            .get(s.target.0)
            .is_some_and(|m| s.target.1 < m.passive.len());
        if !source_ok || !target_ok {
            return Err(Error::InvalidConfiguration(format!(
                "cross spring ({},{}) -> ({},{}) out of range",
                s.source.0, s.source.1, s.target.0, s.target.1
            )));
        }
    }
    Ok(())
}

fn spring_error(meshes: &[SpringMesh], springs: &[CrossSpring]) -> f32 {
    let mut sum = 0.0f32;
    let mut weight = 0.0f32;
    for s in springs {
        let active = meshes[s.source.0].vertices[s.source.1].point.world;
        let anchor = meshes[s.target.0].passive[s.target.1].world;
        sum += (anchor - active).length() * s.weight;
        weight += s.weight;
    }
    if weight > 0.0 {
        sum / weight
    } else {
        0.0
    }
}

fn step(meshes: &mut [SpringMesh], springs: &[CrossSpring], forces: &mut [Vec<Point2D>]) {
    for row in forces.iter_mut() {
        for f in row.iter_mut() {
            *f = Point2D::ZERO;
        }
    }
    for (mi, mesh) in meshes.iter().enumerate() {
        if mesh.fixed {
            continue;
        }
        mesh.accumulate_structural(&mut forces[mi]);
    }
    for s in springs {
        let active = meshes[s.source.0].vertices[s.source.1].point.world;
        let anchor = meshes[s.target.0].passive[s.target.1].world;
        let pull = (anchor - active) * (s.constant * s.weight);
        if !meshes[s.source.0].fixed {
            let f = &mut forces[s.source.0][s.source.1];
            *f = *f + pull;
        }
        if !meshes[s.target.0].fixed {
            let host = &meshes[s.target.0].passive[s.target.1];
            let slots = host.slots;
            let weights = host.weights;
            for k in 0..4 {
                let f = &mut forces[s.target.0][slots[k]];
                *f = *f - pull * weights[k];
            }
        }
    }

    let mut max_speed = 0.0f32;
    let mut cap = f32::INFINITY;
    for (mi, mesh) in meshes.iter_mut().enumerate() {
        if mesh.fixed {
            continue;
        }
        cap = cap.min(mesh.max_stretch);
        for (vi, v) in mesh.vertices.iter_mut().enumerate() {
            v.velocity = (v.velocity + forces[mi][vi]) * mesh.damp;
            max_speed = max_speed.max(v.velocity.length());
        }
    }
    let dt = if max_speed > 0.0 {
        (cap / max_speed).min(1.0)
    } else {
        0.0
    };
    for mesh in meshes.iter_mut() {
        if mesh.fixed {
            continue;
        }
        for v in mesh.vertices.iter_mut() {
            v.point.world = v.point.world + v.velocity * dt;
        }
    }
    for mesh in meshes.iter_mut() {
        mesh.refresh_passive();
    }
}

/// Relax the coupled mesh system until the cross-spring error drops
/// under `max_epsilon`, improvement plateaus, or the budget runs out.
///
/// A system with no cross springs has nothing tying the layers together
/// and is rejected with [`Error::NotEnoughPoints`].
pub fn relax_meshes(
    meshes: &mut [SpringMesh],
    springs: &[CrossSpring],
    config: &OptimizeConfig,
    progress: &Progress,
) -> Result<OptimizeResult> {
    if springs.is_empty() {
        return Err(Error::NotEnoughPoints {
            required: 1,
            found: 0,
        });
    }
    check_springs(meshes, springs)?;

    for mesh in meshes.iter_mut() {
        mesh.refresh_passive();
    }
    let initial_error = spring_error(meshes, springs);
    if initial_error < config.max_epsilon {
        log::info!(
            "Meshes already settled ({:.3} px < {:.3} px)",
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

    log::debug!(
        "Relaxing {} meshes against {} cross springs",
        meshes.len(),
        springs.len()
    );
    let mut forces: Vec<Vec<Point2D>> = meshes
        .iter()
        .map(|m| vec![Point2D::ZERO; m.vertices.len()])
        .collect();
    let mut best = f32::INFINITY;
    let mut plateau = 0usize;
    let mut iterations = 0usize;
    let mut error = initial_error;
    let termination = loop {
        progress.checkpoint()?;
        if iterations >= config.max_iterations {
            break Termination::MaxIterations;
        }
        step(meshes, springs, &mut forces);
        iterations += 1;
        error = spring_error(meshes, springs);
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

    log::info!(
        "Relaxed {} meshes in {} iterations: {:.3} px -> {:.3} px ({:?})",
        meshes.len(),
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

#[cfg(test)]
mod tests {
    use super::*;

    fn config(resolution: usize) -> MeshConfig {
        MeshConfig {
            resolution,
            stiffness: 0.1,
            max_stretch: 1000.0,
            damp: 0.6,
        }
    }

    fn relax_config(max_epsilon: f32) -> OptimizeConfig {
        OptimizeConfig {
            max_epsilon,
            max_iterations: 1000,
            max_plateau_width: 200,
        }
    }

    #[test]
    fn test_grid_follows_aspect_ratio() {
        let mesh = SpringMesh::new(&config(4), 100.0, 50.0, false).unwrap();
        assert_eq!(mesh.cols(), 4);
        assert_eq!(mesh.rows(), 3);
        assert_eq!(mesh.len(), 12);
        let points = mesh.vertices();
        assert_eq!(points[0].local, Point2D::ZERO);
        assert_eq!(points[11].local, Point2D::new(100.0, 50.0));
        // 9 horizontal + 8 vertical + 6 + 6 diagonal springs.
        assert_eq!(mesh.structural.len(), 29);
    }

    #[test]
    fn test_rejects_degenerate_configuration() {
        assert!(SpringMesh::new(&config(1), 10.0, 10.0, false).is_err());
        assert!(SpringMesh::new(&config(4), 0.0, 10.0, false).is_err());
        let bad = MeshConfig {
            damp: 1.5,
            ..config(4)
        };
        assert!(SpringMesh::new(&bad, 10.0, 10.0, false).is_err());
    }

    #[test]
    fn test_passive_vertex_follows_host() {
        let mut mesh = SpringMesh::new(&config(2), 10.0, 10.0, false).unwrap();
        let slot = mesh.add_passive(Point2D::new(5.0, 5.0));
        assert_eq!(mesh.passive[slot].world, Point2D::new(5.0, 5.0));

        let shift = Model::Translation {
            dx: 3.0,
            dy: 4.0,
        };
        mesh.initialize(&shift);
        assert_eq!(mesh.passive[slot].world, Point2D::new(8.0, 9.0));
    }

    #[test]
    fn test_passive_anchor_clamps_outside_positions() {
        let mut mesh = SpringMesh::new(&config(2), 10.0, 10.0, false).unwrap();
        let slot = mesh.add_passive(Point2D::new(-5.0, 25.0));
        let world = mesh.passive[slot].world;
        assert_eq!(world, Point2D::new(0.0, 10.0));
    }

    #[test]
    fn test_relaxation_pulls_mesh_onto_fixed_target() {
        let movable = SpringMesh::new(&config(2), 10.0, 10.0, false).unwrap();
        let mut target = SpringMesh::new(&config(2), 10.0, 10.0, true).unwrap();
        target.initialize(&Model::Translation { dx: 5.0, dy: 0.0 });

        let mut springs = Vec::new();
        let locals: Vec<Point2D> = movable.vertices().iter().map(|p| p.local).collect();
        for (i, local) in locals.iter().enumerate() {
            let slot = target.add_passive(*local);
            springs.push(CrossSpring {
                source: (0, i),
                target: (1, slot),
                constant: 1.0,
                weight: 1.0,
            });
        }

        let mut meshes = vec![movable, target];
        let result = relax_meshes(
            &mut meshes,
            &springs,
            &relax_config(0.05),
            &Progress::new(),
        )
        .unwrap();

        assert_eq!(result.termination, Termination::Converged);
        assert!(result.iterations > 0);
        assert!(result.initial_error > 4.0);
        for v in meshes[0].vertices() {
            assert!((v.world.x - (v.local.x + 5.0)).abs() < 0.2);
            assert!((v.world.y - v.local.y).abs() < 0.2);
        }
    }

    #[test]
    fn test_fixed_mesh_never_moves() {
        let movable = SpringMesh::new(&config(2), 10.0, 10.0, false).unwrap();
        let mut target = SpringMesh::new(&config(2), 10.0, 10.0, true).unwrap();
        target.initialize(&Model::Translation { dx: 5.0, dy: 0.0 });
        let before = target.vertices();

        let slot = target.add_passive(Point2D::new(5.0, 5.0));
        let springs = [CrossSpring {
            source: (0, 0),
            target: (1, slot),
            constant: 1.0,
            weight: 1.0,
        }];
        let mut meshes = vec![movable, target];
        relax_meshes(
            &mut meshes,
            &springs,
            &relax_config(0.5),
            &Progress::new(),
        )
        .unwrap();
        assert_eq!(meshes[1].vertices(), before);
        assert_ne!(meshes[0].vertices()[0].world, Point2D::ZERO);
    }

    #[test]
    fn test_without_cross_springs_is_an_error() {
        let mesh = SpringMesh::new(&config(2), 10.0, 10.0, false).unwrap();
        let mut meshes = vec![mesh];
        let err = relax_meshes(
            &mut meshes,
            &[],
            &relax_config(0.5),
            &Progress::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NotEnoughPoints { .. }));
    }

    #[test]
    fn test_out_of_range_spring_is_rejected() {
        let mesh = SpringMesh::new(&config(2), 10.0, 10.0, false).unwrap();
        let mut meshes = vec![mesh];
        let springs = [CrossSpring {
            source: (0, 99),
            target: (0, 0),
            constant: 1.0,
            weight: 1.0,
        }];
        let err = relax_meshes(
            &mut meshes,
            &springs,
            &relax_config(0.5),
            &Progress::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_cancellation_stops_relaxation() {
        let movable = SpringMesh::new(&config(2), 10.0, 10.0, false).unwrap();
        let mut target = SpringMesh::new(&config(2), 10.0, 10.0, true).unwrap();
        target.initialize(&Model::Translation { dx: 5.0, dy: 0.0 });
        let slot = target.add_passive(Point2D::new(0.0, 0.0));
        let springs = [CrossSpring {
            source: (0, 0),
            target: (1, slot),
            constant: 1.0,
            weight: 1.0,
        }];
        let mut meshes = vec![movable, target];
        let progress = Progress::new();
        progress.cancel();
        let err = relax_meshes(&mut meshes, &springs, &relax_config(0.05), &progress)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_control_matches_capture_deformation() {
        let mut mesh = SpringMesh::new(&config(2), 10.0, 10.0, false).unwrap();
        mesh.initialize(&Model::Translation { dx: 3.0, dy: -1.0 });
        let controls = mesh.control_matches();
        assert_eq!(controls.len(), 4);
        for m in controls {
            assert_eq!(m.p2.world.x, m.p1.local.x + 3.0);
            assert_eq!(m.p2.world.y, m.p1.local.y - 1.0);
        }
    }
}
