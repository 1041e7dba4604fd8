//! Elastic registration of a layer series.
//!
//! [`align_layers`] drives the whole pipeline over an ordered run of
//! layers:
//!
//! 1. Gather correspondence candidates: every layer is matched against
//!    its following neighbours inside a sliding window, by features at
//!    the working scale, yielding one pairwise model per connected
//!    pair. A run of consecutive unmatched pairs cuts the search off.
//! 2. Block matching: for every connected pair, block correlation
//!    moves mesh vertices of each movable side toward the other layer,
//!    searching around the position the pairwise model predicts.
//! 3. Relaxation: block matches become cross springs between the layer
//!    meshes, layers are pre-aligned rigidly, and the coupled system
//!    relaxes until the correspondence error settles.
//! 4. Propagation: every relaxed mesh is exported as a moving least
//!    squares transform in full-resolution coordinates; the first and
//!    last transform can be handed out separately for layers outside
//!    the range.
//!
//! Everything heavy runs on context worker pools; the first failing
//! task cancels the rest of its phase. A pair with no usable block
//! matches is fine, but a run whose layers share no springs at all
//! cannot be registered and aborts with [`Error::NotEnoughPoints`].

use std::collections::HashSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::context::AlignContext;
use crate::core::{LayerPatch, Model, ModelKind, Point, Point2D, PointMatch, Raster, Rect};
use crate::error::{Error, Result};
use crate::executor::{collect_phase, PoolSize};
use crate::features::{cached_features, Feature};
use crate::matching::{match_candidates, match_consensus, MatchConfig};
use crate::optimize::{OptimizeConfig, OptimizeResult, Tile, TileConfiguration};

use super::block::{block_matches, local_smoothness_filter, BlockMatchParams};
use super::identity::PointIdentityCache;
use super::mesh::{relax_meshes, CrossSpring, MeshConfig, SpringMesh};
use super::mls::MlsTransform;

/// Exponent of the moving least squares distance weights.
const MLS_ALPHA: f32 = 2.0;

/// One layer of the series to register.
#[derive(Clone, Debug)]
pub struct ElasticLayer {
    /// The layer's pixel source and full-resolution bounds.
    pub patch: LayerPatch,
    /// Fixed layers anchor the series; their mesh never deforms.
    pub fixed: bool,
}

impl ElasticLayer {
    pub fn new(patch: LayerPatch) -> Self {
        Self {
            patch,
            fixed: false,
        }
    }

    pub fn fixed(patch: LayerPatch) -> Self {
        Self { patch, fixed: true }
    }
}

/// Parameters of one elastic alignment run.
///
/// Scales, radii and displacement bounds are given in full-resolution
/// pixels; the run converts them to the working scale internally.
#[derive(Clone, Debug)]
pub struct ElasticConfig {
    /// Scale at which layers are rendered, matched and meshed.
    pub layer_scale: f32,
    /// Pairwise feature matching parameters; the residual threshold
    /// and identity tolerance apply at full resolution.
    pub matching: MatchConfig,
    /// Skip feature matching and assume layers already sit roughly on
    /// top of each other.
    pub is_aligned: bool,
    /// How many following layers each layer is compared against.
    pub max_num_neighbors: usize,
    /// Consecutive unmatched pairs before the candidate search stops.
    pub max_num_failures: usize,
    /// Block search radius around the predicted position.
    pub search_radius: f32,
    /// Block radius; negative picks half a mesh cell.
    pub block_radius: f32,
    /// Minimal accepted block correlation.
    pub min_r: f32,
    /// Maximal second-best/best correlation peak ratio.
    pub rod_r: f32,
    /// Maximal curvature ratio of the correlation peak.
    pub max_curvature_r: f32,
    /// Filter block matches against locally fitted models.
    pub use_local_smoothness_filter: bool,
    /// Model fitted by the smoothness filter.
    pub local_model: ModelKind,
    /// Gaussian width of the smoothness filter neighbourhood.
    pub local_region_sigma: f32,
    /// Absolute residual bound of the smoothness filter.
    pub max_local_epsilon: f32,
    /// Relative residual bound as a multiple of the median.
    pub max_local_trust: f32,
    /// Mesh vertex columns per layer.
    pub mesh_resolution: usize,
    /// Structural spring constant.
    pub stiffness: f32,
    /// Velocity damping during relaxation.
    pub damp: f32,
    /// Displacement cap per relaxation step.
    pub max_stretch: f32,
    /// Iteration budget shared by pre-alignment and relaxation.
    pub max_mesh_iterations: usize,
    /// Plateau width shared by pre-alignment and relaxation.
    pub max_mesh_plateau_width: usize,
    /// Tile model of the rigid pre-alignment.
    pub desired_model: ModelKind,
    /// Also export the first transform for layers before the range.
    pub propagate_before: bool,
    /// Also export the last transform for layers after the range.
    pub propagate_after: bool,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            layer_scale: 0.1,
            matching: MatchConfig::default(),
            is_aligned: false,
            max_num_neighbors: 1,
            max_num_failures: 3,
            search_radius: 200.0,
            block_radius: -1.0,
            min_r: 0.6,
            rod_r: 0.9,
            max_curvature_r: 10.0,
            use_local_smoothness_filter: true,
            local_model: ModelKind::Rigid,
            local_region_sigma: 200.0,
            max_local_epsilon: 100.0,
            max_local_trust: 3.0,
            mesh_resolution: 16,
            stiffness: 0.1,
            damp: 0.6,
            max_stretch: 2000.0,
            max_mesh_iterations: 1000,
            max_mesh_plateau_width: 200,
            desired_model: ModelKind::Rigid,
            propagate_before: false,
            propagate_after: false,
        }
    }
}

impl ElasticConfig {
    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        if !(self.layer_scale > 0.0 && self.layer_scale <= 1.0) {
            return Err(Error::InvalidConfiguration(format!(
                "layer scale {} outside (0, 1]",
                self.layer_scale
            )));
        }
        if self.max_num_neighbors == 0 {
            return Err(Error::InvalidConfiguration(
                "neighbour window must cover at least one layer".into(),
            ));
        }
        if self.search_radius <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "search radius must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_r) || !(self.rod_r > 0.0 && self.rod_r <= 1.0) {
            return Err(Error::InvalidConfiguration(
                "correlation thresholds must lie in (0, 1]".into(),
            ));
        }
        if self.max_curvature_r <= 0.0 || self.max_local_trust <= 0.0 {
            return Err(Error::InvalidConfiguration(
                "curvature and trust bounds must be positive".into(),
            ));
        }
        if self.mesh_resolution < 2 {
            return Err(Error::InvalidConfiguration(format!(
                "mesh resolution {} below 2",
                self.mesh_resolution
            )));
        }
        if !(self.stiffness > 0.0 && self.max_stretch > 0.0) {
            return Err(Error::InvalidConfiguration(
                "stiffness and max stretch must be positive".into(),
            ));
        }
        if !(self.damp > 0.0 && self.damp < 1.0) {
            return Err(Error::InvalidConfiguration(format!(
                "damping {} outside (0, 1)",
                self.damp
            )));
        }
        Ok(())
    }
}

/// Outcome of one layer pair, for inspection and reporting.
#[derive(Clone, Debug)]
pub struct PairReport {
    /// Index of the earlier layer.
    pub a: usize,
    /// Index of the later layer.
    pub b: usize,
    /// Pairwise model in working-scale coordinates.
    pub model: Model,
    /// Accepted block matches pulling layer `a` toward `b`.
    pub forward: usize,
    /// Accepted block matches pulling layer `b` toward `a`.
    pub reverse: usize,
}

/// Everything an elastic run produces.
#[derive(Debug)]
pub struct ElasticResult {
    /// One full-resolution transform per input layer, in order.
    pub transforms: Vec<MlsTransform>,
    /// Copy of the first transform when requested.
    pub propagate_before: Option<MlsTransform>,
    /// Copy of the last transform when requested.
    pub propagate_after: Option<MlsTransform>,
    /// Per-pair matching outcomes.
    pub pairs: Vec<PairReport>,
    /// Relaxation summary.
    pub relax: OptimizeResult,
}

struct LayerPair {
    a: usize,
    b: usize,
    model: Model,
}

struct PairBlocks {
    a: usize,
    b: usize,
    model: Model,
    forward: Vec<PointMatch>,
    reverse: Vec<PointMatch>,
}

/// Register an ordered run of layers elastically.
///
/// Layer order is the stacking order; index distance sets the cross
/// spring strength between connected layers. At least two layers with
/// non-empty bounds are required, and every layer patch needs a
/// distinct id.
pub fn align_layers(
    context: &AlignContext,
    layers: &[ElasticLayer],
    config: &ElasticConfig,
) -> Result<ElasticResult> {
    config.validate()?;
    if layers.len() < 2 {
        return Err(Error::InvalidConfiguration(format!(
            "elastic alignment needs at least two layers, got {}",
            layers.len()
        )));
    }
    for (i, layer) in layers.iter().enumerate() {
        if layer.patch.bounds.is_empty() {
            return Err(Error::InvalidConfiguration(format!(
                "layer {} has empty bounds",
                i
            )));
        }
    }
    let mut bbox = layers[0].patch.bounds;
    for layer in &layers[1..] {
        bbox = bbox.union(&layer.patch.bounds);
    }
    let scale = config.layer_scale;
    log::info!(
        "Elastic alignment of {} layers over {:.0}x{:.0} px at scale {}",
        layers.len(),
        bbox.width(),
        bbox.height(),
        scale
    );

    let pairs = gather_candidates(context, layers, bbox, config)?;
    if pairs.is_empty() {
        return Err(Error::NotEnoughPoints {
            required: 1,
            found: 0,
        });
    }
    log::info!("{} layer pairs connected", pairs.len());

    // Meshes live in working-scale coordinates over the union box.
    let width = (bbox.width() * scale).ceil().max(1.0);
    let height = (bbox.height() * scale).ceil().max(1.0);
    let mesh_config = MeshConfig {
        resolution: config.mesh_resolution,
        stiffness: config.stiffness,
        max_stretch: config.max_stretch * scale,
        damp: config.damp,
    };
    let mut meshes = Vec::with_capacity(layers.len());
    for layer in layers {
        meshes.push(SpringMesh::new(&mesh_config, width, height, layer.fixed)?);
    }
    let identities = PointIdentityCache::new();
    for mesh in &mut meshes {
        mesh.register_identities(&identities);
    }

    let blocks = match_blocks(context, layers, &meshes, &pairs, bbox, config)?;

    // Merge phase: block matches become cross springs, tile
    // connections and report counts.
    let tiles: Vec<Tile> = layers
        .iter()
        .map(|l| {
            Tile::new(
                l.patch.id,
                l.patch.clone(),
                Model::identity(config.desired_model),
            )
        })
        .collect();
    let mut reports: Vec<PairReport> = pairs
        .iter()
        .map(|p| PairReport {
            a: p.a,
            b: p.b,
            model: p.model.clone(),
            forward: 0,
            reverse: 0,
        })
        .collect();
    let mut cross: Vec<CrossSpring> = Vec::new();
    context.progress().add_work(blocks.len());
    for mut pb in blocks {
        let constant = 1.0 / (pb.b - pb.a) as f32;
        let min_matches = pb.model.min_num_matches();
        let mut connect: Vec<PointMatch> = Vec::new();

        for m in pb.forward.iter_mut().chain(pb.reverse.iter_mut()) {
            identities.sync_match(m);
        }
        if config.use_local_smoothness_filter {
            for (label, list) in [("forward", &mut pb.forward), ("reverse", &mut pb.reverse)] {
                let before = list.len();
                if before == 0 {
                    continue;
                }
                local_smoothness_filter(
                    list,
                    config.local_model,
                    config.local_region_sigma * scale,
                    config.max_local_epsilon * scale,
                    config.max_local_trust,
                );
                log::info!(
                    "Layers {} -> {}: {} of {} {} block matches passed the smoothness filter",
                    pb.a,
                    pb.b,
                    list.len(),
                    before,
                    label
                );
            }
        }

        attach_springs(&mut meshes, &mut cross, pb.a, pb.b, &pb.forward, constant);
        attach_springs(&mut meshes, &mut cross, pb.b, pb.a, &pb.reverse, constant);

        if pb.forward.len() > min_matches {
            connect.extend(pb.forward.iter().copied());
        }
        if pb.reverse.len() > min_matches {
            connect.extend(pb.reverse.iter().map(|m| m.flip()));
        }
        if let Some(report) = reports.iter_mut().find(|r| r.a == pb.a && r.b == pb.b) {
            report.forward = pb.forward.len();
            report.reverse = pb.reverse.len();
        }
        if !connect.is_empty() {
            Tile::connect(&tiles[pb.a], &tiles[pb.b], connect)?;
        }
        context.progress().step();
    }
    identities.clear();

    // Rigid pre-alignment seeds the meshes close to their relaxed
    // position; the same budgets drive the relaxation afterwards.
    log::info!("Pre-aligning {} layers rigidly", layers.len());
    let fixed_tiles: Vec<Tile> = layers
        .iter()
        .enumerate()
        .filter(|(_, l)| l.fixed)
        .map(|(i, _)| tiles[i].clone())
        .collect();
    let configuration = TileConfiguration::new(tiles.clone(), &fixed_tiles)?;
    let relax_budget = OptimizeConfig {
        max_epsilon: config.matching.max_epsilon * scale,
        max_iterations: config.max_mesh_iterations,
        max_plateau_width: config.max_mesh_plateau_width,
    };
    configuration.optimize(context, &relax_budget)?;
    for (i, mesh) in meshes.iter_mut().enumerate() {
        mesh.initialize(&tiles[i].model());
    }

    let relax = relax_meshes(&mut meshes, &cross, &relax_budget, context.progress())?;

    // Export transforms in full-resolution coordinates.
    log::info!("Exporting {} layer transforms", meshes.len());
    let inverse_scale = 1.0 / scale;
    let mut transforms = Vec::with_capacity(meshes.len());
    for mesh in &meshes {
        let controls: Vec<PointMatch> = mesh
            .control_matches()
            .into_iter()
            .map(|m| {
                let source = m.p1.local * inverse_scale + bbox.min;
                let target = m.p2.world * inverse_scale + bbox.min;
                PointMatch::new(Point::new(source), Point::new(target))
            })
            .collect();
        transforms.push(MlsTransform::new(controls, MLS_ALPHA)?);
    }
    let propagate_before = config.propagate_before.then(|| transforms[0].clone());
    let propagate_after = config
        .propagate_after
        .then(|| transforms[transforms.len() - 1].clone());

    Ok(ElasticResult {
        transforms,
        propagate_before,
        propagate_after,
        pairs: reports,
        relax,
    })
}

/// Attach one cross spring per block match, pulling `source_mesh`
/// vertices toward passive anchors on `target_mesh`.
fn attach_springs(
    meshes: &mut [SpringMesh],
    cross: &mut Vec<CrossSpring>,
    source_mesh: usize,
    target_mesh: usize,
    matches: &[PointMatch],
    constant: f32,
) {
    for m in matches {
        let Some(vertex) = meshes[source_mesh].vertex_index(m.p1.id) else {
            log::warn!("Block match endpoint without registered identity, skipping");
            continue;
        };
        let slot = meshes[target_mesh].add_passive(m.p2.world);
        cross.push(CrossSpring {
            source: (source_mesh, vertex),
            target: (target_mesh, slot),
            constant,
            weight: m.weight,
        });
    }
}

/// Match every layer against its forward window and keep the pairs a
/// model was found for.
fn gather_candidates(
    context: &AlignContext,
    layers: &[ElasticLayer],
    bbox: Rect,
    config: &ElasticConfig,
) -> Result<Vec<LayerPair>> {
    let window = |a: usize| (a + 1)..layers.len().min(a + 1 + config.max_num_neighbors);

    if config.is_aligned {
        let mut pairs = Vec::new();
        for a in 0..layers.len() {
            for b in window(a) {
                pairs.push(LayerPair {
                    a,
                    b,
                    model: Model::identity(ModelKind::Translation),
                });
            }
        }
        return Ok(pairs);
    }

    log::info!("Gathering correspondence candidates");
    let scale = config.layer_scale;
    let pool = context
        .executors()
        .pool("elastic-candidates", PoolSize::CoreShare { tenths: 10 });

    // Features are extracted once per layer at full resolution and
    // shared through the feature cache.
    context.progress().add_work(layers.len());
    let jobs: Vec<_> = layers
        .iter()
        .map(|layer| {
            let ctx = context.clone();
            let patch = layer.patch.clone();
            let feature_config = config.matching.features.clone();
            move || {
                let result = cached_features(&ctx, &patch, 1.0, &feature_config);
                if result.is_ok() {
                    ctx.progress().step();
                }
                ctx.cancel_on_error(result)
            }
        })
        .collect();
    let features = collect_phase(pool.run_all(jobs)?)?;

    let scaled = scaled_matching(&config.matching, scale);
    let mut pairs = Vec::new();
    let mut failures = 0usize;
    'anchors: for a in 0..layers.len() {
        if failures >= config.max_num_failures {
            log::warn!(
                "Stopping the candidate search after {} consecutive unmatched pairs",
                failures
            );
            break;
        }
        let neighbours: Vec<usize> = window(a).collect();
        if neighbours.is_empty() {
            continue;
        }
        let jobs: Vec<_> = neighbours
            .iter()
            .map(|&b| {
                let ctx = context.clone();
                let fa = Arc::clone(&features[a]);
                let fb = Arc::clone(&features[b]);
                let bounds = (layers[a].patch.bounds, layers[b].patch.bounds);
                let origin = bbox.min;
                let matching = scaled.clone();
                move || {
                    ctx.cancel_on_error(match_layer_pair(
                        &ctx, &fa, &fb, bounds, origin, scale, &matching,
                    ))
                }
            })
            .collect();
        let outcomes = collect_phase(pool.run_all(jobs)?)?;
        for (&b, outcome) in neighbours.iter().zip(outcomes) {
            match outcome {
                Some((model, count, residual)) => {
                    failures = 0;
                    log::info!(
                        "Layers {} -> {}: {} correspondences, mean residual {:.3} px",
                        a,
                        b,
                        count,
                        residual / scale
                    );
                    pairs.push(LayerPair { a, b, model });
                }
                None => {
                    failures += 1;
                    log::info!("Layers {} -> {}: no model found", a, b);
                    if failures >= config.max_num_failures {
                        continue 'anchors;
                    }
                }
            }
        }
    }
    Ok(pairs)
}

/// Feature matching for one layer pair in working-scale coordinates.
fn match_layer_pair(
    context: &AlignContext,
    a: &[Feature],
    b: &[Feature],
    bounds: (Rect, Rect),
    origin: Point2D,
    scale: f32,
    config: &MatchConfig,
) -> Result<Option<(Model, usize, f32)>> {
    context.checkpoint()?;
    let mut candidates = match_candidates(a, b, config.rod);
    for m in &mut candidates {
        let p1 = (m.p1.local + bounds.0.min - origin) * scale;
        let p2 = (m.p2.local + bounds.1.min - origin) * scale;
        *m = PointMatch::new(Point::new(p1), Point::new(p2));
    }
    let mut rng = StdRng::from_os_rng();
    Ok(match_consensus(&mut rng, &mut candidates, config)
        .map(|r| (r.model, r.inliers.len(), r.error)))
}

/// Render the needed layers at the working scale and run block
/// matching for every connected pair.
fn match_blocks(
    context: &AlignContext,
    layers: &[ElasticLayer],
    meshes: &[SpringMesh],
    pairs: &[LayerPair],
    bbox: Rect,
    config: &ElasticConfig,
) -> Result<Vec<PairBlocks>> {
    let scale = config.layer_scale;
    let full_block_radius = if config.block_radius < 0.0 {
        bbox.width() / config.mesh_resolution as f32 / 2.0
    } else {
        config.block_radius
    };
    let params = BlockMatchParams {
        block_radius: ((full_block_radius * scale).round() as isize).max(16) as usize,
        search_radius: ((config.search_radius * scale).round() as isize).max(1) as usize,
        min_r: config.min_r,
        rod_r: config.rod_r,
        max_curvature_r: config.max_curvature_r,
    };
    log::info!(
        "Block matching {} pairs, block radius {} px, search radius {} px",
        pairs.len(),
        params.block_radius,
        params.search_radius
    );

    let pool = context
        .executors()
        .pool("elastic-blockmatch", PoolSize::CoreShare { tenths: 10 });

    // Layers only feeding pairs of two fixed sides are never sampled.
    let mut wanted: Vec<usize> = pairs
        .iter()
        .filter(|p| !(layers[p.a].fixed && layers[p.b].fixed))
        .flat_map(|p| [p.a, p.b])
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    wanted.sort_unstable();

    let jobs: Vec<_> = wanted
        .iter()
        .map(|&i| {
            let ctx = context.clone();
            let patch = layers[i].patch.clone();
            move || ctx.cancel_on_error(render_working(&ctx, &patch, bbox, scale).map(Arc::new))
        })
        .collect();
    let rendered = collect_phase(pool.run_all(jobs)?)?;
    let mut rasters: Vec<Option<Arc<Raster>>> = vec![None; layers.len()];
    for (slot, raster) in wanted.into_iter().zip(rendered) {
        rasters[slot] = Some(raster);
    }

    let mut jobs = Vec::new();
    for pair in pairs {
        if layers[pair.a].fixed && layers[pair.b].fixed {
            continue;
        }
        let (Some(source), Some(target)) = (rasters[pair.a].clone(), rasters[pair.b].clone())
        else {
            continue;
        };
        let ctx = context.clone();
        let (a, b) = (pair.a, pair.b);
        let model = pair.model.clone();
        let queries_a = meshes[a].vertices();
        let queries_b = meshes[b].vertices();
        let skip_forward = layers[a].fixed;
        let skip_reverse = layers[b].fixed;
        jobs.push(move || {
            let result = (|| -> Result<PairBlocks> {
                let forward = if skip_forward {
                    Vec::new()
                } else {
                    block_matches(&source, &target, &model, &queries_a, &params, ctx.progress())?
                };
                let reverse = if skip_reverse {
                    Vec::new()
                } else {
                    let inverse = model.invert()?;
                    block_matches(&target, &source, &inverse, &queries_b, &params, ctx.progress())?
                };
                log::debug!(
                    "Layers {} -> {}: {} forward and {} reverse block matches",
                    a,
                    b,
                    forward.len(),
                    reverse.len()
                );
                Ok(PairBlocks {
                    a,
                    b,
                    model,
                    forward,
                    reverse,
                })
            })();
            ctx.cancel_on_error(result)
        });
    }
    collect_phase(pool.run_all(jobs)?)
}

/// Render a layer patch over the union box, releasing caches and
/// retrying when memory runs out.
fn render_working(
    context: &AlignContext,
    patch: &LayerPatch,
    bounds: Rect,
    scale: f32,
) -> Result<Raster> {
    loop {
        context.checkpoint()?;
        match patch.source.render(bounds, scale) {
            Ok(raster) => return Ok(raster),
            Err(Error::ResourceExhausted(msg)) => {
                log::warn!(
                    "Render of layer patch {} exhausted resources ({}), releasing caches and retrying",
                    patch.id,
                    msg
                );
                context.release_caches();
            }
            Err(e) => return Err(e),
        }
    }
}

/// Matching thresholds converted to the working scale.
fn scaled_matching(config: &MatchConfig, scale: f32) -> MatchConfig {
    let mut scaled = config.clone();
    scaled.max_epsilon *= scale;
    scaled.identity_tolerance *= scale;
    scaled
}
