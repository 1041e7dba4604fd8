//! Two-layer feature store: an in-memory map in front of an optional
//! on-disk directory.
//!
//! Disk entries live at `<root>/features/<id-split>/<id>.features.bin`
//! where `id-split` nests two-digit groups of the decimal patch id so no
//! single directory grows unbounded. Every entry stores the parameter
//! fingerprint it was computed under; a read returns data only when the
//! stored fingerprint equals the requested one. Missing files, stale
//! fingerprints and parse failures are all plain cache misses, never
//! errors.
//!
//! The in-memory layer is the reclaimable part: dropping it (see
//! [`FeatureStore::release_memory`]) is the response to a collaborator
//! reporting resource exhaustion.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::AlignContext;
use crate::core::math::Fnv1a;
use crate::core::LayerPatch;
use crate::error::{Error, Result};
use crate::features::extractor::{extract, Feature, FeatureConfig};

pub(crate) const MAGIC: &[u8; 4] = b"SNDH";
pub(crate) const VERSION: u16 = 1;

/// Feature cache shared by one alignment context.
pub struct FeatureStore {
    root: Option<PathBuf>,
    memory: Mutex<HashMap<(u64, u64), Arc<Vec<Feature>>>>,
}

impl FeatureStore {
    /// `root = None` keeps the store memory-only.
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            memory: Mutex::new(HashMap::new()),
        }
    }

    /// Look up features for a patch under a parameter fingerprint.
    pub fn load(&self, id: u64, fingerprint: u64) -> Option<Arc<Vec<Feature>>> {
        if let Some(hit) = self.memory.lock().get(&(id, fingerprint)) {
            return Some(Arc::clone(hit));
        }
        let path = self.entry_path(id)?;
        match read_entry(&path, fingerprint) {
            Ok(Some(features)) => {
                let features = Arc::new(features);
                self.memory
                    .lock()
                    .insert((id, fingerprint), Arc::clone(&features));
                Some(features)
            }
            Ok(None) => None,
            Err(e) => {
                log::debug!("Feature cache read failed for {:?}: {}", path, e);
                None
            }
        }
    }

    /// Store features for a patch. A disk write failure degrades to
    /// memory-only caching and is logged, not surfaced.
    pub fn save(&self, id: u64, fingerprint: u64, features: Arc<Vec<Feature>>) {
        self.memory
            .lock()
            .insert((id, fingerprint), Arc::clone(&features));
        let Some(path) = self.entry_path(id) else {
            return;
        };
        if let Err(e) = write_entry(&path, fingerprint, &features) {
            log::warn!("Feature cache write failed for {:?}: {}", path, e);
        }
    }

    /// Drop the reclaimable in-memory layer. Disk entries survive.
    pub fn release_memory(&self) {
        let mut memory = self.memory.lock();
        let n = memory.len();
        memory.clear();
        if n > 0 {
            log::info!("Released {} in-memory feature sets", n);
        }
    }

    pub(crate) fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn entry_path(&self, id: u64) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        Some(hashed_id_path(root, "features", &id.to_string(), "features"))
    }
}

impl std::fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStore")
            .field("root", &self.root)
            .field("cached", &self.memory.lock().len())
            .finish()
    }
}

/// `<root>/<namespace>/<two-char groups>/<id>.<category>.bin`
///
/// `id` is any filename-safe identity string, e.g. a decimal patch id or
/// an `a_b` pair key. All but the last two-character group nest as
/// directories so no single directory grows unbounded.
pub(crate) fn hashed_id_path(root: &Path, namespace: &str, id: &str, category: &str) -> PathBuf {
    let mut path = root.join(namespace);
    let chunks: Vec<&[u8]> = id.as_bytes().chunks(2).collect();
    for chunk in &chunks[..chunks.len().saturating_sub(1)] {
        // Two-byte chunks of an ASCII id are themselves valid UTF-8.
        if let Ok(part) = std::str::from_utf8(chunk) {
            path.push(part);
        }
    }
    path.push(format!("{}.{}.bin", id, category));
    path
}

/// Extraction identity for a given parameter set at a render scale.
pub fn scaled_fingerprint(config: &FeatureConfig, scale: f32) -> u64 {
    let mut h = Fnv1a::new();
    h.write_u64(config.fingerprint());
    h.write_u32(scale.to_bits());
    h.finish()
}

/// Features for a patch, through the cache.
///
/// On a miss the patch is rendered at `scale` and features are extracted
/// from the scaled raster, then mapped back into full-resolution
/// patch-local coordinates before caching. A render that fails with
/// resource exhaustion releases all reclaimable caches and retries; any
/// other failure propagates.
pub fn cached_features(
    context: &AlignContext,
    patch: &LayerPatch,
    scale: f32,
    config: &FeatureConfig,
) -> Result<Arc<Vec<Feature>>> {
    if !(scale > 0.0 && scale <= 1.0) {
        return Err(Error::InvalidConfiguration(format!(
            "render scale {} outside (0, 1]",
            scale
        )));
    }
    let fingerprint = scaled_fingerprint(config, scale);
    if let Some(hit) = context.feature_store().load(patch.id, fingerprint) {
        log::debug!("Feature cache hit for patch {}", patch.id);
        return Ok(hit);
    }

    let raster = loop {
        context.checkpoint()?;
        match patch.source.render(patch.bounds, scale) {
            Ok(raster) => break raster,
            Err(Error::ResourceExhausted(msg)) => {
                log::warn!(
                    "Render of patch {} exhausted resources ({}), releasing caches and retrying",
                    patch.id,
                    msg
                );
                context.release_caches();
            }
            Err(e) => return Err(e),
        }
    };

    let mut features = extract(&raster, config, context.progress())?;
    let inv = 1.0 / scale;
    for f in features.iter_mut() {
        f.location = f.location * inv;
        f.scale *= inv;
    }
    log::info!(
        "Extracted {} features for patch {} at scale {}",
        features.len(),
        patch.id,
        scale
    );

    let features = Arc::new(features);
    context
        .feature_store()
        .save(patch.id, fingerprint, Arc::clone(&features));
    Ok(features)
}

fn write_entry(path: &Path, fingerprint: u64, features: &[Feature]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&fingerprint.to_le_bytes())?;
    w.write_all(&(features.len() as u32).to_le_bytes())?;
    for f in features {
        w.write_all(&f.location.x.to_le_bytes())?;
        w.write_all(&f.location.y.to_le_bytes())?;
        w.write_all(&f.scale.to_le_bytes())?;
        w.write_all(&f.orientation.to_le_bytes())?;
        w.write_all(&(f.descriptor.len() as u32).to_le_bytes())?;
        for v in &f.descriptor {
            w.write_all(&v.to_le_bytes())?;
        }
    }
    w.flush()
}

/// `Ok(None)` covers every non-error miss: absent file or a fingerprint
/// that no longer matches.
fn read_entry(path: &Path, fingerprint: u64) -> std::io::Result<Option<Vec<Feature>>> {
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
    let mut features = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        let x = read_f32(&mut r)?;
        let y = read_f32(&mut r)?;
        let scale = read_f32(&mut r)?;
        let orientation = read_f32(&mut r)?;
        let len = read_u32(&mut r)? as usize;
        let mut descriptor = vec![0.0f32; len];
        for v in descriptor.iter_mut() {
            *v = read_f32(&mut r)?;
        }
        features.push(Feature {
            location: crate::core::Point2D::new(x, y),
            scale,
            orientation,
            descriptor,
        });
    }
    Ok(Some(features))
}

pub(crate) fn read_u16<R: Read>(r: &mut R) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub(crate) fn read_u32<R: Read>(r: &mut R) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub(crate) fn read_u64<R: Read>(r: &mut R) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_f32<R: Read>(r: &mut R) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}
