//! Axis-aligned bounding boxes and the raster collaborator seam.
//!
//! The pipeline never reads image files itself. Rasters are rendered on
//! demand by a [`RasterSource`] collaborator (the enclosing system's
//! flattening/mipmap machinery), given a bounding box and a scale.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::point::Point2D;
use crate::error::Result;

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    /// Minimum corner (smallest x and y values).
    pub min: Point2D,
    /// Maximum corner (largest x and y values).
    pub max: Point2D,
}

impl Rect {
    /// Create a new bounding box from min and max corners.
    #[inline]
    pub const fn new(min: Point2D, max: Point2D) -> Self {
        Self { min, max }
    }

    /// Create a box from origin and size.
    #[inline]
    pub fn from_size(width: f32, height: f32) -> Self {
        Self {
            min: Point2D::ZERO,
            max: Point2D::new(width, height),
        }
    }

    /// Create an empty (inverted) box that expands to fit any point.
    #[inline]
    pub fn empty() -> Self {
        Self {
            min: Point2D::new(f32::INFINITY, f32::INFINITY),
            max: Point2D::new(f32::NEG_INFINITY, f32::NEG_INFINITY),
        }
    }

    /// Check if the box is empty (zero or negative extent).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x >= self.max.x || self.min.y >= self.max.y
    }

    /// Width of the box (x extent).
    #[inline]
    pub fn width(&self) -> f32 {
        self.max.x - self.min.x
    }

    /// Height of the box (y extent).
    #[inline]
    pub fn height(&self) -> f32 {
        self.max.y - self.min.y
    }

    /// Center of the box.
    #[inline]
    pub fn center(&self) -> Point2D {
        Point2D::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
        )
    }

    /// Check if this box intersects another.
    #[inline]
    pub fn intersects(&self, other: &Rect) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
    }

    /// Intersection of two boxes (empty if they do not overlap).
    #[inline]
    pub fn intersection(&self, other: &Rect) -> Self {
        Self {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }

    /// Union of two boxes (smallest box containing both).
    #[inline]
    pub fn union(&self, other: &Rect) -> Self {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Self {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Expand the box to include a point.
    #[inline]
    pub fn expand_to_include(&mut self, point: Point2D) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    /// Corners in CCW order: [min, (max.x, min.y), max, (min.x, max.y)].
    #[inline]
    pub fn corners(&self) -> [Point2D; 4] {
        [
            self.min,
            Point2D::new(self.max.x, self.min.y),
            self.max,
            Point2D::new(self.min.x, self.max.y),
        ]
    }
}

/// A flattened grayscale raster with an optional alpha mask.
///
/// Pixels are row-major f32 in `[0, 1]`. The mask, when present, has the
/// same shape; a mask value below 1.0 marks pixels that are partially or
/// fully outside the painted region and must not contribute to feature
/// extraction or block correlation.
#[derive(Clone, Debug, Default)]
pub struct Raster {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Row-major intensity values in `[0, 1]`.
    pub pixels: Vec<f32>,
    /// Optional row-major alpha mask in `[0, 1]`.
    pub mask: Option<Vec<f32>>,
}

impl Raster {
    /// Create a raster filled with zeros and no mask.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0.0; width * height],
            mask: None,
        }
    }

    /// Pixel accessor with clamped (replicate-border) addressing.
    #[inline]
    pub fn get(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.pixels[y * self.width + x]
    }

    /// In-bounds pixel accessor.
    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.pixels[y * self.width + x]
    }

    /// Set a pixel (in bounds).
    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.pixels[y * self.width + x] = value;
    }

    /// Mask value at a pixel; 1.0 when no mask is attached.
    #[inline]
    pub fn mask_at(&self, x: usize, y: usize) -> f32 {
        match &self.mask {
            Some(m) => m[y * self.width + x],
            None => 1.0,
        }
    }

    /// True when the raster holds no pixels at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Collaborator seam: renders a flattened, scaled raster for a tile or
/// layer region.
///
/// Implementations may report [`crate::Error::ResourceExhausted`] when a
/// render cannot be satisfied under current memory pressure; the feature
/// pipeline responds by releasing reclaimable caches and retrying.
pub trait RasterSource: Send + Sync {
    /// Render the given region at `scale` (1.0 = full resolution).
    ///
    /// The returned raster has dimensions `ceil(bounds.size * scale)` and
    /// its pixel `(0, 0)` corresponds to `bounds.min`.
    fn render(&self, bounds: Rect, scale: f32) -> Result<Raster>;
}

/// One layer of a stack handed to the layer-alignment entry points:
/// identity, bounding box, and its raster collaborator.
#[derive(Clone)]
pub struct LayerPatch {
    /// Stable layer identity (cache key component).
    pub id: u64,
    /// Layer bounding box in world coordinates.
    pub bounds: Rect,
    /// Renderer for this layer's flattened image.
    pub source: Arc<dyn RasterSource>,
}

impl std::fmt::Debug for LayerPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerPatch")
            .field("id", &self.id)
            .field("bounds", &self.bounds)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_union_intersection() {
        let a = Rect::new(Point2D::new(0.0, 0.0), Point2D::new(10.0, 10.0));
        let b = Rect::new(Point2D::new(5.0, 5.0), Point2D::new(15.0, 15.0));

        let u = a.union(&b);
        assert_eq!(u.min, Point2D::new(0.0, 0.0));
        assert_eq!(u.max, Point2D::new(15.0, 15.0));

        let i = a.intersection(&b);
        assert_eq!(i.min, Point2D::new(5.0, 5.0));
        assert_eq!(i.max, Point2D::new(10.0, 10.0));
        assert!(!i.is_empty());
    }

    #[test]
    fn test_rect_empty() {
        assert!(Rect::empty().is_empty());
        assert!(Rect::from_size(0.0, 5.0).is_empty());
        assert!(!Rect::from_size(1.0, 1.0).is_empty());

        let a = Rect::from_size(10.0, 10.0);
        assert_eq!(a.union(&Rect::empty()), a);
    }

    #[test]
    fn test_rect_disjoint_intersection_is_empty() {
        let a = Rect::from_size(10.0, 10.0);
        let b = Rect::new(Point2D::new(20.0, 20.0), Point2D::new(30.0, 30.0));
        assert!(!a.intersects(&b));
        assert!(a.intersection(&b).is_empty());
    }

    #[test]
    fn test_raster_accessors() {
        let mut r = Raster::new(4, 3);
        r.set(2, 1, 0.5);
        assert_eq!(r.at(2, 1), 0.5);
        // Clamped addressing replicates the border.
        assert_eq!(r.get(-1, 0), r.at(0, 0));
        assert_eq!(r.get(10, 10), r.at(3, 2));
        assert_eq!(r.mask_at(0, 0), 1.0);
    }
}
