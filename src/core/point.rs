//! Point and correspondence types for the alignment graph.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};

/// 2D point / vector in pixel coordinates (f32).
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2D {
    /// X coordinate in pixels.
    pub x: f32,
    /// Y coordinate in pixels.
    pub y: f32,
}

impl Point2D {
    /// Create a new point.
    #[inline]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Origin.
    pub const ZERO: Point2D = Point2D { x: 0.0, y: 0.0 };

    /// Euclidean distance to another point.
    #[inline]
    pub fn distance(&self, other: &Point2D) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Squared distance (faster, avoids sqrt).
    #[inline]
    pub fn distance_squared(&self, other: &Point2D) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Length (magnitude) of this point as a vector from the origin.
    #[inline]
    pub fn length(&self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Dot product with another point (as vectors).
    #[inline]
    pub fn dot(&self, other: &Point2D) -> f32 {
        self.x * other.x + self.y * other.y
    }

    /// Cross product (z-component of the 3D cross product).
    #[inline]
    pub fn cross(&self, other: &Point2D) -> f32 {
        self.x * other.y - self.y * other.x
    }

    /// Component-wise minimum.
    #[inline]
    pub fn min(&self, other: Point2D) -> Point2D {
        Point2D::new(self.x.min(other.x), self.y.min(other.y))
    }

    /// Component-wise maximum.
    #[inline]
    pub fn max(&self, other: Point2D) -> Point2D {
        Point2D::new(self.x.max(other.x), self.y.max(other.y))
    }

    /// Rotate this point around the origin by angle (radians).
    #[inline]
    pub fn rotate(&self, angle: f32) -> Point2D {
        let cos_a = angle.cos();
        let sin_a = angle.sin();
        Point2D::new(
            self.x * cos_a - self.y * sin_a,
            self.x * sin_a + self.y * cos_a,
        )
    }
}

impl Add for Point2D {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Point2D::new(self.x + other.x, self.y + other.y)
    }
}

impl Sub for Point2D {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Point2D::new(self.x - other.x, self.y - other.y)
    }
}

impl Mul<f32> for Point2D {
    type Output = Self;

    #[inline]
    fn mul(self, scalar: f32) -> Self {
        Point2D::new(self.x * scalar, self.y * scalar)
    }
}

/// A point carrying both its local (source frame) and world (transformed)
/// coordinates, plus a stable identity used when correspondence results are
/// merged across task boundaries.
///
/// `id == 0` means unregistered; only mesh vertices handed through the
/// point identity cache ever carry a nonzero id.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    /// Coordinates in the owning tile's or layer's local frame.
    pub local: Point2D,
    /// Coordinates after the owning transform has been applied.
    pub world: Point2D,
    /// Stable identity for cross-task merging (0 = unregistered).
    pub id: u64,
}

impl Point {
    /// Create a point whose world coordinates start equal to its local ones.
    #[inline]
    pub fn new(local: Point2D) -> Self {
        Self {
            local,
            world: local,
            id: 0,
        }
    }

    /// Create a point with distinct local and world coordinates.
    #[inline]
    pub fn with_world(local: Point2D, world: Point2D) -> Self {
        Self {
            local,
            world,
            id: 0,
        }
    }
}

/// One correspondence: an ordered pair of points believed to depict the
/// same physical location, with a scalar weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PointMatch {
    /// Point in the first tile/layer.
    pub p1: Point,
    /// Point in the second tile/layer.
    pub p2: Point,
    /// Contribution weight of this correspondence.
    pub weight: f32,
}

impl PointMatch {
    /// Create a correspondence with unit weight.
    #[inline]
    pub fn new(p1: Point, p2: Point) -> Self {
        Self {
            p1,
            p2,
            weight: 1.0,
        }
    }

    /// Create a correspondence with an explicit weight.
    #[inline]
    pub fn with_weight(p1: Point, p2: Point, weight: f32) -> Self {
        Self { p1, p2, weight }
    }

    /// The same correspondence seen from the other side: `(p2, p1)`.
    #[inline]
    pub fn flip(&self) -> PointMatch {
        PointMatch {
            p1: self.p2,
            p2: self.p1,
            weight: self.weight,
        }
    }

    /// Current world-space distance between the two endpoints.
    #[inline]
    pub fn distance(&self) -> f32 {
        self.p1.world.distance(&self.p2.world)
    }
}

/// Flip every match in a correspondence list.
pub fn flip_matches(matches: &[PointMatch]) -> Vec<PointMatch> {
    matches.iter().map(PointMatch::flip).collect()
}

/// Weighted mean world-space distance over a correspondence list.
///
/// Returns 0.0 for an empty list.
pub fn mean_distance(matches: &[PointMatch]) -> f32 {
    let mut sum = 0.0f64;
    let mut weight = 0.0f64;
    for m in matches {
        sum += f64::from(m.distance()) * f64::from(m.weight);
        weight += f64::from(m.weight);
    }
    if weight > 0.0 {
        (sum / weight) as f32
    } else {
        0.0
    }
}
