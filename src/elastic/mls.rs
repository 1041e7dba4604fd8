//! Moving least squares interpolation of mesh deformations.
//!
//! A relaxed mesh yields one control match per vertex, source grid
//! position to deformed position. The exported transform fits a fresh
//! model for every query point, weighting each control by
//! `1 / d^(2 alpha)` with `d` the distance to the query, so the
//! deformation follows the controls closely nearby and blends smoothly
//! in between.

use crate::core::{Model, ModelKind, Point2D, PointMatch};
use crate::error::{Error, Result};

/// Smooth spatial transform interpolating a set of control matches.
#[derive(Clone)]
pub struct MlsTransform {
    control: Vec<PointMatch>,
    alpha: f32,
    kind: ModelKind,
}

impl MlsTransform {
    /// Build a transform over `control`. The per-query model follows
    /// the control count: one control gives a translation, two a
    /// similarity, three or more an affine model.
    pub fn new(control: Vec<PointMatch>, alpha: f32) -> Result<Self> {
        if control.is_empty() {
            return Err(Error::NotEnoughPoints {
                required: 1,
                found: 0,
            });
        }
        if !(alpha > 0.0) {
            return Err(Error::InvalidConfiguration(format!(
                "interpolation exponent {} not positive",
                alpha
            )));
        }
        let kind = match control.len() {
            1 => ModelKind::Translation,
            2 => ModelKind::Similarity,
            _ => ModelKind::Affine,
        };
        Ok(Self {
            control,
            alpha,
            kind,
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn control_len(&self) -> usize {
        self.control.len()
    }

    /// Transform one point. Queries landing on a control point snap to
    /// its target exactly.
    pub fn apply(&self, p: Point2D) -> Point2D {
        for m in &self.control {
            if m.p1.local.distance_squared(&p) < 1e-9 {
                return m.p2.world;
            }
        }
        let weighted: Vec<PointMatch> = self
            .control
            .iter()
            .map(|m| {
                let d2 = m.p1.local.distance_squared(&p);
                let w = m.weight / d2.powf(self.alpha);
                PointMatch::with_weight(m.p1, m.p2, w)
            })
            .collect();
        // degenerate neighbourhoods step down to simpler models
        let mut kind = self.kind;
        loop {
            let mut model = Model::identity(kind);
            if model.fit(&weighted).is_ok() {
                return model.apply(p);
            }
            kind = match kind {
                ModelKind::Affine | ModelKind::Homography => ModelKind::Similarity,
                ModelKind::Similarity | ModelKind::Rigid => ModelKind::Translation,
                ModelKind::Translation => return p,
            };
        }
    }
}

impl std::fmt::Debug for MlsTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlsTransform")
            .field("control", &self.control.len())
            .field("alpha", &self.alpha)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Point;

    fn control(x: f32, y: f32, dx: f32, dy: f32) -> PointMatch {
        PointMatch::new(
            Point::new(Point2D::new(x, y)),
            Point::new(Point2D::new(x + dx, y + dy)),
        )
    }

    #[test]
    fn test_translation_controls_interpolate_everywhere() {
        let controls = vec![
            control(0.0, 0.0, 10.0, -5.0),
            control(100.0, 0.0, 10.0, -5.0),
            control(0.0, 100.0, 10.0, -5.0),
            control(100.0, 100.0, 10.0, -5.0),
        ];
        let mls = MlsTransform::new(controls, 2.0).unwrap();
        assert_eq!(mls.kind(), ModelKind::Affine);
        let out = mls.apply(Point2D::new(3.3, 7.7));
        assert!((out.x - 13.3).abs() < 1e-3);
        assert!((out.y - 2.7).abs() < 1e-3);
    }

    #[test]
    fn test_query_on_control_snaps_to_target() {
        let controls = vec![
            control(0.0, 0.0, 1.0, 2.0),
            control(50.0, 0.0, -3.0, 4.0),
            control(0.0, 50.0, 2.0, 2.0),
        ];
        let mls = MlsTransform::new(controls, 2.0).unwrap();
        assert_eq!(mls.apply(Point2D::new(50.0, 0.0)), Point2D::new(47.0, 4.0));
    }

    #[test]
    fn test_single_control_is_pure_translation() {
        let mls = MlsTransform::new(vec![control(5.0, 5.0, 3.0, 4.0)], 2.0).unwrap();
        assert_eq!(mls.kind(), ModelKind::Translation);
        let out = mls.apply(Point2D::new(0.0, 0.0));
        assert!((out.x - 3.0).abs() < 1e-4);
        assert!((out.y - 4.0).abs() < 1e-4);
    }

    #[test]
    fn test_two_controls_fit_a_similarity() {
        let controls = vec![
            PointMatch::new(
                Point::new(Point2D::new(0.0, 0.0)),
                Point::new(Point2D::new(0.0, 0.0)),
            ),
            PointMatch::new(
                Point::new(Point2D::new(10.0, 0.0)),
                Point::new(Point2D::new(0.0, 10.0)),
            ),
        ];
        let mls = MlsTransform::new(controls, 2.0).unwrap();
        assert_eq!(mls.kind(), ModelKind::Similarity);
        // a quarter turn maps the midpoint of the baseline accordingly
        let out = mls.apply(Point2D::new(5.0, 0.0));
        assert!((out.x - 0.0).abs() < 1e-3);
        assert!((out.y - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_deformation_follows_nearest_cluster() {
        let controls = vec![
            control(0.0, 0.0, 10.0, 0.0),
            control(10.0, 0.0, 10.0, 0.0),
            control(0.0, 10.0, 10.0, 0.0),
            control(100.0, 100.0, -10.0, 0.0),
            control(110.0, 100.0, -10.0, 0.0),
            control(100.0, 110.0, -10.0, 0.0),
        ];
        let mls = MlsTransform::new(controls, 2.0).unwrap();
        let near_a = mls.apply(Point2D::new(5.0, 5.0));
        assert!((near_a.x - 15.0).abs() < 0.5);
        let near_b = mls.apply(Point2D::new(105.0, 105.0));
        assert!((near_b.x - 95.0).abs() < 0.5);
    }

    #[test]
    fn test_empty_controls_are_rejected() {
        let err = MlsTransform::new(Vec::new(), 2.0).unwrap_err();
        assert!(matches!(err, Error::NotEnoughPoints { .. }));
    }
}
