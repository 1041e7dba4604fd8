//! Parametric 2D transform models and their weighted least-squares fits.
//!
//! The original system expressed these as a subclass hierarchy; here the
//! categories are a tagged variant with a shared capability set (apply,
//! fit, residual, minimal sample size), selected by configuration. A
//! regularized model is the convex interpolation of two models with a
//! blend weight lambda.
//!
//! Fits map each correspondence's `p1.local` onto `p2.world` and weight
//! every accumulation by the match weight. Accumulation happens in f64
//! (see [`crate::core::math`]).

use serde::{Deserialize, Serialize};

use super::math::solve_symmetric;
use super::point::{Point2D, PointMatch};
use crate::error::{Error, Result};

/// Model category selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Pure translation (1 correspondence minimum).
    Translation,
    /// Rotation + translation (2 minimum).
    Rigid,
    /// Uniform scale + rotation + translation (2 minimum).
    Similarity,
    /// Full 2x3 affine (3 minimum).
    Affine,
    /// Projective 3x3 (4 minimum).
    Homography,
}

impl ModelKind {
    /// Minimal number of correspondences needed to fit this category.
    #[inline]
    pub fn min_num_matches(&self) -> usize {
        match self {
            ModelKind::Translation => 1,
            ModelKind::Rigid => 2,
            ModelKind::Similarity => 2,
            ModelKind::Affine => 3,
            ModelKind::Homography => 4,
        }
    }

    /// Category from its historical numeric index (0..=4).
    pub fn from_index(index: usize) -> Option<ModelKind> {
        match index {
            0 => Some(ModelKind::Translation),
            1 => Some(ModelKind::Rigid),
            2 => Some(ModelKind::Similarity),
            3 => Some(ModelKind::Affine),
            4 => Some(ModelKind::Homography),
            _ => None,
        }
    }

    /// Historical numeric index of this category.
    #[inline]
    pub fn to_index(&self) -> usize {
        match self {
            ModelKind::Translation => 0,
            ModelKind::Rigid => 1,
            ModelKind::Similarity => 2,
            ModelKind::Affine => 3,
            ModelKind::Homography => 4,
        }
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelKind::Translation => "translation",
            ModelKind::Rigid => "rigid",
            ModelKind::Similarity => "similarity",
            ModelKind::Affine => "affine",
            ModelKind::Homography => "homography",
        };
        write!(f, "{}", name)
    }
}

/// A parametric 2D transform.
#[derive(Clone, Debug, PartialEq)]
pub enum Model {
    /// `p + (dx, dy)`
    Translation { dx: f32, dy: f32 },
    /// `R(theta) p + (dx, dy)`
    Rigid { theta: f32, dx: f32, dy: f32 },
    /// `s R(theta) p + (dx, dy)`
    Similarity {
        scale: f32,
        theta: f32,
        dx: f32,
        dy: f32,
    },
    /// Row-major 2x3: `x' = m0 x + m1 y + m2, y' = m3 x + m4 y + m5`
    Affine { m: [f32; 6] },
    /// Row-major 3x3, normalized so `m8 == 1` after fitting.
    Homography { m: [f32; 9] },
    /// Convex interpolation of two models with blend weight
    /// `lambda in [0, 1]` (0 = pure `a`). Both operands must have an
    /// affine form, so homographies are excluded.
    Interpolated {
        a: Box<Model>,
        b: Box<Model>,
        lambda: f32,
    },
}

impl Model {
    /// Identity transform of the given category.
    pub fn identity(kind: ModelKind) -> Model {
        match kind {
            ModelKind::Translation => Model::Translation { dx: 0.0, dy: 0.0 },
            ModelKind::Rigid => Model::Rigid {
                theta: 0.0,
                dx: 0.0,
                dy: 0.0,
            },
            ModelKind::Similarity => Model::Similarity {
                scale: 1.0,
                theta: 0.0,
                dx: 0.0,
                dy: 0.0,
            },
            ModelKind::Affine => Model::Affine {
                m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            },
            ModelKind::Homography => Model::Homography {
                m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            },
        }
    }

    /// Pure translation.
    #[inline]
    pub fn translation(dx: f32, dy: f32) -> Model {
        Model::Translation { dx, dy }
    }

    /// Rotation + translation.
    #[inline]
    pub fn rigid(theta: f32, dx: f32, dy: f32) -> Model {
        Model::Rigid { theta, dx, dy }
    }

    /// Regularized model: `(1 - lambda) * a + lambda * b`.
    ///
    /// Both operands need an affine form; a homography operand is an
    /// invalid configuration.
    pub fn interpolated(a: Model, b: Model, lambda: f32) -> Result<Model> {
        if a.to_affine().is_none() || b.to_affine().is_none() {
            return Err(Error::InvalidConfiguration(
                "regularization requires affine-representable models".into(),
            ));
        }
        if !(0.0..=1.0).contains(&lambda) {
            return Err(Error::InvalidConfiguration(format!(
                "regularizer lambda {} outside [0, 1]",
                lambda
            )));
        }
        Ok(Model::Interpolated {
            a: Box::new(a),
            b: Box::new(b),
            lambda,
        })
    }

    /// The model's category. For interpolated models this is the primary
    /// (desired) operand's category.
    pub fn kind(&self) -> ModelKind {
        match self {
            Model::Translation { .. } => ModelKind::Translation,
            Model::Rigid { .. } => ModelKind::Rigid,
            Model::Similarity { .. } => ModelKind::Similarity,
            Model::Affine { .. } => ModelKind::Affine,
            Model::Homography { .. } => ModelKind::Homography,
            Model::Interpolated { a, .. } => a.kind(),
        }
    }

    /// Minimal number of correspondences needed to fit this model.
    pub fn min_num_matches(&self) -> usize {
        match self {
            Model::Interpolated { a, b, .. } => a.min_num_matches().max(b.min_num_matches()),
            _ => self.kind().min_num_matches(),
        }
    }

    /// Apply the transform to a point.
    pub fn apply(&self, p: Point2D) -> Point2D {
        match self {
            Model::Translation { dx, dy } => Point2D::new(p.x + dx, p.y + dy),
            Model::Rigid { theta, dx, dy } => {
                let r = p.rotate(*theta);
                Point2D::new(r.x + dx, r.y + dy)
            }
            Model::Similarity {
                scale,
                theta,
                dx,
                dy,
            } => {
                let r = (p * *scale).rotate(*theta);
                Point2D::new(r.x + dx, r.y + dy)
            }
            Model::Affine { m } => Point2D::new(
                m[0] * p.x + m[1] * p.y + m[2],
                m[3] * p.x + m[4] * p.y + m[5],
            ),
            Model::Homography { m } => {
                let d = m[6] * p.x + m[7] * p.y + m[8];
                if d.abs() < 1e-12 {
                    return Point2D::new(f32::INFINITY, f32::INFINITY);
                }
                Point2D::new(
                    (m[0] * p.x + m[1] * p.y + m[2]) / d,
                    (m[3] * p.x + m[4] * p.y + m[5]) / d,
                )
            }
            Model::Interpolated { a, b, lambda } => {
                let pa = a.apply(p);
                let pb = b.apply(p);
                pa * (1.0 - lambda) + pb * *lambda
            }
        }
    }

    /// The 2x3 affine form, when one exists (everything but homographies).
    pub fn to_affine(&self) -> Option<[f32; 6]> {
        match self {
            Model::Translation { dx, dy } => Some([1.0, 0.0, *dx, 0.0, 1.0, *dy]),
            Model::Rigid { theta, dx, dy } => {
                let (s, c) = theta.sin_cos();
                Some([c, -s, *dx, s, c, *dy])
            }
            Model::Similarity {
                scale,
                theta,
                dx,
                dy,
            } => {
                let (s, c) = theta.sin_cos();
                Some([scale * c, -scale * s, *dx, scale * s, scale * c, *dy])
            }
            Model::Affine { m } => Some(*m),
            Model::Homography { .. } => None,
            Model::Interpolated { a, b, lambda } => {
                let ma = a.to_affine()?;
                let mb = b.to_affine()?;
                let mut out = [0.0f32; 6];
                for i in 0..6 {
                    out[i] = ma[i] * (1.0 - lambda) + mb[i] * lambda;
                }
                Some(out)
            }
        }
    }

    /// Homogeneous 3x3 form (row-major, f64).
    pub fn to_matrix3(&self) -> [f64; 9] {
        match self {
            Model::Homography { m } => {
                let mut out = [0.0f64; 9];
                for i in 0..9 {
                    out[i] = f64::from(m[i]);
                }
                out
            }
            _ => {
                // Non-homography models always have an affine form.
                let a = self.to_affine().unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
                [
                    f64::from(a[0]),
                    f64::from(a[1]),
                    f64::from(a[2]),
                    f64::from(a[3]),
                    f64::from(a[4]),
                    f64::from(a[5]),
                    0.0,
                    0.0,
                    1.0,
                ]
            }
        }
    }

    /// Composition `outer(inner(p))`.
    ///
    /// The result is affine when the projective row stays trivial,
    /// otherwise a homography. Fails when the composition is degenerate.
    pub fn composed(outer: &Model, inner: &Model) -> Result<Model> {
        let a = outer.to_matrix3();
        let b = inner.to_matrix3();
        let mut c = [0.0f64; 9];
        for i in 0..3 {
            for j in 0..3 {
                let mut sum = 0.0;
                for k in 0..3 {
                    sum += a[i * 3 + k] * b[k * 3 + j];
                }
                c[i * 3 + j] = sum;
            }
        }
        if c[8].abs() < 1e-12 {
            return Err(Error::IllConditioned("degenerate composition"));
        }
        let w = c[8];
        for v in c.iter_mut() {
            *v /= w;
        }
        let projective = c[6].abs() > 1e-9 || c[7].abs() > 1e-9;
        if projective {
            let mut m = [0.0f32; 9];
            for i in 0..9 {
                m[i] = c[i] as f32;
            }
            Ok(Model::Homography { m })
        } else {
            Ok(Model::Affine {
                m: [
                    c[0] as f32,
                    c[1] as f32,
                    c[2] as f32,
                    c[3] as f32,
                    c[4] as f32,
                    c[5] as f32,
                ],
            })
        }
    }

    /// Inverse transform. Interpolated models invert through their
    /// affine form, so the result is an affine.
    pub fn invert(&self) -> Result<Model> {
        match self {
            Model::Translation { dx, dy } => Ok(Model::Translation { dx: -dx, dy: -dy }),
            Model::Rigid { theta, dx, dy } => {
                let t = Point2D::new(-dx, -dy).rotate(-theta);
                Ok(Model::Rigid {
                    theta: -theta,
                    dx: t.x,
                    dy: t.y,
                })
            }
            Model::Similarity {
                scale,
                theta,
                dx,
                dy,
            } => {
                if *scale == 0.0 {
                    return Err(Error::IllConditioned("zero-scale similarity"));
                }
                let t = (Point2D::new(-dx, -dy) * (1.0 / scale)).rotate(-theta);
                Ok(Model::Similarity {
                    scale: 1.0 / scale,
                    theta: -theta,
                    dx: t.x,
                    dy: t.y,
                })
            }
            Model::Affine { m } => {
                let det = f64::from(m[0]) * f64::from(m[4]) - f64::from(m[1]) * f64::from(m[3]);
                if det.abs() < 1e-12 {
                    return Err(Error::IllConditioned("singular affine"));
                }
                let a = f64::from(m[4]) / det;
                let b = -f64::from(m[1]) / det;
                let c = -f64::from(m[3]) / det;
                let d = f64::from(m[0]) / det;
                Ok(Model::Affine {
                    m: [
                        a as f32,
                        b as f32,
                        (-(a * f64::from(m[2]) + b * f64::from(m[5]))) as f32,
                        c as f32,
                        d as f32,
                        (-(c * f64::from(m[2]) + d * f64::from(m[5]))) as f32,
                    ],
                })
            }
            Model::Homography { .. } => {
                let m = self.to_matrix3();
                let inv = mat3_invert(&m).ok_or(Error::IllConditioned("singular homography"))?;
                let mut out = [0.0f32; 9];
                for i in 0..9 {
                    out[i] = inv[i] as f32;
                }
                Ok(Model::Homography { m: out })
            }
            Model::Interpolated { .. } => {
                let a = self
                    .to_affine()
                    .ok_or(Error::IllConditioned("no affine form"))?;
                Model::Affine { m: a }.invert()
            }
        }
    }

    /// Approximate this model with another category, via its affine form
    /// (a homography contributes its affine part).
    pub fn recast(&self, kind: ModelKind) -> Model {
        let a = match self {
            Model::Homography { m } => {
                // Affine part only; the projective row is dropped.
                [m[0], m[1], m[2], m[3], m[4], m[5]]
            }
            _ => self.to_affine().unwrap_or([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
        };
        match kind {
            ModelKind::Translation => Model::Translation { dx: a[2], dy: a[5] },
            ModelKind::Rigid => {
                let theta = (a[3] - a[1]).atan2(a[0] + a[4]);
                Model::Rigid {
                    theta,
                    dx: a[2],
                    dy: a[5],
                }
            }
            ModelKind::Similarity => {
                let u = (a[0] + a[4]) * 0.5;
                let v = (a[3] - a[1]) * 0.5;
                Model::Similarity {
                    scale: (u * u + v * v).sqrt(),
                    theta: v.atan2(u),
                    dx: a[2],
                    dy: a[5],
                }
            }
            ModelKind::Affine => Model::Affine { m: a },
            ModelKind::Homography => Model::Homography {
                m: [a[0], a[1], a[2], a[3], a[4], a[5], 0.0, 0.0, 1.0],
            },
        }
    }

    /// Fit this model to the correspondences (`p1.local -> p2.world`),
    /// weighted by each match's weight.
    pub fn fit(&mut self, matches: &[PointMatch]) -> Result<()> {
        let required = self.min_num_matches();
        if matches.len() < required {
            return Err(Error::NotEnoughPoints {
                required,
                found: matches.len(),
            });
        }
        match self {
            Model::Translation { dx, dy } => {
                let (ndx, ndy) = fit_translation(matches)?;
                *dx = ndx;
                *dy = ndy;
            }
            Model::Rigid { theta, dx, dy } => {
                let (nt, ndx, ndy) = fit_rigid(matches)?;
                *theta = nt;
                *dx = ndx;
                *dy = ndy;
            }
            Model::Similarity {
                scale,
                theta,
                dx,
                dy,
            } => {
                let (ns, nt, ndx, ndy) = fit_similarity(matches)?;
                *scale = ns;
                *theta = nt;
                *dx = ndx;
                *dy = ndy;
            }
            Model::Affine { m } => *m = fit_affine(matches)?,
            Model::Homography { m } => *m = fit_homography(matches)?,
            Model::Interpolated { a, b, .. } => {
                a.fit(matches)?;
                b.fit(matches)?;
            }
        }
        Ok(())
    }

    /// Residual of one correspondence under this model.
    #[inline]
    pub fn residual(&self, m: &PointMatch) -> f32 {
        self.apply(m.p1.local).distance(&m.p2.world)
    }

    /// Weighted mean residual over a correspondence list (0.0 if empty).
    pub fn mean_residual(&self, matches: &[PointMatch]) -> f32 {
        let mut sum = 0.0f64;
        let mut weight = 0.0f64;
        for m in matches {
            sum += f64::from(self.residual(m)) * f64::from(m.weight);
            weight += f64::from(m.weight);
        }
        if weight > 0.0 {
            (sum / weight) as f32
        } else {
            0.0
        }
    }

    /// True when the transform moves none of the given source points by
    /// more than `tolerance` pixels. Vacuously true for an empty list.
    pub fn is_identity_within(&self, matches: &[PointMatch], tolerance: f32) -> bool {
        matches.iter().all(|m| {
            let p = m.p1.local;
            self.apply(p).distance(&p) <= tolerance
        })
    }
}

fn fit_translation(matches: &[PointMatch]) -> Result<(f32, f32)> {
    let mut sx = 0.0f64;
    let mut sy = 0.0f64;
    let mut sw = 0.0f64;
    for m in matches {
        let w = f64::from(m.weight);
        sx += w * f64::from(m.p2.world.x - m.p1.local.x);
        sy += w * f64::from(m.p2.world.y - m.p1.local.y);
        sw += w;
    }
    if sw <= 0.0 {
        return Err(Error::IllConditioned("zero total weight"));
    }
    Ok(((sx / sw) as f32, (sy / sw) as f32))
}

struct Centroids {
    pcx: f64,
    pcy: f64,
    qcx: f64,
    qcy: f64,
    sw: f64,
}

fn centroids(matches: &[PointMatch]) -> Result<Centroids> {
    let mut pcx = 0.0f64;
    let mut pcy = 0.0f64;
    let mut qcx = 0.0f64;
    let mut qcy = 0.0f64;
    let mut sw = 0.0f64;
    for m in matches {
        let w = f64::from(m.weight);
        pcx += w * f64::from(m.p1.local.x);
        pcy += w * f64::from(m.p1.local.y);
        qcx += w * f64::from(m.p2.world.x);
        qcy += w * f64::from(m.p2.world.y);
        sw += w;
    }
    if sw <= 0.0 {
        return Err(Error::IllConditioned("zero total weight"));
    }
    Ok(Centroids {
        pcx: pcx / sw,
        pcy: pcy / sw,
        qcx: qcx / sw,
        qcy: qcy / sw,
        sw,
    })
}

fn fit_rigid(matches: &[PointMatch]) -> Result<(f32, f32, f32)> {
    let c = centroids(matches)?;
    let mut dot = 0.0f64;
    let mut cross = 0.0f64;
    for m in matches {
        let w = f64::from(m.weight);
        let px = f64::from(m.p1.local.x) - c.pcx;
        let py = f64::from(m.p1.local.y) - c.pcy;
        let qx = f64::from(m.p2.world.x) - c.qcx;
        let qy = f64::from(m.p2.world.y) - c.qcy;
        dot += w * (px * qx + py * qy);
        cross += w * (px * qy - py * qx);
    }
    if dot == 0.0 && cross == 0.0 {
        return Err(Error::IllConditioned("coincident points"));
    }
    let theta = cross.atan2(dot);
    let (sin, cos) = theta.sin_cos();
    let dx = c.qcx - (cos * c.pcx - sin * c.pcy);
    let dy = c.qcy - (sin * c.pcx + cos * c.pcy);
    Ok((theta as f32, dx as f32, dy as f32))
}

fn fit_similarity(matches: &[PointMatch]) -> Result<(f32, f32, f32, f32)> {
    let c = centroids(matches)?;
    let mut dot = 0.0f64;
    let mut cross = 0.0f64;
    let mut norm = 0.0f64;
    for m in matches {
        let w = f64::from(m.weight);
        let px = f64::from(m.p1.local.x) - c.pcx;
        let py = f64::from(m.p1.local.y) - c.pcy;
        let qx = f64::from(m.p2.world.x) - c.qcx;
        let qy = f64::from(m.p2.world.y) - c.qcy;
        dot += w * (px * qx + py * qy);
        cross += w * (px * qy - py * qx);
        norm += w * (px * px + py * py);
    }
    if norm <= 1e-12 * c.sw {
        return Err(Error::IllConditioned("coincident points"));
    }
    let a = dot / norm;
    let b = cross / norm;
    let scale = (a * a + b * b).sqrt();
    let theta = b.atan2(a);
    let (sin, cos) = theta.sin_cos();
    let dx = c.qcx - scale * (cos * c.pcx - sin * c.pcy);
    let dy = c.qcy - scale * (sin * c.pcx + cos * c.pcy);
    Ok((scale as f32, theta as f32, dx as f32, dy as f32))
}

fn fit_affine(matches: &[PointMatch]) -> Result<[f32; 6]> {
    // Two 3-unknown systems sharing one Gram matrix:
    // [xx xy x; xy yy y; x y 1] * [mi] = rhs.
    let mut g = vec![vec![0.0f64; 3]; 3];
    let mut rx = [0.0f64; 3];
    let mut ry = [0.0f64; 3];
    for m in matches {
        let w = f64::from(m.weight);
        let x = f64::from(m.p1.local.x);
        let y = f64::from(m.p1.local.y);
        let u = f64::from(m.p2.world.x);
        let v = f64::from(m.p2.world.y);
        g[0][0] += w * x * x;
        g[0][1] += w * x * y;
        g[0][2] += w * x;
        g[1][1] += w * y * y;
        g[1][2] += w * y;
        g[2][2] += w;
        rx[0] += w * x * u;
        rx[1] += w * y * u;
        rx[2] += w * u;
        ry[0] += w * x * v;
        ry[1] += w * y * v;
        ry[2] += w * v;
    }
    g[1][0] = g[0][1];
    g[2][0] = g[0][2];
    g[2][1] = g[1][2];

    let row_x =
        solve_symmetric(&g, &rx).ok_or(Error::IllConditioned("collinear points in affine fit"))?;
    let row_y =
        solve_symmetric(&g, &ry).ok_or(Error::IllConditioned("collinear points in affine fit"))?;
    Ok([
        row_x[0] as f32,
        row_x[1] as f32,
        row_x[2] as f32,
        row_y[0] as f32,
        row_y[1] as f32,
        row_y[2] as f32,
    ])
}

/// Hartley-normalized DLT with weighted 8x8 normal equations.
fn fit_homography(matches: &[PointMatch]) -> Result<[f32; 9]> {
    let c = centroids(matches)?;

    // Isotropic scaling so the mean distance from the centroid is sqrt(2).
    let mut pd = 0.0f64;
    let mut qd = 0.0f64;
    for m in matches {
        let w = f64::from(m.weight);
        pd += w * ((f64::from(m.p1.local.x) - c.pcx).hypot(f64::from(m.p1.local.y) - c.pcy));
        qd += w * ((f64::from(m.p2.world.x) - c.qcx).hypot(f64::from(m.p2.world.y) - c.qcy));
    }
    if pd <= 1e-12 || qd <= 1e-12 {
        return Err(Error::IllConditioned("coincident points"));
    }
    let sp = std::f64::consts::SQRT_2 * c.sw / pd;
    let sq = std::f64::consts::SQRT_2 * c.sw / qd;

    let mut a = vec![vec![0.0f64; 8]; 8];
    let mut b = [0.0f64; 8];
    let mut accumulate = |row: [f64; 8], target: f64, w: f64| {
        for i in 0..8 {
            for j in 0..8 {
                a[i][j] += w * row[i] * row[j];
            }
            b[i] += w * row[i] * target;
        }
    };
    for m in matches {
        let w = f64::from(m.weight);
        let x = (f64::from(m.p1.local.x) - c.pcx) * sp;
        let y = (f64::from(m.p1.local.y) - c.pcy) * sp;
        let u = (f64::from(m.p2.world.x) - c.qcx) * sq;
        let v = (f64::from(m.p2.world.y) - c.qcy) * sq;
        accumulate([x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y], u, w);
        accumulate([0.0, 0.0, 0.0, x, y, 1.0, -v * x, -v * y], v, w);
    }

    let h = solve_symmetric(&a, &b).ok_or(Error::IllConditioned("degenerate homography fit"))?;
    let hn = [h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0];

    // Denormalize: H = T_dst^-1 * Hn * T_src.
    let t_src = [sp, 0.0, -sp * c.pcx, 0.0, sp, -sp * c.pcy, 0.0, 0.0, 1.0];
    let t_dst_inv = [
        1.0 / sq,
        0.0,
        c.qcx,
        0.0,
        1.0 / sq,
        c.qcy,
        0.0,
        0.0,
        1.0,
    ];
    let tmp = mat3_mul(&hn, &t_src);
    let mut full = mat3_mul(&t_dst_inv, &tmp);
    if full[8].abs() < 1e-12 {
        return Err(Error::IllConditioned("degenerate homography fit"));
    }
    let w = full[8];
    for v in full.iter_mut() {
        *v /= w;
    }
    let mut out = [0.0f32; 9];
    for i in 0..9 {
        out[i] = full[i] as f32;
    }
    Ok(out)
}

fn mat3_mul(a: &[f64; 9], b: &[f64; 9]) -> [f64; 9] {
    let mut c = [0.0f64; 9];
    for i in 0..3 {
        for j in 0..3 {
            let mut sum = 0.0;
            for k in 0..3 {
                sum += a[i * 3 + k] * b[k * 3 + j];
            }
            c[i * 3 + j] = sum;
        }
    }
    c
}

fn mat3_invert(m: &[f64; 9]) -> Option<[f64; 9]> {
    let det = m[0] * (m[4] * m[8] - m[5] * m[7]) - m[1] * (m[3] * m[8] - m[5] * m[6])
        + m[2] * (m[3] * m[7] - m[4] * m[6]);
    if det.abs() < 1e-12 {
        return None;
    }
    let inv = [
        (m[4] * m[8] - m[5] * m[7]) / det,
        (m[2] * m[7] - m[1] * m[8]) / det,
        (m[1] * m[5] - m[2] * m[4]) / det,
        (m[5] * m[6] - m[3] * m[8]) / det,
        (m[0] * m[8] - m[2] * m[6]) / det,
        (m[2] * m[3] - m[0] * m[5]) / det,
        (m[3] * m[7] - m[4] * m[6]) / det,
        (m[1] * m[6] - m[0] * m[7]) / det,
        (m[0] * m[4] - m[1] * m[3]) / det,
    ];
    Some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::point::Point;
    use approx::assert_relative_eq;

    fn pm(lx: f32, ly: f32, wx: f32, wy: f32) -> PointMatch {
        PointMatch::new(
            Point::new(Point2D::new(lx, ly)),
            Point::new(Point2D::new(wx, wy)),
        )
    }

    fn square() -> Vec<Point2D> {
        vec![
            Point2D::new(0.0, 0.0),
            Point2D::new(10.0, 0.0),
            Point2D::new(10.0, 10.0),
            Point2D::new(0.0, 10.0),
            Point2D::new(5.0, 3.0),
        ]
    }

    fn matches_under(model: &Model) -> Vec<PointMatch> {
        square()
            .into_iter()
            .map(|p| {
                let q = model.apply(p);
                pm(p.x, p.y, q.x, q.y)
            })
            .collect()
    }

    #[test]
    fn test_identity_applies_nothing() {
        let p = Point2D::new(3.5, -2.0);
        for kind in [
            ModelKind::Translation,
            ModelKind::Rigid,
            ModelKind::Similarity,
            ModelKind::Affine,
            ModelKind::Homography,
        ] {
            let m = Model::identity(kind);
            let q = m.apply(p);
            assert_relative_eq!(q.x, p.x, epsilon = 1e-6);
            assert_relative_eq!(q.y, p.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_kind_index_round_trip() {
        for i in 0..5 {
            let kind = ModelKind::from_index(i).unwrap();
            assert_eq!(kind.to_index(), i);
        }
        assert!(ModelKind::from_index(5).is_none());
    }

    #[test]
    fn test_fit_translation() {
        let truth = Model::translation(12.5, -4.0);
        let matches = matches_under(&truth);
        let mut model = Model::identity(ModelKind::Translation);
        model.fit(&matches).unwrap();
        assert_relative_eq!(model.mean_residual(&matches), 0.0, epsilon = 1e-4);
        match model {
            Model::Translation { dx, dy } => {
                assert_relative_eq!(dx, 12.5, epsilon = 1e-4);
                assert_relative_eq!(dy, -4.0, epsilon = 1e-4);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_fit_rigid_recovers_rotation() {
        let truth = Model::rigid(0.3, 5.0, -2.0);
        let matches = matches_under(&truth);
        let mut model = Model::identity(ModelKind::Rigid);
        model.fit(&matches).unwrap();
        match model {
            Model::Rigid { theta, dx, dy } => {
                assert_relative_eq!(theta, 0.3, epsilon = 1e-4);
                assert_relative_eq!(dx, 5.0, epsilon = 1e-3);
                assert_relative_eq!(dy, -2.0, epsilon = 1e-3);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_fit_similarity_recovers_scale() {
        let truth = Model::Similarity {
            scale: 1.5,
            theta: -0.2,
            dx: 1.0,
            dy: 2.0,
        };
        let matches = matches_under(&truth);
        let mut model = Model::identity(ModelKind::Similarity);
        model.fit(&matches).unwrap();
        match model {
            Model::Similarity { scale, theta, .. } => {
                assert_relative_eq!(scale, 1.5, epsilon = 1e-4);
                assert_relative_eq!(theta, -0.2, epsilon = 1e-4);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_fit_affine_exact() {
        let truth = Model::Affine {
            m: [1.1, 0.1, 3.0, -0.2, 0.9, -1.0],
        };
        let matches = matches_under(&truth);
        let mut model = Model::identity(ModelKind::Affine);
        model.fit(&matches).unwrap();
        assert!(model.mean_residual(&matches) < 1e-3);
    }

    #[test]
    fn test_fit_homography_recovers_affine_mapping() {
        let truth = Model::Affine {
            m: [1.05, 0.02, 4.0, -0.03, 0.97, 2.0],
        };
        let matches = matches_under(&truth);
        let mut model = Model::identity(ModelKind::Homography);
        model.fit(&matches).unwrap();
        assert!(model.mean_residual(&matches) < 1e-2);
    }

    #[test]
    fn test_fit_affine_collinear_is_ill_conditioned() {
        let matches: Vec<PointMatch> = (0..5)
            .map(|i| pm(i as f32, 2.0 * i as f32, i as f32 + 1.0, 2.0 * i as f32))
            .collect();
        let mut model = Model::identity(ModelKind::Affine);
        assert!(matches!(
            model.fit(&matches),
            Err(Error::IllConditioned(_))
        ));
    }

    #[test]
    fn test_fit_not_enough_points() {
        let matches = vec![pm(0.0, 0.0, 1.0, 1.0)];
        let mut model = Model::identity(ModelKind::Rigid);
        assert!(matches!(
            model.fit(&matches),
            Err(Error::NotEnoughPoints {
                required: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn test_interpolated_blend() {
        let a = Model::translation(10.0, 0.0);
        let b = Model::translation(0.0, 10.0);
        let half = Model::interpolated(a.clone(), b.clone(), 0.5).unwrap();
        let q = half.apply(Point2D::ZERO);
        assert_relative_eq!(q.x, 5.0, epsilon = 1e-6);
        assert_relative_eq!(q.y, 5.0, epsilon = 1e-6);

        let zero = Model::interpolated(a.clone(), b.clone(), 0.0).unwrap();
        assert_eq!(zero.apply(Point2D::ZERO), a.apply(Point2D::ZERO));

        assert!(Model::interpolated(a, Model::identity(ModelKind::Homography), 0.5).is_err());
    }

    #[test]
    fn test_recast_rotation_to_rigid() {
        let affine = Model::rigid(0.4, 2.0, 3.0).recast(ModelKind::Affine);
        let back = affine.recast(ModelKind::Rigid);
        match back {
            Model::Rigid { theta, dx, dy } => {
                assert_relative_eq!(theta, 0.4, epsilon = 1e-5);
                assert_relative_eq!(dx, 2.0, epsilon = 1e-5);
                assert_relative_eq!(dy, 3.0, epsilon = 1e-5);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_invert_round_trips() {
        let models = [
            Model::translation(3.0, -7.0),
            Model::rigid(0.5, 10.0, 2.0),
            Model::Similarity {
                scale: 1.4,
                theta: -0.3,
                dx: 5.0,
                dy: 1.0,
            },
            Model::Affine {
                m: [1.1, 0.2, 4.0, -0.1, 0.95, 2.0],
            },
            Model::Homography {
                m: [1.0, 0.05, 2.0, -0.02, 1.1, 1.0, 1e-4, -2e-4, 1.0],
            },
        ];
        let p = Point2D::new(17.0, -9.0);
        for model in &models {
            let inv = model.invert().unwrap();
            let back = inv.apply(model.apply(p));
            assert_relative_eq!(back.x, p.x, epsilon = 1e-3);
            assert_relative_eq!(back.y, p.y, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_composed_translations_add() {
        let a = Model::translation(1.0, 2.0);
        let b = Model::translation(3.0, 4.0);
        let c = Model::composed(&a, &b).unwrap();
        let q = c.apply(Point2D::ZERO);
        assert_relative_eq!(q.x, 4.0, epsilon = 1e-6);
        assert_relative_eq!(q.y, 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_is_identity_within() {
        let matches = matches_under(&Model::identity(ModelKind::Rigid));
        assert!(Model::identity(ModelKind::Rigid).is_identity_within(&matches, 0.5));
        assert!(!Model::translation(2.0, 0.0).is_identity_within(&matches, 0.5));
        // A sub-tolerance translation still counts as identity.
        assert!(Model::translation(0.3, 0.0).is_identity_within(&matches, 0.5));
    }
}
