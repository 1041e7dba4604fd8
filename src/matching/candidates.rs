//! Descriptor-space candidate generation.
//!
//! Candidates are produced by the nearest/next-nearest ratio test: a
//! descriptor pairing survives only when its best match in the partner
//! set is clearly better than the runner-up. Survivors are additionally
//! forced one-to-one, keeping the closest pairing when several features
//! claim the same partner.

use crate::core::{Point, PointMatch};
use crate::features::Feature;

/// Ratio-test candidate matches from `a` into `b`.
///
/// `rod` is the ratio-of-distances threshold in (0, 1]; smaller values
/// are stricter. Either set being empty yields an empty candidate list.
pub fn match_candidates(a: &[Feature], b: &[Feature], rod: f32) -> Vec<PointMatch> {
    if a.is_empty() || b.len() < 2 {
        return Vec::new();
    }

    // (index into a, index into b, descriptor distance)
    let mut tentative: Vec<(usize, usize, f32)> = Vec::new();
    for (ia, fa) in a.iter().enumerate() {
        let mut best = f32::INFINITY;
        let mut second = f32::INFINITY;
        let mut best_idx = usize::MAX;
        for (ib, fb) in b.iter().enumerate() {
            let d = fa.descriptor_distance_sq(fb);
            if d < best {
                second = best;
                best = d;
                best_idx = ib;
            } else if d < second {
                second = d;
            }
        }
        // Squared distances, so the ratio threshold is squared too.
        if best_idx != usize::MAX && best < rod * rod * second {
            tentative.push((ia, best_idx, best));
        }
    }

    // Enforce one-to-one: on collision keep the closest claim.
    tentative.sort_by(|x, y| x.2.partial_cmp(&y.2).unwrap_or(std::cmp::Ordering::Equal));
    let mut taken = vec![false; b.len()];
    let mut matches = Vec::with_capacity(tentative.len());
    for (ia, ib, _) in tentative {
        if taken[ib] {
            continue;
        }
        taken[ib] = true;
        matches.push(PointMatch::new(
            Point::new(a[ia].location),
            Point::new(b[ib].location),
        ));
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Point2D;

    fn feature(x: f32, y: f32, descriptor: Vec<f32>) -> Feature {
        Feature {
            location: Point2D::new(x, y),
            scale: 1.6,
            orientation: 0.0,
            descriptor,
        }
    }

    #[test]
    fn test_distinct_descriptors_pair_up() {
        let a = vec![
            feature(0.0, 0.0, vec![1.0, 0.0, 0.0, 0.0]),
            feature(10.0, 0.0, vec![0.0, 1.0, 0.0, 0.0]),
            feature(0.0, 10.0, vec![0.0, 0.0, 1.0, 0.0]),
        ];
        let b = vec![
            feature(5.0, 0.0, vec![1.0, 0.05, 0.0, 0.0]),
            feature(15.0, 0.0, vec![0.0, 1.0, 0.05, 0.0]),
            feature(5.0, 10.0, vec![0.05, 0.0, 1.0, 0.0]),
        ];
        let matches = match_candidates(&a, &b, 0.92);
        assert_eq!(matches.len(), 3);
        for m in &matches {
            assert!((m.p2.local.x - m.p1.local.x - 5.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ambiguous_descriptor_is_dropped() {
        let a = vec![feature(0.0, 0.0, vec![1.0, 0.0])];
        // Two equidistant partners: the ratio test cannot decide.
        let b = vec![
            feature(1.0, 0.0, vec![1.0, 0.01]),
            feature(2.0, 0.0, vec![1.0, -0.01]),
        ];
        assert!(match_candidates(&a, &b, 0.92).is_empty());
    }

    #[test]
    fn test_collision_keeps_closest() {
        let a = vec![
            feature(0.0, 0.0, vec![1.0, 0.0, 0.0]),
            feature(1.0, 0.0, vec![0.9, 0.1, 0.0]),
        ];
        let b = vec![
            feature(0.5, 0.0, vec![1.0, 0.0, 0.0]),
            feature(9.0, 9.0, vec![0.0, 0.0, 1.0]),
        ];
        let matches = match_candidates(&a, &b, 0.92);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].p1.local, Point2D::new(0.0, 0.0));
    }

    #[test]
    fn test_empty_inputs() {
        let f = vec![feature(0.0, 0.0, vec![1.0])];
        assert!(match_candidates(&[], &f, 0.9).is_empty());
        assert!(match_candidates(&f, &[], 0.9).is_empty());
    }
}
