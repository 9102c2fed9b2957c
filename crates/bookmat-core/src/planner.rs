//! Safe path planning.
//!
//! Long diagonal moves are forbidden: the carriage would sweep across the
//! mechanism band with both axes live and no chance to re-check the limit
//! switches. Short hops go direct; anything longer becomes an L-shaped
//! path, Y leg first, with intermediate waypoints so the safe-move
//! supervisor can re-poll the switches at sub-distances.

use serde::Serialize;

/// Largest move allowed as a single diagonal, in steps per axis.
pub const MAX_DIAGONAL_STEP: i32 = 500;
/// Maximum spacing between consecutive waypoints on a long leg.
pub const WAYPOINT_SPACING: i32 = 2000;

/// One absolute step target on the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Waypoint {
    pub x: i32,
    pub y: i32,
}

/// Plans the waypoint sequence from `start` to `end`.
///
/// The result always terminates at `end`; it is empty when the move is a
/// no-op. The Y-then-X leg order is fixed, not cost-based, so plans are
/// reproducible.
#[must_use]
pub fn plan_path(start: (i32, i32), end: (i32, i32)) -> Vec<Waypoint> {
    let (sx, sy) = start;
    let (ex, ey) = end;
    if (sx, sy) == (ex, ey) {
        return Vec::new();
    }

    let dx = (ex - sx).abs();
    let dy = (ey - sy).abs();
    if dx < MAX_DIAGONAL_STEP && dy < MAX_DIAGONAL_STEP {
        return vec![Waypoint { x: ex, y: ey }];
    }

    let mut path = Vec::new();
    subdivide_leg(&mut path, (sx, sy), (sx, ey));
    subdivide_leg(&mut path, (sx, ey), (ex, ey));
    path
}

/// Splits a single-axis leg into waypoints no more than
/// [`WAYPOINT_SPACING`] steps apart.
fn subdivide_leg(path: &mut Vec<Waypoint>, from: (i32, i32), to: (i32, i32)) {
    if from == to {
        return;
    }
    let span = (to.0 - from.0).abs().max((to.1 - from.1).abs());
    let segments = (span + WAYPOINT_SPACING - 1) / WAYPOINT_SPACING;
    for i in 1..=segments {
        let x = from.0 + (to.0 - from.0) * i / segments;
        let y = from.1 + (to.1 - from.1) * i / segments;
        path.push(Waypoint { x, y });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_short_move_is_single_waypoint() {
        let path = plan_path((100, 100), (400, 550));
        assert_eq!(path, vec![Waypoint { x: 400, y: 550 }]);
    }

    #[test]
    fn test_no_op_move_is_empty() {
        assert!(plan_path((10, 10), (10, 10)).is_empty());
    }

    #[test]
    fn test_long_move_goes_y_first() {
        let path = plan_path((0, 0), (4500, 900));
        // Y leg completes before X changes.
        let y_done = path.iter().position(|wp| wp.y == 900).unwrap();
        assert!(path[..=y_done].iter().all(|wp| wp.x == 0));
        assert_eq!(*path.last().unwrap(), Waypoint { x: 4500, y: 900 });
    }

    #[test]
    fn test_legs_subdivided_to_spacing() {
        let path = plan_path((0, 0), (9000, 0));
        assert!(path.len() >= 5);
        let mut prev = Waypoint { x: 0, y: 0 };
        for wp in &path {
            assert!((wp.x - prev.x).abs() <= WAYPOINT_SPACING);
            assert!((wp.y - prev.y).abs() <= WAYPOINT_SPACING);
            prev = *wp;
        }
    }

    #[test]
    fn test_exactly_at_diagonal_limit_takes_l_path() {
        // 500 is not "< 500": the L rule applies.
        let path = plan_path((0, 0), (500, 100));
        assert!(path.len() >= 2);
        assert_eq!(path[0], Waypoint { x: 0, y: 100 });
    }

    proptest! {
        /// The plan terminates at the target and never leaves the
        /// bounding box of start and end.
        #[test]
        fn prop_path_stays_in_bounding_box(
            sx in -15_000i32..15_000,
            sy in -15_000i32..15_000,
            ex in -15_000i32..15_000,
            ey in -15_000i32..15_000,
        ) {
            let path = plan_path((sx, sy), (ex, ey));
            if (sx, sy) == (ex, ey) {
                prop_assert!(path.is_empty());
            } else {
                let last = path.last().unwrap();
                prop_assert_eq!((last.x, last.y), (ex, ey));
                for wp in &path {
                    prop_assert!(wp.x >= sx.min(ex) && wp.x <= sx.max(ex));
                    prop_assert!(wp.y >= sy.min(ey) && wp.y <= sy.max(ey));
                }
            }
        }

        /// Consecutive waypoints are never farther apart than the
        /// supervisor's re-check distance.
        #[test]
        fn prop_waypoint_spacing_bounded(
            sx in -15_000i32..15_000,
            sy in -15_000i32..15_000,
            ex in -15_000i32..15_000,
            ey in -15_000i32..15_000,
        ) {
            let path = plan_path((sx, sy), (ex, ey));
            let mut prev = (sx, sy);
            for wp in &path {
                let span = (wp.x - prev.0).abs().max((wp.y - prev.1).abs());
                prop_assert!(span <= WAYPOINT_SPACING || path.len() == 1);
                prev = (wp.x, wp.y);
            }
        }
    }
}
