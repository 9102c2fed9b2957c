//! CoreXY kinematics.
//!
//! Two motors jointly drive the carriage through a crossed belt: equal
//! steps on both motors move one axis, opposite steps move the other.
//! The exact sign of each contribution depends on how the belts were
//! routed during assembly, so all four signs come from calibration (the
//! kinematics wizard observes which diagonal the carriage takes when each
//! motor is stepped in isolation).

use serde::{Deserialize, Serialize};

use crate::cabinet::CellCoord;

/// Belt-routing sign map, `±1` per motor/axis pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionSigns {
    pub x_plus_dir_a: i8,
    pub x_plus_dir_b: i8,
    pub y_plus_dir_a: i8,
    pub y_plus_dir_b: i8,
}

impl Default for DirectionSigns {
    fn default() -> Self {
        Self {
            x_plus_dir_a: 1,
            x_plus_dir_b: -1,
            y_plus_dir_a: 1,
            y_plus_dir_b: 1,
        }
    }
}

impl DirectionSigns {
    /// Checks each sign is `±1` and the two motor vectors are not
    /// parallel (a parallel map cannot address the plane).
    pub fn validate(&self) -> Result<(), KinematicsError> {
        for (name, value) in [
            ("x_plus_dir_a", self.x_plus_dir_a),
            ("x_plus_dir_b", self.x_plus_dir_b),
            ("y_plus_dir_a", self.y_plus_dir_a),
            ("y_plus_dir_b", self.y_plus_dir_b),
        ] {
            if value != 1 && value != -1 {
                return Err(KinematicsError::BadSign { name, value });
            }
        }
        if self.determinant() == 0 {
            return Err(KinematicsError::DegenerateSigns);
        }
        Ok(())
    }

    fn determinant(&self) -> i32 {
        i32::from(self.x_plus_dir_a) * i32::from(self.y_plus_dir_b)
            - i32::from(self.y_plus_dir_a) * i32::from(self.x_plus_dir_b)
    }

    /// Maps a cartesian step delta to per-motor step counts `(a, b)`.
    #[must_use]
    pub fn ab_steps(&self, dx: i32, dy: i32) -> (i32, i32) {
        let a = dx * i32::from(self.x_plus_dir_a) + dy * i32::from(self.y_plus_dir_a);
        let b = dx * i32::from(self.x_plus_dir_b) + dy * i32::from(self.y_plus_dir_b);
        (a, b)
    }

    /// Recovers the cartesian delta from per-motor counts.
    ///
    /// Returns `None` when `(a, b)` is not reachable by integer cartesian
    /// steps under this sign map (mismatched parity).
    #[must_use]
    pub fn inverse(&self, a: i32, b: i32) -> Option<(i32, i32)> {
        let det = self.determinant();
        debug_assert!(det != 0, "validated sign maps are invertible");
        let dx_num = a * i32::from(self.y_plus_dir_b) - b * i32::from(self.y_plus_dir_a);
        let dy_num = b * i32::from(self.x_plus_dir_a) - a * i32::from(self.x_plus_dir_b);
        if dx_num % det != 0 || dy_num % det != 0 {
            return None;
        }
        Some((dx_num / det, dy_num / det))
    }
}

/// Kinematics-layer errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum KinematicsError {
    /// A direction sign outside `{-1, 1}`.
    #[error("direction sign {name} must be 1 or -1, got {value}")]
    BadSign { name: &'static str, value: i8 },

    /// The two motor vectors are parallel.
    #[error("direction signs describe parallel motor vectors")]
    DegenerateSigns,
}

/// Cell-to-step mapping over the calibrated position tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTable {
    pub x: [i32; 3],
    pub y: [i32; 21],
}

impl StepTable {
    /// Absolute step target for a cell. Both rows share the same plane;
    /// the row only selects which latch engages.
    #[must_use]
    pub fn cell_to_steps(&self, cell: CellCoord) -> (i32, i32) {
        (self.x[cell.x as usize], self.y[cell.y as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cabinet::Row;
    use proptest::prelude::*;

    #[test]
    fn test_default_signs_match_reference_mapping() {
        let signs = DirectionSigns::default();
        // dx=10, dy=4 under the factory belt routing.
        assert_eq!(signs.ab_steps(10, 4), (14, -6));
        assert_eq!(signs.inverse(14, -6), Some((10, 4)));
    }

    #[test]
    fn test_inverse_rejects_parity_mismatch() {
        let signs = DirectionSigns::default();
        // a+b odd cannot come from integer (dx, dy).
        assert_eq!(signs.inverse(3, 0), None);
    }

    #[test]
    fn test_validate_rejects_zero_sign() {
        let signs = DirectionSigns {
            x_plus_dir_a: 0,
            ..DirectionSigns::default()
        };
        assert_eq!(
            signs.validate(),
            Err(KinematicsError::BadSign {
                name: "x_plus_dir_a",
                value: 0
            })
        );
    }

    #[test]
    fn test_validate_rejects_parallel_vectors() {
        let signs = DirectionSigns {
            x_plus_dir_a: 1,
            x_plus_dir_b: 1,
            y_plus_dir_a: 1,
            y_plus_dir_b: 1,
        };
        assert_eq!(signs.validate(), Err(KinematicsError::DegenerateSigns));
    }

    #[test]
    fn test_cell_to_steps_uses_position_tables() {
        let table = StepTable {
            x: [0, 4500, 9000],
            y: std::array::from_fn(|i| i as i32 * 450),
        };
        let cell = CellCoord {
            row: Row::Back,
            x: 2,
            y: 10,
        };
        assert_eq!(table.cell_to_steps(cell), (9000, 4500));
    }

    #[test]
    fn test_every_storage_cell_maps_through_the_tables() {
        let table = StepTable {
            x: [0, 4500, 9000],
            y: std::array::from_fn(|i| i as i32 * 450),
        };
        for cell in crate::cabinet::all_cells().filter(|c| !c.is_blocked()) {
            assert_eq!(
                table.cell_to_steps(cell),
                (table.x[cell.x as usize], table.y[cell.y as usize]),
            );
        }
    }

    fn sign() -> impl Strategy<Value = i8> {
        prop_oneof![Just(1i8), Just(-1i8)]
    }

    fn valid_signs() -> impl Strategy<Value = DirectionSigns> {
        (sign(), sign(), sign(), sign())
            .prop_map(|(ax, bx, ay, by)| DirectionSigns {
                x_plus_dir_a: ax,
                x_plus_dir_b: bx,
                y_plus_dir_a: ay,
                y_plus_dir_b: by,
            })
            .prop_filter("non-degenerate", |s| s.validate().is_ok())
    }

    proptest! {
        /// Round trip: every cartesian delta survives the motor mapping.
        #[test]
        fn prop_ab_round_trip(
            signs in valid_signs(),
            dx in -15_000i32..15_000,
            dy in -15_000i32..15_000,
        ) {
            let (a, b) = signs.ab_steps(dx, dy);
            prop_assert_eq!(signs.inverse(a, b), Some((dx, dy)));
        }

        /// The reference inverse formula holds under the default map
        /// whenever sum and difference have matching parity.
        #[test]
        fn prop_reference_inverse_formula(a in -30_000i32..30_000, b in -30_000i32..30_000) {
            let signs = DirectionSigns::default();
            match signs.inverse(a, b) {
                Some((dx, dy)) => {
                    prop_assert_eq!(dx, (a - b) / 2);
                    prop_assert_eq!(dy, (a + b) / 2);
                }
                None => prop_assert_ne!((a - b).rem_euclid(2), 0),
            }
        }
    }
}
