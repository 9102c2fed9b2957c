//! Physical cabinet layout.
//!
//! The cabinet is a 2×3×21 grid of shelf cells: two rows (front and back
//! of the gantry plane), three columns, twenty-one vertical positions.
//! A handful of cells are occupied by the mechanism itself and by the
//! delivery window; those are blocked and never store a shelf.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of columns per row.
pub const COLUMNS: u8 = 3;
/// Number of vertical positions per column.
pub const POSITIONS: u8 = 21;
/// Total cell count across both rows.
pub const TOTAL_CELLS: usize = 2 * COLUMNS as usize * POSITIONS as usize;

/// Which side of the gantry plane a cell sits on.
///
/// The row selects which latch engages the shelf: `lock1` for the front
/// row, `lock2` for the back row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Row {
    Front,
    Back,
}

impl Row {
    /// Canonical uppercase name used by the store and the layout tables.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Front => "FRONT",
            Self::Back => "BACK",
        }
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Row {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FRONT" | "front" => Ok(Self::Front),
            "BACK" | "back" => Ok(Self::Back),
            other => Err(format!("unknown row: {other}")),
        }
    }
}

/// Coordinate of one storage cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellCoord {
    pub row: Row,
    pub x: u8,
    pub y: u8,
}

impl CellCoord {
    /// Creates a coordinate, checking grid bounds.
    pub fn new(row: Row, x: u8, y: u8) -> Result<Self, LayoutError> {
        if x >= COLUMNS || y >= POSITIONS {
            return Err(LayoutError::OutOfGrid { row, x, y });
        }
        Ok(Self { row, x, y })
    }

    /// Whether this cell belongs to the fixed blocked set.
    #[must_use]
    pub fn is_blocked(self) -> bool {
        match self.row {
            // The center column of the front row hosts the window and the
            // tray mechanism for twelve positions.
            Row::Front => self.x == 1 && (7..=18).contains(&self.y),
            Row::Back => matches!(
                (self.x, self.y),
                (0, 19) | (0, 20) | (1, 19) | (1, 20) | (2, 20)
            ),
        }
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.row, self.x, self.y)
    }
}

/// Layout violations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LayoutError {
    /// Coordinate outside the 2×3×21 grid.
    #[error("cell ({row}, {x}, {y}) is outside the cabinet grid")]
    OutOfGrid { row: Row, x: u8, y: u8 },
}

/// The delivery window cell. Part of the blocked set; never stores a shelf.
pub const WINDOW: CellCoord = CellCoord {
    row: Row::Front,
    x: 1,
    y: 9,
};

/// Enumerates every cell in store order: row, then column, then position.
pub fn all_cells() -> impl Iterator<Item = CellCoord> {
    [Row::Front, Row::Back].into_iter().flat_map(|row| {
        (0..COLUMNS).flat_map(move |x| (0..POSITIONS).map(move |y| CellCoord { row, x, y }))
    })
}

/// All blocked cells, in store order.
pub fn blocked_cells() -> impl Iterator<Item = CellCoord> {
    all_cells().filter(|c| c.is_blocked())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_cell_count() {
        assert_eq!(all_cells().count(), TOTAL_CELLS);
        assert_eq!(TOTAL_CELLS, 126);
    }

    #[test]
    fn test_window_is_blocked() {
        assert!(WINDOW.is_blocked());
    }

    #[test]
    fn test_blocked_set_size() {
        // 12 front-row mechanism cells plus 5 back-row corner cells.
        assert_eq!(blocked_cells().count(), 17);
    }

    #[test]
    fn test_front_blocked_band() {
        for y in 7..=18 {
            assert!(CellCoord { row: Row::Front, x: 1, y }.is_blocked());
        }
        assert!(!CellCoord { row: Row::Front, x: 1, y: 6 }.is_blocked());
        assert!(!CellCoord { row: Row::Front, x: 1, y: 19 }.is_blocked());
        assert!(!CellCoord { row: Row::Front, x: 0, y: 9 }.is_blocked());
    }

    #[test]
    fn test_out_of_grid_rejected() {
        assert!(CellCoord::new(Row::Front, 3, 0).is_err());
        assert!(CellCoord::new(Row::Back, 0, 21).is_err());
        assert!(CellCoord::new(Row::Back, 2, 20).is_ok());
    }

    #[test]
    fn test_row_round_trip() {
        for row in [Row::Front, Row::Back] {
            assert_eq!(row.as_str().parse::<Row>().unwrap(), row);
        }
    }
}
