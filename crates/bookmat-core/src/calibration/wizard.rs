//! Guided calibration flows.
//!
//! Three interactive modes, each a small state machine driven by an
//! operator at the maintenance console:
//!
//! - **Kinematics**: the system steps one motor at a time, the operator
//!   reports which compass diagonal the carriage moved; four answers
//!   determine the belt-routing sign map.
//! - **Positions**: the operator jogs the carriage in millimetre
//!   increments and commits its step position to ten known landmarks;
//!   intermediate rows are linearly interpolated.
//! - **Grab**: the operator tunes the three tray phases for one latch
//!   side with small deltas and single-parameter test moves.
//!
//! The wizards are pure state: the caller performs the jogs and test
//! moves, the wizard only accumulates answers and produces a validated
//! result to merge into the document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cabinet::Row;
use crate::kinematics::DirectionSigns;

use super::{GrabParam, GrabTimings, Positions, MAX_GRAB_STEPS};

/// Carriage steps per millimetre of belt travel.
pub const STEPS_PER_MM: f64 = 42.3;

/// Jog increments offered to the operator, in millimetres.
pub const JOG_SIZES_MM: [u32; 9] = [1, 2, 5, 10, 15, 20, 30, 50, 100];

/// Converts a signed jog in millimetres to motor steps.
#[must_use]
pub fn jog_steps(mm: i32) -> i32 {
    (f64::from(mm) * STEPS_PER_MM).round() as i32
}

/// One of the eight compass diagonals the operator can report.
///
/// Pure-axis answers are not offered: a single CoreXY motor always moves
/// the carriage diagonally, so an axis-aligned observation means a belt
/// is slipping, not a valid answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Diagonal {
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
}

impl Diagonal {
    /// Sign of the observed X motion.
    #[must_use]
    pub const fn dx(self) -> i8 {
        match self {
            Self::NorthEast | Self::SouthEast => 1,
            Self::NorthWest | Self::SouthWest => -1,
        }
    }

    /// Sign of the observed Y motion.
    #[must_use]
    pub const fn dy(self) -> i8 {
        match self {
            Self::NorthEast | Self::NorthWest => 1,
            Self::SouthEast | Self::SouthWest => -1,
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::NorthEast => Self::SouthWest,
            Self::NorthWest => Self::SouthEast,
            Self::SouthEast => Self::NorthWest,
            Self::SouthWest => Self::NorthEast,
        }
    }
}

/// The four probe moves of the kinematics wizard, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KinematicsProbe {
    MotorAForward,
    MotorAReverse,
    MotorBForward,
    MotorBReverse,
}

impl KinematicsProbe {
    const ORDER: [Self; 4] = [
        Self::MotorAForward,
        Self::MotorAReverse,
        Self::MotorBForward,
        Self::MotorBReverse,
    ];
}

/// Wizard errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum WizardError {
    #[error("all four probes are already answered")]
    KinematicsComplete,

    #[error("{0:?} answers are not ready yet")]
    Incomplete(&'static str),

    /// Reversing a motor must mirror the forward observation.
    #[error("reverse probe of motor {motor} did not mirror the forward probe")]
    InconsistentReverse { motor: char },

    /// Both motors reportedly move the carriage along the same line.
    #[error("observed diagonals describe parallel motor vectors")]
    ParallelObservations,

    #[error("landmark {0:?} committed twice")]
    DuplicateLandmark(Landmark),

    #[error("grab {0:?} would leave the allowed range")]
    GrabDelta(GrabParam),
}

/// Kinematics wizard: four probes, four answers, one sign map.
#[derive(Debug, Default)]
pub struct KinematicsWizard {
    answers: Vec<Diagonal>,
}

impl KinematicsWizard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The probe to execute next, or `None` when all four are answered.
    #[must_use]
    pub fn current_probe(&self) -> Option<KinematicsProbe> {
        KinematicsProbe::ORDER.get(self.answers.len()).copied()
    }

    /// Records the operator's observation for the current probe.
    pub fn answer(&mut self, observed: Diagonal) -> Result<(), WizardError> {
        if self.answers.len() >= 4 {
            return Err(WizardError::KinematicsComplete);
        }
        self.answers.push(observed);
        Ok(())
    }

    /// Computes the sign map from the four answers.
    pub fn finish(&self) -> Result<DirectionSigns, WizardError> {
        let [a_fwd, a_rev, b_fwd, b_rev] = match self.answers.as_slice() {
            [a, b, c, d] => [*a, *b, *c, *d],
            _ => return Err(WizardError::Incomplete("kinematics")),
        };
        if a_rev != a_fwd.opposite() {
            return Err(WizardError::InconsistentReverse { motor: 'A' });
        }
        if b_rev != b_fwd.opposite() {
            return Err(WizardError::InconsistentReverse { motor: 'B' });
        }

        // Stepping A alone moves the carriage along (d_by, -d_bx)/det,
        // stepping B alone along (-d_ay, d_ax)/det. The observed signs
        // pin down the map once the determinant sign is recovered from
        // the pair.
        let (p, q) = (a_fwd.dx(), a_fwd.dy());
        let (r, s) = (b_fwd.dx(), b_fwd.dy());
        let det = i32::from(s) * i32::from(p) - i32::from(r) * i32::from(q);
        if det == 0 {
            return Err(WizardError::ParallelObservations);
        }
        let e = if det > 0 { 1i8 } else { -1i8 };

        let signs = DirectionSigns {
            x_plus_dir_a: s * e,
            y_plus_dir_a: -r * e,
            x_plus_dir_b: -q * e,
            y_plus_dir_b: p * e,
        };
        debug_assert!(signs.validate().is_ok());
        Ok(signs)
    }
}

/// The ten landmarks of the positions wizard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Landmark {
    X0,
    X1,
    X2,
    Y0,
    Y1,
    Y5,
    Y10,
    Y15,
    Y20,
    /// Final check move; carries no data.
    Verify,
}

impl Landmark {
    /// Y landmarks paired with the row index they pin, in segment order.
    const Y_PINS: [(Self, usize); 6] = [
        (Self::Y0, 0),
        (Self::Y1, 1),
        (Self::Y5, 5),
        (Self::Y10, 10),
        (Self::Y15, 15),
        (Self::Y20, 20),
    ];
}

/// Positions wizard: collect landmark step positions, interpolate the
/// rest.
#[derive(Debug, Default)]
pub struct PositionsWizard {
    committed: BTreeMap<Landmark, (i32, i32)>,
}

impl PositionsWizard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits the carriage's current step position to a landmark.
    pub fn commit(&mut self, landmark: Landmark, position: (i32, i32)) -> Result<(), WizardError> {
        if landmark == Landmark::Verify {
            return Ok(());
        }
        if self.committed.contains_key(&landmark) {
            return Err(WizardError::DuplicateLandmark(landmark));
        }
        self.committed.insert(landmark, position);
        Ok(())
    }

    /// Landmarks still waiting for a commit.
    #[must_use]
    pub fn remaining(&self) -> Vec<Landmark> {
        [
            Landmark::X0,
            Landmark::X1,
            Landmark::X2,
            Landmark::Y0,
            Landmark::Y1,
            Landmark::Y5,
            Landmark::Y10,
            Landmark::Y15,
            Landmark::Y20,
        ]
        .into_iter()
        .filter(|lm| !self.committed.contains_key(lm))
        .collect()
    }

    /// Builds the position tables, interpolating Y rows between pins in
    /// the segments 0→1, 1→5, 5→10, 10→15, 15→20.
    pub fn finish(&self) -> Result<Positions, WizardError> {
        if !self.remaining().is_empty() {
            return Err(WizardError::Incomplete("positions"));
        }
        let x = vec![
            self.committed[&Landmark::X0].0,
            self.committed[&Landmark::X1].0,
            self.committed[&Landmark::X2].0,
        ];

        let mut y = vec![0i32; 21];
        for (lm, row) in Landmark::Y_PINS {
            y[row] = self.committed[&lm].1;
        }
        for window in Landmark::Y_PINS.windows(2) {
            let (lo, hi) = (window[0].1, window[1].1);
            let (a, b) = (y[lo], y[hi]);
            let span = (hi - lo) as i32;
            for row in lo + 1..hi {
                let t = (row - lo) as i32;
                y[row] = a + (b - a) * t / span;
            }
        }
        Ok(Positions { x, y })
    }
}

/// Grab wizard: per-side tray-phase tuning.
#[derive(Debug)]
pub struct GrabWizard {
    side: Row,
    timings: GrabTimings,
}

impl GrabWizard {
    /// Starts from the side's current timings.
    #[must_use]
    pub fn new(side: Row, current: GrabTimings) -> Self {
        Self {
            side,
            timings: current,
        }
    }

    #[must_use]
    pub const fn side(&self) -> Row {
        self.side
    }

    #[must_use]
    pub fn timings(&self) -> GrabTimings {
        self.timings
    }

    /// Nudges one phase, clamping to the allowed range.
    pub fn adjust(&mut self, param: GrabParam, delta: i32) -> Result<u32, WizardError> {
        let current = i64::from(self.timings.get(param));
        let next = current + i64::from(delta);
        if !(0..=i64::from(MAX_GRAB_STEPS)).contains(&next) {
            return Err(WizardError::GrabDelta(param));
        }
        let next = next as u32;
        self.timings.set(param, next);
        Ok(next)
    }
}
