//! Persistent mechanical calibration.
//!
//! One versioned JSON document holds everything the mechanics need to
//! address the physical cabinet: the per-column and per-row step tables,
//! the belt-routing sign map, grab timings, motor speeds, servo angles,
//! the window coordinate and the blocked-cell set.
//!
//! Writes go through `validate → merge → atomic replace`: the new
//! document is validated as a whole, written to a sibling temp file and
//! renamed over the old one, then the in-memory snapshot is swapped.
//! Readers always see either the old document or the new one, never a
//! partial write.

pub mod wizard;

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::cabinet::{self, CellCoord, Row, COLUMNS, POSITIONS, WINDOW};
use crate::kinematics::{DirectionSigns, KinematicsError, StepTable};

/// Current document version.
pub const CALIBRATION_VERSION: u32 = 2;
/// Upper bound for any position-table entry, in steps.
pub const MAX_POSITION_STEPS: i32 = 15_000;
/// Upper bound for any grab phase, in steps.
pub const MAX_GRAB_STEPS: u32 = 10_000;

/// Step tables for the three columns and twenty-one positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Positions {
    pub x: Vec<i32>,
    pub y: Vec<i32>,
}

impl Default for Positions {
    fn default() -> Self {
        Self {
            x: vec![0, 4500, 9000],
            y: (0..i32::from(POSITIONS)).map(|i| i * 450).collect(),
        }
    }
}

/// Tray travel for the three phases of a shelf grab, in steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrabTimings {
    pub extend1: u32,
    pub retract: u32,
    pub extend2: u32,
}

impl Default for GrabTimings {
    fn default() -> Self {
        Self {
            extend1: 1500,
            retract: 1500,
            extend2: 3000,
        }
    }
}

impl GrabTimings {
    #[must_use]
    pub fn get(&self, param: GrabParam) -> u32 {
        match param {
            GrabParam::Extend1 => self.extend1,
            GrabParam::Retract => self.retract,
            GrabParam::Extend2 => self.extend2,
        }
    }

    pub fn set(&mut self, param: GrabParam, value: u32) {
        match param {
            GrabParam::Extend1 => self.extend1 = value,
            GrabParam::Retract => self.retract = value,
            GrabParam::Extend2 => self.extend2 = value,
        }
    }
}

/// One tunable grab phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrabParam {
    Extend1,
    Retract,
    Extend2,
}

/// Step rates, in steps per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speeds {
    pub xy: u32,
    pub tray: u32,
    pub acceleration: u32,
}

impl Default for Speeds {
    fn default() -> Self {
        Self {
            xy: 4000,
            tray: 2000,
            acceleration: 8000,
        }
    }
}

/// Latch servo angles, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServoAngles {
    pub lock1_open: u8,
    pub lock1_close: u8,
    pub lock2_open: u8,
    pub lock2_close: u8,
}

impl Default for ServoAngles {
    fn default() -> Self {
        Self {
            lock1_open: 0,
            lock1_close: 95,
            lock2_open: 0,
            lock2_close: 95,
        }
    }
}

/// The whole calibration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub kinematics: DirectionSigns,
    #[serde(default)]
    pub positions: Positions,
    #[serde(default = "default_window")]
    pub window: CellCoord,
    #[serde(default)]
    pub grab_front: GrabTimings,
    #[serde(default)]
    pub grab_back: GrabTimings,
    #[serde(default)]
    pub speeds: Speeds,
    #[serde(default)]
    pub servos: ServoAngles,
    #[serde(default = "default_blocked")]
    pub blocked: Vec<CellCoord>,
}

fn default_version() -> u32 {
    CALIBRATION_VERSION
}

fn default_window() -> CellCoord {
    WINDOW
}

fn default_blocked() -> Vec<CellCoord> {
    cabinet::blocked_cells().collect()
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            version: CALIBRATION_VERSION,
            kinematics: DirectionSigns::default(),
            positions: Positions::default(),
            window: WINDOW,
            grab_front: GrabTimings::default(),
            grab_back: GrabTimings::default(),
            speeds: Speeds::default(),
            servos: ServoAngles::default(),
            blocked: default_blocked(),
        }
    }
}

impl Calibration {
    /// Grab timings for a row's latch side.
    #[must_use]
    pub fn grab(&self, row: Row) -> GrabTimings {
        match row {
            Row::Front => self.grab_front,
            Row::Back => self.grab_back,
        }
    }

    /// Step table view for the kinematics layer.
    ///
    /// Only valid on a validated document (the table sizes are checked
    /// there).
    #[must_use]
    pub fn step_table(&self) -> StepTable {
        let mut x = [0i32; 3];
        x.copy_from_slice(&self.positions.x);
        let mut y = [0i32; 21];
        y.copy_from_slice(&self.positions.y);
        StepTable { x, y }
    }

    /// Window target in steps.
    #[must_use]
    pub fn window_steps(&self) -> (i32, i32) {
        self.step_table().cell_to_steps(self.window)
    }

    /// Validates the whole document. Never partially mutates anything.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        self.kinematics.validate()?;

        check_positions("positions.x", &self.positions.x, usize::from(COLUMNS))?;
        check_positions("positions.y", &self.positions.y, usize::from(POSITIONS))?;

        for (name, value, lo, hi) in [
            ("speeds.xy", self.speeds.xy, 100, 20_000),
            ("speeds.tray", self.speeds.tray, 100, 20_000),
            ("speeds.acceleration", self.speeds.acceleration, 0, 100_000),
        ] {
            if value < lo || value > hi {
                return Err(CalibrationError::OutOfRange {
                    name,
                    value: i64::from(value),
                    min: i64::from(lo),
                    max: i64::from(hi),
                });
            }
        }

        for (name, angle) in [
            ("servos.lock1_open", self.servos.lock1_open),
            ("servos.lock1_close", self.servos.lock1_close),
            ("servos.lock2_open", self.servos.lock2_open),
            ("servos.lock2_close", self.servos.lock2_close),
        ] {
            if angle > 180 {
                return Err(CalibrationError::OutOfRange {
                    name,
                    value: i64::from(angle),
                    min: 0,
                    max: 180,
                });
            }
        }

        for (side, grab) in [("grab_front", self.grab_front), ("grab_back", self.grab_back)] {
            for (phase, value) in [
                ("extend1", grab.extend1),
                ("retract", grab.retract),
                ("extend2", grab.extend2),
            ] {
                if value > MAX_GRAB_STEPS {
                    return Err(CalibrationError::GrabOutOfRange {
                        side,
                        phase,
                        value,
                    });
                }
            }
        }

        if self.window.x >= COLUMNS || self.window.y >= POSITIONS {
            return Err(CalibrationError::WindowOutOfGrid(self.window));
        }
        if !self.blocked.contains(&self.window) {
            return Err(CalibrationError::WindowNotBlocked(self.window));
        }
        for cell in &self.blocked {
            if cell.x >= COLUMNS || cell.y >= POSITIONS {
                return Err(CalibrationError::BlockedOutOfGrid(*cell));
            }
        }

        Ok(())
    }
}

fn check_positions(name: &'static str, values: &[i32], expected: usize) -> Result<(), CalibrationError> {
    if values.len() != expected {
        return Err(CalibrationError::WrongTableLength {
            name,
            expected,
            actual: values.len(),
        });
    }
    for &value in values {
        if !(0..=MAX_POSITION_STEPS).contains(&value) {
            return Err(CalibrationError::OutOfRange {
                name,
                value: i64::from(value),
                min: 0,
                max: i64::from(MAX_POSITION_STEPS),
            });
        }
    }
    if values.windows(2).any(|w| w[0] > w[1]) {
        return Err(CalibrationError::NotMonotonic { name });
    }
    Ok(())
}

/// Calibration validation and persistence errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CalibrationError {
    #[error(transparent)]
    Kinematics(#[from] KinematicsError),

    #[error("{name} must have {expected} entries, got {actual}")]
    WrongTableLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{name} must be non-decreasing")]
    NotMonotonic { name: &'static str },

    #[error("{name} = {value} outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("{side}.{phase} = {value} outside [0, {MAX_GRAB_STEPS}]")]
    GrabOutOfRange {
        side: &'static str,
        phase: &'static str,
        value: u32,
    },

    #[error("window {0} is outside the cabinet grid")]
    WindowOutOfGrid(CellCoord),

    #[error("window {0} must stay in the blocked set")]
    WindowNotBlocked(CellCoord),

    #[error("blocked cell {0} is outside the cabinet grid")]
    BlockedOutOfGrid(CellCoord),

    #[error("calibration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("calibration document: {0}")]
    Format(#[from] serde_json::Error),
}

/// Snapshot-consistent store over the calibration file.
pub struct CalibrationStore {
    path: PathBuf,
    current: RwLock<Arc<Calibration>>,
}

impl CalibrationStore {
    /// Loads the document at `path`, falling back to defaults when the
    /// file is missing or unreadable (a fresh cabinet has none).
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Calibration>(&text) {
                Ok(data) if data.validate().is_ok() => data,
                Ok(_) => {
                    tracing::warn!(?path, "calibration file failed validation, using defaults");
                    Calibration::default()
                }
                Err(err) => {
                    tracing::warn!(?path, %err, "calibration file unreadable, using defaults");
                    Calibration::default()
                }
            },
            Err(_) => Calibration::default(),
        };
        Self {
            path,
            current: RwLock::new(Arc::new(data)),
        }
    }

    /// In-memory store for tests; never touches the filesystem path
    /// until the first write.
    #[must_use]
    pub fn in_memory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(Arc::new(Calibration::default())),
        }
    }

    /// Current document snapshot. Cheap; clones an `Arc`.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Calibration> {
        self.current.read().expect("calibration snapshot").clone()
    }

    /// Validates and commits a full replacement document.
    pub fn replace(&self, data: Calibration) -> Result<(), CalibrationError> {
        data.validate()?;
        self.persist(&data)?;
        *self.current.write().expect("calibration snapshot") = Arc::new(data);
        Ok(())
    }

    /// Applies an edit to a copy of the current document, then commits it
    /// through the same validate-and-replace path.
    pub fn update<F>(&self, edit: F) -> Result<(), CalibrationError>
    where
        F: FnOnce(&mut Calibration),
    {
        let mut next = (*self.snapshot()).clone();
        edit(&mut next);
        self.replace(next)
    }

    /// Parses and commits an exported JSON document.
    pub fn import_json(&self, json: &str) -> Result<(), CalibrationError> {
        let data: Calibration = serde_json::from_str(json)?;
        self.replace(data)
    }

    /// Serializes the current document.
    pub fn export_json(&self) -> Result<String, CalibrationError> {
        Ok(serde_json::to_string_pretty(&*self.snapshot())?)
    }

    /// Restores factory defaults.
    pub fn reset(&self) -> Result<(), CalibrationError> {
        self.replace(Calibration::default())
    }

    /// Writes the document to a sibling temp file and renames it over
    /// the target, so a crash mid-write leaves the old file intact.
    fn persist(&self, data: &Calibration) -> Result<(), CalibrationError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = tmp_path(&self.path);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(data)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document_validates() {
        Calibration::default().validate().unwrap();
    }

    #[test]
    fn test_non_monotone_y_rejected() {
        let mut data = Calibration::default();
        data.positions.y[10] = 100;
        assert!(matches!(
            data.validate(),
            Err(CalibrationError::NotMonotonic { name: "positions.y" })
        ));
    }

    #[test]
    fn test_short_y_table_rejected() {
        let mut data = Calibration::default();
        data.positions.y.truncate(20);
        assert!(matches!(
            data.validate(),
            Err(CalibrationError::WrongTableLength {
                name: "positions.y",
                expected: 21,
                actual: 20,
            })
        ));
    }

    #[test]
    fn test_position_above_limit_rejected() {
        let mut data = Calibration::default();
        data.positions.x[2] = MAX_POSITION_STEPS + 1;
        assert!(matches!(
            data.validate(),
            Err(CalibrationError::OutOfRange { name: "positions.x", .. })
        ));
    }

    #[test]
    fn test_window_must_stay_blocked() {
        let mut data = Calibration::default();
        data.blocked.retain(|c| *c != data.window);
        assert!(matches!(
            data.validate(),
            Err(CalibrationError::WindowNotBlocked(_))
        ));
    }

    #[test]
    fn test_grab_limit() {
        let mut data = Calibration::default();
        data.grab_back.extend2 = MAX_GRAB_STEPS + 1;
        assert!(matches!(
            data.validate(),
            Err(CalibrationError::GrabOutOfRange {
                side: "grab_back",
                phase: "extend2",
                ..
            })
        ));
    }

    #[test]
    fn test_store_round_trip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");

        let store = CalibrationStore::open(&path);
        store
            .update(|data| data.positions.x = vec![0, 5000, 10_000])
            .unwrap();

        let reloaded = CalibrationStore::open(&path);
        assert_eq!(reloaded.snapshot().positions.x, vec![0, 5000, 10_000]);
    }

    #[test]
    fn test_failed_import_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calibration.json");
        let store = CalibrationStore::open(&path);
        store.update(|data| data.speeds.xy = 3000).unwrap();

        // 20-entry y table: rejected before anything is written.
        let mut bad = Calibration::default();
        bad.positions.y.truncate(20);
        let json = serde_json::to_string(&bad).unwrap();
        assert!(store.import_json(&json).is_err());

        assert_eq!(store.snapshot().speeds.xy, 3000);
        let reloaded = CalibrationStore::open(&path);
        assert_eq!(reloaded.snapshot().speeds.xy, 3000);
        assert_eq!(reloaded.snapshot().positions.y.len(), 21);
    }

    #[test]
    fn test_export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::open(dir.path().join("calibration.json"));
        store.update(|data| data.servos.lock1_close = 90).unwrap();

        let json = store.export_json().unwrap();
        let other = CalibrationStore::open(dir.path().join("other.json"));
        other.import_json(&json).unwrap();
        assert_eq!(other.snapshot().servos.lock1_close, 90);
    }
}
