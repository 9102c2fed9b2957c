//! Safe-move supervisor.
//!
//! Wraps every carriage and tray motion with limit-switch discipline.
//! Carriage moves are expanded into planner waypoints; before each
//! waypoint the filtered switches are polled and a switch already
//! triggered in the commanded direction rejects the move. After each
//! segment, any switch that newly tripped outside the travel vector
//! aborts. Tray phases get the analogous treatment through the driver's
//! own limit handling.

use std::sync::Arc;

use crate::motors::{MotorDriver, MotorError};
use crate::planner::plan_path;
use crate::sensors::{SensorFilter, SensorId, SensorSnapshot};

use super::{map_tray_error, MotionError};

/// Limit-checked motion wrapper shared by all algorithms.
pub struct SafeMover {
    motors: Arc<MotorDriver>,
    sensors: Arc<SensorFilter>,
}

impl SafeMover {
    #[must_use]
    pub fn new(motors: Arc<MotorDriver>, sensors: Arc<SensorFilter>) -> Self {
        Self { motors, sensors }
    }

    /// Supervised carriage move to an absolute step target.
    pub async fn move_to(&self, target: (i32, i32)) -> Result<(), MotionError> {
        let pos = self.motors.position();
        let path = plan_path((pos.x, pos.y), target);

        for waypoint in path {
            if self.motors.is_halted() {
                return Err(MotionError::Stopped);
            }

            let pos = self.motors.position();
            let (dx, dy) = (waypoint.x - pos.x, waypoint.y - pos.y);
            let before = self.sensors.snapshot()?;
            self.check_direction(&before, dx, dy)?;

            self.motors
                .move_xy(waypoint.x, waypoint.y)
                .await
                .map_err(|err| match err {
                    MotorError::Halted => MotionError::Stopped,
                    other => MotionError::DriveFailed(other.to_string()),
                })?;

            let after = self.sensors.snapshot()?;
            self.check_unexpected(&before, &after, dx, dy)?;
        }
        Ok(())
    }

    /// Rejects travel toward an already-triggered switch.
    fn check_direction(
        &self,
        snapshot: &SensorSnapshot,
        dx: i32,
        dy: i32,
    ) -> Result<(), MotionError> {
        let blocked = [
            (dx > 0, snapshot.x_end, "x_end"),
            (dx < 0, snapshot.x_begin, "x_begin"),
            (dy > 0, snapshot.y_end, "y_end"),
            (dy < 0, snapshot.y_begin, "y_begin"),
        ];
        for (travelling, triggered, switch) in blocked {
            if travelling && triggered {
                return Err(MotionError::DirectionBlocked { switch });
            }
        }
        Ok(())
    }

    /// Rejects switches that newly tripped off the travel vector.
    fn check_unexpected(
        &self,
        before: &SensorSnapshot,
        after: &SensorSnapshot,
        dx: i32,
        dy: i32,
    ) -> Result<(), MotionError> {
        let axis_switches = [
            (SensorId::XBegin, "x_begin", dx < 0),
            (SensorId::XEnd, "x_end", dx > 0),
            (SensorId::YBegin, "y_begin", dy < 0),
            (SensorId::YEnd, "y_end", dy > 0),
        ];
        for (id, switch, expected) in axis_switches {
            if expected {
                continue;
            }
            if after.get(id) && !before.get(id) {
                return Err(MotionError::UnexpectedTrip { switch });
            }
        }
        Ok(())
    }

    /// Supervised tray extension. `None` runs to the end limit.
    pub async fn extend_tray(&self, steps: Option<u32>) -> Result<(), MotionError> {
        if self.motors.is_halted() {
            return Err(MotionError::Stopped);
        }
        self.motors
            .extend_tray(steps)
            .await
            .map_err(|err| map_tray_error(err, true))
    }

    /// Supervised tray retraction. `None` runs to the begin limit.
    pub async fn retract_tray(&self, steps: Option<u32>) -> Result<(), MotionError> {
        if self.motors.is_halted() {
            return Err(MotionError::Stopped);
        }
        self.motors
            .retract_tray(steps)
            .await
            .map_err(|err| map_tray_error(err, false))
    }
}
