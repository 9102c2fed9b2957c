//! Motion algorithms: INIT, TAKE, GIVE.
//!
//! Each algorithm is a linear sequence of hardware phases with explicit
//! progress reporting and a cooperative stop token checked at every safe
//! point. The safe-move supervisor ([`supervisor`]) wraps all carriage
//! and tray motion with limit-switch checks.
//!
//! State model: the cabinet is one exclusive resource. Exactly one
//! algorithm runs at a time; after TAKE presents a shelf the state parks
//! in [`MotionState::WaitingUser`] until the transaction layer acks or
//! times out, and GIVE settles back to idle.

pub mod supervisor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;

use crate::cabinet::CellCoord;
use crate::calibration::CalibrationStore;
use crate::events::{Event, EventBus};
use crate::gpio::GpioError;
use crate::motors::{MotorDriver, MotorError, MotorPosition};
use crate::sensors::{SensorFilter, SensorSnapshot};
use crate::servos::{Latch, LatchDriver};
use crate::shutters::{Shutter, ShutterDriver};

use supervisor::SafeMover;

/// Default patron interaction window.
pub const DEFAULT_USER_WAIT: Duration = Duration::from_secs(30);

/// Increment used while creeping toward a home switch.
const HOME_CREEP_STEPS: i32 = 100;
/// Step budget per axis before homing is declared failed.
const HOME_TRAVEL_BUDGET: i32 = 16_000;

/// Which algorithm is (or was) running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MotionOp {
    Init,
    Take,
    Give,
}

impl MotionOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Take => "TAKE",
            Self::Give => "GIVE",
        }
    }
}

/// Externally visible machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionState {
    Idle,
    Homing,
    Busy,
    WaitingUser,
    Stopped,
    Error,
}

/// Motion-layer failures, each with the wire error code the façade
/// reports.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MotionError {
    /// A limit switch in the commanded travel direction is already
    /// triggered.
    #[error("limit switch {switch} blocks travel toward it")]
    DirectionBlocked { switch: &'static str },

    /// A switch off the travel vector tripped during the segment.
    #[error("limit switch {switch} tripped unexpectedly during travel")]
    UnexpectedTrip { switch: &'static str },

    /// Operator stop request honored between segments.
    #[error("stopped by operator request")]
    Stopped,

    /// The motor driver failed mid-move.
    #[error("motor drive failure: {0}")]
    DriveFailed(String),

    /// Tray drive failure while extending.
    #[error("tray drive failure while extending: {0}")]
    TrayExtendFailed(String),

    /// Tray drive failure while retracting.
    #[error("tray drive failure while retracting: {0}")]
    TrayRetractFailed(String),

    /// Tray never reached the extended limit.
    #[error("tray end limit not reached")]
    TrayExtendLimit,

    /// Tray never reached the retracted limit.
    #[error("tray begin limit not reached")]
    TrayRetractLimit,

    /// A home switch never asserted within the travel budget.
    #[error("homing failed: {axis} begin switch never asserted")]
    HomingFailed { axis: char },

    /// The sticky emergency-stop flag is set; INIT clears it.
    #[error("emergency stop latched; run INIT to clear")]
    EmergencyStop,

    #[error(transparent)]
    Gpio(#[from] GpioError),
}

impl MotionError {
    /// Wire error code.
    #[must_use]
    pub fn code(&self) -> u8 {
        match self {
            Self::DirectionBlocked { .. } | Self::UnexpectedTrip { .. } => 10,
            Self::Stopped | Self::EmergencyStop => 11,
            Self::DriveFailed(_) | Self::Gpio(_) => 12,
            Self::TrayExtendFailed(_) => 20,
            Self::TrayRetractFailed(_) => 21,
            Self::TrayExtendLimit => 22,
            Self::TrayRetractLimit => 23,
            Self::HomingFailed { .. } => 1,
        }
    }
}

pub(crate) fn map_tray_error(err: MotorError, outward: bool) -> MotionError {
    match err {
        MotorError::Halted => MotionError::Stopped,
        MotorError::TrayLimitNotReached { .. } => {
            if outward {
                MotionError::TrayExtendLimit
            } else {
                MotionError::TrayRetractLimit
            }
        }
        other => {
            if outward {
                MotionError::TrayExtendFailed(other.to_string())
            } else {
                MotionError::TrayRetractFailed(other.to_string())
            }
        }
    }
}

/// The INIT/TAKE/GIVE executor.
///
/// Owns the stop token and the sticky emergency-stop flag; everything
/// else is shared with the rest of the system context.
pub struct Algorithms {
    motors: Arc<MotorDriver>,
    latches: Arc<LatchDriver>,
    shutters: Arc<ShutterDriver>,
    sensors: Arc<SensorFilter>,
    calibration: Arc<CalibrationStore>,
    events: EventBus,
    mover: SafeMover,
    state: Mutex<MotionState>,
    current_op: Mutex<Option<MotionOp>>,
    estop: AtomicBool,
    user_ack: Notify,
}

impl Algorithms {
    #[must_use]
    pub fn new(
        motors: Arc<MotorDriver>,
        latches: Arc<LatchDriver>,
        shutters: Arc<ShutterDriver>,
        sensors: Arc<SensorFilter>,
        calibration: Arc<CalibrationStore>,
        events: EventBus,
    ) -> Self {
        let mover = SafeMover::new(motors.clone(), sensors.clone());
        Self {
            motors,
            latches,
            shutters,
            sensors,
            calibration,
            events,
            mover,
            state: Mutex::new(MotionState::Idle),
            current_op: Mutex::new(None),
            estop: AtomicBool::new(false),
            user_ack: Notify::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> MotionState {
        *self.state.lock().expect("motion state")
    }

    #[must_use]
    pub fn current_operation(&self) -> Option<MotionOp> {
        *self.current_op.lock().expect("motion op")
    }

    #[must_use]
    pub fn position(&self) -> MotorPosition {
        self.motors.position()
    }

    pub fn sensor_snapshot(&self) -> Result<SensorSnapshot, GpioError> {
        self.sensors.snapshot()
    }

    /// Operator stop: halts the motors and latches the emergency flag.
    /// The flag is sticky until the next successful [`init_home`](Self::init_home).
    pub fn stop(&self) {
        self.motors.stop();
        self.estop.store(true, Ordering::SeqCst);
        *self.state.lock().expect("motion state") = MotionState::Stopped;
        tracing::warn!("operator stop requested");
    }

    /// Acks the waiting patron interaction, releasing
    /// [`wait_for_user`](Self::wait_for_user) early.
    pub fn confirm_user(&self) {
        self.user_ack.notify_waiters();
    }

    /// Parks until the patron acts or the window elapses.
    ///
    /// Returns `true` when the wait ended with an explicit ack.
    pub async fn wait_for_user(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_USER_WAIT);
        let acked = tokio::time::timeout(timeout, self.user_ack.notified())
            .await
            .is_ok();
        if !acked {
            tracing::info!(?timeout, "user interaction window elapsed");
        }
        acked
    }

    fn set_state(&self, state: MotionState) {
        *self.state.lock().expect("motion state") = state;
    }

    fn begin(&self, op: MotionOp, state: MotionState) -> Result<(), MotionError> {
        if self.estop.load(Ordering::SeqCst) && op != MotionOp::Init {
            return Err(MotionError::EmergencyStop);
        }
        *self.current_op.lock().expect("motion op") = Some(op);
        self.set_state(state);
        Ok(())
    }

    fn emit_progress(&self, op: MotionOp, step: u32, total: u32, message: impl Into<String>) {
        self.events.publish(Event::Progress {
            step,
            total,
            message: message.into(),
            operation: op,
        });
    }

    fn emit_position(&self) {
        let pos = self.motors.position();
        self.events.publish(Event::Position {
            x: pos.x,
            y: pos.y,
            tray: pos.tray_out,
        });
    }

    fn fail(&self, op: MotionOp, err: &MotionError) {
        self.events.publish(Event::Error {
            code: err.code(),
            message: err.to_string(),
            operation: Some(op),
        });
        self.set_state(MotionState::Error);
        tracing::warn!(operation = op.as_str(), code = err.code(), %err, "motion failed");
    }

    /// INIT: find the mechanical origin.
    ///
    /// Retracts the tray if needed, then creeps each axis toward its
    /// begin switch in bounded increments. A switch that never asserts
    /// within the budget is a fatal homing failure. Clears the stop and
    /// emergency flags on entry.
    pub async fn init_home(&self) -> Result<(), MotionError> {
        self.motors.clear_halt();
        self.estop.store(false, Ordering::SeqCst);
        self.begin(MotionOp::Init, MotionState::Homing)?;
        let op = MotionOp::Init;
        let total = 5;

        let result = async {
            self.emit_progress(op, 1, total, "checking tray");
            if !self.sensors.is_tray_retracted()? {
                self.emit_progress(op, 2, total, "retracting tray");
                self.mover.retract_tray(None).await?;
            } else {
                self.emit_progress(op, 2, total, "tray already retracted");
            }

            self.emit_progress(op, 3, total, "seeking X origin");
            self.home_axis('x').await?;
            self.motors.set_position(0, self.motors.position().y);

            self.emit_progress(op, 4, total, "seeking Y origin");
            self.home_axis('y').await?;
            self.motors.set_position(0, 0);

            self.emit_progress(op, 5, total, "origin found");
            self.emit_position();
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_state(MotionState::Idle);
                tracing::info!("homing complete");
                Ok(())
            }
            Err(err) => {
                self.fail(op, &err);
                Err(err)
            }
        }
    }

    async fn home_axis(&self, axis: char) -> Result<(), MotionError> {
        let mut travelled = 0i32;
        loop {
            let at_origin = match axis {
                'x' => self.sensors.read(crate::sensors::SensorId::XBegin)?.triggered,
                _ => self.sensors.read(crate::sensors::SensorId::YBegin)?.triggered,
            };
            if at_origin {
                return Ok(());
            }
            if travelled >= HOME_TRAVEL_BUDGET {
                return Err(MotionError::HomingFailed { axis });
            }
            let (dx, dy) = match axis {
                'x' => (-HOME_CREEP_STEPS, 0),
                _ => (0, -HOME_CREEP_STEPS),
            };
            self.motors
                .step_relative(dx, dy)
                .await
                .map_err(|err| match err {
                    MotorError::Halted => MotionError::Stopped,
                    other => MotionError::DriveFailed(other.to_string()),
                })?;
            travelled += HOME_CREEP_STEPS;
        }
    }

    /// TAKE: extract the shelf at `cell` and present it at the window.
    ///
    /// Thirteen phases; ends in [`MotionState::WaitingUser`] with the
    /// outer shutter open.
    pub async fn take_shelf(&self, cell: CellCoord) -> Result<(), MotionError> {
        self.begin(MotionOp::Take, MotionState::Busy)?;
        let op = MotionOp::Take;
        let total = 13;
        let latch = Latch::for_row(cell.row);
        let grab = self.calibration.snapshot().grab(cell.row);

        let result = async {
            self.emit_progress(op, 1, total, "checking tray");
            if !self.sensors.is_tray_retracted()? {
                self.mover.retract_tray(None).await?;
            }

            self.emit_progress(op, 2, total, format!("moving to cell {cell}"));
            let target = self.calibration.snapshot().step_table().cell_to_steps(cell);
            self.mover.move_to(target).await?;
            self.emit_position();

            self.emit_progress(op, 3, total, "extending tray, first reach");
            self.mover.extend_tray(Some(grab.extend1)).await?;

            self.emit_progress(op, 4, total, "engaging shelf catch");
            self.latches.close(latch).await?;

            self.emit_progress(op, 5, total, "drawing shelf out");
            self.mover.retract_tray(Some(grab.retract)).await?;

            self.emit_progress(op, 6, total, "releasing shelf-side latch");
            self.latches.open(latch).await?;

            self.emit_progress(op, 7, total, "extending tray, second reach");
            self.mover.extend_tray(Some(grab.extend2)).await?;

            self.emit_progress(op, 8, total, "locking shelf to tray");
            self.latches.close(latch).await?;

            self.emit_progress(op, 9, total, "retracting tray fully");
            self.mover.retract_tray(None).await?;

            self.emit_progress(op, 10, total, "moving to window");
            let window = self.calibration.snapshot().window_steps();
            self.mover.move_to(window).await?;
            self.emit_position();

            self.emit_progress(op, 11, total, "opening inner shutter");
            self.shutters.open(Shutter::Inner).await?;

            self.emit_progress(op, 12, total, "presenting shelf in window");
            self.mover.extend_tray(None).await?;

            self.emit_progress(op, 13, total, "opening outer shutter");
            self.shutters.open(Shutter::Outer).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_state(MotionState::WaitingUser);
                Ok(())
            }
            Err(err) => {
                self.fail(op, &err);
                Err(err)
            }
        }
    }

    /// GIVE: return the presented shelf into `cell`.
    ///
    /// Twelve phases, the reverse choreography of TAKE; settles to idle.
    pub async fn give_shelf(&self, cell: CellCoord) -> Result<(), MotionError> {
        self.begin(MotionOp::Give, MotionState::Busy)?;
        let op = MotionOp::Give;
        let total = 12;
        let latch = Latch::for_row(cell.row);
        let grab = self.calibration.snapshot().grab(cell.row);

        let result = async {
            self.emit_progress(op, 1, total, "closing outer shutter");
            self.shutters.close(Shutter::Outer).await?;

            self.emit_progress(op, 2, total, "retracting tray");
            self.mover.retract_tray(None).await?;

            self.emit_progress(op, 3, total, "closing inner shutter");
            self.shutters.close(Shutter::Inner).await?;

            self.emit_progress(op, 4, total, format!("moving to cell {cell}"));
            let target = self.calibration.snapshot().step_table().cell_to_steps(cell);
            self.mover.move_to(target).await?;
            self.emit_position();

            self.emit_progress(op, 5, total, "extending shelf into cell");
            self.mover.extend_tray(Some(grab.extend2)).await?;

            self.emit_progress(op, 6, total, "releasing tray latch");
            self.latches.open(latch).await?;

            self.emit_progress(op, 7, total, "backing tray off");
            self.mover.retract_tray(Some(grab.retract)).await?;

            self.emit_progress(op, 8, total, "closing shelf catch");
            self.latches.close(latch).await?;

            self.emit_progress(op, 9, total, "seating shelf");
            self.mover.extend_tray(Some(grab.extend1)).await?;

            self.emit_progress(op, 10, total, "opening latch clear");
            self.latches.open(latch).await?;

            self.emit_progress(op, 11, total, "retracting tray fully");
            self.mover.retract_tray(None).await?;

            self.emit_progress(op, 12, total, "shelf stored");
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.set_state(MotionState::Idle);
                Ok(())
            }
            Err(err) => {
                self.fail(op, &err);
                Err(err)
            }
        }
    }

    /// Plain supervised move, for jogs and the maintenance console.
    pub async fn move_to(&self, x: i32, y: i32) -> Result<(), MotionError> {
        if self.estop.load(Ordering::SeqCst) {
            return Err(MotionError::EmergencyStop);
        }
        let result = self.mover.move_to((x, y)).await;
        self.emit_position();
        result
    }
}
