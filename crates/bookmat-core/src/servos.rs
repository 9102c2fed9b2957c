//! Latch servos.
//!
//! Two hobby servos hook the shelf edge: `lock1` for the front row,
//! `lock2` for the back row. Angles come from calibration. The pulse
//! width is held for a short dwell and then released to zero so the
//! servo does not hunt against the shelf catch.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::cabinet::Row;
use crate::calibration::CalibrationStore;
use crate::gpio::{Gpio, GpioError, Pin, PinMap};

/// Dwell before the pulse train is released.
const HOLD: Duration = Duration::from_millis(300);

/// Which latch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Latch {
    Lock1,
    Lock2,
}

impl Latch {
    /// The latch that engages shelves in a given row.
    #[must_use]
    pub const fn for_row(row: Row) -> Self {
        match row {
            Row::Front => Self::Lock1,
            Row::Back => Self::Lock2,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lock1 => "lock1",
            Self::Lock2 => "lock2",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Lock1 => 0,
            Self::Lock2 => 1,
        }
    }
}

/// Cached latch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatchState {
    Open,
    Closed,
}

/// Driver over the two latch servos.
pub struct LatchDriver {
    gpio: Arc<Gpio>,
    pins: [Pin; 2],
    calibration: Arc<CalibrationStore>,
    states: Mutex<[LatchState; 2]>,
}

impl LatchDriver {
    pub fn new(
        gpio: Arc<Gpio>,
        pins: &PinMap,
        calibration: Arc<CalibrationStore>,
    ) -> Result<Self, GpioError> {
        gpio.setup_output(pins.servo_lock1)?;
        gpio.setup_output(pins.servo_lock2)?;
        Ok(Self {
            gpio,
            pins: [pins.servo_lock1, pins.servo_lock2],
            calibration,
            // Latches rest closed so an unpowered cabinet holds its shelves.
            states: Mutex::new([LatchState::Closed; 2]),
        })
    }

    /// `500 + angle/180 · 2000` microseconds.
    #[must_use]
    pub fn angle_to_pulse_width(angle: u8) -> u16 {
        500 + (u32::from(angle.min(180)) * 2000 / 180) as u16
    }

    async fn set_angle(&self, latch: Latch, angle: u8) -> Result<(), GpioError> {
        let pin = self.pins[latch.index()];
        self.gpio
            .set_servo_pulse_width(pin, Self::angle_to_pulse_width(angle))?;
        if !self.gpio.is_mock() {
            tokio::time::sleep(HOLD).await;
        }
        // Release the line; the catch geometry holds the position.
        self.gpio.set_servo_pulse_width(pin, 0)
    }

    pub async fn open(&self, latch: Latch) -> Result<(), GpioError> {
        let servos = self.calibration.snapshot().servos;
        let angle = match latch {
            Latch::Lock1 => servos.lock1_open,
            Latch::Lock2 => servos.lock2_open,
        };
        self.set_angle(latch, angle).await?;
        self.states.lock().expect("latch states")[latch.index()] = LatchState::Open;
        Ok(())
    }

    pub async fn close(&self, latch: Latch) -> Result<(), GpioError> {
        let servos = self.calibration.snapshot().servos;
        let angle = match latch {
            Latch::Lock1 => servos.lock1_close,
            Latch::Lock2 => servos.lock2_close,
        };
        self.set_angle(latch, angle).await?;
        self.states.lock().expect("latch states")[latch.index()] = LatchState::Closed;
        Ok(())
    }

    #[must_use]
    pub fn state(&self, latch: Latch) -> LatchState {
        self.states.lock().expect("latch states")[latch.index()]
    }

    /// Both latch states, `lock1` first.
    #[must_use]
    pub fn states(&self) -> [LatchState; 2] {
        *self.states.lock().expect("latch states")
    }
}
