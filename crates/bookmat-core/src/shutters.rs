//! Window shutters.
//!
//! Two opaque panels over the delivery window, driven by relays. The
//! inner and outer shutters form an airlock: the inner one opens before
//! the tray extends into the window, the outer one only once the shelf
//! is presented. Each actuation holds the relay line across its settling
//! time before the cached state is updated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::gpio::{Gpio, GpioError, Level, Pin, PinMap};

/// Relay settling dwell.
const SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Shutter {
    Outer,
    Inner,
}

impl Shutter {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Outer => "outer",
            Self::Inner => "inner",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Outer => 0,
            Self::Inner => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutterState {
    Open,
    Closed,
}

/// Driver over the two shutter relays.
pub struct ShutterDriver {
    gpio: Arc<Gpio>,
    pins: [Pin; 2],
    states: Mutex<[ShutterState; 2]>,
}

impl ShutterDriver {
    pub fn new(gpio: Arc<Gpio>, pins: &PinMap) -> Result<Self, GpioError> {
        gpio.setup_output(pins.shutter_outer)?;
        gpio.setup_output(pins.shutter_inner)?;
        Ok(Self {
            gpio,
            pins: [pins.shutter_outer, pins.shutter_inner],
            states: Mutex::new([ShutterState::Closed; 2]),
        })
    }

    async fn drive(&self, shutter: Shutter, level: Level) -> Result<(), GpioError> {
        self.gpio.write(self.pins[shutter.index()], level)?;
        if !self.gpio.is_mock() {
            tokio::time::sleep(SETTLE).await;
        }
        Ok(())
    }

    pub async fn open(&self, shutter: Shutter) -> Result<(), GpioError> {
        self.drive(shutter, Level::High).await?;
        self.states.lock().expect("shutter states")[shutter.index()] = ShutterState::Open;
        Ok(())
    }

    pub async fn close(&self, shutter: Shutter) -> Result<(), GpioError> {
        self.drive(shutter, Level::Low).await?;
        self.states.lock().expect("shutter states")[shutter.index()] = ShutterState::Closed;
        Ok(())
    }

    #[must_use]
    pub fn state(&self, shutter: Shutter) -> ShutterState {
        self.states.lock().expect("shutter states")[shutter.index()]
    }

    /// Both shutter states, outer first.
    #[must_use]
    pub fn states(&self) -> [ShutterState; 2] {
        *self.states.lock().expect("shutter states")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::MockGpio;

    fn rig() -> (ShutterDriver, Arc<MockGpio>, PinMap) {
        let (gpio, mock) = Gpio::mock();
        let pins = PinMap::default();
        let driver = ShutterDriver::new(gpio, &pins).unwrap();
        (driver, mock, pins)
    }

    #[tokio::test]
    async fn test_open_energizes_relay() {
        let (driver, mock, pins) = rig();
        driver.open(Shutter::Outer).await.unwrap();
        assert_eq!(mock.output_level(pins.shutter_outer), Some(Level::High));
        assert_eq!(driver.state(Shutter::Outer), ShutterState::Open);
        assert_eq!(driver.state(Shutter::Inner), ShutterState::Closed);
    }

    #[tokio::test]
    async fn test_close_releases_relay() {
        let (driver, mock, pins) = rig();
        driver.open(Shutter::Inner).await.unwrap();
        driver.close(Shutter::Inner).await.unwrap();
        assert_eq!(mock.output_level(pins.shutter_inner), Some(Level::Low));
        assert_eq!(driver.state(Shutter::Inner), ShutterState::Closed);
    }
}
