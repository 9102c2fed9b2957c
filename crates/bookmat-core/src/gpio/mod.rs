//! Digital I/O abstraction.
//!
//! Every hardware driver in this crate talks to pins through the
//! [`GpioBackend`] trait. On the cabinet itself the backend is the
//! Raspberry Pi controller (feature `hardware`); on a development host it
//! is [`MockGpio`], which records pin state and lets tests inject sensor
//! readings and observe writes.
//!
//! The [`Gpio`] handle owns the backend for the lifetime of the process.
//! [`Gpio::teardown`] is idempotent and leaves every configured output
//! driven LOW, so a crash-restart never inherits a live motor coil or an
//! energized relay.

mod mock;
#[cfg(feature = "hardware")]
mod raspi;

pub use mock::MockGpio;
#[cfg(feature = "hardware")]
pub use raspi::RaspiGpio;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// BCM pin number.
pub type Pin = u8;

/// Digital line level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

impl Level {
    #[must_use]
    pub const fn is_high(self) -> bool {
        matches!(self, Self::High)
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Self::High } else { Self::Low }
    }
}

/// Errors surfaced by a GPIO backend.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GpioError {
    /// The pin was used before being configured.
    #[error("pin {pin} is not configured for {needed}")]
    NotConfigured {
        pin: Pin,
        /// `"output"` or `"input"`.
        needed: &'static str,
    },

    /// The controller rejected the operation.
    #[error("gpio backend failure on pin {pin}: {message}")]
    Backend { pin: Pin, message: String },

    /// The handle was used after [`Gpio::teardown`].
    #[error("gpio is not initialized")]
    NotInitialized,
}

/// Low-level pin operations implemented by each backend.
pub trait GpioBackend: Send + Sync {
    /// Configures a pin as a push-pull output, initially LOW.
    fn setup_output(&self, pin: Pin) -> Result<(), GpioError>;

    /// Configures a pin as an input, optionally with the internal pull-up.
    fn setup_input(&self, pin: Pin, pull_up: bool) -> Result<(), GpioError>;

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError>;

    fn read(&self, pin: Pin) -> Result<Level, GpioError>;

    /// Drives a servo pulse train of the given width; `0` releases the line.
    fn set_servo_pulse_width(&self, pin: Pin, micros: u16) -> Result<(), GpioError>;

    /// True when levels are simulated and inter-pulse delays may be elided.
    fn is_mock(&self) -> bool {
        false
    }
}

/// BCM pin assignment for the cabinet controller board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMap {
    pub motor_a_step: Pin,
    pub motor_a_dir: Pin,
    pub motor_b_step: Pin,
    pub motor_b_dir: Pin,
    pub tray_step: Pin,
    pub tray_dir: Pin,
    pub servo_lock1: Pin,
    pub servo_lock2: Pin,
    pub shutter_outer: Pin,
    pub shutter_inner: Pin,
    pub sensor_x_begin: Pin,
    pub sensor_x_end: Pin,
    pub sensor_y_begin: Pin,
    pub sensor_y_end: Pin,
    pub sensor_tray_begin: Pin,
    pub sensor_tray_end: Pin,
}

impl Default for PinMap {
    /// Wiring of the expansion board as found by the bring-up scan.
    fn default() -> Self {
        Self {
            motor_a_step: 2,
            motor_a_dir: 3,
            motor_b_step: 19,
            motor_b_dir: 21,
            tray_step: 18,
            tray_dir: 27,
            servo_lock1: 12,
            servo_lock2: 13,
            shutter_outer: 14,
            shutter_inner: 15,
            sensor_x_begin: 9,
            sensor_x_end: 10,
            sensor_y_begin: 8,
            sensor_y_end: 11,
            sensor_tray_begin: 7,
            sensor_tray_end: 20,
        }
    }
}

/// Owning handle over a [`GpioBackend`].
///
/// Construct one per process, wrap it in an `Arc`, and hand it to the
/// motor, latch, shutter, and sensor drivers. Only those drivers write
/// through it.
pub struct Gpio {
    backend: Arc<dyn GpioBackend>,
    outputs: Mutex<BTreeSet<Pin>>,
    initialized: AtomicBool,
}

impl Gpio {
    /// Wraps a backend. The handle starts initialized.
    #[must_use]
    pub fn new(backend: Arc<dyn GpioBackend>) -> Self {
        Self {
            backend,
            outputs: Mutex::new(BTreeSet::new()),
            initialized: AtomicBool::new(true),
        }
    }

    /// A handle over a fresh [`MockGpio`], returning both.
    #[must_use]
    pub fn mock() -> (Arc<Self>, Arc<MockGpio>) {
        let mock = Arc::new(MockGpio::new());
        let gpio = Arc::new(Self::new(mock.clone()));
        (gpio, mock)
    }

    #[must_use]
    pub fn is_mock(&self) -> bool {
        self.backend.is_mock()
    }

    fn ensure_initialized(&self) -> Result<(), GpioError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GpioError::NotInitialized)
        }
    }

    pub fn setup_output(&self, pin: Pin) -> Result<(), GpioError> {
        self.ensure_initialized()?;
        self.backend.setup_output(pin)?;
        self.outputs.lock().expect("gpio output set").insert(pin);
        Ok(())
    }

    pub fn setup_input(&self, pin: Pin, pull_up: bool) -> Result<(), GpioError> {
        self.ensure_initialized()?;
        self.backend.setup_input(pin, pull_up)
    }

    pub fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        self.ensure_initialized()?;
        self.backend.write(pin, level)
    }

    pub fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        self.ensure_initialized()?;
        self.backend.read(pin)
    }

    pub fn set_servo_pulse_width(&self, pin: Pin, micros: u16) -> Result<(), GpioError> {
        self.ensure_initialized()?;
        self.backend.set_servo_pulse_width(pin, micros)
    }

    /// Emits `count` pulses on `pin` with `delay_us` between edges.
    ///
    /// Mock backends skip the delays; the task still yields so concurrent
    /// tasks (sensor injection in tests, the card poll loops) make
    /// progress during a long burst.
    pub async fn pulse(&self, pin: Pin, count: u32, delay_us: u64) -> Result<(), GpioError> {
        self.ensure_initialized()?;
        let delay = Duration::from_micros(delay_us);
        let sleep = !self.backend.is_mock();
        for i in 0..count {
            self.backend.write(pin, Level::High)?;
            if sleep {
                tokio::time::sleep(delay).await;
            }
            self.backend.write(pin, Level::Low)?;
            if sleep {
                tokio::time::sleep(delay).await;
            } else if i % 64 == 0 {
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    }

    /// Drives every configured output LOW and releases the handle.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn teardown(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }
        let outputs = self.outputs.lock().expect("gpio output set");
        for &pin in outputs.iter() {
            if let Err(err) = self.backend.write(pin, Level::Low) {
                tracing::warn!(pin, %err, "failed to park output during teardown");
            }
        }
    }
}

impl Drop for Gpio {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teardown_parks_outputs_low() {
        let (gpio, mock) = Gpio::mock();
        gpio.setup_output(5).unwrap();
        gpio.write(5, Level::High).unwrap();
        assert_eq!(mock.output_level(5), Some(Level::High));

        gpio.teardown();
        assert_eq!(mock.output_level(5), Some(Level::Low));
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let (gpio, _mock) = Gpio::mock();
        gpio.setup_output(5).unwrap();
        gpio.teardown();
        gpio.teardown();
        assert!(matches!(
            gpio.write(5, Level::High),
            Err(GpioError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_pulse_counts_rising_edges() {
        let (gpio, mock) = Gpio::mock();
        gpio.setup_output(4).unwrap();
        gpio.pulse(4, 10, 125).await.unwrap();
        assert_eq!(mock.pulses_on(4), 10);
    }

    #[test]
    fn test_write_requires_configuration() {
        let (gpio, _mock) = Gpio::mock();
        assert!(matches!(
            gpio.write(17, Level::High),
            Err(GpioError::NotConfigured { pin: 17, .. })
        ));
    }
}
