//! Optical limit-switch filtering.
//!
//! The six TCST2103 slot sensors do not behave like clean switches: a
//! blocked slot presents a stable HIGH, but an open slot floats and reads
//! HIGH on roughly a third to two thirds of samples. A single read is
//! therefore meaningless. Each query oversamples the line, converts the
//! result to a percent-HIGH figure, applies hysteresis, and debounces the
//! claimed state over consecutive queries.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::gpio::{Gpio, GpioError, Pin, PinMap};

/// Samples taken per query.
pub const OVERSAMPLES: u32 = 50;
/// Percent-HIGH a channel must reach to claim "triggered".
pub const THRESHOLD_HIGH: f64 = 98.0;
/// Percent-HIGH a channel must fall to before claiming "clear".
pub const THRESHOLD_LOW: f64 = 95.0;
/// Consecutive identical computed states required to commit a transition.
pub const DEBOUNCE: u8 = 5;

/// One of the six limit switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorId {
    XBegin,
    XEnd,
    YBegin,
    YEnd,
    TrayBegin,
    TrayEnd,
}

impl SensorId {
    pub const ALL: [Self; 6] = [
        Self::XBegin,
        Self::XEnd,
        Self::YBegin,
        Self::YEnd,
        Self::TrayBegin,
        Self::TrayEnd,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::XBegin => "x_begin",
            Self::XEnd => "x_end",
            Self::YBegin => "y_begin",
            Self::YEnd => "y_end",
            Self::TrayBegin => "tray_begin",
            Self::TrayEnd => "tray_end",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::XBegin => 0,
            Self::XEnd => 1,
            Self::YBegin => 2,
            Self::YEnd => 3,
            Self::TrayBegin => 4,
            Self::TrayEnd => 5,
        }
    }
}

/// Filtered result of one query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    /// Debounced state.
    pub triggered: bool,
    /// Raw percent-HIGH of the last oversample window, for diagnostics.
    pub percent: f64,
}

/// Snapshot of all six debounced states.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub x_begin: bool,
    pub x_end: bool,
    pub y_begin: bool,
    pub y_end: bool,
    pub tray_begin: bool,
    pub tray_end: bool,
}

impl SensorSnapshot {
    #[must_use]
    pub fn get(&self, id: SensorId) -> bool {
        match id {
            SensorId::XBegin => self.x_begin,
            SensorId::XEnd => self.x_end,
            SensorId::YBegin => self.y_begin,
            SensorId::YEnd => self.y_end,
            SensorId::TrayBegin => self.tray_begin,
            SensorId::TrayEnd => self.tray_end,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    triggered: bool,
    /// Candidate state currently accumulating debounce confirmations.
    pending: bool,
    pending_count: u8,
    last_percent: f64,
}

/// Oversampling, hysteresis and debounce over the six limit switches.
pub struct SensorFilter {
    gpio: Arc<Gpio>,
    pins: [Pin; 6],
    channels: Mutex<[ChannelState; 6]>,
}

impl SensorFilter {
    /// Configures the six sensor pins as pulled-up inputs.
    pub fn new(gpio: Arc<Gpio>, pins: &PinMap) -> Result<Self, GpioError> {
        let pin_list = [
            pins.sensor_x_begin,
            pins.sensor_x_end,
            pins.sensor_y_begin,
            pins.sensor_y_end,
            pins.sensor_tray_begin,
            pins.sensor_tray_end,
        ];
        for pin in pin_list {
            gpio.setup_input(pin, true)?;
        }
        Ok(Self {
            gpio,
            pins: pin_list,
            channels: Mutex::new([ChannelState::default(); 6]),
        })
    }

    /// Runs one oversample window on a sensor and returns the filtered
    /// reading.
    pub fn read(&self, id: SensorId) -> Result<SensorReading, GpioError> {
        let pin = self.pins[id.index()];
        let mut highs = 0u32;
        for _ in 0..OVERSAMPLES {
            if self.gpio.read(pin)?.is_high() {
                highs += 1;
            }
        }
        let percent = f64::from(highs) * 100.0 / f64::from(OVERSAMPLES);

        let mut channels = self.channels.lock().expect("sensor channel state");
        let channel = &mut channels[id.index()];
        channel.last_percent = percent;

        // Hysteresis: inside the dead band the computed state is whatever
        // we last committed.
        let computed = if percent >= THRESHOLD_HIGH {
            true
        } else if percent <= THRESHOLD_LOW {
            false
        } else {
            channel.triggered
        };

        if computed == channel.triggered {
            channel.pending_count = 0;
        } else if computed == channel.pending && channel.pending_count > 0 {
            channel.pending_count += 1;
            if channel.pending_count >= DEBOUNCE {
                tracing::debug!(
                    sensor = id.as_str(),
                    triggered = computed,
                    percent,
                    "limit switch transition"
                );
                channel.triggered = computed;
                channel.pending_count = 0;
            }
        } else {
            channel.pending = computed;
            channel.pending_count = 1;
        }

        Ok(SensorReading {
            triggered: channel.triggered,
            percent,
        })
    }

    /// Reads all six channels.
    pub fn snapshot(&self) -> Result<SensorSnapshot, GpioError> {
        Ok(SensorSnapshot {
            x_begin: self.read(SensorId::XBegin)?.triggered,
            x_end: self.read(SensorId::XEnd)?.triggered,
            y_begin: self.read(SensorId::YBegin)?.triggered,
            y_end: self.read(SensorId::YEnd)?.triggered,
            tray_begin: self.read(SensorId::TrayBegin)?.triggered,
            tray_end: self.read(SensorId::TrayEnd)?.triggered,
        })
    }

    pub fn is_tray_retracted(&self) -> Result<bool, GpioError> {
        Ok(self.read(SensorId::TrayBegin)?.triggered)
    }

    pub fn is_tray_extended(&self) -> Result<bool, GpioError> {
        Ok(self.read(SensorId::TrayEnd)?.triggered)
    }

    pub fn is_at_home(&self) -> Result<bool, GpioError> {
        Ok(self.read(SensorId::XBegin)?.triggered && self.read(SensorId::YBegin)?.triggered)
    }

    pub fn is_at_x_end(&self) -> Result<bool, GpioError> {
        Ok(self.read(SensorId::XEnd)?.triggered)
    }

    pub fn is_at_y_end(&self) -> Result<bool, GpioError> {
        Ok(self.read(SensorId::YEnd)?.triggered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::{Level, MockGpio};

    fn filter_with_mock() -> (SensorFilter, Arc<MockGpio>) {
        let (gpio, mock) = Gpio::mock();
        let pins = PinMap::default();
        let filter = SensorFilter::new(gpio, &pins).unwrap();
        (filter, mock)
    }

    #[test]
    fn test_floating_slot_never_triggers() {
        let (filter, mock) = filter_with_mock();
        // An open slot floats around half HIGH, far under the 98% bar.
        mock.set_input_duty(PinMap::default().sensor_x_begin, 55);
        for _ in 0..20 {
            let reading = filter.read(SensorId::XBegin).unwrap();
            assert!(!reading.triggered);
        }
    }

    #[test]
    fn test_stable_high_triggers_after_debounce() {
        let (filter, mock) = filter_with_mock();
        mock.set_input_level(PinMap::default().sensor_x_begin, Level::High);

        // Four confirmations are not enough.
        for _ in 0..DEBOUNCE - 1 {
            assert!(!filter.read(SensorId::XBegin).unwrap().triggered);
        }
        // The fifth commits.
        assert!(filter.read(SensorId::XBegin).unwrap().triggered);
    }

    #[test]
    fn test_hysteresis_band_holds_state() {
        let (filter, mock) = filter_with_mock();
        let pin = PinMap::default().sensor_y_end;
        mock.set_input_level(pin, Level::High);
        for _ in 0..DEBOUNCE {
            filter.read(SensorId::YEnd).unwrap();
        }
        assert!(filter.read(SensorId::YEnd).unwrap().triggered);

        // 96% sits between the clear (95) and trigger (98) thresholds:
        // the committed state must not move.
        mock.set_input_duty(pin, 96);
        for _ in 0..20 {
            assert!(filter.read(SensorId::YEnd).unwrap().triggered);
        }

        // Dropping under 95% clears after the debounce run.
        mock.set_input_level(pin, Level::Low);
        for _ in 0..DEBOUNCE {
            filter.read(SensorId::YEnd).unwrap();
        }
        assert!(!filter.read(SensorId::YEnd).unwrap().triggered);
    }

    #[test]
    fn test_interrupted_debounce_restarts() {
        let (filter, mock) = filter_with_mock();
        let pin = PinMap::default().sensor_tray_end;

        mock.set_input_level(pin, Level::High);
        for _ in 0..DEBOUNCE - 2 {
            filter.read(SensorId::TrayEnd).unwrap();
        }
        // One clear read resets the counter.
        mock.set_input_level(pin, Level::Low);
        filter.read(SensorId::TrayEnd).unwrap();
        mock.set_input_level(pin, Level::High);
        for _ in 0..DEBOUNCE - 1 {
            assert!(!filter.read(SensorId::TrayEnd).unwrap().triggered);
        }
        assert!(filter.read(SensorId::TrayEnd).unwrap().triggered);
    }

    #[test]
    fn test_home_query_needs_both_axes() {
        let (filter, mock) = filter_with_mock();
        let pins = PinMap::default();
        mock.set_input_level(pins.sensor_x_begin, Level::High);
        mock.set_input_level(pins.sensor_y_begin, Level::Low);
        for _ in 0..DEBOUNCE + 1 {
            filter.read(SensorId::XBegin).unwrap();
        }
        assert!(!filter.is_at_home().unwrap());

        mock.set_input_level(pins.sensor_y_begin, Level::High);
        for _ in 0..DEBOUNCE + 1 {
            filter.read(SensorId::YBegin).unwrap();
        }
        assert!(filter.is_at_home().unwrap());
    }

    #[test]
    fn test_raw_percentage_reported() {
        let (filter, mock) = filter_with_mock();
        mock.set_input_duty(PinMap::default().sensor_x_end, 40);
        let reading = filter.read(SensorId::XEnd).unwrap();
        assert!((reading.percent - 40.0).abs() < 3.0);
    }
}
