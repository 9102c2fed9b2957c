//! In-memory GPIO backend for host builds and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{GpioBackend, GpioError, Level, Pin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PinMode {
    Output,
    Input,
}

/// How a mock input pin answers reads.
#[derive(Debug, Clone, Copy)]
enum InputModel {
    /// Fixed level.
    Level(Level),
    /// Deterministic duty cycle: `percent` of reads return HIGH, spread
    /// evenly (Bresenham accumulator). Models a floating optical slot.
    Duty { percent: u8, acc: u8 },
}

#[derive(Debug)]
struct PinSlot {
    mode: PinMode,
    level: Level,
    input: InputModel,
    /// Rising edges observed on this pin while configured as output.
    pulses: u64,
}

/// A rule arming an input once a step pin has emitted enough pulses.
///
/// This is how motion tests model the carriage reaching a limit switch:
/// after `after` pulses on `step_pin`, `input_pin` starts reading HIGH.
#[derive(Debug, Clone, Copy)]
struct PulseTrigger {
    step_pin: Pin,
    after: u64,
    input_pin: Pin,
}

/// Recording GPIO backend.
///
/// Tests drive inputs with [`set_input_level`](Self::set_input_level),
/// [`set_input_duty`](Self::set_input_duty) and
/// [`trigger_after_pulses`](Self::trigger_after_pulses), and observe
/// outputs with [`output_level`](Self::output_level) and
/// [`pulses_on`](Self::pulses_on).
#[derive(Default)]
pub struct MockGpio {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    pins: HashMap<Pin, PinSlot>,
    servo_pulse_widths: HashMap<Pin, u16>,
    triggers: Vec<PulseTrigger>,
}

impl MockGpio {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last level written to an output pin, if configured.
    #[must_use]
    pub fn output_level(&self, pin: Pin) -> Option<Level> {
        let state = self.inner.lock().expect("mock gpio state");
        state
            .pins
            .get(&pin)
            .filter(|slot| slot.mode == PinMode::Output)
            .map(|slot| slot.level)
    }

    /// Rising edges seen on an output pin since configuration.
    #[must_use]
    pub fn pulses_on(&self, pin: Pin) -> u64 {
        let state = self.inner.lock().expect("mock gpio state");
        state.pins.get(&pin).map_or(0, |slot| slot.pulses)
    }

    /// Last servo pulse width commanded on a pin, in microseconds.
    #[must_use]
    pub fn servo_pulse_width(&self, pin: Pin) -> Option<u16> {
        let state = self.inner.lock().expect("mock gpio state");
        state.servo_pulse_widths.get(&pin).copied()
    }

    /// Forces an input pin to a fixed level.
    pub fn set_input_level(&self, pin: Pin, level: Level) {
        let mut state = self.inner.lock().expect("mock gpio state");
        let slot = state.pins.entry(pin).or_insert_with(input_slot);
        slot.input = InputModel::Level(level);
    }

    /// Makes an input pin float: `percent` of reads come back HIGH.
    pub fn set_input_duty(&self, pin: Pin, percent: u8) {
        let mut state = self.inner.lock().expect("mock gpio state");
        let slot = state.pins.entry(pin).or_insert_with(input_slot);
        slot.input = InputModel::Duty {
            percent: percent.min(100),
            acc: 0,
        };
    }

    /// Arms `input_pin` to read HIGH once `step_pin` has pulsed `after`
    /// more times.
    pub fn trigger_after_pulses(&self, input_pin: Pin, step_pin: Pin, after: u64) {
        let mut state = self.inner.lock().expect("mock gpio state");
        let already = state.pins.get(&step_pin).map_or(0, |slot| slot.pulses);
        state.triggers.push(PulseTrigger {
            step_pin,
            after: already + after,
            input_pin,
        });
    }
}

fn input_slot() -> PinSlot {
    PinSlot {
        mode: PinMode::Input,
        level: Level::Low,
        input: InputModel::Level(Level::Low),
        pulses: 0,
    }
}

impl GpioBackend for MockGpio {
    fn setup_output(&self, pin: Pin) -> Result<(), GpioError> {
        let mut state = self.inner.lock().expect("mock gpio state");
        state.pins.insert(
            pin,
            PinSlot {
                mode: PinMode::Output,
                level: Level::Low,
                input: InputModel::Level(Level::Low),
                pulses: 0,
            },
        );
        Ok(())
    }

    fn setup_input(&self, pin: Pin, pull_up: bool) -> Result<(), GpioError> {
        let mut state = self.inner.lock().expect("mock gpio state");
        let slot = state.pins.entry(pin).or_insert_with(input_slot);
        slot.mode = PinMode::Input;
        // With the pull-up enabled an untouched input idles HIGH only on
        // real silicon; the mock keeps whatever model the test installed.
        let _ = pull_up;
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        let mut state = self.inner.lock().expect("mock gpio state");
        let slot = state.pins.get_mut(&pin).ok_or(GpioError::NotConfigured {
            pin,
            needed: "output",
        })?;
        if slot.mode != PinMode::Output {
            return Err(GpioError::NotConfigured {
                pin,
                needed: "output",
            });
        }
        if slot.level == Level::Low && level == Level::High {
            slot.pulses += 1;
        }
        slot.level = level;

        // Fire any armed limit-switch triggers.
        let pulses = slot.pulses;
        let fired: Vec<Pin> = state
            .triggers
            .iter()
            .filter(|t| t.step_pin == pin && pulses >= t.after)
            .map(|t| t.input_pin)
            .collect();
        if !fired.is_empty() {
            state
                .triggers
                .retain(|t| !(t.step_pin == pin && pulses >= t.after));
            for input_pin in fired {
                let slot = state.pins.entry(input_pin).or_insert_with(input_slot);
                slot.input = InputModel::Level(Level::High);
            }
        }
        Ok(())
    }

    fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        let mut state = self.inner.lock().expect("mock gpio state");
        let slot = state.pins.entry(pin).or_insert_with(input_slot);
        match slot.input {
            InputModel::Level(level) => Ok(level),
            InputModel::Duty {
                percent,
                ref mut acc,
            } => {
                let next = *acc + percent;
                if next >= 100 {
                    *acc = next - 100;
                    Ok(Level::High)
                } else {
                    *acc = next;
                    Ok(Level::Low)
                }
            }
        }
    }

    fn set_servo_pulse_width(&self, pin: Pin, micros: u16) -> Result<(), GpioError> {
        let mut state = self.inner.lock().expect("mock gpio state");
        state.servo_pulse_widths.insert(pin, micros);
        Ok(())
    }

    fn is_mock(&self) -> bool {
        true
    }
}
