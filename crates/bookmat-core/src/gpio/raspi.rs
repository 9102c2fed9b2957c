//! Raspberry Pi GPIO backend over `rppal`.
//!
//! Only compiled with the `hardware` feature. Servo pulses use software
//! PWM on the latch pins; the 50 Hz period matches hobby-servo timing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rppal::gpio::{Gpio as Controller, InputPin, OutputPin};

use super::{GpioBackend, GpioError, Level, Pin};

const SERVO_PERIOD: Duration = Duration::from_millis(20);

enum Slot {
    Output(OutputPin),
    Input(InputPin),
}

/// Backend over the Pi's BCM GPIO controller.
pub struct RaspiGpio {
    controller: Controller,
    slots: Mutex<HashMap<Pin, Slot>>,
}

impl RaspiGpio {
    /// Opens the GPIO controller.
    ///
    /// # Errors
    ///
    /// Fails when `/dev/gpiomem` is unavailable or permission is denied.
    pub fn open() -> Result<Self, GpioError> {
        let controller = Controller::new().map_err(|e| GpioError::Backend {
            pin: 0,
            message: e.to_string(),
        })?;
        Ok(Self {
            controller,
            slots: Mutex::new(HashMap::new()),
        })
    }

    fn get_pin(&self, pin: Pin) -> Result<rppal::gpio::Pin, GpioError> {
        self.controller.get(pin).map_err(|e| GpioError::Backend {
            pin,
            message: e.to_string(),
        })
    }
}

impl GpioBackend for RaspiGpio {
    fn setup_output(&self, pin: Pin) -> Result<(), GpioError> {
        let mut out = self.get_pin(pin)?.into_output();
        out.set_low();
        self.slots
            .lock()
            .expect("raspi gpio slots")
            .insert(pin, Slot::Output(out));
        Ok(())
    }

    fn setup_input(&self, pin: Pin, pull_up: bool) -> Result<(), GpioError> {
        let raw = self.get_pin(pin)?;
        let input = if pull_up {
            raw.into_input_pullup()
        } else {
            raw.into_input_pulldown()
        };
        self.slots
            .lock()
            .expect("raspi gpio slots")
            .insert(pin, Slot::Input(input));
        Ok(())
    }

    fn write(&self, pin: Pin, level: Level) -> Result<(), GpioError> {
        let mut slots = self.slots.lock().expect("raspi gpio slots");
        match slots.get_mut(&pin) {
            Some(Slot::Output(out)) => {
                match level {
                    Level::High => out.set_high(),
                    Level::Low => out.set_low(),
                }
                Ok(())
            }
            _ => Err(GpioError::NotConfigured {
                pin,
                needed: "output",
            }),
        }
    }

    fn read(&self, pin: Pin) -> Result<Level, GpioError> {
        let slots = self.slots.lock().expect("raspi gpio slots");
        match slots.get(&pin) {
            Some(Slot::Input(input)) => Ok(Level::from(input.is_high())),
            _ => Err(GpioError::NotConfigured {
                pin,
                needed: "input",
            }),
        }
    }

    fn set_servo_pulse_width(&self, pin: Pin, micros: u16) -> Result<(), GpioError> {
        let mut slots = self.slots.lock().expect("raspi gpio slots");
        match slots.get_mut(&pin) {
            Some(Slot::Output(out)) => {
                let result = if micros == 0 {
                    out.clear_pwm()
                } else {
                    out.set_pwm(SERVO_PERIOD, Duration::from_micros(u64::from(micros)))
                };
                result.map_err(|e| GpioError::Backend {
                    pin,
                    message: e.to_string(),
                })
            }
            _ => Err(GpioError::NotConfigured {
                pin,
                needed: "output",
            }),
        }
    }
}
