//! Cabinet mechanics for the bookmat vending cabinet.
//!
//! This crate is the hardware-facing half of the system: digital I/O,
//! limit-switch filtering, CoreXY kinematics and path planning, the
//! calibration document and its wizards, the INIT/TAKE/GIVE motion
//! algorithms, RFID identification, and the event bus the façade
//! subscribes to.
//!
//! Nothing here touches the database or the network; the transaction
//! layer in `bookmat-daemon` composes this crate with the store and the
//! library client.
//!
//! Host builds (the default) run entirely against in-memory mock
//! hardware. The `hardware` feature links the Raspberry Pi GPIO and
//! serial backends.

pub mod cabinet;
pub mod calibration;
pub mod events;
pub mod gpio;
pub mod kinematics;
pub mod motion;
pub mod motors;
pub mod planner;
pub mod rfid;
pub mod sensors;
pub mod servos;
pub mod shutters;

pub use cabinet::{CellCoord, Row};
pub use events::{Event, EventBus};
pub use motion::{Algorithms, MotionError, MotionOp, MotionState};
