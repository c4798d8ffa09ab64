//! Instrument drivers.
//!
//! Each driver owns the complete command vocabulary of one instrument and
//! exposes typed operations on top of it. All transport goes through the
//! [`InstrumentLink`](crate::link::InstrumentLink) the driver was built
//! with, so the same driver runs against real hardware or a simulator.

mod agilent4156c;
mod suss_pa300;

pub use agilent4156c::{
    Agilent4156C, ContactTestSpec, SmuFunction, SmuMode, SweepSpec, SweepTrace, MAX_SWEEP_POINTS,
};
pub use suss_pa300::{MotionSpeeds, SussPa300, ZSetpoints, ZState};
