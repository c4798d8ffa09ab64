//! Instrument transport layer.
//!
//! Drivers talk to hardware through [`InstrumentLink`], a thin query/write
//! channel carrying SCPI-style command strings. Two implementations exist:
//! a VISA-backed transport for real instruments (behind the
//! `instrument_visa` feature) and deterministic simulators for development
//! and tests. The transport is chosen once at construction; drivers never
//! branch on which kind they hold.

mod sim;
mod visa;

pub use sim::{SimulatedAnalyzer, SimulatedProber};
pub use visa::VisaLink;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// Query/write channel to a single instrument.
///
/// `query` is used for every exchange that produces a response, including
/// prober motion commands, which acknowledge with a status line that the
/// driver reads and discards. `command` is write-only and used for the
/// analyzer's page-setup traffic.
#[async_trait]
pub trait InstrumentLink: Send + Sync {
    /// Send `command` and read back one response line.
    async fn query(&self, command: &str) -> Result<String>;

    /// Send `command` without reading a response.
    async fn command(&self, command: &str) -> Result<()>;
}

/// Shared handle to a link, as held by instrument drivers.
pub type SharedLink = Arc<dyn InstrumentLink>;
