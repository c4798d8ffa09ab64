//! SUSS PA300 wafer prober driver
//!
//! This module provides the motion controller for the prober: a small
//! state machine over the chuck's Z axis (separate / align / contact)
//! plus guarded XY travel. Every move re-checks the system status and the
//! Center-frame travel limits, because an out-of-limit chuck can drive
//! the probe tip into the substrate.
//!
//! ## Configuration
//!
//! ```toml
//! [prober]
//! resource = "GPIB0::7::INSTR"
//! contact_z_um = 12000.0
//! safe_move_threshold_um = 3000.0
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::coord::{AxisLimits, CoordinateFrame, Position};
use crate::error::{ProbeError, Result};
use crate::link::InstrumentLink;

/// Substring the prober's `*IDN?` response must contain.
const IDENTITY_SUBSTRING: &str = "Suss MicroTec Test Systems GmbH,ProberBench PC";

/// Half-width of the window in which a Z reading counts as a setpoint, µm.
const SNAP_TOLERANCE_UM: f64 = 1.0;

/// Lateral distance above which `safe_move` fully separates first, µm.
const SAFE_MOVE_THRESHOLD_UM: f64 = 3000.0;

/// Named Z heights of the chuck, µm in the Home frame.
///
/// Align and Separate are derived offsets below Contact; the spacing is a
/// property of the probe card, not of the device under test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZSetpoints {
    pub contact: f64,
    pub align: f64,
    pub separate: f64,
}

impl ZSetpoints {
    /// Standard spacing: Align 100 µm and Separate 300 µm below Contact.
    pub fn from_contact(contact: f64) -> Self {
        Self {
            contact,
            align: contact - 100.0,
            separate: contact - 300.0,
        }
    }

    /// Collapse `z` onto a setpoint when it is within the snap window.
    ///
    /// The prober settles within a fraction of a micron of the commanded
    /// height; snapping keeps the state machine's comparisons exact.
    pub fn snap(&self, z: f64) -> f64 {
        for setpoint in [self.contact, self.align, self.separate] {
            if (z - setpoint).abs() < SNAP_TOLERANCE_UM {
                return setpoint;
            }
        }
        z
    }

    /// Classify a Z reading.
    pub fn state_of(&self, z: f64) -> ZState {
        let z = self.snap(z);
        if z == self.contact {
            ZState::Contact
        } else if z == self.align {
            ZState::Align
        } else if z == self.separate {
            ZState::Separate
        } else {
            ZState::Unknown
        }
    }
}

impl Default for ZSetpoints {
    fn default() -> Self {
        Self::from_contact(12_000.0)
    }
}

/// Z-axis state of the chuck relative to the named setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZState {
    Separate,
    Align,
    Contact,
    /// Any height outside the snap window of every setpoint.
    Unknown,
}

impl std::fmt::Display for ZState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ZState::Separate => "separate",
            ZState::Align => "align",
            ZState::Contact => "contact",
            ZState::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Chuck velocities in prober velocity units.
///
/// Fast is for fully separated travel, medium for approach legs, slow for
/// the final settle into contact and short align-height moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MotionSpeeds {
    pub fast: u32,
    pub medium: u32,
    pub slow: u32,
}

impl Default for MotionSpeeds {
    fn default() -> Self {
        Self {
            fast: 20,
            medium: 5,
            slow: 1,
        }
    }
}

/// Driver for the PA300 motion controller.
///
/// All motion entry points re-read the instrument rather than trusting
/// cached positions: the Home/Zero/Center frame offsets drift with stage
/// state, so conversions are only valid against fresh readings.
pub struct SussPa300 {
    link: Arc<dyn InstrumentLink>,
    limits: AxisLimits,
    setpoints: ZSetpoints,
    speeds: MotionSpeeds,
    safe_move_threshold_um: f64,
}

impl SussPa300 {
    pub fn new(link: Arc<dyn InstrumentLink>) -> Self {
        Self {
            link,
            limits: AxisLimits::default(),
            setpoints: ZSetpoints::default(),
            speeds: MotionSpeeds::default(),
            safe_move_threshold_um: SAFE_MOVE_THRESHOLD_UM,
        }
    }

    pub fn with_limits(mut self, limits: AxisLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_setpoints(mut self, setpoints: ZSetpoints) -> Self {
        self.setpoints = setpoints;
        self
    }

    pub fn with_speeds(mut self, speeds: MotionSpeeds) -> Self {
        self.speeds = speeds;
        self
    }

    pub fn with_safe_move_threshold(mut self, micrometers: f64) -> Self {
        self.safe_move_threshold_um = micrometers;
        self
    }

    /// Z setpoints this driver moves between.
    pub fn setpoints(&self) -> ZSetpoints {
        self.setpoints
    }

    /// Verify the instrument identity and that the prober is healthy.
    pub async fn connect(&self) -> Result<()> {
        let idn = self.link.query("*IDN?").await?;
        if !idn.contains(IDENTITY_SUBSTRING) {
            return Err(ProbeError::IdentityMismatch(idn));
        }
        info!(%idn, "prober connected");
        self.check_status().await
    }

    /// Query the system status and confirm the chuck is inside its limits.
    ///
    /// A non-zero status code or an out-of-limit Center-frame position is
    /// fatal; continuing to move could crash the probe.
    pub async fn check_status(&self) -> Result<()> {
        // Response example: "0: PA300PS_ 5 1 1 1 0 0 0 0 0"
        let status = self.link.query("ReadSystemStatus").await?;
        if status.split(':').next() != Some("0") {
            return Err(ProbeError::InstrumentFault(format!(
                "prober status: {status}"
            )));
        }
        let position = self.read_position(CoordinateFrame::Center).await?;
        if !self.limits.contains(position.x, position.y, position.z) {
            return Err(ProbeError::LimitExceeded(format!(
                "chuck at ({}, {}, {}) µm in the Center frame",
                position.x, position.y, position.z
            )));
        }
        Ok(())
    }

    /// Read the chuck position in `frame`. Always a fresh query.
    pub async fn read_position(&self, frame: CoordinateFrame) -> Result<Position> {
        let command = format!("ReadChuckPosition Y {} D", frame.code());
        let response = self.link.query(&command).await?;
        // "0: 0.0 -0.5 -300.08" -> skip the status token
        let fields: std::result::Result<Vec<f64>, _> = response
            .split_whitespace()
            .skip(1)
            .map(str::parse)
            .collect();
        match fields.ok().as_deref() {
            Some(&[x, y, z]) => Ok(Position::new(x, y, z, frame)),
            _ => Err(ProbeError::Communication(format!(
                "malformed position response: {response}"
            ))),
        }
    }

    /// Chuck height in the Home frame, snapped to the nearest setpoint
    /// when within the snap window.
    pub async fn read_z(&self) -> Result<f64> {
        let position = self.read_position(CoordinateFrame::Home).await?;
        Ok(self.setpoints.snap(position.z))
    }

    /// Current Z state of the chuck.
    pub async fn z_state(&self) -> Result<ZState> {
        Ok(self.setpoints.state_of(self.read_z().await?))
    }

    /// Express an XY target given in `frame` in Center coordinates.
    ///
    /// Frame offsets are measured by reading the current position in both
    /// frames back to back; they are never cached.
    async fn convert_to_center(&self, frame: CoordinateFrame, x: f64, y: f64) -> Result<(f64, f64)> {
        if frame == CoordinateFrame::Center {
            return Ok((x, y));
        }
        let from = self.read_position(frame).await?;
        let to = self.read_position(CoordinateFrame::Center).await?;
        Ok((x + (to.x - from.x), y + (to.y - from.y)))
    }

    /// Move the chuck laterally to `(x, y)` in `frame`.
    ///
    /// The target is limit-checked in Center coordinates before the move
    /// is issued, and the system status is re-checked after it completes.
    pub async fn move_xy(
        &self,
        frame: CoordinateFrame,
        x: f64,
        y: f64,
        velocity: u32,
    ) -> Result<()> {
        let (cx, cy) = self.convert_to_center(frame, x, y).await?;
        if !self.limits.contains_xy(cx, cy) {
            return Err(ProbeError::LimitExceeded(format!(
                "XY target ({cx}, {cy}) µm outside stage limits"
            )));
        }
        debug!(x = cx, y = cy, velocity, "chuck XY move");
        // The move acknowledges on the query channel; the ack body carries
        // no information beyond having arrived.
        self.link
            .query(&format!("MoveChuck {cx} {cy} C Y {velocity}"))
            .await?;
        self.check_status().await
    }

    /// Move the chuck to height `z`, checking status before and after.
    async fn move_z(&self, velocity: u32, z: f64) -> Result<()> {
        if !self.limits.contains_z(z) {
            return Err(ProbeError::LimitExceeded(format!(
                "Z target {z} µm outside travel limits"
            )));
        }
        self.check_status().await?;
        debug!(z, velocity, "chuck Z move");
        self.link
            .query(&format!("MoveChuckZ {z} Z Y {velocity}"))
            .await?;
        self.check_status().await
    }

    /// Raise the chuck to the Separate height; no-op if already at or
    /// above it.
    pub async fn approach_separate(&self) -> Result<()> {
        if self.read_z().await? >= self.setpoints.separate {
            debug!("already at or above separate height");
            return Ok(());
        }
        self.move_z(self.speeds.fast, self.setpoints.separate).await
    }

    /// Raise the chuck to the Align height, passing through Separate.
    pub async fn approach_align(&self) -> Result<()> {
        if self.read_z().await? >= self.setpoints.align {
            debug!("already at or above align height");
            return Ok(());
        }
        self.approach_separate().await?;
        self.move_z(self.speeds.medium, self.setpoints.align).await
    }

    /// Raise the chuck into Contact, passing through Align.
    pub async fn contact(&self) -> Result<()> {
        if self.read_z().await? >= self.setpoints.contact {
            debug!("already at contact height");
            return Ok(());
        }
        self.approach_align().await?;
        self.move_z(self.speeds.slow, self.setpoints.contact).await
    }

    /// Lower the chuck to the Align height; no-op if already at or below.
    pub async fn separate_align(&self) -> Result<()> {
        if self.read_z().await? <= self.setpoints.align {
            debug!("already at or below align height");
            return Ok(());
        }
        self.move_z(self.speeds.slow, self.setpoints.align).await
    }

    /// Lower the chuck to the Separate height; no-op if already at or
    /// below.
    pub async fn separate_separate(&self) -> Result<()> {
        if self.read_z().await? <= self.setpoints.separate {
            debug!("already at or below separate height");
            return Ok(());
        }
        self.move_z(self.speeds.medium, self.setpoints.separate)
            .await
    }

    /// Move laterally with the probe lifted to a height matched to the
    /// travel distance.
    ///
    /// Long moves fully separate and travel fast; short hops only drop to
    /// the align height and creep, which skips the full separate /
    /// re-approach settle.
    pub async fn safe_move(&self, frame: CoordinateFrame, x: f64, y: f64) -> Result<()> {
        let current = self.read_position(frame).await?;
        let distance = (x - current.x).hypot(y - current.y);
        if distance > self.safe_move_threshold_um {
            self.separate_separate().await?;
            self.move_xy(frame, x, y, self.speeds.fast).await
        } else {
            self.separate_align().await?;
            self.move_xy(frame, x, y, self.speeds.slow).await
        }
    }

    /// `safe_move` followed by `contact`: the per-device entry point.
    pub async fn safe_move_contact(&self, frame: CoordinateFrame, x: f64, y: f64) -> Result<()> {
        self.safe_move(frame, x, y).await?;
        self.contact().await
    }
}
