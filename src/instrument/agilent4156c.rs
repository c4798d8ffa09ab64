//! Agilent/HP 4156C precision semiconductor parameter analyzer driver
//!
//! Implements the double-sweep I/V measurement and the sampling-mode
//! contact test over the 4156C's `:PAGE` command tree. Sweep parameters
//! are validated before any command is issued, and returned traces are
//! screened for the off-scale sentinel the instrument emits for points it
//! never measured.
//!
//! ## Configuration
//!
//! ```toml
//! [analyzer]
//! resource = "GPIB0::2::INSTR"
//!
//! [sweep]
//! ground_smu = 2
//! sweep_smu = 1
//! display_current = 10e-6
//! compliance_current = 10e-3
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ProbeError, Result};
use crate::link::InstrumentLink;
use crate::timeseries::TimedSeries;

/// Substring the analyzer's `*IDN?` response must contain.
const IDENTITY_SUBSTRING: &str = "HEWLETT-PACKARD,4156C";

/// Value the 4156C reports for buffer slots it never measured.
const SENTINEL: f64 = 9.91e307;

/// Per-leg point capacity of the sweep buffer.
pub const MAX_SWEEP_POINTS: u32 = 1001;

/// Point capacity of the sampling buffer.
const MAX_SAMPLING_POINTS: u32 = 8000;

/// Format a number the way the 4156C front panel expects.
///
/// Plain decimal notation inside the instrument's comfortable range,
/// exponent notation with a signed two-digit exponent outside it.
fn scpi_num(value: f64) -> String {
    if value != 0.0 && (value.abs() < 1e-4 || value.abs() >= 1e16) {
        let formatted = format!("{value:e}");
        match formatted.split_once('e') {
            Some((mantissa, exponent)) => {
                let (sign, digits) = match exponent.strip_prefix('-') {
                    Some(rest) => ("-", rest),
                    None => ("+", exponent),
                };
                format!("{mantissa}e{sign}{digits:0>2}")
            }
            None => formatted,
        }
    } else {
        format!("{value}")
    }
}

fn without_sentinels(values: &[f64]) -> Vec<f64> {
    values.iter().copied().filter(|v| *v != SENTINEL).collect()
}

/// Build a sweep trace from the raw voltage and current buffers.
///
/// A hardware abort leaves trailing sentinels on both channels, so a
/// shorter filtered voltage array marks the trace as aborted. If the
/// arrays still disagree after filtering both, the data cannot be paired
/// and is discarded.
fn assemble_trace(raw_voltages: Vec<f64>, raw_currents: Vec<f64>) -> Result<SweepTrace> {
    let voltages = without_sentinels(&raw_voltages);
    let aborted = voltages.len() != raw_currents.len();
    let currents = without_sentinels(&raw_currents);
    if voltages.len() != currents.len() {
        return Err(ProbeError::DataIntegrity {
            voltages: voltages.len(),
            currents: currents.len(),
        });
    }
    Ok(SweepTrace {
        voltages,
        currents,
        aborted,
    })
}

/// Electrical mode of an SMU channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmuMode {
    Voltage,
    Current,
    Common,
}

impl SmuMode {
    fn code(self) -> &'static str {
        match self {
            SmuMode::Voltage => "V",
            SmuMode::Current => "I",
            SmuMode::Common => "COMM",
        }
    }
}

/// Measurement function of an SMU channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmuFunction {
    Constant,
    Var1,
    Var2,
}

impl SmuFunction {
    fn code(self) -> &'static str {
        match self {
            SmuFunction::Constant => "CONS",
            SmuFunction::Var1 => "VAR1",
            SmuFunction::Var2 => "VAR2",
        }
    }
}

/// Parameters of one double sweep from zero.
///
/// The sweep runs `0 → end_voltage → 0` in `step_voltage` increments on
/// `sweep_smu`, with `ground_smu` tied to common. Negative end voltages
/// sweep downward; the step sign is corrected to match automatically.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    pub ground_smu: u8,
    pub sweep_smu: u8,
    pub end_voltage: f64,
    pub step_voltage: f64,
    /// Full-scale current for the instrument's on-screen Y1 axis.
    pub display_current: f64,
    pub compliance_current: f64,
}

impl Default for SweepSpec {
    fn default() -> Self {
        Self {
            ground_smu: 2,
            sweep_smu: 1,
            end_voltage: 1.0,
            step_voltage: 0.01,
            display_current: 10e-6,
            compliance_current: 10e-3,
        }
    }
}

/// Result of a double sweep, sentinel-filtered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepTrace {
    pub voltages: Vec<f64>,
    pub currents: Vec<f64>,
    /// True when the instrument stopped early and padded the buffers.
    pub aborted: bool,
}

impl SweepTrace {
    pub fn len(&self) -> usize {
        self.voltages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltages.is_empty()
    }
}

/// Parameters of a sampling-mode contact test.
///
/// Holds a constant bias on `bias_smu` and records the current at fixed
/// intervals; the derived `R = V/I` user function makes contact quality
/// visible on the instrument screen while the operator adjusts the probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactTestSpec {
    pub ground_smu: u8,
    pub bias_smu: u8,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub bias_voltage: f64,
    pub compliance_current: f64,
}

impl Default for ContactTestSpec {
    fn default() -> Self {
        Self {
            ground_smu: 2,
            bias_smu: 1,
            sample_interval: Duration::from_millis(100),
            duration: Duration::from_secs(10),
            bias_voltage: 0.1,
            compliance_current: 10e-3,
        }
    }
}

/// Driver for the 4156C parameter analyzer.
pub struct Agilent4156C {
    link: Arc<dyn InstrumentLink>,
}

impl Agilent4156C {
    pub fn new(link: Arc<dyn InstrumentLink>) -> Self {
        Self { link }
    }

    /// Verify the instrument identity, reset it and clear the error queue.
    pub async fn connect(&self) -> Result<()> {
        let idn = self.link.query("*IDN?").await?;
        if !idn.contains(IDENTITY_SUBSTRING) {
            return Err(ProbeError::IdentityMismatch(idn));
        }
        info!(%idn, "analyzer connected");
        self.link.command("*RST").await?;
        self.link.command("*CLS").await?;
        self.check_error().await
    }

    /// Pop the error queue and fail on anything but "+0, No error".
    pub async fn check_error(&self) -> Result<()> {
        let response = self.link.query("SYST:ERR?").await?;
        if response.split(',').next() != Some("+0") {
            return Err(ProbeError::InstrumentFault(format!(
                "analyzer error queue: {response}"
            )));
        }
        Ok(())
    }

    /// Name and configure one SMU channel. Voltage and current channel
    /// names are derived from the unit number (`V1`/`I1` for SMU1).
    pub async fn configure_smu(&self, smu: u8, mode: SmuMode, function: SmuFunction) -> Result<()> {
        if !(1..=4).contains(&smu) {
            return Err(ProbeError::Configuration(format!(
                "SMU number {smu} outside 1..=4"
            )));
        }
        self.link
            .command(&format!(
                ":PAGE:CHAN:SMU{smu}:VNAM 'V{smu}';INAM 'I{smu}';MODE {};FUNC {};",
                mode.code(),
                function.code()
            ))
            .await?;
        self.check_error().await
    }

    /// Disable every measurement unit except the listed ones.
    ///
    /// Units are numbered 1..=8 in panel order: SMU1-4, VSU1-2, VMU1-2.
    pub async fn disable_all_units(&self, keep: &[u8]) -> Result<()> {
        const UNITS: [&str; 8] = [
            "SMU1", "SMU2", "SMU3", "SMU4", "VSU1", "VSU2", "VMU1", "VMU2",
        ];
        for (index, unit) in UNITS.iter().enumerate() {
            if keep.contains(&(index as u8 + 1)) {
                continue;
            }
            self.link.command(&format!(":PAGE:CHAN:{unit}:DIS")).await?;
        }
        self.check_error().await
    }

    /// Define a user function computed by the instrument itself.
    pub async fn set_user_func(&self, name: &str, unit: &str, expression: &str) -> Result<()> {
        self.link
            .command(&format!(
                ":page:chan:ufun:def '{name}','{unit}','{expression}'"
            ))
            .await?;
        self.check_error().await
    }

    async fn set_y_axis(&self, axis: &str, name: &str, log_scale: bool) -> Result<()> {
        self.link
            .command(&format!(":PAGE:DISP:GRAP:{axis}:NAME '{name}';"))
            .await?;
        if log_scale {
            self.link
                .command(&format!(":PAGE:DISP:GRAP:{axis}:SCAL LOG;"))
                .await?;
        }
        self.check_error().await
    }

    /// Assign a channel to the primary Y axis of the on-screen graph.
    pub async fn set_y1(&self, name: &str, log_scale: bool) -> Result<()> {
        self.set_y_axis("Y1", name, log_scale).await
    }

    /// Assign a channel to the secondary Y axis of the on-screen graph.
    pub async fn set_y2(&self, name: &str, log_scale: bool) -> Result<()> {
        self.set_y_axis("Y2", name, log_scale).await
    }

    /// Set the axis ranges of the on-screen graph.
    pub async fn configure_display(
        &self,
        x_min: f64,
        x_max: f64,
        y1_min: f64,
        y1_max: f64,
        y2_min: f64,
        y2_max: f64,
    ) -> Result<()> {
        let axes = [
            ("X:MIN", x_min),
            ("X:MAX", x_max),
            ("Y1:MIN", y1_min),
            ("Y1:MAX", y1_max),
            ("Y2:MIN", y2_min),
            ("Y2:MAX", y2_max),
        ];
        for (axis, value) in axes {
            self.link
                .command(&format!(":PAGE:DISP:SET:GRAP:{axis} {};", scpi_num(value)))
                .await?;
        }
        self.check_error().await
    }

    /// Fetch one named data channel as raw floats, sentinels included.
    async fn read_trace(&self, name: &str) -> Result<Vec<f64>> {
        let response = self
            .link
            .query(&format!(":FORM:DATA ASC;:DATA? '{name}';"))
            .await?;
        response
            .split(',')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .map(|field| {
                field.parse().map_err(|_| {
                    ProbeError::Communication(format!(
                        "non-numeric field '{field}' in '{name}' trace"
                    ))
                })
            })
            .collect()
    }

    /// Run a double sweep `0 → end → 0` and return the filtered trace.
    ///
    /// The spec is validated before any command reaches the instrument: a
    /// non-positive display current and a step too small for the sweep
    /// buffer are both caller errors. A sweep the operator aborts at the
    /// instrument comes back flagged on the trace, not as an error.
    pub async fn double_sweep_from_zero(&self, spec: &SweepSpec) -> Result<SweepTrace> {
        if spec.display_current <= 0.0 {
            return Err(ProbeError::InvalidSweepSpec(format!(
                "display current must be positive, got {}",
                spec.display_current
            )));
        }
        let mut step = spec.step_voltage;
        if 1.0f64.copysign(spec.end_voltage) != 1.0f64.copysign(step) {
            warn!(
                end = spec.end_voltage,
                step, "sweep step sign corrected to match end voltage"
            );
            step = -step;
        }
        let steps = spec.end_voltage / step;
        if steps > f64::from(MAX_SWEEP_POINTS) {
            return Err(ProbeError::SweepTooLarge {
                steps,
                max: MAX_SWEEP_POINTS,
            });
        }

        self.link.command("*RST").await?;
        self.check_error().await?;
        self.disable_all_units(&[spec.ground_smu, spec.sweep_smu])
            .await?;
        self.configure_smu(spec.ground_smu, SmuMode::Common, SmuFunction::Constant)
            .await?;
        self.configure_smu(spec.sweep_smu, SmuMode::Voltage, SmuFunction::Var1)
            .await?;

        self.link.command(":PAGE:MEAS:VAR1:MODE DOUB;").await?;
        self.link.command(":PAGE:MEAS:SWE:VAR1:STAR 0").await?;
        self.link
            .command(&format!(
                ":PAGE:MEAS:VAR1:STOP {};",
                scpi_num(spec.end_voltage)
            ))
            .await?;
        self.link
            .command(&format!(":PAGE:MEAS:VAR1:STEP {};", scpi_num(step)))
            .await?;
        self.link
            .command(&format!(
                ":PAGE:MEAS:CONS:SMU{}:COMP {};",
                spec.ground_smu,
                scpi_num(spec.compliance_current)
            ))
            .await?;

        self.set_y2(&format!("I{}", spec.sweep_smu), true).await?;
        // The log Y2 axis keeps a fixed 10 mA ceiling independent of the
        // programmed compliance.
        if spec.end_voltage > 0.0 {
            self.configure_display(
                0.0,
                spec.end_voltage,
                0.0,
                spec.display_current,
                1e-15,
                10e-3,
            )
            .await?;
        } else {
            self.configure_display(
                spec.end_voltage,
                0.0,
                -spec.display_current,
                0.0,
                -10e-3,
                -1e-15,
            )
            .await?;
        }

        debug!(
            end = spec.end_voltage,
            step,
            smu = spec.sweep_smu,
            "triggering double sweep"
        );
        self.link.command(":PAGE:SCON:MEAS:SING").await?;
        let _ = self.link.query("*OPC?").await?;

        let raw_voltages = self.read_trace(&format!("V{}", spec.sweep_smu)).await?;
        let raw_currents = self.read_trace(&format!("I{}", spec.sweep_smu)).await?;
        let trace = assemble_trace(raw_voltages, raw_currents)?;
        info!(
            points = trace.len(),
            aborted = trace.aborted,
            "double sweep complete"
        );
        Ok(trace)
    }

    /// Sample the current under a constant bias to gauge contact quality.
    pub async fn contact_test(&self, spec: &ContactTestSpec) -> Result<TimedSeries> {
        let interval = spec.sample_interval.as_secs_f64();
        if interval <= 0.0 {
            return Err(ProbeError::InvalidSweepSpec(
                "sampling interval must be positive".to_string(),
            ));
        }
        let points =
            ((spec.duration.as_secs_f64() / interval) as u64).min(u64::from(MAX_SAMPLING_POINTS));
        let bias = spec.bias_smu;

        self.link.command("*RST").await?;
        self.link.command(":PAGE:CHAN:MODE SAMP;").await?;
        self.disable_all_units(&[spec.ground_smu, bias]).await?;
        self.configure_smu(spec.ground_smu, SmuMode::Common, SmuFunction::Constant)
            .await?;
        self.configure_smu(bias, SmuMode::Voltage, SmuFunction::Constant)
            .await?;

        self.link
            .command(&format!(
                ":PAGE:MEAS:SAMP:IINT {};POIN {points};",
                scpi_num(interval)
            ))
            .await?;
        self.link
            .command(&format!(
                ":PAGE:MEAS:SAMP:CONS:SMU{bias} {};",
                scpi_num(spec.bias_voltage)
            ))
            .await?;
        self.link
            .command(&format!(
                ":PAGE:MEAS:SAMP:CONS:SMU{bias}:COMP {};",
                scpi_num(spec.compliance_current)
            ))
            .await?;

        self.set_user_func("R", "ohm", &format!("V{bias}/I{bias}"))
            .await?;
        self.set_y1(&format!("I{bias}"), true).await?;
        self.set_y2("R", true).await?;
        self.configure_display(
            0.0,
            spec.duration.as_secs_f64(),
            1e-15,
            spec.compliance_current,
            1.0,
            1e12,
        )
        .await?;
        self.link.command(":PAGE:MEAS:MSET:ITIM MED;").await?;

        debug!(points, interval, "triggering sampling measurement");
        self.link.command(":PAGE:SCON:SING").await?;
        let _ = self.link.query("*OPC?").await?;

        let times = without_sentinels(&self.read_trace("@TIME").await?);
        let currents = without_sentinels(&self.read_trace(&format!("I{bias}")).await?);
        TimedSeries::new(times, currents)
    }
}
