//! Run configuration loaded with Figment.
//!
//! Configuration is merged from two sources:
//! 1. a TOML file (`probe_daq.toml` by default)
//! 2. environment variables prefixed with `PROBE_DAQ_`, with `__` between
//!    the section and the key (`PROBE_DAQ_GRID__PITCH_UM=650`)
//!
//! Every field has a default, so an empty file (or none at all) yields a
//! config that drives the simulated instruments out of the box. A loaded
//! config is immutable for the duration of a run; the orchestrator only
//! ever borrows it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::coord::{AxisLimits, GridIndex};
use crate::error::{ProbeError, Result};
use crate::instrument::{MotionSpeeds, SweepSpec, ZSetpoints, MAX_SWEEP_POINTS};
use crate::logging::LogFormat;
use crate::traversal::{Direction, TraversalKind};

/// Top-level run configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub prober: ProberConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Sample name recorded with every run.
    pub sample: String,
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Logging output format.
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            sample: "unnamed".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Prober connection and motion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberConfig {
    /// VISA resource string of the prober bench.
    pub resource: String,
    /// Per-command I/O timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Contact height in the Home frame, µm. Align and Separate derive
    /// from it.
    pub contact_z_um: f64,
    /// Lateral distance above which `safe_move` fully separates, µm.
    pub safe_move_threshold_um: f64,
    pub speeds: MotionSpeeds,
    /// Center-frame travel limits.
    pub limits: AxisLimits,
}

impl ProberConfig {
    pub fn setpoints(&self) -> ZSetpoints {
        ZSetpoints::from_contact(self.contact_z_um)
    }
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            resource: "GPIB0::7::INSTR".to_string(),
            timeout: Duration::from_secs(15),
            contact_z_um: 12_000.0,
            safe_move_threshold_um: 3_000.0,
            speeds: MotionSpeeds::default(),
            limits: AxisLimits::default(),
        }
    }
}

/// Analyzer connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// VISA resource string of the parameter analyzer.
    pub resource: String,
    /// Per-command I/O timeout. Sweeps block until the instrument answers
    /// `*OPC?`, so this covers the full measurement time.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            resource: "GPIB0::2::INSTR".to_string(),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Substrate geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Largest device column, 1-based.
    pub max_x: u32,
    /// Largest device row, 1-based.
    pub max_y: u32,
    /// Device pitch in substrate micrometers.
    pub pitch_um: f64,
    /// Offset of the drawn pattern from the substrate corner, µm.
    pub origin_x_um: f64,
    pub origin_y_um: f64,
    /// Substrate dimensions, µm. The calibration diagonal runs corner to
    /// corner across these.
    pub width_um: f64,
    pub height_um: f64,
    /// Angle of that diagonal on an untilted substrate, degrees.
    pub nominal_theta_deg: f64,
}

impl GridConfig {
    pub fn origin(&self) -> (f64, f64) {
        (self.origin_x_um, self.origin_y_um)
    }

    pub fn max_index(&self) -> GridIndex {
        GridIndex::new(self.max_x, self.max_y)
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            max_x: 4,
            max_y: 4,
            pitch_um: 1_300.0,
            origin_x_um: 905.0,
            origin_y_um: 1_200.0,
            width_um: 16_000.0,
            height_um: 16_000.0,
            nominal_theta_deg: 46.7,
        }
    }
}

/// Scan behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub traversal: TraversalKind,
    /// Direction of the first zigzag row.
    pub direction: Direction,
    /// Grid index to resume from.
    pub start_x: u32,
    pub start_y: u32,
    /// Extra attempts per grid point after a communication failure.
    pub comm_retries: u32,
    /// Pause for operator confirmation after the first contact.
    pub confirm_first_contact: bool,
}

impl ScanConfig {
    pub fn start_index(&self) -> GridIndex {
        GridIndex::new(self.start_x, self.start_y)
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            traversal: TraversalKind::Zigzag,
            direction: Direction::Right,
            start_x: 1,
            start_y: 1,
            comm_retries: 1,
            confirm_first_contact: true,
        }
    }
}

/// Sweep parameters shared by every bias point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub ground_smu: u8,
    pub sweep_smu: u8,
    /// End voltages measured at every device, each as its own double
    /// sweep. Sign selects the sweep direction.
    pub bias_voltages: Vec<f64>,
    /// Points per sweep leg; the step voltage is `end / steps_per_leg`.
    pub steps_per_leg: u32,
    pub display_current: f64,
    pub compliance_current: f64,
}

impl SweepConfig {
    /// Concrete sweep spec for one bias voltage. The step inherits the
    /// end voltage's sign, keeping the point density constant.
    pub fn spec_for(&self, end_voltage: f64) -> SweepSpec {
        SweepSpec {
            ground_smu: self.ground_smu,
            sweep_smu: self.sweep_smu,
            end_voltage,
            step_voltage: end_voltage / f64::from(self.steps_per_leg),
            display_current: self.display_current,
            compliance_current: self.compliance_current,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            ground_smu: 2,
            sweep_smu: 1,
            bias_voltages: vec![0.1],
            steps_per_leg: 1_000,
            display_current: 10e-6,
            compliance_current: 10e-3,
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory scan CSV files are written into.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl RunConfig {
    /// Load configuration from `probe_daq.toml` and environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from("probe_daq.toml")
    }

    /// Load configuration from a specific file path. A missing file is
    /// treated as empty; defaults and environment variables still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PROBE_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Starter configuration file contents, with every default spelled out.
    pub fn starter_toml() -> Result<String> {
        toml::to_string_pretty(&Self::default()).map_err(|e| ProbeError::Storage(e.to_string()))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ProbeError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.prober.timeout.is_zero() || self.analyzer.timeout.is_zero() {
            return Err(ProbeError::Configuration(
                "Instrument timeouts must be non-zero".to_string(),
            ));
        }
        if self.prober.safe_move_threshold_um <= 0.0 {
            return Err(ProbeError::Configuration(format!(
                "Invalid safe_move_threshold_um {}. Must be positive",
                self.prober.safe_move_threshold_um
            )));
        }
        let setpoints = self.prober.setpoints();
        if !self.prober.limits.contains_z(setpoints.contact)
            || !self.prober.limits.contains_z(setpoints.separate)
        {
            return Err(ProbeError::Configuration(format!(
                "Z travel {}..{} µm for contact_z_um {} leaves the configured limits",
                setpoints.separate, setpoints.contact, self.prober.contact_z_um
            )));
        }

        if self.grid.max_x < 1 || self.grid.max_y < 1 {
            return Err(ProbeError::Configuration(format!(
                "Invalid grid extent {}x{}. Both axes must be at least 1",
                self.grid.max_x, self.grid.max_y
            )));
        }
        if self.grid.pitch_um <= 0.0 {
            return Err(ProbeError::Configuration(format!(
                "Invalid pitch_um {}. Must be positive",
                self.grid.pitch_um
            )));
        }
        if self.grid.width_um <= 0.0 || self.grid.height_um <= 0.0 {
            return Err(ProbeError::Configuration(
                "Substrate width_um and height_um must be positive".to_string(),
            ));
        }

        if self.scan.start_x < 1
            || self.scan.start_y < 1
            || self.scan.start_x > self.grid.max_x
            || self.scan.start_y > self.grid.max_y
        {
            return Err(ProbeError::Configuration(format!(
                "Start index ({}, {}) outside the 1..={}x1..={} grid",
                self.scan.start_x, self.scan.start_y, self.grid.max_x, self.grid.max_y
            )));
        }

        if self.sweep.bias_voltages.is_empty() {
            return Err(ProbeError::Configuration(
                "bias_voltages must name at least one end voltage".to_string(),
            ));
        }
        if self.sweep.bias_voltages.iter().any(|v| *v == 0.0) {
            return Err(ProbeError::Configuration(
                "bias_voltages must not contain 0.0".to_string(),
            ));
        }
        if self.sweep.steps_per_leg < 1 || self.sweep.steps_per_leg > MAX_SWEEP_POINTS {
            return Err(ProbeError::Configuration(format!(
                "Invalid steps_per_leg {}. Must be 1..={MAX_SWEEP_POINTS}",
                self.sweep.steps_per_leg
            )));
        }
        for (name, smu) in [
            ("ground_smu", self.sweep.ground_smu),
            ("sweep_smu", self.sweep.sweep_smu),
        ] {
            if !(1..=4).contains(&smu) {
                return Err(ProbeError::Configuration(format!(
                    "Invalid {name} {smu}. Must be 1..=4"
                )));
            }
        }
        if self.sweep.ground_smu == self.sweep.sweep_smu {
            return Err(ProbeError::Configuration(format!(
                "ground_smu and sweep_smu must differ (both {})",
                self.sweep.ground_smu
            )));
        }
        if self.sweep.display_current <= 0.0 || self.sweep.compliance_current <= 0.0 {
            return Err(ProbeError::Configuration(
                "display_current and compliance_current must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_starter_toml_round_trips() {
        let text = RunConfig::starter_toml().expect("serialize defaults");
        assert!(text.contains("[prober]"));
        assert!(text.contains("contact_z_um"));
        let config: RunConfig = toml::from_str(&text).expect("parse starter config");
        assert!(config.validate().is_ok());
        assert_eq!(config.grid.pitch_um, 1_300.0);
    }

    #[test]
    fn test_partial_file_keeps_defaults_elsewhere() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("probe_daq.toml");
        std::fs::write(
            &path,
            "[grid]\npitch_um = 650.0\n\n[sweep]\nbias_voltages = [0.1, -0.1]\n",
        )
        .expect("write config");

        let config = RunConfig::load_from(&path).expect("load");
        assert_eq!(config.grid.pitch_um, 650.0);
        assert_eq!(config.sweep.bias_voltages, [0.1, -0.1]);
        assert_eq!(config.analyzer.resource, "GPIB0::2::INSTR");
        assert_eq!(config.scan.comm_retries, 1);
    }

    #[test]
    #[serial_test::serial]
    fn test_environment_overrides_the_file() {
        std::env::set_var("PROBE_DAQ_SWEEP__STEPS_PER_LEG", "500");
        let config = RunConfig::load_from("does_not_exist.toml").expect("load");
        std::env::remove_var("PROBE_DAQ_SWEEP__STEPS_PER_LEG");
        assert_eq!(config.sweep.steps_per_leg, 500);
    }

    #[test]
    fn test_spec_for_divides_the_bias_into_steps() {
        let sweep = SweepConfig::default();
        let spec = sweep.spec_for(-0.25);
        assert_eq!(spec.end_voltage, -0.25);
        assert_eq!(spec.step_voltage, -0.00025);
        assert_eq!(spec.ground_smu, 2);
        assert_eq!(spec.sweep_smu, 1);
    }

    #[test]
    fn test_zero_bias_is_rejected() {
        let mut config = RunConfig::default();
        config.sweep.bias_voltages = vec![0.1, 0.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_steps_per_leg_is_rejected() {
        let mut config = RunConfig::default();
        config.sweep.steps_per_leg = 2_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_start_index_must_sit_inside_the_grid() {
        let mut config = RunConfig::default();
        config.scan.start_x = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_contact_height_must_stay_within_z_limits() {
        let mut config = RunConfig::default();
        config.prober.contact_z_um = 13_500.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_matching_smu_numbers_are_rejected() {
        let mut config = RunConfig::default();
        config.sweep.ground_smu = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level_is_rejected() {
        let mut config = RunConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
    }
}
