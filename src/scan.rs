//! Grid scan procedure: the full measurement workflow over a substrate.
//!
//! A run connects both instruments, calibrates the substrate rotation from
//! an operator-driven diagonal, then walks the grid plan. At every grid
//! point the chuck is moved at safe height, lowered into contact, and the
//! analyzer performs one double sweep per configured bias voltage. Records
//! stream to a [`SweepSink`] as they are acquired, so a fault mid-run loses
//! at most the sweep in flight.
//!
//! Failure policy: a communication error retries the whole grid point (move
//! and all of its sweeps) up to `scan.comm_retries` times; any other error
//! ends the run. Whatever happens after the walk starts, the chuck is raised
//! to separate and the sink is closed before the procedure returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RunConfig;
use crate::coord::{calibrate_theta, grid_to_stage, grid_to_substrate, CoordinateFrame, GridIndex};
use crate::error::{ProbeError, Result};
use crate::instrument::{Agilent4156C, SussPa300};
use crate::link::SharedLink;
use crate::sink::{RunHeader, SweepRecord, SweepSink};
use crate::traversal;

// =============================================================================
// Operator prompts
// =============================================================================

/// Pauses the procedure until the operator acknowledges an instruction.
///
/// Calibration waits for a human to home the chuck and, after the walked
/// diagonal, to fine-position the probe on the far corner; the first
/// touchdown of a run is normally inspected under the microscope before
/// sweeping starts. Unattended runs substitute [`AutoConfirm`], which
/// acknowledges immediately.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Present `message` and wait for acknowledgement.
    async fn confirm(&self, message: &str) -> Result<()>;
}

/// Prompt on stdout, acknowledge by pressing Enter on stdin.
pub struct StdinPrompt;

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm(&self, message: &str) -> Result<()> {
        println!("{message} [press Enter to continue]");
        tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| ())
        })
        .await
        .map_err(|e| ProbeError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(())
    }
}

/// Acknowledges every prompt without waiting. For simulated and unattended runs.
pub struct AutoConfirm;

#[async_trait]
impl OperatorPrompt for AutoConfirm {
    async fn confirm(&self, message: &str) -> Result<()> {
        info!(%message, "operator prompt auto-confirmed");
        Ok(())
    }
}

// =============================================================================
// Scan summary
// =============================================================================

/// Final accounting for a completed run.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Calibrated substrate rotation in degrees.
    pub theta_deg: f64,
    /// Grid points in the traversal plan.
    pub points_visited: usize,
    /// Sweep records delivered to the sink, aborted ones included.
    pub sweeps_recorded: usize,
    /// Grid points whose sweep came back flagged as aborted.
    pub sweeps_aborted: usize,
    /// Communication retries that were actually consumed.
    pub comm_retries_used: usize,
}

#[derive(Default)]
struct Progress {
    sweeps_recorded: usize,
    sweeps_aborted: usize,
    comm_retries_used: usize,
}

struct PointOutcome {
    sweeps: usize,
    aborted: bool,
}

// =============================================================================
// Grid scan
// =============================================================================

/// Orchestrates one scan run over both instruments.
pub struct GridScan<'a> {
    config: &'a RunConfig,
    prober: SussPa300,
    analyzer: Agilent4156C,
    prompt: Box<dyn OperatorPrompt>,
}

impl<'a> GridScan<'a> {
    /// Build a scan over already-constructed drivers. Prompts auto-confirm
    /// until [`Self::with_prompt`] installs an interactive one.
    pub fn new(config: &'a RunConfig, prober: SussPa300, analyzer: Agilent4156C) -> Self {
        Self {
            config,
            prober,
            analyzer,
            prompt: Box::new(AutoConfirm),
        }
    }

    /// Build the drivers from raw links using the configured limits,
    /// setpoints and speeds.
    pub fn from_links(
        config: &'a RunConfig,
        prober_link: SharedLink,
        analyzer_link: SharedLink,
    ) -> Self {
        let prober = SussPa300::new(prober_link)
            .with_limits(config.prober.limits)
            .with_setpoints(config.prober.setpoints())
            .with_speeds(config.prober.speeds)
            .with_safe_move_threshold(config.prober.safe_move_threshold_um);
        let analyzer = Agilent4156C::new(analyzer_link);
        Self::new(config, prober, analyzer)
    }

    /// Replace the operator prompt.
    pub fn with_prompt(mut self, prompt: Box<dyn OperatorPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Measure the substrate rotation against the grid axes.
    ///
    /// The operator homes the chuck on the left bottom substrate corner;
    /// the chuck then walks the nominal diagonal at contact speed, leaving
    /// the operator only the fine positioning of the probe on the right
    /// top corner before confirming. The home-frame reading of that corner
    /// gives the diagonal, and its angle against the nominal diagonal is
    /// the pattern rotation. Auto-confirming prompts leave the walked
    /// diagonal untouched, so the calibration reduces to the nominal
    /// angle.
    pub async fn calibrate(&self) -> Result<f64> {
        self.prober.separate_separate().await?;
        self.prompt
            .confirm("Set substrate left bottom edge as home.")
            .await?;
        self.prober
            .move_xy(
                CoordinateFrame::Home,
                -self.config.grid.width_um,
                -self.config.grid.height_um,
                self.config.prober.speeds.slow,
            )
            .await?;
        self.prompt
            .confirm("Right click substrate right top edge.")
            .await?;
        let corner = self.prober.read_position(CoordinateFrame::Home).await?;
        let theta = calibrate_theta(corner.x, corner.y, self.config.grid.nominal_theta_deg);
        if theta.is_nan() {
            return Err(ProbeError::Configuration(
                "calibration diagonal is zero; move the probe to the opposite corner before confirming".into(),
            ));
        }
        info!(
            theta_deg = theta,
            dx = corner.x,
            dy = corner.y,
            "substrate rotation calibrated"
        );
        Ok(theta)
    }

    /// Run the full scan, streaming records into `sink`.
    pub async fn run(&self, sink: &mut dyn SweepSink) -> Result<ScanSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, sample = %self.config.application.sample, "starting grid scan");

        self.prober.connect().await?;
        self.analyzer.connect().await?;
        let theta = self.calibrate().await?;

        let plan = traversal::plan(
            self.config.scan.traversal,
            self.config.scan.start_index(),
            self.config.grid.max_index(),
            self.config.scan.direction,
        )?;
        info!(points = plan.len(), "traversal planned");

        let header = RunHeader {
            run_id,
            started_at,
            sample: self.config.application.sample.clone(),
            theta_deg: theta,
            config: serde_json::to_value(self.config)
                .map_err(|e| ProbeError::Storage(e.to_string()))?,
        };
        sink.open(&header).await?;

        let mut progress = Progress::default();
        let result = self.walk(&plan, theta, sink, &mut progress).await;

        // Leave the bench safe no matter how the walk ended.
        if let Err(error) = self.prober.separate_separate().await {
            warn!(%error, "failed to raise the chuck to separate after the scan");
        }
        if let Err(error) = sink.close().await {
            warn!(%error, "failed to close the sweep sink");
        }
        result?;

        let summary = ScanSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            theta_deg: theta,
            points_visited: plan.len(),
            sweeps_recorded: progress.sweeps_recorded,
            sweeps_aborted: progress.sweeps_aborted,
            comm_retries_used: progress.comm_retries_used,
        };
        info!(
            points = summary.points_visited,
            sweeps = summary.sweeps_recorded,
            aborted = summary.sweeps_aborted,
            "grid scan complete"
        );
        Ok(summary)
    }

    async fn walk(
        &self,
        plan: &[GridIndex],
        theta: f64,
        sink: &mut dyn SweepSink,
        progress: &mut Progress,
    ) -> Result<()> {
        for (position, index) in plan.iter().enumerate() {
            let first = position == 0;
            let mut attempts_left = self.config.scan.comm_retries;
            loop {
                match self.scan_point(*index, theta, first, sink).await {
                    Ok(outcome) => {
                        progress.sweeps_recorded += outcome.sweeps;
                        if outcome.aborted {
                            progress.sweeps_aborted += 1;
                        }
                        break;
                    }
                    Err(ProbeError::Communication(reason)) if attempts_left > 0 => {
                        attempts_left -= 1;
                        progress.comm_retries_used += 1;
                        warn!(%index, %reason, "communication failure, retrying grid point");
                    }
                    Err(error) => return Err(error),
                }
            }
        }
        Ok(())
    }

    /// Visit one grid point: move into contact and sweep every bias.
    ///
    /// An aborted sweep is still recorded, but the remaining biases for the
    /// point are skipped: an abort usually means the operator pressed Stop
    /// on the analyzer front panel, and repeating the ladder would only
    /// fight them.
    async fn scan_point(
        &self,
        index: GridIndex,
        theta: f64,
        first: bool,
        sink: &mut dyn SweepSink,
    ) -> Result<PointOutcome> {
        let (substrate_x, substrate_y) =
            grid_to_substrate(index, self.config.grid.origin(), self.config.grid.pitch_um);
        let (x, y) = grid_to_stage(
            index,
            self.config.grid.origin(),
            self.config.grid.pitch_um,
            theta,
        );
        debug!(%index, x, y, "moving to grid point");
        self.prober
            .safe_move_contact(CoordinateFrame::Home, x, y)
            .await?;

        if first && self.config.scan.confirm_first_contact {
            self.prompt.confirm("Contact the prober.").await?;
        }

        let mut sweeps = 0;
        for bias in &self.config.sweep.bias_voltages {
            let spec = self.config.sweep.spec_for(*bias);
            let trace = self.analyzer.double_sweep_from_zero(&spec).await?;
            let aborted = trace.aborted;
            sink.record(&SweepRecord {
                timestamp: Utc::now(),
                grid: index,
                substrate_x,
                substrate_y,
                spec,
                trace,
            })
            .await?;
            sweeps += 1;
            if aborted {
                warn!(
                    %index,
                    bias = *bias,
                    "sweep aborted at the instrument; skipping remaining biases for this point"
                );
                return Ok(PointOutcome {
                    sweeps,
                    aborted: true,
                });
            }
        }
        Ok(PointOutcome {
            sweeps,
            aborted: false,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{SimulatedAnalyzer, SimulatedProber};
    use crate::sink::MemorySink;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    fn base_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.grid.max_x = 2;
        config.grid.max_y = 2;
        config.grid.origin_x_um = 0.0;
        config.grid.origin_y_um = 0.0;
        config.grid.pitch_um = 1300.0;
        config.grid.width_um = 10_000.0;
        config.grid.height_um = 10_000.0;
        config.grid.nominal_theta_deg = 45.0;
        config.sweep.bias_voltages = vec![0.1];
        config.sweep.steps_per_leg = 10;
        config
    }

    fn scan_over<'a>(
        config: &'a RunConfig,
        prober: &Arc<SimulatedProber>,
        analyzer: &Arc<SimulatedAnalyzer>,
    ) -> GridScan<'a> {
        GridScan::from_links(config, prober.clone(), analyzer.clone())
    }

    /// Triggers one analyzer link failure when the contact prompt fires.
    struct FailOnContact {
        analyzer: Arc<SimulatedAnalyzer>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl OperatorPrompt for FailOnContact {
        async fn confirm(&self, message: &str) -> Result<()> {
            if message.contains("Contact") && self.armed.swap(false, Ordering::SeqCst) {
                self.analyzer.trigger_failure();
            }
            Ok(())
        }
    }

    struct RecordingPrompt {
        messages: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OperatorPrompt for RecordingPrompt {
        async fn confirm(&self, message: &str) -> Result<()> {
            self.messages.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    /// Counts the XY chuck moves already issued each time a prompt fires.
    struct DiagonalWatch {
        prober: Arc<SimulatedProber>,
        moves_seen: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl OperatorPrompt for DiagonalWatch {
        async fn confirm(&self, _message: &str) -> Result<()> {
            let moves = self
                .prober
                .get_call_log()
                .iter()
                .filter(|entry| entry.starts_with("MoveChuck "))
                .count();
            self.moves_seen.lock().unwrap().push(moves);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_auto_scan_visits_every_point_once() {
        let config = base_config();
        let prober = Arc::new(SimulatedProber::new());
        let analyzer = Arc::new(SimulatedAnalyzer::new());
        let scan = scan_over(&config, &prober, &analyzer);
        let mut sink = MemorySink::new();

        let summary = scan.run(&mut sink).await.unwrap();

        assert_eq!(summary.points_visited, 4);
        assert_eq!(summary.sweeps_recorded, 4);
        assert_eq!(summary.sweeps_aborted, 0);
        assert_eq!(summary.comm_retries_used, 0);
        // Square substrate walked on the nominal diagonal: no rotation.
        assert!(summary.theta_deg.abs() < 1e-9);

        let visited: Vec<GridIndex> = sink.records().iter().map(|r| r.grid).collect();
        assert_eq!(
            visited,
            vec![
                GridIndex { x: 1, y: 1 },
                GridIndex { x: 2, y: 1 },
                GridIndex { x: 2, y: 2 },
                GridIndex { x: 1, y: 2 },
            ]
        );
        let header = sink.header().unwrap();
        assert_eq!(header.sample, config.application.sample);
        assert!(header.theta_deg.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_records_carry_substrate_coordinates() {
        let mut config = base_config();
        config.grid.max_x = 1;
        config.grid.max_y = 1;
        // Zero nominal angle turns the square diagonal into a 45° pattern
        // rotation, so the stage target and the substrate position disagree.
        config.grid.nominal_theta_deg = 0.0;
        let prober = Arc::new(SimulatedProber::new());
        let analyzer = Arc::new(SimulatedAnalyzer::new());
        let scan = scan_over(&config, &prober, &analyzer);
        let mut sink = MemorySink::new();

        let summary = scan.run(&mut sink).await.unwrap();

        assert!((summary.theta_deg - 45.0).abs() < 1e-9);
        // Records hold the nominal `origin + index * pitch` position, not
        // the rotated home-frame target the chuck was driven to.
        let record = &sink.records()[0];
        assert!((record.substrate_x - 1300.0).abs() < 1e-9);
        assert!((record.substrate_y - 1300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_comm_failure_retries_the_whole_point() {
        let config = base_config();
        let prober = Arc::new(SimulatedProber::new());
        let analyzer = Arc::new(SimulatedAnalyzer::new());
        let scan = scan_over(&config, &prober, &analyzer).with_prompt(Box::new(FailOnContact {
            analyzer: Arc::clone(&analyzer),
            armed: AtomicBool::new(true),
        }));
        let mut sink = MemorySink::new();

        let summary = scan.run(&mut sink).await.unwrap();

        assert_eq!(summary.comm_retries_used, 1);
        assert_eq!(summary.sweeps_recorded, 4);
        assert_eq!(summary.sweeps_aborted, 0);
        assert_eq!(sink.records().len(), 4);
    }

    #[tokio::test]
    async fn test_aborted_sweep_skips_remaining_biases() {
        let mut config = base_config();
        config.sweep.bias_voltages = vec![0.1, 0.2];
        let prober = Arc::new(SimulatedProber::new());
        let analyzer = Arc::new(SimulatedAnalyzer::new());
        analyzer.abort_after(3);
        let scan = scan_over(&config, &prober, &analyzer);
        let mut sink = MemorySink::new();

        let summary = scan.run(&mut sink).await.unwrap();

        // First point loses its second bias to the abort; the other three
        // points sweep both biases.
        assert_eq!(summary.sweeps_recorded, 7);
        assert_eq!(summary.sweeps_aborted, 1);
        assert!(sink.records()[0].trace.aborted);
        assert!(sink.records()[1..].iter().all(|r| !r.trace.aborted));
    }

    #[tokio::test]
    async fn test_stage_limit_violation_ends_the_run() {
        let mut config = base_config();
        config.grid.max_x = 1;
        config.grid.max_y = 1;
        config.grid.pitch_um = 40_000.0;
        let prober = Arc::new(SimulatedProber::new());
        let analyzer = Arc::new(SimulatedAnalyzer::new());
        let scan = scan_over(&config, &prober, &analyzer);
        let mut sink = MemorySink::new();

        let result = scan.run(&mut sink).await;

        assert!(matches!(result, Err(ProbeError::LimitExceeded(_))));
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_calibration_drives_the_diagonal_between_the_prompts() {
        let config = base_config();
        let prober = Arc::new(SimulatedProber::new());
        let analyzer = Arc::new(SimulatedAnalyzer::new());
        let moves_seen = Arc::new(Mutex::new(Vec::new()));
        let scan = scan_over(&config, &prober, &analyzer).with_prompt(Box::new(DiagonalWatch {
            prober: Arc::clone(&prober),
            moves_seen: Arc::clone(&moves_seen),
        }));

        let theta = scan.calibrate().await.unwrap();

        assert!(theta.abs() < 1e-9);
        // No XY move before the homing prompt, exactly one before the
        // corner confirmation: the chuck walks the diagonal itself and the
        // operator only fine-positions from there.
        assert_eq!(*moves_seen.lock().unwrap(), vec![0, 1]);
        // The walk runs at contact speed in Center coordinates (home target
        // (-10000, -10000) shifted by the simulated home offset).
        assert!(prober
            .get_call_log()
            .contains(&"MoveChuck -330.5 -7650.5 C Y 1".to_string()));
    }

    #[tokio::test]
    async fn test_calibration_rejects_a_zero_diagonal() {
        let mut config = base_config();
        // A degenerate substrate leaves the chuck on the home origin, so
        // the corner reading is (0, 0) and no diagonal exists.
        config.grid.width_um = 0.0;
        config.grid.height_um = 0.0;
        let prober = Arc::new(SimulatedProber::new());
        let analyzer = Arc::new(SimulatedAnalyzer::new());
        let scan = scan_over(&config, &prober, &analyzer);

        let result = scan.calibrate().await;

        assert!(matches!(result, Err(ProbeError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_first_contact_prompt_is_issued_once() {
        let config = base_config();
        let prober = Arc::new(SimulatedProber::new());
        let analyzer = Arc::new(SimulatedAnalyzer::new());
        let messages = Arc::new(Mutex::new(Vec::new()));
        let scan = scan_over(&config, &prober, &analyzer).with_prompt(Box::new(RecordingPrompt {
            messages: Arc::clone(&messages),
        }));
        let mut sink = MemorySink::new();

        scan.run(&mut sink).await.unwrap();

        let seen = messages.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "Set substrate left bottom edge as home.".to_string(),
                "Right click substrate right top edge.".to_string(),
                "Contact the prober.".to_string(),
            ]
        );
    }
}
