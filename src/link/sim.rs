//! Simulated instrument links for development and tests.
//!
//! Both simulators parse the same wire strings the real instruments
//! receive and keep enough internal state to answer follow-up queries
//! consistently. They provide:
//! - Deterministic device models (chuck position, sweep buffers)
//! - Controllable failure injection
//! - Call logging for test verification

use async_trait::async_trait;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::InstrumentLink;
use crate::error::{ProbeError, Result};

/// Full identification line of the simulated prober.
pub const SIM_PROBER_IDENTITY: &str = "Suss MicroTec Test Systems GmbH,ProberBench PC,0,0";

/// Full identification line of the simulated analyzer.
pub const SIM_ANALYZER_IDENTITY: &str = "HEWLETT-PACKARD,4156C,0,03.10:04.08:01.00";

/// Marker the analyzer writes into unmeasured buffer slots.
const SENTINEL: f64 = 9.91e307;

const NO_ERROR: &str = "+0,\"No error\"";

fn parse_field<T: std::str::FromStr>(field: Option<&str>, command: &str) -> Result<T> {
    field
        .and_then(|f| f.parse().ok())
        .ok_or_else(|| ProbeError::Communication(format!("malformed command: {command}")))
}

// ===== Prober =====

/// Stand-in for the prober's motion controller.
///
/// The chuck is modeled as a point in Center-frame coordinates with fixed
/// Home and Zero offsets, starting at Center (0, 0) with the chuck at
/// 11000 µm. Position reads answer in whichever frame the command names;
/// move commands update the shared point, so reads in every frame stay
/// consistent as the chuck travels.
pub struct SimulatedProber {
    state: Mutex<ChuckState>,
    call_log: Arc<Mutex<Vec<String>>>,
    should_fail_next: AtomicBool,
    identity: String,
}

struct ChuckState {
    x: f64,
    y: f64,
    z: f64,
    system_fault: bool,
}

/// Fixed x/y offset of each frame's origin from Center, in µm.
fn frame_offset(code: char) -> Result<(f64, f64)> {
    match code {
        'H' => Ok((-9669.5, -2349.5)),
        'Z' => Ok((157_600.0, 155_000.0)),
        'C' => Ok((0.0, 0.0)),
        other => Err(ProbeError::Communication(format!(
            "unknown frame code '{other}'"
        ))),
    }
}

impl SimulatedProber {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChuckState {
                x: 0.0,
                y: 0.0,
                z: 11_000.0,
                system_fault: false,
            }),
            call_log: Arc::new(Mutex::new(Vec::new())),
            should_fail_next: AtomicBool::new(false),
            identity: SIM_PROBER_IDENTITY.to_string(),
        }
    }

    /// Override the `*IDN?` response, for exercising identity checks.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Fail the next link operation with a communication error.
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Make `ReadSystemStatus` report a non-zero status code.
    pub fn set_system_fault(&self, faulted: bool) {
        self.state.lock().unwrap().system_fault = faulted;
    }

    /// Force the chuck to a Center-frame position, bypassing move commands.
    pub fn set_chuck(&self, x: f64, y: f64, z: f64) {
        let mut state = self.state.lock().unwrap();
        state.x = x;
        state.y = y;
        state.z = z;
    }

    /// Current Center-frame chuck position.
    pub fn chuck(&self) -> (f64, f64, f64) {
        let state = self.state.lock().unwrap();
        (state.x, state.y, state.z)
    }

    /// Get a copy of the call log for verification.
    pub fn get_call_log(&self) -> Vec<String> {
        self.call_log.lock().unwrap().clone()
    }

    /// Clear the call log.
    pub fn clear_call_log(&self) {
        self.call_log.lock().unwrap().clear();
    }

    fn log_call(&self, command: &str) {
        self.call_log.lock().unwrap().push(command.to_string());
    }

    fn respond(&self, command: &str) -> Result<String> {
        let mut parts = command.split_whitespace();
        match parts.next() {
            Some("*IDN?") => Ok(self.identity.clone()),
            Some("ReadSystemStatus") => {
                let state = self.state.lock().unwrap();
                if state.system_fault {
                    Ok("1: PA300PS_ 0 0 0 0 0 0 0 0 0".to_string())
                } else {
                    Ok("0: PA300PS_ 5 1 1 1 0 0 0 0 0".to_string())
                }
            }
            Some("ReadChuckPosition") => {
                // ReadChuckPosition Y {frame} D
                let _unit = parts.next();
                let frame = parse_field::<char>(parts.next(), command)?;
                let (dx, dy) = frame_offset(frame)?;
                let state = self.state.lock().unwrap();
                Ok(format!("0: {} {} {}", state.x + dx, state.y + dy, state.z))
            }
            Some("MoveChuck") => {
                // MoveChuck {x} {y} {frame} Y {velocity}
                let x: f64 = parse_field(parts.next(), command)?;
                let y: f64 = parse_field(parts.next(), command)?;
                let frame = parse_field::<char>(parts.next(), command)?;
                let (dx, dy) = frame_offset(frame)?;
                let mut state = self.state.lock().unwrap();
                state.x = x - dx;
                state.y = y - dy;
                Ok("0:".to_string())
            }
            Some("MoveChuckZ") => {
                // MoveChuckZ {z} {frame} Y {velocity}
                let z: f64 = parse_field(parts.next(), command)?;
                self.state.lock().unwrap().z = z;
                Ok("0:".to_string())
            }
            _ => Err(ProbeError::Communication(format!(
                "unrecognized prober command: {command}"
            ))),
        }
    }
}

impl Default for SimulatedProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstrumentLink for SimulatedProber {
    async fn query(&self, command: &str) -> Result<String> {
        self.log_call(command);
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProbeError::Communication(
                "simulated link failure".to_string(),
            ));
        }
        self.respond(command)
    }

    async fn command(&self, command: &str) -> Result<()> {
        self.query(command).await.map(|_| ())
    }
}

// ===== Analyzer =====

/// Stand-in for the parameter analyzer.
///
/// Sweeps are synthesized against a resistor model: the voltage ladder is
/// rebuilt from the programmed stop/step values at trigger time and the
/// current buffer is `V / R` plus optional seeded noise, so repeated runs
/// are reproducible. An abort can be scripted, which pads both buffers
/// with sentinel values the way the hardware does when a sweep is stopped
/// early.
pub struct SimulatedAnalyzer {
    state: Mutex<AnalyzerState>,
    rng: Mutex<StdRng>,
    call_log: Arc<Mutex<Vec<String>>>,
    should_fail_next: AtomicBool,
}

struct AnalyzerState {
    identity: String,
    error_register: String,
    resistance_ohms: f64,
    noise_amps: f64,
    stop_voltage: f64,
    step_voltage: f64,
    sample_interval: f64,
    sample_points: usize,
    bias_voltage: f64,
    abort_after: Option<usize>,
    voltages: Vec<f64>,
    currents: Vec<f64>,
    times: Vec<f64>,
}

impl SimulatedAnalyzer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AnalyzerState {
                identity: SIM_ANALYZER_IDENTITY.to_string(),
                error_register: NO_ERROR.to_string(),
                resistance_ohms: 1_000.0,
                noise_amps: 0.0,
                stop_voltage: 0.0,
                step_voltage: 0.0,
                sample_interval: 0.0,
                sample_points: 0,
                bias_voltage: 0.0,
                abort_after: None,
                voltages: Vec::new(),
                currents: Vec::new(),
                times: Vec::new(),
            }),
            rng: Mutex::new(StdRng::seed_from_u64(0x4156)),
            call_log: Arc::new(Mutex::new(Vec::new())),
            should_fail_next: AtomicBool::new(false),
        }
    }

    /// Resistance of the simulated device under test.
    pub fn with_resistance(self, ohms: f64) -> Self {
        self.state.lock().unwrap().resistance_ohms = ohms;
        self
    }

    /// Peak-to-peak current noise added to synthesized readings.
    pub fn with_noise(self, amps: f64) -> Self {
        self.state.lock().unwrap().noise_amps = amps;
        self
    }

    /// Override the `*IDN?` response, for exercising identity checks.
    pub fn with_identity(self, identity: impl Into<String>) -> Self {
        self.state.lock().unwrap().identity = identity.into();
        self
    }

    /// Script the error register returned by the next `SYST:ERR?` queries.
    ///
    /// `*CLS` restores the no-error response.
    pub fn set_error_register(&self, register: impl Into<String>) {
        self.state.lock().unwrap().error_register = register.into();
    }

    /// Abort the next sweep after `points` measured samples.
    ///
    /// The remaining buffer slots are filled with the sentinel marker on
    /// both channels, matching what the hardware returns when its stop
    /// button interrupts a sweep. One-shot: the sweep after that runs to
    /// completion again.
    pub fn abort_after(&self, points: usize) {
        self.state.lock().unwrap().abort_after = Some(points);
    }

    /// Fail the next link operation with a communication error.
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Get a copy of the call log for verification.
    pub fn get_call_log(&self) -> Vec<String> {
        self.call_log.lock().unwrap().clone()
    }

    /// Clear the call log.
    pub fn clear_call_log(&self) {
        self.call_log.lock().unwrap().clear();
    }

    fn log_call(&self, command: &str) {
        self.call_log.lock().unwrap().push(command.to_string());
    }

    fn noise(&self, state: &AnalyzerState) -> f64 {
        if state.noise_amps == 0.0 {
            return 0.0;
        }
        let mut rng = self.rng.lock().unwrap();
        rng.gen_range(-state.noise_amps..=state.noise_amps)
    }

    fn trigger_sweep(&self) {
        let mut state = self.state.lock().unwrap();
        let steps = if state.step_voltage == 0.0 {
            0
        } else {
            (state.stop_voltage / state.step_voltage).round().abs() as usize
        };
        let mut ladder = Vec::with_capacity(2 * steps + 1);
        for i in 0..=steps {
            ladder.push(i as f64 * state.step_voltage);
        }
        for i in (0..steps).rev() {
            ladder.push(i as f64 * state.step_voltage);
        }
        let mut currents: Vec<f64> = ladder
            .iter()
            .map(|v| v / state.resistance_ohms + self.noise(&state))
            .collect();
        if let Some(measured) = state.abort_after.take() {
            let measured = measured.min(ladder.len());
            for slot in &mut ladder[measured..] {
                *slot = SENTINEL;
            }
            for slot in &mut currents[measured..] {
                *slot = SENTINEL;
            }
        }
        state.voltages = ladder;
        state.currents = currents;
        state.times.clear();
    }

    fn trigger_sampling(&self) {
        let mut state = self.state.lock().unwrap();
        state.times = (0..state.sample_points)
            .map(|i| i as f64 * state.sample_interval)
            .collect();
        state.currents = (0..state.sample_points)
            .map(|_| state.bias_voltage / state.resistance_ohms + self.noise(&state))
            .collect();
        state.voltages.clear();
    }

    fn handle_write(&self, command: &str) -> Result<()> {
        match command {
            "*RST" => {
                // Reset clears the measurement setup but not the error
                // queue, so a scripted fault survives to the next SYST:ERR?.
                let mut state = self.state.lock().unwrap();
                state.stop_voltage = 0.0;
                state.step_voltage = 0.0;
                state.sample_interval = 0.0;
                state.sample_points = 0;
                state.bias_voltage = 0.0;
                state.voltages.clear();
                state.currents.clear();
                state.times.clear();
                return Ok(());
            }
            "*CLS" => {
                self.state.lock().unwrap().error_register = NO_ERROR.to_string();
                return Ok(());
            }
            ":PAGE:SCON:MEAS:SING" => {
                self.trigger_sweep();
                return Ok(());
            }
            ":PAGE:SCON:SING" => {
                self.trigger_sampling();
                return Ok(());
            }
            _ => {}
        }
        if let Some(rest) = command.strip_prefix(":PAGE:MEAS:VAR1:STOP ") {
            self.state.lock().unwrap().stop_voltage =
                parse_field(Some(rest.trim_end_matches(';')), command)?;
            return Ok(());
        }
        if let Some(rest) = command.strip_prefix(":PAGE:MEAS:VAR1:STEP ") {
            self.state.lock().unwrap().step_voltage =
                parse_field(Some(rest.trim_end_matches(';')), command)?;
            return Ok(());
        }
        if let Some(rest) = command.strip_prefix(":PAGE:MEAS:SAMP:IINT ") {
            // ":PAGE:MEAS:SAMP:IINT {interval};POIN {points};"
            let mut fields = rest.trim_end_matches(';').split(';');
            let interval: f64 = parse_field(fields.next(), command)?;
            let points: usize =
                parse_field(fields.next().and_then(|f| f.strip_prefix("POIN ")), command)?;
            let mut state = self.state.lock().unwrap();
            state.sample_interval = interval;
            state.sample_points = points;
            return Ok(());
        }
        if let Some(rest) = command.strip_prefix(":PAGE:MEAS:SAMP:CONS:SMU") {
            // Bias value: ":PAGE:MEAS:SAMP:CONS:SMU{n} {V};"
            // Compliance variant (":COMP {A};") is accepted and ignored.
            let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            if let Some(value) = rest.strip_prefix(' ') {
                self.state.lock().unwrap().bias_voltage =
                    parse_field(Some(value.trim_end_matches(';')), command)?;
            }
            return Ok(());
        }
        // Channel definitions, display setup and user functions are
        // accepted without affecting the model; the call log records them.
        Ok(())
    }

    fn handle_query(&self, command: &str) -> Result<String> {
        match command {
            "*IDN?" => return Ok(self.state.lock().unwrap().identity.clone()),
            "*OPC?" => return Ok("1".to_string()),
            "SYST:ERR?" => return Ok(self.state.lock().unwrap().error_register.clone()),
            _ => {}
        }
        if let Some(rest) = command.strip_prefix(":FORM:DATA ASC;:DATA? '") {
            let name = rest.trim_end_matches(';').trim_end_matches('\'');
            let state = self.state.lock().unwrap();
            let buffer = match name {
                "@TIME" => &state.times,
                _ if name.starts_with('V') => &state.voltages,
                _ if name.starts_with('I') => &state.currents,
                _ => {
                    return Err(ProbeError::Communication(format!(
                        "unknown data channel '{name}'"
                    )))
                }
            };
            return Ok(buffer
                .iter()
                .map(|v| format!("{v:.6E}"))
                .collect::<Vec<_>>()
                .join(","));
        }
        Err(ProbeError::Communication(format!(
            "unrecognized analyzer query: {command}"
        )))
    }
}

impl Default for SimulatedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstrumentLink for SimulatedAnalyzer {
    async fn query(&self, command: &str) -> Result<String> {
        self.log_call(command);
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProbeError::Communication(
                "simulated link failure".to_string(),
            ));
        }
        self.handle_query(command)
    }

    async fn command(&self, command: &str) -> Result<()> {
        self.log_call(command);
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(ProbeError::Communication(
                "simulated link failure".to_string(),
            ));
        }
        self.handle_write(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_csv(response: &str) -> Vec<f64> {
        response
            .split(',')
            .map(|v| v.parse().expect("numeric field"))
            .collect()
    }

    #[tokio::test]
    async fn test_prober_reports_its_identity() {
        let prober = SimulatedProber::new();
        let idn = prober.query("*IDN?").await.expect("idn");
        assert!(idn.contains("Suss MicroTec Test Systems GmbH,ProberBench PC"));
    }

    #[tokio::test]
    async fn test_prober_position_reads_respect_frames() {
        let prober = SimulatedProber::new();
        let home = prober
            .query("ReadChuckPosition Y H D")
            .await
            .expect("position");
        assert_eq!(home, "0: -9669.5 -2349.5 11000");

        prober
            .query("MoveChuck 100 200 C Y 20")
            .await
            .expect("move ack");
        let center = prober
            .query("ReadChuckPosition Y C D")
            .await
            .expect("position");
        assert_eq!(center, "0: 100 200 11000");
        let home = prober
            .query("ReadChuckPosition Y H D")
            .await
            .expect("position");
        assert_eq!(home, "0: -9569.5 -2149.5 11000");
    }

    #[tokio::test]
    async fn test_prober_moves_commanded_in_home_frame_land_in_center() {
        let prober = SimulatedProber::new();
        prober
            .query("MoveChuck -9669.5 -2349.5 H Y 1")
            .await
            .expect("move ack");
        let (x, y, _) = prober.chuck();
        assert_eq!((x, y), (0.0, 0.0));
    }

    #[tokio::test]
    async fn test_prober_z_moves_track_the_chuck() {
        let prober = SimulatedProber::new();
        prober
            .query("MoveChuckZ 11700 Z Y 20")
            .await
            .expect("move ack");
        assert_eq!(prober.chuck().2, 11_700.0);
    }

    #[tokio::test]
    async fn test_prober_failure_injection_is_one_shot() {
        let prober = SimulatedProber::new();
        prober.trigger_failure();
        assert!(prober.query("ReadSystemStatus").await.is_err());
        assert!(prober.query("ReadSystemStatus").await.is_ok());
    }

    #[tokio::test]
    async fn test_prober_system_fault_changes_status_prefix() {
        let prober = SimulatedProber::new();
        let ok = prober.query("ReadSystemStatus").await.expect("status");
        assert!(ok.starts_with("0:"));
        prober.set_system_fault(true);
        let bad = prober.query("ReadSystemStatus").await.expect("status");
        assert!(bad.starts_with("1:"));
    }

    #[tokio::test]
    async fn test_prober_rejects_unknown_commands() {
        let prober = SimulatedProber::new();
        let result = prober.query("ReadWaferProfile").await;
        assert!(matches!(result, Err(ProbeError::Communication(_))));
    }

    #[tokio::test]
    async fn test_analyzer_synthesizes_a_double_sweep_ladder() {
        let analyzer = SimulatedAnalyzer::new();
        analyzer
            .command(":PAGE:MEAS:VAR1:STOP 0.002;")
            .await
            .expect("stop");
        analyzer
            .command(":PAGE:MEAS:VAR1:STEP 0.001;")
            .await
            .expect("step");
        analyzer
            .command(":PAGE:SCON:MEAS:SING")
            .await
            .expect("trigger");

        let volts = parse_csv(
            &analyzer
                .query(":FORM:DATA ASC;:DATA? 'V1';")
                .await
                .expect("voltages"),
        );
        let amps = parse_csv(
            &analyzer
                .query(":FORM:DATA ASC;:DATA? 'I1';")
                .await
                .expect("currents"),
        );
        assert_eq!(volts, [0.0, 0.001, 0.002, 0.001, 0.0]);
        assert_eq!(amps, [0.0, 1e-6, 2e-6, 1e-6, 0.0]);
    }

    #[tokio::test]
    async fn test_analyzer_scripted_abort_pads_both_buffers() {
        let analyzer = SimulatedAnalyzer::new();
        analyzer.abort_after(3);
        analyzer
            .command(":PAGE:MEAS:VAR1:STOP 0.004;")
            .await
            .expect("stop");
        analyzer
            .command(":PAGE:MEAS:VAR1:STEP 0.001;")
            .await
            .expect("step");
        analyzer
            .command(":PAGE:SCON:MEAS:SING")
            .await
            .expect("trigger");

        let volts = parse_csv(
            &analyzer
                .query(":FORM:DATA ASC;:DATA? 'V1';")
                .await
                .expect("voltages"),
        );
        assert_eq!(volts.len(), 9);
        assert_eq!(volts.iter().filter(|v| **v == SENTINEL).count(), 6);

        // One-shot: the next sweep completes normally.
        analyzer
            .command(":PAGE:SCON:MEAS:SING")
            .await
            .expect("trigger");
        let volts = parse_csv(
            &analyzer
                .query(":FORM:DATA ASC;:DATA? 'V1';")
                .await
                .expect("voltages"),
        );
        assert!(volts.iter().all(|v| *v != SENTINEL));
    }

    #[tokio::test]
    async fn test_analyzer_error_register_persists_until_cleared() {
        let analyzer = SimulatedAnalyzer::new();
        analyzer.set_error_register("+100,\"Command error\"");
        analyzer.command("*RST").await.expect("reset");
        let register = analyzer.query("SYST:ERR?").await.expect("register");
        assert_eq!(register, "+100,\"Command error\"");

        analyzer.command("*CLS").await.expect("clear");
        let register = analyzer.query("SYST:ERR?").await.expect("register");
        assert_eq!(register, NO_ERROR);
    }

    #[tokio::test]
    async fn test_analyzer_sampling_produces_timestamps() {
        let analyzer = SimulatedAnalyzer::new();
        analyzer
            .command(":PAGE:MEAS:SAMP:IINT 0.1;POIN 4;")
            .await
            .expect("setup");
        analyzer
            .command(":PAGE:MEAS:SAMP:CONS:SMU1 0.1;")
            .await
            .expect("bias");
        analyzer.command(":PAGE:SCON:SING").await.expect("trigger");

        let times = parse_csv(
            &analyzer
                .query(":FORM:DATA ASC;:DATA? '@TIME';")
                .await
                .expect("times"),
        );
        let amps = parse_csv(
            &analyzer
                .query(":FORM:DATA ASC;:DATA? 'I1';")
                .await
                .expect("currents"),
        );
        assert_eq!(times, [0.0, 0.1, 0.2, 0.3]);
        assert_eq!(amps, [1e-4, 1e-4, 1e-4, 1e-4]);
    }

    #[tokio::test]
    async fn test_analyzer_noise_is_reproducible_across_instances() {
        let sweep = |analyzer: SimulatedAnalyzer| async move {
            analyzer
                .command(":PAGE:MEAS:VAR1:STOP 0.002;")
                .await
                .expect("stop");
            analyzer
                .command(":PAGE:MEAS:VAR1:STEP 0.001;")
                .await
                .expect("step");
            analyzer
                .command(":PAGE:SCON:MEAS:SING")
                .await
                .expect("trigger");
            analyzer
                .query(":FORM:DATA ASC;:DATA? 'I1';")
                .await
                .expect("currents")
        };
        let first = sweep(SimulatedAnalyzer::new().with_noise(1e-9)).await;
        let second = sweep(SimulatedAnalyzer::new().with_noise(1e-9)).await;
        assert_eq!(first, second);
        assert_ne!(
            first,
            sweep(SimulatedAnalyzer::new()).await,
            "noise should perturb the ideal resistor response"
        );
    }

    #[tokio::test]
    async fn test_call_log_records_wire_strings_verbatim() {
        let analyzer = SimulatedAnalyzer::new();
        analyzer.command("*RST").await.expect("reset");
        analyzer.query("SYST:ERR?").await.expect("register");
        assert_eq!(analyzer.get_call_log(), ["*RST", "SYST:ERR?"]);
        analyzer.clear_call_log();
        assert!(analyzer.get_call_log().is_empty());
    }
}
