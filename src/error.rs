//! Custom error types for the application.
//!
//! This module defines the primary error type, `ProbeError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure kinds that can occur while driving
//! the prober and the analyzer.
//!
//! ## Error Hierarchy
//!
//! - **`Communication`**: link-level failures (timeout, unreachable device,
//!   garbled transport). Fatal at the call site; the orchestrator may retry
//!   a grid point a bounded number of times for this kind only.
//! - **`InstrumentFault`**: the instrument reported a non-zero status or
//!   error register, or returned an unparseable response. The hardware is
//!   in an unknown state and must not be driven further.
//! - **`LimitExceeded`**: a commanded or read-back position falls outside
//!   the configured axis limits. Never retried; continuing could crash the
//!   probe into the substrate.
//! - **`InvalidSweepSpec`** / **`SweepTooLarge`**: caller-supplied sweep
//!   parameters rejected before any command reaches the hardware.
//! - **`DataIntegrity`**: voltage/current traces disagree in length after
//!   sentinel filtering; the trace is discarded, never persisted.
//! - **`IdentityMismatch`**: the `*IDN?` response does not match the
//!   expected device.
//! - **`Config`** / **`Configuration`**: parse-level and semantic
//!   configuration failures.
//! - **`Storage`** / **`Io`**: persistence and file plumbing.
//!
//! A partial (hardware-aborted) sweep is *not* an error: it is reported as
//! data on the trace itself.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type Result<T> = std::result::Result<T, ProbeError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Link communication error: {0}")]
    Communication(String),

    #[error("Instrument fault: {0}")]
    InstrumentFault(String),

    #[error("Axis limit exceeded: {0}")]
    LimitExceeded(String),

    #[error("Invalid sweep specification: {0}")]
    InvalidSweepSpec(String),

    #[error("Sweep step count {steps:.1} exceeds the analyzer buffer limit of {max}")]
    SweepTooLarge { steps: f64, max: u32 },

    #[error("Trace length mismatch after sentinel filtering: {voltages} voltages vs {currents} currents")]
    DataIntegrity { voltages: usize, currents: usize },

    #[error("Unexpected instrument identity: {0}")]
    IdentityMismatch(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_too_large_names_both_counts() {
        let err = ProbeError::SweepTooLarge {
            steps: 1111.1,
            max: 1001,
        };
        let msg = err.to_string();
        assert!(msg.contains("1111.1"));
        assert!(msg.contains("1001"));
    }

    #[test]
    fn test_data_integrity_reports_lengths() {
        let err = ProbeError::DataIntegrity {
            voltages: 5,
            currents: 4,
        };
        assert_eq!(
            err.to_string(),
            "Trace length mismatch after sentinel filtering: 5 voltages vs 4 currents"
        );
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "link timed out");
        let err: ProbeError = io.into();
        assert!(matches!(err, ProbeError::Io(_)));
        assert!(err.to_string().contains("link timed out"));
    }
}
