//! # Probe DAQ Core Library
//!
//! Core library for the `probe_daq` application: automated I/V mapping of
//! device grids on a wafer, coupling a SUSS PA300 probe station (chuck
//! motion, contact heights) to an Agilent 4156C parameter analyzer (double
//! voltage sweeps, sampling measurements). The binary in `main.rs` is a thin
//! CLI over this library; everything here also runs against simulated
//! instruments so procedures can be exercised without a bench.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered run configuration (TOML file plus `PROBE_DAQ_*`
//!   environment overrides) and its validation rules.
//! - **`coord`**: Coordinate frames, stage limits, grid indices, and the
//!   rotation math that maps grid indices to stage coordinates.
//! - **`error`**: The `ProbeError` enum shared across the crate.
//! - **`instrument`**: Drivers for the PA300 prober and the 4156C analyzer,
//!   speaking their native command sets over an [`link::InstrumentLink`].
//! - **`link`**: The instrument transport abstraction, its VISA-backed
//!   implementation, and full-fidelity simulators of both instruments.
//! - **`logging`**: `tracing` subscriber setup driven by the configuration.
//! - **`scan`**: The grid scan procedure: calibration, traversal, per-point
//!   contact and sweeping, retry and cleanup policy.
//! - **`sink`**: Where sweep records go: in-memory for tests, CSV on disk
//!   for real runs.
//! - **`timeseries`**: Time-stamped sample series with interpolation and
//!   co-registration helpers.
//! - **`traversal`**: Grid traversal orders (zigzag, row-major, spiral).

pub mod config;
pub mod coord;
pub mod error;
pub mod instrument;
pub mod link;
pub mod logging;
pub mod scan;
pub mod sink;
pub mod timeseries;
pub mod traversal;
