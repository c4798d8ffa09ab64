//! CLI entry point for probe_daq.
//!
//! Bench-side command line for:
//! - Running a full grid scan over a substrate (`scan`)
//! - Sampling contact resistance over time (`contact-test`)
//! - Reporting chuck position and Z state (`status`)
//! - Writing a starter configuration file (`init`)
//!
//! # Usage
//!
//! Scan a substrate with the settings in `probe_daq.toml`:
//! ```bash
//! probe_daq scan
//! ```
//!
//! Dry-run the same scan against simulated instruments:
//! ```bash
//! probe_daq scan --simulate
//! ```

// mimalloc for the multi-threaded acquisition paths.
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use probe_daq::config::RunConfig;
use probe_daq::coord::CoordinateFrame;
use probe_daq::instrument::{Agilent4156C, ContactTestSpec, SussPa300};
use probe_daq::link::{SharedLink, SimulatedAnalyzer, SimulatedProber, VisaLink};
use probe_daq::logging;
use probe_daq::scan::{AutoConfirm, GridScan, OperatorPrompt, StdinPrompt};
use probe_daq::sink::CsvSink;

#[derive(Parser)]
#[command(name = "probe_daq")]
#[command(about = "Grid-scan DAQ for a PA300 prober and 4156C analyzer", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = "probe_daq.toml")]
    config: PathBuf,

    /// Use simulated instruments instead of VISA hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full grid scan
    Scan,

    /// Sample contact resistance over time at the current position
    ContactTest {
        /// Bias voltage in volts
        #[arg(long, default_value_t = 0.1)]
        bias: f64,

        /// Total sampling duration
        #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
        duration: Duration,

        /// Interval between samples
        #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
        interval: Duration,
    },

    /// Report chuck position and Z state
    Status,

    /// Write a starter configuration file with every default spelled out
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `init` writes the config file; everything else reads it.
    if let Commands::Init { force } = &cli.command {
        return write_starter_config(&cli.config, *force);
    }

    let config = RunConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Scan => run_scan(&config, cli.simulate).await,
        Commands::ContactTest {
            bias,
            duration,
            interval,
        } => run_contact_test(&config, cli.simulate, bias, duration, interval).await,
        Commands::Status => report_status(&config, cli.simulate).await,
        Commands::Init { .. } => Ok(()),
    }
}

async fn prober_link(config: &RunConfig, simulate: bool) -> Result<SharedLink> {
    if simulate {
        return Ok(Arc::new(SimulatedProber::new()));
    }
    let mut link =
        VisaLink::new(config.prober.resource.as_str()).with_timeout(config.prober.timeout);
    link.connect().await?;
    Ok(Arc::new(link))
}

async fn analyzer_link(config: &RunConfig, simulate: bool) -> Result<SharedLink> {
    if simulate {
        return Ok(Arc::new(SimulatedAnalyzer::new()));
    }
    let mut link =
        VisaLink::new(config.analyzer.resource.as_str()).with_timeout(config.analyzer.timeout);
    link.connect().await?;
    Ok(Arc::new(link))
}

async fn run_scan(config: &RunConfig, simulate: bool) -> Result<()> {
    let prober = prober_link(config, simulate).await?;
    let analyzer = analyzer_link(config, simulate).await?;

    let prompt: Box<dyn OperatorPrompt> = if simulate {
        Box::new(AutoConfirm)
    } else {
        Box::new(StdinPrompt)
    };
    let scan = GridScan::from_links(config, prober, analyzer).with_prompt(prompt);

    let mut sink = CsvSink::new(&config.storage.output_dir);
    let summary = scan.run(&mut sink).await?;

    println!();
    println!("✅ Scan complete");
    println!("   Run:    {}", summary.run_id);
    println!("   Points: {}", summary.points_visited);
    println!(
        "   Sweeps: {} recorded, {} aborted, {} comm retries",
        summary.sweeps_recorded, summary.sweeps_aborted, summary.comm_retries_used
    );
    println!("   Theta:  {:.3}°", summary.theta_deg);
    #[cfg(feature = "storage_csv")]
    println!("   Output: {}", sink.path().display());
    Ok(())
}

async fn run_contact_test(
    config: &RunConfig,
    simulate: bool,
    bias: f64,
    duration: Duration,
    interval: Duration,
) -> Result<()> {
    let link = analyzer_link(config, simulate).await?;
    let analyzer = Agilent4156C::new(link);
    analyzer.connect().await?;

    let spec = ContactTestSpec {
        ground_smu: config.sweep.ground_smu,
        bias_smu: config.sweep.sweep_smu,
        sample_interval: interval,
        duration,
        bias_voltage: bias,
        compliance_current: config.sweep.compliance_current,
    };
    println!(
        "📈 Sampling current for {} at {} V",
        humantime::format_duration(duration),
        bias
    );
    let series = analyzer.contact_test(&spec).await?;

    for (t, i) in series.times().iter().zip(series.values()) {
        let r = if *i != 0.0 { bias / i } else { f64::INFINITY };
        println!("{t:>9.3} s  {i:>13.6e} A  {r:>13.3e} Ω");
    }
    println!();
    println!("✅ {} samples", series.len());
    Ok(())
}

async fn report_status(config: &RunConfig, simulate: bool) -> Result<()> {
    let link = prober_link(config, simulate).await?;
    let prober = SussPa300::new(link)
        .with_limits(config.prober.limits)
        .with_setpoints(config.prober.setpoints());
    prober.connect().await?;

    let center = prober.read_position(CoordinateFrame::Center).await?;
    let home = prober.read_position(CoordinateFrame::Home).await?;
    let state = prober.z_state().await?;

    println!("🔎 Prober status");
    println!("   Center: {center}");
    println!("   Home:   {home}");
    println!(
        "   Z:      {state} (contact setpoint {} µm)",
        prober.setpoints().contact
    );
    Ok(())
}

fn write_starter_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists; pass --force to overwrite", path.display());
    }
    let contents = RunConfig::starter_toml()?;
    std::fs::write(path, contents)?;
    println!("✅ Wrote starter configuration to {}", path.display());
    Ok(())
}
