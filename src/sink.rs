//! Sweep persistence writers.
//!
//! A [`SweepSink`] receives one record per completed sweep while a scan is
//! running. The CSV writer stores the run header as `# `-prefixed pretty
//! JSON above the column header, so a single file carries everything needed
//! to re-analyze the run.

use std::fs::File;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::coord::GridIndex;
use crate::error::{ProbeError, Result};
use crate::instrument::{SweepSpec, SweepTrace};

/// Identifying metadata written once per run, ahead of any record.
#[derive(Debug, Clone, Serialize)]
pub struct RunHeader {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub sample: String,
    /// Substrate rotation measured during calibration, degrees.
    pub theta_deg: f64,
    /// Snapshot of the run configuration.
    pub config: serde_json::Value,
}

/// One completed sweep with the location it was measured at.
#[derive(Debug, Clone, Serialize)]
pub struct SweepRecord {
    pub timestamp: DateTime<Utc>,
    pub grid: GridIndex,
    /// Nominal substrate position in micrometers, `origin + index * pitch`
    /// per axis, before stage negation or rotation.
    pub substrate_x: f64,
    pub substrate_y: f64,
    pub spec: SweepSpec,
    pub trace: SweepTrace,
}

/// Destination for sweep records.
#[async_trait]
pub trait SweepSink: Send + Sync {
    async fn open(&mut self, header: &RunHeader) -> Result<()>;
    async fn record(&mut self, record: &SweepRecord) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// In-memory sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    header: Option<RunHeader>,
    records: Vec<SweepRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> Option<&RunHeader> {
        self.header.as_ref()
    }

    pub fn records(&self) -> &[SweepRecord] {
        &self.records
    }
}

#[async_trait]
impl SweepSink for MemorySink {
    async fn open(&mut self, header: &RunHeader) -> Result<()> {
        self.header = Some(header.clone());
        Ok(())
    }

    async fn record(&mut self, record: &SweepRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A writer for CSV files, one row per measured sample.
#[cfg(feature = "storage_csv")]
pub struct CsvSink {
    directory: PathBuf,
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

#[cfg(feature = "storage_csv")]
impl CsvSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            path: PathBuf::new(),
            writer: None,
        }
    }

    /// Path of the file created by `open`.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(not(feature = "storage_csv"))]
pub struct CsvSink;

#[cfg(not(feature = "storage_csv"))]
impl CsvSink {
    pub fn new(_directory: impl Into<PathBuf>) -> Self {
        Self
    }
}

#[async_trait]
impl SweepSink for CsvSink {
    async fn open(&mut self, header: &RunHeader) -> Result<()> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = header;
            return Err(ProbeError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            let file_name = format!(
                "scan_{}_{}.csv",
                header.started_at.format("%Y%m%d_%H%M%S"),
                header.run_id
            );
            if !self.directory.exists() {
                std::fs::create_dir_all(&self.directory)
                    .map_err(|e| ProbeError::Storage(e.to_string()))?;
            }
            self.path = self.directory.join(file_name);

            let mut file = File::create(&self.path)
                .map_err(|e| ProbeError::Storage(format!("Failed to create CSV file: {e}")))?;
            let json_string = serde_json::to_string_pretty(header)
                .map_err(|e| ProbeError::Storage(e.to_string()))?;
            for line in json_string.lines() {
                use std::io::Write;
                writeln!(file, "# {line}").map_err(|e| ProbeError::Storage(e.to_string()))?;
            }

            let mut writer = csv::Writer::from_writer(file);
            writer
                .write_record([
                    "timestamp",
                    "grid_x",
                    "grid_y",
                    "substrate_x",
                    "substrate_y",
                    "end_voltage",
                    "step_voltage",
                    "compliance_current",
                    "aborted",
                    "point",
                    "voltage",
                    "current",
                ])
                .map_err(|e| ProbeError::Storage(e.to_string()))?;
            self.writer = Some(writer);
            info!(path = %self.path.display(), "CSV sink opened");
            Ok(())
        }
    }

    async fn record(&mut self, record: &SweepRecord) -> Result<()> {
        #[cfg(feature = "storage_csv")]
        {
            if let Some(writer) = self.writer.as_mut() {
                let samples = record.trace.voltages.iter().zip(&record.trace.currents);
                for (point, (voltage, current)) in samples.enumerate() {
                    writer
                        .write_record(&[
                            record.timestamp.to_rfc3339(),
                            record.grid.x.to_string(),
                            record.grid.y.to_string(),
                            record.substrate_x.to_string(),
                            record.substrate_y.to_string(),
                            record.spec.end_voltage.to_string(),
                            record.spec.step_voltage.to_string(),
                            record.spec.compliance_current.to_string(),
                            record.trace.aborted.to_string(),
                            point.to_string(),
                            voltage.to_string(),
                            current.to_string(),
                        ])
                        .map_err(|e| ProbeError::Storage(e.to_string()))?;
                }
            }
            Ok(())
        }
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = record;
            Ok(())
        }
    }

    async fn close(&mut self) -> Result<()> {
        #[cfg(feature = "storage_csv")]
        {
            if let Some(mut writer) = self.writer.take() {
                writer
                    .flush()
                    .map_err(|e| ProbeError::Storage(e.to_string()))?;
            }
            info!("CSV sink closed");
            Ok(())
        }
        #[cfg(not(feature = "storage_csv"))]
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> RunHeader {
        RunHeader {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            sample: "sample-A".to_string(),
            theta_deg: 46.7,
            config: serde_json::json!({ "grid": { "pitch_um": 1300.0 } }),
        }
    }

    fn record() -> SweepRecord {
        SweepRecord {
            timestamp: Utc::now(),
            grid: GridIndex::new(2, 3),
            substrate_x: 2_600.0,
            substrate_y: 3_900.0,
            spec: SweepSpec::default(),
            trace: SweepTrace {
                voltages: vec![0.0, 0.1, 0.0],
                currents: vec![0.0, 1e-4, 0.0],
                aborted: false,
            },
        }
    }

    #[tokio::test]
    async fn test_memory_sink_collects_records() {
        let mut sink = MemorySink::new();
        sink.open(&header()).await.expect("open");
        sink.record(&record()).await.expect("record");
        sink.record(&record()).await.expect("record");
        sink.close().await.expect("close");
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.header().map(|h| h.sample.as_str()), Some("sample-A"));
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_csv_sink_writes_header_comments_and_sample_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut sink = CsvSink::new(dir.path());
        sink.open(&header()).await.expect("open");
        sink.record(&record()).await.expect("record");
        sink.close().await.expect("close");

        let contents = std::fs::read_to_string(sink.path()).expect("read back");
        let comment_lines: Vec<&str> = contents
            .lines()
            .take_while(|line| line.starts_with("# "))
            .collect();
        assert!(!comment_lines.is_empty());
        assert!(contents.contains("\"theta_deg\": 46.7"));

        let mut data_lines = contents.lines().skip(comment_lines.len());
        assert_eq!(
            data_lines.next(),
            Some(
                "timestamp,grid_x,grid_y,substrate_x,substrate_y,end_voltage,step_voltage,\
                 compliance_current,aborted,point,voltage,current"
            )
        );
        // One row per sample of the three-point trace.
        assert_eq!(data_lines.count(), 3);
    }

    #[cfg(feature = "storage_csv")]
    #[tokio::test]
    async fn test_csv_sink_creates_the_output_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("runs").join("2026");
        let mut sink = CsvSink::new(&nested);
        sink.open(&header()).await.expect("open");
        sink.close().await.expect("close");
        assert!(nested.exists());
    }

    #[cfg(not(feature = "storage_csv"))]
    #[tokio::test]
    async fn test_csv_sink_requires_the_feature() {
        let mut sink = CsvSink::new("/tmp");
        let result = sink.open(&header()).await;
        assert!(matches!(result, Err(ProbeError::FeatureNotEnabled(_))));
    }
}
