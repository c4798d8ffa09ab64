//! VISA transport for GPIB/USB/Ethernet instruments.
//!
//! Wraps the visa-rs crate and provides async I/O by running the
//! synchronous VISA calls on Tokio's blocking executor. The real transport
//! is only compiled with the `instrument_visa` feature; without it the
//! type still exists and `connect` reports the missing feature, so callers
//! can select a transport at runtime in every build.

use async_trait::async_trait;
use std::time::Duration;

use super::InstrumentLink;
use crate::error::{ProbeError, Result};

#[cfg(feature = "instrument_visa")]
use std::ffi::CString;
#[cfg(feature = "instrument_visa")]
use std::io::{BufRead, BufReader, Write};
#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// An open VISA session. The resource manager must stay alive for as long
/// as the instrument session: closing it closes every child session.
#[cfg(feature = "instrument_visa")]
struct VisaSession {
    _rm: DefaultRM,
    instrument: Instrument,
}

/// VISA-backed [`InstrumentLink`].
///
/// Supports resource strings like:
/// - "GPIB0::7::INSTR" (GPIB interface)
/// - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)
pub struct VisaLink {
    resource_string: String,

    /// Timeout handed to the resource manager when the session opens.
    timeout: Duration,

    /// Terminator appended to every command ("\n" for SCPI).
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    line_terminator: String,

    #[cfg(feature = "instrument_visa")]
    session: Option<Arc<Mutex<VisaSession>>>,
}

impl VisaLink {
    /// Create a link for `resource_string` with default settings.
    ///
    /// No I/O happens until [`connect`](Self::connect).
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            timeout: Duration::from_secs(5),
            line_terminator: "\n".to_string(),
            #[cfg(feature = "instrument_visa")]
            session: None,
        }
    }

    /// Set the session open timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the command terminator.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Resource string this link addresses.
    pub fn resource(&self) -> &str {
        &self.resource_string
    }

    /// Human-readable description for logs.
    pub fn info(&self) -> String {
        format!(
            "VisaLink({} @ {}ms timeout)",
            self.resource_string,
            self.timeout.as_millis()
        )
    }

    /// Open the VISA resource manager and the addressed resource.
    #[cfg(feature = "instrument_visa")]
    pub async fn connect(&mut self) -> Result<()> {
        let resource = CString::new(self.resource_string.as_str()).map_err(|_| {
            ProbeError::Configuration(format!(
                "VISA resource string {:?} contains a NUL byte",
                self.resource_string
            ))
        })?;
        let resource_name = self.resource_string.clone();
        let open_timeout = self.timeout;

        let session = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| {
                ProbeError::Communication(format!("failed to create VISA resource manager: {e}"))
            })?;
            let instrument = rm
                .open(&resource.into(), AccessMode::NO_LOCK, open_timeout)
                .map_err(|e| {
                    ProbeError::Communication(format!(
                        "failed to open VISA resource {resource_name}: {e}"
                    ))
                })?;
            Ok::<VisaSession, ProbeError>(VisaSession {
                _rm: rm,
                instrument,
            })
        })
        .await
        .map_err(|_| ProbeError::Communication("VISA open task panicked".to_string()))??;

        self.session = Some(Arc::new(Mutex::new(session)));
        debug!(
            resource = %self.resource_string,
            timeout_ms = self.timeout.as_millis() as u64,
            "VISA resource opened"
        );
        Ok(())
    }

    #[cfg(not(feature = "instrument_visa"))]
    pub async fn connect(&mut self) -> Result<()> {
        Err(ProbeError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    pub fn is_connected(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.session.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    #[cfg(feature = "instrument_visa")]
    fn live_session(&self) -> Result<Arc<Mutex<VisaSession>>> {
        self.session
            .as_ref()
            .cloned()
            .ok_or_else(|| ProbeError::Communication("VISA instrument not connected".to_string()))
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl InstrumentLink for VisaLink {
    async fn query(&self, command: &str) -> Result<String> {
        let session = self.live_session()?;
        let payload = format!("{}{}", command, self.line_terminator);
        let command_for_log = command.to_string();

        // Synchronous VISA I/O runs on a dedicated blocking thread.
        tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| ProbeError::Communication("VISA session lock poisoned".to_string()))?;
            session.instrument.write_all(payload.as_bytes()).map_err(|e| {
                ProbeError::Communication(format!("VISA write failed for {command_for_log:?}: {e}"))
            })?;
            let mut response = String::new();
            BufReader::new(&session.instrument)
                .read_line(&mut response)
                .map_err(|e| {
                    ProbeError::Communication(format!(
                        "VISA read failed for {command_for_log:?}: {e}"
                    ))
                })?;
            let response = response.trim().to_string();
            debug!(command = %command_for_log, %response, "VISA query");
            Ok(response)
        })
        .await
        .map_err(|_| ProbeError::Communication("VISA I/O task panicked".to_string()))?
    }

    async fn command(&self, command: &str) -> Result<()> {
        let session = self.live_session()?;
        let payload = format!("{}{}", command, self.line_terminator);
        let command_for_log = command.to_string();

        tokio::task::spawn_blocking(move || {
            let mut session = session
                .lock()
                .map_err(|_| ProbeError::Communication("VISA session lock poisoned".to_string()))?;
            session.instrument.write_all(payload.as_bytes()).map_err(|e| {
                ProbeError::Communication(format!("VISA write failed for {command_for_log:?}: {e}"))
            })?;
            debug!(command = %command_for_log, "VISA write");
            Ok(())
        })
        .await
        .map_err(|_| ProbeError::Communication("VISA write task panicked".to_string()))?
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl InstrumentLink for VisaLink {
    async fn query(&self, _command: &str) -> Result<String> {
        Err(ProbeError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn command(&self, _command: &str) -> Result<()> {
        Err(ProbeError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}
