//! Error taxonomy shared by the player, the calibration engine and the
//! run scheduler.
//!
//! Validation errors (`InvalidWaveform`, `InvalidConfiguration`) are returned
//! synchronously before a run starts. Everything raised inside the timed loop
//! is caught at the worker boundary and turned into a terminal run phase.

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RigError {
    #[error("invalid waveform: {0}")]
    InvalidWaveform(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("acquisition timed out after {timeout:?} waiting for {expected} samples")]
    AcquisitionTimeout { timeout: Duration, expected: usize },

    /// No spectral bin sits exactly on the requested frequency.
    #[error("no spectral bin at {frequency} Hz")]
    CalibrationMeasurementMissing { frequency: f64 },

    #[error("calibration ratio undefined (peak {peak}, reference {reference})")]
    UndefinedCalibrationRatio { peak: f64, reference: f64 },

    /// Cooperative halt observed at a repetition boundary.
    #[error("run halted by user")]
    UserAbort,

    #[error("device fault: {0}")]
    DeviceFault(String),

    #[error("data sink: {0}")]
    Sink(String),

    #[error("run worker panicked")]
    WorkerPanicked,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Wav(#[from] hound::Error),
}

pub type Result<T> = std::result::Result<T, RigError>;
