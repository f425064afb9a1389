//! Error types for conversion math, persistence and sweep control.

use crate::types::SweepState;
use thiserror::Error;

/// Errors from voltage/pitch conversion and calibration file I/O.
#[derive(Debug, Error)]
pub enum CalError {
    /// Pitch is undefined for a frequency at or below zero (log2 of a non-positive ratio).
    #[error("frequency must be positive and finite, got {0} Hz")]
    NonPositiveFrequency(f64),

    /// Interface voltage range with `min >= max`.
    #[error("invalid voltage range: min {min} V must be below max {max} V")]
    InvalidRange { min: f64, max: f64 },

    /// Only one bound of a voltage range was supplied, or a custom interface got none.
    #[error("voltage range needs both a minimum and a maximum")]
    IncompleteRange,

    #[error("Hz/V scale must be positive and finite, got {0}")]
    InvalidScale(f64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by the sweep engine's control calls.
#[derive(Debug, Error)]
pub enum SweepError {
    /// A collaborator the sweep depends on was never attached.
    #[error("{0} not configured")]
    MissingCollaborator(&'static str),

    #[error("invalid calibration settings: {0}")]
    InvalidSettings(String),

    #[error("a calibration sweep is already running")]
    AlreadyRunning,

    #[error("no calibration sweep is running (state: {0:?})")]
    NotRunning(SweepState),

    #[error("calibration sweep is not paused (state: {0:?})")]
    NotPaused(SweepState),

    /// Manual measurements are only accepted when an external CV source drives the oscillator.
    #[error("manual measurement requires an external CV source")]
    ExternalSourceDisabled,

    /// A measurement request is still outstanding; its answer would land on the wrong point.
    #[error("a measurement is already in progress")]
    MeasurementPending,

    /// Interface calibration may not change underneath a running sweep.
    #[error("interface calibration is locked while a sweep is running")]
    CalibrationLocked,

    /// The thread owning the engine has exited.
    #[error("sweep runner has shut down")]
    RunnerStopped,

    #[error(transparent)]
    Conversion(#[from] CalError),
}
