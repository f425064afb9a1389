use crate::calibration_table::CalibrationTable;
use crate::error::SweepError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Period of the sweep engine's control tick.
pub const TICK_MS: u32 = 10;
pub const TICK_PERIOD: Duration = Duration::from_millis(TICK_MS as u64);

/// Concert pitch reference: A4 = MIDI 69 = 440 Hz.
pub const A4_HZ: f64 = 440.0;
pub const A4_MIDI: f64 = 69.0;

/// MIDI note that sits at 0 V under 1V/Oct (C4).
pub const ZERO_VOLT_MIDI: f64 = 60.0;

/// Default Hz/V scaling: 1 V = 1 kHz.
pub const DEFAULT_HZ_PER_VOLT: f64 = 1000.0;

// ─── Voltage standard ───────────────────────────────────────────────────────

/// How control voltage encodes pitch.
/// Serializes as the short labels used in calibration files ("1V/Oct", "Hz/V").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoltageStandard {
    /// MIDI 60 = 0 V, one volt per octave.
    #[default]
    #[serde(rename = "1V/Oct")]
    OneVoltPerOctave,
    /// Voltage proportional to frequency.
    #[serde(rename = "Hz/V")]
    HzPerVolt,
}

impl VoltageStandard {
    pub fn label(&self) -> &'static str {
        match self {
            VoltageStandard::OneVoltPerOctave => "1V/Oct",
            VoltageStandard::HzPerVolt => "Hz/V",
        }
    }
}

impl fmt::Display for VoltageStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for VoltageStandard {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1v/oct" | "voct" | "v/oct" | "one-volt-per-octave" => Ok(VoltageStandard::OneVoltPerOctave),
            "hz/v" | "hzv" | "hz-per-volt" => Ok(VoltageStandard::HzPerVolt),
            other => Err(format!("unknown voltage standard '{other}' (expected 1v/oct or hz/v)")),
        }
    }
}

// ─── Sweep configuration ────────────────────────────────────────────────────

/// Sweep configuration: which notes to visit and how long to dwell on each.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalibrationSettings {
    /// First MIDI note of the sweep (C1 by default).
    pub start_note: i32,
    /// Last MIDI note, inclusive (C7 by default).
    pub end_note: i32,
    pub note_step: i32,
    /// Time for the oscillator to stabilize after a CV change.
    pub settle_time_ms: u32,
    /// Samples averaged per note.
    pub measurements_per_note: u32,
    pub standard: VoltageStandard,
    /// When set, the engine never drives the CV output; the caller supplies
    /// each voltage through `trigger_manual_measurement`.
    pub use_external_cv_source: bool,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            start_note: 24,
            end_note: 96,
            note_step: 1,
            settle_time_ms: 200,
            measurements_per_note: 1,
            standard: VoltageStandard::OneVoltPerOctave,
            use_external_cv_source: false,
        }
    }
}

impl CalibrationSettings {
    /// Reject sweep bounds the engine cannot walk.
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.start_note > self.end_note {
            return Err(SweepError::InvalidSettings(format!(
                "start note {} is above end note {}",
                self.start_note, self.end_note
            )));
        }
        if self.note_step < 1 {
            return Err(SweepError::InvalidSettings(format!(
                "note step must be at least 1, got {}",
                self.note_step
            )));
        }
        if self.measurements_per_note < 1 {
            return Err(SweepError::InvalidSettings(
                "at least one measurement per note is required".into(),
            ));
        }
        Ok(())
    }

    /// Number of notes the sweep visits; 0 when the step is not positive.
    pub fn total_points(&self) -> usize {
        if self.note_step <= 0 || self.end_note < self.start_note {
            return 0;
        }
        ((self.end_note - self.start_note) / self.note_step) as usize + 1
    }
}

// ─── Per-note working record ────────────────────────────────────────────────

/// The note currently under measurement. Owned by the engine until it is
/// appended to the sweep's result sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationPoint {
    pub target_midi_note: i32,
    pub target_voltage: f64,
    /// Mean of every frequency sample taken for this note.
    pub measured_frequency: f64,
    /// Measured pitch in MIDI units (fractional).
    pub measured_pitch: f64,
    /// Measured minus target, semitones.
    pub pitch_error: f64,
    pub error_cents: f64,
    pub voltage_correction: f64,
    pub std_dev_cents: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl CalibrationPoint {
    pub fn new(target_midi_note: i32, target_voltage: f64) -> Self {
        Self {
            target_midi_note,
            target_voltage,
            ..Self::default()
        }
    }
}

impl fmt::Display for CalibrationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "note={:>3}  cv={:+.4}V  f={:>9.3}Hz  err={:+7.2}c  corr={:+.5}V  sd={:.2}c",
            self.target_midi_note,
            self.target_voltage,
            self.measured_frequency,
            self.error_cents,
            self.voltage_correction,
            self.std_dev_cents,
        )
    }
}

// ─── Pitch measurement contract ─────────────────────────────────────────────

/// One result from the external pitch meter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Measurement {
    pub frequency: f64,
    /// Offset of the measured pitch from the requested note, semitones.
    pub pitch_offset_semitones: f64,
    /// Spread of the pitch estimate across the measurement window, semitones.
    pub pitch_deviation: f64,
}

/// Events the pitch meter delivers back to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TunerEvent {
    MeasurementReady(Measurement),
    /// The meter stopped on its own (no signal).
    Stopped,
}

// ─── Sweep state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Starting,
    SettlingVoltage,
    WaitingForMeasurement,
    ProcessingResult,
    MovingToNext,
    Paused,
    Completed,
    Error,
}

impl SweepState {
    /// States in which the control tick has nothing to do.
    pub fn is_quiescent(&self) -> bool {
        matches!(
            self,
            SweepState::Idle | SweepState::Completed | SweepState::Error | SweepState::Paused
        )
    }
}

// ─── Outbound notifications ─────────────────────────────────────────────────

/// Owned form of the engine's notifications, for consumers on other threads.
#[derive(Debug, Clone)]
pub enum SweepEvent {
    Started,
    PointCompleted(CalibrationPoint),
    Progress { percent: f64, status: String },
    Completed(CalibrationTable),
    Error(String),
    Cancelled,
}
