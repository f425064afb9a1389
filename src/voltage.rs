//! Pitch ↔ frequency ↔ voltage math and the linear interface correction.
//!
//! Everything here is side-effect free. The CV output manager owns a
//! `VoltageConverter` and an `InterfaceCalibration` and composes them on
//! every output call: clamp to the interface range, then correct.

use crate::error::CalError;
use crate::types::{VoltageStandard, A4_HZ, A4_MIDI, DEFAULT_HZ_PER_VOLT, ZERO_VOLT_MIDI};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Below this the ideal-voltage variance is treated as zero.
const DEGENERATE_VARIANCE: f64 = 1e-10;

/// Convert MIDI note number (fractional) to Hz. A4 = MIDI 69 = 440 Hz.
pub fn midi_to_hz(midi: f64) -> f64 {
    A4_HZ * 2.0_f64.powf((midi - A4_MIDI) / 12.0)
}

/// Convert Hz to MIDI note number (fractional).
pub fn hz_to_midi(hz: f64) -> Result<f64, CalError> {
    if !hz.is_finite() || hz <= 0.0 {
        return Err(CalError::NonPositiveFrequency(hz));
    }
    Ok(A4_MIDI + 12.0 * (hz / A4_HZ).log2())
}

// ─── Converter ──────────────────────────────────────────────────────────────

/// Maps between pitch, frequency and voltage under one voltage standard,
/// and between volts and the normalized bipolar sample of a DC-coupled output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageConverter {
    standard: VoltageStandard,
    hz_per_volt: f64,
    min_volts: f64,
    max_volts: f64,
}

impl Default for VoltageConverter {
    fn default() -> Self {
        Self {
            standard: VoltageStandard::OneVoltPerOctave,
            hz_per_volt: DEFAULT_HZ_PER_VOLT,
            min_volts: -10.0,
            max_volts: 10.0,
        }
    }
}

impl VoltageConverter {
    pub fn new(standard: VoltageStandard) -> Self {
        Self {
            standard,
            ..Self::default()
        }
    }

    pub fn standard(&self) -> VoltageStandard {
        self.standard
    }

    pub fn set_standard(&mut self, standard: VoltageStandard) {
        self.standard = standard;
    }

    pub fn hz_per_volt(&self) -> f64 {
        self.hz_per_volt
    }

    pub fn set_hz_per_volt(&mut self, hz_per_volt: f64) -> Result<(), CalError> {
        if !hz_per_volt.is_finite() || hz_per_volt <= 0.0 {
            return Err(CalError::InvalidScale(hz_per_volt));
        }
        self.hz_per_volt = hz_per_volt;
        Ok(())
    }

    /// Interface output range as `(min_volts, max_volts)`.
    pub fn range(&self) -> (f64, f64) {
        (self.min_volts, self.max_volts)
    }

    pub fn set_range(&mut self, min_volts: f64, max_volts: f64) -> Result<(), CalError> {
        if min_volts.is_nan() || max_volts.is_nan() || min_volts >= max_volts {
            return Err(CalError::InvalidRange {
                min: min_volts,
                max: max_volts,
            });
        }
        self.min_volts = min_volts;
        self.max_volts = max_volts;
        Ok(())
    }

    /// 1V/Oct: `(pitch - 60) / 12`. Hz/V: `midi_to_hz(pitch) / scale`.
    pub fn pitch_to_voltage(&self, pitch: f64) -> f64 {
        match self.standard {
            VoltageStandard::OneVoltPerOctave => (pitch - ZERO_VOLT_MIDI) / 12.0,
            VoltageStandard::HzPerVolt => midi_to_hz(pitch) / self.hz_per_volt,
        }
    }

    pub fn frequency_to_voltage(&self, hz: f64) -> Result<f64, CalError> {
        match self.standard {
            VoltageStandard::OneVoltPerOctave => Ok((hz_to_midi(hz)? - ZERO_VOLT_MIDI) / 12.0),
            VoltageStandard::HzPerVolt => {
                if !hz.is_finite() || hz <= 0.0 {
                    return Err(CalError::NonPositiveFrequency(hz));
                }
                Ok(hz / self.hz_per_volt)
            }
        }
    }

    /// Inverse of `pitch_to_voltage`. Under Hz/V a non-positive voltage maps
    /// to a non-positive frequency and has no pitch.
    pub fn voltage_to_pitch(&self, volts: f64) -> Result<f64, CalError> {
        match self.standard {
            VoltageStandard::OneVoltPerOctave => Ok(ZERO_VOLT_MIDI + volts * 12.0),
            VoltageStandard::HzPerVolt => hz_to_midi(volts * self.hz_per_volt),
        }
    }

    pub fn clamp(&self, volts: f64) -> f64 {
        volts.clamp(self.min_volts, self.max_volts)
    }

    /// Linear map of `[min_volts, max_volts]` onto `[-1, +1]`.
    pub fn volts_to_sample(&self, volts: f64) -> f64 {
        let normalized = (volts - self.min_volts) / (self.max_volts - self.min_volts);
        normalized * 2.0 - 1.0
    }

    /// Linear map of `[-1, +1]` back onto `[min_volts, max_volts]`.
    pub fn sample_to_volts(&self, sample: f64) -> f64 {
        let normalized = (sample + 1.0) / 2.0;
        self.min_volts + normalized * (self.max_volts - self.min_volts)
    }
}

// ─── Interface correction ───────────────────────────────────────────────────

/// One reference reading: the voltage we asked for and the voltage the
/// interface actually produced (e.g. read off a multimeter).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltagePair {
    pub ideal: f64,
    pub actual: f64,
}

/// Linear gain/offset correction for one physical CV output path.
///
/// `gain` and `offset` hold the *inverse* of the interface's measured
/// response, so `interface(apply(ideal)) ≈ ideal`. They are only meaningful
/// while `is_calibrated` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterfaceCalibration {
    pub is_calibrated: bool,
    pub gain: f64,
    pub offset: f64,
    pub interface_name: String,
    pub calibration_date: Option<DateTime<Utc>>,
    #[serde(rename = "points")]
    pub calibration_points: Vec<VoltagePair>,
}

impl Default for InterfaceCalibration {
    fn default() -> Self {
        Self {
            is_calibrated: false,
            gain: 1.0,
            offset: 0.0,
            interface_name: String::new(),
            calibration_date: None,
            calibration_points: Vec::new(),
        }
    }
}

impl InterfaceCalibration {
    /// `gain * volts + offset` when calibrated, identity otherwise.
    pub fn apply(&self, volts: f64) -> f64 {
        if self.is_calibrated {
            self.gain * volts + self.offset
        } else {
            volts
        }
    }

    pub fn add_point(&mut self, ideal: f64, actual: f64) {
        self.calibration_points.push(VoltagePair { ideal, actual });
    }

    /// Least-squares fit of `actual = m * ideal + b` over the stored points,
    /// stored as the inverse correction `gain = 1/m`, `offset = -b/m`.
    ///
    /// With fewer than two points this only clears `is_calibrated`; gain and
    /// offset are left untouched. Zero variance in the ideal voltages falls
    /// back to a pure offset.
    pub fn compute_from_points(&mut self) {
        let points = &self.calibration_points;
        if points.len() < 2 {
            warn!(
                "Interface calibration needs at least 2 points, have {}",
                points.len()
            );
            self.is_calibrated = false;
            return;
        }

        let n = points.len() as f64;
        let mean_ideal = points.iter().map(|p| p.ideal).sum::<f64>() / n;
        let mean_actual = points.iter().map(|p| p.actual).sum::<f64>() / n;

        let mut covariance = 0.0;
        let mut variance = 0.0;
        for p in points {
            let di = p.ideal - mean_ideal;
            covariance += di * (p.actual - mean_actual);
            variance += di * di;
        }

        if variance.abs() < DEGENERATE_VARIANCE {
            debug!("Calibration points share one ideal voltage; using offset-only correction");
            self.gain = 1.0;
            self.offset = mean_actual - mean_ideal;
        } else {
            let slope = covariance / variance;
            let intercept = mean_actual - slope * mean_ideal;
            self.gain = 1.0 / slope;
            self.offset = -intercept / slope;
            debug!(
                "Interface response: actual = {:.6} * ideal {:+.6}",
                slope, intercept
            );
        }

        self.is_calibrated = true;
        self.calibration_date = Some(Utc::now());
        info!(
            "Interface calibrated from {} points: gain={:.6} offset={:+.6}V",
            points.len(),
            self.gain,
            self.offset
        );
    }

    pub fn load(path: &Path) -> Result<Self, CalError> {
        let data = std::fs::read_to_string(path)?;
        let cal: Self = serde_json::from_str(&data)?;
        info!("Loaded interface calibration from {:?}", path);
        Ok(cal)
    }

    pub fn save(&self, path: &Path) -> Result<(), CalError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("Interface calibration saved to {:?}", path);
        Ok(())
    }
}

/// Fit a fresh correction from reference readings.
pub fn compute_correction_from_points(points: &[VoltagePair]) -> InterfaceCalibration {
    let mut cal = InterfaceCalibration {
        calibration_points: points.to_vec(),
        ..InterfaceCalibration::default()
    };
    cal.compute_from_points();
    cal
}
