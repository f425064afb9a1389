//! Per-note correction table: interpolation, error statistics, polynomial
//! fit, and the JSON file format.
//!
//! Query helpers never fail. An empty table interpolates to zero
//! correction, statistics of an empty table are zero, and a fit that cannot
//! be computed comes back as an empty coefficient vector.

use crate::error::CalError;
use crate::types::{VoltageStandard, ZERO_VOLT_MIDI};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_FIT_DEGREE: usize = 4;

/// Pivots smaller than this mark the normal equations as singular.
const SINGULAR_PIVOT: f64 = 1e-10;

const FILE_VERSION: &str = "1.0";

/// One finalized row of the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub midi_note: i32,
    /// Voltage that should produce this note with a perfect oscillator.
    pub ideal_voltage: f64,
    /// Voltage that actually produces it (`ideal + correction`).
    pub actual_voltage: f64,
    /// `actual_voltage - ideal_voltage`
    pub correction_offset: f64,
    pub measured_frequency: f64,
    pub error_cents: f64,
    pub std_dev_cents: f64,
}

/// Derived error summary, written alongside the entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStatistics {
    pub max_error_cents: f64,
    pub min_error_cents: f64,
    pub avg_error_cents: f64,
    pub rms_error_cents: f64,
    pub worst_note: Option<i32>,
    /// Absolute error of `worst_note`, cents.
    pub worst_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    entries: Vec<Entry>,
    device_name: String,
    device_brand: String,
    interface_name: String,
    notes: String,
    calibration_date: DateTime<Utc>,
    voltage_standard: String,
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            device_name: String::new(),
            device_brand: String::new(),
            interface_name: String::new(),
            notes: String::new(),
            calibration_date: Utc::now(),
            voltage_standard: VoltageStandard::OneVoltPerOctave.label().to_string(),
        }
    }

    // ─── Building ───────────────────────────────────────────────────

    pub fn add_entry(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Stable ascending sort by note. Leaves at most one entry per note:
    /// the one added last wins.
    pub fn sort_by_midi_note(&mut self) {
        self.entries.sort_by_key(|e| e.midi_note);
        let mut unique: Vec<Entry> = Vec::with_capacity(self.entries.len());
        for e in self.entries.drain(..) {
            match unique.last_mut() {
                Some(last) if last.midi_note == e.midi_note => *last = e,
                _ => unique.push(e),
            }
        }
        self.entries = unique;
    }

    // ─── Access ─────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn find_entry_for_note(&self, midi_note: i32) -> Option<&Entry> {
        self.entries.iter().find(|e| e.midi_note == midi_note)
    }

    pub fn find_entry_for_note_mut(&mut self, midi_note: i32) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.midi_note == midi_note)
    }

    // ─── Interpolation ──────────────────────────────────────────────

    /// Ideal 1V/Oct voltage for `pitch` plus the interpolated correction.
    pub fn corrected_voltage(&self, pitch: f64) -> f64 {
        let ideal = (pitch - ZERO_VOLT_MIDI) / 12.0;
        ideal + self.correction_offset(pitch)
    }

    /// Piecewise-linear correction between the two bracketing entries.
    /// Outside the covered range the nearest entry's offset is held; there
    /// is no extrapolation.
    pub fn correction_offset(&self, pitch: f64) -> f64 {
        match self.entries.as_slice() {
            [] => 0.0,
            [only] => only.correction_offset,
            entries => {
                let mut lower: Option<&Entry> = None;
                let mut upper: Option<&Entry> = None;
                for e in entries {
                    let note = e.midi_note as f64;
                    if note <= pitch && lower.map_or(true, |l| e.midi_note > l.midi_note) {
                        lower = Some(e);
                    }
                    if note >= pitch && upper.map_or(true, |u| e.midi_note < u.midi_note) {
                        upper = Some(e);
                    }
                }
                match (lower, upper) {
                    (Some(l), Some(u)) if l.midi_note == u.midi_note => l.correction_offset,
                    (Some(l), Some(u)) => {
                        let t = (pitch - l.midi_note as f64) / (u.midi_note - l.midi_note) as f64;
                        l.correction_offset + t * (u.correction_offset - l.correction_offset)
                    }
                    (Some(l), None) => l.correction_offset,
                    (None, Some(u)) => u.correction_offset,
                    // Only reachable for a NaN pitch.
                    (None, None) => 0.0,
                }
            }
        }
    }

    // ─── Statistics ─────────────────────────────────────────────────

    pub fn max_error_cents(&self) -> f64 {
        self.entries
            .iter()
            .map(|e| e.error_cents)
            .reduce(f64::max)
            .unwrap_or(0.0)
    }

    pub fn min_error_cents(&self) -> f64 {
        self.entries
            .iter()
            .map(|e| e.error_cents)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Mean of absolute error.
    pub fn average_error_cents(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.entries.iter().map(|e| e.error_cents.abs()).sum();
        sum / self.entries.len() as f64
    }

    pub fn rms_error_cents(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self.entries.iter().map(|e| e.error_cents * e.error_cents).sum();
        (sum_sq / self.entries.len() as f64).sqrt()
    }

    /// Entry with the largest absolute error; the first one wins ties.
    pub fn worst_note(&self) -> Option<&Entry> {
        let mut worst: Option<&Entry> = None;
        for e in &self.entries {
            if worst.map_or(true, |w| e.error_cents.abs() > w.error_cents.abs()) {
                worst = Some(e);
            }
        }
        worst
    }

    pub fn statistics(&self) -> TableStatistics {
        let worst = self.worst_note();
        TableStatistics {
            max_error_cents: self.max_error_cents(),
            min_error_cents: self.min_error_cents(),
            avg_error_cents: self.average_error_cents(),
            rms_error_cents: self.rms_error_cents(),
            worst_note: worst.map(|e| e.midi_note),
            worst_error: worst.map_or(0.0, |e| e.error_cents.abs()),
        }
    }

    // ─── Polynomial fit ─────────────────────────────────────────────

    /// Least-squares fit of correction offset against MIDI note.
    ///
    /// Returns `[a0, a1, ..., a_degree]` for `a0 + a1*x + ...`, or an empty
    /// vector when there are fewer than `degree + 1` entries or the normal
    /// equations are singular.
    pub fn polynomial_coefficients(&self, degree: usize) -> Vec<f64> {
        let m = degree + 1;
        if self.entries.len() < m {
            return Vec::new();
        }

        let mut a = vec![vec![0.0f64; m]; m];
        let mut b = vec![0.0f64; m];
        for e in &self.entries {
            let x = e.midi_note as f64;
            let y = e.correction_offset;
            for i in 0..m {
                for j in 0..m {
                    a[i][j] += x.powi((i + j) as i32);
                }
                b[i] += y * x.powi(i as i32);
            }
        }

        match solve_gaussian(a, b) {
            Some(coeffs) => coeffs,
            None => {
                debug!("Polynomial fit of degree {} is singular", degree);
                Vec::new()
            }
        }
    }

    // ─── Metadata ───────────────────────────────────────────────────

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn set_device_name(&mut self, name: impl Into<String>) {
        self.device_name = name.into();
    }

    pub fn device_brand(&self) -> &str {
        &self.device_brand
    }

    pub fn set_device_brand(&mut self, brand: impl Into<String>) {
        self.device_brand = brand.into();
    }

    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn set_interface_name(&mut self, name: impl Into<String>) {
        self.interface_name = name.into();
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn set_notes(&mut self, notes: impl Into<String>) {
        self.notes = notes.into();
    }

    pub fn calibration_date(&self) -> DateTime<Utc> {
        self.calibration_date
    }

    pub fn set_calibration_date(&mut self, date: DateTime<Utc>) {
        self.calibration_date = date;
    }

    pub fn voltage_standard(&self) -> &str {
        &self.voltage_standard
    }

    pub fn set_voltage_standard(&mut self, label: impl Into<String>) {
        self.voltage_standard = label.into();
    }

    // ─── Persistence ────────────────────────────────────────────────

    pub fn save(&self, path: &Path) -> Result<(), CalError> {
        let file = TableFile {
            version: FILE_VERSION.to_string(),
            device_name: self.device_name.clone(),
            device_brand: self.device_brand.clone(),
            interface_name: self.interface_name.clone(),
            notes: self.notes.clone(),
            calibration_date: Some(self.calibration_date),
            voltage_standard: self.voltage_standard.clone(),
            entries: self.entries.clone(),
            statistics: Some(self.statistics()),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json)?;
        info!("Calibration table ({} entries) saved to {:?}", self.entries.len(), path);
        Ok(())
    }

    /// Load a table file. The statistics block is derived data and is
    /// recomputed from the entries rather than trusted.
    pub fn load(path: &Path) -> Result<Self, CalError> {
        let data = std::fs::read_to_string(path)?;
        let file: TableFile = serde_json::from_str(&data)?;
        let mut table = Self::new();
        table.device_name = file.device_name;
        table.device_brand = file.device_brand;
        table.interface_name = file.interface_name;
        table.notes = file.notes;
        if let Some(date) = file.calibration_date {
            table.calibration_date = date;
        }
        table.voltage_standard = file.voltage_standard;
        table.entries = file.entries;
        info!("Loaded calibration table ({} entries) from {:?}", table.entries.len(), path);
        Ok(table)
    }
}

/// Evaluate `c0 + c1*x + c2*x^2 + ...` by accumulating increasing powers.
pub fn evaluate_polynomial(coefficients: &[f64], pitch: f64) -> f64 {
    let mut result = 0.0;
    let mut x = 1.0;
    for &c in coefficients {
        result += c * x;
        x *= pitch;
    }
    result
}

/// Solve `a · x = b` by Gaussian elimination with partial pivoting.
fn solve_gaussian(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let m = b.len();

    for k in 0..m {
        let pivot_row = (k..m)
            .max_by(|&i, &j| a[i][k].abs().total_cmp(&a[j][k].abs()))
            .unwrap_or(k);
        a.swap(k, pivot_row);
        b.swap(k, pivot_row);

        if a[k][k].abs() < SINGULAR_PIVOT {
            return None;
        }

        for i in (k + 1)..m {
            let factor = a[i][k] / a[k][k];
            for j in k..m {
                a[i][j] -= factor * a[k][j];
            }
            b[i] -= factor * b[k];
        }
    }

    let mut x = vec![0.0f64; m];
    for i in (0..m).rev() {
        let tail: f64 = ((i + 1)..m).map(|j| a[i][j] * x[j]).sum();
        x[i] = (b[i] - tail) / a[i][i];
    }
    Some(x)
}

/// On-disk shape of a calibration table.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableFile {
    #[serde(default)]
    version: String,
    #[serde(default)]
    device_name: String,
    #[serde(default)]
    device_brand: String,
    #[serde(default)]
    interface_name: String,
    #[serde(default)]
    notes: String,
    #[serde(default)]
    calibration_date: Option<DateTime<Utc>>,
    #[serde(default = "default_standard_label")]
    voltage_standard: String,
    #[serde(default)]
    entries: Vec<Entry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    statistics: Option<TableStatistics>,
}

fn default_standard_label() -> String {
    VoltageStandard::OneVoltPerOctave.label().to_string()
}
