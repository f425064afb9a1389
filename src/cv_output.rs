//! DC-coupled CV output: the voltage-output collaborator the sweep drives.
//!
//! The control side (`CvOutputManager`) converts, clamps and corrects each
//! requested voltage, then publishes it through a `CvSignal`. The audio
//! callback only ever touches the `CvSignal`: three atomics, no locks, no
//! allocation.

use crate::error::CalError;
use crate::types::VoltageStandard;
use crate::voltage::{InterfaceCalibration, VoltageConverter};
use log::{debug, info};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// What the sweep engine needs from a CV output.
pub trait CvOutput {
    fn set_active(&mut self, active: bool);
    fn is_active(&self) -> bool;
    fn set_voltage_standard(&mut self, standard: VoltageStandard);
    /// Clamp, correct and publish a voltage.
    fn output_voltage(&mut self, volts: f64);
    /// Ideal (uncorrected) voltage for a pitch under the active standard.
    fn midi_to_voltage(&self, pitch: f64) -> f64;
    fn voltage_to_midi(&self, volts: f64) -> Result<f64, CalError>;
    fn hz_per_volt(&self) -> f64;
}

// ─── Real-time handoff ──────────────────────────────────────────────────────

#[derive(Debug)]
struct SignalInner {
    /// f64 bit pattern of the corrected output voltage.
    voltage_bits: AtomicU64,
    /// f32 bit pattern of the normalized DC sample for that voltage.
    sample_bits: AtomicU32,
    active: AtomicBool,
}

/// Lock-free view of the current output level, cloneable into an audio callback.
#[derive(Debug, Clone)]
pub struct CvSignal {
    inner: Arc<SignalInner>,
}

impl CvSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                voltage_bits: AtomicU64::new(0.0f64.to_bits()),
                sample_bits: AtomicU32::new(0.0f32.to_bits()),
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Corrected voltage last published by the control side.
    pub fn voltage(&self) -> f64 {
        f64::from_bits(self.inner.voltage_bits.load(Ordering::Acquire))
    }

    /// Normalized sample for the current voltage, 0.0 when inactive.
    pub fn sample(&self) -> f32 {
        if !self.is_active() {
            return 0.0;
        }
        f32::from_bits(self.inner.sample_bits.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Fill a mono buffer with the DC level (silence when inactive).
    pub fn fill_output_buffer(&self, buffer: &mut [f32]) {
        let sample = self.sample();
        buffer.fill(sample);
    }

    /// Fill one channel of an interleaved buffer; other channels are silenced.
    pub fn fill_interleaved(&self, buffer: &mut [f32], channels: usize, channel: usize) {
        let sample = self.sample();
        if channels == 0 {
            return;
        }
        for frame in buffer.chunks_mut(channels) {
            for (i, s) in frame.iter_mut().enumerate() {
                *s = if i == channel { sample } else { 0.0 };
            }
        }
    }

    fn publish(&self, volts: f64, sample: f32) {
        self.inner.voltage_bits.store(volts.to_bits(), Ordering::Release);
        self.inner.sample_bits.store(sample.to_bits(), Ordering::Release);
    }

    fn set_active(&self, active: bool) {
        self.inner.active.store(active, Ordering::Release);
    }
}

impl Default for CvSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Interface presets ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    /// Expert Sleepers ES-8 / ES-9, ±10 V.
    ExpertSleepers,
    /// MOTU DC-coupled outputs, ±10 V.
    Motu,
    Generic,
    /// User-defined range; set with `set_custom_range`.
    Custom,
}

impl std::str::FromStr for InterfaceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "expert-sleepers" | "es8" | "es9" => Ok(InterfaceType::ExpertSleepers),
            "motu" => Ok(InterfaceType::Motu),
            "generic" => Ok(InterfaceType::Generic),
            "custom" => Ok(InterfaceType::Custom),
            other => Err(format!("unknown interface type '{other}'")),
        }
    }
}

// ─── Manager ────────────────────────────────────────────────────────────────

pub struct CvOutputManager {
    converter: VoltageConverter,
    calibration: InterfaceCalibration,
    interface_type: InterfaceType,
    output_channel: usize,
    signal: CvSignal,
}

impl CvOutputManager {
    pub fn new() -> Self {
        Self {
            converter: VoltageConverter::default(),
            calibration: InterfaceCalibration::default(),
            interface_type: InterfaceType::ExpertSleepers,
            output_channel: 0,
            signal: CvSignal::new(),
        }
    }

    /// Handle for the real-time output path.
    pub fn signal(&self) -> CvSignal {
        self.signal.clone()
    }

    pub fn converter(&self) -> &VoltageConverter {
        &self.converter
    }

    pub fn interface_type(&self) -> InterfaceType {
        self.interface_type
    }

    /// Select a preset. `Custom` keeps the current range.
    pub fn set_interface_type(&mut self, interface_type: InterfaceType) {
        self.interface_type = interface_type;
        match interface_type {
            InterfaceType::ExpertSleepers | InterfaceType::Motu | InterfaceType::Generic => {
                // All presets are ±10 V; the range is always valid.
                let _ = self.converter.set_range(-10.0, 10.0);
            }
            InterfaceType::Custom => {}
        }
        debug!("Interface type {:?}, range {:?}", interface_type, self.converter.range());
    }

    pub fn set_custom_range(&mut self, min_volts: f64, max_volts: f64) -> Result<(), CalError> {
        self.converter.set_range(min_volts, max_volts)?;
        self.interface_type = InterfaceType::Custom;
        Ok(())
    }

    /// Apply optional range bounds. Both or neither must be given, and a
    /// `Custom` interface needs both.
    pub fn apply_range_bounds(
        &mut self,
        min_volts: Option<f64>,
        max_volts: Option<f64>,
    ) -> Result<(), CalError> {
        match (min_volts, max_volts) {
            (Some(min), Some(max)) => self.set_custom_range(min, max),
            (None, None) if self.interface_type != InterfaceType::Custom => Ok(()),
            _ => Err(CalError::IncompleteRange),
        }
    }

    pub fn set_hz_per_volt(&mut self, hz_per_volt: f64) -> Result<(), CalError> {
        self.converter.set_hz_per_volt(hz_per_volt)
    }

    pub fn output_channel(&self) -> usize {
        self.output_channel
    }

    pub fn set_output_channel(&mut self, channel: usize) {
        self.output_channel = channel;
    }

    pub fn output_pitch(&mut self, pitch: f64) {
        let volts = self.converter.pitch_to_voltage(pitch);
        self.output_voltage(volts);
    }

    pub fn output_frequency(&mut self, hz: f64) -> Result<(), CalError> {
        let volts = self.converter.frequency_to_voltage(hz)?;
        self.output_voltage(volts);
        Ok(())
    }

    pub fn current_voltage(&self) -> f64 {
        self.signal.voltage()
    }

    // ─── Interface calibration ──────────────────────────────────────

    pub fn interface_calibration(&self) -> &InterfaceCalibration {
        &self.calibration
    }

    pub fn set_interface_calibration(&mut self, calibration: InterfaceCalibration) {
        self.calibration = calibration;
    }

    pub fn clear_interface_calibration(&mut self) {
        self.calibration = InterfaceCalibration::default();
    }

    pub fn add_calibration_point(&mut self, ideal: f64, actual: f64) {
        self.calibration.add_point(ideal, actual);
    }

    pub fn compute_calibration_from_points(&mut self) {
        self.calibration.compute_from_points();
    }

    pub fn save_calibration(&self, path: &Path) -> Result<(), CalError> {
        self.calibration.save(path)
    }

    pub fn load_calibration(&mut self, path: &Path) -> Result<(), CalError> {
        self.calibration = InterfaceCalibration::load(path)?;
        if self.calibration.is_calibrated {
            info!(
                "Interface '{}' correction: gain={:.6} offset={:+.6}V",
                self.calibration.interface_name, self.calibration.gain, self.calibration.offset
            );
        }
        Ok(())
    }
}

impl Default for CvOutputManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CvOutput for CvOutputManager {
    fn set_active(&mut self, active: bool) {
        self.signal.set_active(active);
    }

    fn is_active(&self) -> bool {
        self.signal.is_active()
    }

    fn set_voltage_standard(&mut self, standard: VoltageStandard) {
        self.converter.set_standard(standard);
    }

    fn output_voltage(&mut self, volts: f64) {
        let clamped = self.converter.clamp(volts);
        let corrected = self.calibration.apply(clamped);
        let sample = self.converter.volts_to_sample(corrected).clamp(-1.0, 1.0) as f32;
        self.signal.publish(corrected, sample);
    }

    fn midi_to_voltage(&self, pitch: f64) -> f64 {
        self.converter.pitch_to_voltage(pitch)
    }

    fn voltage_to_midi(&self, volts: f64) -> Result<f64, CalError> {
        self.converter.voltage_to_pitch(volts)
    }

    fn hz_per_volt(&self) -> f64 {
        self.converter.hz_per_volt()
    }
}
