use crate::cv_output::CvSignal;
use crate::engine::PitchMeter;
use crate::types::*;
use crate::voltage::{hz_to_midi, midi_to_hz};
use crossbeam_channel::Sender;
use log::{debug, trace};

/// Imperfections of a simulated oscillator's voltage-to-pitch response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VcoModel {
    /// Exponential scale relative to ideal (1.0 = perfect 1V/Oct or Hz/V).
    pub tracking: f64,
    /// Constant pitch offset, cents.
    pub offset_cents: f64,
    /// Extra deviation that grows with the square of the distance from 0 V,
    /// cents per volt².
    pub bow_cents: f64,
    /// Peak measurement jitter, cents. Deterministic, so runs are repeatable.
    pub jitter_cents: f64,
    /// Nominal scale in Hz/V mode.
    pub hz_per_volt: f64,
}

impl Default for VcoModel {
    fn default() -> Self {
        Self {
            tracking: 1.0,
            offset_cents: 0.0,
            bow_cents: 0.0,
            jitter_cents: 0.0,
            hz_per_volt: DEFAULT_HZ_PER_VOLT,
        }
    }
}

/// A VCO listening to a `CvSignal`, paired with an instant tuner.
///
/// Every measurement request is answered straight away on the tuner channel.
/// If the CV output is inactive there is nothing to hear and the tuner
/// reports `Stopped`.
pub struct SimulatedVco {
    signal: CvSignal,
    tx: Sender<TunerEvent>,
    model: VcoModel,
    standard: VoltageStandard,
    measurement_counter: u64,
}

impl SimulatedVco {
    pub fn new(
        signal: CvSignal,
        tx: Sender<TunerEvent>,
        standard: VoltageStandard,
        model: VcoModel,
    ) -> Self {
        Self {
            signal,
            tx,
            model,
            standard,
            measurement_counter: 0,
        }
    }

    pub fn model(&self) -> &VcoModel {
        &self.model
    }

    pub fn measurements_taken(&self) -> u64 {
        self.measurement_counter
    }

    /// Frequency the oscillator produces at `volts`, before jitter.
    pub fn frequency_at(&self, volts: f64) -> f64 {
        let m = &self.model;
        let detune_cents = m.offset_cents + m.bow_cents * volts * volts;
        match self.standard {
            VoltageStandard::OneVoltPerOctave => {
                let pitch = ZERO_VOLT_MIDI + 12.0 * volts * m.tracking + detune_cents / 100.0;
                midi_to_hz(pitch)
            }
            VoltageStandard::HzPerVolt => {
                volts * m.hz_per_volt * m.tracking * 2f64.powf(detune_cents / 1200.0)
            }
        }
    }

    fn jitter_cents(&self) -> f64 {
        self.model.jitter_cents * (self.measurement_counter as f64 * 1.7).sin()
    }
}

impl PitchMeter for SimulatedVco {
    fn start_single_measurement(&mut self, target_note: i32) {
        if !self.signal.is_active() {
            debug!("Simulated tuner: no signal");
            let _ = self.tx.send(TunerEvent::Stopped);
            return;
        }

        self.measurement_counter += 1;
        let volts = self.signal.voltage();
        let frequency = self.frequency_at(volts) * 2f64.powf(self.jitter_cents() / 1200.0);
        let pitch_offset_semitones = hz_to_midi(frequency)
            .map(|p| p - target_note as f64)
            .unwrap_or(0.0);

        trace!(
            "Simulated tuner: {:+.4}V → {:.3}Hz ({:+.1} cents from note {})",
            volts,
            frequency,
            pitch_offset_semitones * 100.0,
            target_note
        );
        let _ = self.tx.send(TunerEvent::MeasurementReady(Measurement {
            frequency,
            pitch_offset_semitones,
            pitch_deviation: self.model.jitter_cents.abs() / 100.0,
        }));
    }

    fn stop(&mut self) {}
}
