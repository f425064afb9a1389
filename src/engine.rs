//! Calibration sweep state machine.
//!
//! The engine is stepped by a fixed 10 ms tick and never blocks: settling
//! and waiting for the pitch meter are states, not sleeps. Measurements come
//! back as `TunerEvent`s on a channel and are drained on the control thread
//! at the start of each tick (`poll`), so every state change happens on one
//! thread in a total order.
//!
//! ```text
//! Idle → Starting → SettlingVoltage → WaitingForMeasurement → ProcessingResult
//!                        ↑                     ↑__________________|  (more samples)
//!                        |__________ MovingToNext ←______________|  (note done)
//!                                        ↓
//!                                    Completed
//! ```
//! `Paused` is reachable from any running state, `Error` from any state.

use crate::calibration_table::{CalibrationTable, Entry};
use crate::cv_output::CvOutput;
use crate::error::SweepError;
use crate::types::*;
use crate::voltage::{hz_to_midi, midi_to_hz};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, trace, warn};

/// The external pitch meter, as seen by the engine.
///
/// Results are not returned from these calls: the meter delivers them later
/// as `TunerEvent`s on the channel the engine is polled with.
pub trait PitchMeter {
    /// Take one measurement of the oscillator, expected near `target_note`.
    fn start_single_measurement(&mut self, target_note: i32);
    /// Stop producing measurements.
    fn stop(&mut self);
}

/// Receives sweep notifications synchronously, on the control thread, at
/// the moment of the triggering transition.
pub trait SweepObserver {
    fn started(&mut self) {}
    fn point_completed(&mut self, _point: &CalibrationPoint) {}
    fn progress(&mut self, _percent: f64, _status: &str) {}
    fn completed(&mut self, _table: &CalibrationTable) {}
    fn error(&mut self, _message: &str) {}
    fn cancelled(&mut self) {}
}

/// Forwards every notification as an owned `SweepEvent`.
pub struct ChannelObserver {
    tx: Sender<SweepEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<SweepEvent>) -> Self {
        Self { tx }
    }
}

impl SweepObserver for ChannelObserver {
    fn started(&mut self) {
        let _ = self.tx.send(SweepEvent::Started);
    }

    fn point_completed(&mut self, point: &CalibrationPoint) {
        let _ = self.tx.send(SweepEvent::PointCompleted(point.clone()));
    }

    fn progress(&mut self, percent: f64, status: &str) {
        let _ = self.tx.send(SweepEvent::Progress {
            percent,
            status: status.to_string(),
        });
    }

    fn completed(&mut self, table: &CalibrationTable) {
        let _ = self.tx.send(SweepEvent::Completed(table.clone()));
    }

    fn error(&mut self, message: &str) {
        let _ = self.tx.send(SweepEvent::Error(message.to_string()));
    }

    fn cancelled(&mut self) {
        let _ = self.tx.send(SweepEvent::Cancelled);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type BoxedObserver = Box<dyn SweepObserver + Send>;

pub struct SweepEngine<C, M> {
    cv: Option<C>,
    meter: Option<M>,
    observers: Vec<(ObserverId, BoxedObserver)>,
    next_observer_id: u64,

    state: SweepState,
    /// State the sweep was in when paused; decides where resume re-enters.
    paused_from: SweepState,
    /// Whether the periodic tick is live. Quiescent states switch it off.
    ticking: bool,
    settings: CalibrationSettings,

    note_index: i32,
    /// Samples folded into the current point.
    measurement_count: u32,
    settle_counter: u32,
    current_point: CalibrationPoint,
    /// Set while a manual point is in progress: the sweep state it interrupted.
    interrupted: Option<SweepState>,
    frequency_samples: Vec<f64>,
    calibration_data: Vec<CalibrationPoint>,
    completed_table: Option<CalibrationTable>,
}

impl<C: CvOutput, M: PitchMeter> Default for SweepEngine<C, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CvOutput, M: PitchMeter> SweepEngine<C, M> {
    pub fn new() -> Self {
        Self {
            cv: None,
            meter: None,
            observers: Vec::new(),
            next_observer_id: 0,
            state: SweepState::Idle,
            paused_from: SweepState::Idle,
            ticking: false,
            settings: CalibrationSettings::default(),
            note_index: 0,
            measurement_count: 0,
            settle_counter: 0,
            current_point: CalibrationPoint::default(),
            interrupted: None,
            frequency_samples: Vec::new(),
            calibration_data: Vec::new(),
            completed_table: None,
        }
    }

    pub fn with_cv_output(mut self, cv: C) -> Self {
        self.cv = Some(cv);
        self
    }

    pub fn with_pitch_meter(mut self, meter: M) -> Self {
        self.meter = Some(meter);
        self
    }

    pub fn cv_output(&self) -> Option<&C> {
        self.cv.as_ref()
    }

    /// Mutable access to the CV output, e.g. to change its interface
    /// calibration. Refused while a sweep is running or paused.
    pub fn cv_output_mut(&mut self) -> Result<&mut C, SweepError> {
        if self.is_running() {
            return Err(SweepError::CalibrationLocked);
        }
        self.cv
            .as_mut()
            .ok_or(SweepError::MissingCollaborator("CV output"))
    }

    pub fn pitch_meter(&self) -> Option<&M> {
        self.meter.as_ref()
    }

    // ─── Observers ──────────────────────────────────────────────────

    /// Observers are notified in registration order.
    pub fn add_observer(&mut self, observer: BoxedObserver) -> ObserverId {
        let id = ObserverId(self.next_observer_id);
        self.next_observer_id += 1;
        self.observers.push((id, observer));
        id
    }

    pub fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    fn broadcast(&mut self, mut f: impl FnMut(&mut (dyn SweepObserver + Send))) {
        for (_, observer) in self.observers.iter_mut() {
            f(observer.as_mut());
        }
    }

    // ─── State & progress ───────────────────────────────────────────

    pub fn state(&self) -> SweepState {
        self.state
    }

    /// True from start until the sweep completes, fails or is cancelled.
    /// A paused sweep counts as running.
    pub fn is_running(&self) -> bool {
        !matches!(
            self.state,
            SweepState::Idle | SweepState::Completed | SweepState::Error
        )
    }

    pub fn is_paused(&self) -> bool {
        self.state == SweepState::Paused
    }

    pub fn is_ticking(&self) -> bool {
        self.ticking
    }

    pub fn settings(&self) -> &CalibrationSettings {
        &self.settings
    }

    pub fn total_points(&self) -> usize {
        self.settings.total_points()
    }

    pub fn completed_points(&self) -> usize {
        self.calibration_data.len()
    }

    pub fn progress_percent(&self) -> f64 {
        let total = self.total_points();
        if total == 0 {
            return 0.0;
        }
        // Manual points off the sweep grid can push the count past the total.
        (100.0 * self.calibration_data.len() as f64 / total as f64).min(100.0)
    }

    pub fn current_point(&self) -> &CalibrationPoint {
        &self.current_point
    }

    pub fn calibration_data(&self) -> &[CalibrationPoint] {
        &self.calibration_data
    }

    /// Hand over the table produced by the last completed sweep.
    pub fn take_table(&mut self) -> Option<CalibrationTable> {
        self.completed_table.take()
    }

    /// Build a table from the points collected so far, sorted by note.
    pub fn generate_calibration_table(&self) -> CalibrationTable {
        let mut table = CalibrationTable::new();
        for point in &self.calibration_data {
            let ideal = self
                .cv
                .as_ref()
                .map_or(point.target_voltage, |cv| {
                    cv.midi_to_voltage(point.target_midi_note as f64)
                });
            table.add_entry(Entry {
                midi_note: point.target_midi_note,
                ideal_voltage: ideal,
                actual_voltage: ideal + point.voltage_correction,
                correction_offset: point.voltage_correction,
                measured_frequency: point.measured_frequency,
                error_cents: point.error_cents,
                std_dev_cents: point.std_dev_cents,
            });
        }
        table.sort_by_midi_note();
        table.set_calibration_date(Utc::now());
        table.set_voltage_standard(self.settings.standard.label());
        table
    }

    // ─── Control ────────────────────────────────────────────────────

    pub fn start_calibration(&mut self, settings: CalibrationSettings) -> Result<(), SweepError> {
        if self.is_running() {
            warn!("Ignoring start request: sweep already running ({:?})", self.state);
            return Err(SweepError::AlreadyRunning);
        }

        let precheck = if self.cv.is_none() {
            Err(SweepError::MissingCollaborator("CV output"))
        } else if self.meter.is_none() {
            Err(SweepError::MissingCollaborator("pitch meter"))
        } else {
            settings.validate()
        };
        if let Err(e) = precheck {
            self.set_error(&e.to_string());
            return Err(e);
        }

        self.settings = settings;
        self.calibration_data.clear();
        self.frequency_samples.clear();
        self.current_point = CalibrationPoint::default();
        self.interrupted = None;
        self.completed_table = None;
        self.note_index = 0;
        self.measurement_count = 0;
        self.settle_counter = 0;

        if let Some(cv) = self.cv.as_mut() {
            cv.set_voltage_standard(self.settings.standard);
            cv.set_active(true);
        }

        self.state = SweepState::Starting;
        self.ticking = true;
        info!(
            "Calibration started: notes {}..={} step {}, settle {}ms, {} sample(s)/note, {}{}",
            self.settings.start_note,
            self.settings.end_note,
            self.settings.note_step,
            self.settings.settle_time_ms,
            self.settings.measurements_per_note,
            self.settings.standard,
            if self.settings.use_external_cv_source { ", external CV" } else { "" },
        );
        self.broadcast(|o| o.started());
        self.broadcast(|o| o.progress(0.0, "Starting calibration..."));
        Ok(())
    }

    pub fn pause_calibration(&mut self) -> Result<(), SweepError> {
        if !self.is_running() {
            return Err(SweepError::NotRunning(self.state));
        }
        if self.state == SweepState::Paused {
            return Ok(());
        }
        self.paused_from = self.state;
        self.state = SweepState::Paused;
        self.ticking = false;
        self.deactivate_output();
        info!(
            "Calibration paused at note {} ({:?})",
            self.current_point.target_midi_note, self.paused_from
        );
        Ok(())
    }

    /// Resume a paused sweep. The oscillator always gets a fresh settle
    /// period; a transition that was pending at pause time runs first.
    pub fn resume_calibration(&mut self) -> Result<(), SweepError> {
        if self.state != SweepState::Paused {
            return Err(SweepError::NotPaused(self.state));
        }
        if let Some(cv) = self.cv.as_mut() {
            cv.set_active(true);
        }
        self.ticking = true;
        match self.paused_from {
            SweepState::Starting => {
                self.note_index = 0;
                self.begin_point(self.settings.start_note);
            }
            // Current point already appended.
            SweepState::MovingToNext => self.advance_to_next_point(),
            SweepState::ProcessingResult
                if self.measurement_count >= self.settings.measurements_per_note =>
            {
                self.complete_point();
                self.advance_to_next_point();
            }
            _ => {
                self.output_current_voltage();
                self.state = SweepState::SettlingVoltage;
                self.settle_counter = 0;
            }
        }
        info!(
            "Calibration resumed at note {} ({:?})",
            self.current_point.target_midi_note, self.state
        );
        Ok(())
    }

    /// Abandon the sweep. No table is produced from the points collected so far.
    pub fn cancel_calibration(&mut self) -> Result<(), SweepError> {
        if !self.is_running() {
            return Err(SweepError::NotRunning(self.state));
        }
        self.ticking = false;
        self.state = SweepState::Idle;
        self.deactivate_output();
        self.current_point = CalibrationPoint::default();
        self.frequency_samples.clear();
        self.measurement_count = 0;
        info!(
            "Calibration cancelled after {} of {} points",
            self.calibration_data.len(),
            self.total_points()
        );
        self.broadcast(|o| o.cancelled());
        Ok(())
    }

    /// External-CV mode: the caller has set the oscillator to `known_voltage`
    /// by other means. Skips the CV output and measures straight away.
    ///
    /// Refused while a measurement is outstanding. Once the manual point is
    /// complete the sweep picks up the note it interrupted.
    pub fn trigger_manual_measurement(&mut self, known_voltage: f64) -> Result<(), SweepError> {
        if !self.settings.use_external_cv_source {
            return Err(SweepError::ExternalSourceDisabled);
        }
        if !self.is_running() || self.is_paused() {
            return Err(SweepError::NotRunning(self.state));
        }
        if matches!(
            self.state,
            SweepState::WaitingForMeasurement | SweepState::ProcessingResult
        ) {
            return Err(SweepError::MeasurementPending);
        }
        let cv = self
            .cv
            .as_ref()
            .ok_or(SweepError::MissingCollaborator("CV output"))?;
        let note = cv.voltage_to_midi(known_voltage)?.round() as i32;

        debug!("Manual measurement at {:+.4}V → note {}", known_voltage, note);
        if self.interrupted.is_none() {
            self.interrupted = Some(self.state);
        }
        self.current_point = CalibrationPoint::new(note, known_voltage);
        self.frequency_samples.clear();
        self.measurement_count = 0;
        self.state = SweepState::WaitingForMeasurement;
        self.start_measurement();
        Ok(())
    }

    // ─── Event intake ───────────────────────────────────────────────

    /// Handle one event from the pitch meter. Must run on the control thread.
    pub fn on_tuner_event(&mut self, event: TunerEvent) {
        match event {
            TunerEvent::MeasurementReady(m) => {
                if self.state != SweepState::WaitingForMeasurement {
                    trace!("Dropping measurement of {:.3}Hz in {:?}", m.frequency, self.state);
                    return;
                }
                self.process_measurement(&m);
            }
            TunerEvent::Stopped => {
                if self.state == SweepState::WaitingForMeasurement {
                    self.set_error("Measurement failed - no signal detected");
                }
            }
        }
    }

    /// Drain pending meter events, then run one tick.
    pub fn poll(&mut self, events: &Receiver<TunerEvent>) {
        while let Ok(event) = events.try_recv() {
            self.on_tuner_event(event);
        }
        self.tick();
    }

    /// Advance the state machine by one tick period.
    pub fn tick(&mut self) {
        if !self.ticking {
            return;
        }

        match self.state {
            SweepState::Starting => {
                self.note_index = 0;
                self.begin_point(self.settings.start_note);
            }

            SweepState::SettlingVoltage => {
                self.settle_counter += 1;
                if self.settle_counter * TICK_MS >= self.settings.settle_time_ms {
                    self.state = SweepState::WaitingForMeasurement;
                    self.start_measurement();
                }
            }

            // Advanced only by on_tuner_event. No timeout.
            SweepState::WaitingForMeasurement => {}

            SweepState::ProcessingResult => {
                if self.measurement_count >= self.settings.measurements_per_note {
                    self.complete_point();
                } else {
                    self.state = SweepState::WaitingForMeasurement;
                    self.start_measurement();
                }
            }

            SweepState::MovingToNext => self.advance_to_next_point(),

            state if state.is_quiescent() => self.ticking = false,
            _ => {}
        }
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn begin_point(&mut self, note: i32) {
        let volts = self
            .cv
            .as_ref()
            .map_or(0.0, |cv| cv.midi_to_voltage(note as f64));
        self.current_point = CalibrationPoint::new(note, volts);
        self.measurement_count = 0;
        self.frequency_samples.clear();
        self.output_current_voltage();
        self.state = SweepState::SettlingVoltage;
        self.settle_counter = 0;
        debug!("Note {} → {:+.4}V, settling", note, volts);
    }

    fn advance_to_next_point(&mut self) {
        match self.interrupted.take() {
            // The interrupted point was already appended; carry on as usual.
            None | Some(SweepState::MovingToNext) => {}
            Some(_) => {
                let note = self.settings.start_note + self.note_index * self.settings.note_step;
                self.begin_point(note);
                return;
            }
        }
        self.note_index += 1;
        let note = self.settings.start_note + self.note_index * self.settings.note_step;
        if note > self.settings.end_note {
            self.finish_calibration();
        } else {
            self.begin_point(note);
        }
    }

    fn output_current_voltage(&mut self) {
        if self.settings.use_external_cv_source {
            return;
        }
        let volts = self.current_point.target_voltage;
        if let Some(cv) = self.cv.as_mut() {
            cv.output_voltage(volts);
        }
    }

    fn start_measurement(&mut self) {
        let note = self.current_point.target_midi_note;
        if let Some(meter) = self.meter.as_mut() {
            trace!("Requesting measurement for note {}", note);
            meter.start_single_measurement(note);
        }
    }

    fn process_measurement(&mut self, m: &Measurement) {
        if !m.frequency.is_finite() || m.frequency <= 0.0 {
            self.set_error(&format!(
                "Measurement failed - invalid frequency {} Hz",
                m.frequency
            ));
            return;
        }

        self.frequency_samples.push(m.frequency);
        self.measurement_count += 1;
        let avg_freq =
            self.frequency_samples.iter().sum::<f64>() / self.frequency_samples.len() as f64;

        let target = self.current_point.target_midi_note as f64;
        let measured_pitch = match hz_to_midi(avg_freq) {
            Ok(p) => p,
            Err(e) => {
                self.set_error(&format!("Measurement failed - {e}"));
                return;
            }
        };
        let pitch_error = measured_pitch - target;

        // Sharp reading ⇒ less voltage.
        let voltage_correction = match self.settings.standard {
            VoltageStandard::OneVoltPerOctave => -pitch_error / 12.0,
            VoltageStandard::HzPerVolt => {
                let scale = self
                    .cv
                    .as_ref()
                    .map_or(DEFAULT_HZ_PER_VOLT, |cv| cv.hz_per_volt());
                (midi_to_hz(target) - avg_freq) / scale
            }
        };

        let point = &mut self.current_point;
        point.measured_frequency = avg_freq;
        point.measured_pitch = measured_pitch;
        point.pitch_error = pitch_error;
        point.error_cents = pitch_error * 100.0;
        point.voltage_correction = voltage_correction;
        point.std_dev_cents = m.pitch_deviation * 100.0;
        point.timestamp = Some(Utc::now());

        trace!(
            "Sample {}/{} for note {}: {:.3}Hz (avg {:.3}Hz)",
            self.measurement_count,
            self.settings.measurements_per_note,
            point.target_midi_note,
            m.frequency,
            avg_freq
        );
        self.state = SweepState::ProcessingResult;
    }

    fn complete_point(&mut self) {
        let point = self.current_point.clone();
        // One point per note: a re-measurement replaces the earlier result.
        match self
            .calibration_data
            .iter_mut()
            .find(|p| p.target_midi_note == point.target_midi_note)
        {
            Some(existing) => *existing = point.clone(),
            None => self.calibration_data.push(point.clone()),
        }
        debug!("{}", point);

        let percent = self.progress_percent();
        let status = format!(
            "Note {}: {:.1} cents error",
            point.target_midi_note, point.error_cents
        );
        self.broadcast(|o| o.point_completed(&point));
        self.broadcast(|o| o.progress(percent, &status));
        self.state = SweepState::MovingToNext;
    }

    fn finish_calibration(&mut self) {
        self.ticking = false;
        self.state = SweepState::Completed;
        self.deactivate_output();

        let table = self.generate_calibration_table();
        info!(
            "Calibration complete: {} points, rms error {:.2} cents",
            table.len(),
            table.rms_error_cents()
        );
        self.broadcast(|o| o.completed(&table));
        self.completed_table = Some(table);
    }

    fn set_error(&mut self, message: &str) {
        self.ticking = false;
        self.state = SweepState::Error;
        self.deactivate_output();
        error!("Calibration error: {}", message);
        self.broadcast(|o| o.error(message));
    }

    fn deactivate_output(&mut self) {
        if let Some(cv) = self.cv.as_mut() {
            cv.set_active(false);
        }
        if let Some(meter) = self.meter.as_mut() {
            meter.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cv_output::CvOutputManager;
    use crossbeam_channel::{unbounded, Receiver};
    use std::collections::VecDeque;

    /// Answers each request immediately with a scripted frequency, or the
    /// note's ideal frequency detuned by `cents` when the script is empty.
    struct ScriptedMeter {
        tx: Sender<TunerEvent>,
        requests: Vec<i32>,
        stops: usize,
        respond: bool,
        cents: f64,
        script: VecDeque<f64>,
        deviation: f64,
    }

    impl ScriptedMeter {
        fn new(tx: Sender<TunerEvent>) -> Self {
            Self {
                tx,
                requests: Vec::new(),
                stops: 0,
                respond: true,
                cents: 0.0,
                script: VecDeque::new(),
                deviation: 0.0,
            }
        }
    }

    impl PitchMeter for ScriptedMeter {
        fn start_single_measurement(&mut self, target_note: i32) {
            self.requests.push(target_note);
            if !self.respond {
                return;
            }
            let frequency = self
                .script
                .pop_front()
                .unwrap_or_else(|| midi_to_hz(target_note as f64 + self.cents / 100.0));
            let _ = self.tx.send(TunerEvent::MeasurementReady(Measurement {
                frequency,
                pitch_offset_semitones: self.cents / 100.0,
                pitch_deviation: self.deviation,
            }));
        }

        fn stop(&mut self) {
            self.stops += 1;
        }
    }

    type Engine = SweepEngine<CvOutputManager, ScriptedMeter>;

    struct Rig {
        engine: Engine,
        tuner_rx: Receiver<TunerEvent>,
        tuner_tx: Sender<TunerEvent>,
        events: Receiver<SweepEvent>,
    }

    fn rig_with(configure: impl FnOnce(&mut ScriptedMeter)) -> Rig {
        let (tuner_tx, tuner_rx) = unbounded();
        let (event_tx, events) = unbounded();
        let mut meter = ScriptedMeter::new(tuner_tx.clone());
        configure(&mut meter);
        let mut engine = Engine::new()
            .with_cv_output(CvOutputManager::new())
            .with_pitch_meter(meter);
        engine.add_observer(Box::new(ChannelObserver::new(event_tx)));
        Rig {
            engine,
            tuner_rx,
            tuner_tx,
            events,
        }
    }

    fn rig() -> Rig {
        rig_with(|_| {})
    }

    fn settings(start: i32, end: i32) -> CalibrationSettings {
        CalibrationSettings {
            start_note: start,
            end_note: end,
            note_step: 1,
            settle_time_ms: 20,
            measurements_per_note: 1,
            ..Default::default()
        }
    }

    impl Rig {
        fn ticks(&mut self, n: usize) {
            for _ in 0..n {
                self.engine.poll(&self.tuner_rx);
            }
        }

        fn run_to_end(&mut self) {
            for _ in 0..100_000 {
                if !self.engine.is_ticking() {
                    return;
                }
                self.engine.poll(&self.tuner_rx);
            }
            panic!("sweep never finished, stuck in {:?}", self.engine.state());
        }

        fn drain(&self) -> Vec<SweepEvent> {
            self.events.try_iter().collect()
        }
    }

    #[test]
    fn test_missing_collaborators_is_an_error() {
        let (tx, rx) = unbounded();
        let mut engine: Engine = SweepEngine::new();
        engine.add_observer(Box::new(ChannelObserver::new(tx)));
        let err = engine.start_calibration(CalibrationSettings::default()).unwrap_err();
        assert!(matches!(err, SweepError::MissingCollaborator("CV output")));
        assert_eq!(engine.state(), SweepState::Error);
        assert!(!engine.is_ticking());

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SweepEvent::Error(msg) if msg.contains("CV output")));

        let mut engine: Engine = SweepEngine::new().with_cv_output(CvOutputManager::new());
        assert!(matches!(
            engine.start_calibration(CalibrationSettings::default()),
            Err(SweepError::MissingCollaborator("pitch meter"))
        ));
    }

    #[test]
    fn test_invalid_settings_rejected_at_start() {
        let mut r = rig();
        let bad = CalibrationSettings {
            start_note: 70,
            end_note: 60,
            ..Default::default()
        };
        assert!(matches!(
            r.engine.start_calibration(bad),
            Err(SweepError::InvalidSettings(_))
        ));
        assert!(!r.engine.is_running());
        assert!(!r.engine.cv_output().unwrap().is_active());
        assert!(matches!(r.drain().as_slice(), [SweepEvent::Error(_)]));
    }

    #[test]
    fn test_full_sweep_with_ideal_oscillator() {
        let mut r = rig();
        r.engine.start_calibration(settings(60, 62)).unwrap();
        assert!(r.engine.cv_output().unwrap().is_active());
        r.run_to_end();

        assert_eq!(r.engine.state(), SweepState::Completed);
        assert!(!r.engine.cv_output().unwrap().is_active());

        let events = r.drain();
        assert!(matches!(events[0], SweepEvent::Started));
        assert!(matches!(&events[1], SweepEvent::Progress { percent, .. } if *percent == 0.0));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SweepEvent::Error(_) | SweepEvent::Cancelled)));

        let tables: Vec<&CalibrationTable> = events
            .iter()
            .filter_map(|e| match e {
                SweepEvent::Completed(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(tables.len(), 1, "completed fires exactly once");
        let table = tables[0];
        let notes: Vec<i32> = table.entries().iter().map(|e| e.midi_note).collect();
        assert_eq!(notes, vec![60, 61, 62]);
        for e in table.entries() {
            assert!(e.error_cents.abs() < 1e-6, "note {} err {}", e.midi_note, e.error_cents);
            assert!(e.correction_offset.abs() < 1e-9);
        }
        assert_eq!(table.voltage_standard(), "1V/Oct");

        let owned = r.engine.take_table().expect("table handed over");
        assert_eq!(owned.len(), 3);
        assert!(r.engine.take_table().is_none());
    }

    #[test]
    fn test_settle_time_gates_measurement() {
        let mut r = rig();
        r.engine.start_calibration(settings(60, 60)).unwrap();
        r.ticks(1); // Starting → SettlingVoltage
        assert_eq!(r.engine.state(), SweepState::SettlingVoltage);
        r.ticks(1); // 10 ms
        assert!(r.engine.pitch_meter().unwrap().requests.is_empty());
        r.ticks(1); // 20 ms
        assert_eq!(r.engine.state(), SweepState::WaitingForMeasurement);
        assert_eq!(r.engine.pitch_meter().unwrap().requests, vec![60]);
    }

    #[test]
    fn test_drives_ideal_voltage_per_note() {
        let mut r = rig();
        r.engine.start_calibration(settings(72, 84)).unwrap();
        r.ticks(1);
        let cv = r.engine.cv_output().unwrap();
        assert!((cv.current_voltage() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_sharp_oscillator_gets_negative_correction() {
        let mut r = rig_with(|m| {
            m.cents = 10.0;
            m.deviation = 0.02;
        });
        r.engine.start_calibration(settings(48, 50)).unwrap();
        r.run_to_end();

        let table = r.engine.take_table().unwrap();
        for e in table.entries() {
            assert!((e.error_cents - 10.0).abs() < 1e-6);
            assert!((e.correction_offset + 0.1 / 12.0).abs() < 1e-9);
            assert!((e.actual_voltage - (e.ideal_voltage + e.correction_offset)).abs() < 1e-12);
            assert!((e.std_dev_cents - 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_samples_are_averaged() {
        let ideal = midi_to_hz(69.0);
        let mut r = rig_with(|m| {
            m.script = VecDeque::from(vec![ideal - 2.0, ideal + 4.0, ideal + 1.0]);
        });
        let s = CalibrationSettings {
            measurements_per_note: 3,
            ..settings(69, 69)
        };
        r.engine.start_calibration(s).unwrap();
        r.run_to_end();

        assert_eq!(r.engine.pitch_meter().unwrap().requests, vec![69, 69, 69]);
        let point = &r.engine.calibration_data()[0];
        assert!((point.measured_frequency - (ideal + 1.0)).abs() < 1e-9);
        assert!(point.error_cents > 0.0);
    }

    #[test]
    fn test_hz_per_volt_correction() {
        let mut r = rig_with(|m| m.cents = -20.0);
        let s = CalibrationSettings {
            standard: VoltageStandard::HzPerVolt,
            ..settings(69, 69)
        };
        r.engine.start_calibration(s).unwrap();
        r.run_to_end();

        let point = &r.engine.calibration_data()[0];
        let measured = midi_to_hz(69.0 - 0.2);
        let expected = (440.0 - measured) / DEFAULT_HZ_PER_VOLT;
        assert!((point.voltage_correction - expected).abs() < 1e-12);
        assert!(point.voltage_correction > 0.0, "flat ⇒ more voltage");

        let table = r.engine.take_table().unwrap();
        assert_eq!(table.voltage_standard(), "Hz/V");
        assert!((table.entries()[0].ideal_voltage - 0.44).abs() < 1e-12);
    }

    #[test]
    fn test_progress_reports_fraction_of_points() {
        let mut r = rig();
        r.engine.start_calibration(settings(60, 63)).unwrap();
        r.run_to_end();
        let percents: Vec<f64> = r
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                SweepEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![0.0, 25.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn test_note_step_skips_notes() {
        let mut r = rig();
        let s = CalibrationSettings {
            note_step: 5,
            ..settings(60, 72)
        };
        r.engine.start_calibration(s).unwrap();
        assert_eq!(r.engine.total_points(), 3);
        r.run_to_end();
        let notes: Vec<i32> = r.engine.calibration_data().iter().map(|p| p.target_midi_note).collect();
        assert_eq!(notes, vec![60, 65, 70]);
    }

    #[test]
    fn test_pause_and_resume_resettles() {
        let mut r = rig_with(|m| m.respond = false);
        r.engine.start_calibration(settings(60, 61)).unwrap();
        r.ticks(3);
        assert_eq!(r.engine.state(), SweepState::WaitingForMeasurement);

        r.engine.pause_calibration().unwrap();
        assert!(r.engine.is_paused());
        assert!(r.engine.is_running());
        assert!(!r.engine.is_ticking());
        assert!(!r.engine.cv_output().unwrap().is_active());
        assert_eq!(r.engine.pitch_meter().unwrap().stops, 1);

        // A late answer to the pre-pause request is dropped.
        r.tuner_tx
            .send(TunerEvent::MeasurementReady(Measurement {
                frequency: 261.0,
                pitch_offset_semitones: 0.0,
                pitch_deviation: 0.0,
            }))
            .unwrap();
        r.ticks(5);
        assert_eq!(r.engine.state(), SweepState::Paused);
        assert_eq!(r.engine.completed_points(), 0);

        r.engine.resume_calibration().unwrap();
        assert_eq!(r.engine.state(), SweepState::SettlingVoltage);
        assert!(r.engine.cv_output().unwrap().is_active());
        r.ticks(1);
        assert_eq!(r.engine.state(), SweepState::SettlingVoltage);
        r.ticks(1);
        assert_eq!(r.engine.state(), SweepState::WaitingForMeasurement);
        assert_eq!(r.engine.pitch_meter().unwrap().requests, vec![60, 60]);
    }

    #[test]
    fn test_pause_between_notes_does_not_duplicate_points() {
        let mut r = rig();
        r.engine.start_calibration(settings(60, 61)).unwrap();
        // Starting, 2× settle, ProcessingResult → MovingToNext
        r.ticks(4);
        assert_eq!(r.engine.state(), SweepState::MovingToNext);
        r.engine.pause_calibration().unwrap();
        r.engine.resume_calibration().unwrap();
        assert_eq!(r.engine.state(), SweepState::SettlingVoltage);
        assert_eq!(r.engine.current_point().target_midi_note, 61);
        r.run_to_end();
        let notes: Vec<i32> = r.engine.calibration_data().iter().map(|p| p.target_midi_note).collect();
        assert_eq!(notes, vec![60, 61]);
    }

    #[test]
    fn test_pause_and_resume_validity() {
        let mut r = rig();
        assert!(matches!(r.engine.pause_calibration(), Err(SweepError::NotRunning(_))));
        assert!(matches!(r.engine.resume_calibration(), Err(SweepError::NotPaused(_))));
        r.engine.start_calibration(settings(60, 60)).unwrap();
        assert!(matches!(r.engine.resume_calibration(), Err(SweepError::NotPaused(_))));
        assert!(matches!(
            r.engine.start_calibration(settings(60, 60)),
            Err(SweepError::AlreadyRunning)
        ));
    }

    #[test]
    fn test_cancel_discards_sweep_and_ignores_late_measurements() {
        let mut r = rig_with(|m| m.respond = false);
        r.engine.start_calibration(settings(60, 64)).unwrap();
        r.ticks(3);
        r.engine.cancel_calibration().unwrap();
        assert_eq!(r.engine.state(), SweepState::Idle);
        assert!(!r.engine.is_ticking());
        assert!(!r.engine.cv_output().unwrap().is_active());

        let before = r.engine.completed_points();
        r.tuner_tx
            .send(TunerEvent::MeasurementReady(Measurement {
                frequency: 261.6,
                pitch_offset_semitones: 0.0,
                pitch_deviation: 0.0,
            }))
            .unwrap();
        r.ticks(10);
        assert_eq!(r.engine.state(), SweepState::Idle);
        assert_eq!(r.engine.completed_points(), before);

        let events = r.drain();
        assert!(matches!(events.last(), Some(SweepEvent::Cancelled)));
        assert!(!events.iter().any(|e| matches!(e, SweepEvent::Completed(_))));
        assert!(r.engine.take_table().is_none());

        assert!(matches!(r.engine.cancel_calibration(), Err(SweepError::NotRunning(_))));
    }

    #[test]
    fn test_tuner_stopped_while_waiting_is_fatal() {
        let mut r = rig_with(|m| m.respond = false);
        r.engine.start_calibration(settings(60, 62)).unwrap();
        r.ticks(1);
        // Stopped outside the wait is ignored.
        r.tuner_tx.send(TunerEvent::Stopped).unwrap();
        r.ticks(2);
        assert_eq!(r.engine.state(), SweepState::WaitingForMeasurement);

        r.tuner_tx.send(TunerEvent::Stopped).unwrap();
        r.ticks(1);
        assert_eq!(r.engine.state(), SweepState::Error);
        assert!(!r.engine.is_ticking());
        assert!(!r.engine.cv_output().unwrap().is_active());
        let errors: Vec<String> = r
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                SweepEvent::Error(msg) => Some(msg),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["Measurement failed - no signal detected".to_string()]);
    }

    #[test]
    fn test_waiting_has_no_timeout() {
        let mut r = rig_with(|m| m.respond = false);
        r.engine.start_calibration(settings(60, 60)).unwrap();
        r.ticks(10_000);
        assert_eq!(r.engine.state(), SweepState::WaitingForMeasurement);
        assert!(r.engine.is_ticking());
        assert_eq!(r.engine.pitch_meter().unwrap().requests.len(), 1);
    }

    #[test]
    fn test_invalid_frequency_is_fatal() {
        let mut r = rig_with(|m| m.script = VecDeque::from(vec![0.0]));
        r.engine.start_calibration(settings(60, 60)).unwrap();
        r.ticks(4);
        assert_eq!(r.engine.state(), SweepState::Error);
    }

    #[test]
    fn test_manual_measurement_with_external_source() {
        let mut r = rig_with(|m| m.respond = false);
        let s = CalibrationSettings {
            use_external_cv_source: true,
            ..settings(60, 72)
        };
        r.engine.start_calibration(s).unwrap();
        r.ticks(1);
        // The engine never drives CV itself in external mode.
        assert_eq!(r.engine.cv_output().unwrap().current_voltage(), 0.0);

        r.engine.trigger_manual_measurement(1.0).unwrap();
        assert_eq!(r.engine.state(), SweepState::WaitingForMeasurement);
        assert_eq!(r.engine.current_point().target_midi_note, 72);
        assert_eq!(r.engine.pitch_meter().unwrap().requests, vec![72]);
    }

    fn external(start: i32, end: i32) -> CalibrationSettings {
        CalibrationSettings {
            use_external_cv_source: true,
            ..settings(start, end)
        }
    }

    #[test]
    fn test_manual_point_completes_and_sweep_resumes() {
        let mut r = rig();
        r.engine.start_calibration(external(60, 62)).unwrap();
        r.ticks(1);
        assert_eq!(r.engine.state(), SweepState::SettlingVoltage);

        r.engine.trigger_manual_measurement(1.0).unwrap();
        r.ticks(1);
        assert_eq!(r.engine.state(), SweepState::MovingToNext);
        let manual = &r.engine.calibration_data()[0];
        assert_eq!(manual.target_midi_note, 72);
        assert_eq!(manual.target_voltage, 1.0);
        assert!(manual.error_cents.abs() < 1e-6, "manual point error {}", manual.error_cents);
        assert!(manual.timestamp.is_some());

        // The interrupted sweep note is picked up again, not skipped.
        r.ticks(1);
        assert_eq!(r.engine.state(), SweepState::SettlingVoltage);
        assert_eq!(r.engine.current_point().target_midi_note, 60);

        r.run_to_end();
        assert_eq!(r.engine.state(), SweepState::Completed);
        assert_eq!(r.engine.progress_percent(), 100.0);
        let table = r.engine.take_table().unwrap();
        let notes: Vec<i32> = table.entries().iter().map(|e| e.midi_note).collect();
        assert_eq!(notes, vec![60, 61, 62, 72]);
        assert_eq!(r.engine.pitch_meter().unwrap().requests, vec![72, 60, 61, 62]);

        let percents: Vec<f64> = r
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                SweepEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        assert!(percents.iter().all(|p| *p <= 100.0), "progress {:?}", percents);
    }

    #[test]
    fn test_manual_trigger_refused_while_measurement_pending() {
        let mut r = rig();
        r.engine.start_calibration(external(60, 62)).unwrap();
        // Starting, 2× settle: the answer for note 60 is queued but not yet read.
        r.ticks(3);
        assert_eq!(r.engine.state(), SweepState::WaitingForMeasurement);
        assert!(matches!(
            r.engine.trigger_manual_measurement(1.0),
            Err(SweepError::MeasurementPending)
        ));
        assert_eq!(r.engine.current_point().target_midi_note, 60);

        r.ticks(1);
        let point = &r.engine.calibration_data()[0];
        assert_eq!(point.target_midi_note, 60);
        assert!(point.error_cents.abs() < 1e-6, "note 60 error {}", point.error_cents);
        assert!((point.measured_frequency - midi_to_hz(60.0)).abs() < 1e-9);
    }

    #[test]
    fn test_manual_trigger_refused_while_processing() {
        let mut r = rig_with(|m| m.respond = false);
        r.engine.start_calibration(external(60, 62)).unwrap();
        r.ticks(3);
        r.engine.on_tuner_event(TunerEvent::MeasurementReady(Measurement {
            frequency: midi_to_hz(60.0),
            pitch_offset_semitones: 0.0,
            pitch_deviation: 0.0,
        }));
        assert_eq!(r.engine.state(), SweepState::ProcessingResult);
        assert!(matches!(
            r.engine.trigger_manual_measurement(0.5),
            Err(SweepError::MeasurementPending)
        ));
    }

    #[test]
    fn test_manual_remeasure_replaces_sweep_point() {
        let mut r = rig_with(|m| {
            m.script = VecDeque::from(vec![midi_to_hz(60.0), midi_to_hz(60.1)]);
        });
        r.engine.start_calibration(external(60, 61)).unwrap();
        r.ticks(4);
        assert_eq!(r.engine.state(), SweepState::MovingToNext);
        assert_eq!(r.engine.completed_points(), 1);

        r.engine.trigger_manual_measurement(0.0).unwrap();
        r.run_to_end();

        assert_eq!(r.engine.completed_points(), 2);
        assert_eq!(r.engine.progress_percent(), 100.0);
        assert_eq!(r.engine.pitch_meter().unwrap().requests, vec![60, 60, 61]);
        let table = r.engine.take_table().unwrap();
        let notes: Vec<i32> = table.entries().iter().map(|e| e.midi_note).collect();
        assert_eq!(notes, vec![60, 61]);
        let c4 = table.find_entry_for_note(60).unwrap();
        assert!((c4.error_cents - 10.0).abs() < 1e-6, "latest measurement wins, got {}", c4.error_cents);
    }

    #[test]
    fn test_manual_measurement_requires_external_source() {
        let mut r = rig();
        r.engine.start_calibration(settings(60, 62)).unwrap();
        assert!(matches!(
            r.engine.trigger_manual_measurement(0.5),
            Err(SweepError::ExternalSourceDisabled)
        ));
    }

    #[test]
    fn test_cv_output_locked_while_running() {
        let mut r = rig();
        assert!(r.engine.cv_output_mut().is_ok());
        r.engine.start_calibration(settings(60, 61)).unwrap();
        assert!(matches!(r.engine.cv_output_mut(), Err(SweepError::CalibrationLocked)));
        r.engine.pause_calibration().unwrap();
        assert!(matches!(r.engine.cv_output_mut(), Err(SweepError::CalibrationLocked)));
        r.engine.resume_calibration().unwrap();
        r.run_to_end();
        let cv = r.engine.cv_output_mut().unwrap();
        cv.add_calibration_point(0.0, 0.0);
    }

    #[test]
    fn test_observers_in_registration_order() {
        use std::sync::{Arc, Mutex};

        struct Tag(&'static str, Arc<Mutex<Vec<&'static str>>>);
        impl SweepObserver for Tag {
            fn started(&mut self) {
                self.1.lock().unwrap().push(self.0);
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut r = rig();
        let a = r.engine.add_observer(Box::new(Tag("a", log.clone())));
        r.engine.add_observer(Box::new(Tag("b", log.clone())));
        r.engine.start_calibration(settings(60, 60)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);

        r.engine.cancel_calibration().unwrap();
        assert!(r.engine.remove_observer(a));
        assert!(!r.engine.remove_observer(a));
        r.engine.start_calibration(settings(60, 60)).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "b"]);
    }
}
