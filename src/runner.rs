//! Runs a `SweepEngine` on its own control thread.
//!
//! The thread owns the engine outright. A 10 ms ticker drives `poll`, and
//! control calls from other threads arrive as `SweepCommand`s, so the engine
//! itself never needs a lock.

use crate::cv_output::CvOutput;
use crate::engine::{PitchMeter, SweepEngine};
use crate::error::SweepError;
use crate::types::*;
use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};
use log::{debug, info, warn};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone)]
pub enum SweepCommand {
    Start(CalibrationSettings),
    Pause,
    Resume,
    Cancel,
    /// External-CV mode: the oscillator now sits at this voltage.
    ManualMeasurement(f64),
    Shutdown,
}

struct Request {
    command: SweepCommand,
    reply: Sender<Result<(), SweepError>>,
}

pub struct SweepRunner;

impl SweepRunner {
    /// Move `engine` onto a new "sweep" thread. `tuner_rx` is the channel the
    /// pitch meter delivers its `TunerEvent`s on.
    pub fn spawn<C, M>(
        engine: SweepEngine<C, M>,
        tuner_rx: Receiver<TunerEvent>,
    ) -> std::io::Result<SweepHandle<C, M>>
    where
        C: CvOutput + Send + 'static,
        M: PitchMeter + Send + 'static,
    {
        let (requests_tx, requests_rx) = unbounded::<Request>();
        let thread = thread::Builder::new()
            .name("sweep".into())
            .spawn(move || run(engine, requests_rx, tuner_rx))?;
        Ok(SweepHandle {
            requests: requests_tx,
            thread,
        })
    }
}

fn run<C: CvOutput, M: PitchMeter>(
    mut engine: SweepEngine<C, M>,
    requests: Receiver<Request>,
    tuner_rx: Receiver<TunerEvent>,
) -> SweepEngine<C, M> {
    info!("Sweep runner started ({}ms tick)", TICK_MS);
    let ticker = tick(TICK_PERIOD);

    loop {
        select! {
            recv(requests) -> msg => match msg {
                Ok(Request { command: SweepCommand::Shutdown, reply }) => {
                    let _ = reply.send(Ok(()));
                    break;
                }
                Ok(Request { command, reply }) => {
                    debug!("Sweep command: {:?}", command);
                    let result = apply(&mut engine, command);
                    if let Err(e) = &result {
                        warn!("Sweep command rejected: {}", e);
                    }
                    let _ = reply.send(result);
                }
                // Every handle dropped.
                Err(_) => break,
            },
            recv(ticker) -> _ => engine.poll(&tuner_rx),
        }
    }

    if engine.is_running() {
        let _ = engine.cancel_calibration();
    }
    info!("Sweep runner stopped");
    engine
}

fn apply<C: CvOutput, M: PitchMeter>(
    engine: &mut SweepEngine<C, M>,
    command: SweepCommand,
) -> Result<(), SweepError> {
    match command {
        SweepCommand::Start(settings) => engine.start_calibration(settings),
        SweepCommand::Pause => engine.pause_calibration(),
        SweepCommand::Resume => engine.resume_calibration(),
        SweepCommand::Cancel => engine.cancel_calibration(),
        SweepCommand::ManualMeasurement(volts) => engine.trigger_manual_measurement(volts),
        SweepCommand::Shutdown => Ok(()),
    }
}

/// Control side of a running `SweepRunner`.
pub struct SweepHandle<C, M> {
    requests: Sender<Request>,
    thread: JoinHandle<SweepEngine<C, M>>,
}

impl<C, M> SweepHandle<C, M> {
    /// Send a command and wait for the engine's verdict.
    pub fn send(&self, command: SweepCommand) -> Result<(), SweepError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.requests
            .send(Request {
                command,
                reply: reply_tx,
            })
            .map_err(|_| SweepError::RunnerStopped)?;
        reply_rx.recv().map_err(|_| SweepError::RunnerStopped)?
    }

    pub fn start(&self, settings: CalibrationSettings) -> Result<(), SweepError> {
        self.send(SweepCommand::Start(settings))
    }

    pub fn pause(&self) -> Result<(), SweepError> {
        self.send(SweepCommand::Pause)
    }

    pub fn resume(&self) -> Result<(), SweepError> {
        self.send(SweepCommand::Resume)
    }

    pub fn cancel(&self) -> Result<(), SweepError> {
        self.send(SweepCommand::Cancel)
    }

    pub fn manual_measurement(&self, volts: f64) -> Result<(), SweepError> {
        self.send(SweepCommand::ManualMeasurement(volts))
    }

    /// Stop the thread and take the engine back. A sweep still in progress
    /// is cancelled first.
    pub fn shutdown(self) -> Result<SweepEngine<C, M>, SweepError> {
        let _ = self.send(SweepCommand::Shutdown);
        self.thread.join().map_err(|_| SweepError::RunnerStopped)
    }
}
