pub mod calibration_table;
pub mod cv_output;
pub mod engine;
pub mod error;
pub mod runner;
pub mod simulator;
pub mod types;
pub mod voltage;

#[cfg(feature = "audio")]
pub mod cv_stream;
