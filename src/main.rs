use cv_calibrator::calibration_table::{evaluate_polynomial, DEFAULT_FIT_DEGREE};
use cv_calibrator::cv_output::{CvOutputManager, InterfaceType};
#[cfg(feature = "audio")]
use cv_calibrator::cv_stream::CvStream;
use cv_calibrator::engine::{ChannelObserver, SweepEngine};
use cv_calibrator::runner::SweepRunner;
use cv_calibrator::simulator::{SimulatedVco, VcoModel};
use cv_calibrator::types::*;

use clap::Parser;
use crossbeam_channel::unbounded;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "cv-calibrator")]
#[command(about = "Voltage-to-pitch calibration sweep for CV-driven oscillators")]
struct Cli {
    /// First MIDI note of the sweep
    #[arg(long, default_value_t = 24)]
    start_note: i32,

    /// Last MIDI note of the sweep (inclusive)
    #[arg(long, default_value_t = 96)]
    end_note: i32,

    /// Semitones between calibration points
    #[arg(long, default_value_t = 1)]
    note_step: i32,

    /// Time for the oscillator to settle after each CV change (ms)
    #[arg(long, default_value_t = 200)]
    settle_ms: u32,

    /// Measurements averaged per note
    #[arg(long, default_value_t = 1)]
    measurements: u32,

    /// Voltage standard: "1v/oct" or "hz/v"
    #[arg(long, default_value = "1v/oct")]
    standard: VoltageStandard,

    /// Scale for the Hz/V standard
    #[arg(long, default_value_t = DEFAULT_HZ_PER_VOLT)]
    hz_per_volt: f64,

    /// Interface preset: "expert-sleepers", "motu", "generic" or "custom"
    #[arg(long, default_value = "generic")]
    interface: InterfaceType,

    /// Lower voltage bound for a custom interface
    #[arg(long, allow_hyphen_values = true)]
    min_volts: Option<f64>,

    /// Upper voltage bound for a custom interface
    #[arg(long, allow_hyphen_values = true)]
    max_volts: Option<f64>,

    /// Interface gain/offset correction file to load before the sweep
    #[arg(long)]
    interface_cal: Option<PathBuf>,

    /// Output channel carrying the CV
    #[arg(long, default_value_t = 0)]
    channel: usize,

    /// Where to write the calibration table
    #[arg(long, default_value = "calibration_table.json")]
    output: PathBuf,

    /// Oscillator name recorded in the table
    #[arg(long, default_value = "")]
    device_name: String,

    /// Oscillator brand recorded in the table
    #[arg(long, default_value = "")]
    device_brand: String,

    /// Free-form notes recorded in the table
    #[arg(long, default_value = "")]
    notes: String,

    /// Simulated VCO: scale tracking relative to ideal
    #[arg(long, default_value_t = 1.0)]
    sim_tracking: f64,

    /// Simulated VCO: constant offset (cents)
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    sim_offset: f64,

    /// Simulated VCO: deviation growing with volts² (cents/V²)
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    sim_bow: f64,

    /// Simulated VCO: peak measurement jitter (cents)
    #[arg(long, default_value_t = 0.0)]
    sim_jitter: f64,

    /// Degree of the correction polynomial to report
    #[arg(long, default_value_t = DEFAULT_FIT_DEGREE)]
    fit_degree: usize,

    /// Stream the CV to the default audio output device
    #[cfg(feature = "audio")]
    #[arg(long)]
    live_output: bool,
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let cli = Cli::parse();

    let settings = CalibrationSettings {
        start_note: cli.start_note,
        end_note: cli.end_note,
        note_step: cli.note_step,
        settle_time_ms: cli.settle_ms,
        measurements_per_note: cli.measurements,
        standard: cli.standard,
        use_external_cv_source: false,
    };
    if let Err(e) = settings.validate() {
        error!("{}", e);
        process::exit(2);
    }

    info!("═══════════════════════════════════════════════");
    info!("  CV CALIBRATOR v{}", env!("CARGO_PKG_VERSION"));
    info!("  Sweep: notes {}..={} step {} ({} points)",
          settings.start_note, settings.end_note, settings.note_step, settings.total_points());
    info!("  Standard: {}  Interface: {:?}", settings.standard, cli.interface);
    info!("═══════════════════════════════════════════════");

    // ─── CV output ──────────────────────────────────────────────────
    let mut cv = CvOutputManager::new();
    cv.set_interface_type(cli.interface);
    if let Err(e) = cv.apply_range_bounds(cli.min_volts, cli.max_volts) {
        error!("{} (--min-volts / --max-volts)", e);
        process::exit(2);
    }
    if let Err(e) = cv.set_hz_per_volt(cli.hz_per_volt) {
        error!("{}", e);
        process::exit(2);
    }
    cv.set_output_channel(cli.channel);
    if let Some(path) = &cli.interface_cal {
        if let Err(e) = cv.load_calibration(path) {
            error!("Failed to load interface calibration {}: {}", path.display(), e);
            process::exit(1);
        }
    }

    #[cfg(feature = "audio")]
    let _live = if cli.live_output {
        match CvStream::start(cv.signal(), cv.output_channel()) {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!("Live output unavailable: {}", e);
                process::exit(1);
            }
        }
    } else {
        None
    };

    // ─── Simulated oscillator + tuner ───────────────────────────────
    let (tuner_tx, tuner_rx) = unbounded::<TunerEvent>();
    let model = VcoModel {
        tracking: cli.sim_tracking,
        offset_cents: cli.sim_offset,
        bow_cents: cli.sim_bow,
        jitter_cents: cli.sim_jitter,
        hz_per_volt: cli.hz_per_volt,
    };
    let vco = SimulatedVco::new(cv.signal(), tuner_tx, settings.standard, model);

    // ─── Sweep ──────────────────────────────────────────────────────
    let (event_tx, event_rx) = unbounded::<SweepEvent>();
    let mut engine = SweepEngine::new().with_cv_output(cv).with_pitch_meter(vco);
    engine.add_observer(Box::new(ChannelObserver::new(event_tx)));

    let handle = match SweepRunner::spawn(engine, tuner_rx) {
        Ok(h) => h,
        Err(e) => {
            error!("Failed to spawn sweep thread: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = handle.start(settings) {
        error!("{}", e);
        process::exit(1);
    }

    let mut exit_code = 0;
    for event in event_rx.iter() {
        match event {
            SweepEvent::Started => debug!("Sweep started"),
            SweepEvent::PointCompleted(point) => debug!("{}", point),
            SweepEvent::Progress { percent, status } => info!("[{:5.1}%] {}", percent, status),
            SweepEvent::Completed(mut table) => {
                table.set_device_name(cli.device_name.as_str());
                table.set_device_brand(cli.device_brand.as_str());
                table.set_interface_name(format!("{:?}", cli.interface));
                table.set_notes(cli.notes.as_str());
                if let Err(e) = table.save(&cli.output) {
                    error!("Failed to write {}: {}", cli.output.display(), e);
                    exit_code = 1;
                } else {
                    info!("Calibration table written to {}", cli.output.display());
                }

                let stats = table.statistics();
                info!("  max {:+.2}  min {:+.2}  avg {:.2}  rms {:.2} cents",
                      stats.max_error_cents, stats.min_error_cents,
                      stats.avg_error_cents, stats.rms_error_cents);
                if let Some(note) = stats.worst_note {
                    info!("  worst note {} ({:+.2} cents)", note, stats.worst_error);
                }

                let coeffs = table.polynomial_coefficients(cli.fit_degree);
                if coeffs.is_empty() {
                    warn!("Not enough points for a degree-{} fit", cli.fit_degree);
                } else {
                    let terms: Vec<String> = coeffs
                        .iter()
                        .enumerate()
                        .map(|(i, c)| format!("{:+.6e}·p^{}", c, i))
                        .collect();
                    info!("  correction(p) = {}", terms.join(" "));
                    info!("  correction(60) = {:+.6}V", evaluate_polynomial(&coeffs, 60.0));
                }
                break;
            }
            SweepEvent::Error(msg) => {
                error!("Calibration failed: {}", msg);
                exit_code = 1;
                break;
            }
            SweepEvent::Cancelled => {
                warn!("Calibration cancelled");
                exit_code = 1;
                break;
            }
        }
    }

    if handle.shutdown().is_err() {
        error!("Sweep thread panicked");
        exit_code = 1;
    }
    process::exit(exit_code);
}
