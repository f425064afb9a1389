use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use log::{error, info};

use crate::cv_output::CvSignal;

/// Live DC output via cpal, for a DC-coupled interface.
///
/// Holds the cpal `Stream` alive. Drop this to stop output.
/// Every frame carries the `CvSignal` level on `channel` and silence on
/// the rest; an inactive signal outputs silence on all channels.
pub struct CvStream {
    _stream: Stream,
}

impl CvStream {
    /// Open the default output device and start streaming.
    pub fn start(signal: CvSignal, channel: usize) -> Result<Self, String> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| "No default audio output device found".to_string())?;

        info!(
            "CV output device: {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );

        let supported = device
            .default_output_config()
            .map_err(|e| format!("No supported output config: {e}"))?;
        let format = supported.sample_format();
        let config: StreamConfig = supported.into();
        let channels = config.channels as usize;

        if channel >= channels {
            return Err(format!(
                "Output channel {channel} out of range: device has {channels} channel(s)"
            ));
        }

        info!(
            "Output config: {}Hz  {} ch  {:?}  (CV on ch {})",
            config.sample_rate.0, channels, format, channel
        );

        let err_fn = |e: cpal::StreamError| error!("CV stream error: {e}");

        let stream = match format {
            SampleFormat::F32 => device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _| {
                        signal.fill_interleaved(data, channels, channel);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| e.to_string())?,
            SampleFormat::I16 => device
                .build_output_stream(
                    &config,
                    move |data: &mut [i16], _| {
                        let level = to_i16(signal.sample());
                        fill_frames(data, channels, channel, level, 0);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| e.to_string())?,
            SampleFormat::U16 => device
                .build_output_stream(
                    &config,
                    move |data: &mut [u16], _| {
                        let level = to_u16(signal.sample());
                        fill_frames(data, channels, channel, level, 32768);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| e.to_string())?,
            fmt => {
                return Err(format!(
                    "Unsupported sample format {fmt:?}. Use an F32 or I16 device."
                ))
            }
        };

        stream.play().map_err(|e| e.to_string())?;
        Ok(Self { _stream: stream })
    }
}

// ─── Per-format sample helpers ───────────────────────────────────────────────

fn fill_frames<T: Copy>(data: &mut [T], channels: usize, channel: usize, level: T, silence: T) {
    for frame in data.chunks_mut(channels) {
        for (i, s) in frame.iter_mut().enumerate() {
            *s = if i == channel { level } else { silence };
        }
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

fn to_u16(sample: f32) -> u16 {
    // U16: 0 = -1.0, 32768 = 0.0, 65535 = +1.0
    (sample.clamp(-1.0, 1.0) * 32768.0 + 32768.0).round().clamp(0.0, 65535.0) as u16
}
