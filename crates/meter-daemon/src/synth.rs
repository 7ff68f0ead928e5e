//! Block synthesis: physical values in, interleaved S16_LE PCM out.
//!
//! Every call renders one fixed-length block starting at phase zero, so the
//! output depends only on its arguments.  Blocks are 100 ms long, an exact
//! multiple of the 1 kHz tone period, which keeps the seam between blocks
//! continuous.

use std::time::Duration;

use meter_proto::calibration::CalibrationTable;
use meter_proto::config::{Config, Encoding};
use meter_proto::protocol::PlaybackTarget;
use tracing::error;

pub const SAMPLE_RATE: u32 = 44_100;
pub const TONE_FREQUENCY_HZ: f64 = 1000.0;
pub const BLOCK_DURATION: Duration = Duration::from_millis(100);
pub const BYTES_PER_SAMPLE: usize = 2;

const FULL_SCALE: f64 = i16::MAX as f64;

/// Shape of one block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockFormat {
    pub sample_rate: u32,
    pub duration: Duration,
    pub tone_hz: f64,
}

impl Default for BlockFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            duration: BLOCK_DURATION,
            tone_hz: TONE_FREQUENCY_HZ,
        }
    }
}

impl BlockFormat {
    /// Frames per block (one sample per channel per frame).
    pub fn frames(&self) -> usize {
        (self.duration.as_secs_f64() * f64::from(self.sample_rate)).round() as usize
    }

    pub fn block_bytes(&self, num_channels: usize) -> usize {
        self.frames() * num_channels * BYTES_PER_SAMPLE
    }
}

/// Render one block.  `values` holds one gain or duty cycle per channel;
/// anything outside 0..=1 is clamped, so samples never leave the i16 range.
pub fn synthesize(values: &[f64], encoding: Encoding, format: &BlockFormat) -> Vec<u8> {
    let levels: Vec<f64> = values.iter().map(|v| unit_clamp(*v)).collect();
    let frames = format.frames();
    let mut out = Vec::with_capacity(format.block_bytes(levels.len()));

    for i in 0..frames {
        let t = i as f64 / f64::from(format.sample_rate);
        match encoding {
            Encoding::Gain => {
                let wave = (std::f64::consts::TAU * format.tone_hz * t).sin();
                for gain in &levels {
                    let sample = (wave * gain * FULL_SCALE).round() as i16;
                    out.extend_from_slice(&sample.to_le_bytes());
                }
            }
            Encoding::DutyCycle => {
                // Unipolar pulse: high for the first `duty` of each period, zero after.
                let phase = (t * format.tone_hz).fract();
                for duty in &levels {
                    let sample = if phase < *duty { i16::MAX } else { 0 };
                    out.extend_from_slice(&sample.to_le_bytes());
                }
            }
        }
    }

    out
}

fn unit_clamp(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Map every configured channel's requested percentage to its physical value.
///
/// Silent channels, and channels the target does not cover, come out as 0.
/// Entries past the table's channel count are ignored.
pub fn physical_values(table: &CalibrationTable, target: &PlaybackTarget) -> Vec<f64> {
    (0..table.num_channels())
        .map(|channel| match target.get(channel) {
            None => 0.0,
            Some(percentage) => table.interpolate(channel, percentage).unwrap_or_else(|e| {
                error!("channel {}: {}; playing silence", channel, e);
                0.0
            }),
        })
        .collect()
}

/// Everything one streaming cycle needs: config + target → PCM block.
pub fn render_block(config: &Config, target: &PlaybackTarget, format: &BlockFormat) -> Vec<u8> {
    let values = physical_values(&config.calibration_table(), target);
    synthesize(&values, config.audio.encoding, format)
}
