//! Producers for the playback state: the metric poll loop and the
//! calibration aids.  Each runs until the token is cancelled (or, for
//! `sweep`, until it has visited every breakpoint).

use std::time::Duration;

use meter_proto::config::Metric;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::MetricSampler;
use crate::playback::PlaybackState;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Sleep for `duration`.  Returns false if cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Percentages for the channels that have a metric; the rest stay silent.
pub fn metric_percentages(
    metrics: &[Option<Metric>],
    mut read: impl FnMut(Metric) -> f64,
) -> Vec<Option<f64>> {
    metrics
        .iter()
        .map(|metric| metric.map(|m| (read(m) * 100.0).clamp(0.0, 100.0)))
        .collect()
}

/// Drive every channel from its configured system metric.
pub async fn run_metrics(playback: &PlaybackState, cancel: CancellationToken) -> anyhow::Result<()> {
    let config = playback.config();
    let mut sampler = MetricSampler::default();
    info!("poller: driving needles from system metrics");

    loop {
        let (interval, metrics) = {
            let config = config.borrow();
            let metrics: Vec<Option<Metric>> =
                config.channels.iter().map(|channel| channel.metric).collect();
            (Duration::from_millis(config.poll.interval_ms).max(MIN_INTERVAL), metrics)
        };

        let percentages = metric_percentages(&metrics, |metric| sampler.read(metric));
        if let Err(e) = playback.play(percentages) {
            // Channel count changed between reading the config and playing.
            warn!("poller: {}", e);
        }

        if !pause(interval, &cancel).await {
            break;
        }
    }

    playback.stop_playing();
    Ok(())
}

/// Hold one channel at a fixed percentage, e.g. to check a calibration point.
pub async fn hold(
    playback: &PlaybackState,
    channel: usize,
    percentage: f64,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    playback.play_single_channel(channel, percentage)?;
    info!("hold: channel {} at {}%", channel, percentage);
    cancel.cancelled().await;
    playback.stop_playing();
    Ok(())
}

/// Visit every calibration breakpoint of one channel, or of all channels in
/// turn, holding each for `step`.
pub async fn sweep(
    playback: &PlaybackState,
    channel: Option<usize>,
    step: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let plan: Vec<(usize, Vec<u8>)> = {
        let config = playback.config();
        let config = config.borrow();
        let channels: Vec<usize> = match channel {
            Some(channel) if channel >= config.num_channels() => {
                anyhow::bail!(
                    "channel {} does not exist ({} channels configured)",
                    channel,
                    config.num_channels()
                )
            }
            Some(channel) => vec![channel],
            None => (0..config.num_channels()).collect(),
        };
        channels
            .into_iter()
            .map(|ch| {
                let points = config.channels[ch]
                    .calibration
                    .points()
                    .map(|(percent, _)| percent)
                    .collect();
                (ch, points)
            })
            .collect()
    };

    'outer: for (ch, points) in plan {
        for percent in points {
            playback.play_single_channel(ch, f64::from(percent))?;
            info!("sweep: channel {} at {}%", ch, percent);
            if !pause(step.max(MIN_INTERVAL), &cancel).await {
                break 'outer;
            }
        }
    }

    playback.stop_playing();
    Ok(())
}

/// Random percentages on every channel, changing every `interval`.
pub async fn random(
    playback: &PlaybackState,
    interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let channels = playback.config().borrow().num_channels();
        let percentages: Vec<Option<f64>> = {
            let mut rng = rand::thread_rng();
            (0..channels)
                .map(|_| Some(rng.gen_range(0.0..=100.0)))
                .collect()
        };
        info!("random: {:?}", percentages);
        playback.play(percentages)?;

        if !pause(interval.max(MIN_INTERVAL), &cancel).await {
            break;
        }
    }

    playback.stop_playing();
    Ok(())
}
