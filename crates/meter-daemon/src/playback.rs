use std::sync::Arc;

use meter_proto::config::Config;
use meter_proto::protocol::{PlaybackTarget, TargetError};
use tokio::sync::watch;
use tracing::debug;

/// Shared "what should the needles show" cell.
///
/// Cheap to clone; every clone writes to the same target.  Writers are the
/// metric poller and the calibration tools, the reader is the supervisor,
/// which picks up the latest value once per block.  Each update replaces the
/// whole target, so a reader never sees a half-written one.
#[derive(Clone)]
pub struct PlaybackState {
    target: Arc<watch::Sender<PlaybackTarget>>,
    config: watch::Receiver<Config>,
}

impl PlaybackState {
    /// All channels start silent.
    pub fn new(config: watch::Receiver<Config>) -> Self {
        let silent = PlaybackTarget::silent(config.borrow().num_channels());
        let (target, _) = watch::channel(silent);
        Self {
            target: Arc::new(target),
            config,
        }
    }

    fn num_channels(&self) -> usize {
        self.config.borrow().num_channels()
    }

    /// Replace every channel's target.  Needs exactly one entry per
    /// configured channel.
    pub fn play(&self, percentages: impl Into<PlaybackTarget>) -> Result<(), TargetError> {
        let target = percentages.into();
        target.validate(self.num_channels())?;
        debug!("play {:?}", target.values());
        self.target.send_replace(target);
        Ok(())
    }

    /// Play `percentage` on one channel and silence the others.
    pub fn play_single_channel(&self, channel: usize, percentage: f64) -> Result<(), TargetError> {
        let target = PlaybackTarget::single(self.num_channels(), channel, percentage)?;
        debug!("play channel {} at {}%", channel, percentage);
        self.target.send_replace(target);
        Ok(())
    }

    /// Change one channel, leaving the others as they are.
    pub fn set_channel(&self, channel: usize, percentage: Option<f64>) -> Result<(), TargetError> {
        let channels = self.num_channels();
        if channel >= channels {
            return Err(TargetError::UnknownChannel { channel, channels });
        }
        if let Some(value) = percentage {
            if !(0.0..=100.0).contains(&value) {
                return Err(TargetError::PercentageOutOfRange { channel, value });
            }
        }
        self.target.send_modify(|target| {
            let mut values = target.values().to_vec();
            values.resize(channels, None);
            values[channel] = percentage;
            *target = PlaybackTarget::from_values(values);
        });
        Ok(())
    }

    /// Silence all channels.
    pub fn stop_playing(&self) {
        self.target
            .send_replace(PlaybackTarget::silent(self.num_channels()));
    }

    /// What is currently requested, for status display.
    pub fn now_playing(&self) -> PlaybackTarget {
        self.target.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackTarget> {
        self.target.subscribe()
    }

    pub fn config(&self) -> watch::Receiver<Config> {
        self.config.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> (watch::Sender<Config>, PlaybackState) {
        let (tx, rx) = watch::channel(Config::default());
        (tx, PlaybackState::new(rx))
    }

    #[test]
    fn test_starts_silent() {
        let (_tx, playback) = state();
        assert_eq!(playback.now_playing(), PlaybackTarget::silent(2));
    }

    #[test]
    fn test_play_and_stop() {
        let (_tx, playback) = state();
        playback.play(vec![Some(12.5), None]).unwrap();
        assert_eq!(playback.now_playing().values(), &[Some(12.5), None]);

        playback.play_single_channel(1, 80.0).unwrap();
        assert_eq!(playback.now_playing().values(), &[None, Some(80.0)]);

        playback.set_channel(0, Some(30.0)).unwrap();
        assert_eq!(playback.now_playing().values(), &[Some(30.0), Some(80.0)]);

        playback.stop_playing();
        assert!(playback.now_playing().is_silent());
    }

    #[test]
    fn test_rejected_updates_leave_target_alone() {
        let (_tx, playback) = state();
        playback.play(vec![Some(50.0), Some(60.0)]).unwrap();

        assert!(playback.play(vec![Some(50.0)]).is_err());
        assert!(playback.play(vec![Some(101.0), None]).is_err());
        assert!(playback.play_single_channel(2, 10.0).is_err());
        assert!(playback.set_channel(0, Some(-1.0)).is_err());

        assert_eq!(playback.now_playing().values(), &[Some(50.0), Some(60.0)]);
    }

    #[test]
    fn test_channel_count_follows_config() {
        let (tx, playback) = state();
        tx.send_modify(|config| {
            let extra = config.channels[0].clone();
            config.channels.push(extra);
        });
        playback.stop_playing();
        assert_eq!(playback.now_playing().len(), 3);
        playback.play_single_channel(2, 40.0).unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let (_tx, playback) = state();
        let mut rx = playback.subscribe();
        let writer = playback.clone();
        writer.play_single_channel(0, 70.0).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().get(0), Some(70.0));
    }
}
