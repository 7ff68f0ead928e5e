use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TargetError {
    #[error("expected {expected} channel values, got {actual}")]
    ChannelCount { expected: usize, actual: usize },

    #[error("channel {channel} does not exist ({channels} channels configured)")]
    UnknownChannel { channel: usize, channels: usize },

    #[error("percentage {value} for channel {channel} is outside 0..=100")]
    PercentageOutOfRange { channel: usize, value: f64 },
}

/// Requested needle position of every channel.  `None` silences a channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlaybackTarget {
    channels: Vec<Option<f64>>,
}

impl PlaybackTarget {
    pub fn silent(num_channels: usize) -> Self {
        Self {
            channels: vec![None; num_channels],
        }
    }

    /// All channels silent except `channel`.
    pub fn single(
        num_channels: usize,
        channel: usize,
        percentage: f64,
    ) -> Result<Self, TargetError> {
        if channel >= num_channels {
            return Err(TargetError::UnknownChannel {
                channel,
                channels: num_channels,
            });
        }
        let mut target = Self::silent(num_channels);
        target.channels[channel] = Some(percentage);
        target.validate(num_channels)?;
        Ok(target)
    }

    pub fn from_values(values: Vec<Option<f64>>) -> Self {
        Self { channels: values }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Percentage requested for `channel`.  Channels past the end are silent.
    pub fn get(&self, channel: usize) -> Option<f64> {
        self.channels.get(channel).copied().flatten()
    }

    pub fn values(&self) -> &[Option<f64>] {
        &self.channels
    }

    pub fn is_silent(&self) -> bool {
        self.channels.iter().all(Option::is_none)
    }

    pub fn validate(&self, num_channels: usize) -> Result<(), TargetError> {
        if self.channels.len() != num_channels {
            return Err(TargetError::ChannelCount {
                expected: num_channels,
                actual: self.channels.len(),
            });
        }
        for (channel, value) in self.channels.iter().enumerate() {
            if let Some(value) = *value {
                if !(0.0..=100.0).contains(&value) {
                    return Err(TargetError::PercentageOutOfRange { channel, value });
                }
            }
        }
        Ok(())
    }
}

impl From<Vec<Option<f64>>> for PlaybackTarget {
    fn from(values: Vec<Option<f64>>) -> Self {
        Self::from_values(values)
    }
}

/// Lifecycle of the sink supervisor.
///
/// Transitions:
///   Idle -> Starting -> Streaming -> Starting (parameters changed) ...
///   Streaming -> Restarting -> Starting ...
///   any -> Stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// No sink session; worker not running yet.
    #[default]
    Idle,
    /// Launching (or relaunching) the sink process.
    Starting,
    /// Sink is running and being fed audio blocks.
    Streaming,
    /// Sink failed; waiting out the backoff before relaunching.
    Restarting,
    /// Worker has exited and the sink is torn down.
    Stopped,
}

impl SupervisorState {
    /// Short label for status lines (≤5 chars).
    pub fn label(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "IDLE",
            SupervisorState::Starting => "INIT",
            SupervisorState::Streaming => "LIVE",
            SupervisorState::Restarting => "REST",
            SupervisorState::Stopped => "STOP",
        }
    }
}

/// Snapshot published by the supervisor whenever something changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    /// Number of sink launches performed, including the first one.
    pub launches: u64,
    /// Number of failures (launch or write) since the worker started.
    pub failures: u64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_channel_target() {
        let target = PlaybackTarget::single(2, 1, 42.0).unwrap();
        assert_eq!(target.values(), &[None, Some(42.0)]);
        assert_eq!(target.get(0), None);
        assert_eq!(target.get(5), None);
        assert!(!target.is_silent());
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            PlaybackTarget::single(2, 2, 10.0),
            Err(TargetError::UnknownChannel {
                channel: 2,
                channels: 2
            })
        );
        assert!(PlaybackTarget::single(2, 0, 100.1).is_err());
        assert!(PlaybackTarget::single(2, 0, f64::NAN).is_err());

        let target = PlaybackTarget::from_values(vec![Some(1.0)]);
        assert_eq!(
            target.validate(2),
            Err(TargetError::ChannelCount {
                expected: 2,
                actual: 1
            })
        );
        assert!(PlaybackTarget::silent(3).validate(3).is_ok());
    }
}
