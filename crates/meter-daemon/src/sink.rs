//! Sink process handling.
//!
//! A `SinkSession` owns one running sink (normally `aplay`) together with the
//! parameters it was started with.  The supervisor compares those parameters
//! against the ones derived from the current config on every cycle and only
//! relaunches when they differ.
//!
//! Launching goes through the `SinkLauncher` trait so the supervisor can be
//! driven by in-memory sinks in tests.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use meter_proto::config::Config;
use meter_proto::platform;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::synth::{BYTES_PER_SAMPLE, SAMPLE_RATE};

/// Everything the sink is started with.  Two equal values mean a running
/// sink can keep being used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkParameters {
    pub program: String,
    pub sample_rate: u32,
    pub channels: usize,
    pub bits_per_sample: u16,
    pub buffer_time: Duration,
    pub device: String,
}

impl SinkParameters {
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: config.sink.program.clone(),
            sample_rate: SAMPLE_RATE,
            channels: config.num_channels(),
            bits_per_sample: (BYTES_PER_SAMPLE * 8) as u16,
            buffer_time: Duration::from_millis(config.sink.buffer_time_ms),
            device: config.audio.device.clone(),
        }
    }

    /// aplay command line, minus the program itself.
    pub fn args(&self) -> Vec<String> {
        vec![
            "--format".to_string(),
            format!("S{}_LE", self.bits_per_sample),
            "--rate".to_string(),
            self.sample_rate.to_string(),
            "--channels".to_string(),
            self.channels.to_string(),
            "--device".to_string(),
            self.device.clone(),
            "--buffer-time".to_string(),
            self.buffer_time.as_micros().to_string(),
        ]
    }
}

type SinkInput = Box<dyn AsyncWrite + Send + Unpin>;

/// A running sink plus the parameters it was launched with.
pub struct SinkSession {
    params: SinkParameters,
    child: Option<Child>,
    input: SinkInput,
}

impl SinkSession {
    /// Wrap a spawned child.  Its stdin must have been piped.
    pub fn from_child(params: SinkParameters, mut child: Child) -> io::Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sink stdin not piped"))?;
        Ok(Self {
            params,
            child: Some(child),
            input: Box::new(stdin),
        })
    }

    /// A sink with no process behind it, e.g. an in-memory pipe.
    pub fn from_writer(params: SinkParameters, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            params,
            child: None,
            input: Box::new(writer),
        }
    }

    pub fn params(&self) -> &SinkParameters {
        &self.params
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Write one block.  Blocks while the sink's buffer is full, which is
    /// what paces the stream to real time.
    pub async fn write_block(&mut self, block: &[u8]) -> io::Result<()> {
        self.input.write_all(block).await?;
        self.input.flush().await
    }

    /// Close the input, kill the process and reap it.  Never fails; the
    /// process may well be dead already.
    pub async fn shutdown(mut self) {
        drop(self.input);
        if let Some(mut child) = self.child.take() {
            let pid = child.id();
            let _ = child.kill().await;
            debug!("sink: killed pid {:?}", pid);
        }
    }
}

/// Starts sink sessions for a given set of parameters.
pub trait SinkLauncher: Send + Sync + 'static {
    fn launch(&self, params: &SinkParameters) -> io::Result<SinkSession>;
}

/// Spawns the configured program as a child process reading PCM on stdin.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    fn resolve(program: &str) -> PathBuf {
        platform::find_sink_binary(program)
    }
}

impl SinkLauncher for ProcessLauncher {
    fn launch(&self, params: &SinkParameters) -> io::Result<SinkSession> {
        let binary = Self::resolve(&params.program);
        let child = Command::new(&binary)
            .args(params.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!(
            "sink: started {} (pid {:?}) device={} channels={}",
            binary.display(),
            child.id(),
            params.device,
            params.channels
        );
        SinkSession::from_child(params.clone(), child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_aplay_arguments() {
        let mut config = Config::default();
        config.audio.device = "hw:CARD=PCH,DEV=0".to_string();
        let params = SinkParameters::from_config(&config);
        assert_eq!(
            params.args(),
            vec![
                "--format",
                "S16_LE",
                "--rate",
                "44100",
                "--channels",
                "2",
                "--device",
                "hw:CARD=PCH,DEV=0",
                "--buffer-time",
                "100000",
            ]
        );
    }

    #[test]
    fn test_parameter_equality_follows_config() {
        let config = Config::default();
        let a = SinkParameters::from_config(&config);
        assert_eq!(a, SinkParameters::from_config(&config.clone()));

        let mut other = config.clone();
        other.channels.pop();
        assert_ne!(a, SinkParameters::from_config(&other));

        let mut other = config.clone();
        other.audio.device = "null".to_string();
        assert_ne!(a, SinkParameters::from_config(&other));

        // Calibration edits do not touch the sink.
        let mut other = config;
        other.channels[0].calibration.set_point(50, 0.5).unwrap();
        assert_eq!(a, SinkParameters::from_config(&other));
    }

    #[tokio::test]
    async fn test_writer_session_round_trip() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let mut session =
            SinkSession::from_writer(SinkParameters::from_config(&Config::default()), writer);
        assert_eq!(session.pid(), None);
        session.write_block(&[1, 2, 3, 4]).await.unwrap();
        session.shutdown().await;

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![1, 2, 3, 4]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_program_fails_to_launch() {
        let mut config = Config::default();
        config.sink.program = "/nonexistent/meter-sink".to_string();
        let params = SinkParameters::from_config(&config);
        assert!(ProcessLauncher.launch(&params).is_err());
    }
}
