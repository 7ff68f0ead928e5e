//! Sink supervisor: keeps the sink fed for as long as it runs.
//!
//! ```text
//!   Supervisor::start()
//!         │
//!         └── stream loop (one tokio task)
//!               ├── derive SinkParameters from the current config
//!               ├── reuse the session if they match, else kill + relaunch
//!               ├── render one block from the playback target, write it
//!               └── on failure: kill, back off, relaunch
//! ```
//!
//! The loop only ever waits on the sink write (the pipe's buffer paces it to
//! real time) and on the backoff sleep.  Both race the cancellation token, so
//! `stop()` returns within one block even when the sink has stalled.
//! Whatever happens, the session is torn down before the task ends.

use std::sync::Arc;

use meter_proto::config::Config;
use meter_proto::protocol::{PlaybackTarget, SupervisorState, SupervisorStatus};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::playback::PlaybackState;
use crate::sink::{SinkLauncher, SinkParameters, SinkSession};
use crate::synth::{render_block, BlockFormat};

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    launcher: Arc<dyn SinkLauncher>,
    playback: PlaybackState,
    backoff: BackoffPolicy,
    format: BlockFormat,
    status: Arc<watch::Sender<SupervisorStatus>>,
    worker: Option<Worker>,
}

impl Supervisor {
    pub fn new(
        launcher: impl SinkLauncher,
        playback: PlaybackState,
        backoff: BackoffPolicy,
    ) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::default());
        Self {
            launcher: Arc::new(launcher),
            playback,
            backoff,
            format: BlockFormat::default(),
            status: Arc::new(status),
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }

    /// Spawn the stream loop.  Does nothing if it is already running.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!("supervisor: already running");
            return;
        }

        let cancel = CancellationToken::new();
        let stream = StreamLoop {
            launcher: Arc::clone(&self.launcher),
            config: self.playback.config(),
            target: self.playback.subscribe(),
            backoff: self.backoff,
            format: self.format,
            status: Arc::clone(&self.status),
            cancel: cancel.clone(),
        };
        info!("supervisor: starting");
        let handle = tokio::spawn(stream.run());
        self.worker = Some(Worker { cancel, handle });
    }

    /// Ask the loop to exit without waiting for it.
    pub fn request_stop(&self) {
        if let Some(worker) = &self.worker {
            worker.cancel.cancel();
        }
    }

    /// Stop the loop and wait until it has exited and the sink is gone.
    /// Safe to call any number of times.
    pub async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            error!("supervisor: stream loop ended abnormally: {}", e);
        }
        self.status.send_modify(|status| status.state = SupervisorState::Stopped);
        info!("supervisor: stopped");
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // The loop tears the sink down as soon as it observes this.
        self.request_stop();
    }
}

struct StreamLoop {
    launcher: Arc<dyn SinkLauncher>,
    config: watch::Receiver<Config>,
    target: watch::Receiver<PlaybackTarget>,
    backoff: BackoffPolicy,
    format: BlockFormat,
    status: Arc<watch::Sender<SupervisorStatus>>,
    cancel: CancellationToken,
}

impl StreamLoop {
    async fn run(self) {
        let mut session: Option<SinkSession> = None;
        let mut consecutive_failures: u32 = 0;

        while !self.cancel.is_cancelled() {
            let (params, block) = {
                let config = self.config.borrow();
                let target = self.target.borrow();
                (
                    SinkParameters::from_config(&config),
                    render_block(&config, &target, &self.format),
                )
            };

            let reusable = session
                .as_ref()
                .is_some_and(|current| current.params() == &params);
            if !reusable {
                if let Some(old) = session.take() {
                    info!("sink: parameters changed, restarting");
                    old.shutdown().await;
                }
                self.set_state(SupervisorState::Starting);
                match self.launcher.launch(&params) {
                    Ok(started) => {
                        debug!("sink: launched pid {:?} {:?}", started.pid(), started.params());
                        self.status.send_modify(|status| status.launches += 1);
                        session = Some(started);
                    }
                    Err(e) => {
                        consecutive_failures = consecutive_failures.saturating_add(1);
                        self.back_off(
                            format!("starting sink {} failed: {}", params.program, e),
                            consecutive_failures,
                        )
                        .await;
                        continue;
                    }
                }
            }

            let Some(sink) = session.as_mut() else {
                continue;
            };
            self.set_state(SupervisorState::Streaming);

            let written = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = sink.write_block(&block) => result,
            };

            match written {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    if let Some(dead) = session.take() {
                        dead.shutdown().await;
                    }
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.back_off(format!("writing to sink failed: {}", e), consecutive_failures)
                        .await;
                }
            }
        }

        if let Some(current) = session.take() {
            current.shutdown().await;
        }
        self.set_state(SupervisorState::Stopped);
        debug!("supervisor: stream loop exited");
    }

    /// Report a failure, then sleep out the backoff unless cancelled first.
    async fn back_off(&self, reason: String, attempt: u32) {
        let delay = self.backoff.delay(attempt);
        warn!("{}; retrying in {:?}", reason, delay);
        self.status.send_modify(|status| {
            status.state = SupervisorState::Restarting;
            status.failures += 1;
            status.last_error = Some(reason);
        });

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn set_state(&self, state: SupervisorState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            if state == SupervisorState::Streaming && status.state == SupervisorState::Starting {
                info!("sink: streaming");
            }
            status.state = state;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_proto::calibration::CalibrationCurve;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    struct Launch {
        params: SinkParameters,
        reader: DuplexStream,
        at: Instant,
    }

    /// Hands out in-memory pipes and reports every launch to the test.
    struct PipeLauncher {
        launches: mpsc::UnboundedSender<Launch>,
        capacity: usize,
        failures_left: AtomicUsize,
    }

    impl SinkLauncher for PipeLauncher {
        fn launch(&self, params: &SinkParameters) -> io::Result<SinkSession> {
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such sink"));
            }
            let (writer, reader) = tokio::io::duplex(self.capacity);
            let _ = self.launches.send(Launch {
                params: params.clone(),
                reader,
                at: Instant::now(),
            });
            Ok(SinkSession::from_writer(params.clone(), writer))
        }
    }

    struct Harness {
        config: watch::Sender<Config>,
        supervisor: Supervisor,
        launches: mpsc::UnboundedReceiver<Launch>,
    }

    fn measured_config() -> Config {
        let curve = CalibrationCurve::new([
            (0, 0.0),
            (10, 0.02),
            (30, 0.1),
            (60, 0.34),
            (90, 0.7),
            (100, 0.8),
        ])
        .unwrap();
        let mut config = Config::default();
        for channel in &mut config.channels {
            channel.calibration = curve.clone();
        }
        config
    }

    fn harness(failures: usize) -> Harness {
        let (config, config_rx) = watch::channel(measured_config());
        let (tx, launches) = mpsc::unbounded_channel();
        let launcher = PipeLauncher {
            launches: tx,
            capacity: 1024,
            failures_left: AtomicUsize::new(failures),
        };
        let playback = PlaybackState::new(config_rx);
        let supervisor = Supervisor::new(launcher, playback, BackoffPolicy::default());
        Harness {
            config,
            supervisor,
            launches,
        }
    }

    async fn read_block(reader: &mut DuplexStream, channels: usize) -> Vec<i16> {
        let mut block = vec![0u8; BlockFormat::default().block_bytes(channels)];
        reader.read_exact(&mut block).await.unwrap();
        block
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    async fn drain(reader: &mut DuplexStream) {
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
    }

    fn peak(samples: &[i16], channel: usize, channels: usize) -> i16 {
        samples
            .iter()
            .skip(channel)
            .step_by(channels)
            .map(|s| s.abs())
            .max()
            .unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_requested_channel() {
        let mut h = harness(0);
        h.supervisor
            .playback()
            .play_single_channel(0, 5.0)
            .unwrap();
        h.supervisor.start();

        let mut launch = h.launches.recv().await.unwrap();
        assert_eq!(launch.params.channels, 2);
        assert_eq!(launch.params.device, "default");

        let samples = read_block(&mut launch.reader, 2).await;
        // gain 0.01 → round(0.01 * 32767) at the crest
        assert_eq!(peak(&samples, 0, 2), 328);
        assert_eq!(peak(&samples, 1, 2), 0);
        assert_eq!(h.supervisor.status().state, SupervisorState::Streaming);

        h.supervisor.stop().await;
        assert_eq!(h.supervisor.status().state, SupervisorState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarts_only_when_parameters_change() {
        let mut h = harness(0);
        h.supervisor.playback().play(vec![Some(50.0), Some(91.0)]).unwrap();
        h.supervisor.start();

        let mut first = h.launches.recv().await.unwrap();
        for _ in 0..3 {
            read_block(&mut first.reader, 2).await;
        }
        // Calibration edits alone do not restart the sink.
        h.config.send_modify(|config| {
            config.channels[0].calibration.set_point(50, 0.3).unwrap();
        });
        for _ in 0..3 {
            read_block(&mut first.reader, 2).await;
        }
        assert!(h.launches.try_recv().is_err());

        h.config
            .send_modify(|config| config.audio.device = "plughw:CARD=PCH,DEV=0".to_string());
        drain(&mut first.reader).await;
        let mut second = h.launches.recv().await.unwrap();
        assert_eq!(second.params.device, "plughw:CARD=PCH,DEV=0");
        assert_eq!(second.params.channels, 2);
        read_block(&mut second.reader, 2).await;

        h.config.send_modify(|config| {
            let extra = config.channels[1].clone();
            config.channels.push(extra);
        });
        drain(&mut second.reader).await;
        let mut third = h.launches.recv().await.unwrap();
        assert_eq!(third.params.channels, 3);
        let samples = read_block(&mut third.reader, 3).await;
        assert!(peak(&samples, 1, 3) > 0);
        assert_eq!(peak(&samples, 2, 3), 0);

        h.supervisor.stop().await;
        assert_eq!(h.supervisor.status().launches, 3);
        assert_eq!(h.supervisor.status().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_backs_off_and_resumes() {
        let mut h = harness(0);
        h.supervisor.playback().play_single_channel(0, 91.0).unwrap();
        h.supervisor.start();

        let mut first = h.launches.recv().await.unwrap();
        read_block(&mut first.reader, 2).await;
        let broken_at = Instant::now();
        drop(first.reader);

        let mut second = h.launches.recv().await.unwrap();
        assert!(second.at.duration_since(broken_at) >= Duration::from_secs(1));

        let status = h.supervisor.status();
        assert_eq!(status.failures, 1);
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("writing to sink failed")));

        // The caller's target survived the restart.
        assert_eq!(h.supervisor.playback().now_playing().get(0), Some(91.0));
        let samples = read_block(&mut second.reader, 2).await;
        // 0.71 * 32767 ≈ 23264.6 at the crest
        assert!((23260..=23265).contains(&peak(&samples, 0, 2)));
        assert_eq!(peak(&samples, 1, 2), 0);

        h.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_failures_are_retried() {
        let mut h = harness(2);
        let started = Instant::now();
        h.supervisor.start();

        let launch = h.launches.recv().await.unwrap();
        assert!(launch.at.duration_since(started) >= Duration::from_secs(2));
        let status = h.supervisor.status();
        assert_eq!(status.failures, 2);
        assert_eq!(status.launches, 1);
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("no such sink")));

        h.supervisor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let mut h = harness(0);
        h.supervisor.stop().await;
        assert_eq!(h.supervisor.status().state, SupervisorState::Idle);

        h.supervisor.start();
        h.supervisor.start();
        assert!(h.supervisor.is_running());

        // Nobody reads: the loop is stuck in a write when stop arrives.
        let mut launch = h.launches.recv().await.unwrap();
        h.supervisor.stop().await;
        h.supervisor.stop().await;
        assert!(!h.supervisor.is_running());
        assert_eq!(h.supervisor.status().state, SupervisorState::Stopped);

        // Session closed: the reader sees EOF.
        drain(&mut launch.reader).await;
        assert!(h.launches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_backoff() {
        let mut h = harness(usize::MAX);
        let mut status = h.supervisor.subscribe();
        h.supervisor.start();

        status
            .wait_for(|s| s.state == SupervisorState::Restarting)
            .await
            .unwrap();
        let before = Instant::now();
        h.supervisor.stop().await;
        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(h.supervisor.status().launches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let mut h = harness(0);
        h.supervisor.start();
        let mut first = h.launches.recv().await.unwrap();
        read_block(&mut first.reader, 2).await;
        h.supervisor.stop().await;

        h.supervisor.start();
        let mut second = h.launches.recv().await.unwrap();
        let samples = read_block(&mut second.reader, 2).await;
        assert!(samples.iter().all(|s| *s == 0));
        h.supervisor.stop().await;
    }
}
