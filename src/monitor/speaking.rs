//! Speaking activity monitor
//!
//! One monitor per stream. On every tick it drains whatever frames its view
//! has buffered into the analyser and compares the average spectrum level
//! with the threshold. Turning off is held for `hold` so short pauses
//! between words do not flicker.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audio::stream::StreamView;
use crate::config::MonitorConfig;
use crate::monitor::analyser::{average_magnitude, FrequencyAnalyser};
use crate::monitor::ticker::Ticker;

/// Current speaking state of one stream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeakingState {
    pub speaking: bool,
    /// Last transition
    pub since: Instant,
    /// Last measured average magnitude (0..255)
    pub level: f32,
}

pub struct SpeakingMonitor {
    label: String,
    state_tx: Arc<watch::Sender<SpeakingState>>,
    state_rx: watch::Receiver<SpeakingState>,
    /// Set by `stop`; checked under the same lock before every update
    stopped: Arc<Mutex<bool>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SpeakingMonitor {
    /// Start monitoring `view`, analysing on every tick of `ticker`
    pub fn start(
        label: impl Into<String>,
        view: StreamView,
        ticker: impl Ticker + 'static,
        config: &MonitorConfig,
    ) -> Self {
        let label = label.into();
        let (state_tx, state_rx) = watch::channel(SpeakingState {
            speaking: false,
            since: Instant::now(),
            level: 0.0,
        });
        let state_tx = Arc::new(state_tx);
        let stopped = Arc::new(Mutex::new(false));

        let task = tokio::spawn(monitor_loop(
            label.clone(),
            view,
            ticker,
            FrequencyAnalyser::new(config),
            config.threshold,
            config.hold(),
            state_tx.clone(),
            stopped.clone(),
        ));

        tracing::debug!("Speaking monitor started for {}", label);
        Self {
            label,
            state_tx,
            state_rx,
            stopped,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SpeakingState {
        *self.state_rx.borrow()
    }

    pub fn is_speaking(&self) -> bool {
        self.state_rx.borrow().speaking
    }

    /// Watch transitions. Level changes alone do not notify.
    pub fn subscribe(&self) -> watch::Receiver<SpeakingState> {
        self.state_rx.clone()
    }

    /// Stop the monitor and clear the speaking flag. No further update is
    /// published after this returns.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return;
        }
        *stopped = true;
        self.state_tx.send_if_modified(|state| {
            if !state.speaking {
                return false;
            }
            state.speaking = false;
            state.since = Instant::now();
            true
        });
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        tracing::debug!("Speaking monitor stopped for {}", self.label);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }
}

impl Drop for SpeakingMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
async fn monitor_loop(
    label: String,
    mut view: StreamView,
    mut ticker: impl Ticker,
    mut analyser: FrequencyAnalyser,
    threshold: f32,
    hold: Duration,
    state_tx: Arc<watch::Sender<SpeakingState>>,
    stopped: Arc<Mutex<bool>>,
) {
    let mut last_loud: Option<Instant> = None;

    while ticker.tick().await {
        while let Some(frame) = view.try_next_frame() {
            analyser.push_samples(&frame.to_mono());
        }
        let level = average_magnitude(&analyser.byte_frequency_data());
        let now = Instant::now();
        let loud = level > threshold;
        if loud {
            last_loud = Some(now);
        }
        let speaking = loud || last_loud.is_some_and(|t| now.duration_since(t) < hold);

        let guard = stopped.lock();
        if *guard {
            return;
        }
        state_tx.send_if_modified(|state| {
            state.level = level;
            if state.speaking == speaking {
                return false;
            }
            state.speaking = speaking;
            state.since = now;
            true
        });
        drop(guard);
    }
    tracing::debug!("Tick source for {} ended", label);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stream::AudioStream;
    use crate::monitor::ticker::IntervalTicker;
    use tokio::sync::mpsc;

    fn noise(len: usize) -> Vec<f32> {
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as f32 / u32::MAX as f32 - 0.5
            })
            .collect()
    }

    /// Ticks only when the test says so
    struct ManualTicker(mpsc::UnboundedReceiver<()>);

    #[async_trait::async_trait]
    impl Ticker for ManualTicker {
        async fn tick(&mut self) -> bool {
            self.0.recv().await.is_some()
        }
    }

    fn ticker() -> (ManualTicker, mpsc::UnboundedSender<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ManualTicker(rx), tx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_noise_speaks_silence_does_not() {
        let stream = AudioStream::new(16_000, 1);
        let config = MonitorConfig {
            hold_ms: 0,
            ..Default::default()
        };
        let (ticker, tick) = ticker();
        let monitor = SpeakingMonitor::start("local", stream.subscribe(), ticker, &config);

        stream.push(&vec![0.0; 512]);
        tick.send(()).unwrap();
        settle().await;
        assert!(!monitor.is_speaking());
        assert_eq!(monitor.state().level, 0.0);

        stream.push(&noise(512));
        tick.send(()).unwrap();
        settle().await;
        assert!(monitor.is_speaking());
        assert!(monitor.state().level > config.threshold);

        stream.push(&vec![0.0; 512]);
        for _ in 0..60 {
            tick.send(()).unwrap();
        }
        settle().await;
        assert!(!monitor.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_delays_release() {
        let stream = AudioStream::new(16_000, 1);
        let config = MonitorConfig::default();
        let monitor = SpeakingMonitor::start(
            "peer",
            stream.subscribe(),
            IntervalTicker::new(config.tick()),
            &config,
        );
        let mut changes = monitor.subscribe();

        stream.push(&noise(512));
        changes.changed().await.unwrap();
        assert!(changes.borrow_and_update().speaking);
        let started = tokio::time::Instant::now();

        stream.push(&vec![0.0; 512]);
        changes.changed().await.unwrap();
        let state = *changes.borrow_and_update();
        assert!(!state.speaking);
        // Smoothing decay plus the hold window
        assert!(state.since.duration_since(started) >= config.hold());
    }

    #[tokio::test]
    async fn test_monitors_are_independent() {
        let local = AudioStream::new(16_000, 1);
        let remote = AudioStream::new(16_000, 1);
        let config = MonitorConfig {
            hold_ms: 0,
            ..Default::default()
        };
        let (local_ticker, local_tick) = ticker();
        let (remote_ticker, remote_tick) = ticker();
        let local_monitor = SpeakingMonitor::start("local", local.subscribe(), local_ticker, &config);
        let remote_monitor =
            SpeakingMonitor::start("remote", remote.subscribe(), remote_ticker, &config);

        local.push(&noise(512));
        remote.push(&vec![0.0; 512]);
        local_tick.send(()).unwrap();
        remote_tick.send(()).unwrap();
        settle().await;

        assert!(local_monitor.is_speaking());
        assert!(!remote_monitor.is_speaking());

        local_monitor.stop();
        assert!(!remote_monitor.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_clears_speaking() {
        let stream = AudioStream::new(16_000, 1);
        let (ticker, tick) = ticker();
        let monitor =
            SpeakingMonitor::start("peer", stream.subscribe(), ticker, &MonitorConfig::default());
        let mut changes = monitor.subscribe();

        stream.push(&noise(512));
        tick.send(()).unwrap();
        settle().await;
        assert!(monitor.is_speaking());
        changes.borrow_and_update();

        // No tick needed: the flag drops as part of stopping
        monitor.stop();
        assert!(!monitor.is_speaking());
        assert!(changes.has_changed().unwrap());
        assert!(!changes.borrow_and_update().speaking);

        stream.push(&noise(512));
        let _ = tick.send(());
        settle().await;
        assert!(!monitor.is_speaking());
    }

    #[tokio::test]
    async fn test_no_updates_after_stop() {
        let stream = AudioStream::new(16_000, 1);
        let (ticker, tick) = ticker();
        let monitor =
            SpeakingMonitor::start("local", stream.subscribe(), ticker, &MonitorConfig::default());
        let mut changes = monitor.subscribe();

        monitor.stop();
        monitor.stop();
        assert!(monitor.is_stopped());

        stream.push(&noise(512));
        let _ = tick.send(());
        settle().await;
        assert!(!changes.has_changed().unwrap_or(false));
        assert!(!monitor.is_speaking());
    }
}
