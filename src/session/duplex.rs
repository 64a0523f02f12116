//! Duplex stream session with the live service
//!
//! ```text
//! StreamView ─► capture loop ─► SendQueue (drop-oldest) ─► send loop ─► FrameSink
//!                                                                        │
//! PlaybackScheduler ◄── dispatch (epoch checked) ◄── receive loop ◄── MessageSource
//! ```
//!
//! Every task spawned for a connection carries the epoch it was started
//! under. `disconnect` bumps the epoch while holding the session lock, so
//! anything a task delivers afterwards is discarded.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::audio::buffer::SendQueue;
use crate::audio::convert::FrameAssembler;
use crate::audio::stream::StreamView;
use crate::codec::{self, EncodedAudioPacket};
use crate::config::LiveConfig;
use crate::constants::INPUT_SAMPLE_RATE;
use crate::error::ConnectionError;
use crate::playback::PlaybackScheduler;
use crate::session::protocol::{ClientMessage, InboundEvent, SessionSetup};
use crate::session::transport::{FrameSink, LiveConnector, LiveTransport, MessageSource};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Error,
}

impl SessionState {
    /// Connecting or open
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Open)
    }
}

struct Guarded {
    epoch: u64,
    tasks: Vec<JoinHandle<()>>,
    last_error: Option<ConnectionError>,
    queue: Option<Arc<SendQueue<EncodedAudioPacket>>>,
}

struct SessionInner {
    connector: Arc<dyn LiveConnector>,
    scheduler: Arc<PlaybackScheduler>,
    setup: SessionSetup,
    frame_samples: usize,
    queue_capacity: usize,
    state_tx: watch::Sender<SessionState>,
    guarded: Mutex<Guarded>,
    frames_sent: AtomicU64,
}

/// Bidirectional audio session with the remote agent
pub struct DuplexSession {
    inner: Arc<SessionInner>,
}

impl DuplexSession {
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        scheduler: Arc<PlaybackScheduler>,
        config: &LiveConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                connector,
                scheduler,
                setup: SessionSetup {
                    model: config.model.clone(),
                    voice: config.voice.clone(),
                    instruction: config.instruction.clone(),
                },
                frame_samples: config.frame_samples,
                queue_capacity: config.send_queue_capacity,
                state_tx,
                guarded: Mutex::new(Guarded {
                    epoch: 0,
                    tasks: Vec::new(),
                    last_error: None,
                    queue: None,
                }),
                frames_sent: AtomicU64::new(0),
            }),
        }
    }

    /// Open the session and start streaming `capture` to the service.
    ///
    /// Fails with [`ConnectionError::AlreadyActive`] while connecting or open.
    /// Any other failure leaves the session in [`SessionState::Error`].
    pub async fn connect(&self, capture: StreamView) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        let epoch = {
            let mut guarded = inner.guarded.lock();
            if inner.state().is_active() {
                return Err(ConnectionError::AlreadyActive);
            }
            guarded.epoch += 1;
            guarded.last_error = None;
            inner.set_state(SessionState::Connecting);
            guarded.epoch
        };

        let opened = inner.connector.open(&inner.setup).await;

        let stale = match inner.install(epoch, opened, capture) {
            Install::Open => return Ok(()),
            Install::Failed(e) => return Err(e),
            Install::Stale(transport) => transport,
        };
        tracing::info!("Session was closed while connecting");
        if let Some(mut transport) = stale {
            transport.sink.close().await;
        }
        Err(ConnectionError::Closed)
    }

    /// Close the session. Idempotent; returns once nothing more from this
    /// connection can reach playback.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let mut guarded = inner.guarded.lock();
        match inner.state() {
            SessionState::Disconnected | SessionState::Closed => return,
            SessionState::Error => {
                inner.set_state(SessionState::Closed);
                return;
            }
            SessionState::Connecting | SessionState::Open => {}
        }
        inner.teardown(&mut guarded);
        inner.set_state(SessionState::Closed);
        drop(guarded);

        inner.scheduler.interrupt();
        tracing::info!("Live session closed");
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Failure recorded by the last connection attempt
    pub fn last_error(&self) -> Option<ConnectionError> {
        self.inner.guarded.lock().last_error.clone()
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.inner.scheduler
    }

    /// Frames handed to the transport since creation
    pub fn frames_sent(&self) -> u64 {
        self.inner.frames_sent.load(Ordering::Relaxed)
    }

    /// Frames evicted from the send queue of the current connection
    pub fn frames_dropped(&self) -> usize {
        self.inner
            .guarded
            .lock()
            .queue
            .as_ref()
            .map(|q| q.dropped_count())
            .unwrap_or(0)
    }
}

impl Drop for DuplexSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

enum Install {
    Open,
    Failed(ConnectionError),
    /// Disconnected while the open was in flight
    Stale(Option<LiveTransport>),
}

impl SessionInner {
    /// Adopt the result of an open started under `epoch`
    fn install(
        self: &Arc<Self>,
        epoch: u64,
        opened: Result<LiveTransport, ConnectionError>,
        capture: StreamView,
    ) -> Install {
        let mut guarded = self.guarded.lock();
        if guarded.epoch != epoch {
            return Install::Stale(opened.ok());
        }

        let transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!("Failed to open live session: {}", e);
                guarded.last_error = Some(e.clone());
                self.set_state(SessionState::Error);
                return Install::Failed(e);
            }
        };

        let queue = Arc::new(SendQueue::new(self.queue_capacity));
        guarded.queue = Some(queue.clone());
        guarded.tasks = vec![
            tokio::spawn(capture_loop(capture, queue.clone(), self.frame_samples)),
            tokio::spawn(send_loop(self.clone(), epoch, queue, transport.sink)),
            tokio::spawn(receive_loop(self.clone(), epoch, transport.source)),
        ];
        self.set_state(SessionState::Open);
        tracing::info!("Live session open");
        Install::Open
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    /// Invalidate the current connection. Caller holds the lock.
    fn teardown(&self, guarded: &mut Guarded) {
        guarded.epoch += 1;
        for task in guarded.tasks.drain(..) {
            task.abort();
        }
        if let Some(queue) = guarded.queue.take() {
            queue.clear();
        }
    }

    fn dispatch(&self, epoch: u64, event: InboundEvent) {
        let guarded = self.guarded.lock();
        if guarded.epoch != epoch {
            return;
        }
        match event {
            InboundEvent::Audio { data, sample_rate } => {
                // Undecodable chunks are logged by the scheduler and skipped
                let _ = self.scheduler.schedule_chunk(&data, sample_rate);
            }
            InboundEvent::Interrupted => self.scheduler.interrupt(),
            InboundEvent::TurnComplete => tracing::debug!("Agent turn complete"),
            InboundEvent::SetupComplete => tracing::debug!("Setup complete"),
        }
    }

    /// Transport ended for the connection started under `epoch`
    fn finish(&self, epoch: u64, error: Option<ConnectionError>) {
        let mut guarded = self.guarded.lock();
        if guarded.epoch != epoch {
            return;
        }
        self.teardown(&mut guarded);
        match error {
            Some(e) => {
                tracing::error!("Live session failed: {}", e);
                guarded.last_error = Some(e);
                self.set_state(SessionState::Error);
            }
            None => {
                tracing::info!("Live session ended by the service");
                self.set_state(SessionState::Closed);
            }
        }
        drop(guarded);
        self.scheduler.interrupt();
    }
}

async fn capture_loop(
    mut capture: StreamView,
    queue: Arc<SendQueue<EncodedAudioPacket>>,
    frame_samples: usize,
) {
    let mut assembler = FrameAssembler::new(INPUT_SAMPLE_RATE, frame_samples);
    let mut sequence = 0u64;

    while let Some(frame) = capture.next_frame().await {
        for samples in assembler.push(&frame) {
            if queue.push(codec::encode(&samples, sequence)) {
                tracing::warn!(
                    "Send queue full, dropped oldest frame ({} dropped so far)",
                    queue.dropped_count()
                );
            }
            sequence += 1;
        }
    }
    tracing::debug!("Capture stream ended");
}

async fn send_loop(
    inner: Arc<SessionInner>,
    epoch: u64,
    queue: Arc<SendQueue<EncodedAudioPacket>>,
    mut sink: Box<dyn FrameSink>,
) {
    loop {
        let packet = queue.pop().await;
        if let Err(e) = sink.send(ClientMessage::audio(packet)).await {
            inner.finish(epoch, Some(e));
            return;
        }
        inner.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

async fn receive_loop(inner: Arc<SessionInner>, epoch: u64, mut source: Box<dyn MessageSource>) {
    while let Some(next) = source.next_events().await {
        match next {
            Ok(events) => {
                for event in events {
                    inner.dispatch(epoch, event);
                }
            }
            Err(e) => {
                inner.finish(epoch, Some(e));
                return;
            }
        }
    }
    inner.finish(epoch, None);
}
