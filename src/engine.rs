//! Engine composition
//!
//! [`VoiceEngine`] wires one capture stream and one output device to the
//! agent session and the peer mesh. Every connected peer gets its own
//! playback scheduler and speaking monitor; both are created and torn down
//! from mesh events.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::buffer::AudioBuffer;
use crate::audio::capture::DeviceCapture;
use crate::audio::stream::AudioStream;
use crate::config::{AppConfig, MonitorConfig};
use crate::error::{ConnectionError, PeerLinkError, Result};
use crate::monitor::{IntervalTicker, SpeakingMonitor, SpeakingState};
use crate::peer::{PeerConnector, PeerEvent, PeerLink, PeerMesh, UdpConnector};
use crate::playback::{AudioOutput, DeviceOutput, PlaybackScheduler};
use crate::session::{DuplexSession, LiveConnector, SessionState, WebSocketConnector};

/// Externally constructed engine dependencies
pub struct EngineParts {
    pub config: AppConfig,
    /// Local capture stream shared with the agent session and every peer
    pub capture: AudioStream,
    pub output: Arc<dyn AudioOutput>,
    pub live: Arc<dyn LiveConnector>,
    pub peers: Arc<dyn PeerConnector>,
}

/// Playback and monitoring for one connected peer
struct RemotePeer {
    stream_id: Uuid,
    scheduler: Arc<PlaybackScheduler>,
    monitor: SpeakingMonitor,
    feeder: JoinHandle<()>,
}

impl RemotePeer {
    fn stop(self) {
        self.feeder.abort();
        self.monitor.stop();
        self.scheduler.shutdown();
    }
}

struct EngineShared {
    output: Arc<dyn AudioOutput>,
    monitor_config: MonitorConfig,
    release: Duration,
    peer_latency: Duration,
    remotes: DashMap<String, RemotePeer>,
}

pub struct VoiceEngine {
    config: AppConfig,
    capture: AudioStream,
    device: Mutex<Option<DeviceCapture>>,
    session: DuplexSession,
    mesh: Arc<PeerMesh>,
    local_monitor: SpeakingMonitor,
    shared: Arc<EngineShared>,
    events_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl VoiceEngine {
    /// Open the default devices and transports described by `config`
    ///
    /// Capture is opened first: a denied microphone fails before any other
    /// device or socket is acquired.
    pub fn open(config: AppConfig) -> Result<Self> {
        let device = DeviceCapture::open(&config.capture)?;
        let output = Arc::new(DeviceOutput::open(&config.playback)?);
        let peers = Arc::new(UdpConnector::bind(&config.peer)?);
        let live = Arc::new(WebSocketConnector::from_config(&config.live));

        let engine = Self::from_parts(EngineParts {
            capture: device.stream().clone(),
            config,
            output,
            live,
            peers,
        });
        *engine.device.lock() = Some(device);
        Ok(engine)
    }

    /// Assemble an engine from injected parts. Must run inside a tokio runtime.
    pub fn from_parts(parts: EngineParts) -> Self {
        let EngineParts {
            config,
            capture,
            output,
            live,
            peers,
        } = parts;

        let scheduler = PlaybackScheduler::start("agent", output.clone(), config.playback.release());
        let session = DuplexSession::new(live, scheduler, &config.live);

        let mesh = Arc::new(PeerMesh::new(peers));
        let shared = Arc::new(EngineShared {
            output,
            monitor_config: config.monitor.clone(),
            release: config.playback.release(),
            peer_latency: config.playback.peer_latency(),
            remotes: DashMap::new(),
        });
        // Subscribe before accepting so no early Connected event is missed
        let events = mesh.subscribe();
        let events_task = tokio::spawn(event_loop(shared.clone(), mesh.clone(), events));
        mesh.start(capture.clone());

        let local_monitor = SpeakingMonitor::start(
            "local",
            capture.subscribe(),
            IntervalTicker::new(config.monitor.tick()),
            &config.monitor,
        );

        tracing::info!("Voice engine ready, peer id {}", mesh.local_id());
        Self {
            config,
            capture,
            device: Mutex::new(None),
            session,
            mesh,
            local_monitor,
            shared,
            events_task: Mutex::new(Some(events_task)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn capture(&self) -> &AudioStream {
        &self.capture
    }

    // ---- agent session ----

    /// Start the agent session on the local capture stream
    pub async fn connect_agent(&self) -> std::result::Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.session.connect(self.capture.subscribe()).await
    }

    pub fn disconnect_agent(&self) {
        self.session.disconnect();
    }

    pub fn session(&self) -> &DuplexSession {
        &self.session
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Agent speaking flag, driven by its playback timeline
    pub fn agent_speaking(&self) -> watch::Receiver<bool> {
        self.session.scheduler().speaking()
    }

    // ---- peers ----

    pub fn local_id(&self) -> &str {
        self.mesh.local_id()
    }

    pub async fn call_peer(&self, peer_id: &str) -> std::result::Result<PeerLink, PeerLinkError> {
        if self.is_closed() {
            return Err(PeerLinkError::Closed);
        }
        self.mesh.call(peer_id, &self.capture).await
    }

    pub fn hangup(&self, peer_id: &str) -> std::result::Result<(), PeerLinkError> {
        self.mesh.hangup(peer_id)
    }

    pub fn disconnect_peers(&self) {
        self.mesh.disconnect_all();
        self.shared.detach_all();
    }

    pub fn mesh(&self) -> &PeerMesh {
        &self.mesh
    }

    pub fn links(&self) -> Vec<PeerLink> {
        self.mesh.links()
    }

    pub fn subscribe_peers(&self) -> broadcast::Receiver<PeerEvent> {
        self.mesh.subscribe()
    }

    // ---- speaking ----

    pub fn local_speaking(&self) -> watch::Receiver<SpeakingState> {
        self.local_monitor.subscribe()
    }

    /// Speaking state of a connected peer
    pub fn peer_speaking(&self, peer_id: &str) -> Option<watch::Receiver<SpeakingState>> {
        self.shared
            .remotes
            .get(peer_id)
            .map(|remote| remote.monitor.subscribe())
    }

    /// Whether a connected peer is speaking right now; false for unknown peers
    pub fn is_peer_speaking(&self, peer_id: &str) -> bool {
        self.shared
            .remotes
            .get(peer_id)
            .is_some_and(|remote| remote.monitor.is_speaking())
    }

    /// Playback scheduler of a connected peer
    pub fn peer_scheduler(&self, peer_id: &str) -> Option<Arc<PlaybackScheduler>> {
        self.shared
            .remotes
            .get(peer_id)
            .map(|remote| remote.scheduler.clone())
    }

    /// Peers with live playback, sorted
    pub fn playing_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.remotes.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    // ---- lifecycle ----

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear everything down and release the devices. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.events_task.lock().take() {
            task.abort();
        }
        self.mesh.shutdown();
        self.shared.detach_all();
        self.session.disconnect();
        self.session.scheduler().shutdown();
        self.local_monitor.stop();
        if let Some(mut device) = self.device.lock().take() {
            device.stop();
        }
        self.shared.output.close();
        tracing::info!("Voice engine shut down");
    }
}

impl Drop for VoiceEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EngineShared {
    fn attach(&self, peer_id: &str, remote: AudioStream) {
        if let Some(existing) = self.remotes.get(peer_id) {
            if existing.stream_id == remote.id() {
                return;
            }
        }

        let scheduler = PlaybackScheduler::start(
            format!("peer {}", peer_id),
            self.output.clone(),
            self.release,
        );
        let monitor = SpeakingMonitor::start(
            peer_id,
            remote.subscribe(),
            IntervalTicker::new(self.monitor_config.tick()),
            &self.monitor_config,
        );
        let feeder = tokio::spawn(feed_playback(
            peer_id.to_string(),
            remote.clone(),
            scheduler.clone(),
            self.peer_latency,
        ));

        let entry = RemotePeer {
            stream_id: remote.id(),
            scheduler,
            monitor,
            feeder,
        };
        if let Some(previous) = self.remotes.insert(peer_id.to_string(), entry) {
            previous.stop();
        }
        tracing::info!("Playing audio from {}", peer_id);
    }

    fn detach(&self, peer_id: &str) {
        if let Some((_, remote)) = self.remotes.remove(peer_id) {
            remote.stop();
            tracing::info!("Stopped audio from {}", peer_id);
        }
    }

    fn detach_all(&self) {
        let mut ids: Vec<String> = self.remotes.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        for id in ids {
            self.detach(&id);
        }
    }

    /// Bring playback in line with the mesh after missed events
    fn resync(&self, links: &[PeerLink]) {
        let live: Vec<&PeerLink> = links.iter().filter(|l| l.remote.is_some()).collect();
        let stale: Vec<String> = self
            .remotes
            .iter()
            .filter(|r| !live.iter().any(|l| &l.peer_id == r.key()))
            .map(|r| r.key().clone())
            .collect();
        for id in stale {
            self.detach(&id);
        }
        for link in live {
            if let Some(remote) = &link.remote {
                self.attach(&link.peer_id, remote.clone());
            }
        }
    }
}

async fn event_loop(
    shared: Arc<EngineShared>,
    mesh: Arc<PeerMesh>,
    mut events: broadcast::Receiver<PeerEvent>,
) {
    loop {
        match events.recv().await {
            Ok(PeerEvent::Connected { peer_id, remote }) => shared.attach(&peer_id, remote),
            Ok(PeerEvent::Failed { peer_id, .. }) | Ok(PeerEvent::Disconnected { peer_id }) => {
                shared.detach(&peer_id)
            }
            Ok(PeerEvent::Connecting { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} peer events, resyncing", n);
                shared.resync(&mesh.links());
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Schedule a peer's frames back to back. When the timeline has run dry the
/// next frame is preceded by `latency` of silence to absorb jitter.
async fn feed_playback(
    peer_id: String,
    remote: AudioStream,
    scheduler: Arc<PlaybackScheduler>,
    latency: Duration,
) {
    let mut view = remote.subscribe();
    drop(remote);
    let lead_samples = |rate: u32| (latency.as_secs_f64() * rate as f64).round() as usize;

    while let Some(frame) = view.next_frame().await {
        if scheduler.is_closed() {
            break;
        }
        if scheduler.active_count() == 0 && !latency.is_zero() {
            let lead = AudioBuffer::new(vec![0.0; lead_samples(frame.sample_rate)], frame.sample_rate);
            let _ = scheduler.schedule_buffer(lead);
        }
        let buffer = AudioBuffer::new(frame.to_mono(), frame.sample_rate);
        if let Err(e) = scheduler.schedule_buffer(buffer) {
            tracing::debug!("Dropped frame from {}: {}", peer_id, e);
        }
    }
    tracing::debug!("Audio from {} ended", peer_id);
}
