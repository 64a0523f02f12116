//! Peer mesh
//!
//! Tracks every pairwise link by peer id. Each outgoing call is tagged with
//! an attempt number, and `disconnect_all` bumps the mesh epoch; a call that
//! completes after its entry was replaced or torn down closes itself and
//! leaves the map alone.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::audio::stream::AudioStream;
use crate::error::PeerLinkError;
use crate::peer::connector::{IncomingOffer, PeerCall, PeerConnector};
use crate::peer::link::{CallDirection, PeerEvent, PeerLink, PeerState};

const EVENT_CAPACITY: usize = 64;

struct LinkEntry {
    link: PeerLink,
    attempt: u64,
    call: Option<PeerCall>,
    watcher: Option<JoinHandle<()>>,
}

impl LinkEntry {
    fn teardown(self) {
        if let Some(watcher) = self.watcher {
            watcher.abort();
        }
        if let Some(call) = self.call {
            call.close();
        }
    }
}

struct MeshInner {
    connector: Arc<dyn PeerConnector>,
    links: DashMap<String, LinkEntry>,
    events: broadcast::Sender<PeerEvent>,
    epoch: AtomicU64,
    next_attempt: AtomicU64,
    local: Mutex<Option<AudioStream>>,
}

/// Manager of independent pairwise voice links
pub struct PeerMesh {
    inner: Arc<MeshInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerMesh {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MeshInner {
                connector,
                links: DashMap::new(),
                events,
                epoch: AtomicU64::new(0),
                next_attempt: AtomicU64::new(1),
                local: Mutex::new(None),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Start auto-accepting inbound offers, answering with `local`
    pub fn start(&self, local: AudioStream) {
        *self.inner.local.lock() = Some(local);
        let mut accept_task = self.accept_task.lock();
        if accept_task.is_some() {
            return;
        }
        let Some(incoming) = self.inner.connector.incoming() else {
            tracing::warn!("Peer connector offers already taken, not accepting calls");
            return;
        };
        *accept_task = Some(tokio::spawn(accept_loop(self.inner.clone(), incoming)));
        tracing::info!("Accepting calls as {}", self.local_id());
    }

    /// Id to share with other participants
    pub fn local_id(&self) -> &str {
        self.inner.connector.local_id()
    }

    /// Call a peer. Calls to distinct ids proceed independently.
    pub async fn call(&self, peer_id: &str, local: &AudioStream) -> Result<PeerLink, PeerLinkError> {
        let inner = &self.inner;
        if peer_id.is_empty() || peer_id == self.local_id() {
            return Err(PeerLinkError::InvalidPeerId(peer_id.to_string()));
        }

        let epoch = inner.epoch.load(Ordering::SeqCst);
        let attempt = inner.next_attempt.fetch_add(1, Ordering::SeqCst);
        {
            let mut entry = match inner.links.entry(peer_id.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(existing) if existing.get().link.is_live() => {
                    return Err(PeerLinkError::AlreadyLinked(peer_id.to_string()));
                }
                dashmap::mapref::entry::Entry::Occupied(existing) => existing.into_ref(),
                dashmap::mapref::entry::Entry::Vacant(vacant) => vacant.insert(LinkEntry {
                    link: PeerLink::new(peer_id, CallDirection::Outgoing),
                    attempt,
                    call: None,
                    watcher: None,
                }),
            };
            entry.link = PeerLink::new(peer_id, CallDirection::Outgoing).connecting();
            entry.attempt = attempt;
        }
        inner.emit(PeerEvent::Connecting {
            peer_id: peer_id.to_string(),
        });
        tracing::info!("Calling {}", peer_id);

        let result = inner.connector.call(peer_id, local.subscribe()).await;
        inner.complete_call(peer_id, epoch, attempt, result)
    }

    /// Answer an inbound offer with the local stream
    pub fn accept_incoming(&self, offer: IncomingOffer) -> Result<PeerLink, PeerLinkError> {
        self.inner.accept_incoming(offer)
    }

    /// Tear down one link
    pub fn hangup(&self, peer_id: &str) -> Result<(), PeerLinkError> {
        let (_, entry) = self
            .inner
            .links
            .remove(peer_id)
            .ok_or_else(|| PeerLinkError::NotFound(peer_id.to_string()))?;
        let was_live = entry.link.is_live();
        entry.teardown();
        if was_live {
            self.inner.emit(PeerEvent::Disconnected {
                peer_id: peer_id.to_string(),
            });
        }
        tracing::info!("Hung up on {}", peer_id);
        Ok(())
    }

    /// Tear down every link. Calls still negotiating are closed when they
    /// complete.
    pub fn disconnect_all(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);

        let mut ids: Vec<String> = inner.links.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        for id in ids {
            if let Some((_, entry)) = inner.links.remove(&id) {
                let was_live = entry.link.is_live();
                entry.teardown();
                if was_live {
                    inner.emit(PeerEvent::Disconnected { peer_id: id });
                }
            }
        }
    }

    /// Disconnect everything and stop accepting calls
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.disconnect_all();
        *self.inner.local.lock() = None;
    }

    /// Snapshot of every link, ordered by peer id
    pub fn links(&self) -> Vec<PeerLink> {
        let mut links: Vec<PeerLink> = self.inner.links.iter().map(|e| e.link.clone()).collect();
        links.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        links
    }

    pub fn link(&self, peer_id: &str) -> Option<PeerLink> {
        self.inner.links.get(peer_id).map(|e| e.link.clone())
    }

    /// Remote streams of connected links
    pub fn remote_streams(&self) -> Vec<(String, AudioStream)> {
        self.links()
            .into_iter()
            .filter_map(|link| link.remote.map(|remote| (link.peer_id, remote)))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for PeerMesh {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MeshInner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn complete_call(
        self: &Arc<Self>,
        peer_id: &str,
        epoch: u64,
        attempt: u64,
        result: Result<PeerCall, PeerLinkError>,
    ) -> Result<PeerLink, PeerLinkError> {
        let current = self.epoch.load(Ordering::SeqCst) == epoch;
        let mut entry = match self.links.get_mut(peer_id) {
            Some(entry) if current && entry.attempt == attempt => entry,
            _ => {
                tracing::debug!("Call to {} finished after teardown", peer_id);
                if let Ok(call) = result {
                    call.close();
                }
                return Err(PeerLinkError::Closed);
            }
        };

        match result {
            Ok(call) => {
                let remote = call.remote.clone();
                entry.link = entry.link.clone().connected(remote.clone());
                entry.watcher = Some(self.watch_call(peer_id, attempt, &call));
                entry.call = Some(call);
                let link = entry.link.clone();
                drop(entry);

                tracing::info!("Connected to {}", peer_id);
                self.emit(PeerEvent::Connected {
                    peer_id: peer_id.to_string(),
                    remote,
                });
                Ok(link)
            }
            Err(e) => {
                entry.link = entry.link.clone().failed(e.clone());
                drop(entry);

                tracing::warn!("Call to {} failed: {}", peer_id, e);
                self.emit(PeerEvent::Failed {
                    peer_id: peer_id.to_string(),
                    error: e.clone(),
                });
                Err(e)
            }
        }
    }

    fn accept_incoming(self: &Arc<Self>, offer: IncomingOffer) -> Result<PeerLink, PeerLinkError> {
        let peer_id = offer.peer_id.clone();
        let Some(local) = self.local.lock().clone() else {
            offer.reject();
            return Err(PeerLinkError::Unavailable(peer_id));
        };

        // A new offer from a known peer replaces whatever link we had
        if let Some((_, previous)) = self.links.remove(&peer_id) {
            previous.teardown();
        }

        let call = offer.answer(local.subscribe())?;
        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        let remote = call.remote.clone();
        let link = PeerLink::new(&peer_id, CallDirection::Incoming).connected(remote.clone());
        let watcher = self.watch_call(&peer_id, attempt, &call);
        self.links.insert(
            peer_id.clone(),
            LinkEntry {
                link: link.clone(),
                attempt,
                call: Some(call),
                watcher: Some(watcher),
            },
        );

        tracing::info!("Accepted call from {}", peer_id);
        self.emit(PeerEvent::Connected { peer_id, remote });
        Ok(link)
    }

    /// Drop the link once the remote side hangs up
    fn watch_call(self: &Arc<Self>, peer_id: &str, attempt: u64, call: &PeerCall) -> JoinHandle<()> {
        let inner = Arc::downgrade(self);
        let handle = call.handle.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            handle.closed().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let removed = inner
                .links
                .remove_if(&peer_id, |_, entry| entry.attempt == attempt);
            if removed.is_some() {
                tracing::info!("{} hung up", peer_id);
                inner.emit(PeerEvent::Disconnected { peer_id });
            }
        })
    }
}

async fn accept_loop(inner: Arc<MeshInner>, mut incoming: mpsc::UnboundedReceiver<IncomingOffer>) {
    while let Some(offer) = incoming.recv().await {
        let peer_id = offer.peer_id.clone();
        if let Err(e) = inner.accept_incoming(offer) {
            tracing::warn!("Could not accept call from {}: {}", peer_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::hub::SignalingHub;
    use std::time::Duration;

    fn mesh(hub: &Arc<SignalingHub>) -> PeerMesh {
        PeerMesh::new(Arc::new(hub.connector(Duration::from_millis(200))))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_call_connects_both_sides() {
        let hub = SignalingHub::new();
        let alice = mesh(&hub);
        let bob = mesh(&hub);
        let alice_mic = AudioStream::new(16_000, 1);
        let bob_mic = AudioStream::new(16_000, 1);
        bob.start(bob_mic.clone());
        let mut bob_events = bob.subscribe();

        let link = alice.call(bob.local_id(), &alice_mic).await.unwrap();
        assert_eq!(link.state, PeerState::Connected);
        assert_eq!(link.direction, CallDirection::Outgoing);
        assert!(link.remote.is_some());

        let event = bob_events.recv().await.unwrap();
        assert!(matches!(event, PeerEvent::Connected { .. }));
        assert_eq!(event.peer_id(), alice.local_id());
        let bob_side = bob.link(alice.local_id()).unwrap();
        assert_eq!(bob_side.direction, CallDirection::Incoming);
        assert_eq!(bob_side.participant.label, format!("Friend {}", &alice.local_id()[..4]));
    }

    #[tokio::test]
    async fn test_distinct_calls_are_independent() {
        let hub = SignalingHub::new();
        let alice = mesh(&hub);
        let bob = mesh(&hub);
        let mic = AudioStream::new(16_000, 1);
        bob.start(AudioStream::new(16_000, 1));

        let gone = "00000000-0000-0000-0000-000000000000";
        let (to_bob, to_gone) = tokio::join!(
            alice.call(bob.local_id(), &mic),
            alice.call(gone, &mic)
        );

        assert_eq!(to_bob.unwrap().state, PeerState::Connected);
        assert_eq!(to_gone.unwrap_err(), PeerLinkError::Unavailable(gone.to_string()));

        let links = alice.links();
        assert_eq!(links.len(), 2);
        assert_eq!(alice.link(bob.local_id()).unwrap().state, PeerState::Connected);
        let failed = alice.link(gone).unwrap();
        assert_eq!(failed.state, PeerState::Failed);
        assert_eq!(failed.error, Some(PeerLinkError::Unavailable(gone.to_string())));
        assert_eq!(alice.remote_streams().len(), 1);
    }

    #[tokio::test]
    async fn test_hangup_propagates() {
        let hub = SignalingHub::new();
        let alice = mesh(&hub);
        let bob = mesh(&hub);
        let mic = AudioStream::new(16_000, 1);
        bob.start(AudioStream::new(16_000, 1));

        alice.call(bob.local_id(), &mic).await.unwrap();
        settle().await;
        assert!(bob.link(alice.local_id()).is_some());

        let mut bob_events = bob.subscribe();
        alice.hangup(bob.local_id()).unwrap();
        assert!(alice.link(bob.local_id()).is_none());
        assert_eq!(
            alice.hangup(bob.local_id()),
            Err(PeerLinkError::NotFound(bob.local_id().to_string()))
        );

        let event = bob_events.recv().await.unwrap();
        assert!(matches!(event, PeerEvent::Disconnected { .. }));
        assert!(bob.link(alice.local_id()).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_call_rejected() {
        let hub = SignalingHub::new();
        let alice = mesh(&hub);
        let bob = mesh(&hub);
        let mic = AudioStream::new(16_000, 1);
        bob.start(AudioStream::new(16_000, 1));

        alice.call(bob.local_id(), &mic).await.unwrap();
        assert_eq!(
            alice.call(bob.local_id(), &mic).await.unwrap_err(),
            PeerLinkError::AlreadyLinked(bob.local_id().to_string())
        );
        let own = alice.local_id().to_string();
        assert!(matches!(
            alice.call(&own, &mic).await,
            Err(PeerLinkError::InvalidPeerId(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_all_discards_in_flight_call() {
        let hub = SignalingHub::new();
        let alice = Arc::new(mesh(&hub));
        let slow = hub.connector(Duration::from_secs(5));
        let slow_id = slow.local_id().to_string();
        let mut slow_inbox = slow.incoming().unwrap();
        let mic = AudioStream::new(16_000, 1);

        let calling = {
            let alice = alice.clone();
            let mic = mic.clone();
            let slow_id = slow_id.clone();
            tokio::spawn(async move { alice.call(&slow_id, &mic).await })
        };

        let offer = slow_inbox.recv().await.unwrap();
        assert_eq!(alice.link(&slow_id).unwrap().state, PeerState::Connecting);

        alice.disconnect_all();
        assert!(alice.links().is_empty());

        // The answer arrives after teardown
        let late = offer.answer(AudioStream::new(16_000, 1).subscribe()).unwrap();
        assert_eq!(calling.await.unwrap().unwrap_err(), PeerLinkError::Closed);
        assert!(alice.links().is_empty());
        assert!(late.handle.is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_all_when_empty() {
        let hub = SignalingHub::new();
        let alice = mesh(&hub);
        alice.disconnect_all();
        alice.disconnect_all();
        assert!(alice.links().is_empty());
    }
}
