//! In-process signaling
//!
//! Connects participants living in the same process. Offers are delivered
//! straight to the callee's inbox and media is forwarded between
//! [`AudioStream`]s, so calls behave like the network transport without a
//! socket.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::audio::stream::{AudioStream, StreamView};
use crate::constants::PEER_FRAME_SAMPLES;
use crate::error::PeerLinkError;
use crate::peer::connector::{
    forward_frames, remote_stream, CallHandle, IncomingOffer, OfferResponder, PeerCall,
    PeerConnector,
};

/// Callee's half, handed back to the caller on answer
struct Answered {
    callee_view: StreamView,
    callee_remote: AudioStream,
    callee_handle: Arc<CallHandle>,
}

/// Registry of in-process participants
#[derive(Default)]
pub struct SignalingHub {
    inboxes: DashMap<String, mpsc::UnboundedSender<IncomingOffer>>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new participant with a fresh id
    pub fn connector(self: &Arc<Self>, call_timeout: Duration) -> HubConnector {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(id.clone(), tx);
        tracing::debug!("Hub registered {}", id);
        HubConnector {
            hub: self.clone(),
            id,
            incoming: Mutex::new(Some(rx)),
            call_timeout,
        }
    }

    pub fn participant_count(&self) -> usize {
        self.inboxes.len()
    }
}

/// One participant's connection to a [`SignalingHub`]
pub struct HubConnector {
    hub: Arc<SignalingHub>,
    id: String,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<IncomingOffer>>>,
    call_timeout: Duration,
}

impl Drop for HubConnector {
    fn drop(&mut self) {
        self.hub.inboxes.remove(&self.id);
    }
}

#[async_trait]
impl PeerConnector for HubConnector {
    fn local_id(&self) -> &str {
        &self.id
    }

    async fn call(&self, peer_id: &str, local: StreamView) -> Result<PeerCall, PeerLinkError> {
        if peer_id == self.id {
            return Err(PeerLinkError::InvalidPeerId(peer_id.to_string()));
        }
        let inbox = self
            .hub
            .inboxes
            .get(peer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PeerLinkError::Unavailable(peer_id.to_string()))?;

        let (answer_tx, answer_rx) = oneshot::channel();
        let offer = IncomingOffer::new(self.id.clone(), Box::new(HubResponder { answer_tx }));
        inbox
            .send(offer)
            .map_err(|_| PeerLinkError::Unavailable(peer_id.to_string()))?;

        let answered = match tokio::time::timeout(self.call_timeout, answer_rx).await {
            Ok(Ok(answered)) => answered,
            Ok(Err(_)) => return Err(PeerLinkError::Rejected(peer_id.to_string())),
            Err(_) => return Err(PeerLinkError::Timeout(peer_id.to_string())),
        };

        let caller_remote = remote_stream();
        let caller_handle = CallHandle::new();

        let to_callee = answered.callee_remote.clone();
        caller_handle.attach(tokio::spawn(forward_frames(local, PEER_FRAME_SAMPLES, move |frame| {
            to_callee.push(&frame);
            true
        })));
        let to_caller = caller_remote.clone();
        answered.callee_handle.attach(tokio::spawn(forward_frames(
            answered.callee_view,
            PEER_FRAME_SAMPLES,
            move |frame| {
                to_caller.push(&frame);
                true
            },
        )));

        // Hanging up on either side ends the call for both
        {
            let callee = answered.callee_handle.clone();
            caller_handle.on_close(move || callee.close());
            let caller = caller_handle.clone();
            answered.callee_handle.on_close(move || caller.close());
        }

        tracing::info!("Hub call {} -> {} connected", self.id, peer_id);
        Ok(PeerCall {
            peer_id: peer_id.to_string(),
            remote: caller_remote,
            handle: caller_handle,
        })
    }

    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingOffer>> {
        self.incoming.lock().take()
    }
}

struct HubResponder {
    answer_tx: oneshot::Sender<Answered>,
}

impl OfferResponder for HubResponder {
    fn answer(self: Box<Self>, local: StreamView) -> Result<PeerCall, PeerLinkError> {
        let callee_remote = remote_stream();
        let callee_handle = CallHandle::new();
        self.answer_tx
            .send(Answered {
                callee_view: local,
                callee_remote: callee_remote.clone(),
                callee_handle: callee_handle.clone(),
            })
            .map_err(|_| PeerLinkError::Closed)?;
        Ok(PeerCall {
            peer_id: String::new(), // set by IncomingOffer::answer
            remote: callee_remote,
            handle: callee_handle,
        })
    }

    fn reject(self: Box<Self>) {}
}
