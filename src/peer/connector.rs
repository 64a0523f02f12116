//! Peer transport abstraction
//!
//! A [`PeerConnector`] owns the local identity and negotiates calls. An
//! established call is a [`PeerCall`]: the remote party's audio as an
//! [`AudioStream`] plus a [`CallHandle`] that tears the call down.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::convert::FrameAssembler;
use crate::audio::stream::{AudioStream, StreamView};
use crate::constants::INPUT_SAMPLE_RATE;
use crate::error::PeerLinkError;

type CloseHook = Box<dyn FnOnce() + Send>;

/// Teardown handle shared by everything serving one call
pub struct CallHandle {
    closed: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    hooks: Mutex<Vec<CloseHook>>,
}

impl CallHandle {
    pub fn new() -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            closed,
            tasks: Mutex::new(Vec::new()),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Tie a task to the call; aborted on close
    pub fn attach(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            task.abort();
            return;
        }
        self.tasks.lock().push(task);
    }

    /// Run `hook` once when the call closes
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_closed() {
            hook();
            return;
        }
        self.hooks.lock().push(Box::new(hook));
    }

    /// Close the call. Idempotent.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let hooks: Vec<CloseHook> = self.hooks.lock().drain(..).collect();
        for hook in hooks {
            hook();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the call is closed from either side
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// An established call
pub struct PeerCall {
    pub peer_id: String,
    /// What the remote participant says
    pub remote: AudioStream,
    pub handle: Arc<CallHandle>,
}

impl PeerCall {
    pub fn close(&self) {
        self.handle.close();
    }
}

impl std::fmt::Debug for PeerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCall")
            .field("peer_id", &self.peer_id)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

/// Transport side of an inbound offer
pub trait OfferResponder: Send {
    fn answer(self: Box<Self>, local: StreamView) -> Result<PeerCall, PeerLinkError>;
    fn reject(self: Box<Self>);
}

/// Inbound connection request
pub struct IncomingOffer {
    pub peer_id: String,
    responder: Box<dyn OfferResponder>,
}

impl IncomingOffer {
    pub fn new(peer_id: impl Into<String>, responder: Box<dyn OfferResponder>) -> Self {
        Self {
            peer_id: peer_id.into(),
            responder,
        }
    }

    /// Accept, sending `local` to the caller
    pub fn answer(self, local: StreamView) -> Result<PeerCall, PeerLinkError> {
        let mut call = self.responder.answer(local)?;
        call.peer_id = self.peer_id;
        Ok(call)
    }

    pub fn reject(self) {
        self.responder.reject()
    }
}

/// Negotiates pairwise calls for one local identity
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Opaque id other participants use to call us
    fn local_id(&self) -> &str;

    /// Call `peer_id`, sending `local` once connected
    async fn call(&self, peer_id: &str, local: StreamView) -> Result<PeerCall, PeerLinkError>;

    /// Inbound offers. Can be taken once.
    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingOffer>>;
}

/// Forward a local view as 16 kHz mono frames of `frame_samples`
pub(crate) async fn forward_frames(
    mut view: StreamView,
    frame_samples: usize,
    mut send: impl FnMut(Vec<f32>) -> bool,
) {
    let mut assembler = FrameAssembler::new(INPUT_SAMPLE_RATE, frame_samples);
    while let Some(frame) = view.next_frame().await {
        for samples in assembler.push(&frame) {
            if !send(samples) {
                return;
            }
        }
    }
}

/// Stream that carries a remote participant's audio
pub(crate) fn remote_stream() -> AudioStream {
    AudioStream::new(INPUT_SAMPLE_RATE, 1)
}
