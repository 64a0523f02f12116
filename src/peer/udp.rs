//! Direct UDP peer transport
//!
//! Ids have the form `<uuid>@<ip:port>`, so sharing an id is enough to reach
//! its owner. Offers are retransmitted until answered or the call times out;
//! media is sent as 20 ms PCM16 frames, best effort.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::stream::{AudioStream, StreamView};
use crate::codec::{decode_pcm16, encode_pcm16};
use crate::config::PeerConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::PeerLinkError;
use crate::peer::connector::{
    forward_frames, remote_stream, CallHandle, IncomingOffer, OfferResponder, PeerCall,
    PeerConnector,
};
use crate::peer::wire::PeerPacket;

/// Socket buffer size (256KB)
const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Create a non-blocking UDP socket bound to `addr`
pub fn create_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Network address embedded in a peer id
pub fn parse_peer_id(id: &str) -> Result<SocketAddr, PeerLinkError> {
    let (name, addr) = id
        .split_once('@')
        .ok_or_else(|| PeerLinkError::InvalidPeerId(id.to_string()))?;
    if name.is_empty() {
        return Err(PeerLinkError::InvalidPeerId(id.to_string()));
    }
    addr.parse()
        .map_err(|_| PeerLinkError::InvalidPeerId(id.to_string()))
}

struct UdpCall {
    addr: SocketAddr,
    remote: AudioStream,
    handle: Arc<CallHandle>,
}

struct UdpShared {
    id: String,
    socket: UdpSocket,
    calls: DashMap<Uuid, UdpCall>,
    /// Outgoing offers awaiting an answer (true) or rejection (false).
    /// The sender is taken on the first decision; the entry stays until the
    /// caller has established or given up.
    pending: DashMap<Uuid, Option<oneshot::Sender<bool>>>,
    /// Incoming offers awaiting a local decision
    offered: DashMap<Uuid, SocketAddr>,
    incoming_tx: mpsc::UnboundedSender<IncomingOffer>,
    frame_samples: usize,
}

impl UdpShared {
    /// Best-effort send; never waits on the socket
    fn send_to(&self, packet: &PeerPacket, addr: SocketAddr) -> bool {
        let bytes = match packet.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode peer packet: {}", e);
                return false;
            }
        };
        match self.socket.try_send_to(&bytes, addr) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Send to {} failed: {}", addr, e);
                false
            }
        }
    }

    fn establish(
        self: &Arc<Self>,
        call_id: Uuid,
        addr: SocketAddr,
        peer_id: &str,
        local: StreamView,
    ) -> PeerCall {
        let remote = remote_stream();
        let handle = CallHandle::new();
        self.calls.insert(
            call_id,
            UdpCall {
                addr,
                remote: remote.clone(),
                handle: handle.clone(),
            },
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        handle.on_close(move || {
            if let Some(shared) = weak.upgrade() {
                // Absent when the remote side said bye first
                if shared.calls.remove(&call_id).is_some() {
                    shared.send_to(&PeerPacket::Bye { call_id }, addr);
                }
            }
        });

        let weak: Weak<Self> = Arc::downgrade(self);
        let mut sequence = 0u32;
        handle.attach(tokio::spawn(forward_frames(local, self.frame_samples, move |frame| {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            let packet = PeerPacket::Audio {
                call_id,
                sequence,
                pcm: encode_pcm16(&frame).to_vec(),
            };
            sequence = sequence.wrapping_add(1);
            shared.send_to(&packet, addr);
            true
        })));

        tracing::info!("UDP call {} with {} established", call_id, addr);
        PeerCall {
            peer_id: peer_id.to_string(),
            remote,
            handle,
        }
    }

    fn handle_packet(self: &Arc<Self>, packet: PeerPacket, from: SocketAddr) {
        match packet {
            PeerPacket::Offer { call_id, from: caller } => {
                if self.calls.contains_key(&call_id) {
                    // Our answer was lost
                    self.send_to(
                        &PeerPacket::Answer {
                            call_id,
                            from: self.id.clone(),
                        },
                        from,
                    );
                    return;
                }
                if self.offered.contains_key(&call_id) {
                    return;
                }
                self.offered.insert(call_id, from);
                tracing::info!("Incoming call {} from {}", call_id, caller);
                let responder = UdpResponder {
                    shared: self.clone(),
                    call_id,
                    addr: from,
                    decided: false,
                };
                // An undelivered offer drops its responder, which rejects it
                if self
                    .incoming_tx
                    .send(IncomingOffer::new(caller, Box::new(responder)))
                    .is_err()
                {
                    tracing::debug!("Nobody is accepting calls, dropping offer {}", call_id);
                }
            }
            PeerPacket::Answer { call_id, .. } => {
                if let Some(mut entry) = self.pending.get_mut(&call_id) {
                    if let Some(tx) = entry.take() {
                        let _ = tx.send(true);
                    }
                    return;
                }
                if !self.calls.contains_key(&call_id) {
                    // The caller gave up before this answer arrived
                    tracing::debug!("Late answer for call {} from {}, hanging up", call_id, from);
                    self.send_to(&PeerPacket::Bye { call_id }, from);
                }
            }
            PeerPacket::Reject { call_id } => {
                if let Some(mut entry) = self.pending.get_mut(&call_id) {
                    if let Some(tx) = entry.take() {
                        let _ = tx.send(false);
                    }
                }
            }
            PeerPacket::Audio { call_id, pcm, .. } => {
                let Some(call) = self.calls.get(&call_id) else {
                    return;
                };
                if call.addr != from {
                    return;
                }
                match decode_pcm16(&pcm) {
                    Ok(samples) => {
                        call.remote.push(&samples);
                    }
                    Err(e) => tracing::debug!("Dropping peer frame: {}", e),
                }
            }
            PeerPacket::Bye { call_id } => {
                if let Some((_, call)) = self.calls.remove(&call_id) {
                    tracing::info!("Peer at {} hung up call {}", call.addr, call_id);
                    call.handle.close();
                }
            }
        }
    }
}

async fn receive_loop(shared: Arc<UdpShared>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE * 2];
    loop {
        let (len, from) = match shared.socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                tracing::warn!("Peer socket receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        match PeerPacket::from_bytes(&buf[..len]) {
            Ok(packet) => shared.handle_packet(packet, from),
            Err(e) => tracing::debug!("Ignoring malformed datagram from {}: {}", from, e),
        }
    }
}

struct UdpResponder {
    shared: Arc<UdpShared>,
    call_id: Uuid,
    addr: SocketAddr,
    decided: bool,
}

impl OfferResponder for UdpResponder {
    fn answer(mut self: Box<Self>, local: StreamView) -> Result<PeerCall, PeerLinkError> {
        self.decided = true;
        self.shared.offered.remove(&self.call_id);
        let call = self.shared.establish(self.call_id, self.addr, "", local);
        self.shared.send_to(
            &PeerPacket::Answer {
                call_id: self.call_id,
                from: self.shared.id.clone(),
            },
            self.addr,
        );
        Ok(call)
    }

    fn reject(mut self: Box<Self>) {
        self.decided = true;
        self.shared.offered.remove(&self.call_id);
        self.shared
            .send_to(&PeerPacket::Reject { call_id: self.call_id }, self.addr);
    }
}

impl Drop for UdpResponder {
    fn drop(&mut self) {
        if self.decided {
            return;
        }
        // Dropped without a decision: forget the offer and let the caller go
        self.shared.offered.remove(&self.call_id);
        self.shared
            .send_to(&PeerPacket::Reject { call_id: self.call_id }, self.addr);
        tracing::debug!("Offer {} dropped without an answer", self.call_id);
    }
}

/// UDP implementation of [`PeerConnector`]
pub struct UdpConnector {
    shared: Arc<UdpShared>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<IncomingOffer>>>,
    receive_task: JoinHandle<()>,
    call_timeout: Duration,
    offer_interval: Duration,
}

impl UdpConnector {
    /// Bind the configured address and start receiving. Must be called
    /// within a Tokio runtime.
    pub fn bind(config: &PeerConfig) -> Result<Self, PeerLinkError> {
        let bind_addr: SocketAddr = config
            .bind_address
            .parse()
            .map_err(|_| PeerLinkError::Transport(format!("invalid bind address {}", config.bind_address)))?;
        let std_socket =
            create_socket(bind_addr).map_err(|e| PeerLinkError::Transport(e.to_string()))?;
        let socket =
            UdpSocket::from_std(std_socket).map_err(|e| PeerLinkError::Transport(e.to_string()))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| PeerLinkError::Transport(e.to_string()))?;

        let advertised = match &config.advertise_address {
            Some(addr) => addr
                .parse()
                .map_err(|_| PeerLinkError::Transport(format!("invalid advertise address {}", addr)))?,
            None if local_addr.ip().is_unspecified() => {
                tracing::warn!(
                    "Bound to {} without an advertise address, advertising loopback",
                    local_addr
                );
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port())
            }
            None => local_addr,
        };

        let id = format!("{}@{}", Uuid::new_v4(), advertised);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(UdpShared {
            id,
            socket,
            calls: DashMap::new(),
            pending: DashMap::new(),
            offered: DashMap::new(),
            incoming_tx,
            frame_samples: config.frame_samples,
        });
        let receive_task = tokio::spawn(receive_loop(shared.clone()));

        tracing::info!("Peer transport listening on {} as {}", local_addr, shared.id);

        Ok(Self {
            shared,
            incoming: Mutex::new(Some(incoming_rx)),
            receive_task,
            call_timeout: config.call_timeout(),
            offer_interval: config.offer_interval(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.socket.local_addr().ok()
    }

    pub fn active_calls(&self) -> usize {
        self.shared.calls.len()
    }
}

impl Drop for UdpConnector {
    fn drop(&mut self) {
        self.receive_task.abort();
        let handles: Vec<Arc<CallHandle>> = self
            .shared
            .calls
            .iter()
            .map(|call| call.handle.clone())
            .collect();
        for handle in handles {
            handle.close();
        }
    }
}

#[async_trait]
impl PeerConnector for UdpConnector {
    fn local_id(&self) -> &str {
        &self.shared.id
    }

    async fn call(&self, peer_id: &str, local: StreamView) -> Result<PeerCall, PeerLinkError> {
        if peer_id == self.shared.id {
            return Err(PeerLinkError::InvalidPeerId(peer_id.to_string()));
        }
        let addr = parse_peer_id(peer_id)?;
        let call_id = Uuid::new_v4();
        let (answer_tx, mut answer_rx) = oneshot::channel();
        self.shared.pending.insert(call_id, Some(answer_tx));

        let offer = PeerPacket::Offer {
            call_id,
            from: self.shared.id.clone(),
        };
        let deadline = tokio::time::sleep(self.call_timeout);
        tokio::pin!(deadline);
        let mut retransmit = tokio::time::interval(self.offer_interval);

        let outcome = loop {
            tokio::select! {
                answer = &mut answer_rx => break answer.map_err(|_| PeerLinkError::Closed),
                _ = retransmit.tick() => {
                    self.shared.send_to(&offer, addr);
                }
                _ = &mut deadline => break Err(PeerLinkError::Timeout(peer_id.to_string())),
            }
        };
        let outcome = match outcome {
            Err(PeerLinkError::Timeout(_)) => {
                // After removal no decision can arrive; one may have raced the deadline
                self.shared.pending.remove(&call_id);
                answer_rx
                    .try_recv()
                    .map_err(|_| PeerLinkError::Timeout(peer_id.to_string()))
            }
            other => other,
        };

        let result = match outcome {
            Ok(true) => Ok(self.shared.establish(call_id, addr, peer_id, local)),
            Ok(false) => Err(PeerLinkError::Rejected(peer_id.to_string())),
            Err(e) => Err(e),
        };
        // Late answers for a call we no longer hold get a bye
        self.shared.pending.remove(&call_id);
        result
    }

    fn incoming(&self) -> Option<mpsc::UnboundedReceiver<IncomingOffer>> {
        self.incoming.lock().take()
    }
}
