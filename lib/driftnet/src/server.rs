use crate::buffer::FRAME_CAPACITY;
use crate::context::Context;
use crate::crypto::CryptoContext;
use crate::emitter::{Emitter, Tick};
use crate::error::{ProtocolError, ProtocolResult};
use crate::job::{Job, JobPool};
use crate::packet::{
    ChallengeData, ChallengePacket, Header, Packet, PacketKind, RequestToken,
    REQUEST_PROTOCOL_ID_OFFSET,
};
use crate::peer::{Peer, PeerId, PeerState};
use crate::receiver::RecvJob;
use crate::sender::SendJob;
use crate::socket::{decode_incoming, SocketState, Statistics};
use crate::token::{ChallengeToken, ConnectTokenPrivate};
use crate::transport::Transport;
use crate::{
    ClientId, ANONYMOUS_EXPIRY_SCAN_FREQUENCY_HZ, ANONYMOUS_PEER_EXPIRY_SECS,
    DISCONNECT_FREQUENCY_HZ, DISCONNECT_REDUNDANT_LIMIT, KEEP_ALIVE_FREQUENCY_HZ,
};
use brine::crypto::{self, Key};
use brine::executor::Finished;
use brine::logging::{self, debug, info, trace, warn, Logger};
use brine::sequencer::Sequencer;
use brine::time::timestamp_secs;
use byteorder::{ByteOrder, LittleEndian};
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connectivity and payload notifications, drained after each `update` in
/// the order their triggering packets were accepted.
#[derive(Debug)]
pub enum ServerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Received(PeerId, Vec<u8>),
}

/// Construction parameters for a server socket.
pub struct ServerOptions {
    pub bind_address: SocketAddr,
    pub max_clients: usize,
    pub protocol_id: u64,
    pub private_key: Key,
}

enum ServerTask {
    Stop,
    DisconnectPeer(PeerId, Instant),
}

/// The server half of the protocol: validates connection requests against
/// the shared token key, challenges prospective clients, and maintains the
/// connected peer set with keep-alives, timeouts and redundant disconnect
/// broadcasts.
pub struct Server<T: Transport> {
    log: Logger,
    context: Context,
    transport: T,
    workers: JobPool,
    state: SocketState,
    statistics: Statistics,
    events: VecDeque<ServerEvent>,
    tasks: Sequencer<ServerTask>,

    bind_address: SocketAddr,
    max_clients: usize,
    protocol_id: u64,
    private_key: Key,
    challenge_key: Key,
    listen_crypto: Arc<CryptoContext>,

    challenge_sequence: u64,
    anonymous_sequence: u64,

    peers: Vec<Option<Peer>>,
    free: Vec<PeerId>,
    connected_by_address: HashMap<SocketAddr, PeerId>,
    anonymous_by_address: HashMap<SocketAddr, PeerId>,
    by_client_id: HashMap<ClientId, PeerId>,
    connected: IndexSet<PeerId>,
    anonymous: IndexSet<PeerId>,
    disconnecting: IndexSet<PeerId>,

    keep_alive_timer: Emitter,
    expiry_timer: Emitter,
    disconnect_timer: Emitter,

    next_job_id: u64,
    no_encrypt: bool,
}

impl<T: Transport> Server<T> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        context: Context,
        transport: T,
        options: ServerOptions,
        log: L,
    ) -> ProtocolResult<Server<T>> {
        let capability = transport.capability();
        if !capability.server {
            return Err(ProtocolError::WrongState);
        }
        if options.max_clients == 0 {
            return Err(ProtocolError::WrongState);
        }

        let workers = JobPool::new(context.worker_threads());

        Ok(Server {
            log: logging::child(log),
            context,
            transport,
            workers,
            state: SocketState::Stopped,
            statistics: Statistics::default(),
            events: VecDeque::new(),
            tasks: Sequencer::new(),
            bind_address: options.bind_address,
            max_clients: options.max_clients,
            protocol_id: options.protocol_id,
            private_key: options.private_key,
            challenge_key: [0u8; crypto::KEY_SIZE],
            listen_crypto: Arc::new(CryptoContext::empty()),
            challenge_sequence: 0,
            anonymous_sequence: 0,
            peers: Vec::new(),
            free: Vec::new(),
            connected_by_address: HashMap::new(),
            anonymous_by_address: HashMap::new(),
            by_client_id: HashMap::new(),
            connected: IndexSet::new(),
            anonymous: IndexSet::new(),
            disconnecting: IndexSet::new(),
            keep_alive_timer: Emitter::new(KEEP_ALIVE_FREQUENCY_HZ),
            expiry_timer: Emitter::new(ANONYMOUS_EXPIRY_SCAN_FREQUENCY_HZ),
            disconnect_timer: Emitter::new(DISCONNECT_FREQUENCY_HZ),
            next_job_id: 0,
            no_encrypt: capability.encryption,
        })
    }

    /// Binds the transport and starts the periodic broadcasts. A fresh
    /// challenge key is drawn per run, so challenge tokens from previous
    /// runs are worthless.
    pub fn start(&mut self, now: Instant) -> ProtocolResult<()> {
        if self.state != SocketState::Stopped {
            return Err(ProtocolError::WrongState);
        }

        self.challenge_key = crypto::random_key();
        self.listen_crypto = Arc::new(CryptoContext {
            protocol_id: self.protocol_id,
            encrypt_key: [0u8; crypto::KEY_SIZE],
            decrypt_key: [0u8; crypto::KEY_SIZE],
            private_key: self.private_key,
            challenge_key: self.challenge_key,
        });

        self.transport.listen(self.bind_address)?;

        info!(self.log, "server listening"; "address" => %self.bind_address,
              "max_clients" => self.max_clients);

        self.keep_alive_timer.start(now);
        self.expiry_timer.start(now);
        self.state = SocketState::Running;
        Ok(())
    }

    /// The pump: transport drain, worker completions, broadcasts, deferred
    /// tasks.
    pub fn update(&mut self, now: Instant) {
        let finished: Vec<Finished<Job>> = self.workers.drain().collect();
        for item in finished {
            self.complete_job(item, now);
        }

        if self.state != SocketState::Running {
            self.run_tasks();
            return;
        }

        let mut buffer = [0u8; FRAME_CAPACITY];
        while let Some((address, length)) = self.transport.poll_recv(&mut buffer) {
            self.handle_datagram(address, &buffer[..length], now);
            if self.state != SocketState::Running {
                break;
            }
        }

        self.poll_timers(now);
        self.run_tasks();
    }

    /// Queues application payload for a connected peer.
    pub fn send(&mut self, peer_id: PeerId, views: &[&[u8]]) -> ProtocolResult<()> {
        if self.state != SocketState::Running {
            return Err(ProtocolError::WrongState);
        }

        let length: usize = views.iter().map(|view| view.len()).sum();
        if length == 0 {
            return Ok(());
        }
        if length > self.context.payload_capacity() {
            return Err(ProtocolError::BufferTooSmall);
        }

        let (state, keep_alive) = {
            let peer = self.peer(peer_id).ok_or(ProtocolError::WrongState)?;
            (peer.state, peer.state == PeerState::Unconfirmed)
        };

        if state != PeerState::Connected && state != PeerState::Unconfirmed {
            return Err(ProtocolError::WrongState);
        }

        // An unconfirmed peer has not necessarily learned its client id yet;
        // lead with a keep-alive so the payload is interpretable
        if keep_alive {
            self.send_keep_alive(peer_id);
        }

        let mut data = Vec::with_capacity(length);
        for view in views {
            data.extend_from_slice(view);
        }

        let sequence = match self.peer_mut(peer_id) {
            Some(peer) => peer.next_sequence(),
            None => return Err(ProtocolError::WrongState),
        };

        self.dispatch_to(peer_id, Packet::Payload { sequence, data });
        Ok(())
    }

    /// Server-initiated disconnect: the application is notified right away,
    /// the peer lingers in `Disconnecting` while the redundant DISCONNECT
    /// volley goes out, then it is released.
    pub fn disconnect_peer(&mut self, peer_id: PeerId, now: Instant) {
        self.tasks.push(ServerTask::DisconnectPeer(peer_id, now));
        self.run_tasks();
    }

    /// Stops the socket: cancels every in-flight job, releases every peer
    /// and closes the transport.
    pub fn stop(&mut self) {
        if self.state != SocketState::Running {
            return;
        }
        self.state = SocketState::Stopping;
        self.tasks.push(ServerTask::Stop);
        self.run_tasks();
    }

    pub fn events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.events.drain(..)
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn anonymous_count(&self) -> usize {
        self.anonymous.len()
    }

    pub fn peer_client_id(&self, peer_id: PeerId) -> Option<ClientId> {
        self.peer(peer_id).map(|peer| peer.client_id)
    }

    pub fn peer_address(&self, peer_id: PeerId) -> Option<SocketAddr> {
        self.peer(peer_id).map(|peer| peer.address)
    }

    pub fn peer_state(&self, peer_id: PeerId) -> Option<PeerState> {
        self.peer(peer_id).map(|peer| peer.state)
    }

    /* --------------------------- Peer table ---------------------------- */

    #[inline]
    fn peer(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.get(peer_id).and_then(|slot| slot.as_ref())
    }

    #[inline]
    fn peer_mut(&mut self, peer_id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id).and_then(|slot| slot.as_mut())
    }

    fn acquire_peer(&mut self, address: SocketAddr, now: Instant) -> PeerId {
        match self.free.pop() {
            Some(peer_id) => {
                self.peers[peer_id] = Some(Peer::new(address, now));
                peer_id
            }
            None => {
                self.peers.push(Some(Peer::new(address, now)));
                self.peers.len() - 1
            }
        }
    }

    /// Releases a peer slot and scrubs every map entry pointing at it.
    /// Releasing an already vacant slot is a no-op.
    fn release_peer(&mut self, peer_id: PeerId) {
        let mut peer = match self.peers.get_mut(peer_id).and_then(Option::take) {
            Some(peer) => peer,
            None => return,
        };

        peer.cancel_tasks();

        if self.anonymous_by_address.get(&peer.address) == Some(&peer_id) {
            self.anonymous_by_address.remove(&peer.address);
        }
        if self.connected_by_address.get(&peer.address) == Some(&peer_id) {
            self.connected_by_address.remove(&peer.address);
        }
        if self.by_client_id.get(&peer.client_id) == Some(&peer_id) {
            self.by_client_id.remove(&peer.client_id);
        }

        self.connected.swap_remove(&peer_id);
        self.anonymous.swap_remove(&peer_id);
        self.disconnecting.swap_remove(&peer_id);

        self.free.push(peer_id);

        trace!(self.log, "peer released"; "peer" => peer_id);
    }

    /// Finds the anonymous peer for an address, or creates one. Before
    /// growing the table, an expired anonymous peer (by explicit
    /// `created_at` comparison) is repurposed for the new address.
    fn find_or_create_anonymous_peer(&mut self, address: SocketAddr, now: Instant) -> PeerId {
        if let Some(&peer_id) = self.anonymous_by_address.get(&address) {
            return peer_id;
        }

        let expiry = Duration::from_secs(ANONYMOUS_PEER_EXPIRY_SECS);
        let expired = self.anonymous.iter().copied().find(|&peer_id| {
            self.peer(peer_id)
                .map(|peer| now.duration_since(peer.created_at) > expiry)
                .unwrap_or(false)
        });

        if let Some(peer_id) = expired {
            let old_address = self.peer(peer_id).map(|peer| peer.address);
            if let Some(old_address) = old_address {
                if self.anonymous_by_address.get(&old_address) == Some(&peer_id) {
                    self.anonymous_by_address.remove(&old_address);
                }
            }

            if let Some(peer) = self.peer_mut(peer_id) {
                peer.cancel_tasks();
                *peer = Peer::new(address, now);
            }
            self.anonymous_by_address.insert(address, peer_id);
            return peer_id;
        }

        let peer_id = self.acquire_peer(address, now);
        self.anonymous_by_address.insert(address, peer_id);
        self.anonymous.insert(peer_id);
        peer_id
    }

    /* ---------------------------- Incoming ----------------------------- */

    fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let encrypted = !self.no_encrypt;

        let (header, header_len) = match decode_incoming(data, encrypted) {
            Ok(decoded) => decoded,
            Err(_) => {
                self.statistics.invalid_recv_bytes += data.len() as u64;
                return;
            }
        };

        match header.kind {
            PacketKind::Request => self.accept_request(from, data, header_len, now),
            PacketKind::Response => self.accept_response(from, &header, data, header_len, now),
            PacketKind::KeepAlive | PacketKind::Payload | PacketKind::Disconnect => {
                self.accept_session_packet(from, &header, data, header_len, now)
            }
            // Servers neither expect CHALLENGE nor DENIED
            PacketKind::Challenge | PacketKind::Denied => {
                self.statistics.invalid_recv_bytes += data.len() as u64;
            }
        }
    }

    fn accept_request(&mut self, from: SocketAddr, data: &[u8], header_len: usize, now: Instant) {
        // A connected address cannot restart the handshake
        if self.connected_by_address.contains_key(&from) {
            self.statistics.invalid_recv_bytes += data.len() as u64;
            return;
        }

        // Cheap protocol id comparison before any crypto work
        let body = &data[header_len..];
        let protocol_id = LittleEndian::read_u64(
            &body[REQUEST_PROTOCOL_ID_OFFSET..REQUEST_PROTOCOL_ID_OFFSET + 8],
        );
        if protocol_id != self.protocol_id {
            self.statistics.invalid_recv_bytes += data.len() as u64;
            return;
        }

        let peer_id = self.find_or_create_anonymous_peer(from, now);

        // One token decode in flight per anonymous peer
        let state = match self.peer(peer_id) {
            Some(peer) => peer.state,
            None => return,
        };
        if state == PeerState::Requesting {
            self.statistics.invalid_recv_bytes += data.len() as u64;
            return;
        }

        if let Some(peer) = self.peer_mut(peer_id) {
            peer.state = PeerState::Requesting;
        }

        let header = Header::new(PacketKind::Request, 0);
        self.submit_recv(peer_id, header, data, header_len, self.listen_crypto.clone(), now);
    }

    fn accept_response(
        &mut self,
        from: SocketAddr,
        header: &Header,
        data: &[u8],
        header_len: usize,
        now: Instant,
    ) {
        let peer_id = match self.anonymous_by_address.get(&from) {
            Some(&peer_id) => peer_id,
            None => {
                self.statistics.invalid_recv_bytes += data.len() as u64;
                return;
            }
        };

        let accept = match self.peer(peer_id) {
            Some(peer) => peer.state == PeerState::Challenging && !peer.processing_response,
            None => false,
        };
        if !accept {
            self.statistics.invalid_recv_bytes += data.len() as u64;
            return;
        }

        // The response envelope opens with the peer's packet keys; the
        // context installed at request time also carries the challenge key
        // for the embedded token.
        let crypto = match self.peer(peer_id) {
            Some(peer) => peer.crypto.clone(),
            None => return,
        };

        if let Some(peer) = self.peer_mut(peer_id) {
            peer.processing_response = true;
        }

        self.submit_recv(peer_id, *header, data, header_len, crypto, now);
    }

    fn accept_session_packet(
        &mut self,
        from: SocketAddr,
        header: &Header,
        data: &[u8],
        header_len: usize,
        now: Instant,
    ) {
        let peer_id = match self.connected_by_address.get(&from) {
            Some(&peer_id) => peer_id,
            None => {
                self.statistics.invalid_recv_bytes += data.len() as u64;
                return;
            }
        };

        let accept = match self.peer_mut(peer_id) {
            Some(peer) => {
                (peer.state == PeerState::Connected || peer.state == PeerState::Unconfirmed)
                    && peer.replay.accept(header.sequence)
            }
            None => false,
        };
        if !accept {
            self.statistics.invalid_recv_bytes += data.len() as u64;
            return;
        }

        let crypto = match self.peer(peer_id) {
            Some(peer) => peer.crypto.clone(),
            None => return,
        };

        self.submit_recv(peer_id, *header, data, header_len, crypto, now);
    }

    fn submit_recv(
        &mut self,
        peer_id: PeerId,
        header: Header,
        data: &[u8],
        header_len: usize,
        crypto: Arc<CryptoContext>,
        now: Instant,
    ) {
        let body = &data[header_len..];

        let mut frame = match self.context.acquire_frame() {
            Ok(frame) => frame,
            Err(_) => {
                self.statistics.invalid_recv_bytes += data.len() as u64;
                return;
            }
        };
        frame[..body.len()].copy_from_slice(body);

        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let mut job = RecvJob {
            job_id,
            peer: peer_id,
            header,
            frame,
            body_len: body.len(),
            wire_len: data.len(),
            crypto,
            no_decrypt: self.no_encrypt,
            recv_time: now,
            packet: None,
            result: Ok(()),
        };

        if RecvJob::worker_required(header.kind) {
            let handle = self.workers.submit(Job::Recv(job), Job::run);
            if let Some(peer) = self.peer_mut(peer_id) {
                peer.track_task(job_id, handle);
            }
        } else {
            job.process();
            self.complete_recv(job, false, now);
        }
    }

    fn complete_job(&mut self, finished: Finished<Job>, now: Instant) {
        match finished.data {
            Job::Send(job) => self.complete_send(job, finished.canceled),
            Job::Recv(job) => self.complete_recv(job, finished.canceled, now),
        }
    }

    fn complete_recv(&mut self, mut job: RecvJob, canceled: bool, now: Instant) {
        let peer_id = job.peer;
        let kind = job.header.kind;

        if let Some(peer) = self.peer_mut(peer_id) {
            peer.untrack_task(job.job_id);
            if kind == PacketKind::Response {
                peer.processing_response = false;
            }
        }

        if canceled || self.state != SocketState::Running {
            self.context.release_frame(job.frame);
            return;
        }

        if job.result.is_err() {
            self.statistics.invalid_recv_bytes += job.wire_len as u64;
            if kind == PacketKind::Request {
                // Token did not authenticate; the anonymous peer goes away
                let still_anonymous = self
                    .peer(peer_id)
                    .map(|peer| peer.state == PeerState::Requesting)
                    .unwrap_or(false);
                if still_anonymous {
                    self.release_peer(peer_id);
                }
            }
            self.context.release_frame(job.frame);
            return;
        }

        let packet = match job.packet.take() {
            Some(packet) => packet,
            None => {
                self.context.release_frame(job.frame);
                return;
            }
        };

        // Post-decode validation: keep-alives must echo the peer's id
        if let Packet::KeepAlive { client_id, .. } = &packet {
            let mismatch = self
                .peer(peer_id)
                .map(|peer| peer.state == PeerState::Connected && *client_id != peer.client_id)
                .unwrap_or(true);
            if mismatch {
                self.statistics.invalid_recv_bytes += job.wire_len as u64;
                self.context.release_frame(job.frame);
                return;
            }
        }

        self.statistics.valid_recv_bytes += job.wire_len as u64;
        if let Some(peer) = self.peer_mut(peer_id) {
            peer.last_recv_time = job.recv_time;
        }

        self.context.release_frame(job.frame);

        match packet {
            Packet::Request(request) => {
                if let RequestToken::Open(token) = request.token {
                    self.recv_request(peer_id, request.protocol_id, request.expire_timestamp, *token);
                }
            }
            Packet::Response(response) => {
                if let ChallengeData::Open(token) = response.data {
                    self.recv_response(peer_id, token, now);
                }
            }
            Packet::KeepAlive { .. } => self.recv_keep_alive(peer_id),
            Packet::Payload { data, .. } => self.recv_payload(peer_id, data),
            Packet::Disconnect { .. } => self.recv_disconnect(peer_id),
            _ => (),
        }
    }

    fn recv_request(
        &mut self,
        peer_id: PeerId,
        protocol_id: u64,
        expire_timestamp: u64,
        token: ConnectTokenPrivate,
    ) {
        let state = match self.peer(peer_id) {
            Some(peer) => peer.state,
            None => return,
        };
        if state != PeerState::Requesting {
            return;
        }

        // The token must still be alive and its client id free
        if expire_timestamp <= timestamp_secs() {
            debug!(self.log, "request with expired token"; "peer" => peer_id);
            self.release_peer(peer_id);
            return;
        }
        if self.by_client_id.contains_key(&token.client_id) {
            debug!(self.log, "request for connected client id";
                   "peer" => peer_id, "client_id" => token.client_id);
            self.release_peer(peer_id);
            return;
        }

        // Install the negotiated keys before anything is emitted; both the
        // DENIED and CHALLENGE replies travel under them
        let challenge_key = self.challenge_key;
        if let Some(peer) = self.peer_mut(peer_id) {
            peer.install_crypto(CryptoContext {
                protocol_id,
                encrypt_key: token.server_to_client_key,
                decrypt_key: token.client_to_server_key,
                private_key: [0u8; crypto::KEY_SIZE],
                challenge_key,
            });
            peer.client_id = token.client_id;
            peer.set_timeout_secs(token.timeout);
        }

        if self.connected.len() >= self.max_clients {
            debug!(self.log, "server full, denying"; "peer" => peer_id);
            let sequence = self.anonymous_sequence;
            self.anonymous_sequence += 1;
            self.dispatch_to(peer_id, Packet::Denied { sequence });
            // The peer is released when the denied send completes
            return;
        }

        let sequence = self.anonymous_sequence;
        self.anonymous_sequence += 1;
        let token_sequence = self.challenge_sequence;
        self.challenge_sequence += 1;

        debug!(self.log, "challenging"; "peer" => peer_id, "client_id" => token.client_id,
               "token_sequence" => token_sequence);

        self.dispatch_to(
            peer_id,
            Packet::Challenge(ChallengePacket {
                sequence,
                token_sequence,
                data: ChallengeData::Open(ChallengeToken {
                    client_id: token.client_id,
                    user_data: token.user_data,
                }),
            }),
        );

        if let Some(peer) = self.peer_mut(peer_id) {
            peer.state = PeerState::Challenging;
        }
    }

    fn recv_response(&mut self, peer_id: PeerId, token: ChallengeToken, _now: Instant) {
        let (state, address) = match self.peer(peer_id) {
            Some(peer) => (peer.state, peer.address),
            None => return,
        };
        if state != PeerState::Challenging {
            return;
        }

        if self.by_client_id.contains_key(&token.client_id) {
            // Already connected elsewhere; drop the response, keep the peer
            return;
        }

        // Promote: anonymous becomes unconfirmed-connected
        if self.anonymous_by_address.get(&address) == Some(&peer_id) {
            self.anonymous_by_address.remove(&address);
        }
        self.anonymous.swap_remove(&peer_id);

        self.connected_by_address.insert(address, peer_id);
        self.by_client_id.insert(token.client_id, peer_id);
        self.connected.insert(peer_id);

        if let Some(peer) = self.peer_mut(peer_id) {
            peer.state = PeerState::Unconfirmed;
            peer.client_id = token.client_id;
        }

        info!(self.log, "peer connected"; "peer" => peer_id, "client_id" => token.client_id);

        // The immediate keep-alive doubles as the promotion signal carrying
        // the assigned client id
        self.send_keep_alive(peer_id);
        self.events.push_back(ServerEvent::Connected(peer_id));
    }

    fn recv_keep_alive(&mut self, peer_id: PeerId) {
        if let Some(peer) = self.peer_mut(peer_id) {
            if peer.state == PeerState::Unconfirmed {
                peer.state = PeerState::Connected;
            }
        }
    }

    fn recv_payload(&mut self, peer_id: PeerId, data: Vec<u8>) {
        self.events.push_back(ServerEvent::Received(peer_id, data));
    }

    fn recv_disconnect(&mut self, peer_id: PeerId) {
        info!(self.log, "peer disconnected by remote"; "peer" => peer_id);
        if let Some(peer) = self.peer_mut(peer_id) {
            peer.state = PeerState::Disconnected;
        }
        self.events.push_back(ServerEvent::Disconnected(peer_id));
        self.release_peer(peer_id);
    }

    /* ---------------------------- Outgoing ----------------------------- */

    fn complete_send(&mut self, job: SendJob, canceled: bool) {
        let peer_id = job.peer;

        if let Some(peer) = self.peer_mut(peer_id) {
            peer.untrack_task(job.job_id);
        }

        if canceled || self.state != SocketState::Running || job.result.is_err() {
            self.context.release_frame(job.frame);
            return;
        }

        // The peer may have been released while the job was on a worker;
        // its address is re-resolved rather than trusted stale
        if let Some(address) = self.peer(peer_id).map(|peer| peer.address) {
            if let Err(error) = self.transport.send(Some(address), &job.frame[..job.frame_len]) {
                warn!(self.log, "send failed"; "peer" => peer_id, "error" => ?error);
            }
        }

        // A completed DENIED removes its anonymous peer
        if job.packet.kind() == PacketKind::Denied {
            let still_anonymous = self
                .peer(peer_id)
                .map(|peer| peer.state == PeerState::Requesting)
                .unwrap_or(false);
            if still_anonymous {
                self.release_peer(peer_id);
            }
        }

        self.context.release_frame(job.frame);
    }

    fn dispatch_to(&mut self, peer_id: PeerId, packet: Packet) {
        let crypto = match self.peer(peer_id) {
            Some(peer) => peer.crypto.clone(),
            None => return,
        };

        let frame = match self.context.acquire_frame() {
            Ok(frame) => frame,
            Err(_) => {
                trace!(self.log, "frame pool exhausted, dropping send"; "peer" => peer_id);
                return;
            }
        };

        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let kind = packet.kind();
        let mut job = SendJob::new(job_id, peer_id, packet, crypto, frame, self.no_encrypt);

        if SendJob::worker_required(kind) {
            let handle = self.workers.submit(Job::Send(job), Job::run);
            if let Some(peer) = self.peer_mut(peer_id) {
                peer.track_task(job_id, handle);
            }
        } else {
            job.process();
            self.complete_send(job, false);
        }
    }

    fn send_keep_alive(&mut self, peer_id: PeerId) {
        let (sequence, client_id) = match self.peer_mut(peer_id) {
            Some(peer) => (peer.next_sequence(), peer.client_id),
            None => return,
        };

        self.dispatch_to(
            peer_id,
            Packet::KeepAlive {
                sequence,
                client_id,
            },
        );
    }

    fn send_disconnect(&mut self, peer_id: PeerId) {
        let sequence = match self.peer_mut(peer_id) {
            Some(peer) => peer.next_sequence(),
            None => return,
        };

        self.dispatch_to(peer_id, Packet::Disconnect { sequence });
    }

    /* ----------------------------- Timers ------------------------------ */

    fn poll_timers(&mut self, now: Instant) {
        match self.keep_alive_timer.poll(now) {
            Tick::Trigger | Tick::FinalTrigger => self.broadcast_keep_alive(now),
            _ => (),
        }

        if self.state != SocketState::Running {
            return;
        }

        match self.expiry_timer.poll(now) {
            Tick::Trigger | Tick::FinalTrigger => self.expire_anonymous_peers(now),
            _ => (),
        }

        if self.state != SocketState::Running {
            return;
        }

        match self.disconnect_timer.poll(now) {
            Tick::Trigger | Tick::FinalTrigger => self.broadcast_disconnect(),
            _ => (),
        }
    }

    /// 10 Hz: keep every connected peer alive, and drop the ones that have
    /// gone silent past their token timeout.
    fn broadcast_keep_alive(&mut self, now: Instant) {
        let peers: Vec<PeerId> = self.connected.iter().copied().collect();

        for peer_id in peers {
            let timed_out = match self.peer(peer_id) {
                Some(peer) => peer.timed_out(now),
                None => continue,
            };

            if timed_out {
                info!(self.log, "peer timed out"; "peer" => peer_id);
                if let Some(peer) = self.peer_mut(peer_id) {
                    peer.state = PeerState::Disconnected;
                }
                self.events.push_back(ServerEvent::Disconnected(peer_id));
                self.release_peer(peer_id);
            } else {
                self.send_keep_alive(peer_id);
            }
        }
    }

    /// 1 Hz: anonymous peers older than the expiry window are reclaimed,
    /// judged strictly by their creation time.
    fn expire_anonymous_peers(&mut self, now: Instant) {
        let expiry = Duration::from_secs(ANONYMOUS_PEER_EXPIRY_SECS);
        let peers: Vec<PeerId> = self.anonymous.iter().copied().collect();

        for peer_id in peers {
            let expired = match self.peer(peer_id) {
                Some(peer) => now.duration_since(peer.created_at) > expiry,
                None => false,
            };

            if expired {
                debug!(self.log, "anonymous peer expired"; "peer" => peer_id);
                self.release_peer(peer_id);
            }
        }
    }

    /// 10 Hz while any peer is disconnecting: one DISCONNECT per peer per
    /// tick until its redundancy budget is spent, then release.
    fn broadcast_disconnect(&mut self) {
        let peers: Vec<PeerId> = self.disconnecting.iter().copied().collect();

        for peer_id in peers {
            self.send_disconnect(peer_id);

            let done = match self.peer_mut(peer_id) {
                Some(peer) => {
                    peer.disconnecting_remaining = peer.disconnecting_remaining.saturating_sub(1);
                    peer.disconnecting_remaining == 0
                }
                None => false,
            };

            if done {
                if let Some(peer) = self.peer_mut(peer_id) {
                    peer.state = PeerState::Disconnected;
                }
                self.release_peer(peer_id);
            }
        }

        if self.disconnecting.is_empty() {
            self.disconnect_timer.stop();
        }
    }

    /* ------------------------------ Tasks ------------------------------ */

    fn run_tasks(&mut self) {
        if !self.tasks.begin() {
            return;
        }
        while let Some(task) = self.tasks.next() {
            match task {
                ServerTask::Stop => self.stop_deferred(),
                ServerTask::DisconnectPeer(peer_id, now) => self.disconnect_peer_deferred(peer_id, now),
            }
        }
        self.tasks.finish();
    }

    fn disconnect_peer_deferred(&mut self, peer_id: PeerId, now: Instant) {
        let state = match self.peer(peer_id) {
            Some(peer) => peer.state,
            None => return,
        };
        if state != PeerState::Connected && state != PeerState::Unconfirmed {
            return;
        }

        info!(self.log, "disconnecting peer"; "peer" => peer_id);

        if let Some(peer) = self.peer_mut(peer_id) {
            peer.state = PeerState::Disconnecting;
            peer.disconnecting_remaining = DISCONNECT_REDUNDANT_LIMIT;
        }

        // No more keep-alives for this peer, but the address stays mapped so
        // stray traffic is recognized and dropped by state
        self.connected.swap_remove(&peer_id);
        self.disconnecting.insert(peer_id);
        self.events.push_back(ServerEvent::Disconnected(peer_id));

        if !self.disconnect_timer.is_running() {
            // Fires on the next update pass
            self.disconnect_timer.start(now);
        }
    }

    fn stop_deferred(&mut self) {
        if self.state == SocketState::Stopped {
            return;
        }

        debug!(self.log, "stopping server socket");
        self.state = SocketState::Stopped;

        self.keep_alive_timer.stop();
        self.expiry_timer.stop();
        self.disconnect_timer.stop();
        self.transport.stop();

        for peer_id in 0..self.peers.len() {
            if let Some(peer) = self.peer_mut(peer_id) {
                peer.state = PeerState::Disconnected;
            }
            self.release_peer(peer_id);
        }

        self.connected_by_address.clear();
        self.anonymous_by_address.clear();
        self.by_client_id.clear();
        self.connected.clear();
        self.anonymous.clear();
        self.disconnecting.clear();

        self.challenge_key = [0u8; crypto::KEY_SIZE];
        self.challenge_sequence = 0;
        self.anonymous_sequence = 0;
    }
}
