use crate::buffer::FRAME_CAPACITY;
use crate::context::Context;
use crate::crypto::CryptoContext;
use crate::emitter::{Emitter, Tick};
use crate::error::{ProtocolError, ProtocolResult};
use crate::job::{Job, JobPool};
use crate::packet::{ChallengeData, ChallengePacket, Packet, PacketKind, RequestPacket, RequestToken};
use crate::peer::{Peer, PeerState};
use crate::receiver::RecvJob;
use crate::sender::SendJob;
use crate::socket::{decode_incoming, ConnectResult, SocketState, Statistics};
use crate::token::{decode_connect_token_public, ConnectToken, CONNECT_TOKEN_PRIVATE_OFFSET};
use crate::transport::Transport;
use crate::{
    ClientId, CHALLENGE_TOKEN_BYTES, CONNECT_TOKEN_BYTES, CONNECT_TOKEN_PRIVATE_BYTES,
    DISCONNECT_FREQUENCY_HZ, DISCONNECT_REDUNDANT_LIMIT, HANDSHAKE_FREQUENCY_HZ,
    KEEP_ALIVE_FREQUENCY_HZ,
};
use brine::executor::Finished;
use brine::logging::{self, debug, info, trace, warn, Logger};
use brine::sequencer::Sequencer;
use brine::time::timestamp_secs;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Connectivity and payload notifications for the delivery layer, drained
/// after each `update` in the order their triggering events were accepted.
#[derive(Debug)]
pub enum ClientEvent {
    ConnectResult(ConnectResult),
    Connected { client_id: ClientId },
    Disconnected,
    Received(Vec<u8>),
}

enum ClientTask {
    Stop,
}

/// The client half of the protocol: walks the connect token's address list,
/// performs the request/challenge/response handshake, then keeps the
/// session alive until either side disconnects.
pub struct Client<T: Transport> {
    log: Logger,
    context: Context,
    transport: T,
    workers: JobPool,
    state: SocketState,
    statistics: Statistics,
    events: VecDeque<ClientEvent>,
    tasks: Sequencer<ClientTask>,

    token_data: Box<[u8; CONNECT_TOKEN_BYTES]>,
    token: Option<ConnectToken>,
    address_index: usize,

    peer: Option<Peer>,

    challenge_sequence: u64,
    challenge_data: Box<[u8; CHALLENGE_TOKEN_BYTES]>,

    request_emitter: Emitter,
    response_emitter: Emitter,
    keep_alive_emitter: Emitter,
    disconnect_emitter: Emitter,

    next_job_id: u64,
    no_encrypt: bool,
}

impl<T: Transport> Client<T> {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        context: Context,
        transport: T,
        connect_token: Box<[u8; CONNECT_TOKEN_BYTES]>,
        log: L,
    ) -> ProtocolResult<Client<T>> {
        let capability = transport.capability();
        if !capability.client {
            return Err(ProtocolError::WrongState);
        }

        let workers = JobPool::new(context.worker_threads());

        Ok(Client {
            log: logging::child(log),
            context,
            transport,
            workers,
            state: SocketState::Stopped,
            statistics: Statistics::default(),
            events: VecDeque::new(),
            tasks: Sequencer::new(),
            token_data: connect_token,
            token: None,
            address_index: 0,
            peer: None,
            challenge_sequence: 0,
            challenge_data: Box::new([0u8; CHALLENGE_TOKEN_BYTES]),
            request_emitter: Emitter::new(HANDSHAKE_FREQUENCY_HZ),
            response_emitter: Emitter::new(HANDSHAKE_FREQUENCY_HZ),
            keep_alive_emitter: Emitter::new(KEEP_ALIVE_FREQUENCY_HZ),
            disconnect_emitter: Emitter::new(DISCONNECT_FREQUENCY_HZ)
                .with_limit(DISCONNECT_REDUNDANT_LIMIT),
            next_job_id: 0,
            no_encrypt: capability.encryption,
        })
    }

    /// Starts connecting to the token's first server address. Token
    /// validation failures are terminal and reported without emitting a
    /// single packet.
    pub fn connect(&mut self, now: Instant) -> ProtocolResult<()> {
        if self.state != SocketState::Stopped {
            return Err(ProtocolError::WrongState);
        }

        let token = match decode_connect_token_public(&self.token_data[..]) {
            Ok(token) => token,
            Err(error) => {
                warn!(self.log, "connect token rejected"; "error" => ?error);
                let mut peer = Peer::new("0.0.0.0:0".parse().expect("Wildcard address"), now);
                peer.state = PeerState::InvalidToken;
                self.peer = Some(peer);
                return Err(ProtocolError::TokenInvalid);
            }
        };

        if token.expire_timestamp < timestamp_secs() {
            info!(self.log, "connect token expired"; "expire" => token.expire_timestamp);
            let mut peer = Peer::new(token.addresses[0], now);
            peer.state = PeerState::TokenExpired;
            self.peer = Some(peer);
            return Err(ProtocolError::TokenExpired);
        }

        let mut peer = Peer::new(token.addresses[0], now);
        peer.install_crypto(CryptoContext {
            protocol_id: token.protocol_id,
            encrypt_key: token.client_to_server_key,
            decrypt_key: token.server_to_client_key,
            private_key: [0u8; brine::crypto::KEY_SIZE],
            challenge_key: [0u8; brine::crypto::KEY_SIZE],
        });
        peer.set_timeout_secs(token.timeout);
        self.peer = Some(peer);

        self.address_index = 0;
        self.token = Some(token);
        self.state = SocketState::Running;

        if let Err(error) = self.connect_current_address(now) {
            self.state = SocketState::Stopped;
            self.transport.stop();
            self.peer = None;
            return Err(error);
        }
        Ok(())
    }

    fn connect_current_address(&mut self, now: Instant) -> ProtocolResult<()> {
        let token = self.token.as_ref().expect("Token decoded before connect");
        let address = token.addresses[self.address_index];
        let deadline = if token.timeout > 0 {
            Some(Duration::from_secs(token.timeout as u64))
        } else {
            None
        };

        info!(self.log, "connecting"; "address" => %address, "attempt" => self.address_index);

        if let Some(peer) = self.peer.as_mut() {
            peer.address = address;
            peer.state = PeerState::Request;
            peer.replay.reset();
            peer.last_recv_time = now;
        }

        self.transport.connect(address)?;
        self.request_emitter.start_with_deadline(now, deadline);
        Ok(())
    }

    /// The pump. Drains the transport, folds finished worker jobs back in,
    /// polls the emitters and services deferred tasks. All state
    /// transitions happen inside this call (or inside API calls made on the
    /// same thread).
    pub fn update(&mut self, now: Instant) {
        // Finished jobs are drained even when stopped so their frames are
        // reclaimed
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

        self.poll_emitters(now);
        self.run_tasks();
    }

    /// Queues application payload for the connected server.
    pub fn send(&mut self, views: &[&[u8]]) -> ProtocolResult<()> {
        if self.state != SocketState::Running {
            return Err(ProtocolError::WrongState);
        }

        let peer = self.peer.as_mut().ok_or(ProtocolError::WrongState)?;
        if peer.state != PeerState::Connected {
            return Err(ProtocolError::WrongState);
        }

        let length: usize = views.iter().map(|view| view.len()).sum();
        if length == 0 {
            return Ok(());
        }
        if length > self.context.payload_capacity() {
            return Err(ProtocolError::BufferTooSmall);
        }

        let mut data = Vec::with_capacity(length);
        for view in views {
            data.extend_from_slice(view);
        }

        let sequence = peer.next_sequence();
        self.dispatch(Packet::Payload { sequence, data });
        Ok(())
    }

    /// Application-requested disconnect: notify immediately, then emit the
    /// redundant DISCONNECT volley before stopping.
    pub fn disconnect(&mut self, now: Instant) {
        if self.state != SocketState::Running {
            return;
        }

        let connected = self
            .peer
            .as_ref()
            .map(|peer| peer.state == PeerState::Connected)
            .unwrap_or(false);

        if !connected {
            self.request_stop();
            return;
        }

        info!(self.log, "disconnecting");
        self.keep_alive_emitter.stop();
        if let Some(peer) = self.peer.as_mut() {
            peer.state = PeerState::Disconnecting;
        }
        self.events.push_back(ClientEvent::Disconnected);
        self.disconnect_emitter.start(now);
    }

    /// Drains the events accumulated since the last call.
    pub fn events(&mut self) -> impl Iterator<Item = ClientEvent> + '_ {
        self.events.drain(..)
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn peer_state(&self) -> Option<PeerState> {
        self.peer.as_ref().map(|peer| peer.state)
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.peer.as_ref().map(|peer| peer.client_id)
    }

    /* ---------------------------- Incoming ----------------------------- */

    fn handle_datagram(&mut self, from: SocketAddr, data: &[u8], now: Instant) {
        let encrypted = !self.no_encrypt;

        let peer = match self.peer.as_mut() {
            Some(peer) => peer,
            None => return,
        };

        // Only the currently connected server address is listened to
        if from != peer.address {
            return;
        }

        let (header, header_len) = match decode_incoming(data, encrypted) {
            Ok(decoded) => decoded,
            Err(_) => {
                self.statistics.invalid_recv_bytes += data.len() as u64;
                return;
            }
        };

        // Packet-kind legality in the current state, and replay protection
        // for the kinds subject to it
        let acceptable = match header.kind {
            PacketKind::Denied => {
                peer.state == PeerState::Request || peer.state == PeerState::Response
            }
            PacketKind::Challenge => {
                peer.state == PeerState::Request && peer.replay.accept(header.sequence)
            }
            PacketKind::KeepAlive => {
                (peer.state == PeerState::Response || peer.state == PeerState::Connected)
                    && peer.replay.accept(header.sequence)
            }
            PacketKind::Payload | PacketKind::Disconnect => {
                peer.state == PeerState::Connected && peer.replay.accept(header.sequence)
            }
            // REQUEST and RESPONSE never arrive at a client
            PacketKind::Request | PacketKind::Response => false,
        };

        if !acceptable {
            self.statistics.invalid_recv_bytes += data.len() as u64;
            return;
        }

        let crypto = peer.crypto.clone();
        let body = &data[header_len..];

        let mut frame = match self.context.acquire_frame() {
            Ok(frame) => frame,
            Err(_) => {
                // Pool exhausted; the packet is dropped
                self.statistics.invalid_recv_bytes += data.len() as u64;
                return;
            }
        };
        frame[..body.len()].copy_from_slice(body);

        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let mut job = RecvJob {
            job_id,
            peer: 0,
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
            if let Some(peer) = self.peer.as_mut() {
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
        if let Some(peer) = self.peer.as_mut() {
            peer.untrack_task(job.job_id);
        }

        if canceled || self.state != SocketState::Running {
            self.context.release_frame(job.frame);
            return;
        }

        if job.result.is_err() {
            self.statistics.invalid_recv_bytes += job.wire_len as u64;
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

        // Post-decode validation: a keep-alive for a connected peer must
        // carry the server-assigned client id
        if let Packet::KeepAlive { client_id, .. } = &packet {
            let mismatch = self
                .peer
                .as_ref()
                .map(|peer| peer.state == PeerState::Connected && *client_id != peer.client_id)
                .unwrap_or(true);
            if mismatch {
                self.statistics.invalid_recv_bytes += job.wire_len as u64;
                self.context.release_frame(job.frame);
                return;
            }
        }

        self.statistics.valid_recv_bytes += job.wire_len as u64;
        if let Some(peer) = self.peer.as_mut() {
            peer.last_recv_time = job.recv_time;
        }

        self.context.release_frame(job.frame);

        match packet {
            Packet::Denied { .. } => self.recv_denied(now),
            Packet::Challenge(challenge) => self.recv_challenge(challenge, now),
            Packet::KeepAlive { client_id, .. } => self.recv_keep_alive(client_id, now),
            Packet::Payload { data, .. } => self.recv_payload(data),
            Packet::Disconnect { .. } => self.recv_disconnect(),
            _ => (),
        }
    }

    fn recv_denied(&mut self, now: Instant) {
        debug!(self.log, "connection denied"; "attempt" => self.address_index);

        self.request_emitter.stop();
        self.response_emitter.stop();
        if let Some(peer) = self.peer.as_mut() {
            peer.state = PeerState::Denied;
        }

        self.try_next_address(now, ConnectResult::Denied);
    }

    fn recv_challenge(&mut self, challenge: ChallengePacket, now: Instant) {
        let peer = match self.peer.as_mut() {
            Some(peer) => peer,
            None => return,
        };
        if peer.state != PeerState::Request {
            return;
        }

        let sealed = match challenge.data {
            ChallengeData::Sealed(sealed) => sealed,
            ChallengeData::Open(_) => return,
        };

        debug!(self.log, "challenge received"; "token_sequence" => challenge.token_sequence);

        self.challenge_sequence = challenge.token_sequence;
        self.challenge_data.copy_from_slice(&sealed[..]);

        peer.state = PeerState::Response;
        // Challenges are numbered from the server-wide handshake counter,
        // session packets from the per-peer one; the window restarts on the
        // boundary between the two sequence spaces
        peer.replay.reset();
        self.request_emitter.stop();

        let deadline = self.token.as_ref().and_then(|token| {
            if token.timeout > 0 {
                Some(Duration::from_secs(token.timeout as u64))
            } else {
                None
            }
        });
        self.response_emitter.start_with_deadline(now, deadline);
    }

    fn recv_keep_alive(&mut self, client_id: ClientId, now: Instant) {
        let peer = match self.peer.as_mut() {
            Some(peer) => peer,
            None => return,
        };

        if peer.state != PeerState::Response {
            return; // Already connected; timing was refreshed above
        }

        peer.state = PeerState::Connected;
        peer.client_id = client_id;

        info!(self.log, "connected"; "client_id" => client_id);

        self.response_emitter.stop();
        self.keep_alive_emitter.start(now);

        self.events
            .push_back(ClientEvent::ConnectResult(ConnectResult::Success));
        self.events.push_back(ClientEvent::Connected { client_id });
    }

    fn recv_payload(&mut self, data: Vec<u8>) {
        self.events.push_back(ClientEvent::Received(data));
    }

    fn recv_disconnect(&mut self) {
        let peer = match self.peer.as_mut() {
            Some(peer) => peer,
            None => return,
        };
        if peer.state != PeerState::Connected {
            return;
        }

        info!(self.log, "server disconnected us");
        peer.state = PeerState::Disconnected;
        self.events.push_back(ClientEvent::Disconnected);
        self.request_stop();
    }

    /* ---------------------------- Outgoing ----------------------------- */

    fn complete_send(&mut self, job: SendJob, canceled: bool) {
        if let Some(peer) = self.peer.as_mut() {
            peer.untrack_task(job.job_id);
        }

        if canceled || self.state != SocketState::Running || job.result.is_err() {
            self.context.release_frame(job.frame);
            return;
        }

        if let Err(error) = self.transport.send(None, &job.frame[..job.frame_len]) {
            warn!(self.log, "send failed"; "error" => ?error);
        }

        self.context.release_frame(job.frame);
    }

    fn dispatch(&mut self, packet: Packet) {
        let crypto = match self.peer.as_ref() {
            Some(peer) => peer.crypto.clone(),
            None => return,
        };

        let frame = match self.context.acquire_frame() {
            Ok(frame) => frame,
            Err(_) => {
                trace!(self.log, "frame pool exhausted, dropping send");
                return;
            }
        };

        let job_id = self.next_job_id;
        self.next_job_id += 1;

        let kind = packet.kind();
        let mut job = SendJob::new(job_id, 0, packet, crypto, frame, self.no_encrypt);

        if SendJob::worker_required(kind) {
            let handle = self.workers.submit(Job::Send(job), Job::run);
            if let Some(peer) = self.peer.as_mut() {
                peer.track_task(job_id, handle);
            }
        } else {
            job.process();
            self.complete_send(job, false);
        }
    }

    fn send_request(&mut self) {
        let token = match self.token.as_ref() {
            Some(token) => token,
            None => return,
        };

        let mut sealed = Box::new([0u8; CONNECT_TOKEN_PRIVATE_BYTES]);
        sealed.copy_from_slice(
            &self.token_data
                [CONNECT_TOKEN_PRIVATE_OFFSET..CONNECT_TOKEN_PRIVATE_OFFSET + CONNECT_TOKEN_PRIVATE_BYTES],
        );

        let packet = Packet::Request(RequestPacket {
            protocol_id: token.protocol_id,
            expire_timestamp: token.expire_timestamp,
            nonce: token.nonce,
            token: RequestToken::Sealed(sealed),
        });
        self.dispatch(packet);
    }

    fn send_response(&mut self) {
        let sequence = match self.peer.as_mut() {
            Some(peer) => peer.next_sequence(),
            None => return,
        };

        let packet = Packet::Response(ChallengePacket {
            sequence,
            token_sequence: self.challenge_sequence,
            data: ChallengeData::Sealed(self.challenge_data.clone()),
        });
        self.dispatch(packet);
    }

    fn send_keep_alive(&mut self) {
        let (sequence, client_id) = match self.peer.as_mut() {
            Some(peer) => (peer.next_sequence(), peer.client_id),
            None => return,
        };

        self.dispatch(Packet::KeepAlive {
            sequence,
            client_id,
        });
    }

    fn send_disconnect(&mut self) {
        let sequence = match self.peer.as_mut() {
            Some(peer) => peer.next_sequence(),
            None => return,
        };

        self.dispatch(Packet::Disconnect { sequence });
    }

    /* ----------------------------- Timers ------------------------------ */

    fn poll_emitters(&mut self, now: Instant) {
        match self.request_emitter.poll(now) {
            Tick::Trigger | Tick::FinalTrigger => self.send_request(),
            Tick::Timeout => self.handle_handshake_timeout(now),
            Tick::Idle => (),
        }

        if self.state != SocketState::Running {
            return;
        }

        match self.response_emitter.poll(now) {
            Tick::Trigger | Tick::FinalTrigger => self.send_response(),
            Tick::Timeout => self.handle_handshake_timeout(now),
            Tick::Idle => (),
        }

        if self.state != SocketState::Running {
            return;
        }

        match self.keep_alive_emitter.poll(now) {
            Tick::Trigger | Tick::FinalTrigger => {
                let timed_out = self
                    .peer
                    .as_ref()
                    .map(|peer| peer.timed_out(now))
                    .unwrap_or(false);

                if timed_out {
                    info!(self.log, "connection timed out");
                    self.keep_alive_emitter.stop();
                    if let Some(peer) = self.peer.as_mut() {
                        peer.state = PeerState::TimedOut;
                    }
                    self.events.push_back(ClientEvent::Disconnected);
                    self.request_stop();
                } else {
                    self.send_keep_alive();
                }
            }
            Tick::Timeout | Tick::Idle => (),
        }

        if self.state != SocketState::Running {
            return;
        }

        match self.disconnect_emitter.poll(now) {
            Tick::Trigger => self.send_disconnect(),
            Tick::FinalTrigger => {
                self.send_disconnect();
                self.request_stop();
            }
            Tick::Timeout | Tick::Idle => (),
        }
    }

    fn handle_handshake_timeout(&mut self, now: Instant) {
        debug!(self.log, "handshake attempt timed out"; "attempt" => self.address_index);

        self.request_emitter.stop();
        self.response_emitter.stop();

        if let Some(peer) = self.peer.as_mut() {
            peer.state = match peer.state {
                PeerState::Request => PeerState::RequestTimedOut,
                PeerState::Response => PeerState::ResponseTimedOut,
                state => state,
            };
        }

        self.try_next_address(now, ConnectResult::TimedOut);
    }

    /// Walks to the next address in the token, or surfaces the terminal
    /// connect result when the list is exhausted.
    fn try_next_address(&mut self, now: Instant, terminal: ConnectResult) {
        let exhausted = match self.token.as_ref() {
            Some(token) => self.address_index + 1 >= token.addresses.len(),
            None => true,
        };

        if exhausted {
            self.events.push_back(ClientEvent::ConnectResult(terminal));
            self.request_stop();
            return;
        }

        self.address_index += 1;
        self.transport.stop();
        if let Some(peer) = self.peer.as_mut() {
            peer.cancel_tasks();
        }

        if let Err(error) = self.connect_current_address(now) {
            warn!(self.log, "reconnect failed"; "error" => ?error);
            self.events.push_back(ClientEvent::ConnectResult(terminal));
            self.request_stop();
        }
    }

    /* ------------------------------ Stop ------------------------------- */

    fn request_stop(&mut self) {
        if self.state == SocketState::Stopped {
            return;
        }
        self.state = SocketState::Stopping;
        self.tasks.push(ClientTask::Stop);
    }

    fn run_tasks(&mut self) {
        if !self.tasks.begin() {
            return;
        }
        while let Some(task) = self.tasks.next() {
            match task {
                ClientTask::Stop => self.stop_deferred(),
            }
        }
        self.tasks.finish();
    }

    fn stop_deferred(&mut self) {
        if self.state == SocketState::Stopped {
            return;
        }

        debug!(self.log, "stopping client socket");
        self.state = SocketState::Stopped;

        self.request_emitter.stop();
        self.response_emitter.stop();
        self.keep_alive_emitter.stop();
        self.disconnect_emitter.stop();
        self.transport.stop();

        // Release is idempotent by construction: the peer is simply taken
        if let Some(mut peer) = self.peer.take() {
            peer.cancel_tasks();
        }
    }
}
