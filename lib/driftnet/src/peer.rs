use crate::crypto::CryptoContext;
use crate::replay::ReplayProtector;
use crate::ClientId;
use brine::executor::TaskHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type PeerId = usize;

/// Connection state of one peer. Clients move through the left-hand subset,
/// server peers through the right-hand one; `Disconnected` is shared.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerState {
    Disconnected,

    // Client side
    Request,
    Response,
    Connected,
    Disconnecting,
    Denied,
    RequestTimedOut,
    ResponseTimedOut,
    TimedOut,
    InvalidToken,
    TokenExpired,

    // Server side
    Requesting,
    Challenging,
    Unconfirmed,
}

/// One side of a connection as seen from this host. Owned exclusively by
/// its socket; worker jobs reference it only by id plus a strong reference
/// to its crypto context.
pub struct Peer {
    pub address: SocketAddr,
    pub client_id: ClientId,
    pub state: PeerState,
    pub crypto: Arc<CryptoContext>,
    pub replay: ReplayProtector,
    pub last_recv_time: Instant,
    pub created_at: Instant,
    /// Idle timeout from the connect token; `None` when the token disables
    /// it.
    pub timeout: Option<Duration>,
    /// Worker jobs in flight for this peer, in submission order. Canceled
    /// wholesale when the peer is released.
    pub tasks: Vec<(u64, TaskHandle)>,
    /// At most one RESPONSE decode may be in flight per peer.
    pub processing_response: bool,
    /// Redundant DISCONNECT packets still to emit while `Disconnecting`.
    pub disconnecting_remaining: u32,
    sequence: u64,
}

impl Peer {
    pub fn new(address: SocketAddr, now: Instant) -> Peer {
        Peer {
            address,
            client_id: 0,
            state: PeerState::Disconnected,
            crypto: Arc::new(CryptoContext::empty()),
            replay: ReplayProtector::new(),
            last_recv_time: now,
            created_at: now,
            timeout: None,
            tasks: Vec::new(),
            processing_response: false,
            disconnecting_remaining: 0,
            sequence: 0,
        }
    }

    /// The next outbound sequence number. Strictly increasing per peer and
    /// never reused within a connection; doubling as the AEAD nonce makes
    /// reuse a key-compromise, so there is deliberately no reset.
    #[inline]
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    /// Installs freshly negotiated key material. In-flight jobs keep the
    /// context they grabbed at submission; new ones see this.
    #[inline]
    pub fn install_crypto(&mut self, crypto: CryptoContext) {
        self.crypto = Arc::new(crypto);
    }

    /// Applies the connect-token timeout field: positive seconds arm the
    /// idle timeout, zero or negative disable it.
    #[inline]
    pub fn set_timeout_secs(&mut self, timeout: i32) {
        self.timeout = if timeout > 0 {
            Some(Duration::from_secs(timeout as u64))
        } else {
            None
        };
    }

    /// True once the peer has been silent longer than its timeout allows.
    #[inline]
    pub fn timed_out(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.duration_since(self.last_recv_time) > timeout,
            None => false,
        }
    }

    /// Records a worker job so it can be canceled if the peer goes away.
    #[inline]
    pub fn track_task(&mut self, job_id: u64, handle: TaskHandle) {
        self.tasks.push((job_id, handle));
    }

    /// Forgets a finished job.
    #[inline]
    pub fn untrack_task(&mut self, job_id: u64) {
        self.tasks.retain(|(id, _)| *id != job_id);
    }

    /// Cancels every in-flight job. Jobs already running finish on their
    /// worker; their completion steps observe the flag and discard.
    pub fn cancel_tasks(&mut self) {
        for (_, handle) in self.tasks.drain(..) {
            handle.cancel();
        }
    }
}
