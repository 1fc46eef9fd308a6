use crate::buffer::Frame;
use crate::crypto::CryptoContext;
use crate::error::ProtocolResult;
use crate::packet::{Header, Packet, PacketKind};
use crate::peer::PeerId;
use std::sync::Arc;
use std::time::Instant;

/// One datagram body moving through open → decode. Owns a copy of the body
/// bytes in a pooled frame and a strong reference to the crypto context it
/// was validated against.
pub struct RecvJob {
    pub job_id: u64,
    pub peer: PeerId,
    pub header: Header,
    pub frame: Frame,
    pub body_len: usize,
    /// Full datagram length, for the byte counters.
    pub wire_len: usize,
    pub crypto: Arc<CryptoContext>,
    pub no_decrypt: bool,
    pub recv_time: Instant,
    pub packet: Option<Packet>,
    pub result: ProtocolResult<()>,
}

impl RecvJob {
    /// Whether the process stage must run on the worker pool. REQUEST,
    /// CHALLENGE and RESPONSE all involve token crypto.
    #[inline]
    pub fn worker_required(kind: PacketKind) -> bool {
        matches!(
            kind,
            PacketKind::Request | PacketKind::Challenge | PacketKind::Response
        )
    }

    /// The process stage: open the AEAD envelope in place, then decode the
    /// body into a packet.
    pub fn process(&mut self) {
        self.result = self.run();
    }

    fn run(&mut self) -> ProtocolResult<()> {
        let plain_len = if self.no_decrypt {
            self.body_len
        } else {
            self.crypto
                .open_body(&mut self.frame, self.body_len, &self.header)?
        };

        let packet = Packet::decode_body(&self.header, &self.crypto, &self.frame[..plain_len])?;
        self.packet = Some(packet);
        Ok(())
    }
}
