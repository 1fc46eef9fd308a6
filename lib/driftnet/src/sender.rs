use crate::buffer::{reset_frame, Frame};
use crate::crypto::CryptoContext;
use crate::error::ProtocolResult;
use crate::packet::{Packet, PacketKind};
use crate::peer::PeerId;
use std::sync::Arc;

/// One packet moving through encode → seal → dispatch. The record owns its
/// staging frame and a strong reference to the crypto context, so it stays
/// valid on a worker even if its peer is released meanwhile.
pub struct SendJob {
    pub job_id: u64,
    pub peer: PeerId,
    pub packet: Packet,
    pub crypto: Arc<CryptoContext>,
    pub frame: Frame,
    pub frame_len: usize,
    pub no_encrypt: bool,
    pub result: ProtocolResult<()>,
}

impl SendJob {
    pub fn new(
        job_id: u64,
        peer: PeerId,
        packet: Packet,
        crypto: Arc<CryptoContext>,
        mut frame: Frame,
        no_encrypt: bool,
    ) -> SendJob {
        reset_frame(&mut frame);
        SendJob {
            job_id,
            peer,
            packet,
            crypto,
            frame,
            frame_len: 0,
            no_encrypt,
            result: Ok(()),
        }
    }

    /// Whether the process stage must run on the worker pool. Only CHALLENGE
    /// is expensive on the send side: the server seals a challenge token per
    /// packet.
    #[inline]
    pub fn worker_required(kind: PacketKind) -> bool {
        kind == PacketKind::Challenge
    }

    /// The process stage: header, body, then the AEAD envelope. Runs inline
    /// on the I/O thread for cheap kinds, on a worker for CHALLENGE.
    pub fn process(&mut self) {
        self.result = self.run();
    }

    fn run(&mut self) -> ProtocolResult<()> {
        let header = self.packet.header();
        let header_len = header.encode(&mut self.frame)?;

        let body = &mut self.frame[header_len..];
        let body_len = self.packet.encode_body(&self.crypto, body)?;

        let body_len = if self.no_encrypt {
            body_len
        } else {
            self.crypto.seal_body(body, body_len, &header)?
        };

        self.frame_len = header_len + body_len;
        Ok(())
    }
}
