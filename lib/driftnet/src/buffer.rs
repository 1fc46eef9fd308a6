use crate::{MAC_BYTES, PACKET_HEADER_CAPACITY, PAYLOAD_BODY_CAPACITY};

/// Staging area for one outgoing or incoming packet. Sized for the largest
/// frame the protocol produces: a full payload body plus header and tag
/// comfortably covers the 1077-byte connection request as well.
pub const FRAME_CAPACITY: usize = PACKET_HEADER_CAPACITY + PAYLOAD_BODY_CAPACITY + MAC_BYTES;

pub type Frame = Vec<u8>;

/// Allocates a frame at full capacity. Pool factories use this so acquired
/// frames are always indexable across their whole range.
#[inline]
pub fn empty_frame() -> Frame {
    vec![0u8; FRAME_CAPACITY]
}

/// Restores a recycled (cleared) frame to full length before use.
#[inline]
pub fn reset_frame(frame: &mut Frame) {
    frame.resize(FRAME_CAPACITY, 0);
}
