use crate::buffer::{empty_frame, reset_frame, Frame};
use crate::error::{ProtocolError, ProtocolResult};
use crate::PAYLOAD_BODY_CAPACITY;
use brine::pool::Pool;

const DEFAULT_WORKER_THREADS: usize = 2;

/// Shared resources behind every socket: the frame pool and the sizing
/// knobs. Created by the application and cloned into each socket; the
/// application instance must outlive the sockets it spawned.
#[derive(Clone)]
pub struct Context {
    frames: Pool<Frame>,
    payload_capacity: usize,
    worker_threads: usize,
}

impl Context {
    pub fn new() -> Context {
        Context {
            frames: Pool::new(empty_frame),
            payload_capacity: PAYLOAD_BODY_CAPACITY,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }

    /// Bounds the total number of frames in circulation. Once exhausted,
    /// packet operations fail with `OutOfMemory` and are dropped instead of
    /// allocating further.
    pub fn with_frame_limit(limit: usize) -> Context {
        Context {
            frames: Pool::bounded(limit, empty_frame),
            payload_capacity: PAYLOAD_BODY_CAPACITY,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub fn set_worker_threads(&mut self, threads: usize) {
        assert!(threads > 0, "At least one worker thread is required");
        self.worker_threads = threads;
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity
    }

    pub fn acquire_frame(&self) -> ProtocolResult<Frame> {
        match self.frames.acquire() {
            Some(mut frame) => {
                reset_frame(&mut frame);
                Ok(frame)
            }
            None => Err(ProtocolError::OutOfMemory),
        }
    }

    pub fn release_frame(&self, frame: Frame) {
        self.frames.release(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FRAME_CAPACITY;

    #[test]
    fn test_acquired_frames_are_full_length() {
        let context = Context::new();
        let frame = context.acquire_frame().unwrap();
        assert_eq!(frame.len(), FRAME_CAPACITY);

        context.release_frame(frame);
        let frame = context.acquire_frame().unwrap();
        assert_eq!(frame.len(), FRAME_CAPACITY);
    }

    #[test]
    fn test_frame_limit_maps_to_out_of_memory() {
        let context = Context::with_frame_limit(1);
        let frame = context.acquire_frame().unwrap();
        assert_eq!(
            context.acquire_frame().unwrap_err(),
            ProtocolError::OutOfMemory
        );

        context.release_frame(frame);
        assert!(context.acquire_frame().is_ok());
    }
}
