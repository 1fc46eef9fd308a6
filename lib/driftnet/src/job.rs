use crate::receiver::RecvJob;
use crate::sender::SendJob;
use brine::executor::Workers;

/// The unit of work submitted to the worker pool: either a sender or a
/// receiver in its process stage.
pub enum Job {
    Send(SendJob),
    Recv(RecvJob),
}

/// The worker pool carrying protocol jobs.
pub type JobPool = Workers<Job>;

impl Job {
    /// Entry point executed on a worker thread.
    pub fn run(job: &mut Job) {
        match job {
            Job::Send(send) => send.process(),
            Job::Recv(recv) => recv.process(),
        }
    }
}
