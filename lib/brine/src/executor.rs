use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryIter};
use std::sync::{Arc, Mutex};
use std::thread;

/// A job record that finished on a worker thread, handed back to the
/// submitting thread. `canceled` is set when the job was canceled before or
/// while it ran; the completion step must discard results in that case.
pub struct Finished<T> {
    pub data: T,
    pub canceled: bool,
}

struct Task<T> {
    data: T,
    entry: fn(&mut T),
    cancel: Arc<AtomicBool>,
}

/// Cancellation handle for a submitted job. Workers cannot be preempted:
/// canceling a job that has already started lets it finish, and the
/// completion step observes the flag instead.
#[derive(Clone)]
pub struct TaskHandle {
    cancel: Arc<AtomicBool>,
}

impl TaskHandle {
    #[inline]
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// A bounded pool of worker threads for CPU-heavy jobs. Jobs move to a
/// worker by value, run there, and come back through a completion channel
/// that the owning thread drains; completion logic therefore always runs on
/// the submitting side, never on a worker.
pub struct Workers<T: Send + 'static> {
    injector: Option<Sender<Task<T>>>,
    done_rx: Receiver<Finished<T>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> Workers<T> {
    pub fn new(thread_count: usize) -> Workers<T> {
        assert!(thread_count > 0, "Worker pool requires at least one thread");

        let (task_tx, task_rx) = channel::<Task<T>>();
        let (done_tx, done_rx) = channel::<Finished<T>>();
        let task_rx = Arc::new(Mutex::new(task_rx));

        let threads = (0..thread_count)
            .map(|index| {
                let task_rx = task_rx.clone();
                let done_tx = done_tx.clone();
                thread::Builder::new()
                    .name(format!("worker-{}", index))
                    .spawn(move || Self::run_worker(task_rx, done_tx))
                    .expect("Failed to spawn worker thread")
            })
            .collect();

        Workers {
            injector: Some(task_tx),
            done_rx,
            threads,
        }
    }

    fn run_worker(task_rx: Arc<Mutex<Receiver<Task<T>>>>, done_tx: Sender<Finished<T>>) {
        loop {
            let task = {
                let guard = task_rx.lock().expect("Worker queue lock poisoned");
                guard.recv()
            };

            let mut task = match task {
                Ok(task) => task,
                Err(_) => return, // Injector dropped, pool is shutting down
            };

            let started = !task.cancel.load(Ordering::Acquire);
            if started {
                (task.entry)(&mut task.data);
            }

            let finished = Finished {
                data: task.data,
                canceled: !started || task.cancel.load(Ordering::Acquire),
            };

            if done_tx.send(finished).is_err() {
                return; // Receiver dropped, nothing left to report to
            }
        }
    }

    /// Submits a job. `entry` runs on a worker thread with exclusive access
    /// to the data; the record comes back through [`Workers::drain`].
    pub fn submit(&self, data: T, entry: fn(&mut T)) -> TaskHandle {
        let cancel = Arc::new(AtomicBool::new(false));
        let task = Task {
            data,
            entry,
            cancel: cancel.clone(),
        };

        self.injector
            .as_ref()
            .expect("Worker pool already shut down")
            .send(task)
            .expect("Worker pool threads are gone");

        TaskHandle { cancel }
    }

    /// Drains every job that has finished since the last call, without
    /// blocking.
    #[inline]
    pub fn drain(&mut self) -> TryIter<'_, Finished<T>> {
        self.done_rx.try_iter()
    }
}

impl<T: Send + 'static> Drop for Workers<T> {
    fn drop(&mut self) {
        self.injector.take();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
