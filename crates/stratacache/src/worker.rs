//! Background worker for the asynchronous facade API
//!
//! One thread drains a job queue; async facade methods enqueue their work
//! here and invoke the completion callback from this thread.

use std::sync::mpsc::{channel, Sender};
use std::thread::{self, JoinHandle};

use tracing::warn;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Worker {
    jobs: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new() -> Self {
        let (jobs, rx) = channel::<Job>();
        let handle = thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                job();
            }
        });
        Self {
            jobs: Some(jobs),
            handle: Some(handle),
        }
    }

    pub fn submit(&self, job: Job) {
        if let Some(jobs) = &self.jobs {
            if jobs.send(job).is_err() {
                warn!("facade worker unavailable; dropping job");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Disconnect so the thread drains remaining jobs and exits.
        self.jobs.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_worker_thread() {
        let worker = Worker::new();
        let caller = thread::current().id();

        let (tx, rx) = mpsc::channel();
        worker.submit(Box::new(move || {
            tx.send(thread::current().id()).unwrap();
        }));

        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(ran_on, caller);
    }

    #[test]
    fn test_drop_drains_pending_jobs() {
        let worker = Worker::new();
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            worker.submit(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        drop(worker);

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 10);
    }
}
