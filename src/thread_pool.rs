//! Fixed pool of named OS threads, one job per DICOM association.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    handles: Vec<thread::JoinHandle<()>>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    /// Spawn `size` worker threads named `<name>-<n>`.
    pub fn new(size: usize, name: &str) -> ThreadPool {
        assert!(size > 0, "thread pool cannot have 0 threads");
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..size)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("{name}-{id}"))
                    .spawn(move || {
                        while let Ok(job) = {
                            let guard = receiver.lock().unwrap();
                            guard.recv()
                        } {
                            job();
                        }
                    })
                    .expect("failed to spawn pool worker")
            })
            .collect();
        ThreadPool {
            handles,
            sender: Some(sender),
        }
    }

    /// Queue a job; it runs on the first free worker.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .as_ref()
            .expect("thread pool has been shut down")
            .send(Box::new(f))
            .unwrap();
    }

    /// Stop accepting jobs and wait for the workers to drain.
    ///
    /// Kept as a method instead of a Drop impl so CTRL-C aborts workers
    /// immediately rather than waiting for them to finish.
    pub fn shutdown(&mut self) {
        drop(self.sender.take());
        for handle in self.handles.drain(..) {
            handle.join().unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_all_jobs_run_before_shutdown_returns() {
        let mut pool = ThreadPool::new(4, "test_pool");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }
}
