//! Bounded worker pools.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, warn};

use super::error::PoolError;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size thread pool with a bounded hand-off queue.
///
/// `try_execute` never blocks: when every worker is busy and the queue is full
/// it returns [`PoolError::Saturated`] and the caller decides what to do.
pub struct WorkerPool {
    name: String,
    size: usize,
    sender: Mutex<Option<mpsc::SyncSender<Task>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize, queue_capacity: usize) -> Self {
        let name = name.into();
        let size = size.max(1);
        let (tx, rx) = mpsc::sync_channel::<Task>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let pool = name.clone();
            match thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(&pool, rx))
            {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(pool = %name, error = %e, "failed to spawn pool worker"),
            }
        }

        Self {
            name,
            size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn try_execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .map_err(|_| PoolError::ShutDown(self.name.clone()))?;
        let Some(sender) = sender.as_ref() else {
            return Err(PoolError::ShutDown(self.name.clone()));
        };
        match sender.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::Saturated(self.name.clone())),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::ShutDown(self.name.clone())),
        }
    }

    /// Stop accepting work, let queued tasks drain, and join the workers.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => return,
        };
        let current = thread::current().id();
        for handle in workers {
            // A task that triggers shutdown runs on one of our own workers.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        debug!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .finish()
    }
}

fn worker_loop(pool: &str, rx: Arc<Mutex<mpsc::Receiver<Task>>>) {
    loop {
        let task = {
            let Ok(rx) = rx.lock() else { break };
            match rx.recv() {
                Ok(task) => task,
                Err(_) => break,
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!(pool = %pool, "pool task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn runs_submitted_tasks() {
        let pool = WorkerPool::new("test", 2, 4);
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = mpsc::channel();

        for _ in 0..4 {
            let counter = counter.clone();
            let done_tx = done_tx.clone();
            pool.try_execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                done_tx.send(()).unwrap();
            })
            .unwrap();
        }
        for _ in 0..4 {
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        pool.shutdown();
    }

    #[test]
    fn saturated_pool_rejects_instead_of_blocking() {
        // One worker and no hand-off slots: a send only succeeds while the
        // worker sits idle in recv.
        let pool = WorkerPool::new("tiny", 1, 0);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Arc::new(Mutex::new(gate_rx));

        let mut accepted = false;
        for _ in 0..400 {
            let gate_rx = gate_rx.clone();
            if pool
                .try_execute(move || {
                    let _ = gate_rx.lock().unwrap().recv();
                })
                .is_ok()
            {
                accepted = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(accepted);

        let err = pool.try_execute(|| {}).unwrap_err();
        assert_eq!(err, PoolError::Saturated("tiny".into()));

        gate_tx.send(()).unwrap();
        pool.shutdown();
    }

    #[test]
    fn shut_down_pool_rejects() {
        let pool = WorkerPool::new("closed", 1, 1);
        pool.shutdown();
        assert_eq!(
            pool.try_execute(|| {}).unwrap_err(),
            PoolError::ShutDown("closed".into())
        );
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let pool = WorkerPool::new("panicky", 1, 2);
        pool.try_execute(|| panic!("boom")).unwrap();

        let (tx, rx) = mpsc::channel();
        let mut sent = false;
        for _ in 0..200 {
            let tx = tx.clone();
            if pool.try_execute(move || tx.send(7).unwrap()).is_ok() {
                sent = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(sent);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.shutdown();
    }
}
