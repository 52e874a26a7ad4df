//! Reference worker-pool event processor.
//!
//! Three flume lanes drained in priority order (internal > handler >
//! completion). Each lane pop is FIFO, so submission order within a lane is
//! preserved; tasks from different lanes run in parallel across workers.

use std::sync::Arc;
use std::thread;

use flume::{Receiver, Sender};

use outrigger_core::exec::{EventProc, Task};

pub struct WorkerPool {
    internal: Sender<Task>,
    handler: Sender<Task>,
    completion: Sender<Task>,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least one).
    pub fn new(workers: usize) -> Arc<Self> {
        let (internal_tx, internal_rx) = flume::unbounded::<Task>();
        let (handler_tx, handler_rx) = flume::unbounded::<Task>();
        let (completion_tx, completion_rx) = flume::unbounded::<Task>();

        for index in 0..workers.max(1) {
            let lanes = (
                internal_rx.clone(),
                handler_rx.clone(),
                completion_rx.clone(),
            );
            let _ = thread::Builder::new()
                .name(format!("outrigger-worker-{index}"))
                .spawn(move || worker_loop(&lanes.0, &lanes.1, &lanes.2));
        }

        Arc::new(Self {
            internal: internal_tx,
            handler: handler_tx,
            completion: completion_tx,
        })
    }

    /// Pool sized to the machine.
    pub fn with_default_workers() -> Arc<Self> {
        Self::new(num_cpus::get())
    }
}

fn worker_loop(internal: &Receiver<Task>, handler: &Receiver<Task>, completion: &Receiver<Task>) {
    loop {
        // Priority drain: internal before handler before completion.
        if let Ok(task) = internal.try_recv() {
            task();
            continue;
        }
        if let Ok(task) = handler.try_recv() {
            task();
            continue;
        }
        if let Ok(task) = completion.try_recv() {
            task();
            continue;
        }

        // Idle: block until any lane delivers. First arrival wins.
        let disconnected = flume::Selector::new()
            .recv(internal, run_or_flag)
            .recv(handler, run_or_flag)
            .recv(completion, run_or_flag)
            .wait();

        if disconnected {
            // Senders dropped: drain leftovers, then exit.
            for lane in [internal, handler, completion] {
                while let Ok(task) = lane.try_recv() {
                    task();
                }
            }
            return;
        }
    }
}

fn run_or_flag(result: Result<Task, flume::RecvError>) -> bool {
    match result {
        Ok(task) => {
            task();
            false
        }
        Err(_) => true,
    }
}

impl EventProc for WorkerPool {
    fn post_rpc_completion(&self, task: Task) {
        let _ = self.completion.send(task);
    }

    fn post_handler_callback(&self, task: Task) {
        let _ = self.handler.send(task);
    }

    fn post_internal_message(&self, task: Task) {
        let _ = self.internal.send(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn tasks_run_on_worker_threads() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = mpsc::channel();
        pool.post_internal_message(Box::new(move || {
            tx.send(thread::current().name().map(str::to_owned)).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.unwrap_or_default().starts_with("outrigger-worker"));
    }

    #[test]
    fn lane_order_is_preserved() {
        // single worker: per-lane FIFO is observable end to end
        let pool = WorkerPool::new(1);
        let seen = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for expected in 0..64usize {
            let seen = seen.clone();
            let tx = tx.clone();
            pool.post_handler_callback(Box::new(move || {
                let previous = seen.fetch_add(1, Ordering::SeqCst);
                if previous != expected {
                    let _ = tx.send(Err((expected, previous)));
                }
                if expected == 63 {
                    let _ = tx.send(Ok(()));
                }
            }));
        }
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
    }
}
