//! Worker threads, each owning one event loop.

use std::cell::Cell;
use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::error::Error;
use crate::net::event_loop::{EventLoop, LoopHandle};

/// One worker: an OS thread blocked in its own event loop.
pub struct IoThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl IoThread {
    /// Spawn a worker thread. The thread constructs its loop, hands back a
    /// handle, and blocks in `run()` until stopped.
    pub fn spawn(index: usize) -> Result<Self, Error> {
        let (tx, rx) = crossbeam_channel::bounded::<Result<LoopHandle, Error>>(1);

        let thread = thread::Builder::new()
            .name(format!("io-worker-{index}"))
            .spawn(move || {
                let el = match EventLoop::current() {
                    Ok(el) => el,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                let _ = tx.send(Ok(el.handle()));
                el.run();
                debug!("io worker exiting");
            })
            .map_err(Error::Io)?;

        let handle = rx
            .recv()
            .map_err(|_| Error::Config("io worker died during startup".to_string()))??;

        Ok(IoThread {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Ask the loop to stop and join the thread.
    pub fn stop_and_join(&mut self) {
        self.handle.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("io worker panicked");
            }
        }
    }
}

/// Fixed-size group of IO workers with a round-robin cursor.
pub struct IoThreadPool {
    threads: Vec<IoThread>,
    cursor: Cell<usize>,
}

impl IoThreadPool {
    /// Spawn `size` workers. Their loops begin running immediately.
    pub fn new(size: usize) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::Config("io thread pool size must be >= 1".to_string()));
        }
        let mut threads = Vec::with_capacity(size);
        for index in 0..size {
            threads.push(IoThread::spawn(index)?);
        }
        Ok(IoThreadPool {
            threads,
            cursor: Cell::new(0),
        })
    }

    /// Rendezvous with every worker: returns once each loop has executed a
    /// task, which only happens inside its first iteration.
    pub fn start(&self) -> Result<(), Error> {
        let (tx, rx) = crossbeam_channel::bounded::<()>(self.threads.len());
        for thread in &self.threads {
            let tx = tx.clone();
            thread.handle().post(move |_| {
                let _ = tx.send(());
            });
        }
        drop(tx);
        for _ in 0..self.threads.len() {
            rx.recv_timeout(Duration::from_secs(5))
                .map_err(|_| Error::Config("io worker failed to enter its loop".to_string()))?;
        }
        Ok(())
    }

    /// Hand out the next worker's loop handle, round-robin.
    pub fn next(&self) -> LoopHandle {
        let index = self.cursor.get();
        self.cursor.set((index + 1) % self.threads.len());
        self.threads[index].handle()
    }

    pub fn handles(&self) -> Vec<LoopHandle> {
        self.threads.iter().map(|t| t.handle()).collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Stop every worker loop and join the threads.
    pub fn stop_and_join(&mut self) {
        for thread in &mut self.threads {
            thread.stop_and_join();
        }
    }
}

impl Drop for IoThreadPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[test]
    fn start_waits_for_every_loop() {
        let mut pool = IoThreadPool::new(3).unwrap();
        pool.start().unwrap();
        pool.stop_and_join();
    }

    #[test]
    fn next_round_robins() {
        let mut pool = IoThreadPool::new(2).unwrap();
        pool.start().unwrap();

        let seen = Arc::new(Mutex::new(HashSet::new()));
        let (tx, rx) = crossbeam_channel::bounded(4);
        for _ in 0..4 {
            let seen = seen.clone();
            let tx = tx.clone();
            pool.next().post(move |_| {
                seen.lock().unwrap().insert(thread::current().id());
                let _ = tx.send(());
            });
        }
        for _ in 0..4 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 2);
        pool.stop_and_join();
    }

    #[test]
    fn zero_size_pool_is_rejected() {
        assert!(IoThreadPool::new(0).is_err());
    }
}
