//! Worker threads with a bounded stop
//!
//! A [`WorkerHandle`] owns one OS thread and its stop flag. `stop` clears the
//! flag, waits for the thread to finish and joins it; it only returns `Ok`
//! once both have happened.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, warn};

use crate::error::{PipelineError, Result};

/// Cooperative cancellation flag handed to the worker body
#[derive(Debug, Clone)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Signals completion when the worker body returns or unwinds
struct DoneGuard(Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.try_send(());
    }
}

pub struct WorkerHandle {
    name: String,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    finished: bool,
    thread: Option<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl WorkerHandle {
    /// Spawn a named thread running `body`
    ///
    /// `drain_timeout` bounds the wait when the handle is dropped without an
    /// explicit `stop`.
    pub fn spawn<F>(name: impl Into<String>, drain_timeout: Duration, body: F) -> Result<Self>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = channel::bounded(1);
        let token = StopToken { flag: stop.clone() };

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _done = DoneGuard(done_tx);
                body(token);
            })
            .map_err(|source| PipelineError::Spawn {
                name: name.clone(),
                source,
            })?;

        debug!("Spawned worker '{}'", name);
        Ok(Self {
            name,
            stop,
            done: done_rx,
            finished: false,
            thread: Some(thread),
            drain_timeout,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True once the body has returned, whether stopped or on its own
    pub fn is_finished(&mut self) -> bool {
        self.wait(Duration::ZERO)
    }

    /// Wait up to `timeout` for the body to return without asking it to stop
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if self.finished {
            return true;
        }
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.finished = true;
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }

    /// Clear the run flag and join
    ///
    /// On a drain timeout the thread is left running and the handle stays
    /// valid, so the stop can be retried.
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.request_stop();

        if !self.wait(timeout) {
            self.thread = Some(thread);
            warn!("Worker '{}' still running after {:?}", self.name, timeout);
            return Err(PipelineError::Drain {
                name: self.name.clone(),
                timeout,
            });
        }

        if thread.join().is_err() {
            error!("Worker '{}' panicked", self.name);
        }
        debug!("Joined worker '{}'", self.name);
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        if let Err(e) = self.stop(self.drain_timeout) {
            error!("Detaching worker: {}", e);
        }
    }
}
