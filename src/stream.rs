//! In-order launch queue
//!
//! Launches run one after another on a dedicated worker thread. Enqueueing
//! returns at once; [`Stream::synchronize`] waits for everything enqueued so
//! far. A launch that crashes marks the stream failed: later launches are
//! dropped and every synchronize reports the failure.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Sender};

use crate::error::{GemmError, GemmResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum StreamMessage {
    Launch { name: String, job: Job },
    Fence(Sender<()>),
}

pub struct Stream {
    tx: Option<Sender<StreamMessage>>,
    failure: Arc<Mutex<Option<String>>>,
    worker: Option<JoinHandle<()>>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Stream {
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<StreamMessage>();
        let failure = Arc::new(Mutex::new(None));
        let worker_failure = Arc::clone(&failure);

        let worker = thread::spawn(move || {
            log::trace!("Stream worker started");
            for message in rx.iter() {
                match message {
                    StreamMessage::Launch { name, job } => {
                        let failed = worker_failure
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .is_some();
                        if failed {
                            log::debug!("Dropping {} on a failed stream", name);
                            continue;
                        }

                        log::debug!("Running {}", name);
                        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                            let message = format!("{} crashed: {}", name, panic_message(payload.as_ref()));
                            log::error!("{}", message);
                            *worker_failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
                        }
                    }
                    StreamMessage::Fence(done) => {
                        let _ = done.send(());
                    }
                }
            }
            log::trace!("Stream worker stopped");
        });

        Self {
            tx: Some(tx),
            failure,
            worker: Some(worker),
        }
    }

    fn send(&self, message: StreamMessage) -> GemmResult<()> {
        match &self.tx {
            Some(tx) => tx
                .send(message)
                .map_err(|_| GemmError::stream("stream worker is gone")),
            None => Err(GemmError::stream("stream is closed")),
        }
    }

    /// Queue `job` behind everything already enqueued
    pub fn enqueue(&self, name: impl Into<String>, job: impl FnOnce() + Send + 'static) -> GemmResult<()> {
        self.send(StreamMessage::Launch {
            name: name.into(),
            job: Box::new(job),
        })
    }

    /// Block until every enqueued launch has retired
    pub fn synchronize(&self) -> GemmResult<()> {
        let (done_tx, done_rx) = bounded(1);
        self.send(StreamMessage::Fence(done_tx))?;
        done_rx
            .recv()
            .map_err(|_| GemmError::stream("stream worker exited before the fence"))?;

        match self.failure.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(message) => Err(GemmError::stream(message.clone())),
            None => Ok(()),
        }
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
