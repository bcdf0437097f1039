use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use crate::error::UploadError;

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), UploadError> {
        if self.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            Ok(())
        }
    }
}

pub struct Worker;

impl Worker {
    pub fn spawn<T, F>(name: &str, job: F) -> Result<WorkerHandle<T>, UploadError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = sender.send(job());
            })
            .map_err(|err| UploadError::Filesystem(format!("spawn worker: {err}")))?;
        Ok(WorkerHandle {
            receiver,
            join: Some(join),
        })
    }
}

pub struct WorkerHandle<T> {
    receiver: Receiver<T>,
    join: Option<JoinHandle<()>>,
}

impl<T> WorkerHandle<T> {
    /// Non-blocking poll. `Ok(None)` while the job is still running.
    pub fn try_result(&mut self) -> Result<Option<T>, UploadError> {
        match self.receiver.try_recv() {
            Ok(value) => {
                self.reap();
                Ok(Some(value))
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => {
                self.reap();
                Err(UploadError::Filesystem("worker ended without a result".to_string()))
            }
        }
    }

    pub fn wait(mut self) -> Result<T, UploadError> {
        let value = self
            .receiver
            .recv()
            .map_err(|_| UploadError::Filesystem("worker ended without a result".to_string()));
        self.reap();
        value
    }

    fn reap(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
