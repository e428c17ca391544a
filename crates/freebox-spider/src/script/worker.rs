//! Dedicated thread owning one script context.
//!
//! A JS context is not thread-safe, so every touch of it (creation, calls,
//! promise continuations, async HTTP completions, teardown) is a job on
//! this thread's queue. After each job the context's microtask queue is
//! drained so promise reactions run before the next job.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::engine::ScriptEngine;
use crate::error::SpiderError;

type Job = Box<dyn FnOnce(&mut Option<ScriptEngine>) + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

/// Queue handle for work that runs against the live engine.
#[derive(Clone)]
pub(crate) struct JobSender {
    tx: mpsc::UnboundedSender<Message>,
}

impl JobSender {
    /// Queue `job`; it is skipped if the engine is gone by the time it runs.
    /// Returns `false` once the worker has stopped.
    pub(crate) fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut ScriptEngine) + Send + 'static,
    {
        let job: Job = Box::new(move |slot| match slot.as_mut() {
            Some(engine) => job(engine),
            None => tracing::debug!("script context closed, dropping job"),
        });
        self.tx.send(Message::Run(job)).is_ok()
    }
}

pub(crate) struct ScriptWorker {
    name: String,
    sender: JobSender,
}

impl ScriptWorker {
    pub(crate) fn spawn(name: &str) -> Result<Self, SpiderError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let thread_name = format!("spider-js-{name}");
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut slot: Option<ScriptEngine> = None;
                while let Some(message) = rx.blocking_recv() {
                    match message {
                        Message::Run(job) => {
                            job(&mut slot);
                            if let Some(engine) = slot.as_mut() {
                                engine.run_jobs();
                            }
                        }
                        Message::Stop => break,
                    }
                }
                tracing::debug!("script worker exiting");
            })?;

        Ok(Self {
            name: name.to_string(),
            sender: JobSender { tx },
        })
    }

    pub(crate) fn sender(&self) -> JobSender {
        self.sender.clone()
    }

    /// Run `job` on the worker and wait at most `timeout` for its result.
    ///
    /// The job sees the engine slot itself, so it can install or take the
    /// engine. A timed-out job still runs eventually; its result is dropped.
    pub(crate) async fn run<F, R>(&self, timeout: Duration, job: F) -> Result<R, SpiderError>
    where
        F: FnOnce(&mut Option<ScriptEngine>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move |slot| {
            let _ = tx.send(job(slot));
        });
        self.sender
            .tx
            .send(Message::Run(job))
            .map_err(|_| SpiderError::InvocationFailure(format!("{}: worker stopped", self.name)))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(SpiderError::InvocationFailure(format!(
                "{}: worker dropped the call",
                self.name
            ))),
            Err(_) => Err(SpiderError::InvocationTimeout(format!(
                "{}: no result after {timeout:?}",
                self.name
            ))),
        }
    }

    /// Ask the thread to exit after the jobs already queued.
    pub(crate) fn stop(&self) {
        let _ = self.sender.tx.send(Message::Stop);
    }
}

impl Drop for ScriptWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
