// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A dedicated thread that owns some state and runs closures against it one at a time.
//!
//! This is the same shape as an async handle to a blocking database connection: callers
//! send boxed closures down an unbounded channel and await the answer on a oneshot. Because
//! exactly one thread ever touches the state, operations on it are totally ordered by
//! arrival and never overlap.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{OperationError, SignerError};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Message<S> {
    Run(Job<S>),
    Stop(oneshot::Sender<()>),
}

pub struct Worker<S> {
    name: String,
    sender: mpsc::UnboundedSender<Message<S>>,
}

impl<S: Send + 'static> Worker<S> {
    /// Starts the worker thread. `init` builds the state on that thread, so it may block.
    /// `close` runs there too once the queue has been drained, with the state about to be
    /// dropped.
    ///
    /// If `init` panics the thread exits and every call fails with `TokenNotAvailable`.
    pub fn spawn(
        name: impl Into<String>,
        init: impl FnOnce() -> S + Send + 'static,
        close: impl FnOnce(&mut S) + Send + 'static,
    ) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message<S>>();
        let thread_name = format!("token-{name}");
        let log_name = name.clone();

        thread::Builder::new().name(thread_name).spawn(move || {
            let mut state = match catch_unwind(AssertUnwindSafe(init)) {
                Ok(state) => state,
                Err(panic) => {
                    error!(
                        "starting worker for token {log_name} panicked: {}",
                        panic_message(&*panic)
                    );
                    return;
                }
            };
            let mut stopped = None;
            while let Some(message) = receiver.blocking_recv() {
                match message {
                    Message::Run(job) => job(&mut state),
                    Message::Stop(done) => {
                        stopped = Some(done);
                        break;
                    }
                }
            }
            // Anything queued after the stop marker is dropped here, which
            // tells its caller the token went away.
            drop(receiver);
            close(&mut state);
            drop(state);
            debug!("worker for token {log_name} exited");
            if let Some(done) = stopped {
                let _ = done.send(());
            }
        })?;

        Ok(Self { name, sender })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues `f` right away and returns a future that resolves to its result.
    ///
    /// Dropping the returned future does not cancel `f`.
    pub fn call<R, F>(
        &self,
        f: F,
    ) -> impl Future<Output = Result<R, OperationError>> + Send + 'static
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> Result<R, SignerError> + Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        let name = self.name.clone();
        let job: Job<S> = Box::new(move |state: &mut S| {
            let outcome = match catch_unwind(AssertUnwindSafe(|| f(state))) {
                Ok(r) => r.map_err(OperationError::from),
                Err(panic) => {
                    let message = panic_message(&*panic);
                    error!("operation on token {name} panicked: {message}");
                    Err(OperationError::Unexpected(anyhow!(
                        "operation on token {name} panicked: {message}"
                    )))
                }
            };
            // The caller may have given up waiting; that's fine.
            let _ = reply.send(outcome);
        });

        let queued = self.sender.send(Message::Run(job)).is_ok();
        let name = self.name.clone();
        async move {
            if !queued {
                return Err(not_available(name));
            }
            result.await.map_err(|_| not_available(name))?
        }
    }

    /// Lets everything already queued finish, closes the state and waits for the thread to
    /// exit. Calls made afterwards fail with `TokenNotAvailable`.
    pub async fn stop(&self) {
        let (done, stopped) = oneshot::channel();
        if self.sender.send(Message::Stop(done)).is_ok() {
            let _ = stopped.await;
        }
    }
}

fn not_available(token_id: String) -> OperationError {
    SignerError::TokenNotAvailable { token_id }.into()
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn runs_calls_in_arrival_order() {
        let worker = Worker::spawn("t", Vec::<u32>::new, |_| {}).unwrap();
        let calls: Vec<_> = (0..50)
            .map(|i| {
                worker.call(move |v: &mut Vec<u32>| {
                    v.push(i);
                    Ok(())
                })
            })
            .collect();
        futures::future::join_all(calls).await;
        let seen = worker.call(|v| Ok(v.clone())).await.unwrap();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panics_become_unexpected_and_worker_survives() {
        let worker = Worker::spawn("t", || 0u32, |_| {}).unwrap();
        let err = worker
            .call(|_: &mut u32| -> Result<(), SignerError> { panic!("kaboom") })
            .await
            .unwrap_err();
        match err {
            OperationError::Unexpected(e) => assert!(e.to_string().contains("kaboom")),
            other => panic!("expected unexpected failure, got {other:?}"),
        }
        assert_eq!(
            worker
                .call(|n| {
                    *n += 1;
                    Ok(*n)
                })
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn state_is_built_on_the_worker_thread() {
        let worker = Worker::spawn("t", || thread::current().name().map(str::to_owned), |_| {})
            .unwrap();
        let built_on = worker.call(|name| Ok(name.clone())).await.unwrap();
        assert_eq!(built_on.as_deref(), Some("token-t"));
    }

    #[tokio::test]
    async fn failed_init_leaves_worker_unavailable() {
        let worker = Worker::spawn("t", || -> u32 { panic!("no device") }, |_| {}).unwrap();
        let err = worker.call(|_| Ok(())).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::Signer(SignerError::TokenNotAvailable { .. })
        ));
        worker.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_queue_then_closes() {
        let done = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let closed2 = closed.clone();
        let worker = Worker::spawn("t", || (), move |_| {
            closed2.store(1, Ordering::SeqCst);
        })
        .unwrap();

        let pending: Vec<_> = (0..5)
            .map(|_| {
                let done = done.clone();
                worker.call(move |_| {
                    std::thread::sleep(Duration::from_millis(5));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        worker.stop().await;
        let results = futures::future::join_all(pending).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        let err = worker.call(|_| Ok(())).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::Signer(SignerError::TokenNotAvailable { .. })
        ));
    }
}
