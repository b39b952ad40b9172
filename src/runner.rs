//! Async front end for the blocking orchestrator.
//!
//! Each swap runs on `tokio::task::spawn_blocking`; progress is streamed to
//! the receiver returned by [`SwapRunner::new`].

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::leg::AtomicSwap;
use crate::orchestrator::{
    SwapEvent, SwapOutcome, execute_as_counterparty_with, execute_as_initiator_with,
};
use crate::params::Secret;

/// Finished swap, handing the legs back for inspection.
#[derive(Debug)]
pub struct SwapReport<N, F> {
    pub outcome: SwapOutcome,
    pub native: N,
    pub foreign: F,
}

#[derive(Clone)]
pub struct SwapRunner {
    events: mpsc::UnboundedSender<SwapEvent>,
}

impl SwapRunner {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SwapEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    pub async fn run_as_initiator<N, F>(
        &self,
        native: N,
        foreign: F,
        secret: Secret,
    ) -> Result<SwapReport<N, F>>
    where
        N: AtomicSwap + Send + 'static,
        F: AtomicSwap + Send + 'static,
    {
        join(self.spawn_initiator(native, foreign, secret)).await
    }

    pub async fn run_as_counterparty<N, F>(&self, native: N, foreign: F) -> Result<SwapReport<N, F>>
    where
        N: AtomicSwap + Send + 'static,
        F: AtomicSwap + Send + 'static,
    {
        join(self.spawn_counterparty(native, foreign)).await
    }

    /// Start the initiator role without waiting for it.
    pub fn spawn_initiator<N, F>(
        &self,
        mut native: N,
        mut foreign: F,
        secret: Secret,
    ) -> JoinHandle<Result<SwapReport<N, F>>>
    where
        N: AtomicSwap + Send + 'static,
        F: AtomicSwap + Send + 'static,
    {
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = execute_as_initiator_with(&mut native, &mut foreign, &secret, &events)?;
            Ok(SwapReport {
                outcome,
                native,
                foreign,
            })
        })
    }

    /// Start the counterparty role without waiting for it.
    pub fn spawn_counterparty<N, F>(
        &self,
        mut native: N,
        mut foreign: F,
    ) -> JoinHandle<Result<SwapReport<N, F>>>
    where
        N: AtomicSwap + Send + 'static,
        F: AtomicSwap + Send + 'static,
    {
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = execute_as_counterparty_with(&mut native, &mut foreign, &events)?;
            Ok(SwapReport {
                outcome,
                native,
                foreign,
            })
        })
    }
}

/// Await a spawned swap, folding join failures into [`Error::Task`].
pub async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await.map_err(|e| Error::Task(e.to_string()))?
}
