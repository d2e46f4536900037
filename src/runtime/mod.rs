mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
mod tls;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver},
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    tls::TlsConfig,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::{ErrorKind, Result};

/// Spawn a task in the background to run a future.
///
/// If the runtime is still running, this will return a handle to the background task.
/// Otherwise, it will return `None`. As a result, this must be called from an async block
/// or function running on a runtime.
#[allow(clippy::unnecessary_wraps)]
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::Tokio(tokio::task::spawn(fut))
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ErrorKind::Io(std::sync::Arc::new(std::io::ErrorKind::TimedOut.into())).into())
}

/// Create a new `Interval` that yields with interval of `duration`.
///
/// The first tick completes immediately, and missed ticks are skipped rather than being made up in
/// a burst.
pub(crate) fn interval(duration: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(duration);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
