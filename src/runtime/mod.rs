mod acknowledged_message;
mod join_handle;
pub(crate) mod stream;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver, AcknowledgmentSender},
    join_handle::AsyncJoinHandle,
    stream::AsyncStream,
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
///
/// If the runtime is still running, this will return a handle to the background task.
/// Otherwise, it will panic.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    let handle = tokio::runtime::Handle::current();
    AsyncJoinHandle::Tokio(handle.spawn(fut))
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout())
}

/// Await on a future for a maximum amount of time, if a maximum is given.
pub(crate) async fn timeout_opt<F: Future>(
    timeout_duration: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match timeout_duration {
        Some(d) => timeout(d, future).await,
        None => Ok(future.await),
    }
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
