use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
///
/// This must be called from an async block or function running on a runtime.
#[track_caller]
pub(crate) fn spawn<F, O>(fut: F) -> JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut)
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::timed_out("operation exceeded its time budget"))
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
