use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use crate::error::{ErrorKind, Result};

/// A handle to a task spawned on the runtime. Awaiting it returns the task's output, or an
/// internal error if the task panicked or was cancelled.
#[derive(Debug)]
pub(crate) enum AsyncJoinHandle<T> {
    Tokio(tokio::task::JoinHandle<T>),
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Self::Tokio(ref mut handle) => Pin::new(handle).poll(cx).map(|result| {
                result.map_err(|e| {
                    ErrorKind::Internal {
                        message: format!("{}", e),
                    }
                    .into()
                })
            }),
        }
    }
}
