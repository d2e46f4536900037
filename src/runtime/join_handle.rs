use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A handle to an asynchronous task spawned on the runtime.
///
/// Dropping the handle detaches the task rather than aborting it.
#[derive(Debug)]
pub(crate) enum AsyncJoinHandle<T> {
    Tokio(tokio::task::JoinHandle<T>),
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        match self.get_mut() {
            // Tokio wraps the task's output in a Result that contains an error only if the task
            // panicked or was cancelled; propagating the panic here mirrors what a directly
            // awaited task would do.
            Self::Tokio(ref mut handle) => Pin::new(handle).poll(cx).map(|result| {
                result.unwrap_or_else(|e| std::panic::resume_unwind(e.into_panic()))
            }),
        }
    }
}
