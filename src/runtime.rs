//! Thin wrapper over tokio's tasks: [`AbortOnDropJoinHandle`] is exactly like
//! a [`tokio::task::JoinHandle`] except that dropping it aborts the task.
//! Background work owned by a host context (the stdin pump, the output
//! writers) must not outlive it, so this crate spawns through [`spawn`]
//! rather than using tokio's handles directly.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

pub struct AbortOnDropJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDropJoinHandle<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> From<tokio::task::JoinHandle<T>> for AbortOnDropJoinHandle<T> {
    fn from(handle: tokio::task::JoinHandle<T>) -> Self {
        AbortOnDropJoinHandle(handle)
    }
}

impl<T> Future for AbortOnDropJoinHandle<T> {
    type Output = T;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.as_mut().0).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(e)) => panic!("background task panicked: {e}"),
        }
    }
}

pub fn spawn<F>(f: F) -> AbortOnDropJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    AbortOnDropJoinHandle::from(tokio::task::spawn(f))
}
