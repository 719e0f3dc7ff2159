use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use pin_project::{pin_project, pinned_drop};

/// Renders a wall-clock duration the way the install terminal messages
/// report it, e.g. "Total time elapsed: 0 hours, 2 minutes, 17 seconds".
pub fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("Total time elapsed: {hours} hours, {minutes} minutes, {seconds} seconds")
}

/// Wraps a [`Stream`] and runs a cleanup closure when the wrapper is dropped,
/// whether the stream ran to completion or the client went away mid-flight.
#[pin_project(PinnedDrop)]
pub struct StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    #[pin]
    inner: S,
    cleanup: Option<F>,
}

impl<S, F> StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    pub fn new(inner: S, cleanup: F) -> Self {
        Self {
            inner,
            cleanup: Some(cleanup),
        }
    }
}

impl<S, F> Stream for StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl<S, F> PinnedDrop for StreamGuard<S, F>
where
    S: Stream,
    F: FnOnce(),
{
    fn drop(self: Pin<&mut Self>) {
        if let Some(cleanup) = self.project().cleanup.take() {
            cleanup();
        }
    }
}

/// Method-chaining sugar for attaching a [`StreamGuard`].
pub trait GuardStreamExt: Stream + Sized {
    fn guard<F>(self, cleanup: F) -> StreamGuard<Self, F>
    where
        F: FnOnce();
}

impl<S: Stream> GuardStreamExt for S {
    fn guard<F>(self, cleanup: F) -> StreamGuard<Self, F>
    where
        F: FnOnce(),
    {
        StreamGuard::new(self, cleanup)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use futures::StreamExt;

    use super::*;

    #[test]
    fn elapsed_formatting() {
        assert_eq!(
            format_elapsed(Duration::from_secs(0)),
            "Total time elapsed: 0 hours, 0 minutes, 0 seconds"
        );
        assert_eq!(
            format_elapsed(Duration::from_secs(137)),
            "Total time elapsed: 0 hours, 2 minutes, 17 seconds"
        );
        assert_eq!(
            format_elapsed(Duration::from_secs(3600 * 5 + 60 * 59 + 59)),
            "Total time elapsed: 5 hours, 59 minutes, 59 seconds"
        );
    }

    #[tokio::test]
    async fn guard_runs_cleanup_when_stream_is_dropped() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = cleaned.clone();
        let mut stream = futures::stream::iter([1, 2, 3]).guard(move || {
            flag.store(true, Ordering::SeqCst);
        });

        assert_eq!(stream.next().await, Some(1));
        assert!(!cleaned.load(Ordering::SeqCst));
        drop(stream);
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
