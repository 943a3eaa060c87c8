//! Stream merging for handler-injected events
//!
//! A handler fronting the engine's event stream sometimes has frames of
//! its own to contribute, such as acceptance or preflight notices sent
//! before the engine has produced anything. The merger queues injected
//! events and, on every pull from the consumer, first flushes the whole
//! queue as framed events and then forwards exactly one upstream chunk.
//! Injected frames therefore never land inside a partially forwarded
//! chunk, and the wire framing stays intact. `keep_alive` covers idle
//! stretches with comment frames so intermediaries keep the connection
//! open.

use bytes::{Bytes, BytesMut};
use futures::stream::Stream;
use quay_core::JobEvent;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};

use crate::sse::frame;

/// Queues events for injection into a `MergedStream`
#[derive(Clone)]
pub struct InjectHandle {
    sender: mpsc::UnboundedSender<JobEvent>,
}

impl InjectHandle {
    /// Queue `event` for the consumer's next pull. Events injected after
    /// the consumer is gone are dropped.
    pub fn inject(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

/// Byte stream interleaving injected frames with upstream chunks
pub struct MergedStream<S> {
    injected: mpsc::UnboundedReceiver<JobEvent>,
    upstream: S,
    upstream_done: bool,
}

/// Pair `upstream` with an injection handle. Dropping the merged stream
/// drops the upstream with it, so consumer cancellation propagates.
pub fn merged<S>(upstream: S) -> (InjectHandle, MergedStream<S>)
where
    S: Stream<Item = Bytes> + Unpin,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        InjectHandle { sender },
        MergedStream {
            injected: receiver,
            upstream,
            upstream_done: false,
        },
    )
}

impl<S> Stream for MergedStream<S>
where
    S: Stream<Item = Bytes> + Unpin,
{
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();

        let mut out = BytesMut::new();
        while let Poll::Ready(Some(event)) = this.injected.poll_recv(cx) {
            out.extend_from_slice(&frame(&event));
        }

        if this.upstream_done {
            return if out.is_empty() {
                Poll::Ready(None)
            } else {
                Poll::Ready(Some(out.freeze()))
            };
        }

        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Ready(Some(chunk)) => {
                if out.is_empty() {
                    Poll::Ready(Some(chunk))
                } else {
                    out.extend_from_slice(&chunk);
                    Poll::Ready(Some(out.freeze()))
                }
            }
            Poll::Ready(None) => {
                this.upstream_done = true;
                if out.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(out.freeze()))
                }
            }
            Poll::Pending => {
                if out.is_empty() {
                    Poll::Pending
                } else {
                    Poll::Ready(Some(out.freeze()))
                }
            }
        }
    }
}

/// Comment frame sent while the wrapped stream is idle
const PING_FRAME: &[u8] = b": ping\n\n";

/// Byte stream that emits a comment frame whenever `inner` stays quiet
/// for a whole period
pub struct KeepAliveStream<S> {
    inner: S,
    period: Duration,
    timer: Pin<Box<Sleep>>,
}

/// Wrap `inner` so idle stretches carry `: ping` comment frames. Chunks
/// reset the timer; the stream still ends when `inner` ends.
pub fn keep_alive<S>(inner: S, period: Duration) -> KeepAliveStream<S>
where
    S: Stream<Item = Bytes> + Unpin,
{
    KeepAliveStream {
        inner,
        period,
        timer: Box::pin(tokio::time::sleep(period)),
    }
}

impl<S> Stream for KeepAliveStream<S>
where
    S: Stream<Item = Bytes> + Unpin,
{
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(item) => {
                this.timer.as_mut().reset(Instant::now() + this.period);
                Poll::Ready(item)
            }
            Poll::Pending => match this.timer.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.timer.as_mut().reset(Instant::now() + this.period);
                    Poll::Ready(Some(Bytes::from_static(PING_FRAME)))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
