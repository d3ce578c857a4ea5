//! Subscriptions: lazy sequences of pushes under one correlation id.

use bytes::Bytes;
use futures_util::{Stream, stream};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::{
    client::VenueClient,
    error::{VenueError, VenueResult},
    id::CorrelationId,
    message::Reply,
    protocol::VenueProtocol,
    registry::{Closure, WaitHandle},
};

/// Whether a subscription suppresses repeated identical pushes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Yield every push.
    #[default]
    Off,
    /// Skip a push whose body is byte-identical to the last one yielded.
    SkipIdentical,
}

/// A live subscription.
///
/// Yields pushes in wire order until cancelled or the session is lost.
/// Call [`Subscription::cancel`] to unsubscribe at the venue; dropping the
/// subscription releases it locally right away and queues the unsubscribe
/// in the background.
pub struct Subscription<P: VenueProtocol> {
    client: VenueClient<P>,
    handle: WaitHandle,
    dedup: DedupPolicy,
    last_body: Option<Bytes>,
    stream_id: Option<String>,
    finished: bool,
    failed: bool,
    released: bool,
}

impl<P: VenueProtocol> Subscription<P> {
    pub(crate) fn new(client: VenueClient<P>, handle: WaitHandle, dedup: DedupPolicy) -> Self {
        Self {
            client,
            handle,
            dedup,
            last_body: None,
            stream_id: None,
            finished: false,
            failed: false,
            released: false,
        }
    }

    /// Correlation id of this subscription.
    pub fn id(&self) -> CorrelationId {
        self.handle.id()
    }

    /// Venue-side stream id, known once the first push arrived.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.as_deref()
    }

    /// The de-dup policy in effect.
    pub fn dedup(&self) -> DedupPolicy {
        self.dedup
    }

    /// Whether the sequence has ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Whether the subscription was released by a cancellation.
    ///
    /// Distinguishes a cancelled sequence from one that ended with an error.
    pub fn is_cancelled(&self) -> bool {
        !self.failed && self.handle.closure() == Some(Closure::Cancelled)
    }

    /// Next push.
    ///
    /// Cancellation surfaces as `None`; check [`Self::is_cancelled`] to tell
    /// it apart from the end after a terminal error, which is yielded once
    /// before `None` follows. A venue error reply ends the
    /// sequence with [`VenueError::Rejected`]; a lost session ends it with
    /// [`VenueError::ConnectionLost`].
    pub async fn next(&mut self) -> Option<VenueResult<Reply>> {
        let poll_interval = self.client.config.subscription_poll_interval;

        while !self.finished {
            let waited = timeout(poll_interval, self.client.registry.wait(&self.handle)).await;
            match waited {
                Ok(Ok(reply)) => {
                    if reply.is_error() {
                        self.failed = true;
                        self.finish();
                        return Some(reply.into_result());
                    }
                    self.track_stream(&reply);
                    if self.is_duplicate(&reply) {
                        trace!(id = %self.id(), "Skipping identical push");
                        continue;
                    }
                    return Some(Ok(reply));
                }
                Ok(Err(VenueError::Cancelled { .. })) => {
                    self.finished = true;
                    return None;
                }
                Ok(Err(err)) => {
                    self.failed = true;
                    self.finish();
                    return Some(Err(err));
                }
                Err(_) => {
                    trace!(id = %self.id(), "Subscription poll interval elapsed");
                }
            }
        }
        None
    }

    /// Next push, failing with [`VenueError::Timeout`] if none arrives in `limit`.
    pub async fn next_timeout(&mut self, limit: std::time::Duration) -> VenueResult<Option<Reply>> {
        match timeout(limit, self.next()).await {
            Ok(Some(result)) => result.map(Some),
            Ok(None) => Ok(None),
            Err(_) => Err(VenueError::timeout(self.id(), limit)),
        }
    }

    /// Unsubscribe at the venue and release the local entry.
    ///
    /// The local release happens even if the venue round-trip fails; the
    /// error only reports that failure.
    pub async fn cancel(mut self) -> VenueResult<()> {
        self.released = true;
        self.finished = true;
        self.client.cancel(self.id()).await
    }

    /// Convert into a [`Stream`] of pushes.
    ///
    /// Dropping the stream releases the subscription like dropping it would.
    pub fn into_stream(self) -> impl Stream<Item = VenueResult<Reply>> + Send {
        stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|item| (item, subscription))
        })
    }

    fn track_stream(&mut self, reply: &Reply) {
        let Some(stream_id) = reply
            .text()
            .and_then(|text| self.client.protocol.extract_stream_id(text))
        else {
            return;
        };
        if self.stream_id.as_deref() != Some(stream_id.as_str()) {
            debug!(id = %self.id(), %stream_id, "Subscription stream id");
            self.client.remember_stream(self.id(), &stream_id);
            self.stream_id = Some(stream_id);
        }
    }

    fn is_duplicate(&mut self, reply: &Reply) -> bool {
        match self.dedup {
            DedupPolicy::Off => false,
            DedupPolicy::SkipIdentical => {
                if self.last_body.as_ref() == Some(reply.body()) {
                    return true;
                }
                self.last_body = Some(reply.body().clone());
                false
            }
        }
    }

    /// Local release after a terminal outcome; nothing left to forget.
    fn finish(&mut self) {
        self.finished = true;
        self.released = true;
        let id = self.id();
        self.client.streams.remove_sync(&id);
        self.client.registry.cancel(id);
    }
}

impl<P: VenueProtocol> Drop for Subscription<P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let id = self.id();
        let stream_id = self
            .client
            .streams
            .remove_sync(&id)
            .map(|(_, stream_id)| stream_id);
        let was_live = self.client.registry.cancel(id);

        let Some(stream_id) = stream_id.filter(|_| was_live) else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let client = self.client.clone();
                runtime.spawn(async move {
                    if let Err(err) = client.forget(&stream_id).await {
                        warn!(%id, error = %err, "Unsubscribe on drop failed");
                    }
                });
            }
            Err(_) => {
                warn!(%id, "No runtime available to unsubscribe dropped subscription");
            }
        }
    }
}
