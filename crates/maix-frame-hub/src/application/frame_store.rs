//! Keyed latest-frame store with push and continuous-stream fan-out.
//!
//! # Delivery styles
//!
//! - **Pull**: [`FrameStore::get`] returns whatever is stored for a key.
//! - **Push**: [`FrameStore::subscribe_push`] yields every new frame for every
//!   key.  Subscribers filter on their side if they care.
//! - **Stream**: [`FrameStore::attach_stream`] returns a [`StreamHandle`] that
//!   yields one multipart chunk per new frame for a single key.
//!
//! # Backpressure
//!
//! Nothing here ever waits on a consumer.  A push subscriber that falls behind
//! skips frames (`broadcast` lag).  A stream consumer holds a single slot: a
//! slow reader misses intermediate frames but always gets the newest one.
//! Only a consumer whose receiver is gone is detached.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::Stream;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::domain::frame::{probe_metadata, ImageFrame, ImageMetadata};
use crate::domain::FrameHubConfig;

/// Identifies one attached stream consumer.
pub type ConsumerId = Uuid;

/// Each consumer's slot holds the newest chunk it has not read yet.
type StreamConsumers = HashMap<ConsumerId, watch::Sender<Option<Bytes>>>;

// ── FrameStore ────────────────────────────────────────────────────────────────

/// Latest frame per key plus the consumers waiting for the next one.
pub struct FrameStore {
    frames: RwLock<HashMap<String, ImageFrame>>,
    push_tx: broadcast::Sender<ImageFrame>,
    streams: DashMap<String, StreamConsumers>,
}

impl FrameStore {
    pub fn new(config: &FrameHubConfig) -> Arc<Self> {
        let (push_tx, _) = broadcast::channel(config.push_buffer.max(1));
        Arc::new(Self {
            frames: RwLock::new(HashMap::new()),
            push_tx,
            streams: DashMap::new(),
        })
    }

    /// Publishes a new frame for `key`.
    ///
    /// The stored frame is always replaced, so pull and stream consumers see
    /// the same data as push subscribers.  Metadata is probed from the image
    /// header when the producer does not supply it.
    pub async fn set_image(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: Option<ImageMetadata>,
    ) -> ImageFrame {
        let metadata = metadata.or_else(|| probe_metadata(&bytes));
        let frame = ImageFrame::new(key, bytes, metadata);

        self.frames
            .write()
            .await
            .insert(key.to_string(), frame.clone());

        // No subscribers is not an error.
        let _ = self.push_tx.send(frame.clone());

        self.fan_out_stream(&frame);
        trace!(key, len = frame.bytes.len(), "frame published");
        frame
    }

    /// Latest frame for `key`, if any has been published.
    pub async fn get(&self, key: &str) -> Option<ImageFrame> {
        self.frames.read().await.get(key).cloned()
    }

    /// All keys with a stored frame, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.frames.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Receives every frame published after this call, for all keys.
    pub fn subscribe_push(&self) -> broadcast::Receiver<ImageFrame> {
        self.push_tx.subscribe()
    }

    /// Attaches a continuous-stream consumer to `key`.
    ///
    /// If a frame is already stored it becomes the first chunk, so a
    /// viewer shows something before the device produces the next frame.
    pub async fn attach_stream(self: &Arc<Self>, key: &str) -> StreamHandle {
        let id = Uuid::new_v4();

        // Holding the read lock keeps a concurrent `set_image` from storing a
        // newer frame between the initial chunk and registration.
        let frames = self.frames.read().await;
        let (tx, rx) = watch::channel(frames.get(key).map(ImageFrame::multipart_chunk));
        self.streams
            .entry(key.to_string())
            .or_default()
            .insert(id, tx);
        drop(frames);

        debug!(key, %id, "stream consumer attached");
        StreamHandle {
            id,
            key: key.to_string(),
            rx: WatchStream::new(rx),
            store: Arc::downgrade(self),
        }
    }

    /// Removes one stream consumer.  Empty key entries are discarded.
    pub fn detach_stream(&self, key: &str, id: ConsumerId) {
        let mut remove_key = false;
        if let Some(mut consumers) = self.streams.get_mut(key) {
            if consumers.remove(&id).is_some() {
                debug!(key, %id, "stream consumer detached");
            }
            remove_key = consumers.is_empty();
        }
        // The shard guard above must be released before removing the entry.
        if remove_key {
            self.streams.remove_if(key, |_, consumers| consumers.is_empty());
        }
    }

    /// Number of stream consumers attached to `key`.
    pub fn stream_consumer_count(&self, key: &str) -> usize {
        self.streams.get(key).map(|c| c.len()).unwrap_or(0)
    }

    /// Number of keys with at least one stream consumer.
    pub fn streamed_key_count(&self) -> usize {
        self.streams.len()
    }

    fn fan_out_stream(&self, frame: &ImageFrame) {
        let mut dead = Vec::new();
        if let Some(consumers) = self.streams.get(&frame.key) {
            if consumers.is_empty() {
                return;
            }
            let chunk = frame.multipart_chunk();
            for (id, tx) in consumers.iter() {
                // Replaces an unread chunk; fails only once the receiver is gone.
                if tx.send(Some(chunk.clone())).is_err() {
                    dead.push(*id);
                }
            }
        }
        for id in dead {
            self.detach_stream(&frame.key, id);
        }
    }
}

// ── StreamHandle ──────────────────────────────────────────────────────────────

/// One continuous-stream consumer.  Dropping it detaches the consumer.
///
/// Implements [`Stream`] so it can back an HTTP response body directly.
pub struct StreamHandle {
    id: ConsumerId,
    key: String,
    rx: WatchStream<Option<Bytes>>,
    store: Weak<FrameStore>,
}

impl StreamHandle {
    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Stream for StreamHandle {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.rx).poll_next(cx) {
                // Empty slot: attached before the key had a frame.
                Poll::Ready(Some(None)) => continue,
                Poll::Ready(Some(Some(chunk))) => return Poll::Ready(Some(Ok(chunk))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.detach_stream(&self.key, self.id);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
