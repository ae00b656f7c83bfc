use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{config::LogSettings, instance::InstanceId};

use super::{LogLine, RingBuffer};

/// Per-instance line buffers with live fan-out to subscribers.
///
/// Appends never wait on subscribers: each subscriber owns a bounded queue and
/// lines that do not fit are dropped for that subscriber only.
#[derive(Debug, Clone)]
pub struct LogBroadcaster {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    settings: LogSettings,
    channels: Mutex<HashMap<InstanceId, Arc<Mutex<Channel>>>>,
}

#[derive(Debug)]
struct Channel {
    ring: RingBuffer<LogLine>,
    next_seq: u64,
    subscribers: HashMap<Uuid, Subscriber>,
}

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<LogLine>,
    dropped: u64,
}

/// Identifies one live subscription for [`LogBroadcaster::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub instance: InstanceId,
    pub id: Uuid,
}

/// Stream of lines for one subscriber: the requested backlog first, then live lines.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    stream: ReceiverStream<LogLine>,
}

impl Subscription {
    pub fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Next line, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<LogLine> {
        self.stream.next().await
    }
}

impl Stream for Subscription {
    type Item = LogLine;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LogBroadcaster {
    pub fn new(settings: LogSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &LogSettings {
        &self.inner.settings
    }

    fn channel(&self, id: &InstanceId) -> Arc<Mutex<Channel>> {
        let mut channels = lock(&self.inner.channels);
        channels
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Channel {
                    ring: RingBuffer::new(self.inner.settings.buffer_capacity),
                    next_seq: 0,
                    subscribers: HashMap::new(),
                }))
            })
            .clone()
    }

    /// Buffers a line and hands it to every live subscriber. Returns the stored line.
    pub fn append(&self, mut line: LogLine) -> LogLine {
        let channel = self.channel(&line.instance);
        let mut channel = lock(&channel);

        line.seq = channel.next_seq;
        channel.next_seq += 1;
        channel.ring.push(line.clone());

        channel.subscribers.retain(|id, sub| match sub.tx.try_send(line.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                sub.dropped += 1;
                debug!(
                    instance = %line.instance,
                    subscriber = %id,
                    dropped = sub.dropped,
                    "subscriber lagging, line dropped"
                );
                true
            }
            Err(TrySendError::Closed(_)) => {
                trace!(instance = %line.instance, subscriber = %id, "subscriber gone");
                false
            }
        });

        line
    }

    /// Subscribes with the configured default backlog.
    pub fn subscribe(&self, id: &InstanceId) -> Subscription {
        self.subscribe_with_backlog(id, self.inner.settings.subscribe_backlog)
    }

    /// Subscribes, first delivering the last `backlog` buffered lines.
    pub fn subscribe_with_backlog(&self, id: &InstanceId, backlog: usize) -> Subscription {
        let channel = self.channel(id);
        let mut channel = lock(&channel);

        let queue = self.inner.settings.subscriber_capacity.max(backlog).max(1);
        let (tx, rx) = mpsc::channel(queue);
        for line in channel.ring.last(backlog) {
            // Queue is at least `backlog` deep, so this cannot fail.
            let _ = tx.try_send(line);
        }

        let handle = SubscriptionHandle {
            instance: id.clone(),
            id: Uuid::new_v4(),
        };
        channel
            .subscribers
            .insert(handle.id, Subscriber { tx, dropped: 0 });

        debug!(instance = %id, subscriber = %handle.id, backlog, "subscribed to logs");

        Subscription {
            handle,
            stream: ReceiverStream::new(rx),
        }
    }

    /// Ends a subscription; its stream finishes after draining queued lines.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let channel = self.channel(&handle.instance);
        let removed = lock(&channel).subscribers.remove(&handle.id).is_some();
        if removed {
            debug!(instance = %handle.instance, subscriber = %handle.id, "unsubscribed from logs");
        }
        removed
    }

    /// The last `n` buffered lines in arrival order.
    pub fn recent(&self, id: &InstanceId, n: usize) -> Vec<LogLine> {
        let channel = self.channel(id);
        let lines = lock(&channel).ring.last(n);
        lines
    }

    pub fn subscriber_count(&self, id: &InstanceId) -> usize {
        let channel = self.channel(id);
        let count = lock(&channel)
            .subscribers
            .values()
            .filter(|sub| !sub.tx.is_closed())
            .count();
        count
    }
}
