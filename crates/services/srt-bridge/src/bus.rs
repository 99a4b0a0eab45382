//! In-process media bus
//!
//! Publishers announce a stream by name and push [`MediaEvent`]s into it;
//! subscribers are [`MediaHandler`]s attached to a name. The bus lives in the
//! media context and is never shared across threads.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

use crate::media::{MediaEvent, MediaHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("stream '{0}' is already published")]
    AlreadyPublished(String),

    #[error("stream '{0}' is not published")]
    NotPublished(String),

    #[error("unknown subscriber {0}")]
    UnknownSubscriber(SubscriberId),
}

struct Subscriber {
    stream: String,
    handler: Box<dyn MediaHandler>,
}

#[derive(Default)]
pub struct MediaBus {
    published: HashSet<String>,
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    next_id: u64,
}

impl MediaBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_published(&self, stream: &str) -> bool {
        self.published.contains(stream)
    }

    pub fn subscriber_count(&self, stream: &str) -> usize {
        self.subscribers
            .values()
            .filter(|s| s.stream == stream)
            .count()
    }

    pub fn publish(&mut self, stream: &str) -> Result<(), BusError> {
        if !self.published.insert(stream.to_string()) {
            return Err(BusError::AlreadyPublished(stream.to_string()));
        }
        tracing::info!(stream = %stream, "stream published");
        for subscriber in self.matching(stream) {
            subscriber.handler.on_publish(stream);
        }
        Ok(())
    }

    pub fn unpublish(&mut self, stream: &str) -> Result<(), BusError> {
        if !self.published.remove(stream) {
            return Err(BusError::NotPublished(stream.to_string()));
        }
        tracing::info!(stream = %stream, "stream unpublished");
        for subscriber in self.matching(stream) {
            subscriber.handler.on_unpublish(stream);
        }
        Ok(())
    }

    /// Attach a handler to `stream`; the stream need not be published yet
    pub fn subscribe(&mut self, stream: &str, mut handler: Box<dyn MediaHandler>) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        handler.on_subscribe(stream);
        tracing::debug!(stream = %stream, subscriber = %id, "subscribed");
        self.subscribers.insert(
            id,
            Subscriber {
                stream: stream.to_string(),
                handler,
            },
        );
        id
    }

    /// Detach a handler and hand it back
    pub fn unsubscribe(&mut self, id: SubscriberId) -> Result<Box<dyn MediaHandler>, BusError> {
        let mut subscriber = self
            .subscribers
            .remove(&id)
            .ok_or(BusError::UnknownSubscriber(id))?;
        subscriber.handler.on_unsubscribe(&subscriber.stream);
        tracing::debug!(stream = %subscriber.stream, subscriber = %id, "unsubscribed");
        Ok(subscriber.handler)
    }

    /// Deliver one event to every subscriber of `stream`; returns how many
    /// handlers saw it
    pub fn dispatch(&mut self, stream: &str, event: &MediaEvent) -> Result<usize, BusError> {
        if !self.published.contains(stream) {
            return Err(BusError::NotPublished(stream.to_string()));
        }
        let mut delivered = 0;
        for subscriber in self.matching(stream) {
            subscriber.handler.on_event(event);
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Tell every subscriber of `stream` that its source peer changed
    pub fn address_changed(&mut self, stream: &str, old: SocketAddr, new: SocketAddr) {
        tracing::info!(stream = %stream, %old, %new, "publisher address changed");
        for subscriber in self.matching(stream) {
            subscriber.handler.on_address_changed(old, new);
        }
    }

    /// First subscriber reporting a fatal failure, with its stream and reason
    pub fn failed_subscriber(&self) -> Option<(SubscriberId, &str, String)> {
        self.subscribers.iter().find_map(|(id, s)| {
            s.handler
                .failure()
                .map(|reason| (*id, s.stream.as_str(), reason))
        })
    }

    /// Unpublish every stream and detach every subscriber
    pub fn shutdown(&mut self) -> Vec<Box<dyn MediaHandler>> {
        let mut streams: Vec<String> = self.published.iter().cloned().collect();
        streams.sort();
        for stream in streams {
            let _ = self.unpublish(&stream);
        }
        let ids: Vec<SubscriberId> = self.subscribers.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.unsubscribe(id).ok())
            .collect()
    }

    fn matching<'a>(&'a mut self, stream: &'a str) -> impl Iterator<Item = &'a mut Subscriber> {
        self.subscribers
            .values_mut()
            .filter(move |s| s.stream == stream)
    }
}

impl fmt::Debug for MediaBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaBus")
            .field("published", &self.published)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
