//! Live feed events
//!
//! Every write to the feed publishes a `FeedEvent` on a broadcast channel.
//! Subscribers (the SSE listener endpoint) receive the event and keep their
//! copy of the feed current without polling. Events are not stored: a
//! subscriber that falls behind is told to resync and refetch the feed.

use actix_web::web::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::broadcast::{self, error::RecvError};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedEventType {
    Snapshot,
    PostCreated,
    PostUpdated,
    PostDeleted,
    CommentCreated,
    CommentDeleted,
    ImageUploaded,
    ImageDeleted,
    Resync,
}

impl FeedEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedEventType::Snapshot => "snapshot",
            FeedEventType::PostCreated => "post_created",
            FeedEventType::PostUpdated => "post_updated",
            FeedEventType::PostDeleted => "post_deleted",
            FeedEventType::CommentCreated => "comment_created",
            FeedEventType::CommentDeleted => "comment_deleted",
            FeedEventType::ImageUploaded => "image_uploaded",
            FeedEventType::ImageDeleted => "image_deleted",
            FeedEventType::Resync => "resync",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedEvent {
    #[serde(rename = "type")]
    pub event_type: FeedEventType,
    pub resource_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl FeedEvent {
    pub fn new<T: Serialize>(event_type: FeedEventType, resource_id: Option<&str>, payload: &T) -> Self {
        Self {
            event_type,
            resource_id: resource_id.map(String::from),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn resync(missed: u64) -> Self {
        Self::new(
            FeedEventType::Resync,
            None,
            &serde_json::json!({ "missed": missed }),
        )
    }

    /// Encode as one Server-Sent Events frame
    pub fn to_sse(&self) -> Bytes {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Bytes::from(format!("event: {}\ndata: {}\n\n", self.event_type.as_str(), data))
    }
}

/// Fan-out point for feed changes
pub struct FeedHub {
    sender: broadcast::Sender<FeedEvent>,
}

impl FeedHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send an event to every current subscriber
    pub fn publish(&self, event: FeedEvent) {
        let event_type = event.event_type;
        match self.sender.send(event) {
            Ok(n) => log::debug!("Published {} to {} listener(s)", event_type.as_str(), n),
            Err(_) => log::debug!("Published {} with no listeners", event_type.as_str()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(64)
    }
}

enum StreamState {
    Initial(FeedEvent, broadcast::Receiver<FeedEvent>),
    Live(broadcast::Receiver<FeedEvent>),
}

/// SSE body: the initial snapshot, then every published event
pub fn event_stream(
    initial: FeedEvent,
    receiver: broadcast::Receiver<FeedEvent>,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold(StreamState::Initial(initial, receiver), |state| async move {
        match state {
            StreamState::Initial(event, rx) => Some((Ok(event.to_sse()), StreamState::Live(rx))),
            StreamState::Live(mut rx) => match rx.recv().await {
                Ok(event) => Some((Ok(event.to_sse()), StreamState::Live(rx))),
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Feed listener lagged by {} event(s)", missed);
                    Some((Ok(FeedEvent::resync(missed).to_sse()), StreamState::Live(rx)))
                }
                Err(RecvError::Closed) => None,
            },
        }
    })
}
