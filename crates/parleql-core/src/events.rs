//! Per-ticket event bus.
//!
//! Every stage transition publishes one [`EventRecord`]. Subscribers get
//! the full history replayed first (so the `received` frame is always the
//! first thing a late subscriber sees) and then live frames in
//! publication order. Nothing is dropped: a slow subscriber buffers, it
//! does not lose frames. A terminal state closes the channel; a
//! subscriber that disconnects before the terminal frame triggers the
//! ticket's cancellation callback.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{EventRecord, QueryState};

/// Ticket metadata kept alongside the stream.
#[derive(Debug, Clone, Default)]
pub struct TicketMetadata {
    /// Owning user.
    pub owner_user: String,
    /// Owner's role.
    pub owner_role: String,
    /// Session the ticket was created in.
    pub session_id: String,
    /// Backend the ticket targets.
    pub database_kind: String,
    /// Client IP at submission.
    pub ip: String,
    /// Client user agent at submission.
    pub user_agent: String,
}

struct Channel {
    metadata: TicketMetadata,
    cancel: CancellationToken,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    history: Vec<EventRecord>,
    subscribers: Vec<mpsc::UnboundedSender<EventRecord>>,
    terminal: bool,
}

/// A live subscription: frames in order, starting with the replayed
/// history. Dropping it before the terminal frame cancels the ticket.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<EventRecord>,
    cancel: CancellationToken,
    saw_terminal: bool,
}

impl Subscription {
    /// Next frame, `None` once the terminal frame has been delivered and
    /// the channel closed.
    pub async fn next(&mut self) -> Option<EventRecord> {
        let record = self.receiver.recv().await?;
        if record.state.is_terminal() {
            self.saw_terminal = true;
        }
        Some(record)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.saw_terminal {
            debug!("subscriber disconnected before terminal frame; cancelling ticket");
            self.cancel.cancel();
        }
    }
}

/// The event bus.
#[derive(Default)]
pub struct EventBus {
    channels: DashMap<String, Arc<Channel>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ticket and its cancellation token. Idempotent.
    pub fn register(&self, ticket_id: &str, metadata: TicketMetadata, cancel: CancellationToken) {
        self.channels
            .entry(ticket_id.to_string())
            .or_insert_with(|| {
                Arc::new(Channel {
                    metadata,
                    cancel,
                    state: Mutex::new(ChannelState {
                        history: Vec::new(),
                        subscribers: Vec::new(),
                        terminal: false,
                    }),
                })
            });
    }

    /// Publish a state transition.
    ///
    /// Frames after a terminal frame are ignored (the stream contract
    /// promises exactly one terminal frame).
    pub fn publish(&self, ticket_id: &str, state: QueryState, payload: JsonValue) {
        let Some(channel) = self.channels.get(ticket_id).map(|c| Arc::clone(&c)) else {
            debug!(ticket_id, "publish on unregistered ticket ignored");
            return;
        };
        let record = EventRecord {
            ticket_id: ticket_id.to_string(),
            state,
            timestamp: Utc::now(),
            payload,
        };
        let mut guard = channel.state.lock();
        if guard.terminal {
            debug!(ticket_id, state = %state, "frame after terminal ignored");
            return;
        }
        guard.history.push(record.clone());
        guard
            .subscribers
            .retain(|sender| sender.send(record.clone()).is_ok());
        if state.is_terminal() {
            guard.terminal = true;
            // Closing the senders ends every subscription after the
            // terminal frame drains.
            guard.subscribers.clear();
        }
    }

    /// Subscribe to a ticket's stream. History replays first.
    #[must_use]
    pub fn subscribe(&self, ticket_id: &str) -> Option<Subscription> {
        let channel = self.channels.get(ticket_id).map(|c| Arc::clone(&c))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut guard = channel.state.lock();
        let mut saw_terminal = false;
        for record in &guard.history {
            if record.state.is_terminal() {
                saw_terminal = true;
            }
            let _ = sender.send(record.clone());
        }
        if !guard.terminal {
            guard.subscribers.push(sender);
        }
        Some(Subscription {
            receiver,
            cancel: channel.cancel.clone(),
            saw_terminal,
        })
    }

    /// Latest published state.
    #[must_use]
    pub fn get_state(&self, ticket_id: &str) -> Option<QueryState> {
        let channel = self.channels.get(ticket_id)?;
        let guard = channel.state.lock();
        guard.history.last().map(|r| r.state)
    }

    /// Ticket metadata, for ownership checks.
    #[must_use]
    pub fn get_metadata(&self, ticket_id: &str) -> Option<TicketMetadata> {
        self.channels.get(ticket_id).map(|c| c.metadata.clone())
    }

    /// The ticket's cancellation token.
    #[must_use]
    pub fn cancel_token(&self, ticket_id: &str) -> Option<CancellationToken> {
        self.channels.get(ticket_id).map(|c| c.cancel.clone())
    }

    /// Drop a ticket's channel after its stream is fully consumed.
    pub fn remove(&self, ticket_id: &str) {
        self.channels.remove(ticket_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus_with_ticket(id: &str) -> (EventBus, CancellationToken) {
        let bus = EventBus::new();
        let cancel = CancellationToken::new();
        bus.register(id, TicketMetadata::default(), cancel.clone());
        (bus, cancel)
    }

    #[tokio::test]
    async fn history_replays_before_live_frames() {
        let (bus, _cancel) = bus_with_ticket("q_11111111");
        bus.publish("q_11111111", QueryState::Received, json!({}));
        bus.publish("q_11111111", QueryState::Planning, json!({}));

        let mut sub = bus.subscribe("q_11111111").expect("subscription");
        bus.publish("q_11111111", QueryState::Finished, json!({"rows": 3}));

        assert_eq!(sub.next().await.expect("frame").state, QueryState::Received);
        assert_eq!(sub.next().await.expect("frame").state, QueryState::Planning);
        assert_eq!(sub.next().await.expect("frame").state, QueryState::Finished);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn exactly_one_terminal_frame() {
        let (bus, _cancel) = bus_with_ticket("q_22222222");
        bus.publish("q_22222222", QueryState::Received, json!({}));
        bus.publish("q_22222222", QueryState::Error, json!({"message": "boom"}));
        // A frame after the terminal is ignored.
        bus.publish("q_22222222", QueryState::Finished, json!({}));

        let mut sub = bus.subscribe("q_22222222").expect("subscription");
        let mut states = Vec::new();
        while let Some(record) = sub.next().await {
            states.push(record.state);
        }
        assert_eq!(states, vec![QueryState::Received, QueryState::Error]);
    }

    #[tokio::test]
    async fn disconnect_before_terminal_cancels() {
        let (bus, cancel) = bus_with_ticket("q_33333333");
        bus.publish("q_33333333", QueryState::Received, json!({}));
        {
            let mut sub = bus.subscribe("q_33333333").expect("subscription");
            let _ = sub.next().await;
            // Dropped here, before any terminal frame.
        }
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn late_subscriber_to_finished_ticket_sees_everything_without_cancel() {
        let (bus, cancel) = bus_with_ticket("q_44444444");
        bus.publish("q_44444444", QueryState::Received, json!({}));
        bus.publish("q_44444444", QueryState::Finished, json!({}));
        {
            let mut sub = bus.subscribe("q_44444444").expect("subscription");
            let mut last = None;
            while let Some(record) = sub.next().await {
                last = Some(record.state);
            }
            assert_eq!(last, Some(QueryState::Finished));
        }
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn state_and_metadata_lookup() {
        let (bus, _cancel) = bus_with_ticket("q_55555555");
        assert_eq!(bus.get_state("q_55555555"), None);
        bus.publish("q_55555555", QueryState::Received, json!({}));
        assert_eq!(bus.get_state("q_55555555"), Some(QueryState::Received));
        assert!(bus.get_metadata("q_55555555").is_some());
        assert!(bus.get_metadata("q_unknown00").is_none());
    }
}
