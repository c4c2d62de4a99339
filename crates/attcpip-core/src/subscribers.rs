//! Fan-out of events and telemetry to subscribers.

use crate::connection::DisconnectReason;
use attcpip_protocol::{Event, TelemetryFrame};
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Item delivered to event subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum EventNotice {
    Event(Event),
    Disconnected(DisconnectReason),
}

/// Receiving end of an event subscription. Unbounded, nothing is dropped.
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<EventNotice>,
}

impl EventSubscription {
    /// Next notice, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EventNotice> {
        self.rx.recv().await
    }

    /// Next notice if one is already queued.
    pub fn try_recv(&mut self) -> Option<EventNotice> {
        self.rx.try_recv().ok()
    }
}

/// Ordered list of event subscribers.
///
/// Each event is delivered once to every current subscriber, in
/// subscription order. Closed subscriptions are pruned on publish.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<EventNotice>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        EventSubscription { rx }
    }

    /// Deliver an event. Returns how many subscribers got it.
    pub fn publish(&self, event: Event) -> usize {
        self.send(EventNotice::Event(event))
    }

    /// Tell every subscriber the connection is gone.
    pub fn disconnected(&self, reason: DisconnectReason) -> usize {
        self.send(EventNotice::Disconnected(reason))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn send(&self, notice: EventNotice) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
        subscribers.len()
    }
}

/// Item delivered to telemetry subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryNotice {
    Frame(TelemetryFrame),
    Disconnected(DisconnectReason),
}

/// Receiving end of a telemetry subscription.
///
/// A subscriber that falls behind loses the oldest frames and keeps
/// receiving the newest ones.
pub struct TelemetrySubscription {
    rx: broadcast::Receiver<TelemetryNotice>,
}

impl TelemetrySubscription {
    /// Next notice, skipping over frames lost to lag.
    pub async fn recv(&mut self) -> Option<TelemetryNotice> {
        loop {
            match self.rx.recv().await {
                Ok(notice) => return Some(notice),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Telemetry subscriber lagging, dropped oldest frames");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Telemetry distribution with an optional topic allow-list.
pub struct TelemetrySink {
    tx: broadcast::Sender<TelemetryNotice>,
    known_topics: HashSet<String>,
    unknown_seen: Mutex<HashSet<String>>,
}

impl TelemetrySink {
    /// `known_topics` empty accepts every topic.
    pub fn new(capacity: usize, known_topics: impl IntoIterator<Item = String>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            known_topics: known_topics.into_iter().collect(),
            unknown_seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn subscribe(&self) -> TelemetrySubscription {
        TelemetrySubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Deliver a frame. Frames on unknown topics are dropped, logged once
    /// per topic. Returns whether the frame was accepted.
    pub fn publish(&self, frame: TelemetryFrame) -> bool {
        if !self.known_topics.is_empty() && !self.known_topics.contains(&frame.topic) {
            if self.unknown_seen.lock().insert(frame.topic.clone()) {
                info!(topic = %frame.topic, "Ignoring unknown telemetry topic");
            }
            return false;
        }
        // No receivers is fine; telemetry is not retained.
        let _ = self.tx.send(TelemetryNotice::Frame(frame));
        true
    }

    pub fn disconnected(&self, reason: DisconnectReason) {
        let _ = self.tx.send(TelemetryNotice::Disconnected(reason));
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
