//! Pure routing of rumqttc events and acknowledgement tracking
//!
//! rumqttc assigns packet ids inside the event loop, after the request has
//! left the client. [`AckTracker`] bridges that gap: a waiter is queued per
//! request kind when the request is enqueued, bound to its packet id when the
//! matching `Outgoing` event appears, and resolved when the broker's ack
//! arrives.

use rumqttc::Outgoing;
use rumqttc::v5::Event;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged { session_present: bool },
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker closed the session
    Disconnected,
    /// Broker acknowledged a publish (PubAck for QoS 1, PubComp for QoS 2)
    PublishAcknowledged { pkid: u16 },
    /// SubAck; `rejected` lists the reason codes of refused filters
    SubscriptionAcknowledged { pkid: u16, rejected: Vec<String> },
    UnsubscriptionAcknowledged { pkid: u16 },
    /// Client wrote a request carrying a packet id
    RequestSent { kind: AckKind, pkid: u16 },
    /// Client wrote its DISCONNECT packet
    DisconnectSent,
    /// Keep-alive traffic and other packets with no effect on state
    Infrastructure(String),
}

/// Route MQTT event to the appropriate reaction (pure routing decision)
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                session_present: connack.session_present,
            },
            Packet::Publish(publish) => EventRoute::MessageReceived {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
                retain: publish.retain,
            },
            Packet::Disconnect(_) => EventRoute::Disconnected,
            Packet::PubAck(puback) => EventRoute::PublishAcknowledged { pkid: puback.pkid },
            Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged { pkid: pubcomp.pkid },
            Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                pkid: suback.pkid,
                rejected: suback
                    .return_codes
                    .iter()
                    .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
                    .map(|code| format!("{code:?}"))
                    .collect(),
            },
            Packet::UnsubAck(unsuback) => {
                EventRoute::UnsubscriptionAcknowledged { pkid: unsuback.pkid }
            }
            other => EventRoute::Infrastructure(format!("{other:?}")),
        },
        Event::Outgoing(outgoing) => match outgoing {
            Outgoing::Publish(pkid) => EventRoute::RequestSent {
                kind: AckKind::Publish,
                pkid: *pkid,
            },
            Outgoing::Subscribe(pkid) => EventRoute::RequestSent {
                kind: AckKind::Subscribe,
                pkid: *pkid,
            },
            Outgoing::Unsubscribe(pkid) => EventRoute::RequestSent {
                kind: AckKind::Unsubscribe,
                pkid: *pkid,
            },
            Outgoing::Disconnect => EventRoute::DisconnectSent,
            other => EventRoute::Infrastructure(format!("{other:?}")),
        },
    }
}

/// Request kinds that complete with a broker acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

impl AckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckKind::Publish => "publish",
            AckKind::Subscribe => "subscribe",
            AckKind::Unsubscribe => "unsubscribe",
        }
    }
}

/// Outcome delivered to a waiter; `Err` carries the broker's refusal
pub type AckOutcome = Result<(), String>;

#[derive(Debug, Default)]
struct AckState {
    queued: HashMap<AckKind, VecDeque<oneshot::Sender<AckOutcome>>>,
    inflight: HashMap<(AckKind, u16), oneshot::Sender<AckOutcome>>,
}

/// Correlates client requests with broker acknowledgements
///
/// Callers must register a waiter while holding the same lock they use to
/// enqueue the request, so queue order equals wire order.
#[derive(Debug, Default)]
pub struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a waiter for the next request of `kind`
    pub fn register(&self, kind: AckKind) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut state) = self.state.lock() {
            state.queued.entry(kind).or_default().push_back(tx);
        }
        rx
    }

    /// Bind the oldest queued waiter of `kind` to `pkid`
    ///
    /// A packet id already in flight is a retransmission after reconnect and
    /// leaves the queue untouched. Packet id 0 means QoS 0: nothing will be
    /// acknowledged, so the waiter completes immediately.
    pub fn on_request_sent(&self, kind: AckKind, pkid: u16) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if pkid != 0 && state.inflight.contains_key(&(kind, pkid)) {
            return;
        }
        let Some(waiter) = state.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return;
        };
        if pkid == 0 {
            let _ = waiter.send(Ok(()));
        } else {
            state.inflight.insert((kind, pkid), waiter);
        }
    }

    /// Withdraw the newest queued waiter of `kind`
    ///
    /// For a request that never reached the event loop; must run under the
    /// same lock as the matching [`AckTracker::register`].
    pub fn cancel_last(&self, kind: AckKind) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(queue) = state.queued.get_mut(&kind) {
                queue.pop_back();
            }
        }
    }

    /// Complete the waiter bound to `pkid`
    pub fn resolve(&self, kind: AckKind, pkid: u16, outcome: AckOutcome) {
        let waiter = self
            .state
            .lock()
            .ok()
            .and_then(|mut state| state.inflight.remove(&(kind, pkid)));
        if let Some(waiter) = waiter {
            let _ = waiter.send(outcome);
        }
    }

    /// Drop every waiter; their receivers observe a closed channel
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.queued.clear();
            state.inflight.clear();
        }
    }

    /// Number of waiters not yet resolved
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .map(|state| {
                state.queued.values().map(VecDeque::len).sum::<usize>() + state.inflight.len()
            })
            .unwrap_or(0)
    }

    /// Apply a routed event; returns true when the event concerned a waiter
    pub fn observe(&self, route: &EventRoute) -> bool {
        match route {
            EventRoute::RequestSent { kind, pkid } => self.on_request_sent(*kind, *pkid),
            EventRoute::PublishAcknowledged { pkid } => {
                self.resolve(AckKind::Publish, *pkid, Ok(()))
            }
            EventRoute::SubscriptionAcknowledged { pkid, rejected } => {
                let outcome = if rejected.is_empty() {
                    Ok(())
                } else {
                    Err(rejected.join(", "))
                };
                self.resolve(AckKind::Subscribe, *pkid, outcome)
            }
            EventRoute::UnsubscriptionAcknowledged { pkid } => {
                self.resolve(AckKind::Unsubscribe, *pkid, Ok(()))
            }
            _ => return false,
        }
        true
    }
}
