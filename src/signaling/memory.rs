//! In-process signaling server for tests.
//!
//! `MemoryHub` plays the server: it fans `call:*` events out to the other
//! members of a conversation and routes `webrtc:*` events to `toUserId`,
//! rewriting the address to `fromUserId`. Delivery is synchronous.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use super::router::EventRouter;
use super::{EventHandler, ListenerId, SignalTransport, TransportError};

struct Client {
    router: EventRouter,
    connected: AtomicBool,
    emitted: Mutex<Vec<(String, Value)>>,
}

#[derive(Default)]
struct HubState {
    clients: HashMap<String, Arc<Client>>,
    conversations: HashMap<String, Vec<String>>,
}

#[derive(Default)]
pub struct MemoryHub {
    state: Mutex<HubState>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_conversation(&self, conversation_id: &str, members: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.conversations.insert(
            conversation_id.to_string(),
            members.iter().map(|m| m.to_string()).collect(),
        );
    }

    /// Connect a user. The returned transport starts connected.
    pub fn join(self: &Arc<Self>, user_id: &str) -> MemoryTransport {
        let client = Arc::new(Client {
            router: EventRouter::new(),
            connected: AtomicBool::new(true),
            emitted: Mutex::new(Vec::new()),
        });
        self.state
            .lock()
            .unwrap()
            .clients
            .insert(user_id.to_string(), client.clone());
        MemoryTransport {
            user_id: user_id.to_string(),
            hub: self.clone(),
            client,
        }
    }

    fn deliver(&self, to: &str, event: &str, payload: &Value) {
        let client = self.state.lock().unwrap().clients.get(to).cloned();
        match client {
            Some(c) if c.connected.load(Ordering::SeqCst) => {
                c.router.dispatch(event, payload);
            }
            _ => tracing::debug!("hub: {} not connected, dropping {}", to, event),
        }
    }

    fn others(&self, conversation_id: &str, me: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .conversations
            .get(conversation_id)
            .map(|members| members.iter().filter(|m| *m != me).cloned().collect())
            .unwrap_or_default()
    }

    fn route(&self, from: &str, event: &str, payload: &Value) {
        let conversation_id = payload["conversationId"].as_str().unwrap_or_default();
        let fan_out = |name: &str, body: Value| {
            for to in self.others(conversation_id, from) {
                self.deliver(&to, name, &body);
            }
        };

        match event {
            "call:invite" => fan_out(
                "call:ring",
                json!({
                    "conversationId": conversation_id,
                    "fromUserId": from,
                    "media": payload["media"],
                }),
            ),
            "call:accept" => fan_out(
                "call:accepted",
                json!({"conversationId": conversation_id, "userId": from}),
            ),
            "call:reject" => fan_out(
                "call:rejected",
                json!({"conversationId": conversation_id, "userId": from}),
            ),
            "call:end" => fan_out(
                "call:ended",
                json!({"conversationId": conversation_id, "userId": from}),
            ),
            "webrtc:offer" | "webrtc:answer" | "webrtc:candidate" => {
                let Some(to) = payload["toUserId"].as_str() else {
                    return;
                };
                let mut body = payload.clone();
                if let Some(obj) = body.as_object_mut() {
                    obj.remove("toUserId");
                    obj.insert("fromUserId".into(), Value::String(from.to_string()));
                }
                self.deliver(to, event, &body);
            }
            other => tracing::debug!("hub: unrouted event {}", other),
        }
    }
}

/// One user's connection to a `MemoryHub`.
#[derive(Clone)]
pub struct MemoryTransport {
    user_id: String,
    hub: Arc<MemoryHub>,
    client: Arc<Client>,
}

impl MemoryTransport {
    /// A transport on its own hub, for single-sided tests.
    pub fn standalone(user_id: &str) -> Self {
        MemoryHub::new().join(user_id)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn set_connected(&self, connected: bool) {
        self.client.connected.store(connected, Ordering::SeqCst);
    }

    /// Everything this client emitted successfully, in order.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.client.emitted.lock().unwrap().clone()
    }

    pub fn emitted_events(&self) -> Vec<String> {
        self.emitted().into_iter().map(|(e, _)| e).collect()
    }

    /// Deliver an event to this client as if the server had sent it.
    pub fn inject(&self, event: &str, payload: Value) -> usize {
        self.client.router.dispatch(event, &payload)
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.client.router.handler_count(event)
    }
}

impl SignalTransport for MemoryTransport {
    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.client
            .emitted
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));
        self.hub.route(&self.user_id, event, &payload);
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) -> ListenerId {
        self.client.router.on(event, handler)
    }

    fn off(&self, event: &str, id: ListenerId) -> bool {
        self.client.router.off(event, id)
    }

    fn is_connected(&self) -> bool {
        self.client.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(t: &MemoryTransport, event: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        t.on(
            event,
            Arc::new(move |v: &Value| s.lock().unwrap().push(v.clone())),
        );
        seen
    }

    #[test]
    fn test_invite_becomes_ring_for_other_members() {
        let hub = MemoryHub::new();
        hub.add_conversation("c1", &["alice", "bob"]);
        let alice = hub.join("alice");
        let bob = hub.join("bob");
        let alice_rings = recorder(&alice, "call:ring");
        let bob_rings = recorder(&bob, "call:ring");

        alice
            .emit("call:invite", json!({"conversationId": "c1", "media": "video"}))
            .unwrap();

        assert!(alice_rings.lock().unwrap().is_empty());
        let rings = bob_rings.lock().unwrap();
        assert_eq!(rings.len(), 1);
        assert_eq!(rings[0]["fromUserId"], "alice");
        assert_eq!(rings[0]["media"], "video");
    }

    #[test]
    fn test_webrtc_routed_to_addressee() {
        let hub = MemoryHub::new();
        hub.add_conversation("c1", &["alice", "bob"]);
        let alice = hub.join("alice");
        let bob = hub.join("bob");
        let offers = recorder(&bob, "webrtc:offer");

        alice
            .emit(
                "webrtc:offer",
                json!({"conversationId": "c1", "toUserId": "bob", "sdp": {"type": "offer", "sdp": "v=0"}}),
            )
            .unwrap();

        let offers = offers.lock().unwrap();
        assert_eq!(offers[0]["fromUserId"], "alice");
        assert!(offers[0].get("toUserId").is_none());
    }

    #[test]
    fn test_disconnected_emit_fails() {
        let t = MemoryTransport::standalone("alice");
        t.set_connected(false);
        assert!(t.emit("call:end", json!({"conversationId": "c"})).is_err());
        assert!(t.emitted().is_empty());
    }
}
