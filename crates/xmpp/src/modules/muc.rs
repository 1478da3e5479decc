//! Multi-user chat: joining rooms and receiving groupchat messages.

use std::any::Any;
use std::sync::Arc;

use dashmap::DashMap;
use jid::Jid;
use minidom::Element;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ClientModule, ModuleId, RegisteredModule};
use crate::client::{WeakClient, XmppClient};
use crate::error::ClientError;
use crate::router::HandlerContext;
use crate::stanza::ns;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MucMessage {
    /// Bare room address
    pub room: String,
    /// Occupant nickname, absent for messages from the room itself
    pub nickname: Option<String>,
    pub body: String,
}

impl MucMessage {
    fn from_stanza(message: &Element) -> Option<Self> {
        if message.attr("type") != Some("groupchat") {
            return None;
        }
        let from: Jid = message.attr("from")?.parse().ok()?;
        let body = message.get_child("body", ns::JABBER_CLIENT)?.text();
        Some(Self {
            room: from.to_bare().to_string(),
            nickname: from.resource().map(|r| r.to_string()),
            body,
        })
    }
}

fn occupant_jid(room: &str, nickname: &str) -> Result<Jid, ClientError> {
    let raw = format!("{room}/{nickname}");
    raw.parse()
        .map_err(|e: jid::Error| ClientError::InvalidJid(format!("{raw}: {e}")))
}

pub struct MucModule {
    client: Mutex<Option<WeakClient>>,
    /// room -> nickname we joined with
    rooms: DashMap<String, String>,
    events: broadcast::Sender<MucMessage>,
}

impl MucModule {
    pub fn subscribe(&self) -> broadcast::Receiver<MucMessage> {
        self.events.subscribe()
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn join_room(&self, room: &str, nickname: &str) -> Result<(), ClientError> {
        let occupant = occupant_jid(room, nickname)?;
        let presence = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("to", occupant.to_string())
            .append(Element::builder("x", ns::MUC))
            .build();
        self.client()?.send_stanza(presence)?;
        self.rooms.insert(room.to_string(), nickname.to_string());
        Ok(())
    }

    pub fn leave_room(&self, room: &str) -> Result<(), ClientError> {
        let Some((_, nickname)) = self.rooms.remove(room) else {
            return Ok(());
        };
        let occupant = occupant_jid(room, &nickname)?;
        let presence = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("to", occupant.to_string())
            .attr("type", "unavailable")
            .build();
        self.client()?.send_stanza(presence)
    }

    pub fn send_room_message(&self, room: &str, body: &str) -> Result<(), ClientError> {
        let message = Element::builder("message", ns::JABBER_CLIENT)
            .attr("to", room)
            .attr("type", "groupchat")
            .append(Element::builder("body", ns::JABBER_CLIENT).append(body.to_string()))
            .build();
        self.client()?.send_stanza(message)
    }

    fn client(&self) -> Result<XmppClient, ClientError> {
        self.client
            .lock()
            .as_ref()
            .and_then(WeakClient::upgrade)
            .ok_or(ClientError::TransportUnavailable)
    }
}

impl std::fmt::Debug for MucModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MucModule")
            .field("rooms", &self.joined_rooms())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl ClientModule for MucModule {
    fn install(&self, client: &XmppClient) -> Result<(), ClientError> {
        *self.client.lock() = Some(client.downgrade());

        let events = self.events.clone();
        client
            .router()
            .register_fn("message", move |_ctx: &HandlerContext<'_>, stanza: &Element| {
                if let Some(message) = MucMessage::from_stanza(stanza) {
                    debug!(room = %message.room, "groupchat message");
                    // No subscribers is fine.
                    let _ = events.send(message);
                }
            });
        Ok(())
    }

    fn uninstall(&self, client: &XmppClient) {
        client.router().unregister_handler("message");
        self.rooms.clear();
        self.client.lock().take();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl RegisteredModule for MucModule {
    const ID: ModuleId = ModuleId("muc");

    fn create() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client: Mutex::new(None),
            rooms: DashMap::new(),
            events,
        }
    }
}
