use std::any::Any;
use std::sync::Arc;

use minidom::Element;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::{ClientModule, ModuleId, RegisteredModule};
use crate::client::{WeakClient, XmppClient};
use crate::error::ClientError;
use crate::router::HandlerContext;
use crate::stanza::ns;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceKind {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Error,
    Other(String),
}

impl PresenceKind {
    fn from_type(value: Option<&str>) -> Self {
        match value {
            None => PresenceKind::Available,
            Some("unavailable") => PresenceKind::Unavailable,
            Some("subscribe") => PresenceKind::Subscribe,
            Some("subscribed") => PresenceKind::Subscribed,
            Some("unsubscribe") => PresenceKind::Unsubscribe,
            Some("unsubscribed") => PresenceKind::Unsubscribed,
            Some("error") => PresenceKind::Error,
            Some(other) => PresenceKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub from: Option<String>,
    pub kind: PresenceKind,
    pub show: Option<String>,
    pub status: Option<String>,
}

impl PresenceUpdate {
    fn from_stanza(presence: &Element) -> Self {
        let child_text = |name: &str| {
            presence
                .get_child(name, ns::JABBER_CLIENT)
                .map(Element::text)
        };
        Self {
            from: presence.attr("from").map(str::to_string),
            kind: PresenceKind::from_type(presence.attr("type")),
            show: child_text("show"),
            status: child_text("status"),
        }
    }
}

/// Broadcasts our own availability and reports everyone else's.
pub struct PresenceModule {
    client: Mutex<Option<WeakClient>>,
    events: broadcast::Sender<PresenceUpdate>,
}

impl PresenceModule {
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.events.subscribe()
    }

    pub fn send_available(&self, show: Option<&str>, status: Option<&str>) -> Result<(), ClientError> {
        let mut presence = Element::builder("presence", ns::JABBER_CLIENT);
        if let Some(show) = show {
            presence =
                presence.append(Element::builder("show", ns::JABBER_CLIENT).append(show.to_string()));
        }
        if let Some(status) = status {
            presence = presence
                .append(Element::builder("status", ns::JABBER_CLIENT).append(status.to_string()));
        }
        self.client()?.send_stanza(presence.build())
    }

    pub fn send_unavailable(&self) -> Result<(), ClientError> {
        let presence = Element::builder("presence", ns::JABBER_CLIENT)
            .attr("type", "unavailable")
            .build();
        self.client()?.send_stanza(presence)
    }

    fn client(&self) -> Result<XmppClient, ClientError> {
        self.client
            .lock()
            .as_ref()
            .and_then(WeakClient::upgrade)
            .ok_or(ClientError::TransportUnavailable)
    }
}

impl std::fmt::Debug for PresenceModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceModule")
            .field("installed", &self.client.lock().is_some())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl ClientModule for PresenceModule {
    fn install(&self, client: &XmppClient) -> Result<(), ClientError> {
        *self.client.lock() = Some(client.downgrade());

        let events = self.events.clone();
        client
            .router()
            .register_fn("presence", move |_ctx: &HandlerContext<'_>, stanza: &Element| {
                let _ = events.send(PresenceUpdate::from_stanza(stanza));
            });
        Ok(())
    }

    fn uninstall(&self, client: &XmppClient) {
        client.router().unregister_handler("presence");
        self.client.lock().take();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl RegisteredModule for PresenceModule {
    const ID: ModuleId = ModuleId("presence");

    fn create() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            client: Mutex::new(None),
            events,
        }
    }
}
