use std::sync::Arc;

use dashmap::DashMap;
use minidom::Element;
use tracing::trace;

use crate::client::XmppClient;
use crate::connection::IoHandle;
use crate::error::ClientError;
use crate::stanza::qualified_name;

/// What a handler sees while a stanza is being dispatched.
pub struct HandlerContext<'a> {
    client: &'a XmppClient,
    io: &'a IoHandle,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(client: &'a XmppClient, io: &'a IoHandle) -> Self {
        Self { client, io }
    }

    pub fn client(&self) -> &XmppClient {
        self.client
    }

    /// Queues a stanza on the connection that delivered this one.
    pub fn send(&self, stanza: Element) -> Result<(), ClientError> {
        self.io.send(stanza)
    }

    pub(crate) fn io(&self) -> &IoHandle {
        self.io
    }
}

/// Reacts to inbound stanzas of one qualified name.
///
/// Handlers run synchronously on the connection task.
pub trait StanzaHandler: Send + Sync + 'static {
    fn handle(&self, ctx: &HandlerContext<'_>, stanza: &Element);
}

struct FnHandler<F>(F);

impl<F> StanzaHandler for FnHandler<F>
where
    F: Fn(&HandlerContext<'_>, &Element) + Send + Sync + 'static,
{
    fn handle(&self, ctx: &HandlerContext<'_>, stanza: &Element) {
        (self.0)(ctx, stanza)
    }
}

/// Maps qualified stanza names to their single handler.
#[derive(Default)]
pub struct StanzaRouter {
    handlers: DashMap<String, Arc<dyn StanzaHandler>>,
}

impl StanzaRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `handler` for `name`, replacing any previous one.
    ///
    /// Returns `true` if a handler was replaced.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn StanzaHandler>) -> bool {
        self.handlers.insert(name.into(), handler).is_some()
    }

    pub fn register_fn<F>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(&HandlerContext<'_>, &Element) + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(FnHandler(handler)))
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn unregister_all(&self) {
        self.handlers.clear();
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invokes the handler registered for the stanza's qualified name.
    ///
    /// Returns `false` when no handler is registered. The table is not
    /// locked while the handler runs, so handlers may register others.
    pub fn dispatch(&self, ctx: &HandlerContext<'_>, stanza: &Element) -> bool {
        let name = qualified_name(stanza);
        let handler = self.handlers.get(&name).map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => {
                handler.handle(ctx, stanza);
                true
            }
            None => {
                trace!(stanza = %name, "no handler registered");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::stanza::ns;

    fn features() -> Element {
        Element::builder("features", ns::STREAM).build()
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let client = XmppClient::new();
        let (io, _commands) = IoHandle::detached();
        let ctx = HandlerContext::new(&client, &io);
        let router = StanzaRouter::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        assert!(!router.register_fn("stream:features", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&second);
        assert!(router.register_fn("stream:features", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(router.dispatch(&ctx, &features()));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_handler_is_not_an_error() {
        let client = XmppClient::new();
        let (io, _commands) = IoHandle::detached();
        let ctx = HandlerContext::new(&client, &io);
        let router = StanzaRouter::new();

        let message = Element::builder("message", ns::JABBER_CLIENT).build();
        assert!(!router.dispatch(&ctx, &message));
    }

    #[tokio::test]
    async fn handler_may_reregister_during_dispatch() {
        let client = XmppClient::new();
        let (io, _commands) = IoHandle::detached();
        let ctx = HandlerContext::new(&client, &io);
        let router = Arc::new(StanzaRouter::new());

        let inner = Arc::clone(&router);
        router.register_fn("stream:features", move |_, _| {
            inner.register_fn("stream:features", |_, _| {});
        });

        assert!(router.dispatch(&ctx, &features()));
        assert!(router.has_handler("stream:features"));
    }

    #[test]
    fn unregister_all_clears_table() {
        let router = StanzaRouter::new();
        router.register_fn("iq", |_, _| {});
        router.register_fn("message", |_, _| {});
        assert!(router.unregister_handler("iq"));
        assert!(!router.unregister_handler("iq"));

        router.unregister_all();
        assert!(router.is_empty());
    }
}
