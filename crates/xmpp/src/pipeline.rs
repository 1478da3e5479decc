use std::sync::Arc;

use arc_swap::ArcSwap;
use minidom::Element;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::XmppClient;
use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptorResult {
    Continue,
    Reject,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaDirection {
    Incoming,
    Outgoing,
}

/// Observes, and may veto, every stanza crossing the connection.
///
/// Interceptors run on the connection task and must not block.
pub trait StanzaInterceptor: Send + Sync + 'static {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn intercept_incoming(&self, _stanza: &Element, _client: &XmppClient) -> InterceptorResult {
        InterceptorResult::Continue
    }

    fn intercept_outgoing(&self, _stanza: &Element, _client: &XmppClient) -> InterceptorResult {
        InterceptorResult::Continue
    }
}

type InterceptorList = Vec<Arc<dyn StanzaInterceptor>>;

/// Interceptor set with identity semantics.
///
/// Readers take a lock-free snapshot per stanza; writers serialize on a
/// mutex and publish a new list.
pub struct InterceptorChain {
    interceptors: ArcSwap<InterceptorList>,
    write_lock: Mutex<()>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self {
            interceptors: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns `false` if this exact interceptor is already present.
    pub fn add(&self, interceptor: Arc<dyn StanzaInterceptor>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.interceptors.load();
        if current.iter().any(|i| Arc::ptr_eq(i, &interceptor)) {
            return false;
        }

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(interceptor);
        self.interceptors.store(Arc::new(next));
        true
    }

    /// Returns `false` if the interceptor was not present.
    pub fn remove(&self, interceptor: &Arc<dyn StanzaInterceptor>) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.interceptors.load();
        if !current.iter().any(|i| Arc::ptr_eq(i, interceptor)) {
            return false;
        }

        let next: InterceptorList = current
            .iter()
            .filter(|i| !Arc::ptr_eq(i, interceptor))
            .cloned()
            .collect();
        self.interceptors.store(Arc::new(next));
        true
    }

    pub fn len(&self) -> usize {
        self.interceptors.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every interceptor; fails with [`ClientError::StanzaRejected`]
    /// if any of them vetoed the stanza.
    ///
    /// A rejection does not short-circuit: later interceptors still observe
    /// the stanza. Errors are logged and otherwise ignored.
    pub fn admit(
        &self,
        direction: StanzaDirection,
        stanza: &Element,
        client: &XmppClient,
    ) -> Result<(), ClientError> {
        let snapshot = self.interceptors.load_full();
        let mut rejected_by: Option<&str> = None;

        for interceptor in snapshot.iter() {
            let result = match direction {
                StanzaDirection::Incoming => interceptor.intercept_incoming(stanza, client),
                StanzaDirection::Outgoing => interceptor.intercept_outgoing(stanza, client),
            };
            match result {
                InterceptorResult::Continue => {}
                InterceptorResult::Reject => {
                    rejected_by.get_or_insert(interceptor.name());
                }
                InterceptorResult::Error(message) => {
                    warn!(
                        interceptor = interceptor.name(),
                        ?direction,
                        error = %message,
                        "interceptor failed"
                    );
                }
            }
        }

        match rejected_by {
            Some(name) => {
                debug!(
                    interceptor = name,
                    ?direction,
                    stanza = stanza.name(),
                    "stanza rejected"
                );
                Err(ClientError::StanzaRejected)
            }
            None => Ok(()),
        }
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new()
    }
}
