//! The public client facade.
//!
//! [`XmppClient`] is a cheap, cloneable handle. Lifecycle calls
//! (`connect`, `login`, `disconnect`) gate on a compare-and-set of the
//! connection state and return a [`PendingOperation`] immediately; the
//! outcome arrives from the connection task.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use jid::Jid;
use minidom::Element;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::{self, IoHandle};
use crate::error::ClientError;
use crate::handshake;
use crate::modules::{ModuleCatalog, ModuleId, ModuleRegistry, RegisteredModule};
use crate::pending::{Completer, PendingOperation};
use crate::pipeline::{InterceptorChain, StanzaInterceptor};
use crate::router::StanzaRouter;
use crate::state::{ConnectionState, StateMachine};
use crate::transport::{
    Connector, RustlsUpgrader, TcpConnector, TlsUpgrader, TransportOptions, DEFAULT_TIMEOUT,
};

/// Boolean switches consulted by the handshake and transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientOption {
    /// Negotiate STARTTLS even when the server does not require it.
    EnableTls,
    /// Disable Nagle's algorithm on the TCP socket. Defaults to `true`.
    TcpNoDelay,
}

#[derive(Debug, Clone)]
pub(crate) struct Credentials {
    pub username: String,
    pub password: String,
    pub resource: Option<String>,
    /// `username@domain[/resource]`, used until the server binds a JID
    pub account: Jid,
}

fn account_jid(username: &str, domain: &str, resource: Option<&str>) -> Result<Jid, ClientError> {
    let raw = match resource {
        Some(resource) => format!("{username}@{domain}/{resource}"),
        None => format!("{username}@{domain}"),
    };
    raw.parse()
        .map_err(|e: jid::Error| ClientError::InvalidJid(format!("{raw}: {e}")))
}

/// Per-connection facts, reset by every `connect()`.
#[derive(Debug, Default)]
struct Session {
    domain: Option<String>,
    credentials: Option<Credentials>,
    bound_jid: Option<Jid>,
    secured: bool,
}

struct ClientInner {
    state: StateMachine,
    options: DashMap<ClientOption, bool>,
    session: Mutex<Session>,
    io: Mutex<Option<IoHandle>>,
    pending_login: Mutex<Option<Completer>>,
    pending_disconnect: Mutex<Option<PendingOperation>>,
    router: StanzaRouter,
    interceptors: InterceptorChain,
    modules: ModuleRegistry,
    connector: Arc<dyn Connector>,
    tls: Arc<dyn TlsUpgrader>,
    timeout: Duration,
}

#[derive(Clone)]
pub struct XmppClient {
    inner: Arc<ClientInner>,
}

/// Non-owning reference held by the connection task and by modules.
#[derive(Clone)]
pub struct WeakClient {
    inner: Weak<ClientInner>,
}

impl WeakClient {
    pub fn upgrade(&self) -> Option<XmppClient> {
        self.inner.upgrade().map(|inner| XmppClient { inner })
    }
}

impl XmppClient {
    /// A client with the TCP connector, native-root TLS and default modules.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> XmppClientBuilder {
        XmppClientBuilder::default()
    }

    pub fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner
            .state
            .current()
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Opens the transport to `host:port` for the XMPP `domain`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        domain: &str,
    ) -> Result<PendingOperation, ClientError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::Transport(format!("no async runtime: {e}")))?;

        self.inner
            .state
            .transition(ConnectionState::Connecting, &[ConnectionState::Disconnected])?;

        *self.inner.session.lock() = Session {
            domain: Some(domain.to_string()),
            ..Session::default()
        };

        handshake::register(&self.inner.router);
        self.inner.modules.install_defaults(self);

        let (operation, completer) = PendingOperation::new();
        let client = self.clone();
        let host = host.to_string();
        let options = TransportOptions {
            tcp_nodelay: self.client_option(ClientOption::TcpNoDelay).unwrap_or(true),
            timeout: self.inner.timeout,
        };

        runtime.spawn(async move {
            let connected = client
                .inner
                .connector
                .connect(&host, port, options)
                .await;
            client.finish_connect(connected, &completer, &host, port);
        });

        Ok(operation)
    }

    fn finish_connect(
        &self,
        connected: Result<crate::transport::BoxedStream, ClientError>,
        completer: &Completer,
        host: &str,
        port: u16,
    ) {
        match connected {
            Ok(stream) => {
                let io = connection::spawn(stream, self, self.inner.timeout);
                *self.inner.io.lock() = Some(io);
                match self
                    .inner
                    .state
                    .transition(ConnectionState::Connected, &[ConnectionState::Connecting])
                {
                    Ok(_) => {
                        debug!(host, port, "connected");
                        completer.complete(Ok(self.clone()));
                    }
                    Err(error) => {
                        completer.fail(error);
                    }
                }
            }
            Err(error) => {
                debug!(host, port, %error, "connect failed");
                self.release_resources();
                self.inner.state.force(ConnectionState::Disconnected);
                completer.fail(error);
            }
        }
    }

    /// Starts the stream negotiation and authenticates with SASL PLAIN.
    ///
    /// The returned operation resolves once the session is established, or
    /// fails with [`ClientError::Authentication`] if any handshake step is
    /// refused.
    pub fn login(
        &self,
        username: &str,
        password: &str,
        resource: Option<&str>,
    ) -> Result<PendingOperation, ClientError> {
        self.inner
            .state
            .transition(ConnectionState::LoggingIn, &[ConnectionState::Connected])?;

        let domain = self.domain().unwrap_or_default();
        let account = match account_jid(username, &domain, resource) {
            Ok(account) => account,
            Err(error) => {
                let _ = self
                    .inner
                    .state
                    .transition(ConnectionState::Connected, &[ConnectionState::LoggingIn]);
                return Err(error);
            }
        };

        {
            let mut session = self.inner.session.lock();
            session.credentials = Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
                resource: resource.map(str::to_string),
                account,
            });
            session.bound_jid = None;
        }

        let (operation, completer) = PendingOperation::new();
        *self.inner.pending_login.lock() = Some(completer);

        let opened = self
            .current_io()
            .ok_or(ClientError::TransportUnavailable)
            .and_then(|io| io.open_stream(&domain));
        if let Err(error) = opened {
            self.fail_login(error);
        }

        Ok(operation)
    }

    /// Closes the stream and the transport.
    ///
    /// Safe to call repeatedly: while a disconnect is running every caller
    /// receives the same operation, and once disconnected it resolves
    /// immediately.
    pub fn disconnect(&self) -> PendingOperation {
        let mut slot = self.inner.pending_disconnect.lock();
        if let Some(in_flight) = slot.as_ref() {
            return in_flight.clone();
        }

        match self.inner.state.transition(
            ConnectionState::Disconnecting,
            &[
                ConnectionState::LoggingIn,
                ConnectionState::Connected,
                ConnectionState::LoggedIn,
            ],
        ) {
            Ok(_) => {}
            Err(ClientError::InvalidState {
                current: Some(ConnectionState::Disconnected),
                ..
            }) => return PendingOperation::ready(Ok(self.clone())),
            Err(error) => return PendingOperation::ready(Err(error)),
        }

        let (operation, completer) = PendingOperation::new();
        *slot = Some(operation.clone());
        drop(slot);

        self.release_resources();

        let Some(io) = self.inner.io.lock().take() else {
            self.finish_disconnect(&completer, Err(ClientError::TransportUnavailable));
            return operation;
        };

        let closed = io.close();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let client = self.clone();
                let timeout = self.inner.timeout;
                runtime.spawn(async move {
                    if tokio::time::timeout(timeout, closed).await.is_err() {
                        debug!("timed out waiting for transport close");
                    }
                    client.finish_disconnect(&completer, Ok(client.clone()));
                });
            }
            Err(_) => self.finish_disconnect(&completer, Ok(self.clone())),
        }

        operation
    }

    /// Fire-and-forget [`disconnect`](Self::disconnect).
    pub fn close(&self) {
        let _ = self.disconnect();
    }

    fn finish_disconnect(&self, completer: &Completer, outcome: Result<XmppClient, ClientError>) {
        {
            let mut slot = self.inner.pending_disconnect.lock();
            self.inner.state.force(ConnectionState::Disconnected);
            slot.take();
        }
        debug!("disconnected");
        completer.complete(outcome);
    }

    fn release_resources(&self) {
        self.inner.modules.uninstall_all(self);
        self.inner.router.unregister_all();
        {
            let mut session = self.inner.session.lock();
            let domain = session.domain.take();
            *session = Session {
                domain,
                ..Session::default()
            };
        }
        if let Some(login) = self.inner.pending_login.lock().take() {
            login.fail(ClientError::Cancelled(
                "disconnected before login completed".to_string(),
            ));
        }
    }

    /// Called by the connection task when the transport goes away on its own.
    pub(crate) fn on_transport_closed(&self, connection_id: u64) {
        let is_current = self
            .inner
            .io
            .lock()
            .as_ref()
            .is_some_and(|io| io.id() == connection_id);
        if is_current && self.state().is_live() {
            debug!(connection_id, "transport closed, disconnecting");
            self.close();
        }
    }

    /// Queues a stanza; outgoing interceptors may still drop it.
    pub fn send_stanza(&self, stanza: Element) -> Result<(), ClientError> {
        self.current_io()
            .ok_or(ClientError::TransportUnavailable)?
            .send(stanza)
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn StanzaInterceptor>) -> bool {
        self.inner.interceptors.add(interceptor)
    }

    pub fn remove_interceptor(&self, interceptor: &Arc<dyn StanzaInterceptor>) -> bool {
        self.inner.interceptors.remove(interceptor)
    }

    /// Sets an option, or clears it back to its default with `None`.
    pub fn set_client_option(&self, option: ClientOption, value: Option<bool>) -> &Self {
        match value {
            Some(value) => {
                self.inner.options.insert(option, value);
            }
            None => {
                self.inner.options.remove(&option);
            }
        }
        self
    }

    pub fn client_option(&self, option: ClientOption) -> Option<bool> {
        self.inner.options.get(&option).map(|value| *value)
    }

    pub fn router(&self) -> &StanzaRouter {
        &self.inner.router
    }

    pub(crate) fn interceptors(&self) -> &InterceptorChain {
        &self.inner.interceptors
    }

    pub fn has_active_module(&self, id: ModuleId) -> bool {
        self.inner.modules.is_active(id)
    }

    /// Gets or installs a module by type.
    ///
    /// Only available while connected; otherwise fails with
    /// [`ClientError::InvalidState`] and installs nothing.
    pub fn module<M: RegisteredModule>(&self) -> Result<Arc<M>, ClientError> {
        self.require_module_state()?;
        self.inner.modules.get_or_install::<M>(self)
    }

    pub fn module_by_id(
        &self,
        id: ModuleId,
    ) -> Result<Arc<dyn crate::modules::ClientModule>, ClientError> {
        self.require_module_state()?;
        self.inner.modules.install(id, self)
    }

    fn require_module_state(&self) -> Result<(), ClientError> {
        let current = self.inner.state.current();
        match current {
            Some(ConnectionState::Connected | ConnectionState::LoggedIn) => Ok(()),
            _ => Err(ClientError::InvalidState {
                current,
                expected: vec![ConnectionState::Connected, ConnectionState::LoggedIn],
            }),
        }
    }

    /// The bound JID, or `username@domain/resource` before binding.
    pub fn jid(&self) -> String {
        let session = self.inner.session.lock();
        match (&session.bound_jid, &session.credentials) {
            (Some(bound), _) => bound.to_string(),
            (None, Some(credentials)) => credentials.account.to_string(),
            (None, None) => session.domain.clone().unwrap_or_default(),
        }
    }

    pub fn domain(&self) -> Option<String> {
        self.inner.session.lock().domain.clone()
    }

    fn current_io(&self) -> Option<IoHandle> {
        self.inner.io.lock().clone()
    }

    pub(crate) fn state_machine(&self) -> &StateMachine {
        &self.inner.state
    }

    pub(crate) fn credentials(&self) -> Option<Credentials> {
        self.inner.session.lock().credentials.clone()
    }

    pub(crate) fn tls_upgrader(&self) -> Arc<dyn TlsUpgrader> {
        Arc::clone(&self.inner.tls)
    }

    pub(crate) fn is_secured(&self) -> bool {
        self.inner.session.lock().secured
    }

    pub(crate) fn mark_secured(&self) {
        self.inner.session.lock().secured = true;
    }

    pub(crate) fn set_bound_jid(&self, jid: Option<Jid>) {
        self.inner.session.lock().bound_jid = jid;
    }

    pub(crate) fn fail_login(&self, error: ClientError) {
        if let Some(login) = self.inner.pending_login.lock().take() {
            debug!(%error, "login failed");
            login.fail(error);
        }
    }

    pub(crate) fn complete_login(&self) {
        if let Err(error) = self
            .inner
            .state
            .transition(ConnectionState::LoggedIn, &[ConnectionState::LoggingIn])
        {
            debug!(%error, "session established outside of login");
            return;
        }

        let jid = self.jid();
        info!(%jid, "logged in");
        if let Some(login) = self.inner.pending_login.lock().take() {
            login.complete(Ok(self.clone()));
        }
    }
}

impl Default for XmppClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for XmppClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmppClient")
            .field("state", &self.state())
            .field("jid", &self.jid())
            .finish()
    }
}

pub struct XmppClientBuilder {
    connector: Arc<dyn Connector>,
    tls: Arc<dyn TlsUpgrader>,
    catalog: ModuleCatalog,
    options: Vec<(ClientOption, bool)>,
    timeout: Duration,
}

impl Default for XmppClientBuilder {
    fn default() -> Self {
        Self {
            connector: Arc::new(TcpConnector),
            tls: Arc::new(RustlsUpgrader::native()),
            catalog: ModuleCatalog::with_defaults(),
            options: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl XmppClientBuilder {
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn tls_upgrader(mut self, tls: Arc<dyn TlsUpgrader>) -> Self {
        self.tls = tls;
        self
    }

    pub fn modules(mut self, catalog: ModuleCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn without_default_modules(mut self) -> Self {
        self.catalog = ModuleCatalog::empty();
        self
    }

    pub fn option(mut self, option: ClientOption, value: bool) -> Self {
        self.options.push((option, value));
        self
    }

    /// Upper bound for connecting, the TLS handshake and closing.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> XmppClient {
        let options = DashMap::new();
        for (option, value) in self.options {
            options.insert(option, value);
        }

        XmppClient {
            inner: Arc::new(ClientInner {
                state: StateMachine::new(),
                options,
                session: Mutex::new(Session::default()),
                io: Mutex::new(None),
                pending_login: Mutex::new(None),
                pending_disconnect: Mutex::new(None),
                router: StanzaRouter::new(),
                interceptors: InterceptorChain::new(),
                modules: ModuleRegistry::new(self.catalog),
                connector: self.connector,
                tls: self.tls,
                timeout: self.timeout,
            }),
        }
    }
}
