//! XMPP client engine for Waddle.
//!
//! Drives a client connection from TCP connect through STARTTLS, SASL PLAIN,
//! resource binding and session establishment, then routes stanzas to
//! handlers and modules through an interceptor chain.

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
mod handshake;
pub mod modules;
pub mod pending;
pub mod pipeline;
pub mod router;
pub mod sasl;
pub mod stanza;
pub mod state;
pub mod transport;

pub use client::{ClientOption, WeakClient, XmppClient, XmppClientBuilder};
pub use codec::{Frame, StanzaCodec, StreamHeader};
pub use config::{ClientConfig, ConfigError};
pub use connection::IoHandle;
pub use error::{ClientError, CodecError};
pub use minidom::Element;
pub use modules::muc::{MucMessage, MucModule};
pub use modules::presence::{PresenceKind, PresenceModule, PresenceUpdate};
pub use modules::{ClientModule, ModuleCatalog, ModuleId, RegisteredModule};
pub use pending::PendingOperation;
pub use pipeline::{InterceptorResult, StanzaDirection, StanzaInterceptor};
pub use router::{HandlerContext, StanzaHandler, StanzaRouter};
pub use state::ConnectionState;
pub use transport::{
    AsyncStream, BoxedStream, Connector, RustlsUpgrader, TcpConnector, TlsUpgrader,
    TransportOptions,
};
