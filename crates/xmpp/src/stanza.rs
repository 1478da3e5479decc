use jid::Jid;
use minidom::Element;

/// XMPP namespaces used by the client handshake.
pub mod ns {
    /// XMPP client namespace
    pub const JABBER_CLIENT: &str = "jabber:client";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Resource binding namespace
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    /// Session namespace
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    /// Multi-user chat namespace
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    /// Multi-user chat user namespace
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
}

pub const BIND_REQUEST_ID: &str = "bind";
pub const SESSION_REQUEST_ID: &str = "session";

/// Name a stanza is routed under.
///
/// Elements in the stream namespace keep their conventional `stream:` prefix
/// (`stream:features`, `stream:error`); everything else routes by local name.
pub fn qualified_name(element: &Element) -> String {
    if element.ns() == ns::STREAM {
        format!("stream:{}", element.name())
    } else {
        element.name().to_string()
    }
}

pub fn starttls_request() -> Element {
    Element::builder("starttls", ns::TLS).build()
}

/// Resource bind IQ. The server picks a resource when none is given.
pub fn bind_request(resource: Option<&str>) -> Element {
    let mut bind = Element::builder("bind", ns::BIND);
    if let Some(resource) = resource {
        bind = bind.append(Element::builder("resource", ns::BIND).append(resource.to_string()));
    }

    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("type", "set")
        .attr("id", BIND_REQUEST_ID)
        .append(bind)
        .build()
}

pub fn session_request(domain: &str) -> Element {
    Element::builder("iq", ns::JABBER_CLIENT)
        .attr("to", domain)
        .attr("type", "set")
        .attr("id", SESSION_REQUEST_ID)
        .append(Element::builder("session", ns::SESSION))
        .build()
}

/// The JID assigned in a bind result, if the server included one.
pub fn bound_jid(iq: &Element) -> Option<Jid> {
    iq.get_child("bind", ns::BIND)
        .and_then(|bind| bind.get_child("jid", ns::BIND))
        .and_then(|jid| jid.text().parse().ok())
}

/// Whether `<stream:features/>` marks STARTTLS as mandatory.
pub fn requires_starttls(features: &Element) -> bool {
    features
        .get_child("starttls", ns::TLS)
        .is_some_and(|starttls| starttls.get_child("required", ns::TLS).is_some())
}

pub fn is_result(iq: &Element) -> bool {
    iq.attr("type") == Some("result")
}

pub fn element_to_string(element: &Element) -> String {
    let mut output = Vec::new();
    match element.write_to(&mut output) {
        Ok(()) => String::from_utf8_lossy(&output).into_owned(),
        Err(_) => format!("<{}/>", element.name()),
    }
}
