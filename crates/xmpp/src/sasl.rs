use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use minidom::Element;
use ::sasl::client::mechanisms::Plain;
use ::sasl::client::Mechanism;
use ::sasl::common::Credentials;

use crate::error::ClientError;
use crate::stanza::{element_to_string, ns};

pub const PLAIN: &str = "PLAIN";

/// Base64 of the PLAIN initial response, `\0username\0password`.
pub fn plain_payload(username: &str, password: &str) -> Result<String, ClientError> {
    let credentials = Credentials::default()
        .with_username(username)
        .with_password(password);
    let mut mechanism = Plain::from_credentials(credentials).map_err(|e| {
        ClientError::Authentication(format!("failed to initialize PLAIN: {e:?}"))
    })?;
    Ok(STANDARD.encode(mechanism.initial()))
}

pub fn plain_auth(username: &str, password: &str) -> Result<Element, ClientError> {
    Ok(Element::builder("auth", ns::SASL)
        .attr("mechanism", PLAIN)
        .append(plain_payload(username, password)?)
        .build())
}

/// Mechanism names advertised in `<stream:features/>`.
pub fn offered_mechanisms(features: &Element) -> Vec<String> {
    features
        .get_child("mechanisms", ns::SASL)
        .map(|mechanisms| {
            mechanisms
                .children()
                .filter(|c| c.is("mechanism", ns::SASL))
                .map(Element::text)
                .collect()
        })
        .unwrap_or_default()
}

/// Wraps the raw server response so callers can see what was rejected.
pub(crate) fn map_failure(response: &Element) -> ClientError {
    ClientError::Authentication(element_to_string(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_payload_encodes_nul_separated_credentials() {
        assert_eq!(plain_payload("u", "p").unwrap(), "AHUAcA==");
        let decoded = STANDARD.decode(plain_payload("u", "p").unwrap()).unwrap();
        assert_eq!(decoded, b"\0u\0p");
    }

    #[test]
    fn plain_payload_keeps_utf8_bytes() {
        let decoded = STANDARD
            .decode(plain_payload("zoë", "pässwörd").unwrap())
            .unwrap();
        assert_eq!(decoded, "\0zoë\0pässwörd".as_bytes());
    }

    #[test]
    fn plain_auth_element() {
        let auth = plain_auth("alice", "secret").unwrap();
        assert!(auth.is("auth", ns::SASL));
        assert_eq!(auth.attr("mechanism"), Some("PLAIN"));
        assert_eq!(auth.text(), plain_payload("alice", "secret").unwrap());
    }

    #[test]
    fn lists_offered_mechanisms() {
        let features: Element = "<features xmlns='http://etherx.jabber.org/streams'>\
            <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
            <mechanism>SCRAM-SHA-1</mechanism><mechanism>PLAIN</mechanism>\
            </mechanisms></features>"
            .parse()
            .unwrap();
        assert_eq!(offered_mechanisms(&features), vec!["SCRAM-SHA-1", "PLAIN"]);
    }

    #[test]
    fn failure_maps_to_authentication_with_raw_xml() {
        let failure: Element =
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>"
                .parse()
                .unwrap();
        let error = map_failure(&failure);
        assert!(matches!(error, ClientError::Authentication(_)));
        assert!(error.to_string().contains("not-authorized"));
    }
}
