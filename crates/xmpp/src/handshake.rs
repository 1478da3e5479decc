//! Stream negotiation handlers.
//!
//! Registered on the router at `connect()`; each one reacts to a single
//! server response and queues the next request:
//!
//! ```text
//! stream:features -> <starttls/> | <auth mechanism='PLAIN'/>
//! proceed         -> TLS upgrade, stream restart
//! success         -> bind IQ
//! iq id=bind      -> session IQ
//! iq id=session   -> LOGGED_IN
//! ```

use minidom::Element;
use tracing::{debug, warn};

use crate::client::ClientOption;
use crate::error::ClientError;
use crate::router::{HandlerContext, StanzaRouter};
use crate::sasl;
use crate::stanza::{
    bind_request, bound_jid, element_to_string, is_result, requires_starttls, session_request,
    starttls_request, BIND_REQUEST_ID, SESSION_REQUEST_ID,
};
use crate::state::ConnectionState;

pub(crate) fn register(router: &StanzaRouter) {
    router.register_fn("stream:features", on_stream_features);
    router.register_fn("proceed", on_proceed);
    router.register_fn("success", on_sasl_result);
    router.register_fn("failure", on_sasl_result);
    router.register_fn("iq", on_iq);
}

fn send_or_fail(ctx: &HandlerContext<'_>, stanza: Element) {
    if let Err(error) = ctx.send(stanza) {
        ctx.client().fail_login(error);
    }
}

fn on_stream_features(ctx: &HandlerContext<'_>, features: &Element) {
    let client = ctx.client();
    let tls_enabled = client
        .client_option(ClientOption::EnableTls)
        .unwrap_or(false);

    if !client.is_secured() && (tls_enabled || requires_starttls(features)) {
        debug!("requesting STARTTLS");
        send_or_fail(ctx, starttls_request());
        return;
    }

    let Some(credentials) = client.credentials() else {
        debug!("stream features received without pending login");
        return;
    };

    let offered = sasl::offered_mechanisms(features);
    if !offered.is_empty() && !offered.iter().any(|m| m == sasl::PLAIN) {
        warn!(?offered, "server does not advertise PLAIN, attempting it anyway");
    }

    match sasl::plain_auth(&credentials.username, &credentials.password) {
        Ok(auth) => send_or_fail(ctx, auth),
        Err(error) => client.fail_login(error),
    }
}

fn on_proceed(ctx: &HandlerContext<'_>, _proceed: &Element) {
    let client = ctx.client();
    if client
        .state_machine()
        .transition(ConnectionState::Securing, &[ConnectionState::LoggingIn])
        .is_err()
    {
        debug!(state = %client.state(), "ignoring <proceed/> outside of login");
        return;
    }

    let domain = client.domain().unwrap_or_default();
    let requested = ctx.io().start_tls(
        domain.clone(),
        client.tls_upgrader(),
        Box::new(move |ctx: &HandlerContext<'_>, result: Result<(), ClientError>| {
            let client = ctx.client();
            let restored = client
                .state_machine()
                .transition(ConnectionState::LoggingIn, &[ConnectionState::Securing]);
            if restored.is_err() {
                debug!(state = %client.state(), "TLS finished after login was abandoned");
                return;
            }

            match result {
                Ok(()) => {
                    client.mark_secured();
                    if let Err(error) = ctx.io().open_stream(&domain) {
                        client.fail_login(error);
                    }
                }
                Err(error) => {
                    client.fail_login(ClientError::Authentication(format!("tls failed: {error}")));
                }
            }
        }),
    );

    if let Err(error) = requested {
        let _ = client
            .state_machine()
            .transition(ConnectionState::LoggingIn, &[ConnectionState::Securing]);
        client.fail_login(error);
    }
}

fn on_sasl_result(ctx: &HandlerContext<'_>, response: &Element) {
    let client = ctx.client();
    if response.name() != "success" {
        client.fail_login(sasl::map_failure(response));
        return;
    }

    let resource = client.credentials().and_then(|c| c.resource);
    send_or_fail(ctx, bind_request(resource.as_deref()));
}

fn on_iq(ctx: &HandlerContext<'_>, iq: &Element) {
    let client = ctx.client();
    match iq.attr("id") {
        Some(BIND_REQUEST_ID) => {
            if !is_result(iq) {
                client.fail_login(ClientError::Authentication(element_to_string(iq)));
                return;
            }
            client.set_bound_jid(bound_jid(iq));
            let domain = client.domain().unwrap_or_default();
            send_or_fail(ctx, session_request(&domain));
        }
        Some(SESSION_REQUEST_ID) => {
            if is_result(iq) {
                client.complete_login();
            } else {
                client.fail_login(ClientError::Authentication(element_to_string(iq)));
            }
        }
        id => debug!(?id, "unsupported iq"),
    }
}
