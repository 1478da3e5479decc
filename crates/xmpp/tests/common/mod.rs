//! Test utilities for driving the client against a scripted server.
//!
//! The client side gets in-memory duplex pipes through [`DuplexConnector`];
//! the test holds the other end as a [`FakeServer`] and plays the server's
//! half of the handshake by hand.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;
use waddle_xmpp_client::{
    BoxedStream, ClientError, ConnectionState, Connector, TlsUpgrader, TransportOptions,
    XmppClient,
};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DOMAIN: &str = "example.org";

pub const SERVER_STREAM_HEADER: &str = "<?xml version='1.0'?><stream:stream \
    xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' \
    from='example.org' id='test-stream' version='1.0'>";

pub const PLAIN_FEATURES: &str = "<stream:features>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
    </stream:features>";

pub const STARTTLS_REQUIRED_FEATURES: &str = "<stream:features>\
    <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
    <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms>\
    </stream:features>";

/// Hands out pre-created duplex pipes, one per `connect()`.
#[derive(Default)]
pub struct DuplexConnector {
    pending: Mutex<VecDeque<DuplexStream>>,
    pub connects: AtomicUsize,
}

impl DuplexConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a pipe for the next connect and returns its server end.
    pub fn next_server(&self) -> FakeServer {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.pending.lock().unwrap().push_back(client);
        FakeServer::new(server)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(
        &self,
        _host: &str,
        _port: u16,
        _options: TransportOptions,
    ) -> Result<BoxedStream, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let stream = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ClientError::Transport("connection refused".into()))?;
        Ok(Box::new(stream))
    }
}

/// Stands in for TLS by handing the plaintext stream straight back.
#[derive(Default)]
pub struct PassthroughUpgrader {
    pub upgrades: AtomicUsize,
    pub domains: Mutex<Vec<String>>,
}

#[async_trait]
impl TlsUpgrader for PassthroughUpgrader {
    async fn upgrade(&self, stream: BoxedStream, domain: &str) -> Result<BoxedStream, ClientError> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        self.domains.lock().unwrap().push(domain.to_string());
        Ok(stream)
    }
}

pub struct FailingUpgrader;

#[async_trait]
impl TlsUpgrader for FailingUpgrader {
    async fn upgrade(&self, _stream: BoxedStream, _domain: &str) -> Result<BoxedStream, ClientError> {
        Err(ClientError::Tls("handshake refused".into()))
    }
}

/// Server end of a duplex pipe with a small line-free read buffer.
pub struct FakeServer {
    stream: DuplexStream,
    buffer: String,
}

impl FakeServer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: String::new(),
        }
    }

    pub async fn send(&mut self, xml: &str) {
        self.stream.write_all(xml.as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Reads until `needle` arrives and returns everything up to and
    /// including it.
    pub async fn expect(&mut self, needle: &str) -> String {
        let read = async {
            loop {
                if let Some(pos) = self.buffer.find(needle) {
                    let end = pos + needle.len();
                    return self.buffer.drain(..end).collect::<String>();
                }
                let mut chunk = [0u8; 4096];
                let n = self.stream.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed while waiting for {needle:?}; got {:?}", self.buffer);
                self.buffer.push_str(std::str::from_utf8(&chunk[..n]).unwrap());
            }
        };
        timeout(DEFAULT_TIMEOUT, read)
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}"))
    }

    /// Reads until the client closes the pipe and returns the remainder.
    pub async fn read_to_eof(&mut self) -> String {
        let read = async {
            let mut rest = Vec::new();
            self.stream.read_to_end(&mut rest).await.unwrap();
            rest
        };
        let rest = timeout(DEFAULT_TIMEOUT, read)
            .await
            .expect("timed out waiting for the client to close");
        let mut all = std::mem::take(&mut self.buffer);
        all.push_str(std::str::from_utf8(&rest).unwrap());
        all
    }

    /// Plays the server side of a plain (no TLS) login.
    pub async fn accept_plain_login(&mut self, jid: &str) {
        self.expect("<stream:stream").await;
        self.send(SERVER_STREAM_HEADER).await;
        self.send(PLAIN_FEATURES).await;
        self.expect("</auth>").await;
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;
        self.expect("</iq>").await;
        self.send(&format!(
            "<iq type='result' id='bind'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>{jid}</jid></bind></iq>"
        ))
        .await;
        self.expect("</iq>").await;
        self.send("<iq type='result' id='session'/>").await;
    }
}

pub fn client_with(connector: Arc<DuplexConnector>, tls: Arc<dyn TlsUpgrader>) -> XmppClient {
    XmppClient::builder()
        .connector(connector)
        .tls_upgrader(tls)
        .timeout(DEFAULT_TIMEOUT)
        .build()
}

pub async fn wait_for_state(client: &XmppClient, expected: ConnectionState) {
    let poll = async {
        while client.state() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(DEFAULT_TIMEOUT, poll)
        .await
        .unwrap_or_else(|_| panic!("state stuck at {:?}, expected {expected:?}", client.state()));
}

/// Attribute check that doesn't care which quote style the writer picked.
pub fn has_attr(xml: &str, name: &str, value: &str) -> bool {
    xml.contains(&format!("{name}='{value}'")) || xml.contains(&format!("{name}=\"{value}\""))
}
