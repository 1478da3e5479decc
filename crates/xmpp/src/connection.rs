//! The per-connection I/O task.
//!
//! Each transport gets one task that owns the framed socket. It serializes
//! reads, writes, the STARTTLS swap and the final close, so handlers and
//! interceptors always observe stanzas in wire order and the TLS upgrade is
//! atomic with respect to every other I/O on the connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use minidom::Element;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, instrument, warn, Instrument};

use crate::client::{WeakClient, XmppClient};
use crate::codec::{Frame, StanzaCodec, StreamHeader};
use crate::error::ClientError;
use crate::pipeline::StanzaDirection;
use crate::router::HandlerContext;
use crate::stanza::qualified_name;
use crate::transport::{BoxedStream, TlsUpgrader};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type FramedStream = Framed<BoxedStream, StanzaCodec>;

/// Runs on the I/O task once the TLS upgrade has finished, before any
/// further frame is read.
pub(crate) type TlsCompletion =
    Box<dyn FnOnce(&HandlerContext<'_>, Result<(), ClientError>) + Send + 'static>;

pub(crate) enum Command {
    Send(Element),
    OpenStream(StreamHeader),
    StartTls {
        domain: String,
        upgrader: Arc<dyn TlsUpgrader>,
        on_complete: TlsCompletion,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable sender side of a connection task.
#[derive(Clone)]
pub struct IoHandle {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
}

impl IoHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queues a stanza for the outgoing interceptors and the wire.
    pub fn send(&self, stanza: Element) -> Result<(), ClientError> {
        self.submit(Command::Send(stanza))
    }

    pub(crate) fn open_stream(&self, domain: &str) -> Result<(), ClientError> {
        self.submit(Command::OpenStream(StreamHeader::client_to(domain)))
    }

    pub(crate) fn start_tls(
        &self,
        domain: String,
        upgrader: Arc<dyn TlsUpgrader>,
        on_complete: TlsCompletion,
    ) -> Result<(), ClientError> {
        self.submit(Command::StartTls {
            domain,
            upgrader,
            on_complete,
        })
    }

    /// Requests a graceful close. The receiver fires once the transport is
    /// shut down, or immediately errors if the task is already gone.
    pub(crate) fn close(&self) -> oneshot::Receiver<()> {
        let (ack, done) = oneshot::channel();
        // A dead task drops the command and with it `ack`, which resolves `done`.
        let _ = self.commands.send(Command::Close { ack });
        done
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn submit(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::TransportUnavailable)
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            commands,
        };
        (handle, rx)
    }
}

impl std::fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug)]
enum Exit {
    Closed,
    PeerClosed,
    Failed(ClientError),
    ClientDropped,
}

enum Wake {
    Command(Option<Command>),
    Frame(Option<Result<Frame, crate::error::CodecError>>),
}

/// Starts the I/O task for `stream` and returns its handle.
pub(crate) fn spawn(stream: BoxedStream, client: &XmppClient, close_timeout: Duration) -> IoHandle {
    let (commands, rx) = mpsc::unbounded_channel();
    let io = IoHandle {
        id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        commands,
    };

    let task = Connection {
        framed: Framed::new(stream, StanzaCodec::new()),
        commands: rx,
        client: client.downgrade(),
        io: io.clone(),
        close_timeout,
    };
    let span = tracing::debug_span!("xmpp.connection", id = io.id);
    tokio::spawn(task.run().instrument(span));
    io
}

struct Connection {
    framed: FramedStream,
    commands: mpsc::UnboundedReceiver<Command>,
    client: WeakClient,
    io: IoHandle,
    close_timeout: Duration,
}

impl Connection {
    async fn run(self) {
        let Connection {
            mut framed,
            mut commands,
            client,
            io,
            close_timeout,
        } = self;

        let exit = loop {
            let wake = tokio::select! {
                biased;
                command = commands.recv() => Wake::Command(command),
                frame = framed.next() => Wake::Frame(frame),
            };

            match wake {
                Wake::Command(Some(Command::Close { ack })) => {
                    shutdown(&mut framed, close_timeout).await;
                    let _ = ack.send(());
                    break Exit::Closed;
                }
                Wake::Command(Some(Command::StartTls {
                    domain,
                    upgrader,
                    on_complete,
                })) => {
                    let Some(owner) = client.upgrade() else {
                        shutdown(&mut framed, close_timeout).await;
                        break Exit::ClientDropped;
                    };
                    match starttls(framed, &domain, upgrader.as_ref()).await {
                        Ok(upgraded) => {
                            framed = upgraded;
                            on_complete(&HandlerContext::new(&owner, &io), Ok(()));
                        }
                        Err(error) => {
                            on_complete(&HandlerContext::new(&owner, &io), Err(error.clone()));
                            break Exit::Failed(error);
                        }
                    }
                }
                Wake::Command(Some(command)) => {
                    let Some(owner) = client.upgrade() else {
                        shutdown(&mut framed, close_timeout).await;
                        break Exit::ClientDropped;
                    };
                    if let Err(error) = write(&mut framed, &owner, command).await {
                        break Exit::Failed(error);
                    }
                }
                Wake::Command(None) => break Exit::Closed,
                Wake::Frame(Some(Ok(frame))) => {
                    let Some(owner) = client.upgrade() else {
                        shutdown(&mut framed, close_timeout).await;
                        break Exit::ClientDropped;
                    };
                    match frame {
                        Frame::StreamOpen(header) => {
                            debug!(id = ?header.id, from = ?header.from, "stream opened by server");
                        }
                        Frame::Stanza(stanza) => deliver(&owner, &io, &stanza),
                        Frame::StreamClose => {
                            debug!("server closed the stream");
                            let _ = framed.send(Frame::StreamClose).await;
                            break Exit::PeerClosed;
                        }
                    }
                }
                Wake::Frame(Some(Err(error))) => break Exit::Failed(error.into()),
                Wake::Frame(None) => break Exit::PeerClosed,
            }
        };

        // Queued sends and pending closes are dropped here.
        drop(commands);

        match exit {
            Exit::Closed => debug!("connection closed"),
            Exit::ClientDropped => debug!("client dropped, connection closed"),
            Exit::PeerClosed | Exit::Failed(_) => {
                if let Exit::Failed(error) = &exit {
                    warn!(%error, "connection failed");
                } else {
                    debug!("transport closed by peer");
                }
                if let Some(owner) = client.upgrade() {
                    owner.on_transport_closed(io.id());
                }
            }
        }
    }
}

fn deliver(client: &XmppClient, io: &IoHandle, stanza: &Element) {
    if client
        .interceptors()
        .admit(StanzaDirection::Incoming, stanza, client)
        .is_err()
    {
        return;
    }

    let ctx = HandlerContext::new(client, io);
    if !client.router().dispatch(&ctx, stanza) {
        debug!(stanza = %qualified_name(stanza), "unhandled stanza");
    }
}

async fn write(
    framed: &mut FramedStream,
    client: &XmppClient,
    command: Command,
) -> Result<(), ClientError> {
    let frame = match command {
        Command::Send(stanza) => {
            if client
                .interceptors()
                .admit(StanzaDirection::Outgoing, &stanza, client)
                .is_err()
            {
                return Ok(());
            }
            Frame::Stanza(stanza)
        }
        Command::OpenStream(header) => Frame::StreamOpen(header),
        Command::StartTls { .. } | Command::Close { .. } => return Ok(()),
    };
    framed.send(frame).await.map_err(ClientError::from)
}

#[instrument(skip_all, name = "xmpp.connection.starttls", fields(domain = %domain))]
async fn starttls(
    framed: FramedStream,
    domain: &str,
    upgrader: &dyn TlsUpgrader,
) -> Result<FramedStream, ClientError> {
    let parts = framed.into_parts();
    if !parts.read_buf.is_empty() {
        warn!(
            buffered = parts.read_buf.len(),
            "discarding plaintext received after <proceed/>"
        );
    }

    let upgraded = upgrader.upgrade(parts.io, domain).await?;
    debug!("STARTTLS complete, framing reset");
    Ok(Framed::new(upgraded, StanzaCodec::new()))
}

async fn shutdown(framed: &mut FramedStream, close_timeout: Duration) {
    let close = async {
        framed.send(Frame::StreamClose).await?;
        framed.close().await
    };
    match tokio::time::timeout(close_timeout, close).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(%error, "error while closing transport"),
        Err(_) => debug!("timed out closing transport"),
    }
}
