//! Per-connection driver.
//!
//! Owns one accepted transport and its [`StreamSession`] exclusively: reads
//! bytes, splits them into frames, normalizes stanzas, feeds the state
//! machine and executes the resulting actions.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::element::Element;
use super::error::ComponentError;
use super::events::{DispatchMode, EventBus, EventName, HandlerRegistry};
use super::framing::{extract_frame, Frame, STREAM_FOOTER};
use super::namespace::normalize;
use super::negotiation::{Action, StreamSession};

/// Maximum allowed size for the inbound framing buffer.
///
/// A peer that keeps sending bytes that never complete a stanza is
/// disconnected once the buffer exceeds this limit.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

/// Transport abstraction: plain TCP, TLS-wrapped TCP, or an in-memory pipe.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Wraps a transport in a server-side TLS session.
pub trait TlsUpgrader: Send + Sync + 'static {
    fn upgrade(&self, io: BoxedIo) -> impl Future<Output = std::io::Result<BoxedIo>> + Send;
}

/// `None` means no certificate material is loaded; any upgrade fails.
impl<T: TlsUpgrader> TlsUpgrader for Option<T> {
    fn upgrade(&self, io: BoxedIo) -> impl Future<Output = std::io::Result<BoxedIo>> + Send {
        let pending = self.as_ref().map(|upgrader| upgrader.upgrade(io));
        async move {
            match pending {
                Some(fut) => fut.await,
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "TLS is not configured",
                )),
            }
        }
    }
}

/// Server-wide settings every connection reads. Immutable after startup.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub component_jid: String,
    pub namespace: String,
    /// Offer STARTTLS as required.
    pub use_tls: bool,
    /// Wrap the transport in TLS right after accept.
    pub implicit_tls: bool,
    pub inactivity_timeout: Duration,
}

pub struct ConnectionContext<U> {
    pub settings: SessionSettings,
    pub handlers: HandlerRegistry,
    pub events: EventBus,
    pub upgrader: U,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Connection<U> {
    peer: SocketAddr,
    io: Option<BoxedIo>,
    buffer: Vec<u8>,
    session: StreamSession,
    ctx: Arc<ConnectionContext<U>>,
    shutdown: Option<broadcast::Receiver<()>>,
}

async fn shutdown_signal(rx: &mut Option<broadcast::Receiver<()>>) {
    match rx {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl<U: TlsUpgrader> Connection<U> {
    pub fn new(
        conn_id: u64,
        peer: SocketAddr,
        io: BoxedIo,
        transport_encrypted: bool,
        ctx: Arc<ConnectionContext<U>>,
        shutdown: Option<broadcast::Receiver<()>>,
    ) -> Self {
        let session = StreamSession::new(
            conn_id,
            ctx.settings.component_jid.clone(),
            ctx.settings.namespace.clone(),
            ctx.settings.use_tls,
            transport_encrypted,
        );
        Self {
            peer,
            io: Some(io),
            buffer: Vec::new(),
            session,
            ctx,
            shutdown,
        }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Drive the connection until the stream ends, the peer disconnects or a
    /// fatal error occurs. The transport is always closed on return.
    pub async fn run(&mut self) -> Result<(), ComponentError> {
        let result = self.drive().await;
        self.session.close();
        self.close_transport().await;
        result
    }

    async fn drive(&mut self) -> Result<(), ComponentError> {
        let conn_id = self.session.conn_id();
        let mut read_buf = [0u8; 8192];

        loop {
            while let Some((frame, used)) = extract_frame(&self.buffer)? {
                self.buffer.drain(..used);
                let actions = self.handle_frame(frame)?;
                if let Flow::Stop = self.apply(actions).await? {
                    return Ok(());
                }
            }

            if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                error!(
                    conn_id,
                    buffer_bytes = self.buffer.len(),
                    limit = MAX_STANZA_BUFFER_SIZE,
                    "Stanza buffer exceeded size limit, closing connection"
                );
                return Err(ComponentError::protocol("stanza buffer size limit exceeded"));
            }

            let inactivity = self.ctx.settings.inactivity_timeout;
            let peer = self.peer;
            let io = self
                .io
                .as_mut()
                .ok_or_else(|| ComponentError::protocol("transport already closed"))?;

            let read = tokio::select! {
                r = tokio::time::timeout(inactivity, io.read(&mut read_buf)) => Some(r),
                _ = shutdown_signal(&mut self.shutdown) => None,
            };

            let n = match read {
                None => {
                    info!(conn_id, "Connection closed by shutdown");
                    let _ = io.write_all(STREAM_FOOTER.as_bytes()).await;
                    let _ = io.flush().await;
                    return Ok(());
                }
                Some(Ok(Ok(n))) => n,
                Some(Ok(Err(e))) => return Err(ComponentError::transport(peer.to_string(), e)),
                Some(Err(_)) => {
                    warn!(
                        conn_id,
                        timeout_secs = inactivity.as_secs(),
                        "Inactivity timeout, closing connection"
                    );
                    let _ = io.write_all(STREAM_FOOTER.as_bytes()).await;
                    let _ = io.flush().await;
                    return Ok(());
                }
            };

            if n == 0 {
                info!(conn_id, phase = %self.session.phase(), "Peer closed connection");
                return Ok(());
            }
            debug!(conn_id, bytes = n, "Received data");
            self.buffer.extend_from_slice(&read_buf[..n]);
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<Vec<Action>, ComponentError> {
        match frame {
            Frame::StreamOpen(header) => self.session.on_stream_open(&header),
            Frame::StreamClose => Ok(self.session.on_stream_close()),
            Frame::Stanza(xml) => {
                debug!(conn_id = self.session.conn_id(), data = %xml, "Inbound stanza");
                match Element::parse(&xml, self.session.peer_namespace()) {
                    Ok(stanza) => {
                        let stanza = normalize(&stanza, self.session.namespace());
                        Ok(self.session.on_stanza(&self.ctx.handlers, &stanza))
                    }
                    Err(e) => {
                        warn!(conn_id = self.session.conn_id(), error = %e, "Discarding unparsable stanza");
                        Ok(Vec::new())
                    }
                }
            }
        }
    }

    async fn apply(&mut self, actions: Vec<Action>) -> Result<Flow, ComponentError> {
        for action in actions {
            match action {
                Action::Send(xml) => self.send(&xml).await?,
                Action::UpgradeTls => self.upgrade_tls().await?,
                Action::RaiseSessionStart => {
                    self.ctx.events.raise(EventName::SessionStart, DispatchMode::Direct);
                }
                Action::Close => return Ok(Flow::Stop),
            }
        }
        Ok(Flow::Continue)
    }

    async fn send(&mut self, xml: &str) -> Result<(), ComponentError> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| ComponentError::protocol("transport already closed"))?;
        debug!(conn_id = self.session.conn_id(), data = %xml, "Outbound");
        io.write_all(xml.as_bytes())
            .await
            .map_err(|e| ComponentError::transport(self.peer.to_string(), e))?;
        io.flush()
            .await
            .map_err(|e| ComponentError::transport(self.peer.to_string(), e))
    }

    async fn upgrade_tls(&mut self) -> Result<(), ComponentError> {
        let conn_id = self.session.conn_id();
        let io = self
            .io
            .take()
            .ok_or_else(|| ComponentError::protocol("transport already closed"))?;

        info!(conn_id, peer = %self.peer, "Negotiating TLS");
        match self.ctx.upgrader.upgrade(io).await {
            Ok(tls) => {
                self.io = Some(tls);
                // Bytes read before the handshake belong to the old stream.
                self.buffer.clear();
                self.session.tls_completed(true);
                info!(conn_id, peer = %self.peer, "TLS handshake complete");
                Ok(())
            }
            Err(e) => {
                self.session.tls_completed(false);
                error!(conn_id, peer = %self.peer, error = %e, error_kind = ?e.kind(), "TLS handshake failed");
                Err(ComponentError::Negotiation {
                    peer: self.peer,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn close_transport(&mut self) {
        if let Some(mut io) = self.io.take() {
            let closed = tokio::time::timeout(Duration::from_secs(2), io.shutdown()).await;
            if closed.is_err() {
                debug!(conn_id = self.session.conn_id(), "Transport shutdown timed out");
            }
        }
    }
}
