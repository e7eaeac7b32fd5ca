//! XMPP external component server (XEP-0114 style accept stream with
//! mandatory STARTTLS).
//!
//! Architecture:
//! ```text
//! ComponentListener ──accept──> Connection task (one per peer)
//!                                 │ framing: bytes -> Frame
//!                                 │ namespace: jabber:client -> component ns
//!                                 │ negotiation: StreamSession -> Actions
//!                                 └ events / handlers (frozen at build time)
//! ```

pub mod connection;
pub mod element;
pub mod error;
pub mod events;
pub mod framing;
pub mod listener;
pub mod namespace;
pub mod negotiation;
pub mod tls;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::ComponentConfig;
use connection::{BoxedIo, Connection, ConnectionContext, SessionSettings, TlsUpgrader};
use events::{EventBus, EventBusBuilder, EventName, HandlerRegistry, LifecycleEvent, Matcher};
use listener::{Accepted, ComponentListener};
use tls::{build_acceptor, RustlsUpgrader};

pub use element::Element;
pub use error::ComponentError;

/// How long shutdown waits for live connections to send their footer.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Collects subscribers and handlers; both are frozen by [`ComponentBuilder::build`].
pub struct ComponentBuilder {
    config: ComponentConfig,
    events: EventBusBuilder,
    handlers: HandlerRegistry,
}

impl ComponentBuilder {
    pub fn new(config: ComponentConfig) -> Self {
        Self {
            config,
            events: EventBusBuilder::new(),
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn on_event<F>(&mut self, name: EventName, callback: F) -> &mut Self
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.on(name, callback);
        self
    }

    /// Register a handler for established-session stanzas matching `path`
    /// (e.g. `{jabber:component:accept}message`).
    pub fn register_handler<F>(&mut self, name: &str, path: &str, callback: F) -> &mut Self
    where
        F: Fn(&Element) + Send + Sync + 'static,
    {
        self.handlers.register(name, Matcher::xpath(path), callback);
        self
    }

    /// Validate the configuration and load TLS material when TLS is enabled.
    pub fn build(self) -> Result<Component<Option<RustlsUpgrader>>, ComponentError> {
        self.config.validate()?;
        let upgrader = if self.config.tls_required() {
            Some(RustlsUpgrader::new(build_acceptor(&self.config.tls)?))
        } else {
            None
        };
        self.build_with_upgrader(upgrader)
    }

    pub fn build_with_upgrader<U: TlsUpgrader>(self, upgrader: U) -> Result<Component<U>, ComponentError> {
        self.config.validate()?;
        let config = self.config;
        let events = self.events.build();

        let listener = ComponentListener::new(
            config.host.clone(),
            config.port,
            config.max_connections,
            events.clone(),
        )
        .with_backoff(config.backoff());

        let ctx = ConnectionContext {
            settings: SessionSettings {
                component_jid: config.jid.clone(),
                namespace: config.namespace.clone(),
                use_tls: config.tls.starttls,
                implicit_tls: config.tls.implicit,
                inactivity_timeout: config.inactivity_timeout(),
            },
            handlers: self.handlers,
            events,
            upgrader,
        };

        info!(
            jid = %config.jid,
            address = %format!("{}:{}", config.host, config.port),
            starttls = config.tls.starttls,
            implicit_tls = config.tls.implicit,
            handlers = ctx.handlers.len(),
            "Component configured"
        );

        Ok(Component {
            listener,
            ctx: Arc::new(ctx),
        })
    }
}

pub struct Component<U> {
    listener: ComponentListener,
    ctx: Arc<ConnectionContext<U>>,
}

impl<U: TlsUpgrader> Component<U> {
    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Bind the listening socket, retrying with backoff until it succeeds.
    pub async fn bind(&mut self) -> Result<SocketAddr, ComponentError> {
        self.listener.listen_until_bound().await
    }

    /// Accept and serve connections until `shutdown` fires.
    ///
    /// Binds first unless [`Component::bind`] was already called.
    pub async fn run(mut self, shutdown: broadcast::Sender<()>) -> Result<(), ComponentError> {
        let _queue_worker = self.ctx.events.spawn_queue_worker();
        let mut shutdown_rx = shutdown.subscribe();

        if self.listener.local_addr().is_none() {
            tokio::select! {
                bound = self.listener.listen_until_bound() => { bound?; }
                _ = shutdown_rx.recv() => return Ok(()),
            }
        }

        let mut tasks = JoinSet::new();
        loop {
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                _ = self.listener.wait_for_free_slot() => {}
                _ = shutdown_rx.recv() => break,
            }

            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown_rx.recv() => break,
            };

            match accepted {
                Ok(accepted) => {
                    let ctx = self.ctx.clone();
                    tasks.spawn(handle_connection(accepted, ctx, shutdown.subscribe()));
                }
                Err(ComponentError::ConnectionActive { .. }) => continue,
                // The listener already waited out the backoff delay.
                Err(e) if e.is_retryable() => warn!(error = %e, "Accept failed, retrying"),
                Err(e) => return Err(e),
            }
        }

        info!(live = tasks.len(), "Shutting down component listener");
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(live = tasks.len(), "Aborting connections still open after shutdown grace");
            tasks.abort_all();
        }
        Ok(())
    }
}

async fn handle_connection<U: TlsUpgrader>(
    accepted: Accepted,
    ctx: Arc<ConnectionContext<U>>,
    shutdown: broadcast::Receiver<()>,
) {
    let Accepted { stream, peer, slot } = accepted;
    let conn_id = slot.id();
    let started = Instant::now();
    let implicit_tls = ctx.settings.implicit_tls;

    let plain: BoxedIo = Box::new(stream);
    let io = if implicit_tls {
        match ctx.upgrader.upgrade(plain).await {
            Ok(tls) => tls,
            Err(e) => {
                error!(conn_id, peer = %peer, error = %e, "Implicit TLS handshake failed");
                return;
            }
        }
    } else {
        plain
    };

    let mut conn = Connection::new(conn_id, peer, io, implicit_tls, ctx, Some(shutdown));
    let duration_ms = || started.elapsed().as_millis() as u64;
    match conn.run().await {
        Ok(()) => info!(
            conn_id,
            peer = %peer,
            tls = conn.session().tls_established(),
            session_started = conn.session().session_started(),
            duration_ms = duration_ms(),
            "Connection ended"
        ),
        Err(e) => warn!(
            conn_id,
            peer = %peer,
            error = %e,
            duration_ms = duration_ms(),
            "Connection failed"
        ),
    }
    drop(slot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn plain_config() -> ComponentConfig {
        ComponentConfig {
            jid: "component.example.org".to_string(),
            port: 0,
            tls: TlsConfig {
                starttls: false,
                ..TlsConfig::default()
            },
            ..ComponentConfig::default()
        }
    }

    fn counter(builder: &mut ComponentBuilder, name: EventName) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        builder.on_event(name, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
                .await
                .expect("server should respond")
                .unwrap();
            assert!(n > 0, "server closed before sending {:?}", needle);
            collected.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&collected).into_owned();
            if text.contains(needle) {
                return text;
            }
        }
    }

    #[test]
    fn test_build_without_certificate_fails() {
        let config = ComponentConfig {
            tls: TlsConfig::default(),
            ..plain_config()
        };
        let err = ComponentBuilder::new(config).build().err().unwrap();
        assert!(matches!(err, ComponentError::Config(_)));
    }

    #[test]
    fn test_build_with_unreadable_certificate_fails() {
        let config = ComponentConfig {
            tls: TlsConfig {
                cert_path: Some("/nonexistent/cert.pem".into()),
                key_path: Some("/nonexistent/key.pem".into()),
                ..TlsConfig::default()
            },
            ..plain_config()
        };
        let err = ComponentBuilder::new(config).build().err().unwrap();
        assert!(matches!(err, ComponentError::Config(_)));
    }

    #[test]
    fn test_build_with_malformed_host_fails() {
        let config = ComponentConfig {
            host: "not a valid host!!".to_string(),
            ..plain_config()
        };
        let err = ComponentBuilder::new(config).build().err().unwrap();
        assert!(matches!(err, ComponentError::Config(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_plain_component_end_to_end() {
        let mut builder = ComponentBuilder::new(plain_config());
        let listened = counter(&mut builder, EventName::Listened);
        let connected = counter(&mut builder, EventName::Connected);
        let sessions = counter(&mut builder, EventName::SessionStart);
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let sink = bodies.clone();
        builder.register_handler("messages", "{jabber:component:accept}message", move |msg| {
            if let Some(body) = msg.get_child("body", element::NS_COMPONENT_ACCEPT) {
                sink.lock().unwrap().push(body.text());
            }
        });

        let mut component = builder.build().unwrap();
        let addr = component.bind().await.unwrap();
        assert_eq!(component.local_addr(), Some(addr));
        assert_eq!(listened.load(Ordering::SeqCst), 1);

        let (shutdown_tx, _) = broadcast::channel(1);
        let server = tokio::spawn(component.run(shutdown_tx.clone()));

        let mut peer = TcpStream::connect(addr).await.unwrap();
        peer.write_all(b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='component.example.org'>")
            .await
            .unwrap();
        let greeting = read_until(&mut peer, "version='1.0'>").await;
        assert!(greeting.contains("from='component.example.org'"));
        assert!(!greeting.contains("starttls"));

        peer.write_all(b"<message to='bot@component.example.org'><body>ping</body></message>")
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while bodies.lock().unwrap().is_empty() {
            assert!(Instant::now() < deadline, "stanza never reached the handler");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*bodies.lock().unwrap(), vec!["ping".to_string()]);
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(sessions.load(Ordering::SeqCst), 1);

        shutdown_tx.send(()).unwrap();
        read_until(&mut peer, "</stream:stream>").await;
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(listened.load(Ordering::SeqCst), 1);
    }
}
