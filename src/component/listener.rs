//! Socket lifecycle: bind, listen, accept, and the arena of live connections.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::error::ComponentError;
use super::events::{DispatchMode, EventBus, EventName};

/// Pending-connection queue length passed to `listen(2)`.
pub const LISTEN_BACKLOG: u32 = 1;

/// Delay between bind/accept retries when nothing else is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Global counter for connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Whether `host` is an IP literal or a syntactically valid DNS name.
///
/// Only syntax is checked; a valid name may still fail to resolve.
pub fn is_valid_host(host: &str) -> bool {
    let literal = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if literal.parse::<IpAddr>().is_ok() {
        return true;
    }

    let name = host.strip_suffix('.').unwrap_or(host);
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

/// Delay policy applied after a failed bind or accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

pub trait Sleeper: Send + Sync + 'static {
    fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(delay)
    }
}

/// Creates a listening socket for one resolved address.
pub trait SocketBinder: Send + Sync + 'static {
    fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBinder;

impl SocketBinder for TcpBinder {
    fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    }
}

struct Slots {
    capacity: usize,
    live: Mutex<HashMap<u64, SocketAddr>>,
    freed: Notify,
}

impl Slots {
    fn live(&self) -> MutexGuard<'_, HashMap<u64, SocketAddr>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Occupies one arena slot for as long as the connection lives.
pub struct ConnectionSlot {
    id: u64,
    slots: Arc<Slots>,
}

impl ConnectionSlot {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let active = {
            let mut live = self.slots.live();
            live.remove(&self.id);
            live.len()
        };
        self.slots.freed.notify_waiters();
        info!(conn_id = self.id, active, "Connection closed");
    }
}

/// An accepted peer, exclusively owned by whoever drives it.
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub slot: ConnectionSlot,
}

impl Accepted {
    pub fn conn_id(&self) -> u64 {
        self.slot.id()
    }
}

pub struct ComponentListener<S = TokioSleeper, B = TcpBinder> {
    host: String,
    port: u16,
    backoff: Backoff,
    sleeper: S,
    binder: B,
    events: EventBus,
    listener: Option<TcpListener>,
    slots: Arc<Slots>,
    accept_failures: u32,
}

impl ComponentListener {
    pub fn new(host: impl Into<String>, port: u16, capacity: usize, events: EventBus) -> Self {
        Self {
            host: host.into(),
            port,
            backoff: Backoff::default(),
            sleeper: TokioSleeper,
            binder: TcpBinder,
            events,
            listener: None,
            slots: Arc::new(Slots {
                capacity,
                live: Mutex::new(HashMap::new()),
                freed: Notify::new(),
            }),
            accept_failures: 0,
        }
    }
}

impl<S: Sleeper, B: SocketBinder> ComponentListener<S, B> {
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper<S2: Sleeper>(self, sleeper: S2) -> ComponentListener<S2, B> {
        ComponentListener {
            host: self.host,
            port: self.port,
            backoff: self.backoff,
            sleeper,
            binder: self.binder,
            events: self.events,
            listener: self.listener,
            slots: self.slots,
            accept_failures: self.accept_failures,
        }
    }

    pub fn with_binder<B2: SocketBinder>(self, binder: B2) -> ComponentListener<S, B2> {
        ComponentListener {
            host: self.host,
            port: self.port,
            backoff: self.backoff,
            sleeper: self.sleeper,
            binder,
            events: self.events,
            listener: self.listener,
            slots: self.slots,
            accept_failures: self.accept_failures,
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity
    }

    pub fn active_connections(&self) -> usize {
        self.slots.live().len()
    }

    /// Log the failure, wait out the backoff delay and hand back a retryable error.
    async fn fail_after_backoff(
        &self,
        op: &'static str,
        address: String,
        attempt: u32,
        err: io::Error,
    ) -> ComponentError {
        let delay = self.backoff.delay(attempt);
        error!(
            address = %address,
            op,
            attempt,
            os_error = ?err.raw_os_error(),
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "Socket operation failed"
        );
        self.sleeper.sleep(delay).await;
        ComponentError::transport(address, err)
    }

    /// Resolve the configured address and start listening on the first
    /// resolved address that binds. Raises `listened` on success.
    ///
    /// A malformed host is a config error and is never retried.
    pub async fn listen(&mut self, attempt: u32) -> Result<SocketAddr, ComponentError> {
        let address = self.address();
        if !is_valid_host(&self.host) {
            error!(address = %address, "Invalid listen host");
            return Err(ComponentError::config(format!("invalid listen host '{}'", self.host)));
        }
        let host = self
            .host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host);

        let resolved: Vec<SocketAddr> =
            match tokio::net::lookup_host((host, self.port)).await {
                Ok(addrs) => addrs.collect(),
                Err(e) => return Err(self.fail_after_backoff("resolve", address, attempt, e).await),
            };

        let mut last_err =
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        for addr in resolved {
            match self.binder.bind(addr) {
                Ok(listener) => {
                    let local = listener.local_addr().unwrap_or(addr);
                    self.listener = Some(listener);
                    info!(address = %address, local = %local, backlog = LISTEN_BACKLOG, "Listening for component connections");
                    self.events.raise(EventName::Listened, DispatchMode::Direct);
                    return Ok(local);
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Bind attempt failed");
                    last_err = e;
                }
            }
        }

        Err(self.fail_after_backoff("listen", address, attempt, last_err).await)
    }

    /// Retry `listen` until it succeeds or fails with a non-retryable error.
    pub async fn listen_until_bound(&mut self) -> Result<SocketAddr, ComponentError> {
        let mut attempt: u32 = 1;
        loop {
            match self.listen(attempt).await {
                Ok(addr) => return Ok(addr),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "Retrying listen");
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait until at least one arena slot is free.
    pub async fn wait_for_free_slot(&self) {
        loop {
            let freed = self.slots.freed.notified();
            if self.active_connections() < self.slots.capacity {
                return;
            }
            freed.await;
        }
    }

    /// Accept one peer. Rejected with `ConnectionActive` while the arena is
    /// full. Raises `connected` before returning the handle.
    pub async fn accept(&mut self) -> Result<Accepted, ComponentError> {
        let address = self.address();
        let active = self.active_connections();
        if active >= self.slots.capacity {
            warn!(address = %address, active, capacity = self.slots.capacity, "Rejecting accept, arena full");
            return Err(ComponentError::ConnectionActive {
                active,
                capacity: self.slots.capacity,
            });
        }

        let listener = self.listener.as_ref().ok_or_else(|| {
            ComponentError::transport(
                address.clone(),
                io::Error::new(io::ErrorKind::NotConnected, "accept called before listen"),
            )
        })?;

        match listener.accept().await {
            Ok((stream, peer)) => {
                self.accept_failures = 0;
                let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                let active = {
                    let mut live = self.slots.live();
                    live.insert(id, peer);
                    live.len()
                };
                info!(conn_id = id, peer = %peer, active, "Accepted component connection");
                self.events.raise(EventName::Connected, DispatchMode::Direct);
                Ok(Accepted {
                    stream,
                    peer,
                    slot: ConnectionSlot {
                        id,
                        slots: self.slots.clone(),
                    },
                })
            }
            Err(e) => {
                self.accept_failures = self.accept_failures.saturating_add(1);
                let attempt = self.accept_failures;
                Err(self.fail_after_backoff("accept", address, attempt, e).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::events::EventBusBuilder;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Default)]
    struct RecordingSleeper {
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, delay: Duration) -> impl Future<Output = ()> + Send {
            self.sleeps.lock().unwrap().push(delay);
            std::future::ready(())
        }
    }

    /// Fails the first `failures` binds with `AddrInUse`.
    struct FlakyBinder {
        failures: AtomicUsize,
    }

    impl SocketBinder for FlakyBinder {
        fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }
            TcpBinder.bind(addr)
        }
    }

    fn counting_bus(names: &[EventName]) -> (EventBus, Arc<Mutex<Vec<EventName>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut builder = EventBusBuilder::new();
        for &name in names {
            let seen = seen.clone();
            builder.on(name, move |event| seen.lock().unwrap().push(event.name));
        }
        (builder.build(), seen)
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(50), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(4), Duration::from_millis(800));
        assert_eq!(backoff.delay(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_bind_failures_retry_then_listened_once() {
        let (events, seen) = counting_bus(&[EventName::Listened]);
        let sleeper = RecordingSleeper::default();
        let mut listener = ComponentListener::new("127.0.0.1", 0, 1, events)
            .with_backoff(Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(30),
            })
            .with_sleeper(sleeper.clone())
            .with_binder(FlakyBinder {
                failures: AtomicUsize::new(3),
            });

        let addr = listener.listen_until_bound().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(listener.local_addr(), Some(addr));
        assert_eq!(*seen.lock().unwrap(), vec![EventName::Listened]);
        assert_eq!(
            *sleeper.sleeps.lock().unwrap(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_listen_sleeps_and_raises_nothing() {
        let (events, seen) = counting_bus(&[EventName::Listened]);
        let sleeper = RecordingSleeper::default();
        let mut listener = ComponentListener::new("127.0.0.1", 0, 1, events)
            .with_sleeper(sleeper.clone())
            .with_binder(FlakyBinder {
                failures: AtomicUsize::new(1),
            });

        let err = listener.listen(1).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("127.0.0.1:0"));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(*sleeper.sleeps.lock().unwrap(), vec![DEFAULT_RETRY_DELAY]);
        assert!(listener.local_addr().is_none());
    }

    #[test]
    fn test_host_syntax() {
        for host in ["127.0.0.1", "::1", "[::1]", "localhost", "component.example.org", "xmpp-1.example.org."] {
            assert!(is_valid_host(host), "{} should be accepted", host);
        }
        let long_label = "a".repeat(64);
        for host in ["", "not a valid host!!", "-bad.example.org", "bad-.example.org", "a..b", long_label.as_str(), "[example.org]"] {
            assert!(!is_valid_host(host), "{:?} should be rejected", host);
        }
    }

    #[tokio::test]
    async fn test_invalid_host_is_config_error_without_retry() {
        let (events, seen) = counting_bus(&[EventName::Listened]);
        let sleeper = RecordingSleeper::default();
        let mut listener =
            ComponentListener::new("not a valid host!!", 5347, 1, events).with_sleeper(sleeper.clone());

        let err = listener.listen_until_bound().await.unwrap_err();
        assert!(matches!(err, ComponentError::Config(_)));
        assert!(!err.is_retryable());
        assert!(sleeper.sleeps.lock().unwrap().is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bracketed_ipv6_literal_is_accepted() {
        let (events, _) = counting_bus(&[]);
        let mut listener = ComponentListener::new("[::1]", 0, 1, events);
        // No IPv6 loopback on the host gives a transport error, never a config error.
        match listener.listen(1).await {
            Ok(addr) => assert!(addr.is_ipv6()),
            Err(e) => assert!(e.is_retryable()),
        }
    }

    #[tokio::test]
    async fn test_accept_before_listen_is_transport_error() {
        let (events, _) = counting_bus(&[]);
        let mut listener = ComponentListener::new("127.0.0.1", 0, 1, events);
        let err = listener.accept().await.err().unwrap();
        assert!(matches!(err, ComponentError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_accept_rejected_while_arena_full() {
        let (events, seen) = counting_bus(&[EventName::Connected]);
        let mut listener = ComponentListener::new("127.0.0.1", 0, 1, events);
        let addr = listener.listen(1).await.unwrap();

        let _first_client = TcpStream::connect(addr).await.unwrap();
        let first = listener.accept().await.unwrap();
        assert_eq!(listener.active_connections(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);

        let _second_client = TcpStream::connect(addr).await.unwrap();
        let err = listener.accept().await.err().unwrap();
        assert!(matches!(
            err,
            ComponentError::ConnectionActive {
                active: 1,
                capacity: 1
            }
        ));
        assert_eq!(seen.lock().unwrap().len(), 1);

        drop(first);
        assert_eq!(listener.active_connections(), 0);
        let second = listener.accept().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_ne!(second.conn_id(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_free_slot_wakes_on_release() {
        let (events, _) = counting_bus(&[]);
        let mut listener = ComponentListener::new("127.0.0.1", 0, 1, events);
        let addr = listener.listen(1).await.unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let accepted = listener.accept().await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), listener.wait_for_free_slot()).await;
        assert!(waiting.is_err(), "arena is full");

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(accepted);
        });
        tokio::time::timeout(Duration::from_secs(2), listener.wait_for_free_slot())
            .await
            .expect("slot should be released");
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_ids_are_unique() {
        let (events, _) = counting_bus(&[]);
        let mut listener = ComponentListener::new("127.0.0.1", 0, 2, events);
        let addr = listener.listen(1).await.unwrap();
        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        let first = listener.accept().await.unwrap();
        let second = listener.accept().await.unwrap();
        assert_ne!(first.conn_id(), second.conn_id());
        assert_eq!(listener.active_connections(), 2);
    }
}
