//! Component stream negotiation.
//!
//! [`StreamSession`] holds the per-connection negotiation state and turns
//! inbound frames into [`Action`]s. It never touches the transport; the
//! connection driver executes the actions and reports the TLS handshake
//! result back.
//!
//! ```text
//! AwaitingStreamOpen --open--> FeaturesOffered   (STARTTLS mandatory, not yet done)
//! AwaitingStreamOpen --open--> Established       (otherwise, session_start once)
//! FeaturesOffered    --starttls--> TlsNegotiating
//! TlsNegotiating     --handshake ok--> AwaitingStreamOpen (stream restart)
//! TlsNegotiating     --handshake failed--> Closed
//! ```

use std::fmt;

use tracing::{debug, info, warn};

use super::element::{Element, NS_CLIENT, NS_STREAMS, NS_TLS};
use super::error::ComponentError;
use super::events::{HandlerRegistry, Signal, Stage};
use super::framing::{stream_header, StreamHeader, STREAM_FOOTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingStreamOpen,
    FeaturesOffered,
    TlsNegotiating,
    Established,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::AwaitingStreamOpen => "awaiting_stream_open",
            Phase::FeaturesOffered => "features_offered",
            Phase::TlsNegotiating => "tls_negotiating",
            Phase::Established => "established",
            Phase::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Work the connection driver must perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(String),
    /// Wrap the transport in TLS, then call [`StreamSession::tls_completed`].
    UpgradeTls,
    RaiseSessionStart,
    Close,
}

pub fn starttls_features() -> Element {
    Element::new("features", NS_STREAMS)
        .with_child(Element::new("starttls", NS_TLS).with_child(Element::new("required", NS_TLS)))
}

pub fn starttls_proceed() -> Element {
    Element::new("proceed", NS_TLS)
}

pub fn starttls_failure() -> Element {
    Element::new("failure", NS_TLS)
}

pub struct StreamSession {
    conn_id: u64,
    component_jid: String,
    namespace: String,
    stream_id: String,
    peer_ns: String,
    phase: Phase,
    use_tls: bool,
    tls_established: bool,
    session_started: bool,
}

impl StreamSession {
    /// `transport_encrypted` is set when the transport was TLS-wrapped at
    /// accept time, in which case no STARTTLS offer is made.
    pub fn new(
        conn_id: u64,
        component_jid: impl Into<String>,
        namespace: impl Into<String>,
        use_tls: bool,
        transport_encrypted: bool,
    ) -> Self {
        Self {
            conn_id,
            component_jid: component_jid.into(),
            namespace: namespace.into(),
            stream_id: String::new(),
            peer_ns: NS_CLIENT.to_string(),
            phase: Phase::AwaitingStreamOpen,
            use_tls,
            tls_established: transport_encrypted,
            session_started: false,
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Default namespace the peer declared on its stream header.
    pub fn peer_namespace(&self) -> &str {
        &self.peer_ns
    }

    pub fn tls_established(&self) -> bool {
        self.tls_established
    }

    pub fn session_started(&self) -> bool {
        self.session_started
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn on_stream_open(&mut self, header: &StreamHeader) -> Result<Vec<Action>, ComponentError> {
        if self.phase != Phase::AwaitingStreamOpen {
            warn!(conn_id = self.conn_id, phase = %self.phase, "Ignoring stream open outside awaiting_stream_open");
            return Ok(Vec::new());
        }
        header.validate()?;

        if let Some(ns) = &header.default_ns {
            self.peer_ns = ns.clone();
        }
        self.stream_id = uuid::Uuid::new_v4().to_string();
        debug!(conn_id = self.conn_id, stream_id = %self.stream_id, from = ?header.from, to = ?header.to, "Peer opened stream");

        let mut actions = vec![Action::Send(stream_header(
            &self.namespace,
            &self.stream_id,
            &self.component_jid,
        ))];

        if self.use_tls && !self.tls_established {
            actions.push(Action::Send(starttls_features().to_stream_xml(&self.namespace)));
            self.phase = Phase::FeaturesOffered;
            debug!(conn_id = self.conn_id, "Offered mandatory STARTTLS");
        } else {
            self.phase = Phase::Established;
            if !self.session_started {
                self.session_started = true;
                info!(conn_id = self.conn_id, stream_id = %self.stream_id, tls = self.tls_established, "Session established");
                actions.push(Action::RaiseSessionStart);
            }
        }
        Ok(actions)
    }

    /// Handle a normalized top-level stanza.
    pub fn on_stanza(&mut self, handlers: &HandlerRegistry, stanza: &Element) -> Vec<Action> {
        match self.phase {
            Phase::FeaturesOffered => {
                let dispatch = handlers.dispatch(stanza, Stage::Negotiation);
                match dispatch.signal {
                    Some(Signal::StartTls) => {
                        self.phase = Phase::TlsNegotiating;
                        info!(conn_id = self.conn_id, "STARTTLS requested, proceeding");
                        vec![
                            Action::Send(starttls_proceed().to_xml()),
                            Action::UpgradeTls,
                        ]
                    }
                    None => {
                        warn!(
                            conn_id = self.conn_id,
                            stanza = %stanza.qualified_name(),
                            "Ignoring stanza before STARTTLS negotiation"
                        );
                        Vec::new()
                    }
                }
            }
            Phase::Established => {
                let dispatch = handlers.dispatch(stanza, Stage::Session);
                match dispatch.signal {
                    Some(Signal::StartTls) => self.reject_starttls(),
                    None => {
                        if dispatch.matched.is_empty() {
                            debug!(conn_id = self.conn_id, stanza = %stanza.qualified_name(), "No handler matched stanza");
                        }
                        Vec::new()
                    }
                }
            }
            Phase::AwaitingStreamOpen | Phase::TlsNegotiating
                if handlers.dispatch(stanza, Stage::Negotiation).signal == Some(Signal::StartTls) =>
            {
                self.reject_starttls()
            }
            Phase::AwaitingStreamOpen | Phase::TlsNegotiating | Phase::Closed => {
                warn!(
                    conn_id = self.conn_id,
                    phase = %self.phase,
                    stanza = %stanza.qualified_name(),
                    "Ignoring stanza outside an open stream"
                );
                Vec::new()
            }
        }
    }

    /// STARTTLS is only valid right after the features offer.
    fn reject_starttls(&mut self) -> Vec<Action> {
        warn!(
            conn_id = self.conn_id,
            phase = %self.phase,
            tls = self.tls_established,
            "Rejecting STARTTLS outside features_offered"
        );
        self.phase = Phase::Closed;
        vec![
            Action::Send(starttls_failure().to_xml()),
            Action::Send(STREAM_FOOTER.to_string()),
            Action::Close,
        ]
    }

    /// Report the outcome of the TLS handshake requested by [`Action::UpgradeTls`].
    pub fn tls_completed(&mut self, success: bool) {
        if self.phase != Phase::TlsNegotiating {
            return;
        }
        if success {
            self.tls_established = true;
            self.phase = Phase::AwaitingStreamOpen;
            debug!(conn_id = self.conn_id, "TLS established, awaiting stream restart");
        } else {
            self.phase = Phase::Closed;
        }
    }

    pub fn on_stream_close(&mut self) -> Vec<Action> {
        if self.phase == Phase::Closed {
            return Vec::new();
        }
        debug!(conn_id = self.conn_id, phase = %self.phase, "Peer closed stream");
        self.phase = Phase::Closed;
        vec![Action::Send(STREAM_FOOTER.to_string()), Action::Close]
    }

    /// Transport went away. Pending transitions become no-ops.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }
}
