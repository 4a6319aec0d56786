//! The backend trait and its identity types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::core::BackendCore;
use crate::events::{BackendEvent, TransportEvent};

/// Stable, opaque identifier of one backend instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendId(String);

impl BackendId {
    /// Wrap a string identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The transport family a backend belongs to. The manager's retry and
/// failover policy is keyed on this, not on the concrete type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Direct socket connection to a locally running service.
    Socket,
    /// Privileged helper component that may not be installed.
    Privileged,
    /// Browser-style messaging bridge.
    Messaging,
    /// In-process loopback, for demos and tests.
    Simulated,
}

impl BackendKind {
    /// The conventional identifier for a backend of this kind.
    #[must_use]
    pub fn canonical_id(self) -> BackendId {
        BackendId::new(self.as_str())
    }

    /// Lowercase name of the kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::Privileged => "privileged",
            Self::Messaging => "messaging",
            Self::Simulated => "simulated",
        }
    }
}

/// Backend lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendState {
    /// No connection and no attempt in flight.
    Idle,
    /// An establishment attempt is in flight.
    Connecting,
    /// The connection is live.
    Open,
    /// Unrecoverable fault; held until explicitly reinstated.
    Error,
}

/// One logical connection to a remote service.
///
/// Implementations provide the transport hooks (`start_connect`,
/// `close_transport`, `transport_send`) plus the optional probing and
/// refresh hooks; the lifecycle choreography is provided here and routes
/// every transition through the embedded [`BackendCore`].
#[async_trait]
pub trait Backend: Send {
    /// The embedded shared core.
    fn core(&self) -> &BackendCore;

    /// Mutable access to the embedded shared core.
    fn core_mut(&mut self) -> &mut BackendCore;

    /// Kick off one establishment attempt. The transport must report the
    /// outcome as a [`TransportEvent`] tagged with `epoch`, typically
    /// from a spawned task via [`BackendCore::bus`].
    fn start_connect(&mut self, epoch: u64);

    /// Tear down any live connection or in-flight attempt. Must be
    /// idempotent; completions from the torn-down attempt are already
    /// fenced off by the epoch.
    fn close_transport(&mut self);

    /// Push one serialized message onto the live connection.
    fn transport_send(&mut self, name: &str, data: &str);

    /// Whether this backend could plausibly connect in the current
    /// environment. Used for the startup probe and for post-failure
    /// re-checks; the default is unconditionally reachable.
    async fn available(&mut self) -> bool {
        true
    }

    /// Poke the environment so a newly installed component can be picked
    /// up. Only meaningful when [`Backend::supports_refresh`] says so.
    fn refresh(&mut self) {}

    /// Whether [`Backend::refresh`] does anything for this backend.
    fn supports_refresh(&self) -> bool {
        false
    }

    /// This backend's identifier.
    fn id(&self) -> BackendId {
        self.core().id().clone()
    }

    /// This backend's kind.
    fn kind(&self) -> BackendKind {
        self.core().kind()
    }

    /// Current lifecycle state.
    fn state(&self) -> BackendState {
        self.core().state()
    }

    /// Begin connecting. No-op unless the backend is enabled and `Idle`.
    fn connect(&mut self) {
        if let Some(epoch) = self.core_mut().begin_connecting() {
            self.start_connect(epoch);
        }
    }

    /// Drop whatever connection exists, announce the disconnect, and,
    /// when still enabled, immediately begin a fresh attempt. The epoch
    /// bump fences off completions from the abandoned connection.
    fn disconnect(&mut self) {
        self.close_transport();
        self.core_mut().bump_epoch();
        self.core_mut().closed();
        self.connect();
    }

    /// Flip the enable flag; disabling forces a disconnect, and the
    /// reconnect inside it is then gated off by the cleared flag.
    fn set_enabled(&mut self, enabled: bool) {
        if self.core_mut().set_enabled(enabled) && !enabled {
            self.disconnect();
        }
    }

    /// Flip the accelerated timing profile.
    fn set_accelerated(&mut self, accelerated: bool) {
        self.core_mut().set_accelerated(accelerated);
    }

    /// Serialize and send one outbound message. Strings pass through
    /// verbatim; anything else is JSON-encoded. Silently dropped unless
    /// the connection is `Open`.
    fn send(&mut self, name: &str, data: &Value) {
        tracing::debug!(backend = %self.core().id(), message = name, "send");
        let text = match data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if self.core().state() == BackendState::Open {
            self.transport_send(name, &text);
        }
    }

    /// Apply one transport completion. Completions from a superseded
    /// epoch are discarded outright; current ones drive the state
    /// machine.
    fn transport_event(&mut self, event: TransportEvent) {
        if event.epoch() != self.core().epoch() {
            tracing::trace!(
                backend = %self.core().id(),
                stale = event.epoch(),
                current = self.core().epoch(),
                "stale transport completion dropped"
            );
            return;
        }
        match event {
            TransportEvent::Established { .. } => {
                if self.core().state() == BackendState::Connecting && self.core().enabled() {
                    self.core_mut().opened();
                } else {
                    self.close_transport();
                }
            }
            TransportEvent::ConnectFailed { reason, .. } => {
                if self.core().state() == BackendState::Connecting {
                    self.core_mut().log(format!("connection error: {reason}"));
                    self.core_mut().connect_failed();
                }
            }
            TransportEvent::Inbound { raw, .. } => {
                if self.core().state() == BackendState::Open && self.core().enabled() {
                    self.core_mut().emit(BackendEvent::Message(raw));
                }
            }
            TransportEvent::Closed { .. } => {
                if self.core().state() == BackendState::Open {
                    self.disconnect();
                }
            }
        }
    }
}
