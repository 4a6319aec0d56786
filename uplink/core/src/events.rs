//! Signal and Event Types
//!
//! Everything that moves between a backend, the manager, and the outside
//! world is an enumerated type delivered over a typed channel. There is no
//! dynamic named-event dispatch: a backend raises [`BackendEvent`]s, its
//! transport tasks report epoch-tagged [`TransportEvent`]s, both travel to
//! the manager as [`BackendSignal`]s on one shared bus, and the manager
//! fans [`ManagerEvent`]s out to any number of subscribed observers.
//!
//! # Ordering
//!
//! The bus is a single unbounded mpsc channel, so a given backend's own
//! signals are delivered in the order it raised them, and the manager
//! processes each signal to completion before looking at the next one.

use tokio::sync::mpsc;

use crate::backend::BackendId;

/// Lifecycle events a backend raises toward the manager.
///
/// The manager reacts to the top group and merely traces the bottom
/// group (`Enabled`/`Disabled`/`Accelerated` exist for observers wiring
/// directly onto the bus).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendEvent {
    /// The backend reached `Open`.
    Connected,
    /// The backend left `Open` (or was told to let go of a connection it
    /// never had; the manager treats that as a no-op removal).
    Disconnected,
    /// One connection attempt failed; the backend is back in `Idle`.
    Failed,
    /// A raw inbound message from the remote service.
    Message(String),
    /// A diagnostic line for the embedder's log sink.
    Log(String),
    /// The backend hit an unrecoverable fault and is now in `Error`.
    Error(String),
    /// The backend discovered it is categorically unsupported here.
    Unsupported,
    /// The enable flag flipped to `true`.
    Enabled,
    /// The enable flag flipped to `false` (a forced disconnect follows).
    Disabled,
    /// The accelerated-timing flag changed.
    Accelerated(bool),
}

/// Completions reported by a transport's private establishment task.
///
/// Every variant carries the epoch the attempt was started under. A
/// completion whose epoch no longer matches the backend's current epoch is
/// stale: the backend has moved on (disconnected, been disabled, started
/// a newer attempt) and the completion MUST be ignored. This is the only
/// defense against in-flight callbacks racing a disconnect, so it is a
/// hard requirement, not an optimization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection attempt succeeded.
    Established {
        /// Epoch the attempt was started under.
        epoch: u64,
    },
    /// The connection attempt failed.
    ConnectFailed {
        /// Epoch the attempt was started under.
        epoch: u64,
        /// Transport-specific failure description.
        reason: String,
    },
    /// A raw message arrived on the live connection.
    Inbound {
        /// Epoch of the connection the message arrived on.
        epoch: u64,
        /// The raw message body.
        raw: String,
    },
    /// The live connection dropped from the remote side.
    Closed {
        /// Epoch of the connection that dropped.
        epoch: u64,
    },
}

impl TransportEvent {
    /// The epoch this completion was produced under.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        match self {
            Self::Established { epoch }
            | Self::ConnectFailed { epoch, .. }
            | Self::Inbound { epoch, .. }
            | Self::Closed { epoch } => *epoch,
        }
    }
}

/// One item on the manager's signal bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendSignal {
    /// A lifecycle event raised by a backend's shared core.
    Event {
        /// The raising backend.
        id: BackendId,
        /// The event itself.
        event: BackendEvent,
    },
    /// A completion from a transport's establishment or receive task,
    /// routed back to the owning backend for epoch validation.
    Transport {
        /// The owning backend.
        id: BackendId,
        /// The completion itself.
        event: TransportEvent,
    },
    /// The self-heal timer fired. Only acted on when `generation` still
    /// matches the currently armed timer.
    Heal {
        /// Generation of the timer that fired.
        generation: u64,
    },
}

/// Sending half of the signal bus, cloned into every backend and timer.
pub type SignalSender = mpsc::UnboundedSender<BackendSignal>;

/// Receiving half of the signal bus, owned by the manager.
pub type SignalReceiver = mpsc::UnboundedReceiver<BackendSignal>;

/// Create the signal bus connecting backends to a manager.
#[must_use]
pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Notifications the manager fans out to subscribed observers.
///
/// Delivery is fire-and-forget: every subscriber gets a clone, and
/// subscribers whose receiver has been dropped are pruned on the next
/// emit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManagerEvent {
    /// A backend reached `Open` and joined the connected set.
    Connect(BackendId),
    /// A backend left the connected set.
    Disconnect(BackendId),
    /// A raw inbound message from a connected, enabled backend.
    Message {
        /// The backend the message arrived on.
        backend: BackendId,
        /// The raw message body.
        raw: String,
    },
    /// A diagnostic line from a backend.
    Log {
        /// The backend that produced the line.
        backend: BackendId,
        /// The line itself.
        line: String,
    },
    /// A counted occurrence worth reporting to telemetry; also carries
    /// the retry-policy diagnostics (`unable-to-connect-to-available-*`).
    Stat(String),
    /// A backend turned out to be unsupported in this environment.
    Unsupported(BackendId),
    /// A backend was permanently excluded from arbitration.
    Broken(BackendId),
    /// A refresh pass ran; `backend` names the active backend it targeted,
    /// if there was one.
    Refresh {
        /// The active backend at the time of the refresh, if any.
        backend: Option<BackendId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_event_epoch_accessor() {
        assert_eq!(TransportEvent::Established { epoch: 3 }.epoch(), 3);
        assert_eq!(
            TransportEvent::ConnectFailed {
                epoch: 7,
                reason: "refused".into()
            }
            .epoch(),
            7
        );
        assert_eq!(
            TransportEvent::Inbound {
                epoch: 1,
                raw: "{}".into()
            }
            .epoch(),
            1
        );
        assert_eq!(TransportEvent::Closed { epoch: 9 }.epoch(), 9);
    }

    #[test]
    fn signal_channel_roundtrip() {
        let (tx, mut rx) = signal_channel();
        tx.send(BackendSignal::Heal { generation: 1 }).unwrap();
        assert_eq!(rx.try_recv().unwrap(), BackendSignal::Heal { generation: 1 });
    }
}
