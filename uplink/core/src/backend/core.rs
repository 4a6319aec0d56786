//! Shared backend mechanics: the state machine, the flags, and the epoch.

use super::config::BackendConfig;
use super::traits::{BackendId, BackendKind, BackendState};
use crate::events::{BackendEvent, BackendSignal, SignalSender};

/// The state a concrete backend composes with its transport.
///
/// All state transitions and all event emission go through this type, so
/// a transport implementation cannot put the backend into an inconsistent
/// state. The epoch counter increments every time a new connection
/// attempt starts and every time the current connection is torn down;
/// transport completions carrying an older epoch are discarded by the
/// owning backend before they reach any transition here.
#[derive(Debug)]
pub struct BackendCore {
    id: BackendId,
    kind: BackendKind,
    state: BackendState,
    enabled: bool,
    accelerated: bool,
    config: BackendConfig,
    last_error: Option<String>,
    epoch: u64,
    bus: SignalSender,
}

impl BackendCore {
    /// A core carrying its kind's canonical identifier.
    #[must_use]
    pub fn new(kind: BackendKind, config: BackendConfig, bus: SignalSender) -> Self {
        Self::with_id(kind.canonical_id(), kind, config, bus)
    }

    /// A core with an explicit identifier, for hosting several backends
    /// of the same kind side by side.
    #[must_use]
    pub fn with_id(
        id: BackendId,
        kind: BackendKind,
        config: BackendConfig,
        bus: SignalSender,
    ) -> Self {
        Self {
            id,
            kind,
            state: BackendState::Idle,
            enabled: true,
            accelerated: false,
            config,
            last_error: None,
            epoch: 0,
            bus,
        }
    }

    /// This backend's identifier.
    #[must_use]
    pub fn id(&self) -> &BackendId {
        &self.id
    }

    /// This backend's kind.
    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BackendState {
        self.state
    }

    /// Whether the backend may initiate connections.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the accelerated timing profile is in effect.
    #[must_use]
    pub fn accelerated(&self) -> bool {
        self.accelerated
    }

    /// The current connection epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The fault message recorded by the last [`BackendCore::record_error`].
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// A clone of the signal bus handle, for transport tasks that must
    /// report completions from a spawned context.
    #[must_use]
    pub fn bus(&self) -> SignalSender {
        self.bus.clone()
    }

    /// Shared configuration, raw. Most callers want
    /// [`BackendCore::config_value`] instead.
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Mutable access to the configuration, for merges.
    pub fn config_mut(&mut self) -> &mut BackendConfig {
        &mut self.config
    }

    /// Configuration lookup honoring the current accelerated flag.
    #[must_use]
    pub fn config_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key, self.accelerated)
    }

    /// [`BackendCore::config_value`] narrowed to an unsigned integer.
    #[must_use]
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get_u64(key, self.accelerated)
    }

    /// Raise a lifecycle event onto the signal bus.
    pub fn emit(&self, event: BackendEvent) {
        let _ = self.bus.send(BackendSignal::Event {
            id: self.id.clone(),
            event,
        });
    }

    /// Gate a new connection attempt. Returns the epoch to tag the
    /// attempt with, or `None` when the backend is disabled or not
    /// `Idle` (an attempt is already in flight, the connection is open,
    /// or the backend is in `Error`).
    pub fn begin_connecting(&mut self) -> Option<u64> {
        if !self.enabled || self.state != BackendState::Idle {
            return None;
        }
        self.state = BackendState::Connecting;
        self.epoch += 1;
        tracing::debug!(backend = %self.id, epoch = self.epoch, "connecting");
        Some(self.epoch)
    }

    /// Invalidate any in-flight transport completions.
    pub fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// The in-flight attempt succeeded.
    pub fn opened(&mut self) {
        self.state = BackendState::Open;
        tracing::info!(backend = %self.id, "connected");
        self.emit(BackendEvent::Connected);
    }

    /// The connection (or attempt) is gone; back to `Idle`.
    pub fn closed(&mut self) {
        self.state = BackendState::Idle;
        self.emit(BackendEvent::Disconnected);
    }

    /// The in-flight attempt failed; back to `Idle`.
    pub fn connect_failed(&mut self) {
        self.state = BackendState::Idle;
        self.emit(BackendEvent::Failed);
    }

    /// Flip the enable flag. Returns whether the value actually changed;
    /// the owning backend is responsible for the forced disconnect on a
    /// `true` to `false` transition.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        if self.enabled == enabled {
            return false;
        }
        self.enabled = enabled;
        tracing::debug!(backend = %self.id, enabled, "enable flag changed");
        self.emit(if enabled {
            BackendEvent::Enabled
        } else {
            BackendEvent::Disabled
        });
        true
    }

    /// Flip the accelerated flag. Returns whether the value changed.
    pub fn set_accelerated(&mut self, accelerated: bool) -> bool {
        if self.accelerated == accelerated {
            return false;
        }
        self.accelerated = accelerated;
        self.emit(BackendEvent::Accelerated(accelerated));
        true
    }

    /// Record an unrecoverable fault. The backend stays in `Error` until
    /// something outside explicitly reinstates it.
    pub fn record_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(backend = %self.id, %message, "backend fault");
        self.state = BackendState::Error;
        self.last_error = Some(message.clone());
        self.emit(BackendEvent::Error(message));
    }

    /// Clear an `Error` state back to `Idle`. No-op in any other state.
    pub fn reinstate(&mut self) {
        if self.state == BackendState::Error {
            self.state = BackendState::Idle;
            self.last_error = None;
        }
    }

    /// Raise a diagnostic line for the embedder's log sink.
    pub fn log(&self, line: impl Into<String>) {
        self.emit(BackendEvent::Log(line.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::signal_channel;

    fn core() -> (BackendCore, crate::events::SignalReceiver) {
        let (tx, rx) = signal_channel();
        (
            BackendCore::new(BackendKind::Simulated, BackendConfig::new(), tx),
            rx,
        )
    }

    #[test]
    fn begin_connecting_requires_idle_and_enabled() {
        let (mut core, _rx) = core();
        assert_eq!(core.begin_connecting(), Some(1));
        // already connecting
        assert_eq!(core.begin_connecting(), None);
        core.opened();
        assert_eq!(core.begin_connecting(), None);
        core.closed();
        core.set_enabled(false);
        assert_eq!(core.begin_connecting(), None);
    }

    #[test]
    fn epoch_advances_per_attempt_and_teardown() {
        let (mut core, _rx) = core();
        assert_eq!(core.begin_connecting(), Some(1));
        core.connect_failed();
        assert_eq!(core.begin_connecting(), Some(2));
        core.opened();
        assert_eq!(core.bump_epoch(), 3);
    }

    #[test]
    fn error_state_holds_until_reinstated() {
        let (mut core, _rx) = core();
        core.record_error("out of disk");
        assert_eq!(core.state(), BackendState::Error);
        assert_eq!(core.last_error(), Some("out of disk"));
        assert_eq!(core.begin_connecting(), None);
        core.reinstate();
        assert_eq!(core.state(), BackendState::Idle);
        assert_eq!(core.last_error(), None);
        assert_eq!(core.begin_connecting(), Some(1));
    }

    #[test]
    fn flag_changes_emit_once() {
        let (mut core, mut rx) = core();
        assert!(core.set_enabled(false));
        assert!(!core.set_enabled(false));
        assert!(core.set_accelerated(true));
        assert!(!core.set_accelerated(true));

        let mut events = Vec::new();
        while let Ok(signal) = rx.try_recv() {
            if let BackendSignal::Event { event, .. } = signal {
                events.push(event);
            }
        }
        assert_eq!(
            events,
            vec![BackendEvent::Disabled, BackendEvent::Accelerated(true)]
        );
    }
}
