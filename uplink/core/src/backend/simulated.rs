//! Loopback backend with scriptable connection outcomes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::config::BackendConfig;
use super::core::BackendCore;
use super::traits::{Backend, BackendId, BackendKind};
use crate::events::{BackendSignal, SignalSender, TransportEvent};

/// Outcome of one scripted connection attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// The attempt succeeds.
    Establish,
    /// The attempt fails with the given reason.
    Fail(String),
}

#[derive(Debug)]
struct ScriptState {
    outcomes: VecDeque<ScriptedOutcome>,
    fallback: ScriptedOutcome,
    available: bool,
    connect_attempts: u64,
    refresh_calls: u64,
}

/// Shared handle controlling a [`SimulatedBackend`] from the outside.
///
/// Outcomes queued here are consumed one per connection attempt; once the
/// queue runs dry the fallback outcome (initially [`ScriptedOutcome::Establish`])
/// applies. The handle stays valid after the backend has been boxed and
/// handed to a manager, which is the whole point.
#[derive(Clone, Debug)]
pub struct SimulatedScript {
    inner: Arc<Mutex<ScriptState>>,
}

impl SimulatedScript {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptState {
                outcomes: VecDeque::new(),
                fallback: ScriptedOutcome::Establish,
                available: true,
                connect_attempts: 0,
                refresh_calls: 0,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_outcome(&self) -> ScriptedOutcome {
        let mut state = self.lock();
        state.connect_attempts += 1;
        let fallback = state.fallback.clone();
        state.outcomes.pop_front().unwrap_or(fallback)
    }

    fn note_refresh(&self) {
        self.lock().refresh_calls += 1;
    }

    /// Queue the outcome of the next unscripted attempt.
    pub fn enqueue(&self, outcome: ScriptedOutcome) {
        self.lock().outcomes.push_back(outcome);
    }

    /// Queue `count` failing attempts in a row.
    pub fn enqueue_failures(&self, count: usize, reason: &str) {
        let mut state = self.lock();
        for _ in 0..count {
            state
                .outcomes
                .push_back(ScriptedOutcome::Fail(reason.to_owned()));
        }
    }

    /// Replace the outcome applied once the queue is empty.
    pub fn set_fallback(&self, outcome: ScriptedOutcome) {
        self.lock().fallback = outcome;
    }

    /// Control what the availability probe reports.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// What the availability probe currently reports.
    #[must_use]
    pub fn available(&self) -> bool {
        self.lock().available
    }

    /// Total connection attempts started so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.lock().connect_attempts
    }

    /// Total refresh calls received so far.
    #[must_use]
    pub fn refresh_calls(&self) -> u64 {
        self.lock().refresh_calls
    }
}

/// An in-process backend that answers its own messages.
///
/// Establishment runs on a spawned task, optionally delayed by the
/// `connectDelay` configuration key (milliseconds; `accelConnectDelay`
/// overrides it under the accelerated profile), so connection races look
/// exactly like they do with a real transport. Outbound messages are
/// echoed straight back as inbound ones.
pub struct SimulatedBackend {
    core: BackendCore,
    script: SimulatedScript,
}

impl SimulatedBackend {
    /// A loopback backend under the canonical `simulated` identity.
    #[must_use]
    pub fn new(bus: SignalSender) -> Self {
        Self::with_identity(
            BackendKind::Simulated.canonical_id(),
            BackendKind::Simulated,
            BackendConfig::default(),
            bus,
        )
    }

    /// A loopback backend posing as an arbitrary identity and kind, so
    /// the manager's kind-keyed policy can be exercised without a real
    /// transport behind it.
    #[must_use]
    pub fn with_identity(
        id: BackendId,
        kind: BackendKind,
        config: BackendConfig,
        bus: SignalSender,
    ) -> Self {
        Self {
            core: BackendCore::with_id(id, kind, config, bus),
            script: SimulatedScript::new(),
        }
    }

    /// The script handle controlling this backend.
    #[must_use]
    pub fn script(&self) -> SimulatedScript {
        self.script.clone()
    }

    fn connect_delay(&self) -> Duration {
        self.core
            .config_u64("connectDelay")
            .map_or(Duration::ZERO, Duration::from_millis)
    }
}

#[async_trait]
impl Backend for SimulatedBackend {
    fn core(&self) -> &BackendCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut BackendCore {
        &mut self.core
    }

    fn start_connect(&mut self, epoch: u64) {
        self.core.log("trying to connect");
        let outcome = self.script.next_outcome();
        let id = self.core.id().clone();
        let bus = self.core.bus();
        let delay = self.connect_delay();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let event = match outcome {
                ScriptedOutcome::Establish => TransportEvent::Established { epoch },
                ScriptedOutcome::Fail(reason) => TransportEvent::ConnectFailed { epoch, reason },
            };
            let _ = bus.send(BackendSignal::Transport { id, event });
        });
    }

    fn close_transport(&mut self) {}

    fn transport_send(&mut self, name: &str, data: &str) {
        // Echo back immediately, the way a service answering on the spot
        // would.
        let raw = json!({ "name": name, "data": data }).to_string();
        let _ = self.core.bus().send(BackendSignal::Transport {
            id: self.core.id().clone(),
            event: TransportEvent::Inbound {
                epoch: self.core.epoch(),
                raw,
            },
        });
    }

    async fn available(&mut self) -> bool {
        self.script.available()
    }

    fn refresh(&mut self) {
        self.script.note_refresh();
    }

    fn supports_refresh(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{signal_channel, BackendEvent};

    async fn drain(rx: &mut crate::events::SignalReceiver) -> Vec<BackendSignal> {
        let mut signals = Vec::new();
        for _ in 0..8 {
            tokio::task::yield_now().await;
            while let Ok(signal) = rx.try_recv() {
                signals.push(signal);
            }
        }
        signals
    }

    #[tokio::test]
    async fn scripted_failure_then_success() {
        let (tx, mut rx) = signal_channel();
        let mut backend = SimulatedBackend::new(tx);
        let script = backend.script();
        script.enqueue(ScriptedOutcome::Fail("refused".into()));

        backend.connect();
        for signal in drain(&mut rx).await {
            if let BackendSignal::Transport { event, .. } = signal {
                backend.transport_event(event);
            }
        }
        assert_eq!(backend.state(), crate::backend::BackendState::Idle);
        assert_eq!(script.connect_attempts(), 1);

        backend.connect();
        for signal in drain(&mut rx).await {
            if let BackendSignal::Transport { event, .. } = signal {
                backend.transport_event(event);
            }
        }
        assert_eq!(backend.state(), crate::backend::BackendState::Open);
        assert_eq!(script.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn loopback_echo_carries_name_and_data() {
        let (tx, mut rx) = signal_channel();
        let mut backend = SimulatedBackend::new(tx);
        backend.connect();
        for signal in drain(&mut rx).await {
            if let BackendSignal::Transport { event, .. } = signal {
                backend.transport_event(event);
            }
        }

        backend.send("ping", &json!({ "seq": 1 }));
        let mut message = None;
        for signal in drain(&mut rx).await {
            if let BackendSignal::Transport { event, .. } = signal {
                backend.transport_event(event);
            }
        }
        while let Ok(signal) = rx.try_recv() {
            if let BackendSignal::Event {
                event: BackendEvent::Message(raw),
                ..
            } = signal
            {
                message = Some(raw);
            }
        }
        let raw = message.expect("echoed message");
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["name"], "ping");
        assert_eq!(parsed["data"], json!({ "seq": 1 }).to_string());
    }
}
