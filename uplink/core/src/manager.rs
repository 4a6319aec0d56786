//! Arbitration & Failover Manager
//!
//! The manager owns a fleet of backends and decides which of them carries
//! traffic. At startup it probes every backend for availability and keeps
//! the reachable ones as the candidate set, in priority order. Connecting
//! races every candidate at once; whoever opens first becomes active, and
//! the moment the top-priority candidate is open every other candidate is
//! shut down. Per-kind retry policy handles the candidates that keep
//! failing, a broken/fixed mechanism takes hopeless backends out of
//! rotation, and a self-heal timer reconnects after everything has gone
//! dark.
//!
//! The manager is single-threaded and lock-free: backends and their
//! transport tasks talk to it exclusively through the signal bus, and the
//! embedder drains that bus with [`Manager::pump`] or [`Manager::drive`].

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{Backend, BackendConfig, BackendId, BackendKind};
use crate::config::ManagerConfig;
use crate::events::{BackendEvent, BackendSignal, ManagerEvent, SignalReceiver, SignalSender};
use crate::filter::{Filter, FilterChain, Payload, Verdict};

/// Errors surfaced by the manager's fallible operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The named backend is not part of this manager's fleet.
    #[error("unknown backend: {0}")]
    UnknownBackend(BackendId),
}

/// The arbitration manager. See the module docs for the big picture.
pub struct Manager {
    config: ManagerConfig,
    backends: Vec<Box<dyn Backend>>,
    /// Reachable backends in priority order. Broken backends are not in
    /// here and never get connected.
    candidates: Vec<BackendId>,
    /// Backends whose lifecycle events the manager still listens to.
    /// Detaching precedes disabling in [`Manager::set_broken`] so the
    /// forced disconnect of a broken backend goes unheard.
    attached: HashSet<BackendId>,
    /// Open backends, most recently connected first. The front entry is
    /// the active backend.
    connected: Vec<BackendId>,
    attempts: HashMap<BackendId, u32>,
    unlimited_reconnect: bool,
    top_priority: Option<BackendId>,
    heal: Option<(u64, JoinHandle<()>)>,
    heal_seq: u64,
    bus: SignalSender,
    rx: SignalReceiver,
    listeners: Vec<mpsc::UnboundedSender<ManagerEvent>>,
    filters: FilterChain,
}

impl Manager {
    /// Probe the fleet and build a manager around the reachable part of
    /// it. `bus`/`rx` are the two halves of the channel the backends
    /// were built with.
    ///
    /// When the socket backend is reachable, the privileged and
    /// messaging fallbacks are broken outright: a confirmed direct
    /// transport means the indirect ones are never worth racing.
    pub async fn start(
        config: ManagerConfig,
        backends: Vec<Box<dyn Backend>>,
        bus: SignalSender,
        rx: SignalReceiver,
    ) -> Self {
        let mut manager = Self {
            config,
            backends,
            candidates: Vec::new(),
            attached: HashSet::new(),
            connected: Vec::new(),
            attempts: HashMap::new(),
            unlimited_reconnect: false,
            top_priority: None,
            heal: None,
            heal_seq: 0,
            bus,
            rx,
            listeners: Vec::new(),
            filters: FilterChain::new(),
        };
        manager.probe().await;
        manager
    }

    async fn probe(&mut self) {
        let results =
            futures::future::join_all(self.backends.iter_mut().map(|b| b.available())).await;
        let mut candidates = Vec::new();
        for (backend, reachable) in self.backends.iter().zip(&results) {
            if *reachable {
                candidates.push(backend.id());
            } else {
                tracing::info!(backend = %backend.id(), "unreachable, excluded from arbitration");
            }
        }
        self.candidates = candidates;
        self.attached.extend(self.candidates.iter().cloned());

        let socket_reachable = self
            .candidates
            .iter()
            .any(|id| self.kind_of(id) == Some(BackendKind::Socket));
        if socket_reachable {
            for kind in [BackendKind::Privileged, BackendKind::Messaging] {
                if let Some(id) = self.id_of_kind(kind) {
                    if self.candidates.contains(&id) {
                        self.set_broken(&id);
                    }
                }
            }
        }
        self.top_priority = self.candidates.first().cloned();
        tracing::info!(candidates = ?self.candidates, top = ?self.top_priority, "probe complete");
    }

    // ===== public surface =====

    /// Connect, optionally nominating a new top-priority backend. The
    /// nomination is ignored unless the backend is currently a
    /// candidate. When the top-priority backend is already active this
    /// is a complete no-op; otherwise every connected backend is dropped
    /// and every candidate races for the connection.
    pub fn connect(&mut self, id: Option<&BackendId>) {
        self.cancel_heal();
        if let Some(id) = id {
            if self.candidates.contains(id) {
                self.top_priority = Some(id.clone());
            }
        }
        // The top priority must always point at a live candidate;
        // failover may have removed the old one.
        let top_valid = self
            .top_priority
            .as_ref()
            .is_some_and(|top| self.candidates.contains(top));
        if !top_valid {
            self.top_priority = self.candidates.first().cloned();
        }
        if self.active_backend() == self.top_priority.as_ref() {
            return;
        }
        self.disconnect();
        let ids = self.candidates.clone();
        for id in &ids {
            if let Some(backend) = self.backend_mut(id) {
                backend.set_enabled(true);
            }
        }
        for id in &ids {
            if let Some(backend) = self.backend_mut(id) {
                backend.connect();
            }
        }
    }

    /// Drop every connected backend. Each backend immediately starts a
    /// fresh attempt of its own (it is still enabled), and the self-heal
    /// timer arms once the connected set is empty.
    pub fn disconnect(&mut self) {
        for id in self.connected.clone() {
            if let Some(backend) = self.backend_mut(&id) {
                backend.disconnect();
            }
        }
    }

    /// Run `data` through the filter chain and hand it to the active
    /// backend. Dropped silently when a filter vetoes it or nothing is
    /// connected.
    pub async fn send(&mut self, name: impl Into<String>, data: Value) {
        let mut payload = Payload {
            name: name.into(),
            data,
        };
        if self.filters.apply(&mut payload).await == Verdict::Block {
            return;
        }
        if let Some(active) = self.connected.first().cloned() {
            if let Some(backend) = self.backend_mut(&active) {
                backend.send(&payload.name, &payload.data);
            }
        }
    }

    /// Switch the fleet to the accelerated timing profile. When nothing
    /// is connected this also engages unlimited reconnect, gives the
    /// socket and privileged backends another chance even if they were
    /// broken, and kicks off a connect: an external hint that a real
    /// connection is imminent deserves an aggressive response.
    pub fn accelerate(&mut self) {
        let had_active = self.active_backend().is_some();
        if !had_active {
            self.reconnect_until_succeed();
            for kind in [BackendKind::Socket, BackendKind::Privileged] {
                if let Some(id) = self.id_of_kind(kind) {
                    if self.is_broken(&id) {
                        self.set_fixed(&id);
                    }
                }
            }
        }
        for id in self.candidates.clone() {
            if let Some(backend) = self.backend_mut(&id) {
                backend.set_accelerated(true);
            }
        }
        if !had_active {
            self.connect(None);
        }
    }

    /// Ask the active backend to re-probe its environment. In a legacy
    /// environment an active privileged backend cannot be refreshed in
    /// place; it is dropped and broken instead, and no refresh
    /// notification goes out.
    pub fn refresh(&mut self) {
        let active = self.active_backend().cloned();
        if let Some(id) = &active {
            if self.kind_of(id) == Some(BackendKind::Privileged) && self.config.legacy_environment {
                self.disconnect();
                self.set_broken(id);
                self.emit(ManagerEvent::Broken(id.clone()));
                return;
            }
            let supports = self.backend(id).is_some_and(Backend::supports_refresh);
            if supports {
                if let Some(backend) = self.backend_mut(id) {
                    backend.refresh();
                }
            }
        }
        self.emit(ManagerEvent::Refresh { backend: active });
    }

    /// Suspend the per-kind retry escalation: keep retrying forever.
    /// Cleared automatically the next time any backend opens.
    pub fn reconnect_until_succeed(&mut self) {
        if !self.unlimited_reconnect {
            tracing::info!("unlimited reconnect engaged");
            self.unlimited_reconnect = true;
        }
    }

    /// Explicitly clear unlimited reconnect.
    pub fn reset_unlimited_reconnect(&mut self) {
        self.unlimited_reconnect = false;
    }

    /// Merge `config` into one backend's configuration, reset its retry
    /// counter, and bounce its connection so the new values take effect.
    pub fn update_config(
        &mut self,
        id: &BackendId,
        config: BackendConfig,
    ) -> Result<(), ManagerError> {
        let Some(backend) = self.backend_mut(id) else {
            return Err(ManagerError::UnknownBackend(id.clone()));
        };
        backend.core_mut().config_mut().merge(config);
        backend.disconnect();
        self.attempts.insert(id.clone(), 0);
        Ok(())
    }

    /// Register an outbound message filter under `name`. A duplicate
    /// name leaves the chain unchanged.
    pub fn add_filter(&mut self, name: impl Into<String>, filter: Filter) {
        let name = name.into();
        if !self.filters.add(name.clone(), filter) {
            tracing::warn!(filter = %name, "duplicate filter name ignored");
        }
    }

    /// Remove the filter registered under `name`, if any.
    pub fn remove_filter(&mut self, name: &str) {
        self.filters.remove(name);
    }

    /// Subscribe to [`ManagerEvent`] notifications. Dropped receivers
    /// are pruned automatically.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    /// The active backend: the most recently connected one.
    #[must_use]
    pub fn active_backend(&self) -> Option<&BackendId> {
        self.connected.first()
    }

    /// Whether anything is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.connected.is_empty()
    }

    /// The candidate set, in priority order.
    #[must_use]
    pub fn candidates(&self) -> &[BackendId] {
        &self.candidates
    }

    /// The connected set, most recently connected first.
    #[must_use]
    pub fn connected_backends(&self) -> &[BackendId] {
        &self.connected
    }

    /// The current top-priority backend.
    #[must_use]
    pub fn top_priority(&self) -> Option<&BackendId> {
        self.top_priority.as_ref()
    }

    /// Consecutive failed attempts recorded for one backend.
    #[must_use]
    pub fn attempts(&self, id: &BackendId) -> u32 {
        self.attempts.get(id).copied().unwrap_or(0)
    }

    /// Read access to one backend.
    #[must_use]
    pub fn backend(&self, id: &BackendId) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.core().id() == id)
            .map(|b| &**b)
    }

    /// Mutable access to one backend.
    pub fn backend_mut(&mut self, id: &BackendId) -> Option<&mut (dyn Backend + 'static)> {
        self.backends
            .iter_mut()
            .find(|b| b.core().id() == id)
            .map(|b| &mut **b)
    }

    // ===== signal dispatch =====

    /// Drain and dispatch every signal currently queued, without
    /// waiting.
    pub async fn pump(&mut self) {
        while let Ok(signal) = self.rx.try_recv() {
            self.dispatch(signal).await;
        }
    }

    /// Wait for at least one signal, then drain the queue.
    pub async fn drive(&mut self) {
        if let Some(signal) = self.rx.recv().await {
            self.dispatch(signal).await;
        }
        self.pump().await;
    }

    async fn dispatch(&mut self, signal: BackendSignal) {
        match signal {
            BackendSignal::Transport { id, event } => {
                // Routed unconditionally; the backend's epoch check
                // discards anything stale.
                if let Some(backend) = self.backend_mut(&id) {
                    backend.transport_event(event);
                }
            }
            BackendSignal::Heal { generation } => {
                if self.heal.as_ref().map(|(seq, _)| *seq) == Some(generation) {
                    self.heal = None;
                    tracing::info!("self-heal: reconnecting");
                    self.connect(None);
                }
            }
            BackendSignal::Event { id, event } => {
                if !self.attached.contains(&id) {
                    tracing::trace!(backend = %id, ?event, "event from detached backend ignored");
                    return;
                }
                match event {
                    BackendEvent::Connected => self.handle_open(&id),
                    BackendEvent::Disconnected => self.handle_closed(&id),
                    BackendEvent::Failed => self.handle_failed(&id).await,
                    BackendEvent::Unsupported => self.handle_unsupported(&id).await,
                    BackendEvent::Message(raw) => {
                        let live = self.connected.contains(&id)
                            && self.backend(&id).is_some_and(|b| b.core().enabled());
                        if live {
                            self.emit(ManagerEvent::Message { backend: id, raw });
                        }
                    }
                    BackendEvent::Log(line) => {
                        self.emit(ManagerEvent::Log { backend: id, line });
                    }
                    BackendEvent::Error(message) => {
                        tracing::error!(backend = %id, %message, "backend fault");
                        self.emit(ManagerEvent::Log {
                            backend: id,
                            line: message,
                        });
                    }
                    BackendEvent::Enabled
                    | BackendEvent::Disabled
                    | BackendEvent::Accelerated(_) => {}
                }
            }
        }
    }

    // ===== lifecycle handlers =====

    fn handle_open(&mut self, id: &BackendId) {
        let Some(kind) = self.kind_of(id) else { return };
        if kind == BackendKind::Privileged && !self.config.privileged_supported {
            self.emit(ManagerEvent::Unsupported(id.clone()));
            return;
        }
        self.cancel_heal();
        if !self.connected.contains(id) {
            self.connected.insert(0, id.clone());
        }
        self.unlimited_reconnect = false;
        // Somebody made it; nobody needs the aggressive timing profile
        // any more.
        for cid in self.candidates.clone() {
            if let Some(backend) = self.backend_mut(&cid) {
                backend.set_accelerated(false);
            }
        }
        self.emit(ManagerEvent::Connect(id.clone()));
        self.attempts.insert(id.clone(), 0);
        if kind != BackendKind::Simulated {
            self.emit(ManagerEvent::Stat(format!("{id}-is-connected")));
        }
        // The race only settles once the top-priority candidate itself
        // is open; lower-priority backends may carry traffic side by
        // side until then.
        if let Some(top) = self.top_priority.clone() {
            if self.connected.contains(&top) {
                for cid in self.candidates.clone() {
                    if cid != top {
                        if let Some(backend) = self.backend_mut(&cid) {
                            backend.set_enabled(false);
                        }
                    }
                }
            }
        }
    }

    fn handle_closed(&mut self, id: &BackendId) {
        self.connected.retain(|c| c != id);
        self.emit(ManagerEvent::Disconnect(id.clone()));
        if self.connected.is_empty() {
            self.schedule_heal();
        }
    }

    async fn handle_failed(&mut self, id: &BackendId) {
        let attempt = {
            let counter = self.attempts.entry(id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let Some(kind) = self.kind_of(id) else { return };
        let ceiling = self.config.retry_ceiling;

        match kind {
            BackendKind::Socket if !self.unlimited_reconnect => {
                if attempt == ceiling {
                    self.emit(ManagerEvent::Stat(
                        "socket-failed-to-connect-first-round".into(),
                    ));
                    let reserve_kind = if self.config.privileged_supported {
                        BackendKind::Privileged
                    } else {
                        BackendKind::Messaging
                    };
                    if let Some(reserve) = self.id_of_kind(reserve_kind) {
                        if !self.candidates.contains(&reserve) {
                            // Swap the failing socket out for the
                            // reserve, but keep listening to the socket:
                            // unlike a broken backend it may still talk.
                            if let Some(backend) = self.backend_mut(id) {
                                backend.set_enabled(false);
                            }
                            self.candidates.retain(|c| c != id);
                            self.set_fixed(&reserve);
                            self.connect(None);
                        }
                    }
                } else if attempt > ceiling * 2 {
                    self.set_broken(id);
                    self.emit(ManagerEvent::Stat(
                        "socket-failed-to-connect-second-round".into(),
                    ));
                }
            }
            BackendKind::Privileged if !self.unlimited_reconnect => {
                if attempt == ceiling {
                    self.emit(ManagerEvent::Stat("privileged-failed-to-connect".into()));
                    let reachable = match self.backend_mut(id) {
                        Some(backend) => backend.available().await,
                        None => false,
                    };
                    if reachable {
                        self.emit(ManagerEvent::Stat(
                            "unable-to-connect-to-available-privileged".into(),
                        ));
                        self.reconnect_until_succeed();
                    } else {
                        self.set_broken(id);
                        self.emit(ManagerEvent::Stat("privileged-component-not-installed".into()));
                    }
                }
            }
            BackendKind::Privileged => {
                if self.active_backend().is_none() {
                    // Under unlimited reconnect, nudge the component
                    // registry so a just-installed helper is picked up
                    // on the next attempt.
                    if let Some(backend) = self.backend_mut(id) {
                        backend.refresh();
                    }
                }
            }
            BackendKind::Messaging => {
                self.emit(ManagerEvent::Stat("messaging-failed-to-connect".into()));
                let reachable = match self.backend_mut(id) {
                    Some(backend) => backend.available().await,
                    None => false,
                };
                if reachable {
                    self.emit(ManagerEvent::Stat(
                        "unable-to-connect-to-available-messaging".into(),
                    ));
                    self.reconnect_until_succeed();
                } else {
                    self.emit(ManagerEvent::Unsupported(id.clone()));
                    self.set_broken(id);
                }
            }
            BackendKind::Socket | BackendKind::Simulated => {}
        }

        self.emit(ManagerEvent::Log {
            backend: id.clone(),
            line: format!("attempt #{attempt} has failed"),
        });
    }

    /// A backend reported itself categorically unsupported. Only the
    /// messaging bridge is expected to do this; the report is forwarded
    /// to observers only when the privileged helper could take over,
    /// since otherwise the embedder has nothing actionable to show.
    async fn handle_unsupported(&mut self, id: &BackendId) {
        if self.kind_of(id) != Some(BackendKind::Messaging) {
            return;
        }
        let privileged_reachable = match self.id_of_kind(BackendKind::Privileged) {
            Some(pid) => match self.backend_mut(&pid) {
                Some(backend) => backend.available().await,
                None => false,
            },
            None => false,
        };
        if privileged_reachable {
            self.emit(ManagerEvent::Unsupported(id.clone()));
        }
        self.set_broken(id);
        self.connect(None);
    }

    // ===== broken / fixed =====

    fn is_broken(&self, id: &BackendId) -> bool {
        !self.candidates.contains(id)
    }

    fn set_broken(&mut self, id: &BackendId) {
        tracing::warn!(backend = %id, "taken out of arbitration");
        // Detach first: the forced disconnect below must go unheard, or
        // it would schedule a spurious self-heal.
        self.attached.remove(id);
        if let Some(backend) = self.backend_mut(id) {
            backend.set_enabled(false);
        }
        self.candidates.retain(|c| c != id);
        // The forced disconnect above went unheard, so evict the backend
        // from the connected set by hand.
        if self.connected.contains(id) {
            self.connected.retain(|c| c != id);
            self.emit(ManagerEvent::Disconnect(id.clone()));
        }
    }

    fn set_fixed(&mut self, id: &BackendId) {
        if self.config.legacy_environment && self.kind_of(id) == Some(BackendKind::Socket) {
            return;
        }
        self.attached.insert(id.clone());
        if let Some(backend) = self.backend_mut(id) {
            backend.core_mut().reinstate();
        }
        if !self.candidates.contains(id) {
            tracing::info!(backend = %id, "reinstated into arbitration");
            self.candidates.insert(0, id.clone());
        }
    }

    // ===== self-heal =====

    fn schedule_heal(&mut self) {
        self.cancel_heal();
        self.heal_seq += 1;
        let generation = self.heal_seq;
        let bus = self.bus.clone();
        let delay = self.config.reconnect_delay();
        tracing::debug!(delay_ms = self.config.reconnect_delay_ms, "self-heal armed");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = bus.send(BackendSignal::Heal { generation });
        });
        self.heal = Some((generation, handle));
    }

    fn cancel_heal(&mut self) {
        if let Some((_, handle)) = self.heal.take() {
            handle.abort();
        }
    }

    // ===== helpers =====

    fn kind_of(&self, id: &BackendId) -> Option<BackendKind> {
        self.backend(id).map(Backend::kind)
    }

    fn id_of_kind(&self, kind: BackendKind) -> Option<BackendId> {
        self.backends
            .iter()
            .find(|b| b.kind() == kind)
            .map(|b| b.id())
    }

    fn emit(&mut self, event: ManagerEvent) {
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}
