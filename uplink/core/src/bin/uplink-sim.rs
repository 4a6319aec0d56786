//! Interactive simulator: a flaky socket backend racing a loopback
//! fallback, driven to a steady state while the arbitration decisions
//! are printed.

use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;

use uplink_core::{
    signal_channel, BackendConfig, BackendId, BackendKind, Manager, ManagerConfig, ManagerEvent,
    ModeAggregator, ModeCue, ScriptedOutcome, SimulatedBackend,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = ManagerConfig::from_env();
    let (bus, rx) = signal_channel();

    // A "socket" that refuses once before accepting, next to an
    // always-willing loopback fallback.
    let socket = SimulatedBackend::with_identity(
        BackendId::new("socket"),
        BackendKind::Socket,
        BackendConfig::default(),
        bus.clone(),
    );
    let socket_script = socket.script();
    socket_script.enqueue(ScriptedOutcome::Fail("connection refused".into()));

    let fallback = SimulatedBackend::new(bus.clone());

    let mut manager = Manager::start(
        config,
        vec![Box::new(socket), Box::new(fallback)],
        bus,
        rx,
    )
    .await;
    let mut events = manager.subscribe();
    let mut modes = ModeAggregator::new();

    println!("== first round: socket refuses, fallback wins ==");
    manager.connect(None);
    settle(&mut manager, &mut events, &mut modes).await;

    println!("== second round: socket accepts and takes over ==");
    manager.connect(None);
    settle(&mut manager, &mut events, &mut modes).await;

    println!(
        "active backend: {:?}, socket attempts: {}",
        manager.active_backend(),
        socket_script.connect_attempts()
    );
    Ok(())
}

/// Drive the manager until it has been quiet for a moment, reporting
/// every observer event and reacting to mode changes.
async fn settle(
    manager: &mut Manager,
    events: &mut tokio::sync::mpsc::UnboundedReceiver<ManagerEvent>,
    modes: &mut ModeAggregator,
) {
    for _ in 0..20 {
        let _ = tokio::time::timeout(Duration::from_millis(50), manager.drive()).await;
        let mut arbitration_changed = false;
        while let Ok(event) = events.try_recv() {
            println!("  event: {event:?}");
            if matches!(
                event,
                ManagerEvent::Connect(_) | ManagerEvent::Disconnect(_)
            ) {
                arbitration_changed = true;
            }
        }
        if arbitration_changed {
            let kind = manager
                .active_backend()
                .cloned()
                .and_then(|id| manager.backend(&id).map(uplink_core::Backend::kind));
            if let ModeCue::Notify { mode, queries } = modes.on_active_change(kind) {
                println!("  mode: {mode:?}");
                for query in queries {
                    manager.send(query, json!(null)).await;
                }
            }
        }
    }
}
