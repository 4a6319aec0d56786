//! # uplink-core
//!
//! Transport arbitration for applications that can reach the same local
//! service over several different transports. One backend per transport,
//! one manager arbitrating between them:
//!
//! ```text
//!                    +--------------------+
//!   ManagerEvent <-- |      Manager       | <-- signal bus (mpsc)
//!   subscribers      |  candidates        |       ^        ^
//!                    |  connected (MRU)   |       |        |
//!                    |  retry policy      |  BackendEvent  TransportEvent
//!                    |  self-heal timer   |       |        |
//!                    +---------+----------+   +---+----+   |
//!                              |              | Backend |---+
//!                              +- connect --> |  core   |  spawned
//!                              +- send -----> | (state, |  transport
//!                                 (filtered)  |  epoch) |  tasks
//!                                             +---------+
//! ```
//!
//! Backends implement the [`backend::Backend`] trait around a shared
//! [`backend::BackendCore`]; everything they have to say travels to the
//! manager over one unbounded channel, and the manager processes each
//! signal to completion, so no state is ever observed mid-transition.
//!
//! ## Quick start
//!
//! ```no_run
//! use uplink_core::{signal_channel, Manager, ManagerConfig, SimulatedBackend};
//!
//! # async fn demo() {
//! let (bus, rx) = signal_channel();
//! let backend = SimulatedBackend::new(bus.clone());
//! let mut manager =
//!     Manager::start(ManagerConfig::default(), vec![Box::new(backend)], bus, rx).await;
//!
//! let mut events = manager.subscribe();
//! manager.connect(None);
//! loop {
//!     manager.drive().await;
//!     while let Ok(event) = events.try_recv() {
//!         println!("{event:?}");
//!     }
//! }
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod events;
pub mod filter;
pub mod manager;
pub mod mode;

pub use backend::{
    Backend, BackendConfig, BackendCore, BackendId, BackendKind, BackendState, ScriptedOutcome,
    SimulatedBackend, SimulatedScript,
};
pub use config::ManagerConfig;
pub use events::{
    signal_channel, BackendEvent, BackendSignal, ManagerEvent, SignalReceiver, SignalSender,
    TransportEvent,
};
pub use filter::{Filter, FilterChain, Payload, Verdict};
pub use manager::{Manager, ManagerError};
pub use mode::{ModeAggregator, ModeCue, WorkingMode, NORMAL_MODE_QUERIES};
