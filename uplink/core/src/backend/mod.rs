//! Backend Contract
//!
//! A backend owns exactly one logical connection to a remote service and
//! lives in one of four states: `Idle`, `Connecting`, `Open`, or `Error`.
//! The shared mechanics (the state machine, the enable and accelerate
//! flags, the per-attempt epoch, event emission onto the signal bus) live
//! in [`BackendCore`]; a concrete backend embeds a core and implements the
//! transport-specific hooks of the [`Backend`] trait on top of it.
//!
//! [`SimulatedBackend`] is the loopback implementation used by the
//! simulator binary and the test suite.

mod config;
mod core;
mod simulated;
mod traits;

pub use self::config::BackendConfig;
pub use self::core::BackendCore;
pub use self::simulated::{ScriptedOutcome, SimulatedBackend, SimulatedScript};
pub use self::traits::{Backend, BackendId, BackendKind, BackendState};
