//! Working-Mode Aggregation
//!
//! An embedder watching [`crate::events::ManagerEvent`]s usually wants a
//! single coarse answer (what mode is the application in right now) and
//! wants flapping backends coalesced rather than relayed. The
//! [`ModeAggregator`] does that: it classifies the active backend into a
//! [`WorkingMode`] and rate-limits notifications to one per window
//! (leading edge immediate, latest state on the trailing edge).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::backend::BackendKind;

/// Follow-up queries worth issuing right after entering [`WorkingMode::Normal`].
pub const NORMAL_MODE_QUERIES: [&str; 2] = ["getVersions", "getStatus"];

/// Coarse application mode derived from the connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkingMode {
    /// Connected through the in-process loopback only.
    Fake,
    /// Connected through a real backend.
    Normal,
    /// Degraded operation; real features are held back.
    Safe,
    /// Nothing is connected.
    Fault,
    /// The remote side demands a newer client before it will talk.
    NeedUpdate,
}

impl WorkingMode {
    /// Classify the kind of the active backend, if any.
    #[must_use]
    pub fn classify(active: Option<BackendKind>) -> Self {
        match active {
            Some(BackendKind::Simulated) => Self::Fake,
            Some(_) => Self::Normal,
            None => Self::Fault,
        }
    }
}

/// What the aggregator wants the embedder to do after a mode change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModeCue {
    /// Tell the UI now. `queries` lists the follow-up requests to issue
    /// through the manager (non-empty only for [`WorkingMode::Normal`]).
    Notify {
        /// The mode to announce.
        mode: WorkingMode,
        /// Follow-up queries to send to the active backend.
        queries: Vec<&'static str>,
    },
    /// Inside the coalescing window; call [`ModeAggregator::flush`] at
    /// (or after) `at` to deliver the latest state.
    Deferred {
        /// Earliest instant the pending notification may fire.
        at: Instant,
    },
}

/// Rate-limiting mode tracker. Starts in [`WorkingMode::Fault`].
#[derive(Debug)]
pub struct ModeAggregator {
    current: WorkingMode,
    window: Duration,
    last_notified: Option<Instant>,
    pending: bool,
}

impl Default for ModeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeAggregator {
    /// An aggregator with the standard 500 ms coalescing window.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(Duration::from_millis(500))
    }

    /// An aggregator with a custom coalescing window.
    #[must_use]
    pub fn with_window(window: Duration) -> Self {
        Self {
            current: WorkingMode::Fault,
            window,
            last_notified: None,
            pending: false,
        }
    }

    /// The most recently recorded mode (notified or not).
    #[must_use]
    pub fn current(&self) -> WorkingMode {
        self.current
    }

    /// Record the mode implied by the active backend's kind.
    pub fn on_active_change(&mut self, active: Option<BackendKind>) -> ModeCue {
        self.set_mode(WorkingMode::classify(active))
    }

    /// Record a mode change. Outside the window the notification fires
    /// immediately; inside it the change is held and the cue says when
    /// to [`ModeAggregator::flush`]. Intermediate states within one
    /// window are dropped, only the latest survives.
    pub fn set_mode(&mut self, mode: WorkingMode) -> ModeCue {
        self.current = mode;
        let now = Instant::now();
        match self.last_notified {
            Some(last) if now.duration_since(last) < self.window => {
                self.pending = true;
                ModeCue::Deferred {
                    at: last + self.window,
                }
            }
            _ => {
                self.last_notified = Some(now);
                self.pending = false;
                self.cue()
            }
        }
    }

    /// Deliver a held notification once the window has elapsed. `None`
    /// when nothing is pending; a fresh [`ModeCue::Deferred`] when
    /// called too early.
    pub fn flush(&mut self) -> Option<ModeCue> {
        if !self.pending {
            return None;
        }
        let now = Instant::now();
        match self.last_notified {
            Some(last) if now.duration_since(last) < self.window => Some(ModeCue::Deferred {
                at: last + self.window,
            }),
            _ => {
                self.pending = false;
                self.last_notified = Some(now);
                Some(self.cue())
            }
        }
    }

    fn cue(&self) -> ModeCue {
        let queries = if self.current == WorkingMode::Normal {
            NORMAL_MODE_QUERIES.to_vec()
        } else {
            Vec::new()
        };
        ModeCue::Notify {
            mode: self.current,
            queries,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn classification() {
        assert_eq!(WorkingMode::classify(None), WorkingMode::Fault);
        assert_eq!(
            WorkingMode::classify(Some(BackendKind::Simulated)),
            WorkingMode::Fake
        );
        assert_eq!(
            WorkingMode::classify(Some(BackendKind::Socket)),
            WorkingMode::Normal
        );
        assert_eq!(
            WorkingMode::classify(Some(BackendKind::Privileged)),
            WorkingMode::Normal
        );
        assert_eq!(
            WorkingMode::classify(Some(BackendKind::Messaging)),
            WorkingMode::Normal
        );
    }

    #[tokio::test(start_paused = true)]
    async fn leading_edge_fires_immediately() {
        let mut agg = ModeAggregator::new();
        let cue = agg.set_mode(WorkingMode::Fault);
        assert_eq!(
            cue,
            ModeCue::Notify {
                mode: WorkingMode::Fault,
                queries: Vec::new()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn burst_coalesces_to_latest_state() {
        let mut agg = ModeAggregator::new();
        agg.set_mode(WorkingMode::Fault);

        assert!(matches!(
            agg.set_mode(WorkingMode::Normal),
            ModeCue::Deferred { .. }
        ));
        assert!(matches!(
            agg.set_mode(WorkingMode::Fake),
            ModeCue::Deferred { .. }
        ));
        // too early: still deferred
        assert!(matches!(agg.flush(), Some(ModeCue::Deferred { .. })));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            agg.flush(),
            Some(ModeCue::Notify {
                mode: WorkingMode::Fake,
                queries: Vec::new()
            })
        );
        // once delivered, nothing further is pending
        assert_eq!(agg.flush(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn normal_mode_carries_followup_queries() {
        let mut agg = ModeAggregator::new();
        let cue = agg.on_active_change(Some(BackendKind::Socket));
        assert_eq!(
            cue,
            ModeCue::Notify {
                mode: WorkingMode::Normal,
                queries: vec!["getVersions", "getStatus"]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn separate_windows_fire_independently() {
        let mut agg = ModeAggregator::new();
        agg.set_mode(WorkingMode::Fault);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(matches!(
            agg.set_mode(WorkingMode::Normal),
            ModeCue::Notify { .. }
        ));
    }
}
