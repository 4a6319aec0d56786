//! Outbound Message Filters
//!
//! Every message leaving through [`crate::manager::Manager::send`] runs
//! an ordered chain of filters first. A filter may rewrite the payload in
//! place or veto it outright; the first veto wins and downstream filters
//! never see the message. Filters are registered under caller-chosen
//! names so they can be removed again later.

use futures::future::BoxFuture;
use serde_json::Value;

/// An outbound message travelling through the filter chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Payload {
    /// The message name.
    pub name: String,
    /// The message body.
    pub data: Value,
}

/// What a filter decided about a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Let the (possibly rewritten) payload continue.
    Pass,
    /// Veto the payload; nothing downstream sees it.
    Block,
}

/// A boxed synchronous filter function.
pub type SyncFilterFn = Box<dyn FnMut(&mut Payload) -> Verdict + Send>;

/// A boxed asynchronous filter function.
pub type AsyncFilterFn = Box<dyn for<'a> FnMut(&'a mut Payload) -> BoxFuture<'a, Verdict> + Send>;

/// One registered filter, synchronous or asynchronous. Both flavors sit
/// in the same ordered chain; an asynchronous filter simply suspends the
/// chain until it resolves.
pub enum Filter {
    /// Runs inline.
    Sync(SyncFilterFn),
    /// Suspends the chain while it runs.
    Async(AsyncFilterFn),
}

impl Filter {
    /// Wrap a synchronous filter function.
    pub fn sync(f: impl FnMut(&mut Payload) -> Verdict + Send + 'static) -> Self {
        Self::Sync(Box::new(f))
    }

    /// Wrap an asynchronous filter function. The closure returns a boxed
    /// future borrowing the payload, so `|payload| Box::pin(async move
    /// { ... })` is the expected shape.
    pub fn asynchronous<F>(f: F) -> Self
    where
        F: for<'a> FnMut(&'a mut Payload) -> BoxFuture<'a, Verdict> + Send + 'static,
    {
        Self::Async(Box::new(f))
    }
}

/// The ordered, name-keyed filter chain.
#[derive(Default)]
pub struct FilterChain {
    entries: Vec<(String, Filter)>,
}

impl FilterChain {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter under `name`. Returns `false` (and changes
    /// nothing) when the name is already taken.
    pub fn add(&mut self, name: impl Into<String>, filter: Filter) -> bool {
        let name = name.into();
        if self.entries.iter().any(|(n, _)| *n == name) {
            return false;
        }
        self.entries.push((name, filter));
        true
    }

    /// Remove the filter registered under `name`. Returns whether one
    /// was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| n != name);
        self.entries.len() != before
    }

    /// Number of registered filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the payload through the chain in registration order, stopping
    /// at the first veto.
    pub async fn apply(&mut self, payload: &mut Payload) -> Verdict {
        for (name, filter) in &mut self.entries {
            let verdict = match filter {
                Filter::Sync(f) => f(payload),
                Filter::Async(f) => f(payload).await,
            };
            if verdict == Verdict::Block {
                tracing::debug!(filter = %name, message = %payload.name, "payload vetoed");
                return Verdict::Block;
            }
        }
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload() -> Payload {
        Payload {
            name: "ping".into(),
            data: json!({ "seq": 1 }),
        }
    }

    #[tokio::test]
    async fn filters_run_in_registration_order() {
        let mut chain = FilterChain::new();
        chain.add(
            "tag",
            Filter::sync(|p| {
                p.data["tag"] = json!("first");
                Verdict::Pass
            }),
        );
        chain.add(
            "retag",
            Filter::sync(|p| {
                assert_eq!(p.data["tag"], "first");
                p.data["tag"] = json!("second");
                Verdict::Pass
            }),
        );

        let mut p = payload();
        assert_eq!(chain.apply(&mut p).await, Verdict::Pass);
        assert_eq!(p.data["tag"], "second");
    }

    #[tokio::test]
    async fn veto_short_circuits() {
        let mut chain = FilterChain::new();
        chain.add("veto", Filter::sync(|_| Verdict::Block));
        chain.add(
            "unreachable",
            Filter::sync(|_| panic!("must not run after a veto")),
        );

        let mut p = payload();
        assert_eq!(chain.apply(&mut p).await, Verdict::Block);
    }

    #[tokio::test]
    async fn async_filter_can_rewrite() {
        let mut chain = FilterChain::new();
        chain.add(
            "slow-rewrite",
            Filter::asynchronous(|p| {
                Box::pin(async move {
                    tokio::task::yield_now().await;
                    p.data = json!("rewritten");
                    Verdict::Pass
                })
            }),
        );

        let mut p = payload();
        assert_eq!(chain.apply(&mut p).await, Verdict::Pass);
        assert_eq!(p.data, json!("rewritten"));
    }

    #[test]
    fn duplicate_names_are_rejected_and_removal_is_tolerant() {
        let mut chain = FilterChain::new();
        assert!(chain.add("a", Filter::sync(|_| Verdict::Pass)));
        assert!(!chain.add("a", Filter::sync(|_| Verdict::Block)));
        assert_eq!(chain.len(), 1);
        assert!(!chain.remove("missing"));
        assert!(chain.remove("a"));
        assert!(chain.is_empty());
    }
}
