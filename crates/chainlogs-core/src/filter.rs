//! The filter registry — determines which raw chain logs are retained.
//!
//! Filters only grow: narrowing retroactively would require re-deriving
//! history that was already dropped. Merges are additive and idempotent.
//! Readers take a copy-on-write snapshot once per poll cycle, so a merge
//! never exposes a partially written entry.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use crate::error::Error;
use crate::types::{normalize_address, normalize_hash};

/// An immutable set of `(address, event signatures)` filters.
///
/// An address mapped to an empty signature set retains every event emitted
/// by that address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    entries: HashMap<String, BTreeSet<String>>,
}

impl FilterSet {
    /// Returns `true` if no filters have been merged yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct addresses in the set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Addresses in the set, for clients that prefilter server-side.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Event signatures retained for `address`. `None` if the address is
    /// not filtered at all; an empty set means "every event".
    pub fn event_sigs(&self, address: &str) -> Option<&BTreeSet<String>> {
        self.entries.get(address)
    }

    /// Returns `true` if a log with this `(address, event_sig)` pair is
    /// retained by the union of all merged filters.
    pub fn matches(&self, address: &str, event_sig: &str) -> bool {
        match self.entries.get(address) {
            Some(sigs) => sigs.is_empty() || sigs.contains(event_sig),
            None => false,
        }
    }

    /// Returns a new set with `(address, topics)` merged in, or `None` if
    /// an equal-or-broader filter already exists (merge is a no-op).
    fn merged(&self, address: &str, topics: &[String]) -> Option<FilterSet> {
        match self.entries.get(address) {
            // Address already matches everything — nothing can broaden it.
            Some(existing) if existing.is_empty() => None,
            Some(existing) => {
                if topics.is_empty() {
                    // Broaden to match-all for this address.
                    let mut next = self.clone();
                    next.entries.insert(address.to_string(), BTreeSet::new());
                    return Some(next);
                }
                if topics.iter().all(|t| existing.contains(t)) {
                    return None; // subset — no-op
                }
                let mut next = self.clone();
                let sigs = next.entries.entry(address.to_string()).or_default();
                sigs.extend(topics.iter().cloned());
                Some(next)
            }
            None => {
                let mut next = self.clone();
                next.entries
                    .insert(address.to_string(), topics.iter().cloned().collect());
                Some(next)
            }
        }
    }
}

/// Mutable registry of filters, read by the poll loop on every cycle and
/// written by any caller at any time.
///
/// The active set is an `Arc` swapped atomically on merge, so readers get
/// a consistent snapshot without per-read locking.
#[derive(Debug, Default)]
pub struct FilterRegistry {
    current: RwLock<Arc<FilterSet>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current filter snapshot. Cheap; callers hold it for the
    /// duration of one poll cycle.
    pub fn snapshot(&self) -> Arc<FilterSet> {
        self.current.read().expect("filter registry poisoned").clone()
    }

    /// Merge an `(address, event signatures)` filter into the active set.
    ///
    /// Merging an equivalent or narrower filter is a no-op. The effect is
    /// observed by the next poll cycle, not necessarily the in-flight one.
    pub fn merge(&self, topics: &[String], address: &str) -> Result<(), Error> {
        let address = normalize_address(address)?;
        let topics = topics
            .iter()
            .map(|t| normalize_hash(t))
            .collect::<Result<Vec<_>, _>>()?;

        let mut guard = self.current.write().expect("filter registry poisoned");
        if let Some(next) = guard.merged(&address, &topics) {
            tracing::debug!(
                address = %address,
                sigs = topics.len(),
                total_addresses = next.len(),
                "Filter merged"
            );
            *guard = Arc::new(next);
        }
        Ok(())
    }
}
