//! Eviction planning
//!
//! Planning is a pure function over a snapshot of the index so that a save
//! can decide whether enough space can be freed before touching any entry.

use chrono::{DateTime, Utc};

/// View of one cached entry as seen by the planner
#[derive(Debug, Clone)]
pub struct EvictionCandidate<'a> {
    pub id: &'a str,
    pub size: u64,
    pub last_accessed: DateTime<Utc>,
    pub pinned: bool,
}

/// Entries chosen for eviction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    pub victims: Vec<String>,
    pub freed_bytes: u64,
}

impl EvictionPlan {
    pub fn is_empty(&self) -> bool {
        self.victims.is_empty()
    }
}

/// Choose unpinned entries to evict until `bytes_to_free` bytes and
/// `slots_to_free` entries have been released
///
/// Order is least recently used first; entries accessed at the same instant
/// evict smallest first, then by id. Returns `Err(evictable_bytes)` when
/// evicting every unpinned entry would still not be enough.
pub fn plan_eviction(
    candidates: &[EvictionCandidate<'_>],
    bytes_to_free: u64,
    slots_to_free: usize,
) -> Result<EvictionPlan, u64> {
    let mut evictable: Vec<&EvictionCandidate<'_>> =
        candidates.iter().filter(|c| !c.pinned).collect();
    evictable.sort_by(|a, b| {
        a.last_accessed
            .cmp(&b.last_accessed)
            .then(a.size.cmp(&b.size))
            .then(a.id.cmp(b.id))
    });

    let mut plan = EvictionPlan::default();
    for candidate in &evictable {
        if plan.freed_bytes >= bytes_to_free && plan.victims.len() >= slots_to_free {
            break;
        }
        plan.victims.push(candidate.id.to_string());
        plan.freed_bytes += candidate.size;
    }

    if plan.freed_bytes >= bytes_to_free && plan.victims.len() >= slots_to_free {
        Ok(plan)
    } else {
        Err(evictable.iter().map(|c| c.size).sum())
    }
}
