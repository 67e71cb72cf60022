//! Hierarchical resource lock manager.
//!
//! A task declaring required resources `R` must, before executing, hold
//! exclusive ownership of every resource in `Closure(R) = R ∪ {ancestors of
//! any r ∈ R in the resource DAG}`. Locks are acquired in ascending
//! `ResourceId` order (the canonical total order, see [`crate::ids`]) and
//! released in reverse order on every exit path, including a panic.
//!
//! This total-order acquisition is deadlock-free by construction: every
//! acquisition anywhere in the system visits mutexes in the same order, so
//! no cycle can form in the wait-for graph. This replaces the source's
//! hand-rolled try-lock-and-retry loop, which could live-lock and had buggy
//! release accounting.

use crate::{containers::HashSet, graph::Dag, ids::ResourceId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;

/// Owns every resource's mutex plus the resource dependency graph needed to
/// compute `Closure(required)`. Shared (via `Arc`) by every task body
/// dispatched during a run, since task bodies must be `'static` to be
/// submitted to the executor and can no longer borrow the scheduler that
/// built them.
#[derive(Debug)]
pub(crate) struct ResourceLocks {
    resource_dag: Dag<ResourceId>,
    mutexes: Vec<Mutex<()>>,
}

impl ResourceLocks {
    pub fn new(resource_dag: Dag<ResourceId>, mutexes: Vec<Mutex<()>>) -> Self {
        Self { resource_dag, mutexes }
    }

    /// Computes `Closure(required)` and blocks on each mutex in ascending
    /// order, returning a guard that releases them in reverse order when
    /// dropped.
    pub fn acquire(&self, required: &HashSet<ResourceId>) -> ResourceGuard<'_> {
        let ordered = closure(&self.resource_dag, required);
        let mut guards = Vec::with_capacity(ordered.len());
        for id in ordered {
            log::trace!("acquiring {id}");
            guards.push(self.mutexes[id.index()].lock());
            log::trace!("acquired {id}");
        }
        ResourceGuard { guards }
    }
}

/// `R` plus every ancestor of every element of `R` in the resource DAG,
/// returned in ascending `ResourceId` order.
fn closure(resource_dag: &Dag<ResourceId>, required: &HashSet<ResourceId>) -> BTreeSet<ResourceId> {
    let mut closure = BTreeSet::new();
    let mut frontier: Vec<ResourceId> = required.iter().copied().collect();
    while let Some(id) = frontier.pop() {
        if closure.insert(id) {
            frontier.extend(resource_dag.parents(id));
        }
    }
    closure
}

/// RAII guard holding every lock in a resource closure. Releases them in
/// reverse acquisition order on every exit path (success, early return, or
/// unwind): exactly one release per successful acquisition, never more,
/// never fewer.
#[must_use]
pub(crate) struct ResourceGuard<'a> {
    guards: Vec<MutexGuard<'a, ()>>,
}

impl Drop for ResourceGuard<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            log::trace!("releasing resource lock");
            drop(guard);
        }
    }
}
