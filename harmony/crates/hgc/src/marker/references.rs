//! Reference Processing
//!
//! Runs after strong marking, inside the pause:
//!
//! 1. **Soft**: retained (and traced through) unless the policy says to
//!    clear; cleared ones go pending.
//! 2. **Weak**: unmarked referent, clear and go pending.
//! 3. **Finalizable**: unmarked objects with an unrun finalizer are
//!    scheduled and traced, keeping their subgraph alive for the finalizer.
//! 4. **Phantom**: referent still unmarked after step 3, clear and go
//!    pending. A finalizable object therefore reaches its phantom queue only
//!    in the cycle after its finalizer ran.
//!
//! Pending references are delivered to their queues after the world
//! restarts.

use super::Marker;
use crate::config::GcConfig;
use crate::heap::ObjectSpace;
use crate::object::{FinalizerFn, ObjectId, Reference, ReferenceKind};

/// When to clear a softly reachable referent
#[derive(Debug, Clone, Copy)]
pub(crate) struct SoftRefPolicy {
    clear_all: bool,
    lru_cycles: u64,
    clock: u64,
}

impl SoftRefPolicy {
    /// `utilization` is strongly reachable bytes over capacity
    pub(crate) fn new(config: &GcConfig, emergency: bool, utilization: f64, clock: u64) -> Self {
        Self {
            clear_all: emergency || utilization >= f64::from(config.soft_ref_clear_threshold),
            lru_cycles: config.soft_ref_lru_cycles,
            clock,
        }
    }

    pub(crate) fn should_clear(&self, reference: &Reference) -> bool {
        self.clear_all
            || (self.lru_cycles > 0
                && self.clock.saturating_sub(reference.last_access()) >= self.lru_cycles)
    }

    pub(crate) fn clears_all(&self) -> bool {
        self.clear_all
    }
}

/// Outcome of reference processing for one cycle
#[derive(Default)]
pub(crate) struct ReferenceDiscovery {
    /// Cleared references, enqueued once the world restarts
    pub pending: Vec<Reference>,
    /// Objects whose finalizer was scheduled this cycle
    pub finalizable: Vec<(ObjectId, FinalizerFn)>,
    /// Finalizers dropped because finalization is disabled
    pub discarded: Vec<FinalizerFn>,
    pub soft_cleared: usize,
    pub weak_cleared: usize,
    pub phantom_cleared: usize,
}

pub(crate) struct ReferenceProcessor {
    policy: SoftRefPolicy,
    finalization_enabled: bool,
}

impl ReferenceProcessor {
    pub(crate) fn new(policy: SoftRefPolicy, finalization_enabled: bool) -> Self {
        Self {
            policy,
            finalization_enabled,
        }
    }

    pub(crate) fn process(&self, space: &mut ObjectSpace, marker: &mut Marker) -> ReferenceDiscovery {
        let mut discovery = ReferenceDiscovery::default();

        let mut soft = Vec::new();
        let mut weak = Vec::new();
        let mut phantom = Vec::new();
        for reference in space.active_references() {
            match reference.kind() {
                ReferenceKind::Soft => soft.push(reference),
                ReferenceKind::Weak => weak.push(reference),
                ReferenceKind::Phantom => phantom.push(reference),
            }
        }

        // Soft: retain first so later retained referents can rescue earlier
        // cleared candidates
        let mut soft_candidates = Vec::new();
        for reference in soft {
            let Some(referent) = reference.referent() else {
                continue;
            };
            if space.is_marked(referent) {
                continue;
            }
            if self.policy.should_clear(&reference) {
                soft_candidates.push(reference);
            } else {
                marker.mark_from(space, referent);
            }
        }
        discovery.soft_cleared = self.clear_unmarked(space, soft_candidates, &mut discovery.pending);

        // Weak
        discovery.weak_cleared = self.clear_unmarked(space, weak, &mut discovery.pending);

        // Finalizable
        let unreachable: Vec<ObjectId> = space
            .ids()
            .filter(|id| {
                space
                    .get(*id)
                    .is_some_and(|record| !record.header.is_marked() && record.header.is_finalizable())
            })
            .collect();
        for id in unreachable {
            let Some(record) = space.get_mut(id) else {
                continue;
            };
            record.header.schedule_finalizer();
            let Some(finalizer) = record.finalizer.take() else {
                continue;
            };

            if self.finalization_enabled {
                discovery.finalizable.push((id, finalizer));
            } else {
                record.header.finish_finalizer();
                discovery.discarded.push(finalizer);
            }
        }
        for (id, _) in &discovery.finalizable {
            marker.mark_from(space, *id);
        }

        // Phantom
        discovery.phantom_cleared = self.clear_unmarked(space, phantom, &mut discovery.pending);

        discovery
    }

    fn clear_unmarked(
        &self,
        space: &mut ObjectSpace,
        references: Vec<Reference>,
        pending: &mut Vec<Reference>,
    ) -> usize {
        let mut cleared = 0;
        for reference in references {
            let Some(referent) = reference.referent() else {
                continue;
            };
            if space.is_marked(referent) {
                continue;
            }
            if reference.make_pending(space) {
                cleared += 1;
                pending.push(reference);
            }
        }
        cleared
    }
}
