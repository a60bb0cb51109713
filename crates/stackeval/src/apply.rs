//! results of applying a plan
use crate::addrs::AbsResourceInstanceObject;
use crate::plan::{Plan, State};
use indexmap::IndexSet;

/// Objects whose persisted state may have changed during an apply
pub type AffectedObjectSet = IndexSet<AbsResourceInstanceObject>;

/// Every object whose state could change while applying `plan`
///
/// Besides the objects with planned changes this includes everything present before or after
/// refresh, since refresh may have updated records without any planned change. Reporting too
/// much is harmless; missing an object leaves a stale record behind.
pub fn resource_instance_objects_affected_by_plan(plan: &Plan) -> AffectedObjectSet {
    let mut affected = AffectedObjectSet::new();

    if let Some(changes) = &plan.changes {
        affected.extend(changes.resources.iter().map(|change| change.object_addr()));
    }
    for state in [&plan.prior_state, &plan.prev_run_state].into_iter().flatten() {
        affected.extend(state.all_resource_instance_object_addrs());
    }

    tracing::debug!(count = affected.len(), "affected resource instance objects");
    affected
}

/// The outcome of an apply: the final state plus what it may have touched
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyResult {
    final_state: State,
    affected_resource_instance_objects: AffectedObjectSet,
}

impl ApplyResult {
    /// Packages `final_state` with the objects affected by the plan that was applied
    pub fn new(plan: &Plan, final_state: State) -> Self {
        Self {
            final_state,
            affected_resource_instance_objects: resource_instance_objects_affected_by_plan(plan),
        }
    }

    pub fn final_state(&self) -> &State {
        &self.final_state
    }

    pub fn affected_resource_instance_objects(&self) -> &AffectedObjectSet {
        &self.affected_resource_instance_objects
    }

    /// Affected objects that are gone from the final state
    ///
    /// Their persisted records must be removed.
    pub fn stale_objects(&self) -> impl Iterator<Item = &AbsResourceInstanceObject> {
        self.affected_resource_instance_objects
            .iter()
            .filter(|addr| self.final_state.object(addr).is_none())
    }

    pub fn into_parts(self) -> (State, AffectedObjectSet) {
        (self.final_state, self.affected_resource_instance_objects)
    }
}
