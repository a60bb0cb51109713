//! evaluation phases
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// A stage of the orchestration lifecycle
///
/// Inputs may differ between phases, so nothing evaluated in one phase is reused in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalPhase {
    Validate,
    Plan,
    Apply,
}

impl fmt::Display for EvalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalPhase::Validate => f.write_str("validate"),
            EvalPhase::Plan => f.write_str("plan"),
            EvalPhase::Apply => f.write_str("apply"),
        }
    }
}

/// One `T` per phase, created on first access and owned by the enclosing node
pub struct PerEvalPhase<T> {
    values: Mutex<HashMap<EvalPhase, Arc<T>>>,
}

impl<T> Default for PerEvalPhase<T> {
    fn default() -> Self {
        Self {
            values: Default::default(),
        }
    }
}

impl<T: Default> PerEvalPhase<T> {
    pub fn for_phase(&self, phase: EvalPhase) -> Arc<T> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(values.entry(phase).or_default())
    }
}

impl<T> fmt::Debug for PerEvalPhase<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_set().entries(values.keys()).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn one_value_per_phase() {
        let per_phase: PerEvalPhase<Mutex<u32>> = Default::default();

        let plan = per_phase.for_phase(EvalPhase::Plan);
        *plan.lock().unwrap() = 7;

        assert!(Arc::ptr_eq(&plan, &per_phase.for_phase(EvalPhase::Plan)));
        assert!(!Arc::ptr_eq(&plan, &per_phase.for_phase(EvalPhase::Apply)));
        assert_eq!(*per_phase.for_phase(EvalPhase::Apply).lock().unwrap(), 0);
    }
}
