//! evaluation results and the traits every node implements
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
use crate::engine::Main;
use crate::hcl_documents::SourceRange;
use crate::phase::EvalPhase;
use crate::plan::ResourceInstanceChange;
use crate::promising::{Canceled, CycleError, Once, PromiseError};
use crate::types::Type;
use crate::value::Value;
use std::future::Future;
use std::sync::Arc;

/// What a node's evaluation body produced
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Resolved(T),
    /// Not knowable in this phase, e.g. inside a stack whose expansion is unknown
    Deferred,
    /// Evaluation failed; the reasons are in the accompanying diagnostics
    Failed,
}

impl<T> Outcome<T> {
    pub fn resolved(&self) -> Option<&T> {
        match self {
            Outcome::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

/// The memoized result of one node in one phase
#[derive(Debug, Clone, PartialEq)]
pub struct MemoizedResult<T> {
    pub outcome: Outcome<T>,
    pub diagnostics: Diagnostics,
}

impl<T> MemoizedResult<T> {
    pub fn resolved(value: T, diagnostics: Diagnostics) -> Self {
        Self {
            outcome: Outcome::Resolved(value),
            diagnostics,
        }
    }

    pub fn deferred(diagnostics: Diagnostics) -> Self {
        Self {
            outcome: Outcome::Deferred,
            diagnostics,
        }
    }

    pub fn failed(diagnostics: Diagnostics) -> Self {
        Self {
            outcome: Outcome::Failed,
            diagnostics,
        }
    }
}

impl MemoizedResult<Value> {
    /// The resolved value, or an unknown of type `ty` standing in for it
    pub fn value_or_placeholder(&self, ty: &Type) -> Value {
        match &self.outcome {
            Outcome::Resolved(value) => value.clone(),
            Outcome::Deferred | Outcome::Failed => Value::Unknown(ty.clone()),
        }
    }
}

pub(crate) type Memo<T> = Once<Arc<MemoizedResult<T>>>;

/// Runs `compute` at most once for `once`
///
/// A self-dependency is turned into a failed result carrying a circular reference
/// diagnostic.
pub(crate) async fn do_once_with_diags<T, F, Fut>(
    once: &Memo<T>,
    name: &str,
    subject: Option<&SourceRange>,
    compute: F,
) -> Result<Arc<MemoizedResult<T>>, Canceled>
where
    T: Send + Sync,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<MemoizedResult<T>, Canceled>>,
{
    let on_cycle = |cycle: CycleError| Arc::new(circular_reference(name, subject, &cycle));
    let result = once
        .get_or_recover(name, || async { compute().await.map(Arc::new) }, on_cycle)
        .await;

    match result {
        Ok(result) => Ok(result),
        Err(PromiseError::Canceled(canceled)) => Err(canceled),
        // only the request closing the cycle ends up here, the promise itself resolves
        // through `on_cycle` once its owner finishes
        Err(PromiseError::Circular(cycle)) => Ok(on_cycle(cycle)),
    }
}

fn circular_reference<T>(
    name: &str,
    subject: Option<&SourceRange>,
    cycle: &CycleError,
) -> MemoizedResult<T> {
    let closed_by = cycle.chain.first().map(String::as_str).unwrap_or(name);
    let diagnostic = Diagnostic::error(
        "Self-dependent items in configuration",
        format!(
            "The value of {name} depends on itself. The cycle involves {}, closed by the reference to {closed_by}.",
            cycle.chain.join(", ")
        ),
    )
    .with_subject(subject.cloned())
    .with_kind(DiagnosticKind::CircularReference);
    MemoizedResult::failed(diagnostic.into())
}

/// Something that has a value in each phase
#[async_trait::async_trait]
pub trait Evaluable: Send + Sync {
    fn tracing_name(&self) -> String;

    /// The value along with every diagnostic raised while producing it
    ///
    /// Values that are not known in `phase`, or that failed, are unknown placeholders.
    async fn check_value(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<(Value, Diagnostics), Canceled>;

    async fn value(&self, main: &Main, phase: EvalPhase) -> Result<Value, Canceled> {
        Ok(self.check_value(main, phase).await?.0)
    }
}

/// Contributes to a plan
#[async_trait::async_trait]
pub trait Plannable: Send + Sync {
    async fn plan_changes(
        &self,
        main: &Main,
    ) -> Result<(Vec<ResourceInstanceChange>, Diagnostics), Canceled>;
}

/// Can be checked without any real input values
#[async_trait::async_trait]
pub trait Validatable: Send + Sync {
    async fn validate(&self, main: &Main) -> Result<Diagnostics, Canceled>;
}

/// A node visited by [crate::walk]
pub trait Walkable: Plannable + Validatable {}

impl<T: Plannable + Validatable> Walkable for T {}
