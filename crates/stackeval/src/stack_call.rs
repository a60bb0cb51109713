//! embedded `stack` blocks: their expansion and the inputs of each instance
use crate::addrs::{AbsStackCall, AbsStackCallInstance, InstanceKey};
use crate::config::EmbeddedStackDecl;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::Main;
use crate::eval::{
    do_once_with_diags, Evaluable, Memo, MemoizedResult, Outcome, Plannable, Validatable,
};
use crate::expr::{eval_expr, ExpressionScope, Reference};
use crate::phase::{EvalPhase, PerEvalPhase};
use crate::plan::ResourceInstanceChange;
use crate::promising::Canceled;
use crate::stack::{count_index_unavailable, Stack};
use crate::types::Type;
use crate::value::Value;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Upper bound for the `count` of a single `stack` block
pub const MAX_COUNT: i64 = 10_000;

fn too_many_instances() -> String {
    format!("The count argument must be at most {MAX_COUNT}.")
}

/// A `stack` block inside a stack instance, before expansion
#[derive(Debug)]
pub struct StackCall {
    addr: AbsStackCall,
    decl: Arc<EmbeddedStackDecl>,
    expansion: PerEvalPhase<Memo<Vec<InstanceKey>>>,
    instances: Mutex<HashMap<InstanceKey, Arc<StackCallInstance>>>,
}

impl StackCall {
    pub fn new(addr: AbsStackCall, decl: Arc<EmbeddedStackDecl>) -> Self {
        Self {
            addr,
            decl,
            expansion: Default::default(),
            instances: Default::default(),
        }
    }

    pub fn addr(&self) -> &AbsStackCall {
        &self.addr
    }

    pub fn declaration(&self) -> &EmbeddedStackDecl {
        &self.decl
    }

    /// The instance for `key`, whether or not the expansion contains it
    pub fn instance(&self, key: InstanceKey) -> Arc<StackCallInstance> {
        let mut instances = self.instances.lock().unwrap_or_else(PoisonError::into_inner);
        let instance = instances.entry(key).or_insert_with(|| {
            Arc::new(StackCallInstance::new(
                self.addr.instance(key),
                Arc::clone(&self.decl),
            ))
        });
        Arc::clone(instance)
    }

    /// The instance keys this call expands to in `phase`
    pub async fn check_expansion(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<Arc<MemoizedResult<Vec<InstanceKey>>>, Canceled> {
        let once = self.expansion.for_phase(phase);
        let name = format!("{} expansion", self.addr);
        do_once_with_diags(&*once, &name, Some(&self.decl.range), || {
            self.compute_expansion(main, phase)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(call = %self.addr, %phase))]
    async fn compute_expansion(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<MemoizedResult<Vec<InstanceKey>>, Canceled> {
        let mut diags = Diagnostics::new();

        let Some(count_expr) = &self.decl.count else {
            return Ok(MemoizedResult::resolved(vec![InstanceKey::NoKey], diags));
        };

        let Some(stack) = main.stack(&self.addr.stack, phase).await? else {
            return Ok(MemoizedResult::deferred(diags));
        };

        let (value, more_diags) = eval_expr(main, count_expr, phase, stack.as_ref()).await?;
        diags.append(more_diags);
        if diags.has_errors() {
            return Ok(MemoizedResult::failed(diags));
        }

        let count = match value {
            Value::Unknown(_) => return Ok(MemoizedResult::deferred(diags)),
            Value::Integer(count) if (0..=MAX_COUNT).contains(&count) => count,
            Value::Decimal(count)
                if (0.0..=MAX_COUNT as f64).contains(&count) && count.fract() == 0.0 =>
            {
                count as i64
            }
            other => {
                let detail = match other {
                    Value::Integer(count) if count > MAX_COUNT => too_many_instances(),
                    Value::Decimal(count) if count > MAX_COUNT as f64 => too_many_instances(),
                    Value::Integer(_) | Value::Decimal(_) => {
                        "The count argument must be a whole number, zero or greater.".to_string()
                    }
                    other => format!(
                        "The count argument must be a whole number, not {}.",
                        other.type_name()
                    ),
                };
                diags.push(
                    Diagnostic::error("Invalid count argument", detail)
                        .with_subject(count_expr.range.clone()),
                );
                return Ok(MemoizedResult::failed(diags));
            }
        };

        tracing::trace!(count, "expanded");
        let keys = (0..count).map(InstanceKey::Int).collect();
        Ok(MemoizedResult::resolved(keys, diags))
    }

    /// Output values of one expanded instance, unknown if the instance isn't known to exist
    async fn instance_outputs(
        &self,
        main: &Main,
        key: InstanceKey,
        phase: EvalPhase,
    ) -> Result<Value, Canceled> {
        let child = self.addr.instance(key).child_stack();
        match main.stack(&child, phase).await? {
            Some(stack) => stack.output_values_object(main, phase).await,
            None => Ok(Value::Unknown(Type::Dynamic)),
        }
    }
}

#[async_trait::async_trait]
impl Evaluable for StackCall {
    fn tracing_name(&self) -> String {
        self.addr.to_string()
    }

    /// An object of the output values, or a list of them when `count` is set
    async fn check_value(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<(Value, Diagnostics), Canceled> {
        let expansion = self.check_expansion(main, phase).await?;
        let diags = expansion.diagnostics.clone();

        let Outcome::Resolved(keys) = &expansion.outcome else {
            return Ok((Value::Unknown(Type::Dynamic), diags));
        };

        if self.decl.count.is_none() {
            let outputs = self.instance_outputs(main, InstanceKey::NoKey, phase).await?;
            return Ok((outputs, diags));
        }

        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            instances.push(self.instance_outputs(main, *key, phase).await?);
        }
        Ok((Value::Array(instances), diags))
    }
}

#[async_trait::async_trait]
impl Plannable for StackCall {
    async fn plan_changes(
        &self,
        main: &Main,
    ) -> Result<(Vec<ResourceInstanceChange>, Diagnostics), Canceled> {
        let expansion = self.check_expansion(main, EvalPhase::Plan).await?;
        Ok((vec![], expansion.diagnostics.clone()))
    }
}

#[async_trait::async_trait]
impl Validatable for StackCall {
    async fn validate(&self, main: &Main) -> Result<Diagnostics, Canceled> {
        let expansion = self.check_expansion(main, EvalPhase::Validate).await?;
        Ok(expansion.diagnostics.clone())
    }
}

/// One instance of an expanded `stack` block
#[derive(Debug)]
pub struct StackCallInstance {
    addr: AbsStackCallInstance,
    decl: Arc<EmbeddedStackDecl>,
    inputs: PerEvalPhase<Memo<Value>>,
}

impl StackCallInstance {
    fn new(addr: AbsStackCallInstance, decl: Arc<EmbeddedStackDecl>) -> Self {
        Self {
            addr,
            decl,
            inputs: Default::default(),
        }
    }

    pub fn addr(&self) -> &AbsStackCallInstance {
        &self.addr
    }

    /// The object of input values passed to the child stack's variables
    pub async fn check_inputs(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<Arc<MemoizedResult<Value>>, Canceled> {
        let once = self.inputs.for_phase(phase);
        let subject = self.decl.inputs.as_ref().map(|inputs| &inputs.range);
        do_once_with_diags(&*once, &self.tracing_name(), subject, || {
            self.compute_inputs(main, phase)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(instance = %self.addr, %phase))]
    async fn compute_inputs(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<MemoizedResult<Value>, Canceled> {
        let mut diags = Diagnostics::new();

        // also makes sure the calling stack exists and expands to this instance
        if main.stack(&self.addr.child_stack(), phase).await?.is_none() {
            return Ok(MemoizedResult::deferred(diags));
        }
        let Some(caller) = main.stack_node(&self.addr.call.stack) else {
            return Ok(MemoizedResult::deferred(diags));
        };

        let Some(inputs) = &self.decl.inputs else {
            return Ok(MemoizedResult::resolved(Value::Object(IndexMap::new()), diags));
        };

        let scope = InstanceScope {
            stack: caller.as_ref(),
            key: self.addr.key,
        };
        let (value, more_diags) = eval_expr(main, inputs, phase, &scope).await?;
        diags.append(more_diags);
        if diags.has_errors() {
            return Ok(MemoizedResult::failed(diags));
        }

        match value {
            value @ (Value::Object(_) | Value::Unknown(_)) => {
                Ok(MemoizedResult::resolved(value, diags))
            }
            Value::Null => Ok(MemoizedResult::resolved(Value::Object(IndexMap::new()), diags)),
            other => {
                diags.push(
                    Diagnostic::error(
                        "Invalid inputs",
                        format!(
                            "The inputs argument must be an object, not {}.",
                            other.type_name()
                        ),
                    )
                    .with_subject(inputs.range.clone()),
                );
                Ok(MemoizedResult::failed(diags))
            }
        }
    }
}

#[async_trait::async_trait]
impl Evaluable for StackCallInstance {
    fn tracing_name(&self) -> String {
        format!("{} inputs", self.addr)
    }

    async fn check_value(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<(Value, Diagnostics), Canceled> {
        let result = self.check_inputs(main, phase).await?;
        Ok((
            result.value_or_placeholder(&Type::Dynamic),
            result.diagnostics.clone(),
        ))
    }
}

#[async_trait::async_trait]
impl Plannable for StackCallInstance {
    async fn plan_changes(
        &self,
        main: &Main,
    ) -> Result<(Vec<ResourceInstanceChange>, Diagnostics), Canceled> {
        let (_, diags) = self.check_value(main, EvalPhase::Plan).await?;
        Ok((vec![], diags))
    }
}

#[async_trait::async_trait]
impl Validatable for StackCallInstance {
    async fn validate(&self, main: &Main) -> Result<Diagnostics, Canceled> {
        let (_, diags) = self.check_value(main, EvalPhase::Validate).await?;
        Ok(diags)
    }
}

/// The calling stack's scope plus `count.index` of one instance
struct InstanceScope<'a> {
    stack: &'a Stack,
    key: InstanceKey,
}

#[async_trait::async_trait]
impl ExpressionScope for InstanceScope<'_> {
    async fn resolve_reference(
        &self,
        main: &Main,
        reference: &Reference,
        phase: EvalPhase,
    ) -> Result<(Value, Diagnostics), Canceled> {
        match (reference, self.key) {
            (Reference::CountIndex, InstanceKey::Int(index)) => {
                Ok((Value::Integer(index), Diagnostics::new()))
            }
            (Reference::CountIndex, InstanceKey::NoKey) => Ok((
                Value::Unknown(Type::Dynamic),
                count_index_unavailable().into(),
            )),
            _ => self.stack.resolve_reference(main, reference, phase).await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addrs::{AbsOutputValue, StackInstance};
    use crate::config::StackConfig;
    use crate::hcl_documents;
    use indexmap::indexmap;
    use pretty_assertions::assert_eq;

    fn main_for(documents: hcl_documents::HclDocuments) -> Main {
        Main::new(StackConfig::new(&documents).expect("valid configuration"))
    }

    fn call(main: &Main, name: &str) -> Arc<StackCall> {
        main.stack_call(&AbsStackCall::new(StackInstance::root(), name.into()))
            .expect("declared stack")
    }

    #[tokio::test]
    async fn expansion_follows_count() {
        let main = main_for(hcl_documents! {r#"
        stack "single" {}
        stack "many" { count = 3 }
        stack "none" { count = 0 }
        "#});

        let single = call(&main, "single").check_expansion(&main, EvalPhase::Plan).await.unwrap();
        let many = call(&main, "many").check_expansion(&main, EvalPhase::Plan).await.unwrap();
        let none = call(&main, "none").check_expansion(&main, EvalPhase::Plan).await.unwrap();

        assert_eq!(single.outcome, Outcome::Resolved(vec![InstanceKey::NoKey]));
        assert_eq!(
            many.outcome,
            Outcome::Resolved(vec![InstanceKey::Int(0), InstanceKey::Int(1), InstanceKey::Int(2)])
        );
        assert_eq!(none.outcome, Outcome::Resolved(vec![]));
    }

    #[tokio::test]
    async fn unknown_count_defers_expansion() {
        let main = main_for(hcl_documents! {r#"
        variable "n" { type = number }
        stack "many" { count = var.n }
        "#})
        .with_root_input_values(EvalPhase::Plan, indexmap! {"n".into() => Value::Integer(2)});

        let many = call(&main, "many");
        let validate = many.check_expansion(&main, EvalPhase::Validate).await.unwrap();
        let plan = many.check_expansion(&main, EvalPhase::Plan).await.unwrap();

        assert_eq!(validate.outcome, Outcome::Deferred);
        assert!(validate.diagnostics.is_empty());
        assert_eq!(
            plan.outcome,
            Outcome::Resolved(vec![InstanceKey::Int(0), InstanceKey::Int(1)])
        );
    }

    #[tokio::test]
    async fn invalid_count() {
        let main = main_for(hcl_documents! {r#"
        stack "negative" { count = -1 }
        stack "text" { count = "three" }
        "#});

        for (name, detail) in [
            ("negative", "The count argument must be a whole number, zero or greater."),
            ("text", "The count argument must be a whole number, not string."),
        ] {
            let expansion = call(&main, name).check_expansion(&main, EvalPhase::Plan).await.unwrap();
            assert_eq!(expansion.outcome, Outcome::Failed);
            let diag = expansion.diagnostics.iter().next().unwrap();
            assert_eq!(diag.summary, "Invalid count argument");
            assert_eq!(diag.detail, detail);
        }
    }

    #[tokio::test]
    async fn oversized_count_is_rejected() {
        let main = main_for(hcl_documents! {r#"
        stack "huge" { count = 1000000000000000000 }
        stack "huge_decimal" { count = 1e300 }
        stack "limit" { count = 10000 }
        "#});

        for name in ["huge", "huge_decimal"] {
            let expansion = call(&main, name).check_expansion(&main, EvalPhase::Plan).await.unwrap();
            assert_eq!(expansion.outcome, Outcome::Failed);
            let diag = expansion.diagnostics.iter().next().unwrap();
            assert_eq!(diag.summary, "Invalid count argument");
            assert_eq!(diag.detail, "The count argument must be at most 10000.");
        }

        let limit = call(&main, "limit").check_expansion(&main, EvalPhase::Plan).await.unwrap();
        assert_eq!(limit.outcome.resolved().map(Vec::len), Some(10_000));
    }

    #[tokio::test]
    async fn value_collects_child_outputs() {
        let main = main_for(hcl_documents! {r#"
        stack "one" {
          output "id" { value = "single" }
        }
        stack "many" {
          count  = 2
          inputs = { index = count.index }

          variable "index" { type = number }
          output "id" { value = "item-${var.index}" }
        }
        "#});

        let (one, diags) = call(&main, "one").check_value(&main, EvalPhase::Plan).await.unwrap();
        assert!(diags.is_empty());
        assert_eq!(one, Value::from(indexmap! {"id" => Value::from("single")}));

        let many = call(&main, "many").value(&main, EvalPhase::Plan).await.unwrap();
        assert_eq!(
            many,
            Value::Array(vec![
                Value::from(indexmap! {"id" => Value::from("item-0")}),
                Value::from(indexmap! {"id" => Value::from("item-1")}),
            ])
        );
    }

    #[tokio::test]
    async fn inputs_must_be_an_object() {
        let main = main_for(hcl_documents! {r#"
        stack "child" { inputs = ["a"] }
        "#});

        let instance = call(&main, "child").instance(InstanceKey::NoKey);
        let inputs = instance.check_inputs(&main, EvalPhase::Plan).await.unwrap();

        assert_eq!(inputs.outcome, Outcome::Failed);
        let diag = inputs.diagnostics.iter().next().unwrap();
        assert_eq!(diag.summary, "Invalid inputs");
        assert_eq!(diag.detail, "The inputs argument must be an object, not list.");
    }

    #[tokio::test]
    async fn count_index_outside_counted_inputs() {
        let main = main_for(hcl_documents! {r#"
        stack "child" { inputs = { index = count.index } }
        output "index" { value = count.index }
        "#});

        let inputs = call(&main, "child")
            .instance(InstanceKey::NoKey)
            .check_inputs(&main, EvalPhase::Plan)
            .await
            .unwrap();
        assert_eq!(inputs.outcome, Outcome::Failed);
        assert_eq!(
            inputs.diagnostics.iter().next().unwrap().summary,
            "Reference to \"count\" in non-counted context"
        );

        let output = main
            .output_value(&AbsOutputValue::new(StackInstance::root(), "index".into()))
            .unwrap();
        let (_, diags) = output.check_value(&main, EvalPhase::Plan).await.unwrap();
        assert!(diags.has_errors());
    }

    #[tokio::test]
    async fn instances_outside_the_expansion_are_deferred() {
        let main = main_for(hcl_documents! {r#"
        stack "many" {
          count  = 1
          inputs = {}
        }
        "#});

        let outside = call(&main, "many").instance(InstanceKey::Int(5));
        let inputs = outside.check_inputs(&main, EvalPhase::Plan).await.unwrap();
        assert_eq!(inputs.outcome, Outcome::Deferred);
    }
}
