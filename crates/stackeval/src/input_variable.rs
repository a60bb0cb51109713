use crate::addrs::AbsInputVariable;
use crate::config::InputVariableDecl;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::Main;
use crate::eval::{
    do_once_with_diags, Evaluable, Memo, MemoizedResult, Outcome, Plannable, Validatable,
};
use crate::phase::{EvalPhase, PerEvalPhase};
use crate::plan::ResourceInstanceChange;
use crate::promising::Canceled;
use crate::types;
use crate::value::Value;
use std::sync::Arc;

/// A `variable` block of one stack instance
///
/// Root stack variables take their value from the caller, variables of embedded stacks from
/// the `inputs` of the calling `stack` block.
#[derive(Debug)]
pub struct InputVariable {
    addr: AbsInputVariable,
    decl: Arc<InputVariableDecl>,
    value: PerEvalPhase<Memo<Value>>,
}

impl InputVariable {
    pub fn new(addr: AbsInputVariable, decl: Arc<InputVariableDecl>) -> Self {
        Self {
            addr,
            decl,
            value: Default::default(),
        }
    }

    pub fn addr(&self) -> &AbsInputVariable {
        &self.addr
    }

    pub fn declaration(&self) -> &InputVariableDecl {
        &self.decl
    }

    pub async fn check_outcome(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<Arc<MemoizedResult<Value>>, Canceled> {
        let once = self.value.for_phase(phase);
        do_once_with_diags(&*once, &self.tracing_name(), Some(&self.decl.range), || {
            self.compute(main, phase)
        })
        .await
    }

    /// What the caller defined for this variable, null when nothing was given
    async fn defined_value(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<Outcome<Value>, Canceled> {
        let Some((caller, step)) = self.addr.stack.parent() else {
            // no real values exist before planning
            if phase == EvalPhase::Validate {
                return Ok(Outcome::Resolved(Value::Unknown(self.decl.ty.ty.clone())));
            }
            let value = main.root_input_value(phase, &self.addr.name).cloned();
            return Ok(Outcome::Resolved(value.unwrap_or_default()));
        };

        let Some(call) = main
            .stack_node(&caller)
            .and_then(|stack| stack.stack_call(&step.name))
        else {
            return Ok(Outcome::Deferred);
        };

        let inputs = call.instance(step.key).check_inputs(main, phase).await?;
        Ok(match &inputs.outcome {
            Outcome::Resolved(Value::Object(attrs)) => {
                Outcome::Resolved(attrs.get(&self.addr.name).cloned().unwrap_or_default())
            }
            Outcome::Resolved(_) => Outcome::Resolved(Value::Unknown(self.decl.ty.ty.clone())),
            Outcome::Deferred => Outcome::Deferred,
            // reported by the calling instance
            Outcome::Failed => Outcome::Failed,
        })
    }

    #[tracing::instrument(level = "trace", skip_all, fields(variable = %self.addr, %phase))]
    async fn compute(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<MemoizedResult<Value>, Canceled> {
        let mut diags = Diagnostics::new();

        let value = match self.defined_value(main, phase).await? {
            Outcome::Resolved(value) => value,
            Outcome::Deferred => return Ok(MemoizedResult::deferred(diags)),
            Outcome::Failed => return Ok(MemoizedResult::failed(diags)),
        };

        let value = match (value, &self.decl.default) {
            (Value::Null, Some(default)) => default.clone(),
            (Value::Null, None) => {
                diags.push(
                    Diagnostic::error(
                        "No value for required variable",
                        format!(
                            "The input variable {:?} is required, but no value was provided.",
                            self.addr.name
                        ),
                    )
                    .with_subject(self.decl.range.clone()),
                );
                return Ok(MemoizedResult::failed(diags));
            }
            (value, _) => value,
        };

        let value = match &self.decl.ty.defaults {
            Some(defaults) => defaults.apply(value),
            None => value,
        };

        match types::convert(value, &self.decl.ty.ty) {
            Ok(value) => Ok(MemoizedResult::resolved(value, diags)),
            Err(err) => {
                diags.push(
                    Diagnostic::error(
                        "Invalid value for input variable",
                        format!("Unsuitable value for variable {:?}: {err}.", self.addr.name),
                    )
                    .with_subject(self.decl.range.clone()),
                );
                Ok(MemoizedResult::failed(diags))
            }
        }
    }
}

#[async_trait::async_trait]
impl Evaluable for InputVariable {
    fn tracing_name(&self) -> String {
        self.addr.to_string()
    }

    async fn check_value(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<(Value, Diagnostics), Canceled> {
        let result = self.check_outcome(main, phase).await?;
        Ok((
            result.value_or_placeholder(&self.decl.ty.ty),
            result.diagnostics.clone(),
        ))
    }
}

#[async_trait::async_trait]
impl Plannable for InputVariable {
    async fn plan_changes(
        &self,
        main: &Main,
    ) -> Result<(Vec<ResourceInstanceChange>, Diagnostics), Canceled> {
        let (_, diags) = self.check_value(main, EvalPhase::Plan).await?;
        Ok((vec![], diags))
    }
}

#[async_trait::async_trait]
impl Validatable for InputVariable {
    async fn validate(&self, main: &Main) -> Result<Diagnostics, Canceled> {
        let (_, diags) = self.check_value(main, EvalPhase::Validate).await?;
        Ok(diags)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addrs::{InstanceKey, StackInstance};
    use crate::config::StackConfig;
    use crate::hcl_documents;
    use crate::types::Type;
    use indexmap::indexmap;
    use pretty_assertions::assert_eq;

    fn main_for(documents: hcl_documents::HclDocuments) -> Main {
        Main::new(StackConfig::new(&documents).expect("valid configuration"))
    }

    fn variable(main: &Main, stack: StackInstance, name: &str) -> Arc<InputVariable> {
        main.input_variable(&AbsInputVariable::new(stack, name.into()))
            .expect("declared variable")
    }

    #[tokio::test]
    async fn root_values_come_from_the_caller() {
        let main = main_for(hcl_documents! {r#"
        variable "port" { type = number }
        variable "region" {
          type    = string
          default = "eu"
        }
        "#})
        .with_root_input_values(EvalPhase::Plan, indexmap! {"port".into() => Value::from("8080")});

        let port = variable(&main, StackInstance::root(), "port");
        let region = variable(&main, StackInstance::root(), "region");

        assert_eq!(
            port.check_value(&main, EvalPhase::Plan).await.unwrap(),
            (Value::Integer(8080), Diagnostics::new())
        );
        assert_eq!(
            region.value(&main, EvalPhase::Plan).await.unwrap(),
            Value::from("eu")
        );
        assert_eq!(
            port.value(&main, EvalPhase::Validate).await.unwrap(),
            Value::Unknown(Type::Number)
        );
    }

    #[tokio::test]
    async fn missing_required_value() {
        let main = main_for(hcl_documents! {"variable \"port\" { type = number }"});

        let port = variable(&main, StackInstance::root(), "port");
        let (value, diags) = port.check_value(&main, EvalPhase::Apply).await.unwrap();

        assert_eq!(value, Value::Unknown(Type::Number));
        assert_eq!(diags.iter().next().unwrap().summary, "No value for required variable");
    }

    #[tokio::test]
    async fn embedded_values_come_from_inputs() {
        let main = main_for(hcl_documents! {r#"
        stack "app" {
          count  = 2
          inputs = { name = "app-${count.index}" }

          variable "name" { type = string }
          variable "size" {
            type    = number
            default = 1
          }
        }
        "#});

        let second = StackInstance::root().child("app", InstanceKey::Int(1));
        let name = variable(&main, second.clone(), "name");
        let size = variable(&main, second, "size");

        assert_eq!(name.value(&main, EvalPhase::Plan).await.unwrap(), Value::from("app-1"));
        assert_eq!(size.value(&main, EvalPhase::Plan).await.unwrap(), Value::Integer(1));
    }

    #[tokio::test]
    async fn unsuitable_input() {
        let main = main_for(hcl_documents! {r#"
        stack "app" {
          inputs = { ports = "eighty" }
          variable "ports" { type = list(number) }
        }
        "#});

        let app = StackInstance::root().child("app", InstanceKey::NoKey);
        let (value, diags) = variable(&main, app, "ports")
            .check_value(&main, EvalPhase::Plan)
            .await
            .unwrap();

        assert_eq!(value, Value::Unknown(Type::List(Box::new(Type::Number))));
        assert_eq!(diags.len(), 1);
        let diag = diags.iter().next().unwrap();
        assert_eq!(diag.summary, "Invalid value for input variable");
        assert_eq!(
            diag.detail,
            "Unsuitable value for variable \"ports\": list of number required."
        );
    }
}
