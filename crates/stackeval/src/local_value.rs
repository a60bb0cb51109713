use crate::addrs::AbsLocalValue;
use crate::config::LocalValueDecl;
use crate::diagnostics::Diagnostics;
use crate::engine::Main;
use crate::eval::{do_once_with_diags, Evaluable, Memo, MemoizedResult, Plannable, Validatable};
use crate::expr::eval_expr;
use crate::phase::{EvalPhase, PerEvalPhase};
use crate::plan::ResourceInstanceChange;
use crate::promising::Canceled;
use crate::types::Type;
use crate::value::Value;
use std::sync::Arc;

/// An entry of a `locals` block
#[derive(Debug)]
pub struct LocalValue {
    addr: AbsLocalValue,
    decl: Arc<LocalValueDecl>,
    value: PerEvalPhase<Memo<Value>>,
}

impl LocalValue {
    pub fn new(addr: AbsLocalValue, decl: Arc<LocalValueDecl>) -> Self {
        Self {
            addr,
            decl,
            value: Default::default(),
        }
    }

    pub fn addr(&self) -> &AbsLocalValue {
        &self.addr
    }

    pub async fn check_outcome(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<Arc<MemoizedResult<Value>>, Canceled> {
        let once = self.value.for_phase(phase);
        do_once_with_diags(&*once, &self.tracing_name(), Some(&self.decl.value.range), || {
            self.compute(main, phase)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(local = %self.addr, %phase))]
    async fn compute(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<MemoizedResult<Value>, Canceled> {
        let Some(stack) = main.stack(&self.addr.stack, phase).await? else {
            return Ok(MemoizedResult::deferred(Diagnostics::new()));
        };

        let (value, diags) = eval_expr(main, &self.decl.value, phase, stack.as_ref()).await?;
        if diags.has_errors() {
            return Ok(MemoizedResult::failed(diags));
        }
        Ok(MemoizedResult::resolved(value, diags))
    }
}

#[async_trait::async_trait]
impl Evaluable for LocalValue {
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
            result.value_or_placeholder(&Type::Dynamic),
            result.diagnostics.clone(),
        ))
    }
}

#[async_trait::async_trait]
impl Plannable for LocalValue {
    async fn plan_changes(
        &self,
        main: &Main,
    ) -> Result<(Vec<ResourceInstanceChange>, Diagnostics), Canceled> {
        let (_, diags) = self.check_value(main, EvalPhase::Plan).await?;
        Ok((vec![], diags))
    }
}

#[async_trait::async_trait]
impl Validatable for LocalValue {
    async fn validate(&self, main: &Main) -> Result<Diagnostics, Canceled> {
        let (_, diags) = self.check_value(main, EvalPhase::Validate).await?;
        Ok(diags)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::addrs::StackInstance;
    use crate::config::StackConfig;
    use crate::diagnostics::DiagnosticKind;
    use crate::eval::Outcome;
    use crate::hcl_documents;
    use crate::promising::{self, CancelToken};
    use indexmap::indexmap;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn main_for(documents: hcl_documents::HclDocuments) -> Arc<Main> {
        Arc::new(Main::new(StackConfig::new(&documents).expect("valid configuration")))
    }

    fn local(main: &Main, name: &str) -> Arc<LocalValue> {
        main.local_value(&AbsLocalValue::new(StackInstance::root(), name.into()))
            .expect("declared local")
    }

    #[tokio::test]
    async fn references_are_resolved() {
        let documents = hcl_documents! {r#"
        variable "name" { type = string }
        locals {
          greeting = "hello ${var.name}"
          shout    = "${local.greeting}!"
        }
        "#};
        let main = Main::new(StackConfig::new(&documents).expect("valid configuration"))
            .with_root_input_values(EvalPhase::Plan, indexmap! {"name".into() => Value::from("world")});

        let shout = local(&main, "shout");
        let result = shout.check_outcome(&main, EvalPhase::Plan).await.unwrap();
        assert_eq!(result.outcome, Outcome::Resolved(Value::from("hello world!")));
    }

    #[tokio::test]
    async fn unknown_inputs_make_unknown_results() {
        let main = main_for(hcl_documents! {r#"
        variable "name" { type = string }
        locals {
          greeting = "hello ${var.name}"
        }
        "#});

        let (value, diags) = local(&main, "greeting")
            .check_value(&main, EvalPhase::Validate)
            .await
            .unwrap();
        assert_eq!(value, Value::Unknown(Type::Dynamic));
        assert!(diags.is_empty());
    }

    async fn check_cycle(main: Arc<Main>, names: &[&str]) {
        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let main = Arc::clone(&main);
                let node = local(&main, name);
                promising::spawn(async move {
                    node.check_outcome(&main, EvalPhase::Plan).await.unwrap()
                })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(result.outcome, Outcome::Failed);
            assert_eq!(result.diagnostics.len(), 1);
            let diag = result.diagnostics.iter().next().unwrap();
            assert_eq!(diag.kind, DiagnosticKind::CircularReference);
            assert_eq!(diag.summary, "Self-dependent items in configuration");
        }
    }

    #[tokio::test]
    async fn two_node_cycle() {
        let main = main_for(hcl_documents! {r#"
        locals {
          a = local.b
          b = local.a
        }
        "#});

        let run = promising::main_task(CancelToken::new(), check_cycle(main, &["a", "b"]));
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cycle is detected instead of hanging");
    }

    #[tokio::test]
    async fn three_node_cycle() {
        let main = main_for(hcl_documents! {r#"
        locals {
          a = local.b
          b = local.c
          c = "${local.a}!"
        }
        "#});

        let run = promising::main_task(CancelToken::new(), check_cycle(main, &["a", "b", "c"]));
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("cycle is detected instead of hanging");
    }
}
