use crate::addrs::AbsOutputValue;
use crate::config::OutputValueDecl;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::Main;
use crate::eval::{
    do_once_with_diags, Evaluable, Memo, MemoizedResult, Plannable, Validatable,
};
use crate::expr::eval_expr;
use crate::phase::{EvalPhase, PerEvalPhase};
use crate::plan::ResourceInstanceChange;
use crate::promising::Canceled;
use crate::types::{self, TypeConstraint};
use crate::value::Value;
use std::sync::Arc;

/// An `output` block of one stack instance
#[derive(Debug)]
pub struct OutputValue {
    addr: AbsOutputValue,
    result: PerEvalPhase<Memo<Value>>,
}

impl OutputValue {
    pub fn new(addr: AbsOutputValue) -> Self {
        Self {
            addr,
            result: Default::default(),
        }
    }

    pub fn addr(&self) -> &AbsOutputValue {
        &self.addr
    }

    pub fn declaration(&self, main: &Main) -> Option<Arc<OutputValueDecl>> {
        let config = main.stack_config(&self.addr.stack.config_addr())?;
        config.output_values.get(&self.addr.name).cloned()
    }

    /// The declared type constraint, or "anything" when there is no declaration
    pub fn result_type(&self, main: &Main) -> TypeConstraint {
        match self.declaration(main) {
            Some(decl) => decl.ty.clone(),
            None => TypeConstraint::dynamic(),
        }
    }

    /// The memoized result for `phase`, tagged with how it came about
    pub async fn check_outcome(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<Arc<MemoizedResult<Value>>, Canceled> {
        let once = self.result.for_phase(phase);
        let decl = self.declaration(main);
        let subject = decl.as_ref().map(|decl| &decl.range);

        do_once_with_diags(&*once, &self.tracing_name(), subject, || {
            self.compute(main, phase, decl.clone())
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip_all, fields(output = %self.addr, %phase))]
    async fn compute(
        &self,
        main: &Main,
        phase: EvalPhase,
        decl: Option<Arc<OutputValueDecl>>,
    ) -> Result<MemoizedResult<Value>, Canceled> {
        let mut diags = Diagnostics::new();

        let Some(decl) = decl else {
            return Ok(MemoizedResult::deferred(diags));
        };

        // inside a stack whose expansion isn't known yet
        let Some(stack) = main.stack(&self.addr.stack, phase).await? else {
            return Ok(MemoizedResult::deferred(diags));
        };

        let (value, more_diags) = eval_expr(main, &decl.value, phase, stack.as_ref()).await?;
        diags.append(more_diags);
        if diags.has_errors() {
            return Ok(MemoizedResult::failed(diags));
        }

        let value = match &decl.ty.defaults {
            Some(defaults) => defaults.apply(value),
            None => value,
        };

        match types::convert(value, &decl.ty.ty) {
            Ok(value) => Ok(MemoizedResult::resolved(value, diags)),
            Err(err) => {
                diags.push(
                    Diagnostic::error(
                        "Invalid output value result",
                        format!("Unsuitable value for output {:?}: {err}.", self.addr.name),
                    )
                    .with_subject(decl.value.range.clone()),
                );
                Ok(MemoizedResult::failed(diags))
            }
        }
    }
}

#[async_trait::async_trait]
impl Evaluable for OutputValue {
    fn tracing_name(&self) -> String {
        self.addr.to_string()
    }

    async fn check_value(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<(Value, Diagnostics), Canceled> {
        let result = self.check_outcome(main, phase).await?;
        let ty = self.result_type(main).ty;
        Ok((result.value_or_placeholder(&ty), result.diagnostics.clone()))
    }
}

#[async_trait::async_trait]
impl Plannable for OutputValue {
    async fn plan_changes(
        &self,
        main: &Main,
    ) -> Result<(Vec<ResourceInstanceChange>, Diagnostics), Canceled> {
        let (_, diags) = self.check_value(main, EvalPhase::Plan).await?;
        Ok((vec![], diags))
    }
}

#[async_trait::async_trait]
impl Validatable for OutputValue {
    async fn validate(&self, main: &Main) -> Result<Diagnostics, Canceled> {
        let (_, diags) = self.check_value(main, EvalPhase::Validate).await?;
        Ok(diags)
    }
}
