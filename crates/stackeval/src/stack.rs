//! a stack instance: its nodes and the scope its expressions are evaluated in
use crate::addrs::{
    AbsInputVariable, AbsLocalValue, AbsOutputValue, AbsStackCall, StackInstance,
};
use crate::config::StackConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::Main;
use crate::eval::Evaluable;
use crate::expr::{ExpressionScope, Reference};
use crate::input_variable::InputVariable;
use crate::local_value::LocalValue;
use crate::output_value::OutputValue;
use crate::phase::EvalPhase;
use crate::promising::Canceled;
use crate::stack_call::StackCall;
use crate::types::Type;
use crate::value::Value;
use indexmap::IndexMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct Stack {
    addr: StackInstance,
    config: Arc<StackConfig>,
    input_variables: IndexMap<String, Arc<InputVariable>>,
    local_values: IndexMap<String, Arc<LocalValue>>,
    output_values: IndexMap<String, Arc<OutputValue>>,
    stack_calls: IndexMap<String, Arc<StackCall>>,
}

impl Stack {
    pub fn new(addr: StackInstance, config: Arc<StackConfig>) -> Self {
        let input_variables = config
            .input_variables
            .iter()
            .map(|(name, decl)| {
                let node_addr = AbsInputVariable::new(addr.clone(), name.clone());
                let node = InputVariable::new(node_addr, Arc::clone(decl));
                (name.clone(), Arc::new(node))
            })
            .collect();
        let local_values = config
            .local_values
            .iter()
            .map(|(name, decl)| {
                let node_addr = AbsLocalValue::new(addr.clone(), name.clone());
                let node = LocalValue::new(node_addr, Arc::clone(decl));
                (name.clone(), Arc::new(node))
            })
            .collect();
        let output_values = config
            .output_values
            .keys()
            .map(|name| {
                let node_addr = AbsOutputValue::new(addr.clone(), name.clone());
                (name.clone(), Arc::new(OutputValue::new(node_addr)))
            })
            .collect();
        let stack_calls = config
            .embedded_stacks
            .iter()
            .map(|(name, decl)| {
                let node_addr = AbsStackCall::new(addr.clone(), name.clone());
                let node = StackCall::new(node_addr, Arc::clone(decl));
                (name.clone(), Arc::new(node))
            })
            .collect();

        Self {
            addr,
            config,
            input_variables,
            local_values,
            output_values,
            stack_calls,
        }
    }

    pub fn addr(&self) -> &StackInstance {
        &self.addr
    }

    pub fn config(&self) -> &Arc<StackConfig> {
        &self.config
    }

    pub fn input_variable(&self, name: &str) -> Option<Arc<InputVariable>> {
        self.input_variables.get(name).cloned()
    }

    pub fn local_value(&self, name: &str) -> Option<Arc<LocalValue>> {
        self.local_values.get(name).cloned()
    }

    pub fn output_value(&self, name: &str) -> Option<Arc<OutputValue>> {
        self.output_values.get(name).cloned()
    }

    pub fn stack_call(&self, name: &str) -> Option<Arc<StackCall>> {
        self.stack_calls.get(name).cloned()
    }

    pub fn input_variables(&self) -> impl Iterator<Item = &Arc<InputVariable>> {
        self.input_variables.values()
    }

    pub fn local_values(&self) -> impl Iterator<Item = &Arc<LocalValue>> {
        self.local_values.values()
    }

    pub fn output_values(&self) -> impl Iterator<Item = &Arc<OutputValue>> {
        self.output_values.values()
    }

    pub fn stack_calls(&self) -> impl Iterator<Item = &Arc<StackCall>> {
        self.stack_calls.values()
    }

    /// All output values of this instance as one object
    pub async fn output_values_object(
        &self,
        main: &Main,
        phase: EvalPhase,
    ) -> Result<Value, Canceled> {
        let mut outputs = IndexMap::new();
        for (name, output) in &self.output_values {
            outputs.insert(name.clone(), output.value(main, phase).await?);
        }
        Ok(Value::Object(outputs))
    }
}

/// `count.index` used where no instance key is in scope
pub(crate) fn count_index_unavailable() -> Diagnostic {
    Diagnostic::error(
        "Reference to \"count\" in non-counted context",
        "The \"count\" object can only be used in the inputs of a stack block with the \"count\" argument set.",
    )
}

fn undeclared(summary: &str, detail: String) -> Diagnostics {
    Diagnostic::error(summary, detail).into()
}

#[async_trait::async_trait]
impl ExpressionScope for Stack {
    async fn resolve_reference(
        &self,
        main: &Main,
        reference: &Reference,
        phase: EvalPhase,
    ) -> Result<(Value, Diagnostics), Canceled> {
        let placeholder = Value::Unknown(Type::Dynamic);

        let resolved = match reference {
            Reference::InputVariable(name) => match self.input_variables.get(name) {
                Some(node) => node.value(main, phase).await?,
                None => {
                    let detail = format!("There is no variable {name:?} block declared in this stack.");
                    return Ok((placeholder, undeclared("Reference to undeclared input variable", detail)));
                }
            },
            Reference::LocalValue(name) => match self.local_values.get(name) {
                Some(node) => node.value(main, phase).await?,
                None => {
                    let detail = format!("There is no local value named {name:?}.");
                    return Ok((placeholder, undeclared("Reference to undeclared local value", detail)));
                }
            },
            Reference::StackCall(name) => match self.stack_calls.get(name) {
                Some(node) => node.value(main, phase).await?,
                None => {
                    let detail = format!("There is no stack {name:?} block declared in this stack.");
                    return Ok((placeholder, undeclared("Reference to undeclared embedded stack", detail)));
                }
            },
            Reference::CountIndex => return Ok((placeholder, count_index_unavailable().into())),
        };

        Ok((resolved, Diagnostics::new()))
    }
}
