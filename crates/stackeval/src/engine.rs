//! the root of an evaluation: configuration, caller inputs and all stack instances
use crate::addrs::{
    AbsInputVariable, AbsLocalValue, AbsOutputValue, AbsStackCall, StackConfigAddr,
    StackInstance,
};
use crate::config::StackConfig;
use crate::eval::Outcome;
use crate::input_variable::InputVariable;
use crate::local_value::LocalValue;
use crate::output_value::OutputValue;
use crate::phase::EvalPhase;
use crate::promising::Canceled;
use crate::stack::Stack;
use crate::stack_call::StackCall;
use crate::value::Value;
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Entry point for evaluating a configuration
///
/// Stack instances are created on first access and live as long as `Main`. Nodes don't
/// point back to `Main`, it is passed to every operation instead.
#[derive(Debug)]
pub struct Main {
    config: Arc<StackConfig>,
    root_inputs: HashMap<EvalPhase, IndexMap<String, Value>>,
    stacks: Mutex<HashMap<StackInstance, Arc<Stack>>>,
}

impl Main {
    pub fn new(config: StackConfig) -> Self {
        Self {
            config: Arc::new(config),
            root_inputs: Default::default(),
            stacks: Default::default(),
        }
    }

    /// Values for the root stack's input variables in `phase`
    pub fn with_root_input_values(
        mut self,
        phase: EvalPhase,
        values: IndexMap<String, Value>,
    ) -> Self {
        self.root_inputs.insert(phase, values);
        self
    }

    pub fn root_input_value(&self, phase: EvalPhase, name: &str) -> Option<&Value> {
        self.root_inputs.get(&phase)?.get(name)
    }

    pub fn config(&self) -> &Arc<StackConfig> {
        &self.config
    }

    /// The configuration declared at `addr`, if there is one
    pub fn stack_config(&self, addr: &StackConfigAddr) -> Option<Arc<StackConfig>> {
        self.config.descendant(addr)
    }

    pub fn root_stack(&self) -> Arc<Stack> {
        let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        let stack = stacks.entry(StackInstance::root()).or_insert_with(|| {
            Arc::new(Stack::new(StackInstance::root(), Arc::clone(&self.config)))
        });
        Arc::clone(stack)
    }

    /// The stack instance at `addr` regardless of whether any phase expands to it
    ///
    /// `None` only when there is no configuration for it.
    pub fn stack_node(&self, addr: &StackInstance) -> Option<Arc<Stack>> {
        let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stack) = stacks.get(addr) {
            return Some(Arc::clone(stack));
        }

        let config = self.stack_config(&addr.config_addr())?;
        tracing::trace!(stack = %addr, "new stack instance");
        let stack = Arc::new(Stack::new(addr.clone(), config));
        stacks.insert(addr.clone(), Arc::clone(&stack));
        Some(stack)
    }

    /// The stack instance at `addr` if it is known to exist in `phase`
    ///
    /// `None` when a call on the way does not declare the instance or its expansion is not
    /// known yet.
    pub fn stack<'a>(
        &'a self,
        addr: &'a StackInstance,
        phase: EvalPhase,
    ) -> BoxFuture<'a, Result<Option<Arc<Stack>>, Canceled>> {
        // boxed: expanding a call evaluates expressions, which may look up stacks again
        async move {
            let mut current = self.root_stack();

            for step in addr.steps() {
                let Some(call) = current.stack_call(&step.name) else {
                    return Ok(None);
                };

                let expansion = call.check_expansion(self, phase).await?;
                match &expansion.outcome {
                    Outcome::Resolved(keys) if keys.contains(&step.key) => {}
                    _ => return Ok(None),
                }

                let child = current.addr().child(step.name.clone(), step.key);
                let Some(next) = self.stack_node(&child) else {
                    return Ok(None);
                };
                current = next;
            }

            Ok(Some(current))
        }
        .boxed()
    }

    pub fn input_variable(&self, addr: &AbsInputVariable) -> Option<Arc<InputVariable>> {
        self.stack_node(&addr.stack)?.input_variable(&addr.name)
    }

    pub fn local_value(&self, addr: &AbsLocalValue) -> Option<Arc<LocalValue>> {
        self.stack_node(&addr.stack)?.local_value(&addr.name)
    }

    pub fn output_value(&self, addr: &AbsOutputValue) -> Option<Arc<OutputValue>> {
        self.stack_node(&addr.stack)?.output_value(&addr.name)
    }

    pub fn stack_call(&self, addr: &AbsStackCall) -> Option<Arc<StackCall>> {
        self.stack_node(&addr.stack)?.stack_call(&addr.name)
    }
}
