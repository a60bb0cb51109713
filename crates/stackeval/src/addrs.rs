//! addresses of evaluable nodes and managed resource objects
//!
//! Node addresses render the way they are written in references, prefixed with the path of
//! the stack instance they belong to: `stack.network[0].output.vpc_id`.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum InstanceKey {
    /// The single instance of something without `count`
    #[default]
    NoKey,
    Int(i64),
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceKey::NoKey => Ok(()),
            InstanceKey::Int(index) => write!(f, "[{index}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_new::new)]
pub struct StackInstanceStep {
    pub name: String,
    pub key: InstanceKey,
}

/// Path from the root stack to an instance of an embedded stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StackInstance(Vec<StackInstanceStep>);

impl StackInstance {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn steps(&self) -> &[StackInstanceStep] {
        &self.0
    }

    pub fn child(&self, name: impl Into<String>, key: InstanceKey) -> Self {
        let mut steps = self.0.clone();
        steps.push(StackInstanceStep::new(name.into(), key));
        Self(steps)
    }

    /// The calling stack and the step leading from it to `self`
    pub fn parent(&self) -> Option<(StackInstance, &StackInstanceStep)> {
        let (last, parent) = self.0.split_last()?;
        Some((StackInstance(parent.to_vec()), last))
    }

    /// The configuration all instances along this path share
    pub fn config_addr(&self) -> StackConfigAddr {
        StackConfigAddr(self.0.iter().map(|step| step.name.clone()).collect())
    }

    fn fmt_prefix(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.0 {
            write!(f, "stack.{}{}.", step.name, step.key)?;
        }
        Ok(())
    }
}

impl fmt::Display for StackInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str("<root>");
        }
        let rendered: Vec<_> = self
            .0
            .iter()
            .map(|step| format!("stack.{}{}", step.name, step.key))
            .collect();
        f.write_str(&rendered.join("."))
    }
}

/// Path from the root stack configuration to an embedded stack configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StackConfigAddr(pub Vec<String>);

impl StackConfigAddr {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut names = self.0.clone();
        names.push(name.into());
        Self(names)
    }
}

impl fmt::Display for StackConfigAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        let rendered: Vec<_> = self.0.iter().map(|name| format!("stack.{name}")).collect();
        f.write_str(&rendered.join("."))
    }
}

macro_rules! stack_item_addr {
    ($(#[$meta:meta])* $name:ident, $keyword:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, derive_new::new)]
        pub struct $name {
            pub stack: StackInstance,
            pub name: String,
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.stack.fmt_prefix(f)?;
                write!(f, concat!($keyword, ".{}"), self.name)
            }
        }
    };
}

stack_item_addr!(AbsInputVariable, "var");
stack_item_addr!(AbsLocalValue, "local");
stack_item_addr!(AbsOutputValue, "output");
stack_item_addr!(
    /// An embedded `stack` block, before expansion
    AbsStackCall,
    "stack"
);

impl AbsStackCall {
    pub fn instance(&self, key: InstanceKey) -> AbsStackCallInstance {
        AbsStackCallInstance::new(self.clone(), key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_new::new)]
pub struct AbsStackCallInstance {
    pub call: AbsStackCall,
    pub key: InstanceKey,
}

impl AbsStackCallInstance {
    /// The stack instance this call instance creates
    pub fn child_stack(&self) -> StackInstance {
        self.call.stack.child(self.call.name.clone(), self.key)
    }
}

impl fmt::Display for AbsStackCallInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.call, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_new::new)]
pub struct ResourceAddr {
    pub resource_type: String,
    pub name: String,
}

impl fmt::Display for ResourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_new::new)]
pub struct AbsResourceInstance {
    pub resource: ResourceAddr,
    pub key: InstanceKey,
}

impl AbsResourceInstance {
    pub fn current_object(&self) -> AbsResourceInstanceObject {
        AbsResourceInstanceObject::new(self.clone(), None)
    }

    pub fn deposed_object(&self, key: DeposedKey) -> AbsResourceInstanceObject {
        AbsResourceInstanceObject::new(self.clone(), Some(key))
    }
}

impl fmt::Display for AbsResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.resource, self.key)
    }
}

/// Identifies a deposed object: one that was replaced but not yet destroyed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeposedKey(pub String);

impl fmt::Display for DeposedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One persisted state record: the current object of a resource instance, or a deposed one
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, derive_new::new)]
pub struct AbsResourceInstanceObject {
    pub resource_instance: AbsResourceInstance,
    pub deposed: Option<DeposedKey>,
}

impl fmt::Display for AbsResourceInstanceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.deposed {
            None => write!(f, "{}", self.resource_instance),
            Some(key) => write!(f, "{} (deposed object {key})", self.resource_instance),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn node_addresses_include_stack_path() {
        let stack = StackInstance::root()
            .child("network", InstanceKey::Int(0))
            .child("subnets", InstanceKey::NoKey);

        let output = AbsOutputValue::new(stack.clone(), "id".into());
        assert_eq!(output.to_string(), "stack.network[0].stack.subnets.output.id");

        let variable = AbsInputVariable::new(StackInstance::root(), "region".into());
        assert_eq!(variable.to_string(), "var.region");

        assert_eq!(
            stack.config_addr(),
            StackConfigAddr(vec!["network".into(), "subnets".into()])
        );
    }

    #[test]
    fn call_instance_creates_child_stack() {
        let call = AbsStackCall::new(StackInstance::root(), "app".into());
        let instance = call.instance(InstanceKey::Int(2));

        assert_eq!(instance.to_string(), "stack.app[2]");
        let (parent, step) = instance.child_stack().parent().map(|(p, s)| (p, s.clone())).unwrap();
        assert!(parent.is_root());
        assert_eq!(step, StackInstanceStep::new("app".into(), InstanceKey::Int(2)));
    }

    #[test]
    fn resource_object_display() {
        let instance = AbsResourceInstance::new(
            ResourceAddr::new("aws_instance".into(), "web".into()),
            InstanceKey::Int(1),
        );
        assert_eq!(instance.current_object().to_string(), "aws_instance.web[1]");
        assert_eq!(
            instance
                .deposed_object(DeposedKey("00abc".into()))
                .to_string(),
            "aws_instance.web[1] (deposed object 00abc)"
        );
    }
}
