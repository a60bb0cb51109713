//! stack configuration: the declarations found in loaded [HclDocuments]
//!
//! Supported blocks
//!
//! ```hcl
//! variable "region" {
//!   type    = string
//!   default = "eu-west-1"
//! }
//!
//! locals {
//!   prefix = "app-${var.region}"
//! }
//!
//! stack "network" {
//!   count  = 2
//!   inputs = { cidr = "10.${count.index}.0.0/16" }
//!
//!   variable "cidr" { type = string }
//!   output "vpc_id" { value = "vpc-${var.cidr}" }
//! }
//!
//! output "vpc_ids" {
//!   type  = list(string)
//!   value = [for net in stack.network : net.vpc_id]
//! }
//! ```
//!
//! Loading only checks structure. Expressions are kept as they are and evaluated later, per
//! phase, by the nodes in [crate::stack].
use crate::addrs::StackConfigAddr;
use crate::hcl_documents::{HclDocuments, SourceFile, SourceRange};
use crate::types::{self, TypeConstraint, TypeExprError};
use crate::value::Value;
use hcl_edit::structure::{Attribute, Block};
use hcl_edit::repr::Span;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// An expression together with where it was written
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct Expr {
    pub expr: hcl::Expression,
    pub range: SourceRange,
}

impl Expr {
    fn from_attribute(source: &Arc<SourceFile>, attribute: &Attribute) -> Self {
        Self::new(
            attribute.value.clone().into(),
            source.range(attribute.value.span()),
        )
    }
}

#[derive(Debug, PartialEq)]
pub struct InputVariableDecl {
    pub name: String,
    pub ty: TypeConstraint,
    /// Already converted to `ty`
    pub default: Option<Value>,
    pub description: Option<String>,
    pub range: SourceRange,
}

#[derive(Debug, PartialEq)]
pub struct LocalValueDecl {
    pub name: String,
    pub value: Expr,
}

#[derive(Debug, PartialEq)]
pub struct OutputValueDecl {
    pub name: String,
    pub ty: TypeConstraint,
    pub value: Expr,
    pub description: Option<String>,
    pub range: SourceRange,
}

/// A `stack` block: a child configuration called from its parent
#[derive(Debug, PartialEq)]
pub struct EmbeddedStackDecl {
    pub name: String,
    pub count: Option<Expr>,
    pub inputs: Option<Expr>,
    pub config: Arc<StackConfig>,
    pub range: SourceRange,
}

/// All declarations of one stack configuration
#[derive(Debug, Default, PartialEq)]
pub struct StackConfig {
    pub addr: StackConfigAddr,
    pub input_variables: IndexMap<String, Arc<InputVariableDecl>>,
    pub local_values: IndexMap<String, Arc<LocalValueDecl>>,
    pub output_values: IndexMap<String, Arc<OutputValueDecl>>,
    pub embedded_stacks: IndexMap<String, Arc<EmbeddedStackDecl>>,
}

impl StackConfig {
    /// Builds the root configuration from all loaded documents
    pub fn new(hcl_documents: &HclDocuments) -> Result<Self, ConfigErrors> {
        let mut e = ConfigErrors::new();

        for (source, attribute) in hcl_documents.attributes() {
            e.log(Issue::RootAttribute(source.range(attribute.span())));
        }

        let config = Self::from_blocks(StackConfigAddr::root(), hcl_documents.blocks(), &mut e);

        if !e.issues.is_empty() {
            return Err(e);
        }

        tracing::debug!(
            variables = config.input_variables.len(),
            locals = config.local_values.len(),
            outputs = config.output_values.len(),
            stacks = config.embedded_stacks.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Follows embedded stack declarations down to `addr`
    pub fn descendant(self: &Arc<Self>, addr: &StackConfigAddr) -> Option<Arc<StackConfig>> {
        let mut config = Arc::clone(self);
        for name in &addr.0 {
            config = Arc::clone(&config.embedded_stacks.get(name)?.config);
        }
        Some(config)
    }

    fn from_blocks<'a>(
        addr: StackConfigAddr,
        blocks: impl Iterator<Item = (&'a Arc<SourceFile>, &'a Block)>,
        e: &mut ConfigErrors,
    ) -> Self {
        let mut config = Self {
            addr,
            ..Default::default()
        };

        for (source, block) in blocks {
            let range = source.range(block.span());
            match block.ident.value().as_str() {
                "variable" => {
                    let Some(name) = single_label(block, &range, e) else {
                        continue;
                    };
                    let Some(decl) = input_variable(name.clone(), source, block, range.clone(), e)
                    else {
                        continue;
                    };
                    if config.input_variables.contains_key(&name) {
                        e.log(Issue::DuplicateDeclaration {
                            range,
                            what: format!("variable {name:?}"),
                        });
                        continue;
                    }
                    config.input_variables.insert(name, Arc::new(decl));
                }
                "locals" => {
                    if !block.labels.is_empty() {
                        e.log(Issue::TooManyLabels {
                            range: range.clone(),
                            block_type: "locals",
                        });
                    }
                    for inner in block.body.blocks() {
                        e.log(Issue::UnknownBlockType {
                            range: source.range(inner.span()),
                            block_type: inner.ident.value().to_string(),
                        });
                    }
                    for attribute in block.body.attributes() {
                        let name = attribute.key.value().to_string();
                        if config.local_values.contains_key(&name) {
                            e.log(Issue::DuplicateDeclaration {
                                range: source.range(attribute.span()),
                                what: format!("local value {name:?}"),
                            });
                            continue;
                        }
                        let value = Expr::from_attribute(source, attribute);
                        config
                            .local_values
                            .insert(name.clone(), Arc::new(LocalValueDecl { name, value }));
                    }
                }
                "output" => {
                    let Some(name) = single_label(block, &range, e) else {
                        continue;
                    };
                    let Some(decl) = output_value(name.clone(), source, block, range.clone(), e)
                    else {
                        continue;
                    };
                    if config.output_values.contains_key(&name) {
                        e.log(Issue::DuplicateDeclaration {
                            range,
                            what: format!("output {name:?}"),
                        });
                        continue;
                    }
                    config.output_values.insert(name, Arc::new(decl));
                }
                "stack" => {
                    let Some(name) = single_label(block, &range, e) else {
                        continue;
                    };
                    let child_addr = config.addr.child(name.clone());
                    let decl = embedded_stack(name.clone(), child_addr, source, block, range.clone(), e);
                    if config.embedded_stacks.contains_key(&name) {
                        e.log(Issue::DuplicateDeclaration {
                            range,
                            what: format!("stack {name:?}"),
                        });
                        continue;
                    }
                    config.embedded_stacks.insert(name, Arc::new(decl));
                }
                other => e.log(Issue::UnknownBlockType {
                    range,
                    block_type: other.to_string(),
                }),
            }
        }

        config
    }
}

fn single_label(block: &Block, range: &SourceRange, e: &mut ConfigErrors) -> Option<String> {
    let block_type = match block.ident.value().as_str() {
        "variable" => "variable",
        "output" => "output",
        _ => "stack",
    };
    match block.labels.as_slice() {
        [] => {
            e.log(Issue::LabelMissing {
                range: range.clone(),
                block_type,
            });
            None
        }
        [label] => Some(label.as_str().to_string()),
        _ => {
            e.log(Issue::TooManyLabels {
                range: range.clone(),
                block_type,
            });
            None
        }
    }
}

/// Attributes of a block by name, logging the ones not in `allowed`
fn block_attributes<'a>(
    source: &Arc<SourceFile>,
    block: &'a Block,
    allowed: &[&str],
    e: &mut ConfigErrors,
) -> IndexMap<String, &'a Attribute> {
    let mut attributes = IndexMap::new();
    for attribute in block.body.attributes() {
        let key = attribute.key.value().as_str();
        if !allowed.contains(&key) {
            e.log(Issue::UnexpectedAttribute {
                range: source.range(attribute.span()),
                attribute: key.to_string(),
            });
            continue;
        }
        attributes.insert(key.to_string(), attribute);
    }
    attributes
}

fn type_constraint(
    source: &Arc<SourceFile>,
    attribute: Option<&&Attribute>,
    e: &mut ConfigErrors,
) -> Option<TypeConstraint> {
    let Some(attribute) = attribute else {
        return Some(TypeConstraint::dynamic());
    };
    let expr: hcl::Expression = attribute.value.clone().into();
    match types::parse_type_constraint(&expr) {
        Ok(constraint) => Some(constraint),
        Err(reason) => {
            e.log(Issue::InvalidType {
                range: source.range(attribute.value.span()),
                reason,
            });
            None
        }
    }
}

fn description(attribute: Option<&&Attribute>) -> Option<String> {
    attribute
        .and_then(|attribute| types::constant_value(&attribute.value.clone().into()).ok())
        .and_then(|value| match value {
            Value::String(text) => Some(text),
            _ => None,
        })
}

fn input_variable(
    name: String,
    source: &Arc<SourceFile>,
    block: &Block,
    range: SourceRange,
    e: &mut ConfigErrors,
) -> Option<InputVariableDecl> {
    let attributes = block_attributes(source, block, &["type", "default", "description"], e);
    let ty = type_constraint(source, attributes.get("type"), e)?;

    let default = match attributes.get("default") {
        None => None,
        Some(attribute) => {
            let expr: hcl::Expression = attribute.value.clone().into();
            let default = types::constant_value(&expr).and_then(|value| {
                let value = match &ty.defaults {
                    Some(defaults) => defaults.apply(value),
                    None => value,
                };
                types::convert(value, &ty.ty).map_err(|err| err.to_string())
            });
            match default {
                Ok(value) => Some(value),
                Err(message) => {
                    e.log(Issue::InvalidDefault {
                        range: source.range(attribute.value.span()),
                        name,
                        message,
                    });
                    return None;
                }
            }
        }
    };

    Some(InputVariableDecl {
        name,
        ty,
        default,
        description: description(attributes.get("description")),
        range,
    })
}

fn output_value(
    name: String,
    source: &Arc<SourceFile>,
    block: &Block,
    range: SourceRange,
    e: &mut ConfigErrors,
) -> Option<OutputValueDecl> {
    let attributes = block_attributes(source, block, &["type", "value", "description"], e);
    let ty = type_constraint(source, attributes.get("type"), e)?;

    let Some(value) = attributes.get("value") else {
        e.log(Issue::MissingAttribute {
            range,
            block_type: "output",
            attribute: "value",
        });
        return None;
    };

    Some(OutputValueDecl {
        name,
        ty,
        value: Expr::from_attribute(source, value),
        description: description(attributes.get("description")),
        range,
    })
}

fn embedded_stack(
    name: String,
    addr: StackConfigAddr,
    source: &Arc<SourceFile>,
    block: &Block,
    range: SourceRange,
    e: &mut ConfigErrors,
) -> EmbeddedStackDecl {
    let attributes = block_attributes(source, block, &["count", "inputs"], e);
    let nested = block.body.blocks().map(|inner| (source, inner));

    EmbeddedStackDecl {
        name,
        count: attributes
            .get("count")
            .map(|attribute| Expr::from_attribute(source, attribute)),
        inputs: attributes
            .get("inputs")
            .map(|attribute| Expr::from_attribute(source, attribute)),
        config: Arc::new(StackConfig::from_blocks(addr, nested, e)),
        range,
    }
}

#[derive(derive_new::new, Debug)]
pub struct ConfigErrors {
    #[new(default)]
    issues: Vec<Issue>,
}

impl ConfigErrors {
    pub fn log(&mut self, issue: Issue) {
        tracing::debug!(%issue, "issue found");
        self.issues.push(issue);
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

impl std::error::Error for ConfigErrors {}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut issues = self.issues.iter();
        if let Some(first) = issues.next() {
            write!(f, "{first}")?;
        }
        for issue in issues {
            write!(f, "\n{issue}")?;
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Issue {
    #[error("{0}: attributes are not allowed at the top level of a configuration")]
    RootAttribute(SourceRange),
    #[error("{range}: unsupported block type {block_type:?}")]
    UnknownBlockType {
        range: SourceRange,
        block_type: String,
    },
    #[error("{range}: {block_type} block requires a name label")]
    LabelMissing {
        range: SourceRange,
        block_type: &'static str,
    },
    #[error("{range}: {block_type} block has too many labels")]
    TooManyLabels {
        range: SourceRange,
        block_type: &'static str,
    },
    #[error("{range}: duplicate declaration of {what}")]
    DuplicateDeclaration { range: SourceRange, what: String },
    #[error("{range}: {block_type} block requires the {attribute:?} attribute")]
    MissingAttribute {
        range: SourceRange,
        block_type: &'static str,
        attribute: &'static str,
    },
    #[error("{range}: unexpected attribute {attribute:?}")]
    UnexpectedAttribute {
        range: SourceRange,
        attribute: String,
    },
    #[error("{range}: invalid type constraint: {reason}")]
    InvalidType {
        range: SourceRange,
        reason: TypeExprError,
    },
    #[error("{range}: invalid default value for variable {name:?}: {message}")]
    InvalidDefault {
        range: SourceRange,
        name: String,
        message: String,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hcl_documents;
    use crate::types::Type;
    use pretty_assertions::assert_eq;

    fn config_errors_for(doc: HclDocuments) -> ConfigErrors {
        StackConfig::new(&doc).expect_err("must error")
    }

    #[test]
    fn root_attribute_errors() {
        let errors = config_errors_for(hcl_documents! {"root_attr = 1"});
        assert!(matches!(errors.issues(), [Issue::RootAttribute(_)]));
    }

    #[test]
    fn unknown_block_type_errors() {
        let errors = config_errors_for(hcl_documents! {"resource \"a\" \"b\" {}"});
        assert!(matches!(
            errors.issues(),
            [Issue::UnknownBlockType { block_type, .. }] if block_type == "resource"
        ));
    }

    #[test]
    fn label_missing() {
        let errors = config_errors_for(hcl_documents! {"variable {}"});
        assert!(matches!(
            errors.issues(),
            [Issue::LabelMissing {
                block_type: "variable",
                ..
            }]
        ));
    }

    #[test]
    fn duplicate_declarations_across_files() {
        let errors = config_errors_for(hcl_documents! {
            "a.stack.hcl" => "output \"x\" { value = 1 }",
            "b.stack.hcl" => "output \"x\" { value = 2 }"
        });
        let [Issue::DuplicateDeclaration { range, what }] = errors.issues() else {
            panic!("unexpected issues: {errors}");
        };
        assert_eq!(what, "output \"x\"");
        assert_eq!(range.path.as_deref(), Some(std::path::Path::new("b.stack.hcl")));
    }

    #[test]
    fn output_requires_value() {
        let errors = config_errors_for(hcl_documents! {"output \"x\" { type = string }"});
        assert!(matches!(
            errors.issues(),
            [Issue::MissingAttribute {
                attribute: "value",
                ..
            }]
        ));
    }

    #[test]
    fn invalid_default_is_reported() {
        let errors =
            config_errors_for(hcl_documents! {"variable \"n\" {\n  type = number\n  default = [1]\n}"});
        let [Issue::InvalidDefault { name, message, range }] = errors.issues() else {
            panic!("unexpected issues: {errors}");
        };
        assert_eq!(name, "n");
        assert_eq!(message, "a number is required");
        assert_eq!(range.start.line, 3);
    }

    #[test]
    fn nested_stacks() {
        let config = StackConfig::new(&hcl_documents! {r#"
        variable "region" {
          type    = string
          default = "eu"
        }

        locals {
          a = 1
          b = local.a + 1
        }

        stack "network" {
          count  = 2
          inputs = { cidr = "10.0.0.0/16" }

          variable "cidr" { type = string }
          output "id" { value = var.cidr }
        }

        output "ids" {
          type  = list(string)
          value = stack.network[*].id
        }
        "#})
        .expect("valid configuration");

        let region = &config.input_variables["region"];
        assert_eq!(region.ty.ty, Type::String);
        assert_eq!(region.default, Some(Value::from("eu")));
        assert_eq!(
            config.local_values.keys().collect::<Vec<_>>(),
            ["a", "b"]
        );

        let network = &config.embedded_stacks["network"];
        assert!(network.count.is_some());
        assert_eq!(
            network.config.addr,
            StackConfigAddr(vec!["network".into()])
        );
        assert!(network.config.output_values.contains_key("id"));

        let config = Arc::new(config);
        let child = config
            .descendant(&StackConfigAddr(vec!["network".into()]))
            .unwrap();
        assert!(child.input_variables.contains_key("cidr"));
        assert!(config
            .descendant(&StackConfigAddr(vec!["missing".into()]))
            .is_none());
    }
}
