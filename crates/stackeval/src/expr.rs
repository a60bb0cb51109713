//! expression evaluation in a stack's scope
//!
//! [hcl::eval] resolves variables from a fixed [hcl::eval::Context], but referenced values are
//! computed on demand. Before evaluating we walk the expression, collect every reference
//! (`var.NAME`, `local.NAME`, `stack.NAME`, `count.index`) and rewrite it to an internal
//! variable:
//!
//! | reference         | rewritten to           |
//! |-------------------|------------------------|
//! | `var.region`      | `ref__var__region`     |
//! | `stack.net[0].id` | `ref__stack__net[0].id`|
//! | `count.index`     | `ref__count__index`    |
//!
//! Each reference is then resolved through the [ExpressionScope] and declared in the context
//! under its internal name. Resolution happens one reference at a time, in the order they
//! appear.
use crate::config::Expr;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::Main;
use crate::phase::EvalPhase;
use crate::promising::Canceled;
use crate::types::Type;
use crate::util::TraversalExt;
use crate::value::Value;
use crate::visit::{self, VisitTraversalsMut};
use hcl::eval::Evaluate;
use hcl::{Expression, Identifier, Traversal};
use indexmap::IndexSet;
use std::fmt;

const SUBSTITUTION_PREFIX: &str = "ref__";

/// Something an expression refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    InputVariable(String),
    LocalValue(String),
    StackCall(String),
    CountIndex,
}

impl Reference {
    /// Interprets the leading attribute path of a traversal
    ///
    /// `None` when the root is not one of the reserved names (e.g. a `for` iterator).
    fn from_path(path: &[Identifier]) -> Option<Result<Self, String>> {
        let (root, rest) = path.split_first()?;
        let name = rest.first().map(|ident| ident.to_string());

        let reference = match (root.as_str(), name) {
            ("var", Some(name)) => Reference::InputVariable(name),
            ("local", Some(name)) => Reference::LocalValue(name),
            ("stack", Some(name)) => Reference::StackCall(name),
            ("count", Some(name)) if name == "index" => Reference::CountIndex,
            ("count", Some(name)) => {
                return Some(Err(format!(
                    "The \"count\" object does not have an attribute named {name:?}. The only supported attribute is count.index."
                )))
            }
            (root @ ("var" | "local" | "stack" | "count"), None) => {
                return Some(Err(format!(
                    "The {root:?} object cannot be accessed directly. Instead, access one of its attributes."
                )))
            }
            _ => return None,
        };
        Some(Ok(reference))
    }

    /// Name of the variable this reference is declared as during evaluation
    pub fn substitution(&self) -> Identifier {
        let name = match self {
            Reference::InputVariable(name) => format!("{SUBSTITUTION_PREFIX}var__{name}"),
            Reference::LocalValue(name) => format!("{SUBSTITUTION_PREFIX}local__{name}"),
            Reference::StackCall(name) => format!("{SUBSTITUTION_PREFIX}stack__{name}"),
            Reference::CountIndex => format!("{SUBSTITUTION_PREFIX}count__index"),
        };
        Identifier::unchecked(name)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::InputVariable(name) => write!(f, "var.{name}"),
            Reference::LocalValue(name) => write!(f, "local.{name}"),
            Reference::StackCall(name) => write!(f, "stack.{name}"),
            Reference::CountIndex => f.write_str("count.index"),
        }
    }
}

/// Rewrites references to their substitution and records them
#[derive(Default)]
pub(crate) struct ReferenceRewriter {
    pub references: IndexSet<Reference>,
    pub invalid: Vec<String>,
}

impl visit::VisitMut<Traversal> for ReferenceRewriter {
    fn visit_mut(&mut self, traversal: &mut Traversal) {
        // was already rewritten
        if let Expression::Variable(var) = &traversal.expr {
            if var.starts_with(SUBSTITUTION_PREFIX) {
                return;
            }
        }

        let path = traversal.get_longest_path();
        match Reference::from_path(&path) {
            None => {}
            Some(Err(reason)) => self.invalid.push(reason),
            Some(Ok(reference)) => {
                traversal.apply_substitution(Expression::Variable(reference.substitution().into()), 2);
                self.references.insert(reference);
            }
        }
    }
}

/// Resolves the references found in an expression
#[async_trait::async_trait]
pub trait ExpressionScope: Send + Sync {
    /// The referenced value, plus diagnostics if the reference itself is invalid here
    ///
    /// Problems of the referenced node are reported by that node, not by the reference.
    async fn resolve_reference(
        &self,
        main: &Main,
        reference: &Reference,
        phase: EvalPhase,
    ) -> Result<(Value, Diagnostics), Canceled>;
}

/// Evaluates `expr` in `scope`
///
/// When anything referenced is not wholly known the result is an unknown of dynamic type. On
/// errors the result is an unknown as well and the diagnostics say why.
#[tracing::instrument(level = "trace", skip_all, fields(expr = %expr.range))]
pub async fn eval_expr(
    main: &Main,
    expr: &Expr,
    phase: EvalPhase,
    scope: &dyn ExpressionScope,
) -> Result<(Value, Diagnostics), Canceled> {
    let mut diags = Diagnostics::new();
    let mut expression = expr.expr.clone();

    let mut rewriter = ReferenceRewriter::default();
    expression.visit_traversals_mut(&mut rewriter);

    for reason in rewriter.invalid {
        diags.push(
            Diagnostic::error("Invalid reference", reason).with_subject(expr.range.clone()),
        );
    }
    if diags.has_errors() {
        return Ok((Value::Unknown(Type::Dynamic), diags));
    }

    let mut declared = vec![];
    let mut wholly_known = true;
    for reference in &rewriter.references {
        let (value, more_diags) = scope.resolve_reference(main, reference, phase).await?;
        diags.extend(more_diags.into_iter().map(|diag| match diag.subject {
            Some(_) => diag,
            None => diag.with_subject(expr.range.clone()),
        }));

        match value.to_hcl() {
            Some(value) => declared.push((reference.substitution(), value)),
            None => wholly_known = false,
        }
    }

    if diags.has_errors() || !wholly_known {
        return Ok((Value::Unknown(Type::Dynamic), diags));
    }

    let mut context = hcl::eval::Context::new();
    for (name, value) in declared {
        context.declare_var(name, value);
    }

    match expression.evaluate(&context) {
        Ok(value) => Ok((value.into(), diags)),
        Err(errors) => {
            diags.push(
                Diagnostic::error("Invalid expression", errors.to_string())
                    .with_subject(expr.range.clone()),
            );
            Ok((Value::Unknown(Type::Dynamic), diags))
        }
    }
}
