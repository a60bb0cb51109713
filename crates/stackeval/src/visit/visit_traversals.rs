use super::VisitMut;
use hcl::{
    template::{Directive, Element},
    Expression, Operation, Template, TemplateExpr, Traversal, TraversalOperator,
};

/// Recursively visit all [hcl::Traversal]s mutably
///
/// A bare variable is visited as a traversal without operators. The visitor may turn it into
/// any expression.
pub trait VisitTraversalsMut {
    fn visit_traversals_mut(&mut self, visitor: &mut dyn VisitMut<Traversal>);
}

impl VisitTraversalsMut for Expression {
    fn visit_traversals_mut(&mut self, visitor: &mut dyn VisitMut<Traversal>) {
        match self {
            Expression::Variable(variable) => {
                let mut traversal = Traversal::new(
                    Expression::Variable(variable.clone()),
                    Vec::<TraversalOperator>::new(),
                );
                visitor.visit_mut(&mut traversal);
                *self = if traversal.operators.is_empty() {
                    traversal.expr
                } else {
                    Expression::Traversal(Box::new(traversal))
                };
            }
            Expression::Traversal(traversal) => {
                visitor.visit_mut(traversal);
                // a variable root was just visited as part of the traversal
                if !matches!(traversal.expr, Expression::Variable(_)) {
                    traversal.expr.visit_traversals_mut(visitor);
                }
                for operator in traversal.operators.iter_mut() {
                    if let TraversalOperator::Index(index) = operator {
                        index.visit_traversals_mut(visitor);
                    }
                }
                if traversal.operators.is_empty() {
                    *self = std::mem::replace(&mut traversal.expr, Expression::Null);
                }
            }
            Expression::Array(array) => {
                for expr in array {
                    expr.visit_traversals_mut(visitor);
                }
            }
            Expression::Object(object) => {
                for value in object.values_mut() {
                    value.visit_traversals_mut(visitor);
                }
            }
            Expression::TemplateExpr(template_expr) => {
                // templates that don't parse are left for the evaluator to report
                if let Ok(mut template) = Template::from_expr(template_expr) {
                    template.visit_traversals_mut(visitor);
                    *template_expr = Box::new(TemplateExpr::QuotedString(template.to_string()));
                }
            }
            Expression::FuncCall(func_call) => {
                for arg in func_call.args.iter_mut() {
                    arg.visit_traversals_mut(visitor);
                }
            }
            Expression::Parenthesis(expr) => {
                expr.visit_traversals_mut(visitor);
            }
            Expression::Conditional(cond) => {
                cond.cond_expr.visit_traversals_mut(visitor);
                cond.true_expr.visit_traversals_mut(visitor);
                cond.false_expr.visit_traversals_mut(visitor);
            }
            Expression::Operation(operation) => match operation.as_mut() {
                Operation::Binary(binop) => {
                    binop.lhs_expr.visit_traversals_mut(visitor);
                    binop.rhs_expr.visit_traversals_mut(visitor);
                }
                Operation::Unary(unop) => {
                    unop.expr.visit_traversals_mut(visitor);
                }
            },
            Expression::ForExpr(forexpr) => {
                forexpr.collection_expr.visit_traversals_mut(visitor);
                forexpr
                    .key_expr
                    .iter_mut()
                    .for_each(|e| e.visit_traversals_mut(visitor));
                forexpr.value_expr.visit_traversals_mut(visitor);
                forexpr
                    .cond_expr
                    .iter_mut()
                    .for_each(|e| e.visit_traversals_mut(visitor));
            }
            _ => {}
        }
    }
}

impl VisitTraversalsMut for Template {
    fn visit_traversals_mut(&mut self, visitor: &mut dyn VisitMut<Traversal>) {
        for element in self.elements_mut() {
            match element {
                Element::Interpolation(interpolation) => {
                    interpolation.expr.visit_traversals_mut(visitor);
                }
                Element::Directive(directive) => match directive {
                    Directive::If(ifdir) => {
                        ifdir.cond_expr.visit_traversals_mut(visitor);
                        ifdir.true_template.visit_traversals_mut(visitor);
                        ifdir
                            .false_template
                            .iter_mut()
                            .for_each(|t| t.visit_traversals_mut(visitor));
                    }
                    Directive::For(fordir) => {
                        fordir.collection_expr.visit_traversals_mut(visitor);
                        fordir.template.visit_traversals_mut(visitor);
                    }
                },
                Element::Literal(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Expression {
        let expr: hcl_edit::expr::Expression = source.parse().expect("valid expression");
        expr.into()
    }

    fn root_names(source: &str) -> Vec<String> {
        let mut names = vec![];
        let mut expr = parse(source);
        expr.visit_traversals_mut(&mut |traversal: &mut Traversal| {
            if let Expression::Variable(var) = &traversal.expr {
                names.push(var.to_string());
            }
        });
        names
    }

    #[test]
    fn finds_traversals_in_nested_expressions() {
        assert_eq!(
            root_names("max(var.a, local.b[var.i]) + (stack.c.x ? 1 : count.index)"),
            ["var", "local", "var", "stack", "count"]
        );
    }

    #[test]
    fn finds_traversals_in_templates() {
        assert_eq!(root_names(r#""${var.a}-%{ if local.b }x%{ endif }""#), ["var", "local"]);
    }

    #[test]
    fn variables_may_become_traversals() {
        let mut expr = parse("a");
        expr.visit_traversals_mut(&mut |traversal: &mut Traversal| {
            traversal.operators.push(TraversalOperator::GetAttr(hcl::Identifier::unchecked("b")));
        });
        assert_eq!(expr, parse("a.b"));
    }
}
