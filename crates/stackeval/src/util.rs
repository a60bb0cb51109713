use hcl::{Expression, Identifier, Traversal, TraversalOperator};

pub(crate) trait TraversalExt {
    fn apply_substitution(&mut self, expr: Expression, path_len: usize);
    fn get_longest_path(&self) -> Vec<Identifier>;
}

impl TraversalExt for Traversal {
    /// Replaces the root and the first `path_len - 1` attribute accesses with `expr`
    #[tracing::instrument(level = "trace")]
    fn apply_substitution(&mut self, expr: Expression, path_len: usize) {
        let remove = path_len.saturating_sub(1);

        self.expr = expr;

        if remove >= self.operators.len() {
            self.operators.clear();
        } else {
            self.operators.drain(..remove);
        }

        tracing::trace!(traversal=?self, "after substitution");
    }

    /// The root variable followed by all leading attribute accesses
    ///
    /// `var.a.b[0].c` yields `[var, a, b]`
    fn get_longest_path(&self) -> Vec<Identifier> {
        let Expression::Variable(var) = &self.expr else {
            return vec![];
        };

        let mut path = vec![Identifier::unchecked(var.as_str())];
        for operator in &self.operators {
            let TraversalOperator::GetAttr(ident) = operator else {
                break;
            };

            path.push(ident.clone());
        }

        path
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn apply_substitution() {
        let mut traversal = Traversal::builder(hcl::Variable::unchecked("var"))
            .attr("network")
            .attr("cidr")
            .index(0)
            .build();

        traversal.apply_substitution(hcl::Variable::unchecked("ref__var__network").into(), 2);

        let expected = Traversal::builder(hcl::Variable::unchecked("ref__var__network"))
            .attr("cidr")
            .index(0)
            .build();

        assert_eq!(traversal, expected);
    }

    #[test]
    fn longest_path_stops_at_index() {
        let traversal = Traversal::builder(hcl::Variable::unchecked("local"))
            .attr("items")
            .index(1)
            .attr("name")
            .build();

        assert_eq!(
            traversal.get_longest_path(),
            vec![Identifier::unchecked("local"), Identifier::unchecked("items")]
        );
    }
}
