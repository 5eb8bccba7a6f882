//! The evaluation engine for executing a parsed XPath AST against a generic `DataSourceNode`.

use super::ast::{Axis, Expression, LocationPath, NodeTest, NodeTypeTest, Step, UnaryOperator};
use super::functions::{self, FunctionRegistry};
use super::{axes, operators};
use crate::datasource::{DataSourceNode, NodeType};
use crate::error::XPathError;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;

/// Represents the possible result types of an XPath expression evaluation.
#[derive(Debug, Clone)]
pub enum XPathValue<N> {
    NodeSet(Vec<N>),
    String(String),
    Number(f64),
    Boolean(bool),
}

impl<'a, N: DataSourceNode<'a>> XPathValue<N> {
    /// Coerces the XPath value to a boolean as per XPath 1.0 rules.
    pub fn to_bool(&self) -> bool {
        match self {
            XPathValue::NodeSet(nodes) => !nodes.is_empty(),
            XPathValue::String(s) => !s.is_empty(),
            XPathValue::Number(n) => *n != 0.0 && !n.is_nan(),
            XPathValue::Boolean(b) => *b,
        }
    }

    /// Coerces the XPath value to a number as per XPath 1.0 rules.
    pub fn to_number(&self) -> f64 {
        match self {
            XPathValue::Number(n) => *n,
            XPathValue::String(s) => s.trim().parse().unwrap_or(f64::NAN),
            XPathValue::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            XPathValue::NodeSet(nodes) => {
                let s = nodes.first().map(|n| n.string_value()).unwrap_or_default();
                s.trim().parse().unwrap_or(f64::NAN)
            }
        }
    }
}

impl<'a, N: DataSourceNode<'a>> fmt::Display for XPathValue<N> {
    /// Coerces the XPath value to a string as per XPath 1.0 rules.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XPathValue::NodeSet(nodes) => write!(
                f,
                "{}",
                nodes.first().map(|n| n.string_value()).unwrap_or_default()
            ),
            XPathValue::String(s) => write!(f, "{}", s),
            XPathValue::Number(n) => write!(f, "{}", n),
            XPathValue::Boolean(b) => write!(f, "{}", b),
        }
    }
}

/// A container for all state needed during expression evaluation.
/// `'a` is the lifetime of the underlying data source.
/// `'d` is the lifetime of the evaluation context itself.
pub struct EvaluationContext<'a, 'd, N: DataSourceNode<'a>> {
    pub context_node: N,
    pub root_node: N,
    /// The node bound to `current()` (XSLT). Equal to `context_node` for any
    /// "fresh" expression evaluation (a `select` attribute, a top-level
    /// `for-each`/`apply-templates` selection, …) but held fixed while a
    /// predicate iterates `context_node` over candidate nodes — `current()`
    /// never changes during predicate evaluation, only `position()`/`last()` do.
    pub current_node: N,
    pub functions: &'d FunctionRegistry,
    pub context_position: usize, // 1-based index
    pub context_size: usize,
    pub variables: &'d HashMap<String, XPathValue<N>>,
    /// Read-only access to the pre-computed key indexes.
    pub key_indexes: &'d HashMap<String, HashMap<String, Vec<N>>>,
    /// If true, enables strict error checking.
    pub strict: bool,
    _marker: PhantomData<&'a ()>,
}

impl<'a, 'd, N: DataSourceNode<'a>> EvaluationContext<'a, 'd, N> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context_node: N,
        root_node: N,
        functions: &'d FunctionRegistry,
        context_position: usize,
        context_size: usize,
        variables: &'d HashMap<String, XPathValue<N>>,
        key_indexes: &'d HashMap<String, HashMap<String, Vec<N>>>,
        strict: bool,
    ) -> Self {
        Self {
            context_node,
            root_node,
            current_node: context_node,
            functions,
            context_position,
            context_size,
            variables,
            key_indexes,
            strict,
            _marker: PhantomData,
        }
    }

    /// Like `new`, but lets the caller pin `current()` to a node other than
    /// `context_node` — used internally when entering predicate evaluation.
    #[allow(clippy::too_many_arguments)]
    pub fn with_current(
        context_node: N,
        current_node: N,
        root_node: N,
        functions: &'d FunctionRegistry,
        context_position: usize,
        context_size: usize,
        variables: &'d HashMap<String, XPathValue<N>>,
        key_indexes: &'d HashMap<String, HashMap<String, Vec<N>>>,
        strict: bool,
    ) -> Self {
        Self {
            context_node,
            root_node,
            current_node,
            functions,
            context_position,
            context_size,
            variables,
            key_indexes,
            strict,
            _marker: PhantomData,
        }
    }
}

/// Evaluates a compiled expression and returns a concrete `XPathValue`.
pub fn evaluate<'a, N>(
    expr: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match expr {
        Expression::Literal(s) => Ok(XPathValue::String(s.clone())),
        Expression::Number(n) => Ok(XPathValue::Number(*n)),
        Expression::LocationPath(path) => {
            let nodes = evaluate_location_path(path, e_ctx)?;
            Ok(XPathValue::NodeSet(nodes))
        }
        Expression::Variable(name) => {
            if e_ctx.strict && !e_ctx.variables.contains_key(name) {
                return Err(XPathError::TypeError(format!(
                    "Reference to undeclared variable: ${}",
                    name
                )));
            }
            Ok(e_ctx
                .variables
                .get(name)
                .cloned()
                .unwrap_or(XPathValue::String("".to_string())))
        }
        Expression::FunctionCall { name, args } => {
            let mut evaluated_args = Vec::with_capacity(args.len());
            for arg in args {
                evaluated_args.push(evaluate(arg, e_ctx)?);
            }
            Ok(functions::evaluate_function(name, evaluated_args, e_ctx)?)
        }
        Expression::BinaryOp { left, op, right } => {
            let left_val = evaluate(left, e_ctx)?;
            let right_val = evaluate(right, e_ctx)?;
            operators::evaluate(*op, left_val, right_val)
        }
        Expression::UnaryOp { op, expr } => {
            let val = evaluate(expr, e_ctx)?;
            match op {
                UnaryOperator::Minus => Ok(XPathValue::Number(-val.to_number())),
            }
        }
        Expression::If { test, then_expr, else_expr } => {
            if evaluate(test, e_ctx)?.to_bool() {
                evaluate(then_expr, e_ctx)
            } else {
                evaluate(else_expr, e_ctx)
            }
        }
        Expression::Let { bindings, body } => {
            let mut vars = e_ctx.variables.clone();
            for (name, value_expr) in bindings {
                let value = {
                    let scoped = EvaluationContext::with_current(
                    e_ctx.context_node,
                    e_ctx.current_node,
                    e_ctx.root_node,
                        e_ctx.functions,
                        e_ctx.context_position,
                        e_ctx.context_size,
                        &vars,
                        e_ctx.key_indexes,
                        e_ctx.strict,
                    );
                    evaluate(value_expr, &scoped)?
                };
                vars.insert(name.clone(), value);
            }
            let scoped = EvaluationContext::with_current(
                    e_ctx.context_node,
                    e_ctx.current_node,
                    e_ctx.root_node,
                e_ctx.functions,
                e_ctx.context_position,
                e_ctx.context_size,
                &vars,
                e_ctx.key_indexes,
                e_ctx.strict,
            );
            evaluate(body, &scoped)
        }
        Expression::For { bindings, body } => {
            evaluate_for(bindings, body, e_ctx)
        }
        Expression::Quantified { every, bindings, test } => {
            evaluate_quantified(*every, bindings, test, e_ctx)
        }
        Expression::InstanceOf { expr, sequence_type } => {
            let val = evaluate(expr, e_ctx)?;
            Ok(XPathValue::Boolean(value_matches_sequence_type(&val, sequence_type)))
        }
        Expression::CastableAs { expr, sequence_type } => {
            let val = evaluate(expr, e_ctx)?;
            Ok(XPathValue::Boolean(try_cast(&val, sequence_type).is_some()))
        }
        Expression::CastAs { expr, sequence_type } => {
            let val = evaluate(expr, e_ctx)?;
            try_cast(&val, sequence_type).ok_or_else(|| {
                XPathError::CastFailure(
                    format!("{:?}", sequence_type.item_type),
                    val.to_string(),
                )
            })
        }
    }
}

/// Splits a sequence-bearing value into the individual items `for`/`some`/`every`
/// iterate over. Node-sets iterate node by node; this engine has no dedicated
/// sequence-of-atomics variant, so a non-node-set value is treated as a single
/// item (`to`-ranges and other XPath-2.0 sequence constructors fall back to the
/// same approximation as the rest of this optional tier — see DESIGN.md).
fn sequence_items<'a, N: DataSourceNode<'a>>(value: XPathValue<N>) -> Vec<XPathValue<N>> {
    match value {
        XPathValue::NodeSet(nodes) => nodes.into_iter().map(|n| XPathValue::NodeSet(vec![n])).collect(),
        other => vec![other],
    }
}

fn evaluate_for<'a, N>(
    bindings: &[(String, Expression)],
    body: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    fn recurse<'a, N>(
        bindings: &[(String, Expression)],
        body: &Expression,
        vars: &HashMap<String, XPathValue<N>>,
        e_ctx: &EvaluationContext<'a, '_, N>,
        results: &mut Vec<XPathValue<N>>,
    ) -> Result<(), XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        match bindings.split_first() {
            None => {
                let scoped = EvaluationContext::with_current(
                    e_ctx.context_node,
                    e_ctx.current_node,
                    e_ctx.root_node,
                    e_ctx.functions,
                    e_ctx.context_position,
                    e_ctx.context_size,
                    vars,
                    e_ctx.key_indexes,
                    e_ctx.strict,
                );
                results.push(evaluate(body, &scoped)?);
                Ok(())
            }
            Some(((name, seq_expr), rest)) => {
                let scoped = EvaluationContext::with_current(
                    e_ctx.context_node,
                    e_ctx.current_node,
                    e_ctx.root_node,
                    e_ctx.functions,
                    e_ctx.context_position,
                    e_ctx.context_size,
                    vars,
                    e_ctx.key_indexes,
                    e_ctx.strict,
                );
                let seq = evaluate(seq_expr, &scoped)?;
                for item in sequence_items(seq) {
                    let mut next_vars = vars.clone();
                    next_vars.insert(name.clone(), item);
                    recurse(rest, body, &next_vars, e_ctx, results)?;
                }
                Ok(())
            }
        }
    }

    let mut results = Vec::new();
    recurse(bindings, body, e_ctx.variables, e_ctx, &mut results)?;

    // Collapse the collected per-iteration values back into one XPathValue:
    // if every iteration produced nodes, union them (document order handled
    // by the caller's node-set consumer); otherwise join string forms with a
    // single space, the same join convention `string-join` uses.
    if results.iter().all(|v| matches!(v, XPathValue::NodeSet(_))) {
        let mut nodes = Vec::new();
        for r in results {
            if let XPathValue::NodeSet(mut ns) = r {
                nodes.append(&mut ns);
            }
        }
        nodes.sort();
        nodes.dedup();
        Ok(XPathValue::NodeSet(nodes))
    } else {
        let joined = results
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(XPathValue::String(joined))
    }
}

fn evaluate_quantified<'a, N>(
    every: bool,
    bindings: &[(String, Expression)],
    test: &Expression,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    fn recurse<'a, N>(
        every: bool,
        bindings: &[(String, Expression)],
        test: &Expression,
        vars: &HashMap<String, XPathValue<N>>,
        e_ctx: &EvaluationContext<'a, '_, N>,
    ) -> Result<bool, XPathError>
    where
        N: DataSourceNode<'a> + 'a,
    {
        match bindings.split_first() {
            None => {
                let scoped = EvaluationContext::with_current(
                    e_ctx.context_node,
                    e_ctx.current_node,
                    e_ctx.root_node,
                    e_ctx.functions,
                    e_ctx.context_position,
                    e_ctx.context_size,
                    vars,
                    e_ctx.key_indexes,
                    e_ctx.strict,
                );
                Ok(evaluate(test, &scoped)?.to_bool())
            }
            Some(((name, seq_expr), rest)) => {
                let scoped = EvaluationContext::with_current(
                    e_ctx.context_node,
                    e_ctx.current_node,
                    e_ctx.root_node,
                    e_ctx.functions,
                    e_ctx.context_position,
                    e_ctx.context_size,
                    vars,
                    e_ctx.key_indexes,
                    e_ctx.strict,
                );
                let seq = evaluate(seq_expr, &scoped)?;
                for item in sequence_items(seq) {
                    let mut next_vars = vars.clone();
                    next_vars.insert(name.clone(), item);
                    let satisfied = recurse(every, rest, test, &next_vars, e_ctx)?;
                    if every && !satisfied {
                        return Ok(false);
                    }
                    if !every && satisfied {
                        return Ok(true);
                    }
                }
                Ok(every)
            }
        }
    }

    let result = recurse(every, bindings, test, e_ctx.variables, e_ctx)?;
    Ok(XPathValue::Boolean(result))
}

fn value_matches_sequence_type<'a, N: DataSourceNode<'a>>(
    value: &XPathValue<N>,
    sequence_type: &crate::ast::SequenceType,
) -> bool {
    use crate::ast::ItemType;
    match &sequence_type.item_type {
        ItemType::Empty => matches!(value, XPathValue::NodeSet(nodes) if nodes.is_empty()),
        ItemType::Item => true,
        ItemType::Node | ItemType::Element | ItemType::Attribute | ItemType::Text
        | ItemType::Comment | ItemType::ProcessingInstruction => {
            matches!(value, XPathValue::NodeSet(_))
        }
        ItemType::AtomicType(name) => match name.as_str() {
            "xs:string" | "string" => matches!(value, XPathValue::String(_)),
            "xs:double" | "xs:decimal" | "xs:integer" | "xs:float" | "number" => {
                matches!(value, XPathValue::Number(_)) || value.to_number().is_finite()
            }
            "xs:boolean" | "boolean" => matches!(value, XPathValue::Boolean(_)),
            _ => true,
        },
    }
}

fn try_cast<'a, N: DataSourceNode<'a>>(
    value: &XPathValue<N>,
    sequence_type: &crate::ast::SequenceType,
) -> Option<XPathValue<N>> {
    use crate::ast::ItemType;
    match &sequence_type.item_type {
        ItemType::AtomicType(name) => match name.as_str() {
            "xs:string" | "string" => Some(XPathValue::String(value.to_string())),
            "xs:double" | "xs:decimal" | "xs:integer" | "xs:float" | "number" => {
                let n = value.to_number();
                if n.is_nan() && !matches!(value, XPathValue::Number(_)) {
                    None
                } else {
                    Some(XPathValue::Number(n))
                }
            }
            "xs:boolean" | "boolean" => Some(XPathValue::Boolean(value.to_bool())),
            _ => None,
        },
        _ => None,
    }
}

fn evaluate_location_path<'a, N>(
    path: &LocationPath,
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    // If the path has no steps and is relative, it refers to the context node itself.
    if path.steps.is_empty() && !path.is_absolute && path.start_point.is_none() {
        return Ok(vec![e_ctx.context_node]);
    }

    let initial_context = if let Some(start_expr) = &path.start_point {
        // The path starts from the result of another expression.
        match evaluate(start_expr, e_ctx)? {
            XPathValue::NodeSet(nodes) => nodes,
            // If the start expression doesn't evaluate to a node-set, the path is empty.
            _ => return Ok(vec![]),
        }
    } else if path.is_absolute {
        // Standard absolute path from the root.
        vec![e_ctx.root_node]
    } else {
        // Standard relative path from the current context node.
        vec![e_ctx.context_node]
    };

    let mut current_nodes = initial_context;
    for step in &path.steps {
        current_nodes = evaluate_step(step, &current_nodes, e_ctx)?;
    }
    Ok(current_nodes)
}

/// Evaluates a single step in a location path by chaining axis collection, node testing, and predicate application.
fn evaluate_step<'a, N>(
    step: &Step,
    context_nodes: &[N],
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    // Handle special abbreviated step '.' which means the context node set itself.
    if step.axis == Axis::SelfAxis && step.node_test == NodeTest::Name(".".to_string()) {
        return Ok(context_nodes.to_vec());
    }

    let axis_nodes = collect_axis_nodes(step.axis, context_nodes);
    let tested_nodes = filter_by_node_test(&axis_nodes, &step.node_test, step.axis);
    // Predicates must see the axis-natural order (reversed for reverse axes,
    // per spec.md §4.4) so position()/last() count the right way; the
    // step's own result, however, is a node-set and must come back in
    // document order regardless of which axis produced it.
    let mut result = apply_predicates(&tested_nodes, &step.predicates, e_ctx)?;
    result.sort();
    Ok(result)
}

/// Stage 1: Collects all unique nodes from the context set along a given axis.
fn collect_axis_nodes<'a, N>(axis: Axis, context_nodes: &[N]) -> Vec<N>
where
    N: DataSourceNode<'a> + 'a,
{
    let mut result_nodes = Vec::new();
    let mut seen = HashSet::new();

    for &node in context_nodes {
        match axis {
            Axis::Child => axes::collect_child_nodes(node, &mut seen, &mut result_nodes),
            Axis::Attribute => axes::collect_attribute_nodes(node, &mut seen, &mut result_nodes),
            Axis::Descendant => axes::collect_descendant_nodes(node, &mut seen, &mut result_nodes),
            Axis::DescendantOrSelf => {
                axes::collect_descendant_or_self_nodes(node, &mut seen, &mut result_nodes)
            }
            Axis::Parent => axes::collect_parent_nodes(node, &mut seen, &mut result_nodes),
            Axis::Ancestor => axes::collect_ancestor_nodes(node, &mut seen, &mut result_nodes),
            Axis::SelfAxis => axes::collect_self_nodes(node, &mut seen, &mut result_nodes),
            Axis::FollowingSibling => {
                axes::collect_following_sibling_nodes(node, &mut seen, &mut result_nodes)
            }
            Axis::PrecedingSibling => {
                axes::collect_preceding_sibling_nodes(node, &mut seen, &mut result_nodes)
            }
            Axis::Following => axes::collect_following_nodes(node, &mut seen, &mut result_nodes),
            Axis::Preceding => axes::collect_preceding_nodes(node, &mut seen, &mut result_nodes),
            Axis::AncestorOrSelf => {
                axes::collect_ancestor_or_self_nodes(node, &mut seen, &mut result_nodes)
            }
            Axis::Namespace => axes::collect_namespace_nodes(node, &mut seen, &mut result_nodes),
        }
    }
    result_nodes
}

/// Stage 2: Filters a set of nodes based on a `NodeTest`.
fn filter_by_node_test<'a, N>(nodes: &[N], test: &NodeTest, axis: Axis) -> Vec<N>
where
    N: DataSourceNode<'a> + 'a,
{
    nodes
        .iter()
        .filter(|&node| match test {
            NodeTest::Wildcard => match axis {
                Axis::Attribute => node.node_type() == NodeType::Attribute,
                Axis::Namespace => node.node_type() == NodeType::Namespace,
                _ => node.node_type() == NodeType::Element,
            },
            NodeTest::NamespaceWildcard(prefix) => {
                node.node_type() == NodeType::Element
                    && node.name().is_some_and(|q| q.prefix == Some(prefix.as_str()))
            }
            NodeTest::Name(name_to_test) => node.name().is_some_and(|q_name| {
                // Compare against the node's own lexical qualified name (prefix
                // as written, not a resolved namespace URI) so an unprefixed
                // test only matches no-namespace nodes and a prefixed test
                // only matches nodes written with that same prefix.
                match q_name.prefix {
                    Some(prefix) if !prefix.is_empty() => {
                        let mut qualified = String::with_capacity(prefix.len() + 1 + q_name.local_part.len());
                        qualified.push_str(prefix);
                        qualified.push(':');
                        qualified.push_str(q_name.local_part);
                        &qualified == name_to_test
                    }
                    _ => q_name.local_part == name_to_test,
                }
            }),
            NodeTest::NodeType(ntt) => match ntt {
                NodeTypeTest::Text => node.node_type() == NodeType::Text,
                NodeTypeTest::Comment => node.node_type() == NodeType::Comment,
                NodeTypeTest::ProcessingInstruction => {
                    node.node_type() == NodeType::ProcessingInstruction
                }
                NodeTypeTest::Node => true,
            },
        })
        .copied()
        .collect()
}

/// Stage 3: Filters a set of nodes by applying a series of predicates.
fn apply_predicates<'a, N>(
    nodes: &[N],
    predicates: &[Expression],
    e_ctx: &EvaluationContext<'a, '_, N>,
) -> Result<Vec<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    let mut final_nodes = nodes.to_vec();
    for predicate in predicates {
        let mut predicate_results = Vec::new();
        let context_size = final_nodes.len();
        for (i, node) in final_nodes.iter().enumerate() {
            // `current()` is frozen to whatever it was before this predicate
            // started iterating — only `context_node`/position/size vary per candidate.
            let predicate_e_ctx = EvaluationContext::with_current(
                *node,
                e_ctx.current_node,
                e_ctx.root_node,
                e_ctx.functions,
                i + 1,
                context_size,
                e_ctx.variables,
                e_ctx.key_indexes, // Pass through the key indexes
                e_ctx.strict,      // Propagate strict mode
            );
            let result = evaluate(predicate, &predicate_e_ctx)?;
            let keep = match result {
                XPathValue::Number(n) => (n as usize) == (i + 1),
                _ => result.to_bool(),
            };
            if keep {
                predicate_results.push(*node);
            }
        }
        final_nodes = predicate_results;
    }
    Ok(final_nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::tests::{MockNode, create_test_tree};
    use std::collections::HashMap;

    fn create_test_eval_context<'a, 'd>(
        tree: &'a crate::datasource::tests::MockTree<'a>,
        functions: &'d FunctionRegistry,
        vars: &'d HashMap<String, XPathValue<MockNode<'a>>>,
        keys: &'d HashMap<String, HashMap<String, Vec<MockNode<'a>>>>,
    ) -> EvaluationContext<'a, 'd, MockNode<'a>> {
        let root = MockNode { id: 0, tree };
        EvaluationContext::new(root, root, functions, 1, 1, vars, keys, false)
    }

    #[test]
    fn test_pipeline_functions_individually() {
        let tree = create_test_tree();
        let root = MockNode { id: 0, tree: &tree };
        let para = MockNode { id: 1, tree: &tree };
        let attr = MockNode { id: 2, tree: &tree };
        let text = MockNode { id: 4, tree: &tree };

        // Test collect_axis_nodes
        let children = collect_axis_nodes(Axis::Child, &[root]);
        assert_eq!(children.len(), 5);
        let attributes = collect_axis_nodes(Axis::Attribute, &[para]);
        assert_eq!(attributes.len(), 2);
        let ancestors = collect_axis_nodes(Axis::Ancestor, &[text]);
        assert_eq!(ancestors, vec![para, root]);

        // Test filter_by_node_test
        let all_nodes = vec![root, para, attr, text];
        let elements = filter_by_node_test(&all_nodes, &NodeTest::Wildcard, Axis::Child);
        assert_eq!(elements, vec![para]);
        let para_nodes =
            filter_by_node_test(&all_nodes, &NodeTest::Name("para".to_string()), Axis::Child);
        assert_eq!(para_nodes, vec![para]);
        let text_nodes = filter_by_node_test(
            &all_nodes,
            &NodeTest::NodeType(NodeTypeTest::Text),
            Axis::Child,
        );
        assert_eq!(text_nodes, vec![text]);

        // Test apply_predicates (positional)
        let funcs = FunctionRegistry::default();
        let vars = HashMap::new();
        let keys = HashMap::new();
        let e_ctx = create_test_eval_context(&tree, &funcs, &vars, &keys);
        // FIX: Parse only the expression within the predicate.
        let predicate_expr = crate::parser::parse_expression("position()=2").unwrap();
        let predicates = vec![predicate_expr];
        let nodes_to_filter = vec![root, para, text];
        let filtered = apply_predicates(&nodes_to_filter, &predicates, &e_ctx).unwrap();
        assert_eq!(filtered, vec![para]);
    }

    #[test]
    fn test_predicate_by_attribute() {
        let tree = create_test_tree();
        let funcs = FunctionRegistry::default();
        let vars = HashMap::new();
        let keys = HashMap::new();
        let e_ctx = create_test_eval_context(&tree, &funcs, &vars, &keys);

        let expr = crate::parser::parse_expression("child::para[@id='p1']").unwrap();
        let result = evaluate(&expr, &e_ctx).unwrap();

        if let XPathValue::NodeSet(nodes) = result {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, 1);
        } else {
            panic!("Expected a NodeSet");
        }
    }

    #[test]
    fn test_predicate_by_position() {
        let tree = create_test_tree();
        let funcs = FunctionRegistry::default();
        let vars = HashMap::new();
        let keys = HashMap::new();
        let e_ctx = create_test_eval_context(&tree, &funcs, &vars, &keys);

        let expr = crate::parser::parse_expression("child::para[1]").unwrap();
        let result = evaluate(&expr, &e_ctx).unwrap();

        if let XPathValue::NodeSet(nodes) = result {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, 1);
        } else {
            panic!("Expected a NodeSet");
        }
    }

    #[test]
    fn test_predicate_by_position_function() {
        let tree = create_test_tree();
        let funcs = FunctionRegistry::default();
        let vars = HashMap::new();
        let keys = HashMap::new();
        let e_ctx = create_test_eval_context(&tree, &funcs, &vars, &keys);

        let expr = crate::parser::parse_expression("child::para[position()=1]").unwrap();
        let result = evaluate(&expr, &e_ctx).unwrap();

        if let XPathValue::NodeSet(nodes) = result {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, 1);
        } else {
            panic!("Expected a NodeSet");
        }
    }

    #[test]
    fn test_variable_evaluation() {
        let tree = create_test_tree();
        let funcs = FunctionRegistry::default();
        let keys = HashMap::new();

        let mut vars = HashMap::new();
        vars.insert(
            "myVar".to_string(),
            XPathValue::String("test-value".to_string()),
        );

        let e_ctx = create_test_eval_context(&tree, &funcs, &vars, &keys);

        let expr = crate::parser::parse_expression("$myVar").unwrap();
        let result = evaluate(&expr, &e_ctx).unwrap();
        assert_eq!(result.to_string(), "test-value");
    }

    #[test]
    fn test_path_from_variable_node_set() {
        let tree = create_test_tree();
        let funcs = FunctionRegistry::default();
        let keys = HashMap::new();
        let mut vars = HashMap::new();

        // Put the <para> node (id 1) into a variable
        let para_node = MockNode { id: 1, tree: &tree };
        vars.insert(
            "para_node".to_string(),
            XPathValue::NodeSet(vec![para_node]),
        );

        let e_ctx = create_test_eval_context(&tree, &funcs, &vars, &keys);

        // Select the text() node from the node in the variable
        let expr = crate::parser::parse_expression("$para_node/text()").unwrap();
        let result = evaluate(&expr, &e_ctx).unwrap();

        if let XPathValue::NodeSet(nodes) = result {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0].id, 4); // id of the text node "Hello"
            assert_eq!(nodes[0].string_value(), "Hello");
        } else {
            panic!("Expected a NodeSet");
        }
    }
}
