//! Implements the semantics of XPath's binary operators against already-
//! evaluated `XPathValue`s, per the coercion rules of the XPath 1.0 data
//! model plus the XPath 2.0+ value-comparison and set-operator tier.

use super::ast::BinaryOperator;
use super::engine::XPathValue;
use crate::datasource::DataSourceNode;
use crate::error::XPathError;

/// Applies `op` to `left` and `right`, which have already been evaluated
/// against the context the operator appears in.
pub fn evaluate<'a, N>(
    op: BinaryOperator,
    left: XPathValue<N>,
    right: XPathValue<N>,
) -> Result<XPathValue<N>, XPathError>
where
    N: DataSourceNode<'a> + 'a,
{
    match op {
        BinaryOperator::Or => Ok(XPathValue::Boolean(left.to_bool() || right.to_bool())),
        BinaryOperator::And => Ok(XPathValue::Boolean(left.to_bool() && right.to_bool())),

        BinaryOperator::Equals => Ok(XPathValue::Boolean(general_compare(&left, &right, |a, b| a == b, |a, b| a == b, |a, b| a == b))),
        BinaryOperator::NotEquals => Ok(XPathValue::Boolean(general_compare(&left, &right, |a, b| a != b, |a, b| a != b, |a, b| a != b))),
        BinaryOperator::LessThan => Ok(XPathValue::Boolean(general_compare(&left, &right, |a, b| a < b, |a, b| a < b, |a, b| a < b))),
        BinaryOperator::LessThanOrEqual => Ok(XPathValue::Boolean(general_compare(&left, &right, |a, b| a <= b, |a, b| a <= b, |a, b| a <= b))),
        BinaryOperator::GreaterThan => Ok(XPathValue::Boolean(general_compare(&left, &right, |a, b| a > b, |a, b| a > b, |a, b| a > b))),
        BinaryOperator::GreaterThanOrEqual => Ok(XPathValue::Boolean(general_compare(&left, &right, |a, b| a >= b, |a, b| a >= b, |a, b| a >= b))),

        BinaryOperator::Plus => Ok(XPathValue::Number(left.to_number() + right.to_number())),
        BinaryOperator::Minus => Ok(XPathValue::Number(left.to_number() - right.to_number())),
        BinaryOperator::Multiply => Ok(XPathValue::Number(left.to_number() * right.to_number())),
        BinaryOperator::Divide => Ok(XPathValue::Number(left.to_number() / right.to_number())),
        BinaryOperator::Modulo => {
            let (l, r) = (left.to_number(), right.to_number());
            // IEEE 754 remainder with the sign of the dividend, as XPath 1.0's `mod` requires.
            Ok(XPathValue::Number(l - r * (l / r).trunc()))
        }
        BinaryOperator::IntegerDivide => {
            let (l, r) = (left.to_number(), right.to_number());
            if r == 0.0 {
                return Err(XPathError::TypeError("integer division by zero".to_string()));
            }
            Ok(XPathValue::Number((l / r).trunc()))
        }

        BinaryOperator::Union => Ok(XPathValue::NodeSet(set_op(left, right, SetOp::Union)?)),
        BinaryOperator::Intersect => Ok(XPathValue::NodeSet(set_op(left, right, SetOp::Intersect)?)),
        BinaryOperator::Except => Ok(XPathValue::NodeSet(set_op(left, right, SetOp::Except)?)),

        BinaryOperator::To => {
            let start = left.to_number().trunc() as i64;
            let end = right.to_number().trunc() as i64;
            if start > end {
                return Ok(XPathValue::String(String::new()));
            }
            let joined = (start..=end)
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            Ok(XPathValue::String(joined))
        }

        BinaryOperator::ValueEquals => Ok(XPathValue::Boolean(value_compare_numeric_if_applicable(&left, &right, |a, b| a == b))),
        BinaryOperator::ValueNotEquals => Ok(XPathValue::Boolean(!value_compare_numeric_if_applicable(&left, &right, |a, b| a == b))),
        BinaryOperator::ValueLessThan => Ok(XPathValue::Boolean(value_compare_numeric_if_applicable(&left, &right, |a, b| a < b))),
        BinaryOperator::ValueLessThanOrEqual => Ok(XPathValue::Boolean(value_compare_numeric_if_applicable(&left, &right, |a, b| a <= b))),
        BinaryOperator::ValueGreaterThan => Ok(XPathValue::Boolean(value_compare_numeric_if_applicable(&left, &right, |a, b| a > b))),
        BinaryOperator::ValueGreaterThanOrEqual => Ok(XPathValue::Boolean(value_compare_numeric_if_applicable(&left, &right, |a, b| a >= b))),
    }
}

/// XPath 2.0+ `eq`/`ne`/`lt`/... atomize both sides to a single value rather
/// than existentially comparing across a node-set, unlike the general
/// comparison operators below. Since this engine has no separate atomic-value
/// variant, atomization falls back to `to_number`, matching numeric ordering
/// for the common case of comparing singleton numbers/node-sets.
fn value_compare_numeric_if_applicable<'a, N: DataSourceNode<'a>>(
    left: &XPathValue<N>,
    right: &XPathValue<N>,
    cmp: impl Fn(f64, f64) -> bool,
) -> bool {
    cmp(left.to_number(), right.to_number())
}

enum SetOp {
    Union,
    Intersect,
    Except,
}

fn set_op<'a, N: DataSourceNode<'a>>(
    left: XPathValue<N>,
    right: XPathValue<N>,
    op: SetOp,
) -> Result<Vec<N>, XPathError> {
    let left_nodes = match left {
        XPathValue::NodeSet(nodes) => nodes,
        _ => return Err(XPathError::TypeError("set operator requires a node-set operand".to_string())),
    };
    let right_nodes = match right {
        XPathValue::NodeSet(nodes) => nodes,
        _ => return Err(XPathError::TypeError("set operator requires a node-set operand".to_string())),
    };

    let mut result: Vec<N> = match op {
        SetOp::Union => {
            let mut combined = left_nodes;
            combined.extend(right_nodes);
            combined
        }
        SetOp::Intersect => left_nodes
            .into_iter()
            .filter(|n| right_nodes.contains(n))
            .collect(),
        SetOp::Except => left_nodes
            .into_iter()
            .filter(|n| !right_nodes.contains(n))
            .collect(),
    };

    result.sort();
    result.dedup();
    Ok(result)
}

/// General comparisons (`=`, `!=`, `<`, ...) per XPath 1.0 §3.4: if either
/// operand is a node-set, the comparison holds if it holds for *some* pair of
/// (node's string value, other operand); otherwise both sides are coerced to
/// a common type (boolean > number > string, in that preference order) and
/// compared directly.
fn general_compare<'a, N: DataSourceNode<'a>>(
    left: &XPathValue<N>,
    right: &XPathValue<N>,
    str_cmp: impl Fn(&str, &str) -> bool + Copy,
    num_cmp: impl Fn(f64, f64) -> bool + Copy,
    bool_cmp: impl Fn(bool, bool) -> bool + Copy,
) -> bool {
    match (left, right) {
        (XPathValue::NodeSet(nodes), other) | (other, XPathValue::NodeSet(nodes)) if !matches!(other, XPathValue::NodeSet(_)) => {
            nodes.iter().any(|n| {
                let node_str = n.string_value();
                match other {
                    XPathValue::Number(num) => num_cmp(node_str.trim().parse().unwrap_or(f64::NAN), *num),
                    XPathValue::Boolean(b) => bool_cmp(!node_str.is_empty(), *b),
                    XPathValue::String(s) => str_cmp(node_str.as_str(), s.as_str()),
                    XPathValue::NodeSet(_) => unreachable!(),
                }
            })
        }
        (XPathValue::NodeSet(left_nodes), XPathValue::NodeSet(right_nodes)) => {
            left_nodes.iter().any(|l| {
                let l_str = l.string_value();
                right_nodes
                    .iter()
                    .any(|r| str_cmp(l_str.as_str(), r.string_value().as_str()))
            })
        }
        (XPathValue::Boolean(_), _) | (_, XPathValue::Boolean(_)) => bool_cmp(left.to_bool(), right.to_bool()),
        (XPathValue::Number(_), _) | (_, XPathValue::Number(_)) => num_cmp(left.to_number(), right.to_number()),
        _ => str_cmp(&left.to_string(), &right.to_string()),
    }
}
