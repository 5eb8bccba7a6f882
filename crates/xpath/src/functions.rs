//! Defines the registry and built-in implementations for XPath 1.0 functions.

use super::engine::{EvaluationContext, XPathValue};
use crate::datasource::{DataSourceNode, NodeType};
use crate::error::XPathError;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;

// A simple registry that just holds the names of built-in functions.
pub struct FunctionRegistry {
    functions: HashMap<&'static str, ()>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }
    pub fn register(&mut self, name: &'static str) {
        self.functions.insert(name, ());
    }
    pub fn get(&self, name: &str) -> Option<()> {
        self.functions.get(name).copied()
    }
}

/// Dispatches a function call to the correct implementation.
pub fn evaluate_function<'a, 'd, N: DataSourceNode<'a>>(
    name: &str,
    args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    match name {
        // Core & Node-Set
        "string" => func_string(args, e_ctx),
        "count" => func_count(args),
        "id" => func_id(args, e_ctx),
        "position" => func_position(args, e_ctx),
        "last" => func_last(args, e_ctx),
        "local-name" => func_local_name(args, e_ctx),
        "name" => func_name(args, e_ctx),
        "key" => func_key(args, e_ctx),
        "generate-id" => func_generate_id(args, e_ctx),
        "current" => func_current(args, e_ctx),
        "namespace-uri" => func_namespace_uri(args, e_ctx),
        "document" => func_document(args, e_ctx),
        "unparsed-entity-uri" => func_unparsed_entity_uri(args),
        "system-property" => func_system_property(args),
        "function-available" => func_function_available(args, e_ctx),
        "element-available" => func_element_available(args),
        "format-number" => func_format_number(args),

        // String
        "concat" => func_concat(args),
        "starts-with" => func_starts_with(args),
        "contains" => func_contains(args),
        "substring-before" => func_substring_before(args),
        "substring-after" => func_substring_after(args),
        "substring" => func_substring(args),
        "string-length" => func_string_length(args, e_ctx),
        "normalize-space" => func_normalize_space(args, e_ctx),
        "translate" => func_translate(args),

        // Boolean
        "not" => func_not(args),
        "true" => func_true(args),
        "false" => func_false(args),
        "lang" => func_lang(args, e_ctx),

        // Number
        "sum" => func_sum(args),
        "floor" => func_floor(args),
        "ceiling" => func_ceiling(args),
        "round" => func_round(args),

        // XPath 2.0+ string tier
        "string-join" => func_string_join(args),
        "upper-case" => func_upper_case(args),
        "lower-case" => func_lower_case(args),
        "ends-with" => func_ends_with(args),
        "matches" => func_matches(args),
        "replace" => func_replace(args),
        "tokenize" => func_tokenize(args),
        "compare" => func_compare(args),
        "codepoints-to-string" => func_codepoints_to_string(args),
        "string-to-codepoints" => func_string_to_codepoints(args),
        "encode-for-uri" => func_encode_for_uri(args),

        // XPath 2.0+ sequence/numeric tier
        "abs" => func_abs(args),
        "min" => func_min(args),
        "max" => func_max(args),
        "avg" => func_avg(args),
        "exists" => func_exists(args),
        "empty" => func_empty(args),
        "distinct-values" => func_distinct_values(args),
        "index-of" => func_index_of(args),
        "subsequence" => func_subsequence(args),
        "reverse" => func_reverse(args),

        // "node" is not a real function, but registering it prevents "unknown function" errors
        // when the parser mistakes the node() test for a function call.
        "node" | "comment" | "processing-instruction" => Err(XPathError::FunctionError {
            function: name.to_string(),
            message: "This is a node-test, not a function.".to_string(),
        }),
        _ => Err(XPathError::FunctionError {
            function: name.to_string(),
            message: "Unknown XPath function".to_string(),
        }),
    }
}

// --- Context-dependent functions ---

/// `current()`. Returns the node that was the context node when evaluation
/// of the current top-level expression began, frozen across any predicates
/// nested inside it — distinct from `context_node`, which predicates rebind
/// to each candidate as they iterate.
fn func_current<'a, 'd, N: DataSourceNode<'a>>(
    args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if !args.is_empty() {
        return Err(XPathError::FunctionError {
            function: "current()".to_string(),
            message: "Expected 0 arguments".to_string(),
        });
    }
    Ok(XPathValue::NodeSet(vec![e_ctx.current_node]))
}

fn func_namespace_uri<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() > 1 {
        return Err(XPathError::FunctionError {
            function: "namespace-uri()".to_string(),
            message: "Expected 0 or 1 arguments".to_string(),
        });
    }
    let node = if args.is_empty() {
        Some(e_ctx.context_node)
    } else {
        match args.remove(0) {
            XPathValue::NodeSet(nodes) => nodes.first().copied(),
            v => {
                return Err(XPathError::TypeError(format!(
                    "namespace-uri() argument must be a node-set, got {:?}",
                    v
                )));
            }
        }
    };
    // This engine's `DataSourceNode::name()` exposes a prefix but not a
    // resolved namespace URI directly; the URI lives on the node's
    // `namespaces()` axis. Look up the binding for the node's own prefix.
    let uri = node.and_then(|n| {
        let prefix = n.name()?.prefix;
        n.namespaces()
            .find(|ns| ns.name().map(|q| q.local_part) == prefix.or(Some("")))
            .map(|ns| ns.string_value())
    });
    Ok(XPathValue::String(uri.unwrap_or_default()))
}

/// `document(uri, node-set?)`. URI resolution is out of scope for this crate
/// (see the crate-level Non-goals); only the no-argument / empty-string form,
/// which refers back to the stylesheet's own source document, is supported.
/// Any other URI is a dynamic error.
fn func_document<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.is_empty() || args.len() > 2 {
        return Err(XPathError::FunctionError {
            function: "document()".to_string(),
            message: "Expected 1 or 2 arguments".to_string(),
        });
    }
    let uri = args.remove(0).to_string();
    if uri.is_empty() {
        return Ok(XPathValue::NodeSet(vec![e_ctx.root_node]));
    }
    Err(XPathError::FunctionError {
        function: "document()".to_string(),
        message: format!(
            "external URI resolution is not supported by this engine (requested '{}')",
            uri
        ),
    })
}

fn func_unparsed_entity_uri<'a, N: DataSourceNode<'a>>(
    args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "unparsed-entity-uri()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    // DTD entity declarations are out of scope for this engine's node tree.
    Ok(XPathValue::String(String::new()))
}

fn func_system_property<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "system-property()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let name = args.remove(0).to_string();
    let value = match name.as_str() {
        "xsl:version" => "1.0",
        "xsl:vendor" => env!("CARGO_PKG_NAME"),
        "xsl:vendor-url" => "",
        _ => "",
    };
    Ok(XPathValue::String(value.to_string()))
}

fn func_function_available<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "function-available()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let name = args.remove(0).to_string();
    let local = name.rsplit(':').next().unwrap_or(&name);
    Ok(XPathValue::Boolean(e_ctx.functions.get(local).is_some()))
}

fn func_element_available<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "element-available()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let name = args.remove(0).to_string();
    let local = name.rsplit(':').next().unwrap_or(&name);
    const INSTRUCTIONS: &[&str] = &[
        "apply-templates", "call-template", "for-each", "if", "choose", "when", "otherwise",
        "variable", "param", "with-param", "copy", "copy-of", "element", "attribute", "text",
        "value-of", "number", "sort", "message", "comment", "processing-instruction",
        "namespace", "apply-imports", "next-match", "fallback", "attribute-set",
    ];
    Ok(XPathValue::Boolean(INSTRUCTIONS.contains(&local)))
}

/// `format-number(number, picture, decimal-format-name?)`. Implements the
/// JDK/XSLT 1.0 picture-string grammar against a fixed set of format
/// symbols (`#`, `0`, `.`, `,`, `%`, `-`); a named `xsl:decimal-format`
/// registry is not threaded through the XPath evaluator (it lives on the
/// compiled stylesheet, a layer above this crate), so the third argument is
/// accepted but not consulted here — callers that need a non-default
/// decimal-format apply it at the XSLT runtime layer instead.
fn func_format_number<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !(2..=3).contains(&args.len()) {
        return Err(XPathError::FunctionError {
            function: "format-number()".to_string(),
            message: "Expected 2 or 3 arguments".to_string(),
        });
    }
    if args.len() == 3 {
        args.remove(2);
    }
    let picture = args.remove(1).to_string();
    let number = args.remove(0).to_number();
    Ok(XPathValue::String(format_number_with_picture(
        number, &picture,
    )))
}

/// Formats `number` against an XSLT 1.0 picture string using `.` as the
/// decimal separator and `,` as the grouping separator (the JDK
/// `DecimalFormat` defaults `xsl:decimal-format` falls back to).
pub fn format_number_with_picture(number: f64, picture: &str) -> String {
    if number.is_nan() {
        return "NaN".to_string();
    }
    let negative = number.is_sign_negative() && number != 0.0;
    let sub_picture = picture.split(';').next().unwrap_or(picture);
    let (int_pattern, frac_pattern) = match sub_picture.split_once('.') {
        Some((i, f)) => (i, f),
        None => (sub_picture, ""),
    };
    let min_int_digits = int_pattern.chars().filter(|c| *c == '0').count();
    let min_frac_digits = frac_pattern.chars().filter(|c| *c == '0').count();
    let max_frac_digits = frac_pattern.chars().filter(|c| *c == '0' || *c == '#').count();
    let grouping = int_pattern.contains(',');

    let scaled = number.abs();
    let rounded = {
        let factor = 10f64.powi(max_frac_digits as i32);
        (scaled * factor).round() / factor
    };
    let int_part = rounded.trunc() as i64;
    let mut frac_digits = format!("{:.*}", max_frac_digits, rounded.fract());
    // format!("{:.*}", n, x) on a fractional part yields "0.xxxxx"; strip the leading "0.".
    if let Some(stripped) = frac_digits.strip_prefix("0.") {
        frac_digits = stripped.to_string();
    } else {
        frac_digits.clear();
    }
    while frac_digits.len() > min_frac_digits
        && frac_digits.ends_with('0')
        && frac_digits.len() > 0
    {
        if frac_digits.len() <= min_frac_digits {
            break;
        }
        frac_digits.pop();
    }

    let mut int_str = int_part.to_string();
    while int_str.len() < min_int_digits {
        int_str.insert(0, '0');
    }
    if grouping {
        let mut grouped = String::new();
        for (i, c) in int_str.chars().rev().enumerate() {
            if i > 0 && i % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(c);
        }
        int_str = grouped.chars().rev().collect();
    }

    let mut result = int_str;
    if !frac_digits.is_empty() {
        result.push('.');
        result.push_str(&frac_digits);
    }
    if negative {
        result.insert(0, '-');
    }
    result
}

// --- XPath 2.0+ string functions ---

fn func_string_join<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 2 {
        return Err(XPathError::FunctionError {
            function: "string-join()".to_string(),
            message: "Expected 2 arguments".to_string(),
        });
    }
    let separator = args.remove(1).to_string();
    let joined = match args.remove(0) {
        XPathValue::NodeSet(nodes) => nodes
            .iter()
            .map(|n| n.string_value())
            .collect::<Vec<_>>()
            .join(&separator),
        other => other.to_string(),
    };
    Ok(XPathValue::String(joined))
}

fn func_upper_case<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "upper-case()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    Ok(XPathValue::String(args.remove(0).to_string().to_uppercase()))
}

fn func_lower_case<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "lower-case()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    Ok(XPathValue::String(args.remove(0).to_string().to_lowercase()))
}

fn func_ends_with<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 2 {
        return Err(XPathError::FunctionError {
            function: "ends-with()".to_string(),
            message: "Expected 2 arguments".to_string(),
        });
    }
    let s2 = args.remove(1).to_string();
    let s1 = args.remove(0).to_string();
    Ok(XPathValue::Boolean(s1.ends_with(&s2)))
}

fn compile_regex(pattern: &str, flags: &str) -> Result<regex::Regex, XPathError> {
    let mut builder = regex::RegexBuilder::new(pattern);
    builder.case_insensitive(flags.contains('i'));
    builder.dot_matches_new_line(flags.contains('s'));
    builder.multi_line(flags.contains('m'));
    builder
        .build()
        .map_err(|e| XPathError::InvalidRegex(pattern.to_string(), e.to_string()))
}

fn func_matches<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !(2..=3).contains(&args.len()) {
        return Err(XPathError::FunctionError {
            function: "matches()".to_string(),
            message: "Expected 2 or 3 arguments".to_string(),
        });
    }
    let flags = if args.len() == 3 {
        args.remove(2).to_string()
    } else {
        String::new()
    };
    let pattern = args.remove(1).to_string();
    let input = args.remove(0).to_string();
    let re = compile_regex(&pattern, &flags)?;
    Ok(XPathValue::Boolean(re.is_match(&input)))
}

fn func_replace<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !(3..=4).contains(&args.len()) {
        return Err(XPathError::FunctionError {
            function: "replace()".to_string(),
            message: "Expected 3 or 4 arguments".to_string(),
        });
    }
    let flags = if args.len() == 4 {
        args.remove(3).to_string()
    } else {
        String::new()
    };
    let replacement = args.remove(2).to_string();
    let pattern = args.remove(1).to_string();
    let input = args.remove(0).to_string();
    let re = compile_regex(&pattern, &flags)?;
    // XPath uses `$1`..`$9` backreferences, which happens to match `regex`'s own syntax.
    Ok(XPathValue::String(
        re.replace_all(&input, replacement.as_str()).into_owned(),
    ))
}

fn func_tokenize<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !(2..=3).contains(&args.len()) {
        return Err(XPathError::FunctionError {
            function: "tokenize()".to_string(),
            message: "Expected 2 or 3 arguments".to_string(),
        });
    }
    let flags = if args.len() == 3 {
        args.remove(2).to_string()
    } else {
        String::new()
    };
    let pattern = args.remove(1).to_string();
    let input = args.remove(0).to_string();
    let re = compile_regex(&pattern, &flags)?;
    // This engine's `XPathValue` has no dedicated sequence-of-strings
    // variant; tokenize results are joined with a newline, a pragmatic
    // stand-in that callers needing true sequence semantics should route
    // through `string-join`/`for` instead (see the XPath 2.0+ caveats in
    // the crate's design notes).
    let tokens: Vec<&str> = re.split(&input).collect();
    Ok(XPathValue::String(tokens.join("\n")))
}

fn func_compare<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !(2..=3).contains(&args.len()) {
        return Err(XPathError::FunctionError {
            function: "compare()".to_string(),
            message: "Expected 2 or 3 arguments".to_string(),
        });
    }
    if args.len() == 3 {
        args.remove(2);
    }
    let s2 = args.remove(1).to_string();
    let s1 = args.remove(0).to_string();
    let ordering = s1.cmp(&s2) as i32;
    Ok(XPathValue::Number(ordering as f64))
}

fn func_codepoints_to_string<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "codepoints-to-string()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let s = args.remove(0).to_string();
    let result: String = s
        .split_whitespace()
        .filter_map(|tok| tok.parse::<u32>().ok().and_then(char::from_u32))
        .collect();
    Ok(XPathValue::String(result))
}

fn func_string_to_codepoints<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "string-to-codepoints()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let s = args.remove(0).to_string();
    let codepoints = s
        .chars()
        .map(|c| (c as u32).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    Ok(XPathValue::String(codepoints))
}

fn func_encode_for_uri<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "encode-for-uri()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let s = args.remove(0).to_string();
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    Ok(XPathValue::String(out))
}

// --- XPath 2.0+ numeric/sequence functions ---

fn func_abs<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "abs()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    Ok(XPathValue::Number(args.remove(0).to_number().abs()))
}

fn numeric_items<'a, N: DataSourceNode<'a>>(value: XPathValue<N>) -> Vec<f64> {
    match value {
        XPathValue::NodeSet(nodes) => nodes
            .iter()
            .map(|n| n.string_value().trim().parse().unwrap_or(f64::NAN))
            .collect(),
        other => vec![other.to_number()],
    }
}

fn func_min<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "min()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let values = numeric_items(args.remove(0));
    Ok(XPathValue::Number(
        values.into_iter().fold(f64::INFINITY, f64::min),
    ))
}

fn func_max<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "max()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let values = numeric_items(args.remove(0));
    Ok(XPathValue::Number(
        values.into_iter().fold(f64::NEG_INFINITY, f64::max),
    ))
}

fn func_avg<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "avg()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let values = numeric_items(args.remove(0));
    if values.is_empty() {
        return Ok(XPathValue::Number(f64::NAN));
    }
    let sum: f64 = values.iter().sum();
    Ok(XPathValue::Number(sum / values.len() as f64))
}

fn func_exists<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "exists()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let non_empty = match args.remove(0) {
        XPathValue::NodeSet(nodes) => !nodes.is_empty(),
        XPathValue::String(s) => !s.is_empty(),
        _ => true,
    };
    Ok(XPathValue::Boolean(non_empty))
}

fn func_empty<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "empty()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let empty = match args.remove(0) {
        XPathValue::NodeSet(nodes) => nodes.is_empty(),
        XPathValue::String(s) => s.is_empty(),
        _ => false,
    };
    Ok(XPathValue::Boolean(empty))
}

fn func_distinct_values<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "distinct-values()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    match args.remove(0) {
        XPathValue::NodeSet(nodes) => {
            let mut seen = HashSet::new();
            let mut result = Vec::new();
            for node in nodes {
                if seen.insert(node.string_value()) {
                    result.push(node);
                }
            }
            Ok(XPathValue::NodeSet(result))
        }
        other => Ok(other),
    }
}

fn func_index_of<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 2 {
        return Err(XPathError::FunctionError {
            function: "index-of()".to_string(),
            message: "Expected 2 arguments".to_string(),
        });
    }
    let needle = args.remove(1).to_string();
    match args.remove(0) {
        XPathValue::NodeSet(nodes) => {
            let positions: Vec<String> = nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.string_value() == needle)
                .map(|(i, _)| (i + 1).to_string())
                .collect();
            Ok(XPathValue::String(positions.join(" ")))
        }
        _ => Ok(XPathValue::String(String::new())),
    }
}

fn func_subsequence<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !(2..=3).contains(&args.len()) {
        return Err(XPathError::FunctionError {
            function: "subsequence()".to_string(),
            message: "Expected 2 or 3 arguments".to_string(),
        });
    }
    let length = if args.len() == 3 {
        Some(args.remove(2).to_number())
    } else {
        None
    };
    let start = args.remove(1).to_number();
    match args.remove(0) {
        XPathValue::NodeSet(nodes) => {
            let start_rounded = (start + 0.5).floor();
            let end = length
                .map(|l| start_rounded + (l + 0.5).floor())
                .unwrap_or(f64::INFINITY);
            let result = nodes
                .into_iter()
                .enumerate()
                .filter_map(|(i, n)| {
                    let pos = (i + 1) as f64;
                    if pos >= start_rounded && pos < end {
                        Some(n)
                    } else {
                        None
                    }
                })
                .collect();
            Ok(XPathValue::NodeSet(result))
        }
        other => Ok(other),
    }
}

fn func_reverse<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "reverse()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    match args.remove(0) {
        XPathValue::NodeSet(mut nodes) => {
            nodes.reverse();
            Ok(XPathValue::NodeSet(nodes))
        }
        other => Ok(other),
    }
}

// --- Core & Node-Set Functions ---

fn func_id<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "id()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }

    let id_string = args.remove(0).to_string();
    let ids_to_find: HashSet<_> = id_string.split_whitespace().collect();
    if ids_to_find.is_empty() {
        return Ok(XPathValue::NodeSet(vec![]));
    }

    let mut results = Vec::new();
    let mut seen_nodes = HashSet::new();
    let mut stack = e_ctx.root_node.children().collect::<Vec<_>>();

    while let Some(node) = stack.pop() {
        if node.node_type() == NodeType::Element {
            for attr in node.attributes() {
                if let Some(q_name) = attr.name() {
                    let is_id_attr = (q_name.prefix == Some("xml") || q_name.prefix.is_none())
                        && q_name.local_part == "id";

                    if is_id_attr
                        && ids_to_find.contains(attr.string_value().as_str())
                        && seen_nodes.insert(node)
                    {
                        results.push(node);
                    }
                }
            }
        }
        stack.extend(node.children());
    }

    results.sort();
    Ok(XPathValue::NodeSet(results))
}

fn func_key<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 2 {
        return Err(XPathError::FunctionError {
            function: "key()".to_string(),
            message: "Expected 2 arguments".to_string(),
        });
    }

    let key_value_arg = args.remove(1);
    let key_name = args.remove(0).to_string();

    let key_index = match e_ctx.key_indexes.get(&key_name) {
        Some(index) => index,
        None => return Ok(XPathValue::NodeSet(vec![])), // No such key, return empty set
    };

    let key_values = match key_value_arg {
        XPathValue::NodeSet(nodes) => nodes
            .into_iter()
            .map(|n| n.string_value())
            .collect::<Vec<_>>(),
        other => vec![other.to_string()],
    };

    let mut result_nodes = Vec::new();
    let mut seen = std::collections::HashSet::new(); // Avoid duplicates

    for value in key_values {
        if let Some(nodes) = key_index.get(&value) {
            for &node in nodes {
                if seen.insert(node) {
                    result_nodes.push(node);
                }
            }
        }
    }

    result_nodes.sort();
    Ok(XPathValue::NodeSet(result_nodes))
}

fn func_string<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() > 1 {
        return Err(XPathError::FunctionError {
            function: "string()".to_string(),
            message: "Expected 0 or 1 arguments".to_string(),
        });
    }
    let s = if args.is_empty() {
        e_ctx.context_node.string_value()
    } else {
        args.remove(0).to_string()
    };
    Ok(XPathValue::String(s))
}

fn func_count<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "count()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let count = match args.remove(0) {
        XPathValue::NodeSet(nodes) => nodes.len() as f64,
        v => {
            return Err(XPathError::TypeError(format!(
                "count() argument must be a node-set, got {:?}",
                v
            )));
        }
    };
    Ok(XPathValue::Number(count))
}

fn func_position<'a, 'd, N: DataSourceNode<'a>>(
    args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if !args.is_empty() {
        return Err(XPathError::FunctionError {
            function: "position()".to_string(),
            message: "Expected 0 arguments".to_string(),
        });
    }
    Ok(XPathValue::Number(e_ctx.context_position as f64))
}

fn func_last<'a, 'd, N: DataSourceNode<'a>>(
    args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if !args.is_empty() {
        return Err(XPathError::FunctionError {
            function: "last()".to_string(),
            message: "Expected 0 arguments".to_string(),
        });
    }
    Ok(XPathValue::Number(e_ctx.context_size as f64))
}

fn func_local_name<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() > 1 {
        return Err(XPathError::FunctionError {
            function: "local-name()".to_string(),
            message: "Expected 0 or 1 arguments".to_string(),
        });
    }
    let node = if args.is_empty() {
        Some(e_ctx.context_node)
    } else {
        match args.remove(0) {
            XPathValue::NodeSet(nodes) => nodes.first().copied(),
            v => {
                return Err(XPathError::TypeError(format!(
                    "local-name() argument must be a node-set, got {:?}",
                    v
                )));
            }
        }
    };
    let name = node
        .and_then(|n| n.name().map(|q| q.local_part.to_string()))
        .unwrap_or_default();
    Ok(XPathValue::String(name))
}

fn func_name<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() > 1 {
        return Err(XPathError::FunctionError {
            function: "name()".to_string(),
            message: "Expected 0 or 1 arguments".to_string(),
        });
    }
    let node = if args.is_empty() {
        Some(e_ctx.context_node)
    } else {
        match args.remove(0) {
            XPathValue::NodeSet(nodes) => nodes.first().copied(),
            v => {
                return Err(XPathError::TypeError(format!(
                    "name() argument must be a node-set, got {:?}",
                    v
                )));
            }
        }
    };
    let name = node
        .and_then(|n| {
            n.name().map(|q| {
                if let Some(prefix) = q.prefix {
                    format!("{}:{}", prefix, q.local_part)
                } else {
                    q.local_part.to_string()
                }
            })
        })
        .unwrap_or_default();
    Ok(XPathValue::String(name))
}

fn func_generate_id<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() > 1 {
        return Err(XPathError::FunctionError {
            function: "generate-id()".to_string(),
            message: "Expected 0 or 1 arguments".to_string(),
        });
    }

    let node_to_id = if args.is_empty() {
        Some(e_ctx.context_node)
    } else {
        match args.remove(0) {
            XPathValue::NodeSet(mut nodes) => {
                if nodes.is_empty() {
                    None
                } else {
                    // The spec requires using the first node in document order.
                    nodes.sort();
                    nodes.first().copied()
                }
            }
            // For non-node-set arguments, behavior is undefined; returning empty is safe.
            _ => None,
        }
    };

    if let Some(node) = node_to_id {
        let mut hasher = DefaultHasher::new();
        node.hash(&mut hasher);
        let id = hasher.finish();
        // Prefix with a letter to ensure it's a valid XML NCName.
        Ok(XPathValue::String(format!("id{}", id)))
    } else {
        // If the node-set is empty, return an empty string.
        Ok(XPathValue::String("".to_string()))
    }
}

// --- String Functions ---

fn func_concat<'a, N: DataSourceNode<'a>>(
    args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() < 2 {
        return Err(XPathError::FunctionError {
            function: "concat()".to_string(),
            message: "Expected at least 2 arguments".to_string(),
        });
    }
    let result = args.iter().map(|v| v.to_string()).collect::<String>();
    Ok(XPathValue::String(result))
}

fn func_starts_with<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 2 {
        return Err(XPathError::FunctionError {
            function: "starts-with()".to_string(),
            message: "Expected 2 arguments".to_string(),
        });
    }
    let s2 = args.remove(1).to_string();
    let s1 = args.remove(0).to_string();
    Ok(XPathValue::Boolean(s1.starts_with(&s2)))
}

fn func_contains<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 2 {
        return Err(XPathError::FunctionError {
            function: "contains()".to_string(),
            message: "Expected 2 arguments".to_string(),
        });
    }
    let s2 = args.remove(1).to_string();
    let s1 = args.remove(0).to_string();
    Ok(XPathValue::Boolean(s1.contains(&s2)))
}

fn func_substring_before<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 2 {
        return Err(XPathError::FunctionError {
            function: "substring-before()".to_string(),
            message: "Expected 2 arguments".to_string(),
        });
    }
    let s2 = args.remove(1).to_string();
    let s1 = args.remove(0).to_string();
    if let Some(index) = s1.find(&s2) {
        Ok(XPathValue::String(s1[..index].to_string()))
    } else {
        Ok(XPathValue::String("".to_string()))
    }
}

fn func_substring_after<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 2 {
        return Err(XPathError::FunctionError {
            function: "substring-after()".to_string(),
            message: "Expected 2 arguments".to_string(),
        });
    }
    let s2 = args.remove(1).to_string();
    let s1 = args.remove(0).to_string();
    if let Some(index) = s1.find(&s2) {
        Ok(XPathValue::String(s1[index + s2.len()..].to_string()))
    } else {
        Ok(XPathValue::String("".to_string()))
    }
}

fn func_substring<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !(2..=3).contains(&args.len()) {
        return Err(XPathError::FunctionError {
            function: "substring()".to_string(),
            message: "Expected 2 or 3 arguments".to_string(),
        });
    }
    let length_val = if args.len() == 3 {
        Some(args.remove(2).to_number())
    } else {
        None
    };
    let start_val = args.remove(1).to_number();
    let s = args.remove(0).to_string();

    // XPath rounding rules for start/length
    let start_rounded = (start_val + 0.5).floor();
    let length_rounded = length_val.map(|l| (l + 0.5).floor());

    let s_chars: Vec<char> = s.chars().collect();

    let first = start_rounded;
    let last = if let Some(l) = length_rounded {
        first + l
    } else {
        f64::INFINITY
    };

    let result = s_chars
        .iter()
        .enumerate()
        .filter_map(|(i, &c)| {
            let pos = (i + 1) as f64; // XPath positions are 1-based
            if pos >= first && pos < last {
                Some(c)
            } else {
                None
            }
        })
        .collect::<String>();
    Ok(XPathValue::String(result))
}

fn func_string_length<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() > 1 {
        return Err(XPathError::FunctionError {
            function: "string-length()".to_string(),
            message: "Expected 0 or 1 arguments".to_string(),
        });
    }
    let s = if args.is_empty() {
        e_ctx.context_node.string_value()
    } else {
        args.remove(0).to_string()
    };
    Ok(XPathValue::Number(s.chars().count() as f64))
}

fn func_normalize_space<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() > 1 {
        return Err(XPathError::FunctionError {
            function: "normalize-space()".to_string(),
            message: "Expected 0 or 1 arguments".to_string(),
        });
    }
    let s = if args.is_empty() {
        e_ctx.context_node.string_value()
    } else {
        args.remove(0).to_string()
    };
    let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
    Ok(XPathValue::String(normalized))
}

fn func_translate<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 3 {
        return Err(XPathError::FunctionError {
            function: "translate()".to_string(),
            message: "Expected 3 arguments".to_string(),
        });
    }
    let to_str: Vec<char> = args.remove(2).to_string().chars().collect();
    let from_str: Vec<char> = args.remove(1).to_string().chars().collect();
    let source_str = args.remove(0).to_string();
    let result = source_str
        .chars()
        .filter_map(|c| {
            if let Some(pos) = from_str.iter().position(|&fc| fc == c) {
                to_str.get(pos).copied()
            } else {
                Some(c)
            }
        })
        .collect::<String>();
    Ok(XPathValue::String(result))
}

// --- Boolean Functions ---

fn func_not<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "not()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    Ok(XPathValue::Boolean(!args.remove(0).to_bool()))
}

fn func_true<'a, N: DataSourceNode<'a>>(
    args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !args.is_empty() {
        return Err(XPathError::FunctionError {
            function: "true()".to_string(),
            message: "Expected 0 arguments".to_string(),
        });
    }
    Ok(XPathValue::Boolean(true))
}

fn func_false<'a, N: DataSourceNode<'a>>(
    args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if !args.is_empty() {
        return Err(XPathError::FunctionError {
            function: "false()".to_string(),
            message: "Expected 0 arguments".to_string(),
        });
    }
    Ok(XPathValue::Boolean(false))
}

fn func_lang<'a, 'd, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
    e_ctx: &EvaluationContext<'a, 'd, N>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "lang()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let test_lang = args.remove(0).to_string().to_lowercase();
    let mut current = Some(e_ctx.context_node);

    // If context node is not an element, start with its parent.
    if current.is_some_and(|n| n.node_type() != NodeType::Element) {
        current = current.and_then(|n| n.parent());
    }

    while let Some(node) = current {
        for attr in node.attributes() {
            #[allow(clippy::collapsible_if)]
            if let Some(name) = attr.name() {
                if name.prefix == Some("xml") && name.local_part == "lang" {
                    let node_lang = attr.string_value().to_lowercase();
                    // Check for exact match or subcode match (e.g., "en" matches "en-GB")
                    if node_lang == test_lang || node_lang.starts_with(&format!("{}-", test_lang)) {
                        return Ok(XPathValue::Boolean(true));
                    }
                    // If we found an xml:lang, we don't need to check higher up.
                    return Ok(XPathValue::Boolean(false));
                }
            }
        }
        current = node.parent();
    }
    Ok(XPathValue::Boolean(false))
}

// --- Number Functions ---

fn func_sum<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "sum()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let sum = match args.remove(0) {
        XPathValue::NodeSet(nodes) => nodes
            .iter()
            .map(|node| node.string_value().trim().parse::<f64>().unwrap_or(0.0))
            .sum(),
        v => {
            return Err(XPathError::TypeError(format!(
                "sum() argument must be a node-set, got {:?}",
                v
            )));
        }
    };
    Ok(XPathValue::Number(sum))
}

fn func_floor<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "floor()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    Ok(XPathValue::Number(args.remove(0).to_number().floor()))
}

fn func_ceiling<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "ceiling()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    Ok(XPathValue::Number(args.remove(0).to_number().ceil()))
}

fn func_round<'a, N: DataSourceNode<'a>>(
    mut args: Vec<XPathValue<N>>,
) -> Result<XPathValue<N>, XPathError> {
    if args.len() != 1 {
        return Err(XPathError::FunctionError {
            function: "round()".to_string(),
            message: "Expected 1 argument".to_string(),
        });
    }
    let n = args.remove(0).to_number();
    if n.is_nan() || n.is_infinite() || n == 0.0 {
        return Ok(XPathValue::Number(n));
    }
    // XPath 1.0 round() rounds halves towards positive infinity.
    // floor(n + 0.5) handles this correctly for both positive and negative numbers.
    Ok(XPathValue::Number((n + 0.5).floor()))
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        // Core
        registry.register("string");
        registry.register("count");
        registry.register("id");
        registry.register("position");
        registry.register("last");
        registry.register("local-name");
        registry.register("name");
        registry.register("key");
        registry.register("generate-id");
        registry.register("current");
        registry.register("namespace-uri");
        registry.register("document");
        registry.register("unparsed-entity-uri");
        registry.register("system-property");
        registry.register("function-available");
        registry.register("element-available");
        registry.register("format-number");
        // String
        registry.register("concat");
        registry.register("starts-with");
        registry.register("contains");
        registry.register("substring-before");
        registry.register("substring-after");
        registry.register("substring");
        registry.register("string-length");
        registry.register("normalize-space");
        registry.register("translate");
        // Boolean
        registry.register("not");
        registry.register("true");
        registry.register("false");
        registry.register("lang");
        // Number
        registry.register("sum");
        registry.register("floor");
        registry.register("ceiling");
        registry.register("round");
        // Node Tests (registered to provide better error messages)
        registry.register("node");
        registry.register("comment");
        registry.register("processing-instruction");
        // XPath 2.0+ tier
        registry.register("string-join");
        registry.register("upper-case");
        registry.register("lower-case");
        registry.register("ends-with");
        registry.register("matches");
        registry.register("replace");
        registry.register("tokenize");
        registry.register("compare");
        registry.register("codepoints-to-string");
        registry.register("string-to-codepoints");
        registry.register("encode-for-uri");
        registry.register("abs");
        registry.register("min");
        registry.register("max");
        registry.register("avg");
        registry.register("exists");
        registry.register("empty");
        registry.register("distinct-values");
        registry.register("index-of");
        registry.register("subsequence");
        registry.register("reverse");
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::tests::{MockNode, MockTree, create_test_tree};
    use crate::engine::EvaluationContext;
    use std::collections::HashMap;

    // --- Test Setup ---

    // A helper struct to hold all the data needed for a test, managing lifetimes correctly.
    struct TestSetup<'a> {
        tree: &'a MockTree<'a>, // Holds a reference to the tree, not ownership
        funcs: FunctionRegistry,
        vars: HashMap<String, XPathValue<MockNode<'a>>>,
        keys: HashMap<String, HashMap<String, Vec<MockNode<'a>>>>,
    }

    impl<'a> TestSetup<'a> {
        // The owner of the tree (the test function) passes a reference.
        fn new(tree: &'a MockTree<'a>) -> Self {
            TestSetup {
                tree,
                funcs: FunctionRegistry::default(),
                vars: HashMap::new(),
                keys: HashMap::new(),
            }
        }

        fn with_keys(mut self, keys: HashMap<String, HashMap<String, Vec<MockNode<'a>>>>) -> Self {
            self.keys = keys;
            self
        }

        // Creates an EvaluationContext with a specific context node, position, and size.
        // The returned context borrows from `self` for funcs/vars, and from the tree for nodes.
        fn context<'s>(
            &'s self,
            context_node_id: usize,
            pos: usize,
            size: usize,
        ) -> EvaluationContext<'a, 's, MockNode<'a>> {
            let root = MockNode {
                id: 0,
                tree: self.tree,
            };
            let context_node = MockNode {
                id: context_node_id,
                tree: self.tree,
            };
            // self.tree has lifetime 'a, so MockNode<'a> is valid.
            // &self.funcs and &self.vars have lifetime 's.
            // This correctly constructs an EvaluationContext<'a, 's, MockNode<'a>>.
            EvaluationContext::new(
                context_node,
                root,
                &self.funcs,
                pos,
                size,
                &self.vars,
                &self.keys,
                false,
            )
        }
    }

    fn eval_func<'a, 's>(
        name: &str,
        args: Vec<XPathValue<MockNode<'a>>>,
        e_ctx: &EvaluationContext<'a, 's, MockNode<'a>>,
    ) -> XPathValue<MockNode<'a>> {
        evaluate_function(name, args, e_ctx).unwrap()
    }

    // --- String Function Tests ---

    #[test]
    fn test_func_concat() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx = setup.context(0, 1, 1);
        let args = vec![
            XPathValue::String("Hello".to_string()),
            XPathValue::String(" ".to_string()),
            XPathValue::String("World".to_string()),
            XPathValue::Number(42.0),
        ];
        let result = eval_func("concat", args, &e_ctx);
        assert_eq!(result.to_string(), "Hello World42");
    }

    #[test]
    fn test_func_starts_with() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx = setup.context(0, 1, 1);
        let args_true = vec![
            XPathValue::String("abcdef".to_string()),
            XPathValue::String("abc".to_string()),
        ];
        assert_eq!(eval_func("starts-with", args_true, &e_ctx).to_bool(), true);
        let args_false = vec![
            XPathValue::String("abcdef".to_string()),
            XPathValue::String("def".to_string()),
        ];
        assert_eq!(
            eval_func("starts-with", args_false, &e_ctx).to_bool(),
            false
        );
    }

    #[test]
    fn test_func_substring() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx = setup.context(0, 1, 1);

        let args1 = vec![
            XPathValue::String("12345".to_string()),
            XPathValue::Number(2.0),
            XPathValue::Number(3.0),
        ];
        assert_eq!(eval_func("substring", args1, &e_ctx).to_string(), "234");

        let args2 = vec![
            XPathValue::String("12345".to_string()),
            XPathValue::Number(2.0),
        ];
        assert_eq!(eval_func("substring", args2, &e_ctx).to_string(), "2345");

        let args3 = vec![
            XPathValue::String("12345".to_string()),
            XPathValue::Number(1.5),
            XPathValue::Number(2.6),
        ];
        assert_eq!(eval_func("substring", args3, &e_ctx).to_string(), "234");
    }

    #[test]
    fn test_func_string_length() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx_para = setup.context(1, 1, 1); // <para> node

        assert_eq!(
            eval_func("string-length", vec![], &e_ctx_para).to_number(),
            5.0
        ); // "Hello"
        let args = vec![XPathValue::String("four".to_string())];
        assert_eq!(
            eval_func("string-length", args, &e_ctx_para).to_number(),
            4.0
        );
    }

    #[test]
    fn test_func_normalize_space() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx = setup.context(0, 1, 1);
        let args = vec![XPathValue::String(
            "  leading \n and   \t trailing  ".to_string(),
        )];
        assert_eq!(
            eval_func("normalize-space", args, &e_ctx).to_string(),
            "leading and trailing"
        );
    }

    #[test]
    fn test_func_translate() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx = setup.context(0, 1, 1);
        let args = vec![
            XPathValue::String("BAR".to_string()),
            XPathValue::String("ABC".to_string()),
            XPathValue::String("abc".to_string()),
        ];
        assert_eq!(eval_func("translate", args, &e_ctx).to_string(), "baR");

        let args2 = vec![
            XPathValue::String("12:30".to_string()),
            XPathValue::String("0123456789".to_string()),
            XPathValue::String("abcdefghij".to_string()),
        ];
        assert_eq!(eval_func("translate", args2, &e_ctx).to_string(), "bc:da");
    }

    // --- Boolean Function Tests ---

    #[test]
    fn test_func_not() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx = setup.context(0, 1, 1);
        assert_eq!(
            eval_func("not", vec![XPathValue::Boolean(true)], &e_ctx).to_bool(),
            false
        );
        assert_eq!(
            eval_func("not", vec![XPathValue::Number(0.0)], &e_ctx).to_bool(),
            true
        );
        assert_eq!(
            eval_func("not", vec![XPathValue::String("".to_string())], &e_ctx).to_bool(),
            true
        );
    }

    #[test]
    fn test_func_lang() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx_text = setup.context(4, 1, 1); // "Hello" text node, child of para with xml:lang="en"
        let e_ctx_div = setup.context(5, 1, 1); // div with no lang

        let args_en = vec![XPathValue::String("en".to_string())];
        assert_eq!(eval_func("lang", args_en, &e_ctx_text).to_bool(), true);

        let args_engb = vec![XPathValue::String("en-GB".to_string())];
        assert_eq!(eval_func("lang", args_engb, &e_ctx_text).to_bool(), false);

        let args_en_div = vec![XPathValue::String("en".to_string())];
        assert_eq!(eval_func("lang", args_en_div, &e_ctx_div).to_bool(), false);
    }

    // --- Number Function Tests ---

    #[test]
    fn test_func_sum() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx = setup.context(0, 1, 1);
        let node1 = MockNode {
            id: 1,
            tree: &setup.tree,
        }; // string-value is "Hello" -> NaN -> 0.0
        let node2 = MockNode {
            id: 2,
            tree: &setup.tree,
        }; // string-value is "p1" -> NaN -> 0.0
        let args = vec![XPathValue::NodeSet(vec![node1, node2])];
        assert_eq!(eval_func("sum", args, &e_ctx).to_number(), 0.0);
    }

    #[test]
    fn test_func_round() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx = setup.context(0, 1, 1);
        assert_eq!(
            eval_func("round", vec![XPathValue::Number(2.5)], &e_ctx).to_number(),
            3.0
        );
        assert_eq!(
            eval_func("round", vec![XPathValue::Number(2.4)], &e_ctx).to_number(),
            2.0
        );
        assert_eq!(
            eval_func("round", vec![XPathValue::Number(-2.5)], &e_ctx).to_number(),
            -2.0
        );
        assert_eq!(
            eval_func("round", vec![XPathValue::Number(-2.6)], &e_ctx).to_number(),
            -3.0
        );
    }

    // --- Node-Set Function Tests ---

    #[test]
    fn test_func_last_and_position() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        // Simulate being the 2nd node in a context of 5 nodes
        let e_ctx = setup.context(1, 2, 5);
        assert_eq!(eval_func("last", vec![], &e_ctx).to_number(), 5.0);
        assert_eq!(eval_func("position", vec![], &e_ctx).to_number(), 2.0);
    }

    #[test]
    fn test_func_local_name() {
        let tree = create_test_tree();
        let setup = TestSetup::new(&tree);
        let e_ctx_para = setup.context(1, 1, 1); // <para>
        let e_ctx_text = setup.context(4, 1, 1); // text()

        // No args, uses context node
        assert_eq!(
            eval_func("local-name", vec![], &e_ctx_para).to_string(),
            "para"
        );
        assert_eq!(eval_func("local-name", vec![], &e_ctx_text).to_string(), "");

        // With args
        let para_node = MockNode {
            id: 1,
            tree: &setup.tree,
        };
        let args = vec![XPathValue::NodeSet(vec![para_node])];
        assert_eq!(
            eval_func("local-name", args, &e_ctx_para).to_string(),
            "para"
        );
    }

    #[test]
    fn test_func_key() {
        let tree = create_test_tree();
        let para_node = MockNode { id: 1, tree: &tree };
        let attr_node = MockNode { id: 2, tree: &tree };

        let mut key_index = HashMap::new();
        key_index.insert("p1".to_string(), vec![para_node]); // key 'id-key' with value 'p1' maps to <para>
        key_index.insert("attr-val".to_string(), vec![attr_node]); // key 'id-key' with value 'attr-val' maps to @id

        let mut keys = HashMap::new();
        keys.insert("id-key".to_string(), key_index);

        let setup = TestSetup::new(&tree).with_keys(keys);
        let e_ctx = setup.context(0, 1, 1); // Context is root

        // Test key('id-key', 'p1')
        let args1 = vec![
            XPathValue::String("id-key".to_string()),
            XPathValue::String("p1".to_string()),
        ];
        let result1 = eval_func("key", args1, &e_ctx);
        if let XPathValue::NodeSet(nodes) = result1 {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0], para_node);
        } else {
            panic!("Expected NodeSet");
        }

        // Test key('id-key', 'nonexistent')
        let args2 = vec![
            XPathValue::String("id-key".to_string()),
            XPathValue::String("nonexistent".to_string()),
        ];
        let result2 = eval_func("key", args2, &e_ctx);
        if let XPathValue::NodeSet(nodes) = result2 {
            assert!(nodes.is_empty());
        } else {
            panic!("Expected NodeSet");
        }

        // Test key('id-key', /para/@id) -- arg is a node-set
        let args3 = vec![
            XPathValue::String("id-key".to_string()),
            XPathValue::NodeSet(vec![attr_node]), // attr_node's string value is 'p1'
        ];
        let result3 = eval_func("key", args3, &e_ctx);
        if let XPathValue::NodeSet(nodes) = result3 {
            assert_eq!(nodes.len(), 1);
            assert_eq!(nodes[0], para_node);
        } else {
            panic!("Expected NodeSet");
        }
    }
}
