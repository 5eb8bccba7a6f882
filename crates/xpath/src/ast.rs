//! Defines the Abstract Syntax Tree (AST) for XPath expressions.
//!
//! Covers the full XPath 1.0 grammar plus a small, optional XPath 2.0/3.0
//! tier (`to`, `intersect`/`except`, `if`/`for`/`let`, sequence-type tests).
//! The optional-tier variants are only ever produced by the parser when the
//! corresponding syntax is used; nothing in the 1.0 surface changes shape.

/// The top-level expression that can be evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(String),
    Number(f64),
    LocationPath(LocationPath),
    Variable(String),
    FunctionCall {
        name: String,
        args: Vec<Expression>,
    },
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    UnaryOp {
        op: UnaryOperator,
        expr: Box<Expression>,
    },
    /// `if (test) then a else b` (XPath 2.0+).
    If {
        test: Box<Expression>,
        then_expr: Box<Expression>,
        else_expr: Box<Expression>,
    },
    /// `for $x in seq return body`, one clause per entry (XPath 2.0+).
    For {
        bindings: Vec<(String, Expression)>,
        body: Box<Expression>,
    },
    /// `let $x := value return body` (XPath 2.0+).
    Let {
        bindings: Vec<(String, Expression)>,
        body: Box<Expression>,
    },
    /// `some $x in seq satisfies test` / `every ...` (XPath 2.0+).
    Quantified {
        every: bool,
        bindings: Vec<(String, Expression)>,
        test: Box<Expression>,
    },
    /// `expr instance of type` / `expr castable as type` (XPath 2.0+).
    InstanceOf {
        expr: Box<Expression>,
        sequence_type: SequenceType,
    },
    CastableAs {
        expr: Box<Expression>,
        sequence_type: SequenceType,
    },
    CastAs {
        expr: Box<Expression>,
        sequence_type: SequenceType,
    },
}

impl Expression {
    /// Checks if the expression is a `LocationPath` variant.
    pub fn is_location_path(&self) -> bool {
        matches!(self, Expression::LocationPath(_))
    }

    /// Checks if the expression is a `BinaryOp` variant.
    pub fn is_binary_op(&self) -> bool {
        matches!(self, Expression::BinaryOp { .. })
    }
}

/// A unary operator used in an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Minus,
}

/// A binary operator used in an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    // Logical
    Or,
    And,
    // Equality
    Equals,
    NotEquals,
    // Relational
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    // Additive
    Plus,
    Minus,
    // Multiplicative
    Multiply,
    Divide,
    Modulo,
    IntegerDivide,
    // Set
    Union,
    Intersect,
    Except,
    /// `a to b`, an integer range sequence (XPath 2.0+).
    To,
    /// Value comparisons `eq ne lt le gt ge` (XPath 2.0+), as distinct from
    /// the general comparisons above.
    ValueEquals,
    ValueNotEquals,
    ValueLessThan,
    ValueLessThanOrEqual,
    ValueGreaterThan,
    ValueGreaterThanOrEqual,
}

/// A minimal sequence-type grammar, sufficient for `instance of` / `cast as`
/// / `castable as` / `treat as` against atomic types and node kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceType {
    pub item_type: ItemType,
    pub occurrence: OccurrenceIndicator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemType {
    AtomicType(String),
    Node,
    Element,
    Attribute,
    Text,
    Comment,
    ProcessingInstruction,
    Item,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccurrenceIndicator {
    ExactlyOne,
    ZeroOrOne,
    ZeroOrMore,
    OneOrMore,
}

/// Represents a full location path, like `/child::foo`, `descendant::bar[1]`, or `$var/item`.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationPath {
    /// An optional starting expression, for paths like `$var/foo` or `func()/foo`.
    /// If `None`, the path starts from the context node or root.
    pub start_point: Option<Box<Expression>>,
    /// True if the path starts from the document root (e.g., `/foo`).
    /// Meaningless if `start_point` is `Some`.
    pub is_absolute: bool,
    pub steps: Vec<Step>,
}

/// Represents a single step in a location path, like `child::foo[position() > 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub node_test: NodeTest,
    pub predicates: Vec<Expression>,
}

/// The axis of movement from the context node. All 13 XPath axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Attribute,
    Parent,
    Ancestor,
    AncestorOrSelf,
    SelfAxis,
    FollowingSibling,
    PrecedingSibling,
    Following,
    Preceding,
    Namespace,
}

impl Axis {
    /// True for the seven axes the XPath grammar classifies as "reverse":
    /// predicate position counts backward from the context node.
    pub fn is_reverse(self) -> bool {
        matches!(
            self,
            Axis::Ancestor | Axis::AncestorOrSelf | Axis::Parent | Axis::Preceding | Axis::PrecedingSibling
        )
    }
}

/// A test to apply to nodes on a given axis to see if they should be included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTest {
    /// A qualified name test (e.g., `foo`, `xsl:if`).
    Name(String),
    /// A wildcard test (`*`).
    Wildcard,
    /// A namespace-wildcard test (`prefix:*`), matching any local name in
    /// the prefix's namespace.
    NamespaceWildcard(String),
    /// A node type test (e.g., `text()`, `node()`).
    NodeType(NodeTypeTest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTypeTest {
    Text,
    Node,
    Comment,
    ProcessingInstruction,
}
