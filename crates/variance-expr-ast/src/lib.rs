//!
//! Tree types for variance expressions.
//!
//! A variance expression describes a configuration choice of a bill of materials,
//! e.g. `base = tomato AND topping = salami`. This crate holds the normalized tree
//! shared by:
//! - the DSL parser (`variance-dsl`),
//! - BoM tooling that stores, compares or indexes expressions.
//!
//! Key features:
//! - `Expression`: the closed set of node kinds (blank, assignment, operation).
//! - `Operation::create`: the only way to build a composite; canonicalizes on the spot.
//! - `expression_hash`: stable hash of the canonical JSON representation (dedupe / caching).
//! - `extract_dependencies`: walks the tree and returns referenced families and choices.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssignmentError {
    #[error("option family must not be empty")]
    EmptyFamily,
    #[error("option value must not be empty")]
    EmptyValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operator type: {0}")]
pub struct UnknownOperator(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
/// One configuration choice like `topping = salami`.
///
/// Leaf of the tree. Both parts are stored trimmed and are never empty.
pub struct Assignment {
    family: String,
    value: String,
}

impl Assignment {
    pub fn new(family: &str, value: &str) -> Result<Self, AssignmentError> {
        let family = family.trim();
        if family.is_empty() {
            return Err(AssignmentError::EmptyFamily);
        }
        let value = value.trim();
        if value.is_empty() {
            return Err(AssignmentError::EmptyValue);
        }
        Ok(Self { family: family.to_string(), value: value.to_string() })
    }

    pub fn family(&self) -> &str { &self.family }
    pub fn value(&self) -> &str { &self.value }

    /// Partial match: `true` when either the family or the value is the same.
    ///
    /// This is the node equality used while deduplicating the children of an
    /// operation. It is only ever consulted for children that already render
    /// identically, so `AA = CCC` and `AA = DDD` are both kept.
    pub fn partially_matches(&self, other: &Assignment) -> bool {
        self.family == other.family || self.value == other.value
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.family, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator { And, Or }

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::And => "AND",
            Operator::Or => "OR",
        }
    }

    /// Separator as it appears in expression text, spaces included.
    pub fn token(&self) -> &'static str {
        match self {
            Operator::And => " AND ",
            Operator::Or => " OR ",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = UnknownOperator;

    /// Case-insensitive; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("and") {
            Ok(Operator::And)
        } else if t.eq_ignore_ascii_case("or") {
            Ok(Operator::Or)
        } else {
            Err(UnknownOperator(s.to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
/// AND/OR node over two or more children.
///
/// Invariants, established by `Operation::create` and never broken afterwards:
/// - at least two children,
/// - no child is an operation with the same operator,
/// - no two children render identically,
/// - children are ordered by their rendered text.
pub struct Operation {
    operator: Operator,
    children: Vec<Expression>,
}

impl Operation {
    /// Builds the canonical form of `operator` over `children`.
    ///
    /// Children are expected to be canonical already (they are, when built bottom-up).
    /// Same-operator children are flattened into this node, duplicates dropped and the
    /// rest sorted. A single surviving child is returned as is, so the result is not
    /// necessarily an operation.
    pub fn create<I>(operator: Operator, children: I) -> Expression
    where
        I: IntoIterator<Item = Expression>,
    {
        let mut flattened = Vec::new();
        for child in children {
            match child {
                Expression::Operation(op) if op.operator == operator => flattened.extend(op.children),
                other => flattened.push(other),
            }
        }

        // rendered text -> indices into `unique`
        let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
        let mut unique: Vec<(String, Expression)> = Vec::with_capacity(flattened.len());
        for child in flattened {
            let text = child.render();
            let bucket = buckets.entry(text.clone()).or_default();
            if bucket.iter().any(|&i| unique[i].1.matches(&child)) {
                continue;
            }
            bucket.push(unique.len());
            unique.push((text, child));
        }
        unique.sort_by(|a, b| a.0.cmp(&b.0));

        let mut children: Vec<Expression> = unique.into_iter().map(|(_, e)| e).collect();
        match children.len() {
            0 => Expression::Blank,
            1 => children.remove(0),
            _ => Expression::Operation(Operation { operator, children }),
        }
    }

    pub fn operator(&self) -> Operator { self.operator }
    pub fn children(&self) -> &[Expression] { &self.children }
    pub fn len(&self) -> usize { self.children.len() }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, child) in self.children.iter().enumerate() {
            if i > 0 {
                f.write_str(self.operator.token())?;
            }
            match child {
                Expression::Operation(op) => write!(f, "({})", op)?,
                leaf => write!(f, "{}", leaf)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
/// Variance expression tree.
///
/// Notes:
/// - `Blank` only results from empty input; it renders to the empty string.
/// - Trees are immutable; every node is fully formed when its constructor returns.
pub enum Expression {
    Blank,
    Assignment(Assignment),
    Operation(Operation),
}

impl Expression {
    /// Canonical text of this tree.
    pub fn render(&self) -> String {
        self.to_string()
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Expression::Blank)
    }

    pub fn as_assignment(&self) -> Option<&Assignment> {
        match self {
            Expression::Assignment(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_operation(&self) -> Option<&Operation> {
        match self {
            Expression::Operation(op) => Some(op),
            _ => None,
        }
    }

    /// Node equality used for deduplication.
    ///
    /// Assignments match partially (see `Assignment::partially_matches`), operations
    /// match on the same operator or the same children, a blank matches nothing.
    pub fn matches(&self, other: &Expression) -> bool {
        match (self, other) {
            (Expression::Assignment(a), Expression::Assignment(b)) => a.partially_matches(b),
            (Expression::Operation(a), Expression::Operation(b)) => {
                a.operator == b.operator || a.children == b.children
            }
            _ => false,
        }
    }

    /// Number of nodes on the longest path from the root to a leaf.
    pub fn depth(&self) -> usize {
        match self {
            Expression::Blank => 0,
            Expression::Assignment(_) => 1,
            Expression::Operation(op) => 1 + op.children.iter().map(Expression::depth).max().unwrap_or(0),
        }
    }

    pub fn assignment_count(&self) -> usize {
        match self {
            Expression::Blank => 0,
            Expression::Assignment(_) => 1,
            Expression::Operation(op) => op.children.iter().map(Expression::assignment_count).sum(),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Blank => Ok(()),
            Expression::Assignment(a) => write!(f, "{}", a),
            Expression::Operation(op) => write!(f, "{}", op),
        }
    }
}

impl From<Assignment> for Expression {
    fn from(a: Assignment) -> Self { Expression::Assignment(a) }
}

pub fn canonical_json(expr: &Expression) -> serde_json::Value {
    serde_json::to_value(expr).expect("Expression serializable")
}

/// Lowercase hex SHA-256 of the canonical JSON; equal canonical forms hash equally.
pub fn expression_hash(expr: &Expression) -> String {
    let v = canonical_json(expr);
    let bytes = serde_json::to_vec(&v).expect("json");
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Families and choices referenced by an expression.
///
/// This powers:
/// - catalog validation (detect unknown option families),
/// - storage indexing of BoM lines by option family,
/// - impact analysis ("which lines mention `topping = salami`?").
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dependencies {
    pub families: HashSet<String>,
    pub choices: HashSet<String>,
}

/// Walks the tree and returns the set of families and rendered `family = value` choices.
pub fn extract_dependencies(expr: &Expression) -> Dependencies {
    let mut d = Dependencies::default();
    walk(expr, &mut d);
    d
}

fn walk(expr: &Expression, d: &mut Dependencies) {
    match expr {
        Expression::Blank => {}
        Expression::Assignment(a) => {
            d.families.insert(a.family.clone());
            d.choices.insert(a.to_string());
        }
        Expression::Operation(op) => {
            for child in &op.children { walk(child, d); }
        }
    }
}
