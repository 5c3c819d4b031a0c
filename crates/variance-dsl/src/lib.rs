//!
//! Parser for the variance expression DSL.
//!
//! Turns text like `base = tomato AND (topping = salami OR topping = ham)` into the
//! canonical tree of `variance-expr-ast`.
//!
//! Typical pipeline:
//! 1. A BoM line carries a variance expression as free text.
//! 2. Parse text -> tree (this crate). Canonicalization happens while the tree is built.
//! 3. Render the tree back to text, or hash it, to get a stable key for the choice.
//!
//! The grammar is split on structure rather than lexed into words: a pest grammar only
//! marks the ` AND ` / ` OR ` separators and parentheses, and the builder recursively
//! cuts the text at operators outside any parenthesis.

use log::{debug, trace};
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use variance_expr_ast::{Assignment, Expression, Operation, Operator};

#[derive(Parser)]
#[grammar = "variance.pest"]
struct VarianceParser;

const ASSIGN: &str = " = ";

/// Coarse classification of a `DslError`, for callers that branch on the failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller passed no input at all.
    Argument,
    /// Unambiguous nonsense: bad parentheses, mixed operators on one level, no assignment.
    Invalid,
    /// Looks like an expression but a required part is missing.
    Incomplete,
    /// Input exceeds the configured `ParseOptions`.
    Limit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DslError {
    #[error("invalid argument: {0}")]
    Argument(String),
    #[error("invalid expression: {0}")]
    Invalid(String),
    #[error("incomplete expression: {0}")]
    Incomplete(String),
    #[error("expression nested deeper than {limit} levels")]
    TooDeep { limit: usize },
    #[error("expression is {len} bytes long, limit is {limit}")]
    TooLong { len: usize, limit: usize },
}

impl DslError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DslError::Argument(_) => ErrorKind::Argument,
            DslError::Invalid(_) => ErrorKind::Invalid,
            DslError::Incomplete(_) => ErrorKind::Incomplete,
            DslError::TooDeep { .. } | DslError::TooLong { .. } => ErrorKind::Limit,
        }
    }
}

/// Resource guards for parsing untrusted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParseOptions {
    /// Maximum recursion depth of the builder (one level per split or stripped group).
    pub max_depth: usize,

    /// Maximum input length in bytes.
    pub max_input_len: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { max_depth: 64, max_input_len: 64 * 1024 }
    }
}

/// Parses variance expression text into `variance_expr_ast::Expression`.
///
/// Empty or whitespace-only input yields `Expression::Blank`.
pub fn parse_expression(input: &str) -> Result<Expression, DslError> {
    ExpressionBuilder::default().build(input)
}

/// Like `parse_expression`, for callers whose input may be missing altogether.
pub fn parse_optional(input: Option<&str>) -> Result<Expression, DslError> {
    match input {
        Some(text) => parse_expression(text),
        None => Err(DslError::Argument("input value of None is not valid".into())),
    }
}

/// Parses and renders back, giving the canonical text of `input`.
pub fn canonicalize(input: &str) -> Result<String, DslError> {
    parse_expression(input).map(|e| e.render())
}

#[derive(Debug, Clone, Default)]
pub struct ExpressionBuilder {
    options: ParseOptions,
}

impl ExpressionBuilder {
    pub fn new(options: ParseOptions) -> Self { Self { options } }

    pub fn options(&self) -> &ParseOptions { &self.options }

    pub fn build(&self, input: &str) -> Result<Expression, DslError> {
        if input.len() > self.options.max_input_len {
            return Err(DslError::TooLong { len: input.len(), limit: self.options.max_input_len });
        }
        let result = self.build_at(input, 0);
        if let Err(e) = &result {
            debug!("rejected variance expression {:?}: {}", input, e);
        }
        result
    }

    fn build_at(&self, input: &str, depth: usize) -> Result<Expression, DslError> {
        if depth > self.options.max_depth {
            return Err(DslError::TooDeep { limit: self.options.max_depth });
        }
        let text = input.trim();
        if text.is_empty() {
            return Ok(Expression::Blank);
        }
        // checked before trimming, so "A = " is incomplete rather than invalid
        if !input.contains(ASSIGN) {
            return Err(DslError::Invalid(format!("{:?} needs to have at least one assignment", text)));
        }

        let tokens = tokenize(text)?;
        check_parentheses(&tokens)?;

        let ands = tokens.iter().filter(|t| t.kind == TokenKind::And).count();
        let ors = tokens.iter().filter(|t| t.kind == TokenKind::Or).count();
        match (ands > 0, ors > 0) {
            (false, false) => self.build_assignment(text, &tokens, depth),
            (true, false) => self.split_one_kind(Operator::And, text, depth),
            (false, true) => self.split_one_kind(Operator::Or, text, depth),
            (true, true) => self.split_top_level(text, &tokens, depth),
        }
    }

    fn build_assignment(&self, text: &str, tokens: &[Token], depth: usize) -> Result<Expression, DslError> {
        if let Some(inner) = unwrap_group(text, tokens) {
            trace!("depth {}: stripping parentheses around assignment {:?}", depth, text);
            return self.build_at(inner, depth + 1);
        }
        let parts: Vec<&str> = text.split(ASSIGN).collect();
        if parts.len() != 2 {
            return Err(DslError::Incomplete(format!("{:?} is not a single `family = value` assignment", text)));
        }
        Assignment::new(parts[0], parts[1])
            .map(Expression::from)
            .map_err(|e| DslError::Incomplete(format!("{} in {:?}", e, text)))
    }

    /// Only one operator kind in the whole text, so grouping carries no meaning and every
    /// parenthesis is dropped before splitting.
    fn split_one_kind(&self, operator: Operator, text: &str, depth: usize) -> Result<Expression, DslError> {
        let stripped: String = text.chars().filter(|c| *c != '(' && *c != ')').collect();
        let mut fragments: Vec<&str> = Vec::new();
        for fragment in stripped.split(operator.token()) {
            if fragment.trim().is_empty() {
                return Err(DslError::Incomplete(format!("{} without an operand in {:?}", operator, text)));
            }
            if !fragments.contains(&fragment) {
                fragments.push(fragment);
            }
        }
        trace!("depth {}: {} over {} fragments", depth, operator, fragments.len());

        let children = fragments
            .into_iter()
            .map(|f| self.build_at(f, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Operation::create(operator, children))
    }

    /// Both operator kinds present: cut only at operators outside every parenthesis.
    fn split_top_level(&self, text: &str, tokens: &[Token], depth: usize) -> Result<Expression, DslError> {
        let mut level = 0usize;
        let mut separators: Vec<&Token> = Vec::new();
        for t in tokens {
            match t.kind {
                TokenKind::Open => level += 1,
                TokenKind::Close => level -= 1,
                TokenKind::And | TokenKind::Or if level == 0 => separators.push(t),
                _ => {}
            }
        }

        if separators.is_empty() {
            return match unwrap_group(text, tokens) {
                Some(inner) => {
                    trace!("depth {}: stripping parentheses around {:?}", depth, text);
                    self.build_at(inner, depth + 1)
                }
                None => Err(DslError::Invalid(format!("no operator outside parentheses in {:?}", text))),
            };
        }

        let operator = operator_at(text, separators[0])?;
        for t in &separators[1..] {
            if operator_at(text, t)? != operator {
                return Err(DslError::Invalid(format!("AND and OR on the same level are forbidden in {:?}", text)));
            }
        }

        let mut segments = Vec::with_capacity(separators.len() + 1);
        let mut start = 0;
        for t in &separators {
            segments.push(text[start..t.start].trim());
            start = t.end;
        }
        segments.push(text[start..].trim());
        if segments.iter().any(|s| s.is_empty()) {
            return Err(DslError::Incomplete(format!("{} without an operand in {:?}", operator, text)));
        }
        trace!("depth {}: {} over {} top-level segments", depth, operator, segments.len());

        let children = segments
            .into_iter()
            .map(|s| self.build_at(s, depth + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Operation::create(operator, children))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind { And, Or, Open, Close, Text }

/// Byte span of one structural token.
#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>, DslError> {
    let root = VarianceParser::parse(Rule::tokens, text)
        .map_err(|e| DslError::Invalid(e.to_string()))?
        .next()
        .ok_or_else(|| DslError::Invalid("empty token stream".into()))?;

    let mut tokens = Vec::new();
    for pair in root.into_inner() {
        let kind = match pair.as_rule() {
            Rule::and_op => TokenKind::And,
            Rule::or_op => TokenKind::Or,
            Rule::open => TokenKind::Open,
            Rule::close => TokenKind::Close,
            Rule::text => TokenKind::Text,
            _ => continue,
        };
        let span = pair.as_span();
        tokens.push(Token { kind, start: span.start(), end: span.end() });
    }
    Ok(tokens)
}

/// Operator kind of a separator token, compared case-insensitively.
fn operator_at(text: &str, t: &Token) -> Result<Operator, DslError> {
    text[t.start..t.end]
        .parse()
        .map_err(|e: variance_expr_ast::UnknownOperator| DslError::Argument(e.to_string()))
}

fn check_parentheses(tokens: &[Token]) -> Result<(), DslError> {
    let opening = tokens.iter().filter(|t| t.kind == TokenKind::Open).count();
    let closing = tokens.iter().filter(|t| t.kind == TokenKind::Close).count();
    if opening > closing {
        return Err(DslError::Invalid("more \"(\" than \")\"".into()));
    }
    if opening < closing {
        return Err(DslError::Invalid("more \")\" than \"(\"".into()));
    }

    let mut level = 0usize;
    for t in tokens {
        match t.kind {
            TokenKind::Open => level += 1,
            TokenKind::Close if level == 0 => {
                return Err(DslError::Invalid(format!("closing parenthesis at byte {} before opening", t.start)));
            }
            TokenKind::Close => level -= 1,
            _ => {}
        }
    }
    Ok(())
}

/// Inner text when all of `text` is one parenthesized group, e.g. `(A = B OR C = D)`
/// but not `(A = B) OR (C = D)`. Expects balanced parentheses.
fn unwrap_group<'a>(text: &'a str, tokens: &[Token]) -> Option<&'a str> {
    let first = tokens.first()?;
    let last = tokens.last()?;
    if first.kind != TokenKind::Open || last.kind != TokenKind::Close || last.end != text.len() {
        return None;
    }
    let mut level = 0usize;
    for (i, t) in tokens.iter().enumerate() {
        match t.kind {
            TokenKind::Open => level += 1,
            TokenKind::Close => {
                level -= 1;
                if level == 0 && i + 1 != tokens.len() {
                    return None;
                }
            }
            _ => {}
        }
    }
    Some(&text[first.end..last.start])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        tokenize(text).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn tokenizer_marks_operators_and_parentheses() {
        use TokenKind::*;
        assert_eq!(kinds("(A = B OR C = D) AND E = F"), vec![Open, Text, Or, Text, Close, And, Text]);
    }

    #[test]
    fn tokenizer_is_case_sensitive_and_needs_spaces() {
        use TokenKind::*;
        assert_eq!(kinds("A = B and C = D"), vec![Text]);
        assert_eq!(kinds("A = ORANGE"), vec![Text]);
        assert_eq!(kinds("A = B AND(C = D)"), vec![Text, Open, Text, Close]);
    }

    #[test]
    fn tokenizer_spans_cover_operator_spaces() {
        let tokens = tokenize("A = B OR C = D").unwrap();
        assert_eq!((tokens[1].start, tokens[1].end), (5, 9));
    }

    #[test]
    fn parenthesis_order_is_checked() {
        let err = check_parentheses(&tokenize(")A = B(").unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert!(check_parentheses(&tokenize("(A = B) OR (C = D)").unwrap()).is_ok());
    }

    #[test]
    fn unwrap_group_only_for_a_single_enclosing_group() {
        let text = "(A = B AND (C = D OR E = F))";
        assert_eq!(unwrap_group(text, &tokenize(text).unwrap()), Some("A = B AND (C = D OR E = F)"));

        let text = "(A = B) OR (C = D)";
        assert_eq!(unwrap_group(text, &tokenize(text).unwrap()), None);

        let text = "A = (B)";
        assert_eq!(unwrap_group(text, &tokenize(text).unwrap()), None);
    }

    #[test]
    fn redundant_group_layers_are_stripped() {
        assert_eq!(parse_expression("((A = B))").unwrap().render(), "A = B");
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: ParseOptions = serde_json::from_str(r#"{"maxDepth": 8}"#).unwrap();
        assert_eq!(options.max_depth, 8);
        assert_eq!(options.max_input_len, ParseOptions::default().max_input_len);
    }

    #[test]
    fn depth_guard_fails_gracefully() {
        let builder = ExpressionBuilder::new(ParseOptions { max_depth: 3, ..ParseOptions::default() });
        let text = "((((((A = B AND C = D) OR E = F))))) AND G = H";
        let err = builder.build(text).unwrap_err();
        assert_eq!(err, DslError::TooDeep { limit: 3 });
        assert_eq!(err.kind(), ErrorKind::Limit);
        assert!(parse_expression(text).is_ok());
    }

    #[test]
    fn length_guard_runs_before_parsing() {
        let builder = ExpressionBuilder::new(ParseOptions { max_input_len: 4, ..ParseOptions::default() });
        assert_eq!(builder.build("A = B").unwrap_err(), DslError::TooLong { len: 5, limit: 4 });
    }
}
