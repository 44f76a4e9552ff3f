//! Step conditions.
//!
//! A small expression language evaluated against the run's [`Scope`]:
//!
//! ```text
//! expr    := or
//! or      := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | compare
//! compare := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary := literal | reference | "(" expr ")"
//! ```
//!
//! Literals are numbers, quoted strings, `true`, `false` and `null`.
//! References are `steps.*` and `input.*` paths as in templates.  The result
//! is interpreted by truthiness: `null`, `false`, `0`, `""` and empty
//! collections are false.
//!
//! Conditions are bounded in size and nesting so that parsing and evaluating
//! a user-written file can never exhaust the stack.

use serde_json::Value;

use super::template::{Reference, Scope};

/// Deepest `!` / `(` nesting accepted.
const MAX_NESTING: usize = 64;

/// Longest condition accepted, in tokens.  Bounds the depth of `&&` / `||`
/// chains, which nest in the tree without nesting in the source.
const MAX_TOKENS: usize = 1024;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Ref(Reference),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = lex(source)?;
        if tokens.len() > MAX_TOKENS {
            return Err(format!("condition too long (more than {MAX_TOKENS} tokens)"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.or()?;
        if let Some(token) = parser.peek() {
            return Err(format!("unexpected `{token}`"));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// A constant condition (`"condition": false`).
    pub fn literal(value: bool) -> Self {
        Self {
            source: value.to_string(),
            expr: Expr::Literal(Value::Bool(value)),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every reference the condition reads.
    pub fn references(&self) -> Vec<Reference> {
        let mut found = Vec::new();
        collect(&self.expr, &mut found);
        found
    }

    pub fn evaluate(&self, scope: &Scope) -> bool {
        truthy(&eval(&self.expr, scope))
    }
}

fn collect(expr: &Expr, found: &mut Vec<Reference>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Ref(r) => found.push(r.clone()),
        Expr::Not(inner) => collect(inner, found),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Compare(_, a, b) => {
            collect(a, found);
            collect(b, found);
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, scope: &Scope) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Ref(r) => scope.resolve(r),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope))),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, scope)) && truthy(&eval(b, scope))),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, scope)) || truthy(&eval(b, scope))),
        Expr::Compare(op, a, b) => Value::Bool(compare(*op, &eval(a, scope), &eval(b, scope))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    let ordering = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().zip(y.as_f64()).and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(std::cmp::Ordering::Equal),
        _ => None,
    };
    match op {
        CmpOp::Eq => ordering.map_or(a == b, |o| o.is_eq()),
        CmpOp::Ne => ordering.map_or(a != b, |o| o.is_ne()),
        CmpOp::Lt => ordering.is_some_and(|o| o.is_lt()) && is_ordered(a),
        CmpOp::Le => ordering.is_some_and(|o| o.is_le()) && is_ordered(a),
        CmpOp::Gt => ordering.is_some_and(|o| o.is_gt()) && is_ordered(a),
        CmpOp::Ge => ordering.is_some_and(|o| o.is_ge()) && is_ordered(a),
    }
}

/// Only numbers and strings have an order.
fn is_ordered(value: &Value) -> bool {
    matches!(value, Value::Number(_) | Value::String(_))
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "\"{s}\""),
            Self::Ident(s) => f.write_str(s),
            Self::Op(op) => f.write_str(match op {
                CmpOp::Eq => "==",
                CmpOp::Ne => "!=",
                CmpOp::Lt => "<",
                CmpOp::Le => "<=",
                CmpOp::Gt => ">",
                CmpOp::Ge => ">=",
            }),
            Self::And => f.write_str("&&"),
            Self::Or => f.write_str("||"),
            Self::Not => f.write_str("!"),
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                tokens.push(Token::Op(match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    (_, false) => CmpOp::Gt,
                    (_, true) => CmpOp::Ge,
                }));
                i += if or_equal { 2 } else { 1 };
            }
            '"' | '\'' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| "unterminated string".to_string())?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse().map_err(|_| format!("invalid number `{text}`"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-')) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character `{other}`")),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Current `!` / `(` nesting.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("condition nested too deeply (limit {MAX_NESTING})"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let left = self.primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.primary()?;
            return Ok(Expr::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Num(n)) => serde_json::Number::from_f64(n)
                .map(|n| Expr::Literal(Value::Number(n)))
                .ok_or_else(|| format!("invalid number `{n}`")),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(ident)) => match ident.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => Reference::parse(&ident).map(Expr::Ref),
            },
            Some(Token::LParen) => {
                let inner = self.nested(Self::or)?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected `)`".into()),
                }
            }
            Some(token) => Err(format!("unexpected `{token}`")),
            None => Err("unexpected end of condition".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use deskpilot_kernel::{ToolErrorKind, ToolParams, ToolResult};
    use serde_json::json;

    fn scope() -> Scope {
        let mut input = ToolParams::new();
        input.insert("mode".into(), json!("fast"));
        input.insert("limit".into(), json!(10));
        let mut scope = Scope::new(&input);
        scope.record("size", &ToolResult::ok("measured", json!({"bytes": 2048})));
        scope.record("ping", &ToolResult::failure(ToolErrorKind::Execution, "boom"));
        scope.record_absent("gone");
        scope
    }

    fn eval(src: &str) -> bool {
        Condition::parse(src).unwrap().evaluate(&scope())
    }

    #[test]
    fn comparisons() {
        assert!(eval("steps.size.bytes > 1024"));
        assert!(eval("steps.size.bytes >= 2048.0"));
        assert!(!eval("steps.size.bytes < 100"));
        assert!(eval("input.mode == 'fast'"));
        assert!(eval("input.mode != \"safe\""));
        assert!(eval("input.limit <= 10"));
        assert!(eval("steps.gone == null"));
    }

    #[test]
    fn boolean_operators_and_precedence() {
        assert!(eval("steps.size.success && !steps.ping.success"));
        assert!(eval("steps.ping.success || input.limit > 5 && input.mode == 'fast'"));
        assert!(!eval("!(steps.size.success || steps.ping.success)"));
    }

    #[test]
    fn truthiness_of_bare_references() {
        assert!(eval("steps.size"));
        assert!(!eval("steps.gone"));
        assert!(!eval("steps.ping.success"));
        assert!(eval("steps.ping.error"));
    }

    #[test]
    fn mixed_types_do_not_order() {
        assert!(!eval("input.mode > 3"));
        assert!(!eval("input.mode < 3"));
        assert!(!eval("input.mode == 3"));
    }

    #[test]
    fn references_are_listed() {
        let cond = Condition::parse("steps.a.ok && (input.x > 1 || steps.b)").unwrap();
        let steps: Vec<_> = cond.references().iter().filter_map(|r| r.step().map(str::to_string)).collect();
        assert_eq!(steps, vec!["a", "b"]);
    }

    #[test]
    fn malformed_conditions_are_rejected() {
        for src in ["", "steps.a &&", "(input.x", "input.x == 'open", "foo.bar", "input.x = 1", "1 2"] {
            assert!(Condition::parse(src).is_err(), "{src:?} should not parse");
        }
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let nots = format!("{}true", "!".repeat(200_000));
        assert!(Condition::parse(&nots).unwrap_err().contains("too long"));

        let parens = format!("{}true{}", "(".repeat(65), ")".repeat(65));
        assert!(Condition::parse(&parens).unwrap_err().contains("nested too deeply"));
        let nots = format!("{}true", "!".repeat(65));
        assert!(Condition::parse(&nots).unwrap_err().contains("nested too deeply"));

        let chain = vec!["true"; 600].join(" && ");
        assert!(Condition::parse(&chain).unwrap_err().contains("too long"));

        let ok = format!("{}true{}", "(".repeat(64), ")".repeat(64));
        assert!(Condition::parse(&ok).unwrap().evaluate(&scope()));
    }

    #[test]
    fn literal_conditions() {
        assert!(Condition::literal(true).evaluate(&scope()));
        assert!(!Condition::literal(false).evaluate(&scope()));
        assert!(eval("-1 < 0"));
    }
}
