//! Restricted condition language for workflow branches.
//!
//! Grammar (no function calls beyond `exists`, no arithmetic, no assignment):
//!
//! ```text
//! expr    := and ( "||" and )*
//! and     := unary ( "&&" unary )*
//! unary   := "!" unary | "(" expr ")" | "exists" "(" path ")" | compare
//! compare := operand ( ( "==" | "!=" | ">" | ">=" | "<" | "<=" ) operand
//!                    | "in" ( "[" literal ( "," literal )* "]" | path ) )?
//! operand := literal | path
//! literal := number | 'string' | "string" | true | false | null
//! ```
//!
//! Paths are evaluated against the step's parsed response. A leading `$.` or `response.`
//! is accepted and ignored. A bare path tests truthiness.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::utils::json_path::{compare, is_truthy, loose_eq, PathMapper, Segment};

/// Longest accepted condition source, in bytes.
pub const MAX_CONDITION_LEN: usize = 4096;
/// Deepest accepted nesting of `(` and `!`.
pub const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("empty condition")]
    Empty,
    #[error("unexpected end of condition")]
    UnexpectedEnd,
    #[error("unexpected '{token}' at offset {offset}")]
    Unexpected { token: String, offset: usize },
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
    #[error("invalid path '{0}'")]
    InvalidPath(String),
    #[error("condition is {len} bytes; the limit is {limit}")]
    TooLong { len: usize, limit: usize },
    #[error("condition nests deeper than {0} levels")]
    TooDeep(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path { raw: String, segments: Vec<Segment> },
}

impl Operand {
    fn value<'a>(&'a self, root: &'a Value) -> Option<&'a Value> {
        match self {
            Operand::Literal(v) => Some(v),
            Operand::Path { segments, .. } => PathMapper::resolve(root, segments),
        }
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Exists(Operand),
    Compare { lhs: Operand, op: CmpOp, rhs: Operand },
    InList { lhs: Operand, items: Vec<Value> },
    InPath { lhs: Operand, rhs: Operand },
    Truthy(Operand),
}

impl Condition {
    pub fn parse(src: &str) -> Result<Condition, ConditionError> {
        if src.len() > MAX_CONDITION_LEN {
            return Err(ConditionError::TooLong {
                len: src.len(),
                limit: MAX_CONDITION_LEN,
            });
        }
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }
        let mut p = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let cond = p.expr()?;
        match p.peek() {
            None => Ok(cond),
            Some(t) => Err(t.unexpected()),
        }
    }

    /// Evaluate against a parsed response. Missing paths read as `null`.
    pub fn evaluate(&self, root: &Value) -> bool {
        match self {
            Condition::Or(a, b) => a.evaluate(root) || b.evaluate(root),
            Condition::And(a, b) => a.evaluate(root) && b.evaluate(root),
            Condition::Not(c) => !c.evaluate(root),
            Condition::Exists(op) => op.value(root).is_some(),
            Condition::Truthy(op) => op.value(root).map(is_truthy).unwrap_or(false),
            Condition::Compare { lhs, op, rhs } => {
                let l = lhs.value(root).unwrap_or(&Value::Null);
                let r = rhs.value(root).unwrap_or(&Value::Null);
                match op {
                    CmpOp::Eq => loose_eq(l, r),
                    CmpOp::Ne => !loose_eq(l, r),
                    CmpOp::Gt => compare(l, r) == Some(Ordering::Greater),
                    CmpOp::Ge => matches!(compare(l, r), Some(Ordering::Greater | Ordering::Equal)),
                    CmpOp::Lt => compare(l, r) == Some(Ordering::Less),
                    CmpOp::Le => matches!(compare(l, r), Some(Ordering::Less | Ordering::Equal)),
                }
            }
            Condition::InList { lhs, items } => {
                let l = lhs.value(root).unwrap_or(&Value::Null);
                items.iter().any(|v| loose_eq(l, v))
            }
            Condition::InPath { lhs, rhs } => {
                let l = lhs.value(root).unwrap_or(&Value::Null);
                match rhs.value(root) {
                    Some(Value::Array(items)) => items.iter().any(|v| loose_eq(l, v)),
                    Some(Value::String(s)) => l.as_str().map(|needle| s.contains(needle)).unwrap_or(false),
                    Some(Value::Object(map)) => l.as_str().map(|k| map.contains_key(k)).unwrap_or(false),
                    _ => false,
                }
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::Path { raw, .. } => f.write_str(raw),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Or(a, b) => write!(f, "({} || {})", a, b),
            Condition::And(a, b) => write!(f, "({} && {})", a, b),
            Condition::Not(c) => write!(f, "!{}", c),
            Condition::Exists(op) => write!(f, "exists({})", op),
            Condition::Truthy(op) => write!(f, "{}", op),
            Condition::Compare { lhs, op, rhs } => write!(f, "{} {} {}", lhs, op.as_str(), rhs),
            Condition::InList { lhs, items } => {
                let items: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{} in [{}]", lhs, items.join(", "))
            }
            Condition::InPath { lhs, rhs } => write!(f, "{} in {}", lhs, rhs),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Not,
    And,
    Or,
    Cmp(CmpOp),
    Str(String),
    Num(Value),
    Ident(String),
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
    text: String,
}

impl Token {
    fn unexpected(&self) -> ConditionError {
        ConditionError::Unexpected {
            token: self.text.clone(),
            offset: self.offset,
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '$')
}

fn tokenize(src: &str) -> Result<Vec<Token>, ConditionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut out = Vec::new();
    let mut i = 0;

    let push = |out: &mut Vec<Token>, tok: Tok, offset: usize, text: &str| {
        out.push(Token {
            tok,
            offset,
            text: text.to_string(),
        })
    };

    while i < chars.len() {
        let (off, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => { push(&mut out, Tok::LParen, off, "("); i += 1; }
            ')' => { push(&mut out, Tok::RParen, off, ")"); i += 1; }
            '[' => { push(&mut out, Tok::LBracket, off, "["); i += 1; }
            ']' => { push(&mut out, Tok::RBracket, off, "]"); i += 1; }
            ',' => { push(&mut out, Tok::Comma, off, ","); i += 1; }
            '&' if next == Some('&') => { push(&mut out, Tok::And, off, "&&"); i += 2; }
            '|' if next == Some('|') => { push(&mut out, Tok::Or, off, "||"); i += 2; }
            '=' if next == Some('=') => { push(&mut out, Tok::Cmp(CmpOp::Eq), off, "=="); i += 2; }
            '!' if next == Some('=') => { push(&mut out, Tok::Cmp(CmpOp::Ne), off, "!="); i += 2; }
            '!' => { push(&mut out, Tok::Not, off, "!"); i += 1; }
            '>' if next == Some('=') => { push(&mut out, Tok::Cmp(CmpOp::Ge), off, ">="); i += 2; }
            '>' => { push(&mut out, Tok::Cmp(CmpOp::Gt), off, ">"); i += 1; }
            '<' if next == Some('=') => { push(&mut out, Tok::Cmp(CmpOp::Le), off, "<="); i += 2; }
            '<' => { push(&mut out, Tok::Cmp(CmpOp::Lt), off, "<"); i += 1; }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let (_, ch) = chars[j];
                    if ch == '\\' && j + 1 < chars.len() {
                        s.push(chars[j + 1].1);
                        j += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    s.push(ch);
                    j += 1;
                }
                if !closed {
                    return Err(ConditionError::UnterminatedString(off));
                }
                let end = chars.get(j + 1).map(|(o, _)| *o).unwrap_or(src.len());
                push(&mut out, Tok::Str(s), off, &src[off..end]);
                i = j + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.map(|n| n.is_ascii_digit()).unwrap_or(false)) => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || matches!(chars[j].1, '.' | 'e' | 'E' | '+' | '-')) {
                    // '+'/'-' only directly after an exponent marker
                    if matches!(chars[j].1, '+' | '-') && !matches!(chars[j - 1].1, 'e' | 'E') {
                        break;
                    }
                    j += 1;
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(src.len());
                let text = &src[off..end];
                let value: Value = serde_json::from_str(text).map_err(|_| ConditionError::Unexpected {
                    token: text.to_string(),
                    offset: off,
                })?;
                push(&mut out, Tok::Num(value), off, text);
                i = j;
            }
            c if is_ident_start(c) => {
                let mut j = i + 1;
                while j < chars.len() {
                    let ch = chars[j].1;
                    if is_ident_char(ch) {
                        j += 1;
                    } else if ch == '[' && &src[off..chars[j].0] != "in" {
                        // index suffix belongs to the path
                        let mut k = j + 1;
                        while k < chars.len() && chars[k].1 != ']' {
                            k += 1;
                        }
                        if k >= chars.len() {
                            break;
                        }
                        j = k + 1;
                    } else {
                        break;
                    }
                }
                let end = chars.get(j).map(|(o, _)| *o).unwrap_or(src.len());
                let text = &src[off..end];
                push(&mut out, Tok::Ident(text.to_string()), off, text);
                i = j;
            }
            other => {
                return Err(ConditionError::Unexpected {
                    token: other.to_string(),
                    offset: off,
                })
            }
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, ConditionError> {
        let t = self.tokens.get(self.pos).cloned().ok_or(ConditionError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(t)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek().map(|t| &t.tok == tok).unwrap_or(false) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok) -> Result<(), ConditionError> {
        let t = self.next()?;
        if t.tok == tok {
            Ok(())
        } else {
            Err(t.unexpected())
        }
    }

    fn expr(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.and()?;
        while self.eat(&Tok::Or) {
            let rhs = self.and()?;
            lhs = Condition::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Condition, ConditionError> {
        let mut lhs = self.unary()?;
        while self.eat(&Tok::And) {
            let rhs = self.unary()?;
            lhs = Condition::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ConditionError>) -> Result<T, ConditionError> {
        if self.depth >= MAX_NESTING {
            return Err(ConditionError::TooDeep(MAX_NESTING));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn unary(&mut self) -> Result<Condition, ConditionError> {
        if self.eat(&Tok::Not) {
            let inner = self.nested(Self::unary)?;
            return Ok(Condition::Not(Box::new(inner)));
        }
        if self.eat(&Tok::LParen) {
            let inner = self.nested(Self::expr)?;
            self.expect(Tok::RParen)?;
            return Ok(inner);
        }
        let is_exists = matches!(self.peek(), Some(Token { tok: Tok::Ident(name), .. }) if name == "exists")
            && matches!(self.tokens.get(self.pos + 1), Some(Token { tok: Tok::LParen, .. }));
        if is_exists {
            self.pos += 2;
            let t = self.next()?;
            let operand = match &t.tok {
                Tok::Ident(raw) => path_operand(raw)?,
                _ => return Err(t.unexpected()),
            };
            self.expect(Tok::RParen)?;
            return Ok(Condition::Exists(operand));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Condition, ConditionError> {
        let lhs = self.operand()?;
        let next = self.peek().map(|t| t.tok.clone());
        let op = match next {
            Some(Tok::Cmp(op)) => op,
            Some(Tok::Ident(word)) if word == "in" => {
                self.pos += 1;
                if self.eat(&Tok::LBracket) {
                    let mut items = Vec::new();
                    if !self.eat(&Tok::RBracket) {
                        loop {
                            let t = self.next()?;
                            items.push(literal(&t).ok_or_else(|| t.unexpected())?);
                            if self.eat(&Tok::RBracket) {
                                break;
                            }
                            self.expect(Tok::Comma)?;
                        }
                    }
                    return Ok(Condition::InList { lhs, items });
                }
                let rhs = self.operand()?;
                return Ok(Condition::InPath { lhs, rhs });
            }
            _ => return Ok(Condition::Truthy(lhs)),
        };
        self.pos += 1;
        let rhs = self.operand()?;
        Ok(Condition::Compare { lhs, op, rhs })
    }

    fn operand(&mut self) -> Result<Operand, ConditionError> {
        let t = self.next()?;
        if let Some(v) = literal(&t) {
            return Ok(Operand::Literal(v));
        }
        match &t.tok {
            Tok::Ident(raw) if raw != "in" && raw != "exists" => path_operand(raw),
            _ => Err(t.unexpected()),
        }
    }
}

fn literal(t: &Token) -> Option<Value> {
    match &t.tok {
        Tok::Str(s) => Some(Value::String(s.clone())),
        Tok::Num(n) => Some(n.clone()),
        Tok::Ident(w) if w == "true" => Some(Value::Bool(true)),
        Tok::Ident(w) if w == "false" => Some(Value::Bool(false)),
        Tok::Ident(w) if w == "null" => Some(Value::Null),
        _ => None,
    }
}

fn path_operand(raw: &str) -> Result<Operand, ConditionError> {
    let trimmed = raw.strip_prefix("$.").unwrap_or(raw);
    let trimmed = trimmed.strip_prefix("response.").unwrap_or(trimmed);
    let trimmed = if trimmed == "response" { "$" } else { trimmed };
    let segments = PathMapper::parse(trimmed).map_err(|_| ConditionError::InvalidPath(raw.to_string()))?;
    Ok(Operand::Path {
        raw: raw.to_string(),
        segments,
    })
}
