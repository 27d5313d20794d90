//! Small typed expression evaluator for rule conditions.
//!
//! The original source evaluates configured conditions with the host language's
//! generic `eval()` restricted to two bindings, which is not a safe sandbox. This
//! module replaces that with a hand-written recursive-descent parser and a
//! tree-walking evaluator over exactly two bindings, `topic` (a string) and
//! `payload` (a string or a JSON value): equality, comparison, boolean
//! connectives, membership, and field/index access. There is no host
//! capability reachable from a condition string.
//!
//! Syntax: `payload.level > 5`, `topic == "ctl/x" && payload["armed"]`,
//! `"a" in payload.tags`, `!(payload.level > 5)`.

use serde_json::Value as Json;
use std::fmt;

#[derive(Debug)]
pub enum ExprError {
    Syntax(String),
    Type(String),
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprError::Syntax(msg) => write!(f, "syntax error: {msg}"),
            ExprError::Type(msg) => write!(f, "type error: {msg}"),
        }
    }
}

impl std::error::Error for ExprError {}

/// The two bindings a condition may reference.
pub struct Bindings<'a> {
    pub topic: &'a str,
    pub payload: &'a Json,
}

/// Parse `source` once and evaluate it against `bindings`, returning truthiness.
///
/// Any syntax or type error is reported to the caller as an `ExprError`; the
/// rule engine treats both as a non-match.
pub fn eval_condition(source: &str, bindings: &Bindings<'_>) -> Result<bool, ExprError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens: &tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    parser.expect_end()?;
    Ok(truthy(&eval(&expr, bindings)?))
}

// ---- lexer ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Null,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    In,
}

fn lex(source: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ExprError::Syntax("unterminated string".into())),
                        Some(q) if *q == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::Syntax(format!("invalid number '{text}'")))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" | "none" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ExprError::Syntax(format!("unexpected character '{other}'"))),
        }
    }

    Ok(tokens)
}

// ---- AST ----

#[derive(Debug, Clone)]
enum Expr {
    Topic,
    Payload,
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    In(Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

// ---- parser (recursive descent, lowest to highest precedence) ----

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        self.pos += 1;
        tok
    }

    fn expect_end(&self) -> Result<(), ExprError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ExprError::Syntax("unexpected trailing input".into()))
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.parse_primary_chain()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CmpOp::Eq),
            Some(Token::Ne) => Some(CmpOp::Ne),
            Some(Token::Lt) => Some(CmpOp::Lt),
            Some(Token::Le) => Some(CmpOp::Le),
            Some(Token::Gt) => Some(CmpOp::Gt),
            Some(Token::Ge) => Some(CmpOp::Ge),
            Some(Token::In) => {
                self.advance();
                let rhs = self.parse_primary_chain()?;
                return Ok(Expr::In(Box::new(lhs), Box::new(rhs)));
            }
            _ => None,
        };

        match op {
            Some(op) => {
                self.advance();
                let rhs = self.parse_primary_chain()?;
                Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
            }
            None => Ok(lhs),
        }
    }

    fn parse_primary_chain(&mut self) -> Result<Expr, ExprError> {
        let mut node = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(name)) => {
                            node = Expr::Field(Box::new(node), name.clone());
                        }
                        _ => return Err(ExprError::Syntax("expected field name after '.'".into())),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_expr()?;
                    match self.advance() {
                        Some(Token::RBracket) => {}
                        _ => return Err(ExprError::Syntax("expected ']'".into())),
                    }
                    node = Expr::Index(Box::new(node), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Ident(name)) if name == "topic" => Ok(Expr::Topic),
            Some(Token::Ident(name)) if name == "payload" => Ok(Expr::Payload),
            Some(Token::Ident(name)) => Err(ExprError::Syntax(format!("unknown binding '{name}'"))),
            Some(Token::Str(s)) => Ok(Expr::Str(s.clone())),
            Some(Token::Num(n)) => Ok(Expr::Num(*n)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExprError::Syntax("expected ')'".into())),
                }
            }
            other => Err(ExprError::Syntax(format!("unexpected token {other:?}"))),
        }
    }
}

// ---- evaluator ----

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
    Json(Json),
    Null,
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Str(s) => !s.is_empty(),
        Value::Num(n) => *n != 0.0,
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Json(j) => json_truthy(j),
    }
}

fn json_truthy(j: &Json) -> bool {
    match j {
        Json::Null => false,
        Json::Bool(b) => *b,
        Json::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Json::String(s) => !s.is_empty(),
        Json::Array(a) => !a.is_empty(),
        Json::Object(o) => !o.is_empty(),
    }
}

fn json_of(v: &Value) -> Json {
    match v {
        Value::Str(s) => Json::String(s.clone()),
        Value::Num(n) => serde_json::Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null),
        Value::Bool(b) => Json::Bool(*b),
        Value::Json(j) => j.clone(),
        Value::Null => Json::Null,
    }
}

fn eval(expr: &Expr, bindings: &Bindings<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Topic => Ok(Value::Str(bindings.topic.to_string())),
        Expr::Payload => Ok(value_from_json(bindings.payload)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, bindings)?))),
        Expr::And(lhs, rhs) => {
            let l = eval(lhs, bindings)?;
            if !truthy(&l) {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(truthy(&eval(rhs, bindings)?)))
        }
        Expr::Or(lhs, rhs) => {
            let l = eval(lhs, bindings)?;
            if truthy(&l) {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(truthy(&eval(rhs, bindings)?)))
        }
        Expr::Field(base, name) => {
            let base = eval(base, bindings)?;
            let json = json_of(&base);
            match json.get(name) {
                Some(v) => Ok(value_from_json(v)),
                None => Err(ExprError::Type(format!("no field '{name}'"))),
            }
        }
        Expr::Index(base, index) => {
            let base = eval(base, bindings)?;
            let index = eval(index, bindings)?;
            let json = json_of(&base);
            let result = match index {
                Value::Num(n) => json.get(n as usize),
                Value::Str(s) => json.get(&s),
                _ => None,
            };
            match result {
                Some(v) => Ok(value_from_json(v)),
                None => Err(ExprError::Type("index out of range or not present".into())),
            }
        }
        Expr::Cmp(op, lhs, rhs) => {
            let l = eval(lhs, bindings)?;
            let r = eval(rhs, bindings)?;
            Ok(Value::Bool(compare(*op, &l, &r)?))
        }
        Expr::In(needle, haystack) => {
            let needle = json_of(&eval(needle, bindings)?);
            let haystack = json_of(&eval(haystack, bindings)?);
            match haystack {
                Json::Array(items) => Ok(Value::Bool(items.contains(&needle))),
                Json::Object(map) => {
                    let key = match &needle {
                        Json::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Ok(Value::Bool(map.contains_key(&key)))
                }
                Json::String(s) => {
                    let needle = match &needle {
                        Json::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    Ok(Value::Bool(s.contains(&needle)))
                }
                _ => Err(ExprError::Type("'in' requires an array, object, or string".into())),
            }
        }
    }
}

fn value_from_json(j: &Json) -> Value {
    match j {
        Json::String(s) => Value::Str(s.clone()),
        Json::Number(n) => Value::Num(n.as_f64().unwrap_or(f64::NAN)),
        Json::Bool(b) => Value::Bool(*b),
        Json::Null => Value::Null,
        other => Value::Json(other.clone()),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, ExprError> {
    use CmpOp::*;

    if matches!(op, Eq | Ne) {
        // equality is defined for every pair via JSON structural equality
        let equal = json_of(lhs) == json_of(rhs);
        return Ok(match op {
            Eq => equal,
            Ne => !equal,
            _ => unreachable!(),
        });
    }

    let (l, r) = match (lhs, rhs) {
        (Value::Num(l), Value::Num(r)) => (*l, *r),
        (Value::Str(l), Value::Str(r)) => {
            return Ok(match op {
                Lt => l < r,
                Le => l <= r,
                Gt => l > r,
                Ge => l >= r,
                Eq | Ne => unreachable!(),
            })
        }
        _ => {
            return Err(ExprError::Type(
                "ordering comparison requires two numbers or two strings".into(),
            ))
        }
    };

    Ok(match op {
        Lt => l < r,
        Le => l <= r,
        Gt => l > r,
        Ge => l >= r,
        Eq | Ne => unreachable!(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(source: &str, topic: &str, payload: Json) -> bool {
        let bindings = Bindings { topic, payload: &payload };
        eval_condition(source, &bindings).expect("condition should evaluate")
    }

    #[test]
    fn comparison_condition_gates_on_numeric_field() {
        assert!(check("payload.level > 5", "ctl/x", json!({"level": 6})));
        assert!(!check("payload.level > 5", "ctl/x", json!({"level": 3})));
    }

    #[test]
    fn topic_equality_and_boolean_connectives() {
        assert!(check("topic == \"ctl/x\" && payload.armed", "ctl/x", json!({"armed": true})));
        assert!(!check("topic == \"ctl/x\" && payload.armed", "ctl/y", json!({"armed": true})));
    }

    #[test]
    fn membership_over_array() {
        assert!(check("\"a\" in payload.tags", "t", json!({"tags": ["a", "b"]})));
        assert!(!check("\"z\" in payload.tags", "t", json!({"tags": ["a", "b"]})));
    }

    #[test]
    fn not_and_parens() {
        assert!(check("!(payload.level > 5)", "t", json!({"level": 1})));
    }

    #[test]
    fn condition_error_on_missing_field_is_not_a_panic() {
        let bindings = Bindings { topic: "t", payload: &json!("a string payload") };
        let result = eval_condition("payload.undef.attr", &bindings);
        assert!(result.is_err());
    }

    #[test]
    fn index_access_into_array() {
        assert!(check("payload[0] == \"first\"", "t", json!(["first", "second"])));
    }

    #[test]
    fn syntax_error_is_reported_not_panicked() {
        let bindings = Bindings { topic: "t", payload: &json!(null) };
        assert!(eval_condition("payload ===", &bindings).is_err());
    }
}
