//! Boolean expression language used by routing rules.
//!
//! Expressions are evaluated against [`EvalEnv`] and support literals
//! (integer, float, single- or double-quoted string, `true`, `false`),
//! identifier references to the environment fields, parentheses, `&&`/`||`,
//! and the comparisons `== != < <= > >=`. Programs compile once at startup
//! and are reused for every request.

use thiserror::Error;

/// The bindings visible to rule expressions, referenced by field name.
#[derive(Clone, Debug, Default)]
pub struct EvalEnv {
    pub token_count: i64,
    pub model: String,
    pub path: String,
}

impl EvalEnv {
    fn lookup(&self, name: &str) -> Option<Value> {
        match name {
            "TokenCount" => Some(Value::Int(self.token_count)),
            "Model" => Some(Value::Str(self.model.clone())),
            "Path" => Some(Value::Str(self.path.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
    #[error("unexpected token {0}")]
    UnexpectedToken(String),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("unknown identifier {0}")]
    UnboundIdentifier(String),
    #[error("cannot compare {0} and {1} with {2}")]
    TypeMismatch(&'static str, &'static str, &'static str),
    #[error("rule did not evaluate to a boolean")]
    NotBoolean,
}

#[derive(Clone, Debug, PartialEq)]
enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Truthiness for logical operators: non-zero number, non-empty string,
    /// the boolean itself.
    fn truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(v) => !v.is_empty(),
            Value::Bool(v) => *v,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    And,
    Or,
    Cmp(CmpOp),
    LParen,
    RParen,
}

#[derive(Clone, Debug)]
enum Expr {
    Lit(Value),
    Ident(String),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A compiled rule expression.
#[derive(Clone, Debug)]
pub struct Program {
    expr: Expr,
    source: String,
}

impl Program {
    pub fn compile(source: &str) -> Result<Self, CompileError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(CompileError::UnexpectedToken(format!("{token:?}")));
        }
        Ok(Program {
            expr,
            source: source.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the program; the result must be a boolean.
    pub fn eval(&self, env: &EvalEnv) -> Result<bool, EvalError> {
        match eval_expr(&self.expr, env)? {
            Value::Bool(value) => Ok(value),
            _ => Err(EvalError::NotBoolean),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, CompileError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        match ch {
            ' ' | '\t' | '\r' | '\n' => pos += 1,
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            '&' if chars.get(pos + 1) == Some(&'&') => {
                tokens.push(Token::And);
                pos += 2;
            }
            '|' if chars.get(pos + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                pos += 2;
            }
            '=' if chars.get(pos + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                pos += 2;
            }
            '!' if chars.get(pos + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                pos += 2;
            }
            '<' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Le));
                    pos += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Lt));
                    pos += 1;
                }
            }
            '>' => {
                if chars.get(pos + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ge));
                    pos += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Gt));
                    pos += 1;
                }
            }
            '\'' | '"' => {
                let quote = ch;
                let mut value = String::new();
                let mut cursor = pos + 1;
                loop {
                    match chars.get(cursor) {
                        Some(&c) if c == quote => break,
                        Some(&c) => {
                            value.push(c);
                            cursor += 1;
                        }
                        None => return Err(CompileError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(value));
                pos = cursor + 1;
            }
            '0'..='9' => {
                let start = pos;
                let mut is_float = false;
                while pos < chars.len() {
                    match chars[pos] {
                        '0'..='9' => pos += 1,
                        '.' if !is_float => {
                            is_float = true;
                            pos += 1;
                        }
                        _ => break,
                    }
                }
                let text: String = chars[start..pos].iter().collect();
                if is_float {
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| CompileError::InvalidNumber(text.clone()))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value = text
                        .parse::<i64>()
                        .map_err(|_| CompileError::InvalidNumber(text.clone()))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = pos;
                while pos < chars.len()
                    && (chars[pos].is_alphanumeric() || chars[pos] == '_')
                {
                    pos += 1;
                }
                let text: String = chars[start..pos].iter().collect();
                tokens.push(match text.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(text),
                });
            }
            other => return Err(CompileError::UnexpectedChar(other, pos)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_comparison()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_primary()?;
        if let Some(&Token::Cmp(op)) = self.peek() {
            self.next();
            let rhs = self.parse_primary()?;
            return Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        match self.next() {
            Some(Token::Int(value)) => Ok(Expr::Lit(Value::Int(value))),
            Some(Token::Float(value)) => Ok(Expr::Lit(Value::Float(value))),
            Some(Token::Str(value)) => Ok(Expr::Lit(Value::Str(value))),
            Some(Token::True) => Ok(Expr::Lit(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Lit(Value::Bool(false))),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    Some(token) => Err(CompileError::UnexpectedToken(format!("{token:?}"))),
                    None => Err(CompileError::UnexpectedEnd),
                }
            }
            Some(token) => Err(CompileError::UnexpectedToken(format!("{token:?}"))),
            None => Err(CompileError::UnexpectedEnd),
        }
    }
}

fn eval_expr(expr: &Expr, env: &EvalEnv) -> Result<Value, EvalError> {
    match expr {
        Expr::Lit(value) => Ok(value.clone()),
        Expr::Ident(name) => env
            .lookup(name)
            .ok_or_else(|| EvalError::UnboundIdentifier(name.clone())),
        Expr::And(lhs, rhs) => {
            let lhs = eval_expr(lhs, env)?;
            let rhs = eval_expr(rhs, env)?;
            Ok(Value::Bool(lhs.truthy() && rhs.truthy()))
        }
        Expr::Or(lhs, rhs) => {
            let lhs = eval_expr(lhs, env)?;
            let rhs = eval_expr(rhs, env)?;
            Ok(Value::Bool(lhs.truthy() || rhs.truthy()))
        }
        Expr::Cmp(op, lhs, rhs) => {
            let lhs = eval_expr(lhs, env)?;
            let rhs = eval_expr(rhs, env)?;
            eval_cmp(*op, &lhs, &rhs)
        }
    }
}

fn eval_cmp(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let result = match op {
        CmpOp::Eq | CmpOp::Ne => {
            let equal = match (lhs, rhs) {
                (Value::Str(a), Value::Str(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                _ => match (lhs.as_number(), rhs.as_number()) {
                    (Some(a), Some(b)) => a == b,
                    _ => {
                        return Err(EvalError::TypeMismatch(
                            lhs.kind(),
                            rhs.kind(),
                            op.symbol(),
                        ));
                    }
                },
            };
            if op == CmpOp::Eq { equal } else { !equal }
        }
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
                return Err(EvalError::TypeMismatch(
                    lhs.kind(),
                    rhs.kind(),
                    op.symbol(),
                ));
            };
            match op {
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
                _ => unreachable!(),
            }
        }
    };
    Ok(Value::Bool(result))
}
