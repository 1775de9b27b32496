//! Arithmetic evaluation by precedence climbing.
//!
//! Grammar: numbers, `+ - * / %`, right-associative `^`, unary minus and
//! parentheses. Evaluation errors are reported as tool failures so the
//! model can correct the expression on its next turn.

use async_trait::async_trait;
use kestrel_core::error::ToolError;
use kestrel_core::tool::{Tool, ToolContext};

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Supports + - * / % ^, parentheses, and decimals."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Expression to evaluate, e.g. '(2 + 3) * 4 ^ 2'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let expression = input
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'expression' string".into()))?;

        let value = evaluate(expression).map_err(|e| ToolError::ExecutionFailed {
            tool_name: self.name().to_string(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::json!({ "expression": expression, "result": value }))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),

    #[error("malformed number '{0}'")]
    BadNumber(String),

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unexpected token {0}")]
    UnexpectedToken(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("result is not a finite number")]
    NotFinite,

    #[error("expression nests deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

/// Nesting limit for parentheses, unary minus and `^` chains.
const MAX_DEPTH: usize = 64;

pub fn evaluate(expression: &str) -> Result<f64, EvalError> {
    let tokens = lex(expression)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
    };
    let value = parser.expr(0)?;
    if let Some(tok) = parser.tokens.get(parser.pos) {
        return Err(EvalError::UnexpectedToken(tok.describe()));
    }
    if !value.is_finite() {
        return Err(EvalError::NotFinite);
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tok {
    Num(f64),
    Op(char),
    Open,
    Close,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Num(n) => n.to_string(),
            Tok::Op(c) => format!("'{c}'"),
            Tok::Open => "'('".into(),
            Tok::Close => "')'".into(),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Tok>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((start, c)) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '+' | '-' | '*' | '/' | '%' | '^' => tokens.push(Tok::Op(c)),
            '(' => tokens.push(Tok::Open),
            ')' => tokens.push(Tok::Close),
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_digit() || d == '.') {
                        break;
                    }
                    end = i + d.len_utf8();
                    chars.next();
                }
                let text = &input[start..end];
                let n = text
                    .parse()
                    .map_err(|_| EvalError::BadNumber(text.to_string()))?;
                tokens.push(Tok::Num(n));
            }
            other => return Err(EvalError::UnexpectedChar(other)),
        }
    }
    Ok(tokens)
}

/// Binding power and right-associativity for a binary operator.
fn binding(op: char) -> Option<(u8, bool)> {
    match op {
        '+' | '-' => Some((1, false)),
        '*' | '/' | '%' => Some((2, false)),
        '^' => Some((3, true)),
        _ => None,
    }
}

struct Parser<'a> {
    tokens: &'a [Tok],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).copied();
        self.pos += usize::from(tok.is_some());
        tok
    }

    fn expr(&mut self, min_power: u8) -> Result<f64, EvalError> {
        if self.depth >= MAX_DEPTH {
            return Err(EvalError::TooDeep);
        }
        self.depth += 1;
        let value = self.climb(min_power);
        self.depth -= 1;
        value
    }

    fn climb(&mut self, min_power: u8) -> Result<f64, EvalError> {
        let mut lhs = self.operand()?;

        while let Some(Tok::Op(op)) = self.tokens.get(self.pos).copied() {
            let Some((power, right_assoc)) = binding(op) else {
                break;
            };
            if power < min_power {
                break;
            }
            self.pos += 1;
            let rhs = self.expr(if right_assoc { power } else { power + 1 })?;
            lhs = apply(op, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<f64, EvalError> {
        match self.advance() {
            Some(Tok::Num(n)) => Ok(n),
            // Unary minus binds tighter than * but looser than ^
            Some(Tok::Op('-')) => Ok(-self.expr(3)?),
            Some(Tok::Open) => {
                let inner = self.expr(0)?;
                match self.advance() {
                    Some(Tok::Close) => Ok(inner),
                    Some(tok) => Err(EvalError::UnexpectedToken(tok.describe())),
                    None => Err(EvalError::UnexpectedEnd),
                }
            }
            Some(tok) => Err(EvalError::UnexpectedToken(tok.describe())),
            None => Err(EvalError::UnexpectedEnd),
        }
    }
}

fn apply(op: char, lhs: f64, rhs: f64) -> Result<f64, EvalError> {
    Ok(match op {
        '+' => lhs + rhs,
        '-' => lhs - rhs,
        '*' => lhs * rhs,
        '/' | '%' if rhs == 0.0 => return Err(EvalError::DivisionByZero),
        '/' => lhs / rhs,
        '%' => lhs % rhs,
        '^' => lhs.powf(rhs),
        other => return Err(EvalError::UnexpectedToken(format!("'{other}'"))),
    })
}
