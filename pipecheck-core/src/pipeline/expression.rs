//! Row-wise arithmetic expressions over input columns.
//!
//! The expression text uses the subset of Python understood here: numeric
//! literals, column references `X[i]`, the operators `+ - * / **`, the
//! comparisons `< <= > >= == !=` (yielding 1.0 / 0.0), parentheses, and
//! one-argument calls into `numpy` / `math` such as `numpy.exp(X[0])`.
//!
//! Precedence, loosest first: comparison, `+ -`, `* /`, unary `- +`, `**`.
//! `**` is right-associative and binds tighter than a unary minus on its left,
//! so `-X[0] ** 2` is `-(X[0] ** 2)`.

use super::Transformer;
use crate::compiler::{DocumentEncoder, Feature};
use crate::document::{Expression, Function};
use crate::error::{CompileError, DecodeError, EvaluationError};
use crate::evaluator::apply;
use crate::graph::{MAX_DEPTH, ObjectState};
use crate::registry::{Constructed, TypeRegistry};
use crate::types::{Datum, OpType};
use std::sync::Arc;

pub const EXPRESSION_TRANSFORMER: &str = "sklearn2pmml.preprocessing.ExpressionTransformer";

/// Column indices must stay below this bound.
const MAX_COLUMN: f64 = u32::MAX as f64;

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Constant(f64),
    Column(usize),
    Apply(Function, Vec<Expr>),
}

impl Expr {
    /// Evaluate over a numeric row; `None` is a missing value and propagates.
    pub fn eval(&self, row: &[Option<f64>]) -> Option<f64> {
        match self {
            Expr::Constant(v) => Some(*v),
            Expr::Column(i) => row.get(*i).copied().flatten(),
            Expr::Apply(function, arguments) => {
                let args: Option<Vec<f64>> = arguments.iter().map(|a| a.eval(row)).collect();
                args.map(|args| apply(*function, &args))
            }
        }
    }

    /// Number of columns the expression needs (highest index + 1).
    pub fn width(&self) -> usize {
        match self {
            Expr::Constant(_) => 0,
            Expr::Column(i) => i.saturating_add(1),
            Expr::Apply(_, arguments) => arguments.iter().map(Expr::width).max().unwrap_or(0),
        }
    }

    fn to_document(&self, features: &[Feature]) -> Expression {
        match self {
            Expr::Constant(v) => Expression::constant(*v),
            Expr::Column(i) => features[*i].expression(),
            Expr::Apply(function, arguments) => Expression::apply(
                *function,
                arguments.iter().map(|a| a.to_document(features)).collect(),
            ),
        }
    }
}

/// A single-output transformer computing an expression per row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionTransformer {
    source: String,
    expr: Expr,
}

impl ExpressionTransformer {
    pub fn parse(source: &str) -> Result<Self, DecodeError> {
        let expr = Parser::new(source)?.parse()?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        _registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let source = state.string("expr")?;
        Ok(Constructed::Transformer(Arc::new(Self::parse(&source)?)))
    }
}

impl Transformer for ExpressionTransformer {
    fn type_name(&self) -> &'static str {
        EXPRESSION_TRANSFORMER
    }

    fn transform(&self, row: &[Datum]) -> Result<Vec<Datum>, EvaluationError> {
        let width = self.expr.width();
        if row.len() < width {
            return Err(EvaluationError::ShapeMismatch {
                expected: width,
                actual: row.len(),
            });
        }
        let values = row
            .iter()
            .map(|d| d.to_number(EXPRESSION_TRANSFORMER))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(vec![Datum::from(self.expr.eval(&values))])
    }

    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Vec<Feature>, CompileError> {
        let width = self.expr.width();
        if features.len() < width {
            return Err(CompileError::FeatureMismatch {
                step: step.to_string(),
                message: format!(
                    "expression '{}' reads X[{}] but only {} features are available",
                    self.source,
                    width - 1,
                    features.len()
                ),
            });
        }
        for feature in &features[..width] {
            feature.require_continuous(step)?;
        }
        let expression = self.expr.to_document(&features);
        Ok(vec![encoder.derive(step, OpType::Continuous, expression)])
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    Compare(Function),
    End,
}

fn syntax(position: usize, message: impl Into<String>) -> DecodeError {
    DecodeError::Expression {
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, DecodeError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let column = i + 1;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            if i < chars.len() && matches!(chars[i], 'e' | 'E') {
                let mut j = i + 1;
                if j < chars.len() && matches!(chars[j], '+' | '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| syntax(column, format!("invalid number '{text}'")))?;
            tokens.push((column, Token::Number(value)));
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.')) {
                i += 1;
            }
            tokens.push((column, Token::Ident(chars[start..i].iter().collect())));
            continue;
        }
        let next = chars.get(i + 1).copied();
        let (token, len) = match (c, next) {
            ('*', Some('*')) => (Token::StarStar, 2),
            ('<', Some('=')) => (Token::Compare(Function::LessOrEqual), 2),
            ('>', Some('=')) => (Token::Compare(Function::GreaterOrEqual), 2),
            ('=', Some('=')) => (Token::Compare(Function::Equal), 2),
            ('!', Some('=')) => (Token::Compare(Function::NotEqual), 2),
            ('<', _) => (Token::Compare(Function::LessThan), 1),
            ('>', _) => (Token::Compare(Function::GreaterThan), 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            _ => return Err(syntax(column, format!("unexpected character '{c}'"))),
        };
        tokens.push((column, token));
        i += len;
    }
    tokens.push((chars.len() + 1, Token::End));
    Ok(tokens)
}

fn function(name: &str) -> Option<Function> {
    let bare = ["numpy.", "np.", "math."]
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))?;
    Some(match bare {
        "exp" => Function::Exp,
        "log" => Function::Ln,
        "log10" => Function::Log10,
        "sqrt" => Function::Sqrt,
        "sin" => Function::Sin,
        "cos" => Function::Cos,
        "tan" => Function::Tan,
        "tanh" => Function::Tanh,
        "arctan" | "atan" => Function::Atan,
        "abs" | "absolute" | "fabs" => Function::Abs,
        _ => return None,
    })
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, DecodeError> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
            depth: 0,
        })
    }

    /// Run `rule` one nesting level deeper, failing past [`MAX_DEPTH`].
    fn nested<T>(
        &mut self,
        rule: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        if self.depth >= MAX_DEPTH {
            return Err(syntax(
                self.column(),
                format!("expression nested deeper than {MAX_DEPTH} levels"),
            ));
        }
        self.depth += 1;
        let result = rule(self);
        self.depth -= 1;
        result
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos].1
    }

    fn column(&self) -> usize {
        self.tokens[self.pos].0
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].1.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), DecodeError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(syntax(self.column(), format!("expected {what}")))
        }
    }

    fn parse(mut self) -> Result<Expr, DecodeError> {
        let expr = self.comparison()?;
        if *self.peek() != Token::End {
            return Err(syntax(self.column(), "unexpected trailing input"));
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> Result<Expr, DecodeError> {
        self.nested(Self::comparison_inner)
    }

    fn comparison_inner(&mut self) -> Result<Expr, DecodeError> {
        let left = self.additive()?;
        if let Token::Compare(function) = *self.peek() {
            self.advance();
            let right = self.additive()?;
            if matches!(self.peek(), Token::Compare(_)) {
                return Err(syntax(self.column(), "chained comparisons are not supported"));
            }
            return Ok(Expr::Apply(function, vec![left, right]));
        }
        Ok(left)
    }

    fn additive(&mut self) -> Result<Expr, DecodeError> {
        let mut left = self.multiplicative()?;
        loop {
            let function = match self.peek() {
                Token::Plus => Function::Add,
                Token::Minus => Function::Subtract,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::Apply(function, vec![left, right]);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, DecodeError> {
        let mut left = self.unary()?;
        loop {
            let function = match self.peek() {
                Token::Star => Function::Multiply,
                Token::Slash => Function::Divide,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::Apply(function, vec![left, right]);
        }
    }

    fn unary(&mut self) -> Result<Expr, DecodeError> {
        self.nested(Self::unary_inner)
    }

    fn unary_inner(&mut self) -> Result<Expr, DecodeError> {
        match self.peek() {
            Token::Minus => {
                self.advance();
                Ok(Expr::Apply(Function::Negate, vec![self.unary()?]))
            }
            Token::Plus => {
                self.advance();
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, DecodeError> {
        let base = self.primary()?;
        if *self.peek() == Token::StarStar {
            self.advance();
            let exponent = self.unary()?;
            return Ok(Expr::Apply(Function::Pow, vec![base, exponent]));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, DecodeError> {
        let column = self.column();
        match self.advance() {
            Token::Number(v) => Ok(Expr::Constant(v)),
            Token::LParen => {
                let inner = self.comparison()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) if name == "X" => {
                self.expect(Token::LBracket, "'[' after X")?;
                let index_column = self.column();
                let index = match self.advance() {
                    Token::Number(v) if v >= 0.0 && v.fract() == 0.0 && v < MAX_COLUMN => v as usize,
                    Token::Number(v) if v >= MAX_COLUMN => {
                        return Err(syntax(index_column, format!("column index {v} is out of range")));
                    }
                    _ => return Err(syntax(index_column, "column index must be a non-negative integer")),
                };
                self.expect(Token::RBracket, "']'")?;
                Ok(Expr::Column(index))
            }
            Token::Ident(name) => {
                let function = function(&name)
                    .ok_or_else(|| syntax(column, format!("unknown function '{name}'")))?;
                self.expect(Token::LParen, "'(' after function name")?;
                let argument = self.comparison()?;
                if *self.peek() == Token::Comma {
                    return Err(syntax(self.column(), format!("'{name}' takes one argument")));
                }
                self.expect(Token::RParen, "')'")?;
                Ok(Expr::Apply(function, vec![argument]))
            }
            Token::End => Err(syntax(column, "unexpected end of expression")),
            other => Err(syntax(column, format!("unexpected token {other:?}"))),
        }
    }
}
