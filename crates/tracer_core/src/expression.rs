use crate::autodiff::Scalar;
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;

/// OpCodes for the stack-based evaluator.
/// The VM operates on a stack of `Scalar` values (f64 or Jet).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes the variable with the given index onto the stack.
    LoadVar(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    /// Pops top value (a), pushes -a.
    Neg,
}

/// A compiled expression over a fixed list of named variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    ops: Vec<OpCode>,
    max_depth: usize,
}

impl Expression {
    /// Parses `source` and resolves identifiers against `var_names`.
    /// `pi` is recognised as a constant unless it names a variable.
    pub fn parse(source: &str, var_names: &[&str]) -> Result<Self> {
        let ast = parse(source)?;
        Compiler::new(var_names).compile(&ast)
    }

    /// Evaluates the expression with `vars[i]` bound to the `i`th variable.
    ///
    /// Compiled programs never underflow the stack or index past the
    /// variable list they were compiled against; a shorter `vars` yields NaN.
    pub fn evaluate<T: Scalar>(&self, vars: &[T]) -> T {
        let nan = T::constant(f64::NAN);
        let mut stack: Vec<T> = Vec::with_capacity(self.max_depth);
        let pop = |stack: &mut Vec<T>| stack.pop().unwrap_or(nan);

        for op in &self.ops {
            let value = match *op {
                OpCode::LoadConst(val) => T::constant(val),
                OpCode::LoadVar(idx) => vars.get(idx).copied().unwrap_or(nan),
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = pop(&mut stack);
                    let a = pop(&mut stack);
                    match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.pow(b),
                    }
                }
                OpCode::Sin => pop(&mut stack).sin(),
                OpCode::Cos => pop(&mut stack).cos(),
                OpCode::Tan => pop(&mut stack).tan(),
                OpCode::Exp => pop(&mut stack).exp(),
                OpCode::Log => pop(&mut stack).ln(),
                OpCode::Sqrt => pop(&mut stack).sqrt(),
                OpCode::Neg => -pop(&mut stack),
            };
            stack.push(value);
        }

        pop(&mut stack)
    }
}

// --- AST & Parser ---

#[derive(Debug, PartialEq)]
enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>),
    Neg(Box<Expr>),
    Call(String, Box<Expr>),
}

/// Resolves variable names to indices and lowers the AST to postfix ops.
struct Compiler {
    var_map: HashMap<String, usize>,
}

impl Compiler {
    fn new(var_names: &[&str]) -> Self {
        let var_map = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_string(), i))
            .collect();
        Self { var_map }
    }

    fn compile(&self, expr: &Expr) -> Result<Expression> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        let max_depth = stack_depth(&ops);
        Ok(Expression { ops, max_depth })
    }

    fn compile_recursive(&self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<()> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => match self.var_map.get(name) {
                Some(&idx) => ops.push(OpCode::LoadVar(idx)),
                None if name == "pi" => ops.push(OpCode::LoadConst(std::f64::consts::PI)),
                None => bail!("Unknown variable '{name}'."),
            },
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    '+' => OpCode::Add,
                    '-' => OpCode::Sub,
                    '*' => OpCode::Mul,
                    '/' => OpCode::Div,
                    '^' => OpCode::Pow,
                    _ => bail!("Unknown binary operator '{op}'."),
                });
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) => {
                self.compile_recursive(arg, ops)?;
                ops.push(match func.as_str() {
                    "sin" => OpCode::Sin,
                    "cos" => OpCode::Cos,
                    "tan" => OpCode::Tan,
                    "exp" => OpCode::Exp,
                    "log" => OpCode::Log,
                    "sqrt" => OpCode::Sqrt,
                    _ => bail!("Unknown function '{func}'."),
                });
            }
        }
        Ok(())
    }
}

fn stack_depth(ops: &[OpCode]) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for op in ops {
        match op {
            OpCode::LoadConst(_) | OpCode::LoadVar(_) => depth += 1,
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                depth = depth.saturating_sub(1)
            }
            _ => {}
        }
        max = max.max(depth);
    }
    max
}

fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        bail!("Expression is empty.");
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if let Some(token) = parser.peek() {
        bail!("Unexpected trailing {token:?} in '{input}'.");
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                let exponent_sign =
                    (d == '+' || d == '-') && matches!(num_str.chars().last(), Some('e' | 'E'));
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse::<f64>()
                .map_err(|_| anyhow!("Malformed number '{num_str}'."))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            chars.next();
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                // `**` is accepted as a power operator.
                '*' if chars.peek() == Some(&'*') => {
                    chars.next();
                    Token::Caret
                }
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => bail!("Unexpected character '{c}' in '{input}'."),
            };
            tokens.push(token);
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

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<()> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => bail!("Expected ')'."),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;

        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some('+'),
            Some(Token::Minus) => Some('-'),
            _ => None,
        } {
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some('*'),
            Some(Token::Slash) => Some('/'),
            _ => None,
        } {
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Unary minus binds looser than `^`, so `-R^2` is `-(R^2)`.
    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(expr)));
        }
        self.parse_power()
    }

    // Right associative: `2^3^2` is `2^(3^2)`.
    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(token) => bail!("Unexpected {token:?}."),
            None => bail!("Unexpected end of expression."),
        }
    }
}
