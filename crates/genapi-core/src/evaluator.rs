//! GenICam formula evaluator.
//!
//! Formulas are infix expressions over int64 and double values with the
//! operator set of the GenICam standard: the ternary `?:`, logical and
//! bitwise operators, comparisons (`=` and `==` are synonyms, as are `<>`
//! and `!=`), shifts, arithmetic with right-associative `**`, unary signs,
//! and a fixed set of named functions. Parsing runs a shunting yard into
//! RPN; evaluation replays the RPN on a bounded stack, either in int64 mode
//! (doubles are truncated when stored) or in double mode.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::trace;

/// Depth of the evaluation stack.
const STACK_SIZE: usize = 128;
/// Recursion guard for nested sub-expression references.
const MAX_SUB_EXPRESSION_DEPTH: usize = 16;

/// Errors raised while parsing or evaluating a formula.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("empty expression")]
    EmptyExpression,
    #[error("parentheses mismatch")]
    ParenthesesMismatch,
    #[error("syntax error near '{0}'")]
    SyntaxError(String),
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("missing arguments")]
    MissingArguments,
    #[error("remaining operands")]
    RemainingOperands,
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid argument for '{0}'")]
    InvalidArgument(String),
}

/// A numeric value carried by variables and results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Double(f64),
}

impl Value {
    /// Value truncated to int64.
    pub fn as_int(self) -> i64 {
        match self {
            Value::Int(v) => v,
            Value::Double(v) => v as i64,
        }
    }

    /// Value widened to double.
    pub fn as_double(self) -> f64 {
        match self {
            Value::Int(v) => v as f64,
            Value::Double(v) => v,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

/// Named functions of the formula grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Abs,
    Exp,
    Ln,
    Lg,
    Sqrt,
    Trunc,
    Floor,
    Ceil,
    Round,
    Sgn,
    Neg,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "SIN" => Some(Function::Sin),
            "COS" => Some(Function::Cos),
            "TAN" => Some(Function::Tan),
            "ASIN" => Some(Function::Asin),
            "ACOS" => Some(Function::Acos),
            "ATAN" => Some(Function::Atan),
            "ABS" => Some(Function::Abs),
            "EXP" => Some(Function::Exp),
            "LN" => Some(Function::Ln),
            "LG" => Some(Function::Lg),
            "SQRT" => Some(Function::Sqrt),
            "TRUNC" => Some(Function::Trunc),
            "FLOOR" => Some(Function::Floor),
            "CEIL" => Some(Function::Ceil),
            "ROUND" => Some(Function::Round),
            "SGN" => Some(Function::Sgn),
            "NEG" => Some(Function::Neg),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Function::Sin => "SIN",
            Function::Cos => "COS",
            Function::Tan => "TAN",
            Function::Asin => "ASIN",
            Function::Acos => "ACOS",
            Function::Atan => "ATAN",
            Function::Abs => "ABS",
            Function::Exp => "EXP",
            Function::Ln => "LN",
            Function::Lg => "LG",
            Function::Sqrt => "SQRT",
            Function::Trunc => "TRUNC",
            Function::Floor => "FLOOR",
            Function::Ceil => "CEIL",
            Function::Round => "ROUND",
            Function::Sgn => "SGN",
            Function::Neg => "NEG",
        }
    }
}

/// Binary and unary operators, ordered groups share a precedence level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    TernaryQuestion,
    TernaryColon,
    LogicalOr,
    LogicalAnd,
    BitwiseNot,
    BitwiseOr,
    BitwiseXor,
    BitwiseAnd,
    Equal,
    NotEqual,
    LessOrEqual,
    GreaterOrEqual,
    Less,
    Greater,
    ShiftRight,
    ShiftLeft,
    Subtraction,
    Addition,
    Remainder,
    Division,
    Multiplication,
    Power,
    UnaryMinus,
    UnaryPlus,
}

impl Operator {
    fn precedence(self) -> u8 {
        match self {
            Operator::TernaryQuestion | Operator::TernaryColon => 5,
            Operator::LogicalOr => 10,
            Operator::LogicalAnd => 20,
            Operator::BitwiseNot => 30,
            Operator::BitwiseOr => 40,
            Operator::BitwiseXor => 50,
            Operator::BitwiseAnd => 60,
            Operator::Equal | Operator::NotEqual => 70,
            Operator::LessOrEqual
            | Operator::GreaterOrEqual
            | Operator::Less
            | Operator::Greater => 80,
            Operator::ShiftRight | Operator::ShiftLeft => 90,
            Operator::Subtraction | Operator::Addition => 100,
            Operator::Remainder | Operator::Division | Operator::Multiplication => 110,
            Operator::Power => 120,
            Operator::UnaryMinus | Operator::UnaryPlus => 130,
        }
    }

    fn right_associative(self) -> bool {
        matches!(
            self,
            Operator::TernaryQuestion
                | Operator::TernaryColon
                | Operator::Power
                | Operator::UnaryMinus
                | Operator::UnaryPlus
        )
    }

    fn n_args(self) -> usize {
        match self {
            Operator::TernaryQuestion => 3,
            Operator::TernaryColon => 0,
            Operator::BitwiseNot | Operator::UnaryMinus | Operator::UnaryPlus => 1,
            _ => 2,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Operator::TernaryQuestion => "?",
            Operator::TernaryColon => ":",
            Operator::LogicalOr => "||",
            Operator::LogicalAnd => "&&",
            Operator::BitwiseNot => "~",
            Operator::BitwiseOr => "|",
            Operator::BitwiseXor => "^",
            Operator::BitwiseAnd => "&",
            Operator::Equal => "=",
            Operator::NotEqual => "<>",
            Operator::LessOrEqual => "<=",
            Operator::GreaterOrEqual => ">=",
            Operator::Less => "<",
            Operator::Greater => ">",
            Operator::ShiftRight => ">>",
            Operator::ShiftLeft => "<<",
            Operator::Subtraction => "-",
            Operator::Addition => "+",
            Operator::Remainder => "%",
            Operator::Division => "/",
            Operator::Multiplication => "*",
            Operator::Power => "**",
            Operator::UnaryMinus => "-",
            Operator::UnaryPlus => "+",
        }
    }
}

/// Tokens of the infix stream.
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Double(f64),
    Identifier(String),
    Operator(Operator),
    Function(Function),
    LeftParen,
    RightParen,
    Comma,
}

impl Token {
    fn is_operand(&self) -> bool {
        matches!(self, Token::Int(_) | Token::Double(_) | Token::Identifier(_))
    }
}

/// One step of the compiled RPN program.
#[derive(Debug, Clone, PartialEq)]
pub enum RpnToken {
    Int(i64),
    Double(f64),
    Variable(String),
    Operator(Operator),
    Function { func: Function, n_args: usize },
}

impl fmt::Display for RpnToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpnToken::Int(v) => write!(f, "{v}"),
            RpnToken::Double(v) => write!(f, "{v}"),
            RpnToken::Variable(name) => write!(f, "{name}"),
            RpnToken::Operator(op) => write!(f, "{}", op.symbol()),
            RpnToken::Function { func, n_args } => write!(f, "{}/{n_args}", func.name()),
        }
    }
}

/// A parsed formula: the infix token stream and its compiled RPN.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    infix: Vec<Token>,
    rpn: Vec<RpnToken>,
}

impl Expression {
    /// Parse an infix formula.
    pub fn parse(source: &str) -> Result<Self, EvalError> {
        let infix = tokenize(source)?;
        if infix.is_empty() {
            return Err(EvalError::EmptyExpression);
        }
        let rpn = shunting_yard(&infix)?;
        trace!(source, rpn = ?rpn, "compiled formula");
        Ok(Self {
            source: source.to_string(),
            infix,
            rpn,
        })
    }

    /// Original formula text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compiled RPN program.
    pub fn rpn(&self) -> &[RpnToken] {
        &self.rpn
    }

    /// Names of the variables referenced by the formula.
    pub fn variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .rpn
            .iter()
            .filter_map(|token| match token {
                RpnToken::Variable(name) => Some(name.as_str()),
                _ => None,
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Evaluate in int64 mode: doubles are truncated as they are stored.
    pub fn evaluate_as_int64(
        &self,
        lookup: &mut dyn FnMut(&str) -> Option<Value>,
    ) -> Result<i64, EvalError> {
        let mut stack = [0i64; STACK_SIZE];
        let mut index = 0usize;
        for token in &self.rpn {
            match token {
                RpnToken::Int(v) => push_int(&mut stack, &mut index, *v)?,
                RpnToken::Double(v) => push_int(&mut stack, &mut index, *v as i64)?,
                RpnToken::Variable(name) => {
                    let value = lookup(name).ok_or_else(|| EvalError::UnknownVariable(name.clone()))?;
                    push_int(&mut stack, &mut index, value.as_int())?;
                }
                RpnToken::Operator(op) => apply_operator_int(&mut stack, &mut index, *op)?,
                RpnToken::Function { func, n_args } => {
                    apply_function_int(&mut stack, &mut index, *func, *n_args)?
                }
            }
        }
        if index != 1 {
            return Err(EvalError::RemainingOperands);
        }
        Ok(stack[0])
    }

    /// Evaluate in double mode.
    pub fn evaluate_as_double(
        &self,
        lookup: &mut dyn FnMut(&str) -> Option<Value>,
    ) -> Result<f64, EvalError> {
        let mut stack = [0f64; STACK_SIZE];
        let mut index = 0usize;
        for token in &self.rpn {
            match token {
                RpnToken::Int(v) => push_double(&mut stack, &mut index, *v as f64)?,
                RpnToken::Double(v) => push_double(&mut stack, &mut index, *v)?,
                RpnToken::Variable(name) => {
                    let value = lookup(name).ok_or_else(|| EvalError::UnknownVariable(name.clone()))?;
                    push_double(&mut stack, &mut index, value.as_double())?;
                }
                RpnToken::Operator(op) => apply_operator_double(&mut stack, &mut index, *op)?,
                RpnToken::Function { func, n_args } => {
                    apply_function_double(&mut stack, &mut index, *func, *n_args)?
                }
            }
        }
        if index != 1 {
            return Err(EvalError::RemainingOperands);
        }
        Ok(stack[0])
    }
}

impl fmt::Display for Expression {
    /// Print the infix token stream with canonical spacing; parsing the
    /// result compiles to the same RPN.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, token) in self.infix.iter().enumerate() {
            if position > 0 {
                write!(f, " ")?;
            }
            match token {
                Token::Int(v) => write!(f, "{v}")?,
                Token::Double(v) => {
                    if v.fract() == 0.0 && v.is_finite() {
                        write!(f, "{v:.1}")?
                    } else {
                        write!(f, "{v}")?
                    }
                }
                Token::Identifier(name) => write!(f, "{name}")?,
                Token::Operator(op) => write!(f, "{}", op.symbol())?,
                Token::Function(func) => write!(f, "{}", func.name())?,
                Token::LeftParen => write!(f, "(")?,
                Token::RightParen => write!(f, ")")?,
                Token::Comma => write!(f, ",")?,
            }
        }
        Ok(())
    }
}

/// Evaluator with named variables, constants and sub-expressions.
///
/// Identifier resolution order follows the standard: variables first, then
/// constants, then sub-expressions.
#[derive(Debug, Default)]
pub struct Evaluator {
    expression: Option<Expression>,
    variables: HashMap<String, Value>,
    constants: HashMap<String, Value>,
    sub_expressions: HashMap<String, Expression>,
}

impl Evaluator {
    /// Create an evaluator for the given formula.
    pub fn new(expression: &str) -> Result<Self, EvalError> {
        Ok(Self {
            expression: Some(Expression::parse(expression)?),
            ..Self::default()
        })
    }

    /// Create an evaluator with no formula set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Replace the formula.
    pub fn set_expression(&mut self, expression: &str) -> Result<(), EvalError> {
        self.expression = Some(Expression::parse(expression)?);
        Ok(())
    }

    /// Current formula text, if any.
    pub fn expression(&self) -> Option<&str> {
        self.expression.as_ref().map(|e| e.source())
    }

    /// Bind an int64 variable.
    pub fn set_int64_variable(&mut self, name: &str, value: i64) {
        self.variables.insert(name.to_string(), Value::Int(value));
    }

    /// Bind a double variable.
    pub fn set_double_variable(&mut self, name: &str, value: f64) {
        self.variables.insert(name.to_string(), Value::Double(value));
    }

    /// Bind a named constant.
    pub fn set_constant(&mut self, name: &str, value: Value) {
        self.constants.insert(name.to_string(), value);
    }

    /// Bind a named sub-expression.
    pub fn set_sub_expression(&mut self, name: &str, expression: &str) -> Result<(), EvalError> {
        self.sub_expressions
            .insert(name.to_string(), Expression::parse(expression)?);
        Ok(())
    }

    /// Evaluate the formula in int64 mode.
    pub fn evaluate_as_int64(&self) -> Result<i64, EvalError> {
        let expression = self.expression.as_ref().ok_or(EvalError::EmptyExpression)?;
        let mut lookup = |name: &str| self.lookup(name, 0);
        expression.evaluate_as_int64(&mut lookup)
    }

    /// Evaluate the formula in double mode.
    pub fn evaluate_as_double(&self) -> Result<f64, EvalError> {
        let expression = self.expression.as_ref().ok_or(EvalError::EmptyExpression)?;
        let mut lookup = |name: &str| self.lookup(name, 0);
        expression.evaluate_as_double(&mut lookup)
    }

    fn lookup(&self, name: &str, depth: usize) -> Option<Value> {
        if let Some(value) = self.variables.get(name) {
            return Some(*value);
        }
        if let Some(value) = self.constants.get(name) {
            return Some(*value);
        }
        if depth >= MAX_SUB_EXPRESSION_DEPTH {
            return None;
        }
        if let Some(sub) = self.sub_expressions.get(name) {
            let mut inner = |inner_name: &str| self.lookup(inner_name, depth + 1);
            return sub.evaluate_as_double(&mut inner).ok().map(Value::Double);
        }
        None
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let byte = bytes[pos];
        if byte.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        if byte.is_ascii_digit() || (byte == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) {
            let (token, next) = lex_number(source, pos)?;
            tokens.push(token);
            pos = next;
            continue;
        }
        if byte.is_ascii_alphabetic() || byte == b'_' {
            let (token, next) = lex_identifier(source, pos);
            tokens.push(token);
            pos = next;
            continue;
        }
        let previous_is_operand = tokens
            .last()
            .map(|t| t.is_operand() || matches!(t, Token::RightParen))
            .unwrap_or(false);
        let rest = &source[pos..];
        let (token, len) = match rest.as_bytes() {
            [b'*', b'*', ..] => (Token::Operator(Operator::Power), 2),
            [b'&', b'&', ..] => (Token::Operator(Operator::LogicalAnd), 2),
            [b'|', b'|', ..] => (Token::Operator(Operator::LogicalOr), 2),
            [b'<', b'>', ..] => (Token::Operator(Operator::NotEqual), 2),
            [b'<', b'<', ..] => (Token::Operator(Operator::ShiftLeft), 2),
            [b'<', b'=', ..] => (Token::Operator(Operator::LessOrEqual), 2),
            [b'>', b'>', ..] => (Token::Operator(Operator::ShiftRight), 2),
            [b'>', b'=', ..] => (Token::Operator(Operator::GreaterOrEqual), 2),
            [b'=', b'=', ..] => (Token::Operator(Operator::Equal), 2),
            [b'!', b'=', ..] => (Token::Operator(Operator::NotEqual), 2),
            [b'=', ..] => (Token::Operator(Operator::Equal), 1),
            [b'<', ..] => (Token::Operator(Operator::Less), 1),
            [b'>', ..] => (Token::Operator(Operator::Greater), 1),
            [b'+', ..] if previous_is_operand => (Token::Operator(Operator::Addition), 1),
            [b'+', ..] => (Token::Operator(Operator::UnaryPlus), 1),
            [b'-', ..] if previous_is_operand => (Token::Operator(Operator::Subtraction), 1),
            [b'-', ..] => (Token::Operator(Operator::UnaryMinus), 1),
            [b'*', ..] => (Token::Operator(Operator::Multiplication), 1),
            [b'/', ..] => (Token::Operator(Operator::Division), 1),
            [b'%', ..] => (Token::Operator(Operator::Remainder), 1),
            [b'&', ..] => (Token::Operator(Operator::BitwiseAnd), 1),
            [b'|', ..] => (Token::Operator(Operator::BitwiseOr), 1),
            [b'^', ..] => (Token::Operator(Operator::BitwiseXor), 1),
            [b'~', ..] => (Token::Operator(Operator::BitwiseNot), 1),
            [b'?', ..] => (Token::Operator(Operator::TernaryQuestion), 1),
            [b':', ..] => (Token::Operator(Operator::TernaryColon), 1),
            [b'(', ..] => (Token::LeftParen, 1),
            [b')', ..] => (Token::RightParen, 1),
            [b',', ..] => (Token::Comma, 1),
            _ => {
                return Err(EvalError::UnknownOperator(
                    rest.chars().next().map(String::from).unwrap_or_default(),
                ))
            }
        };
        tokens.push(token);
        pos += len;
    }
    Ok(tokens)
}

fn lex_number(source: &str, start: usize) -> Result<(Token, usize), EvalError> {
    let bytes = source.as_bytes();
    if bytes[start] == b'0' && matches!(bytes.get(start + 1), Some(b'x') | Some(b'X')) {
        let mut end = start + 2;
        while end < bytes.len() && bytes[end].is_ascii_hexdigit() {
            end += 1;
        }
        if end == start + 2 {
            return Err(EvalError::SyntaxError(source[start..end].to_string()));
        }
        let value = u64::from_str_radix(&source[start + 2..end], 16)
            .map_err(|_| EvalError::SyntaxError(source[start..end].to_string()))?;
        return Ok((Token::Int(value as i64), end));
    }

    let mut end = start;
    let mut is_double = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' => {
                is_double = true;
                end += 1;
            }
            b'e' | b'E' if is_double || end > start => {
                // Exponents only occur after at least one digit.
                if matches!(bytes.get(end + 1), Some(b'+') | Some(b'-')) {
                    if bytes.get(end + 2).is_some_and(u8::is_ascii_digit) {
                        is_double = true;
                        end += 2;
                    } else {
                        break;
                    }
                } else if bytes.get(end + 1).is_some_and(u8::is_ascii_digit) {
                    is_double = true;
                    end += 1;
                } else {
                    break;
                }
            }
            _ => break,
        }
    }
    let text = &source[start..end];
    if is_double {
        let value: f64 = text
            .parse()
            .map_err(|_| EvalError::SyntaxError(text.to_string()))?;
        Ok((Token::Double(value), end))
    } else {
        let value: i64 = text
            .parse()
            .map_err(|_| EvalError::SyntaxError(text.to_string()))?;
        Ok((Token::Int(value), end))
    }
}

fn lex_identifier(source: &str, start: usize) -> (Token, usize) {
    let bytes = source.as_bytes();
    let mut end = start + 1;
    while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_' || bytes[end] == b'.') {
        end += 1;
    }
    let name = &source[start..end];
    if let Some(func) = Function::from_name(name) {
        return (Token::Function(func), end);
    }
    // PI and E are predefined constants, not variables.
    match name {
        "PI" => (Token::Double(std::f64::consts::PI), end),
        "E" => (Token::Double(std::f64::consts::E), end),
        _ => (Token::Identifier(name.to_string()), end),
    }
}

fn shunting_yard(infix: &[Token]) -> Result<Vec<RpnToken>, EvalError> {
    #[derive(Debug)]
    enum StackEntry {
        Operator(Operator),
        Function(Function),
        LeftParen { args: usize },
    }

    let mut output = Vec::with_capacity(infix.len());
    let mut stack: Vec<StackEntry> = Vec::new();

    for token in infix {
        match token {
            Token::Int(v) => output.push(RpnToken::Int(*v)),
            Token::Double(v) => output.push(RpnToken::Double(*v)),
            Token::Identifier(name) => output.push(RpnToken::Variable(name.clone())),
            Token::Function(func) => stack.push(StackEntry::Function(*func)),
            Token::LeftParen => stack.push(StackEntry::LeftParen { args: 1 }),
            Token::Comma => {
                loop {
                    match stack.last_mut() {
                        Some(StackEntry::LeftParen { args }) => {
                            *args += 1;
                            break;
                        }
                        Some(StackEntry::Operator(op)) => {
                            output.push(RpnToken::Operator(*op));
                            stack.pop();
                        }
                        Some(StackEntry::Function(_)) | None => {
                            return Err(EvalError::ParenthesesMismatch)
                        }
                    }
                }
            }
            Token::RightParen => {
                let args = loop {
                    match stack.pop() {
                        Some(StackEntry::LeftParen { args }) => break args,
                        Some(StackEntry::Operator(op)) => output.push(RpnToken::Operator(op)),
                        Some(StackEntry::Function(_)) | None => {
                            return Err(EvalError::ParenthesesMismatch)
                        }
                    }
                };
                if let Some(StackEntry::Function(func)) = stack.last() {
                    output.push(RpnToken::Function {
                        func: *func,
                        n_args: args,
                    });
                    stack.pop();
                }
            }
            Token::Operator(op) => {
                loop {
                    match stack.last() {
                        Some(StackEntry::Operator(top)) => {
                            let pop = if op.right_associative() {
                                top.precedence() > op.precedence()
                            } else {
                                top.precedence() >= op.precedence()
                            };
                            if pop {
                                output.push(RpnToken::Operator(*top));
                                stack.pop();
                            } else {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
                stack.push(StackEntry::Operator(*op));
            }
        }
    }

    while let Some(entry) = stack.pop() {
        match entry {
            StackEntry::Operator(op) => output.push(RpnToken::Operator(op)),
            StackEntry::Function(_) | StackEntry::LeftParen { .. } => {
                return Err(EvalError::ParenthesesMismatch)
            }
        }
    }

    Ok(output)
}

fn push_int(stack: &mut [i64; STACK_SIZE], index: &mut usize, value: i64) -> Result<(), EvalError> {
    if *index >= STACK_SIZE {
        return Err(EvalError::RemainingOperands);
    }
    stack[*index] = value;
    *index += 1;
    Ok(())
}

fn push_double(
    stack: &mut [f64; STACK_SIZE],
    index: &mut usize,
    value: f64,
) -> Result<(), EvalError> {
    if *index >= STACK_SIZE {
        return Err(EvalError::RemainingOperands);
    }
    stack[*index] = value;
    *index += 1;
    Ok(())
}

fn apply_operator_int(
    stack: &mut [i64; STACK_SIZE],
    index: &mut usize,
    op: Operator,
) -> Result<(), EvalError> {
    let n_args = op.n_args();
    if *index < n_args {
        return Err(EvalError::MissingArguments);
    }
    match n_args {
        0 => {} // The ternary colon is a placeholder.
        1 => {
            let value = stack[*index - 1];
            stack[*index - 1] = match op {
                Operator::BitwiseNot => !value,
                Operator::UnaryMinus => value.wrapping_neg(),
                Operator::UnaryPlus => value,
                _ => unreachable!(),
            };
        }
        2 => {
            let rhs = stack[*index - 1];
            let lhs = stack[*index - 2];
            let result = match op {
                Operator::LogicalOr => ((lhs != 0) || (rhs != 0)) as i64,
                Operator::LogicalAnd => ((lhs != 0) && (rhs != 0)) as i64,
                Operator::BitwiseOr => lhs | rhs,
                Operator::BitwiseXor => lhs ^ rhs,
                Operator::BitwiseAnd => lhs & rhs,
                Operator::Equal => (lhs == rhs) as i64,
                Operator::NotEqual => (lhs != rhs) as i64,
                Operator::LessOrEqual => (lhs <= rhs) as i64,
                Operator::GreaterOrEqual => (lhs >= rhs) as i64,
                Operator::Less => (lhs < rhs) as i64,
                Operator::Greater => (lhs > rhs) as i64,
                Operator::ShiftRight => lhs.wrapping_shr(rhs as u32),
                Operator::ShiftLeft => lhs.wrapping_shl(rhs as u32),
                Operator::Subtraction => lhs.wrapping_sub(rhs),
                Operator::Addition => lhs.wrapping_add(rhs),
                Operator::Remainder => {
                    if rhs == 0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    lhs.wrapping_rem(rhs)
                }
                Operator::Division => {
                    if rhs == 0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    lhs.wrapping_div(rhs)
                }
                Operator::Multiplication => lhs.wrapping_mul(rhs),
                Operator::Power => (lhs as f64).powf(rhs as f64) as i64,
                _ => unreachable!(),
            };
            stack[*index - 2] = result;
        }
        3 => {
            let alternative = stack[*index - 1];
            let consequent = stack[*index - 2];
            let condition = stack[*index - 3];
            stack[*index - 3] = if condition != 0 { consequent } else { alternative };
        }
        _ => unreachable!(),
    }
    *index = *index - n_args + usize::from(n_args > 0);
    Ok(())
}

fn apply_operator_double(
    stack: &mut [f64; STACK_SIZE],
    index: &mut usize,
    op: Operator,
) -> Result<(), EvalError> {
    let n_args = op.n_args();
    if *index < n_args {
        return Err(EvalError::MissingArguments);
    }
    match n_args {
        0 => {}
        1 => {
            let value = stack[*index - 1];
            stack[*index - 1] = match op {
                Operator::BitwiseNot => !(value as i64) as f64,
                Operator::UnaryMinus => -value,
                Operator::UnaryPlus => value,
                _ => unreachable!(),
            };
        }
        2 => {
            let rhs = stack[*index - 1];
            let lhs = stack[*index - 2];
            let result = match op {
                Operator::LogicalOr => (((lhs != 0.0) || (rhs != 0.0)) as i64) as f64,
                Operator::LogicalAnd => (((lhs != 0.0) && (rhs != 0.0)) as i64) as f64,
                Operator::BitwiseOr => ((lhs as i64) | (rhs as i64)) as f64,
                Operator::BitwiseXor => ((lhs as i64) ^ (rhs as i64)) as f64,
                Operator::BitwiseAnd => ((lhs as i64) & (rhs as i64)) as f64,
                Operator::Equal => ((lhs == rhs) as i64) as f64,
                Operator::NotEqual => ((lhs != rhs) as i64) as f64,
                Operator::LessOrEqual => ((lhs <= rhs) as i64) as f64,
                Operator::GreaterOrEqual => ((lhs >= rhs) as i64) as f64,
                Operator::Less => ((lhs < rhs) as i64) as f64,
                Operator::Greater => ((lhs > rhs) as i64) as f64,
                Operator::ShiftRight => ((lhs as i64).wrapping_shr(rhs as u32)) as f64,
                Operator::ShiftLeft => ((lhs as i64).wrapping_shl(rhs as u32)) as f64,
                Operator::Subtraction => lhs - rhs,
                Operator::Addition => lhs + rhs,
                Operator::Remainder => {
                    if rhs as i64 == 0 {
                        return Err(EvalError::DivisionByZero);
                    }
                    ((lhs as i64).wrapping_rem(rhs as i64)) as f64
                }
                Operator::Division => lhs / rhs,
                Operator::Multiplication => lhs * rhs,
                Operator::Power => lhs.powf(rhs),
                _ => unreachable!(),
            };
            stack[*index - 2] = result;
        }
        3 => {
            let alternative = stack[*index - 1];
            let consequent = stack[*index - 2];
            let condition = stack[*index - 3];
            stack[*index - 3] = if condition != 0.0 { consequent } else { alternative };
        }
        _ => unreachable!(),
    }
    *index = *index - n_args + usize::from(n_args > 0);
    Ok(())
}

fn apply_function_int(
    stack: &mut [i64; STACK_SIZE],
    index: &mut usize,
    func: Function,
    n_args: usize,
) -> Result<(), EvalError> {
    check_function_arity(func, n_args)?;
    if *index < n_args {
        return Err(EvalError::MissingArguments);
    }
    if func == Function::Round && n_args == 2 {
        let decimals = stack[*index - 1];
        let value = stack[*index - 2] as f64;
        let scale = 10f64.powi(decimals as i32);
        stack[*index - 2] = ((value * scale).round() / scale) as i64;
        *index -= 1;
        return Ok(());
    }
    let value = stack[*index - 1] as f64;
    stack[*index - 1] = apply_function_value(func, value)? as i64;
    Ok(())
}

fn apply_function_double(
    stack: &mut [f64; STACK_SIZE],
    index: &mut usize,
    func: Function,
    n_args: usize,
) -> Result<(), EvalError> {
    check_function_arity(func, n_args)?;
    if *index < n_args {
        return Err(EvalError::MissingArguments);
    }
    if func == Function::Round && n_args == 2 {
        let decimals = stack[*index - 1];
        let value = stack[*index - 2];
        let scale = 10f64.powi(decimals as i32);
        stack[*index - 2] = (value * scale).round() / scale;
        *index -= 1;
        return Ok(());
    }
    let value = stack[*index - 1];
    stack[*index - 1] = apply_function_value(func, value)?;
    Ok(())
}

fn check_function_arity(func: Function, n_args: usize) -> Result<(), EvalError> {
    let valid = match func {
        Function::Round => n_args == 1 || n_args == 2,
        _ => n_args == 1,
    };
    if valid {
        Ok(())
    } else {
        Err(EvalError::InvalidArgument(func.name().to_string()))
    }
}

fn apply_function_value(func: Function, value: f64) -> Result<f64, EvalError> {
    let result = match func {
        Function::Sin => value.sin(),
        Function::Cos => value.cos(),
        Function::Tan => value.tan(),
        Function::Asin => value.asin(),
        Function::Acos => value.acos(),
        Function::Atan => value.atan(),
        Function::Abs => value.abs(),
        Function::Exp => value.exp(),
        Function::Ln => value.ln(),
        Function::Lg => value.log10(),
        Function::Sqrt => value.sqrt(),
        Function::Trunc => value.trunc(),
        Function::Floor => value.floor(),
        Function::Ceil => value.ceil(),
        Function::Round => value.round(),
        Function::Sgn => {
            if value > 0.0 {
                1.0
            } else if value < 0.0 {
                -1.0
            } else {
                0.0
            }
        }
        Function::Neg => -value,
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(expr: &str) -> i64 {
        Expression::parse(expr)
            .expect("parse")
            .evaluate_as_int64(&mut |_| None)
            .expect("evaluate")
    }

    fn double(expr: &str) -> f64 {
        Expression::parse(expr)
            .expect("parse")
            .evaluate_as_double(&mut |_| None)
            .expect("evaluate")
    }

    #[test]
    fn arithmetic_vectors() {
        assert_eq!(int("10+2"), 12);
        assert_eq!(int("(24+2)*2"), 52);
        assert_eq!(int("24+2*8"), 40);
        assert_eq!(int("10-8"), 2);
        assert_eq!(int("10%3"), 1);
        assert_eq!(int("4*-3"), -12);
        assert_eq!(int("4*+3"), 12);
        assert_eq!(int("-1"), -1);
        assert_eq!(double("10.1-8.1"), 10.1 - 8.1);
    }

    #[test]
    fn integer_mode_truncates_at_store() {
        assert_eq!(int("2.5*4"), 8);
        assert_eq!(double("2.5*4"), 10.0);
        assert_eq!(int("NEG(-2.5)"), 2);
        assert_eq!(double("NEG(-2.5)"), 2.5);
    }

    #[test]
    fn division_modes() {
        assert_eq!(int("10/4"), 2);
        assert_eq!(double("10/4"), 2.5);
        assert_eq!(double("10.0/4"), 2.5);
        let err = Expression::parse("1/0")
            .expect("parse")
            .evaluate_as_int64(&mut |_| None)
            .unwrap_err();
        assert_eq!(err, EvalError::DivisionByZero);
        assert!(double("1.0/0").is_infinite());
    }

    #[test]
    fn power_is_right_associative() {
        assert_eq!(int("2**10"), 1024);
        assert_eq!(int("2**10*2"), 2048);
        assert_eq!(int("2**3**2"), 512);
    }

    #[test]
    fn ternary_and_comparisons() {
        assert_eq!(int("1=1?42:0"), 42);
        assert_eq!(int("1=0?1:0"), 0);
        assert_eq!(int("2>1"), 1);
        assert_eq!(int("2>2"), 0);
        assert_eq!(int("1<2"), 1);
        assert_eq!(int("2<=2"), 1);
        assert_eq!(int("1>=2"), 0);
        assert_eq!(int("1<>2"), 1);
        assert_eq!(int("1!=1"), 0);
        assert_eq!(int("1==1"), 1);
        // Nested ternaries bind to the right.
        assert_eq!(int("0?1:1?2:3"), 2);
    }

    #[test]
    fn bitwise_and_shifts() {
        assert_eq!(int("255 & 8"), 8);
        assert_eq!(int("128 | 8"), 136);
        assert_eq!(int("3 ^ 1"), 2);
        assert_eq!(int("~255"), -256);
        assert_eq!(int("1 << 4"), 16);
        assert_eq!(int("256 >> 4"), 16);
    }

    #[test]
    fn logical_operators() {
        assert_eq!(int("1 && 2"), 1);
        assert_eq!(int("1 && 0"), 0);
        assert_eq!(int("0 || 3"), 1);
        assert_eq!(int("0 || 0"), 0);
    }

    #[test]
    fn functions() {
        assert_eq!(double("SQRT(16)"), 4.0);
        assert_eq!(double("LN(E)"), 1.0);
        assert_eq!(double("LG(10)"), 1.0);
        assert_eq!(double("EXP(1)"), std::f64::consts::E);
        assert_eq!(double("TRUNC(10.7)"), 10.0);
        assert_eq!(double("TRUNC(-11.9)"), -11.0);
        assert_eq!(double("FLOOR(-11.9)"), -12.0);
        assert_eq!(double("CEIL(10.7)"), 11.0);
        assert_eq!(double("ROUND(10.9)"), 11.0);
        assert_eq!(double("ROUND(-20.9)"), -21.0);
        assert_eq!(double("SGN(-2.0)"), -1.0);
        assert_eq!(double("SGN(0.0)"), 0.0);
        assert_eq!(int("SGN(2)"), 1);
        assert_eq!(int("ABS(-5)"), 5);
    }

    #[test]
    fn round_with_precision() {
        assert_eq!(double("ROUND(10.11, 1)"), 10.1);
        assert_eq!(double("ROUND(10.99, 1)"), 11.0);
        assert_eq!(double("ROUND(-20.11, 1)"), -20.1);
    }

    #[test]
    fn hex_literals() {
        assert_eq!(int("0x10"), 16);
        assert_eq!(int("0xFF & 0x0F"), 0x0F);
    }

    #[test]
    fn variables_resolve_through_lookup() {
        let expr = Expression::parse("(A + 2) * B").expect("parse");
        let mut lookup = |name: &str| match name {
            "A" => Some(Value::Int(4)),
            "B" => Some(Value::Int(3)),
            _ => None,
        };
        assert_eq!(expr.evaluate_as_int64(&mut lookup).expect("eval"), 18);
        let err = expr.evaluate_as_int64(&mut |_| None).unwrap_err();
        assert!(matches!(err, EvalError::UnknownVariable(name) if name == "A"));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(Expression::parse("").unwrap_err(), EvalError::EmptyExpression);
        assert_eq!(
            Expression::parse("(1+2").unwrap_err(),
            EvalError::ParenthesesMismatch
        );
        assert_eq!(
            Expression::parse("1+2)").unwrap_err(),
            EvalError::ParenthesesMismatch
        );
        let err = Expression::parse("1 $ 2").unwrap_err();
        assert!(matches!(err, EvalError::UnknownOperator(_)));
    }

    #[test]
    fn evaluation_errors() {
        let expr = Expression::parse("1+").expect("parse");
        assert_eq!(
            expr.evaluate_as_int64(&mut |_| None).unwrap_err(),
            EvalError::MissingArguments
        );
        let expr = Expression::parse("1 2").expect("parse");
        assert_eq!(
            expr.evaluate_as_int64(&mut |_| None).unwrap_err(),
            EvalError::RemainingOperands
        );
    }

    #[test]
    fn print_then_reparse_preserves_rpn() {
        for source in [
            "(24+2)*2",
            "2**3**2",
            "1=1?42:0",
            "ROUND(10.11, 1)",
            "-A + 10 / (B - 5)",
            "1024 << SHIFT",
            "TO * 2 + OFFSET",
            "~(MASK | 0x0F)",
        ] {
            let first = Expression::parse(source).expect("parse");
            let printed = first.to_string();
            let second = Expression::parse(&printed).expect("reparse");
            assert_eq!(first.rpn(), second.rpn(), "{source} -> {printed}");
        }
    }

    #[test]
    fn evaluator_binds_variables_constants_and_sub_expressions() {
        let mut evaluator = Evaluator::new("2*X + OFFSET + DOUBLED").expect("new");
        evaluator.set_double_variable("X", 5.25);
        evaluator.set_constant("OFFSET", Value::Int(10));
        evaluator.set_sub_expression("DOUBLED", "X*2").expect("sub");
        let value = evaluator.evaluate_as_double().expect("eval");
        assert_eq!(value, 2.0 * 5.25 + 10.0 + 10.5);
    }

    #[test]
    fn pi_and_e_are_constants() {
        assert!((double("PI") - std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(double("COS(PI)"), -1.0);
    }
}
