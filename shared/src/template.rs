//! Task template engine
//!
//! A template turns a task's argument line into the shell command to run.
//! Placeholders are substituted against the full argument line `x`:
//!
//! - `{}` — the full line
//! - `{[i]}`, `{[a:b]}`, `{[a:b:s]}` — slices over the whitespace-split
//!   line, 0-indexed, negatives counted from the end, end-exclusive
//! - `{/}`, `{/-}`, `{-}`, `{+}`, `{++}`, `{.}`, `{..}` — filepath
//!   derivations treating the line as a path
//! - `{% CMD %}` — run `CMD` through `/bin/sh -c` with `@` replaced by the
//!   line, splicing the trimmed stdout
//! - `{= EXPR =}` — a restricted arithmetic/string expression with free
//!   variable `x`
//!
//! A pattern without any placeholder has the argument line appended.
//! Expansion failures are task-local: the executor marks the task failed
//! with the template-error status instead of crashing.

use std::collections::HashMap;
use std::path::Path;

use crate::HyperShellError;

/// A compiled-enough template: the raw pattern plus the implicit-append rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pattern: String,
}

impl Template {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// The identity template, `"{}"`.
    pub fn identity() -> Self {
        Self::new("{}")
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Expand the template against one argument line.
    pub async fn expand(&self, args: &str) -> crate::Result<String> {
        let mut out = String::with_capacity(self.pattern.len() + args.len());
        let mut rest = self.pattern.as_str();
        let mut substituted = false;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let tail = &rest[open..];
            let (placeholder, consumed) = scan_placeholder(tail)?;
            out.push_str(&substitute(&placeholder, args).await?);
            substituted = true;
            rest = &tail[consumed..];
        }
        out.push_str(rest);

        if !substituted {
            // A bare pattern like "echo" behaves as "echo {}".
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(args);
        }
        Ok(out)
    }
}

/// One parsed placeholder.
#[derive(Debug, PartialEq)]
enum Placeholder {
    Whole,
    Slice(String),
    Filepath(String),
    Subcommand(String),
    Expression(String),
}

/// Scan a placeholder starting at `{`; returns the placeholder and the number
/// of bytes consumed.
fn scan_placeholder(tail: &str) -> crate::Result<(Placeholder, usize)> {
    debug_assert!(tail.starts_with('{'));
    let (closer, kind): (&str, fn(String) -> Placeholder) = if tail.starts_with("{%") {
        ("%}", Placeholder::Subcommand)
    } else if tail.starts_with("{=") {
        ("=}", Placeholder::Expression)
    } else if tail.starts_with("{[") {
        ("]}", Placeholder::Slice)
    } else {
        ("}", |inner| {
            if inner.is_empty() {
                Placeholder::Whole
            } else {
                Placeholder::Filepath(inner)
            }
        })
    };
    let body_start = if closer == "}" { 1 } else { 2 };
    let close = tail[body_start..].find(closer).ok_or_else(|| {
        HyperShellError::Template(format!("unterminated placeholder in '{}'", tail))
    })?;
    let inner = tail[body_start..body_start + close].to_string();
    let consumed = body_start + close + closer.len();
    Ok((kind(inner), consumed))
}

async fn substitute(placeholder: &Placeholder, args: &str) -> crate::Result<String> {
    match placeholder {
        Placeholder::Whole => Ok(args.to_string()),
        Placeholder::Slice(spec) => slice_words(spec, args),
        Placeholder::Filepath(token) => filepath_derivation(token, args),
        Placeholder::Subcommand(cmd) => run_subcommand(cmd, args).await,
        Placeholder::Expression(expr) => {
            let value = eval_expression(expr, args)?;
            Ok(value.render())
        }
    }
}

/// `{[...]}` — python-style slicing over the whitespace-split line.
fn slice_words(spec: &str, args: &str) -> crate::Result<String> {
    let words: Vec<&str> = args.split_whitespace().collect();
    let n = words.len() as i64;
    let parts: Vec<&str> = spec.split(':').collect();

    let parse = |part: &str, what: &str| -> crate::Result<Option<i64>> {
        let part = part.trim();
        if part.is_empty() {
            return Ok(None);
        }
        part.parse::<i64>().map(Some).map_err(|_| {
            HyperShellError::Template(format!("bad {} '{}' in slice [{}]", what, part, spec))
                .into()
        })
    };

    match parts.len() {
        1 => {
            let index = parse(parts[0], "index")?.ok_or_else(|| {
                HyperShellError::Template(format!("empty index in slice [{}]", spec))
            })?;
            let normalized = if index < 0 { index + n } else { index };
            if normalized < 0 || normalized >= n {
                return Err(HyperShellError::Template(format!(
                    "index {} out of range for {} words",
                    index, n
                ))
                .into());
            }
            Ok(words[normalized as usize].to_string())
        }
        2 | 3 => {
            let start = parse(parts[0], "start")?;
            let stop = parse(parts[1], "stop")?;
            let step = if parts.len() == 3 {
                parse(parts[2], "step")?
            } else {
                None
            };
            let selected = py_slice(&words, start, stop, step)?;
            Ok(selected.join(" "))
        }
        _ => Err(HyperShellError::Template(format!("malformed slice [{}]", spec)).into()),
    }
}

/// Half-open slice with optional negative indices and step, matching the
/// semantics of sequence slicing in the submission language.
fn py_slice<'a>(
    words: &[&'a str],
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> crate::Result<Vec<&'a str>> {
    let n = words.len() as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(HyperShellError::Template("slice step cannot be zero".to_string()).into());
    }

    let adjust = |index: i64| -> i64 {
        let shifted = if index < 0 { index + n } else { index };
        if step > 0 {
            shifted.clamp(0, n)
        } else {
            shifted.clamp(-1, n - 1)
        }
    };

    let start = match start {
        Some(value) => adjust(value),
        None if step > 0 => 0,
        None => n - 1,
    };
    let stop = match stop {
        Some(value) => adjust(value),
        None if step > 0 => n,
        None => -1,
    };

    let mut selected = Vec::new();
    let mut index = start;
    while (step > 0 && index < stop) || (step < 0 && index > stop) {
        if index >= 0 && index < n {
            selected.push(words[index as usize]);
        }
        index += step;
    }
    Ok(selected)
}

/// `{/}`, `{/-}`, `{-}`, `{+}`, `{++}`, `{.}`, `{..}` — treat the line as a
/// filesystem path and derive a component from it.
fn filepath_derivation(token: &str, args: &str) -> crate::Result<String> {
    let path = Path::new(args);
    let lossy = |value: Option<&std::ffi::OsStr>| {
        value.map(|v| v.to_string_lossy().into_owned()).unwrap_or_default()
    };
    match token {
        "/" => Ok(lossy(path.file_name())),
        "/-" => Ok(lossy(path.file_stem())),
        "-" => Ok(path.with_extension("").to_string_lossy().into_owned()),
        "+" => Ok(path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()),
        "++" => Ok(path
            .parent()
            .and_then(|p| p.parent())
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()),
        "." => Ok(lossy(path.extension())),
        ".." => Ok(path
            .file_name()
            .and_then(|name| name.to_string_lossy().split_once('.').map(|(_, s)| s.to_string()))
            .unwrap_or_default()),
        other => {
            Err(HyperShellError::Template(format!("unknown placeholder '{{{}}}'", other)).into())
        }
    }
}

/// `{% CMD %}` — run the sub-command with `@` replaced by the line and splice
/// its trimmed stdout.
async fn run_subcommand(cmd: &str, args: &str) -> crate::Result<String> {
    let command = cmd.trim().replace('@', args);
    let output = tokio::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .output()
        .await
        .map_err(|e| HyperShellError::Template(format!("cannot run '{}': {}", command, e)))?;
    if !output.status.success() {
        return Err(HyperShellError::Template(format!(
            "sub-command '{}' exited with {}",
            command, output.status
        ))
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ---------------------------------------------------------------------------
// `{= EXPR =}` — restricted expression evaluation

/// Value domain of the expression language.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl Value {
    /// Coerce the free variable: integer, then float, then boolean, then
    /// null, falling back to string.
    fn coerce(raw: &str) -> Self {
        if let Ok(v) = raw.parse::<i64>() {
            return Value::Int(v);
        }
        if let Ok(v) = raw.parse::<f64>() {
            return Value::Float(v);
        }
        match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            _ => Value::Str(raw.to_string()),
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(v) => v.clone(),
            Value::Bool(v) => v.to_string(),
            Value::Null => String::new(),
        }
    }

    fn as_float(&self) -> crate::Result<f64> {
        match self {
            Value::Int(v) => Ok(*v as f64),
            Value::Float(v) => Ok(*v),
            other => {
                Err(HyperShellError::Template(format!("{:?} is not numeric", other)).into())
            }
        }
    }
}

/// Evaluate a `{= =}` expression against the argument line.
pub fn eval_expression(expr: &str, args: &str) -> crate::Result<Value> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        variables: HashMap::from([("x".to_string(), Value::coerce(args))]),
    };
    let value = parser.expression()?;
    if parser.position != parser.tokens.len() {
        return Err(HyperShellError::Template(format!(
            "trailing input in expression '{}'",
            expr
        ))
        .into());
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64, bool), // value, was-integer-literal
    Str(String),
    Ident(String),
    Op(&'static str),
    LeftParen,
    RightParen,
    Comma,
}

fn tokenize(expr: &str) -> crate::Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LeftParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    literal.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(HyperShellError::Template(format!(
                        "unterminated string in '{}'",
                        expr
                    ))
                    .into());
                }
                i += 1;
                tokens.push(Token::Str(literal));
            }
            '0'..='9' => {
                let start = i;
                let mut is_int = true;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        is_int = false;
                    }
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal.parse::<f64>().map_err(|_| {
                    HyperShellError::Template(format!("bad number '{}'", literal))
                })?;
                tokens.push(Token::Number(value, is_int));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '*' => {
                if i + 1 < chars.len() && chars[i + 1] == '*' {
                    tokens.push(Token::Op("**"));
                    i += 2;
                } else {
                    tokens.push(Token::Op("*"));
                    i += 1;
                }
            }
            '=' | '!' | '<' | '>' => {
                if i + 1 < chars.len() && chars[i + 1] == '=' {
                    tokens.push(Token::Op(match c {
                        '=' => "==",
                        '!' => "!=",
                        '<' => "<=",
                        _ => ">=",
                    }));
                    i += 2;
                } else if c == '<' {
                    tokens.push(Token::Op("<"));
                    i += 1;
                } else if c == '>' {
                    tokens.push(Token::Op(">"));
                    i += 1;
                } else {
                    return Err(HyperShellError::Template(format!(
                        "unexpected '{}' in '{}'",
                        c, expr
                    ))
                    .into());
                }
            }
            '+' | '-' | '/' | '%' => {
                tokens.push(Token::Op(match c {
                    '+' => "+",
                    '-' => "-",
                    '/' => "/",
                    _ => "%",
                }));
                i += 1;
            }
            other => {
                return Err(HyperShellError::Template(format!(
                    "unexpected '{}' in '{}'",
                    other, expr
                ))
                .into())
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
    variables: HashMap<String, Value>,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        if let Some(Token::Op(op)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.position += 1;
                return Some(op);
            }
        }
        None
    }

    fn expression(&mut self) -> crate::Result<Value> {
        self.comparison()
    }

    fn comparison(&mut self) -> crate::Result<Value> {
        let left = self.additive()?;
        if let Some(op) = self.eat_op(&["==", "!=", "<", "<=", ">", ">="]) {
            let right = self.additive()?;
            return compare(op, &left, &right);
        }
        Ok(left)
    }

    fn additive(&mut self) -> crate::Result<Value> {
        let mut left = self.multiplicative()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.multiplicative()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> crate::Result<Value> {
        let mut left = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let right = self.unary()?;
            left = arithmetic(op, &left, &right)?;
        }
        Ok(left)
    }

    fn unary(&mut self) -> crate::Result<Value> {
        if self.eat_op(&["-"]).is_some() {
            return match self.unary()? {
                Value::Int(v) => Ok(Value::Int(-v)),
                Value::Float(v) => Ok(Value::Float(-v)),
                other => Err(HyperShellError::Template(format!(
                    "cannot negate {:?}",
                    other
                ))
                .into()),
            };
        }
        self.power()
    }

    fn power(&mut self) -> crate::Result<Value> {
        let base = self.atom()?;
        if self.eat_op(&["**"]).is_some() {
            let exponent = self.unary()?;
            let result = base.as_float()?.powf(exponent.as_float()?);
            return Ok(narrow(result));
        }
        Ok(base)
    }

    fn atom(&mut self) -> crate::Result<Value> {
        match self.bump() {
            Some(Token::Number(value, true)) => Ok(Value::Int(value as i64)),
            Some(Token::Number(value, false)) => Ok(Value::Float(value)),
            Some(Token::Str(value)) => Ok(Value::Str(value)),
            Some(Token::LeftParen) => {
                let value = self.expression()?;
                match self.bump() {
                    Some(Token::RightParen) => Ok(value),
                    _ => Err(HyperShellError::Template("expected ')'".to_string()).into()),
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => {
                    if matches!(self.peek(), Some(Token::LeftParen)) {
                        self.position += 1;
                        let mut arguments = Vec::new();
                        if !matches!(self.peek(), Some(Token::RightParen)) {
                            loop {
                                arguments.push(self.expression()?);
                                if matches!(self.peek(), Some(Token::Comma)) {
                                    self.position += 1;
                                    continue;
                                }
                                break;
                            }
                        }
                        match self.bump() {
                            Some(Token::RightParen) => {}
                            _ => {
                                return Err(HyperShellError::Template(
                                    "expected ')' after arguments".to_string(),
                                )
                                .into())
                            }
                        }
                        call_function(&name, &arguments)
                    } else {
                        self.variables.get(&name).cloned().ok_or_else(|| {
                            HyperShellError::Template(format!("unknown variable '{}'", name))
                                .into()
                        })
                    }
                }
            },
            other => Err(HyperShellError::Template(format!(
                "unexpected token {:?}",
                other
            ))
            .into()),
        }
    }
}

/// Collapse a float back to an integer when exact.
fn narrow(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::Int(value as i64)
    } else {
        Value::Float(value)
    }
}

fn arithmetic(op: &str, left: &Value, right: &Value) -> crate::Result<Value> {
    // String concatenation is the only non-numeric arithmetic.
    if op == "+" {
        if let (Value::Str(a), Value::Str(b)) = (left, right) {
            return Ok(Value::Str(format!("{}{}", a, b)));
        }
    }
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        return match op {
            "+" => Ok(Value::Int(a.wrapping_add(*b))),
            "-" => Ok(Value::Int(a.wrapping_sub(*b))),
            "*" => Ok(Value::Int(a.wrapping_mul(*b))),
            "/" => {
                if *b == 0 {
                    Err(HyperShellError::Template("division by zero".to_string()).into())
                } else {
                    Ok(narrow(*a as f64 / *b as f64))
                }
            }
            "%" => {
                if *b == 0 {
                    Err(HyperShellError::Template("modulo by zero".to_string()).into())
                } else {
                    Ok(Value::Int(a.rem_euclid(*b)))
                }
            }
            _ => unreachable!(),
        };
    }
    let a = left.as_float()?;
    let b = right.as_float()?;
    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => {
            if b == 0.0 {
                return Err(HyperShellError::Template("division by zero".to_string()).into());
            }
            a / b
        }
        "%" => {
            if b == 0.0 {
                return Err(HyperShellError::Template("modulo by zero".to_string()).into());
            }
            a.rem_euclid(b)
        }
        _ => unreachable!(),
    };
    Ok(Value::Float(result))
}

fn compare(op: &str, left: &Value, right: &Value) -> crate::Result<Value> {
    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        _ => left.as_float()?.partial_cmp(&right.as_float()?),
    };
    let ordering = ordering.ok_or_else(|| {
        HyperShellError::Template(format!("cannot compare {:?} and {:?}", left, right))
    })?;
    let result = match op {
        "==" => ordering == std::cmp::Ordering::Equal,
        "!=" => ordering != std::cmp::Ordering::Equal,
        "<" => ordering == std::cmp::Ordering::Less,
        "<=" => ordering != std::cmp::Ordering::Greater,
        ">" => ordering == std::cmp::Ordering::Greater,
        ">=" => ordering != std::cmp::Ordering::Less,
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn call_function(name: &str, arguments: &[Value]) -> crate::Result<Value> {
    let one = || -> crate::Result<&Value> {
        arguments.first().ok_or_else(|| {
            HyperShellError::Template(format!("{}() requires an argument", name)).into()
        })
    };
    match name {
        "abs" => match one()? {
            Value::Int(v) => Ok(Value::Int(v.abs())),
            Value::Float(v) => Ok(Value::Float(v.abs())),
            other => {
                Err(HyperShellError::Template(format!("abs({:?}) is not numeric", other)).into())
            }
        },
        "int" => Ok(Value::Int(one()?.as_float()? as i64)),
        "float" => Ok(Value::Float(one()?.as_float()?)),
        "len" => match one()? {
            Value::Str(v) => Ok(Value::Int(v.len() as i64)),
            other => {
                Err(HyperShellError::Template(format!("len({:?}) needs a string", other)).into())
            }
        },
        "basename" | "dirname" | "stem" | "suffix" => match one()? {
            Value::Str(v) => {
                let token = match name {
                    "basename" => "/",
                    "dirname" => "+",
                    "stem" => "/-",
                    _ => ".",
                };
                Ok(Value::Str(filepath_derivation(token, v)?))
            }
            other => Err(HyperShellError::Template(format!(
                "{}({:?}) needs a string",
                name, other
            ))
            .into()),
        },
        other => {
            Err(HyperShellError::Template(format!("unknown function '{}'", other)).into())
        }
    }
}
