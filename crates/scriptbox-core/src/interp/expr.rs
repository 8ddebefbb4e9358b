//! `expr` evaluator.
//!
//! Expressions are tokenized and parsed into a small AST before evaluation so
//! that `&&`, `||` and `?:` only run the command substitutions on the branch
//! actually taken.

use super::value::{format_float, parse_number, Number, Value};

/// Hooks into the running interpreter for `$var`, `[cmd]` and `"..."`.
pub(crate) trait ExprHost {
    type Error;

    fn var(&mut self, name: &str) -> Result<Value, Self::Error>;
    fn command(&mut self, script: &str) -> Result<Value, Self::Error>;
    fn substitute(&mut self, text: &str) -> Result<Value, Self::Error>;
    /// Wrap an expression-level error message.
    fn fail(&self, message: String) -> Self::Error;
}

pub(crate) fn eval<H: ExprHost>(source: &str, host: &mut H) -> Result<Value, H::Error> {
    let tokens = tokenize(source).map_err(|m| host.fail(m))?;
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let ast = parser.ternary().map_err(|m| host.fail(m))?;
    if parser.pos != parser.tokens.len() {
        return Err(host.fail(format!(
            "syntax error in expression \"{source}\": extra tokens"
        )));
    }
    evaluate(&ast, host)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(Number),
    Var(String),
    Cmd(String),
    Quoted(String),
    Braced(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

const OPERATORS: &[&str] = &[
    "**", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "+", "-", "*", "/", "%", "<", ">", "!",
    "~", "&", "|", "^", "?", ":",
];

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            i += 1;
            while i < chars.len() {
                let d = chars[i];
                let exponent_sign =
                    (d == '+' || d == '-') && matches!(chars[i - 1], 'e' | 'E') && !is_hex(&chars[start..i]);
                if d.is_ascii_alphanumeric() || d == '.' || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let number =
                parse_number(&text).ok_or_else(|| format!("invalid number \"{text}\""))?;
            tokens.push(Token::Num(number));
            continue;
        }
        match c {
            '$' => {
                i += 1;
                let name = if chars.get(i) == Some(&'{') {
                    let end = find_from(&chars, i + 1, '}')
                        .ok_or_else(|| "missing close-brace for variable name".to_string())?;
                    let name: String = chars[i + 1..end].iter().collect();
                    i = end + 1;
                    name
                } else {
                    let start = i;
                    while i < chars.len()
                        && (chars[i].is_alphanumeric()
                            || chars[i] == '_'
                            || (chars[i] == ':' && chars.get(i + 1) == Some(&':')))
                    {
                        i += if chars[i] == ':' { 2 } else { 1 };
                    }
                    chars[start..i].iter().collect()
                };
                if name.is_empty() {
                    return Err("invalid character \"$\" in expression".to_string());
                }
                tokens.push(Token::Var(name));
            }
            '[' => {
                let end = matching(&chars, i, '[', ']')
                    .ok_or_else(|| "missing close-bracket".to_string())?;
                tokens.push(Token::Cmd(chars[i + 1..end].iter().collect()));
                i = end + 1;
            }
            '{' => {
                let end = matching(&chars, i, '{', '}')
                    .ok_or_else(|| "missing close-brace".to_string())?;
                tokens.push(Token::Braced(chars[i + 1..end].iter().collect()));
                i = end + 1;
            }
            '"' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j] != '"' {
                    if chars[j] == '\\' {
                        j += 1;
                    }
                    j += 1;
                }
                if j >= chars.len() {
                    return Err("missing \"".to_string());
                }
                tokens.push(Token::Quoted(chars[i + 1..j].iter().collect()));
                i = j + 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "eq" => tokens.push(Token::Op("eq")),
                    "ne" => tokens.push(Token::Op("ne")),
                    "in" => tokens.push(Token::Op("in")),
                    "ni" => tokens.push(Token::Op("ni")),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => {
                let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = OPERATORS
                    .iter()
                    .find(|op| rest.starts_with(**op))
                    .ok_or_else(|| format!("invalid character \"{c}\" in expression"))?;
                tokens.push(Token::Op(*op));
                i += op.len();
            }
        }
    }
    Ok(tokens)
}

fn is_hex(chars: &[char]) -> bool {
    chars.len() >= 2 && chars[0] == '0' && matches!(chars[1], 'x' | 'X')
}

fn find_from(chars: &[char], start: usize, target: char) -> Option<usize> {
    (start..chars.len()).find(|&j| chars[j] == target)
}

/// Index of the bracket closing the one at `open_at`, honoring nesting,
/// backslashes and (for `[`) nested braces.
fn matching(chars: &[char], open_at: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 0;
    let mut j = open_at;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 1,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(j);
                }
            }
            '{' if open == '[' => {
                j = matching(chars, j, '{', '}')?;
            }
            _ => {}
        }
        j += 1;
    }
    None
}

#[derive(Debug, Clone)]
enum Ast {
    Num(Number),
    Var(String),
    Cmd(String),
    Quoted(String),
    Literal(String),
    Unary(&'static str, Box<Ast>),
    Binary(&'static str, Box<Ast>, Box<Ast>),
    Ternary(Box<Ast>, Box<Ast>, Box<Ast>),
    Call(String, Vec<Ast>),
}

const MAX_EXPR_DEPTH: usize = 256;

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

fn precedence(op: &str) -> Option<u8> {
    Some(match op {
        "||" => 1,
        "&&" => 2,
        "|" => 3,
        "^" => 4,
        "&" => 5,
        "==" | "!=" | "eq" | "ne" | "in" | "ni" => 6,
        "<" | ">" | "<=" | ">=" => 7,
        "<<" | ">>" => 8,
        "+" | "-" => 9,
        "*" | "/" | "%" => 10,
        "**" => 11,
        _ => return None,
    })
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn ternary(&mut self) -> Result<Ast, String> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> Result<Ast, String> {
        let cond = self.binary(1)?;
        if self.peek() == Some(&Token::Op("?")) {
            self.pos += 1;
            let then = self.ternary()?;
            if self.next() != Some(Token::Op(":")) {
                return Err("missing \":\" in ternary expression".to_string());
            }
            let otherwise = self.ternary()?;
            return Ok(Ast::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)));
        }
        Ok(cond)
    }

    /// Bound the recursion of every descending rule.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, String>) -> Result<T, String> {
        if self.depth >= MAX_EXPR_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn binary(&mut self, min_prec: u8) -> Result<Ast, String> {
        self.nested(|p| p.binary_chain(min_prec))
    }

    fn binary_chain(&mut self, min_prec: u8) -> Result<Ast, String> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) => *op,
                _ => break,
            };
            let Some(prec) = precedence(op) else { break };
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            // `**` is right-associative.
            let next_min = if op == "**" { prec } else { prec + 1 };
            let rhs = self.binary(next_min)?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Ast, String> {
        self.nested(Self::unary_operand)
    }

    fn unary_operand(&mut self) -> Result<Ast, String> {
        match self.peek() {
            Some(Token::Op(op @ ("-" | "+" | "!" | "~"))) => {
                let op = *op;
                self.pos += 1;
                let operand = self.unary()?;
                Ok(Ast::Unary(op, Box::new(operand)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Ast, String> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Ast::Num(n)),
            Some(Token::Var(name)) => Ok(Ast::Var(name)),
            Some(Token::Cmd(script)) => Ok(Ast::Cmd(script)),
            Some(Token::Quoted(text)) => Ok(Ast::Quoted(text)),
            Some(Token::Braced(text)) => Ok(Ast::Literal(text)),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                if self.next() != Some(Token::RParen) {
                    return Err("missing close parenthesis".to_string());
                }
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() == Some(&Token::RParen) {
                        self.pos += 1;
                    } else {
                        loop {
                            args.push(self.ternary()?);
                            match self.next() {
                                Some(Token::Comma) => continue,
                                Some(Token::RParen) => break,
                                _ => return Err(format!("missing close parenthesis in call to {name}")),
                            }
                        }
                    }
                    return Ok(Ast::Call(name, args));
                }
                match name.to_ascii_lowercase().as_str() {
                    "true" | "yes" | "on" => Ok(Ast::Num(Number::Int(1))),
                    "false" | "no" | "off" => Ok(Ast::Num(Number::Int(0))),
                    "inf" => Ok(Ast::Num(Number::Float(f64::INFINITY))),
                    "nan" => Ok(Ast::Num(Number::Float(f64::NAN))),
                    _ => Err(format!("invalid bareword \"{name}\"")),
                }
            }
            Some(other) => Err(format!("unexpected token {other:?} in expression")),
            None => Err("premature end of expression".to_string()),
        }
    }
}

fn evaluate<H: ExprHost>(ast: &Ast, host: &mut H) -> Result<Value, H::Error> {
    match ast {
        Ast::Num(n) => Ok((*n).into()),
        Ast::Var(name) => host.var(name),
        Ast::Cmd(script) => host.command(script),
        Ast::Quoted(text) => host.substitute(text),
        Ast::Literal(text) => Ok(Value::Str(text.clone())),
        Ast::Unary(op, operand) => {
            let v = evaluate(operand, host)?;
            unary(op, &v).map_err(|m| host.fail(m))
        }
        Ast::Binary("&&", lhs, rhs) => {
            let l = truthy(&evaluate(lhs, host)?).map_err(|m| host.fail(m))?;
            if !l {
                return Ok(Value::Int(0));
            }
            let r = truthy(&evaluate(rhs, host)?).map_err(|m| host.fail(m))?;
            Ok(r.into())
        }
        Ast::Binary("||", lhs, rhs) => {
            let l = truthy(&evaluate(lhs, host)?).map_err(|m| host.fail(m))?;
            if l {
                return Ok(Value::Int(1));
            }
            let r = truthy(&evaluate(rhs, host)?).map_err(|m| host.fail(m))?;
            Ok(r.into())
        }
        Ast::Binary(op, lhs, rhs) => {
            let l = evaluate(lhs, host)?;
            let r = evaluate(rhs, host)?;
            binary(op, &l, &r).map_err(|m| host.fail(m))
        }
        Ast::Ternary(cond, then, otherwise) => {
            let c = truthy(&evaluate(cond, host)?).map_err(|m| host.fail(m))?;
            if c {
                evaluate(then, host)
            } else {
                evaluate(otherwise, host)
            }
        }
        Ast::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(evaluate(arg, host)?);
            }
            call(name, &values).map_err(|m| host.fail(m))
        }
    }
}

fn truthy(v: &Value) -> Result<bool, String> {
    v.as_bool()
}

fn numeric(v: &Value, op: &str) -> Result<Number, String> {
    v.as_number().ok_or_else(|| {
        format!(
            "can't use non-numeric string \"{}\" as operand of \"{op}\"",
            v.as_str()
        )
    })
}

fn int_operand(v: &Value, op: &str) -> Result<i64, String> {
    match numeric(v, op)? {
        Number::Int(n) => Ok(n),
        Number::Float(_) => Err(format!(
            "can't use floating-point value as operand of \"{op}\""
        )),
    }
}

fn overflow() -> String {
    "integer overflow".to_string()
}

fn unary(op: &str, v: &Value) -> Result<Value, String> {
    match op {
        "-" => match numeric(v, op)? {
            Number::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(overflow),
            Number::Float(x) => Ok(Value::Float(-x)),
        },
        "+" => Ok(numeric(v, op)?.into()),
        "!" => Ok((!truthy(v)?).into()),
        "~" => Ok(Value::Int(!int_operand(v, op)?)),
        _ => Err(format!("unknown unary operator \"{op}\"")),
    }
}

fn binary(op: &str, l: &Value, r: &Value) -> Result<Value, String> {
    match op {
        "eq" => return Ok((l.as_str() == r.as_str()).into()),
        "ne" => return Ok((l.as_str() != r.as_str()).into()),
        "in" | "ni" => {
            let needle = l.as_str();
            let found = r.as_list()?.iter().any(|item| item.as_str() == needle);
            return Ok((if op == "in" { found } else { !found }).into());
        }
        "==" | "!=" | "<" | ">" | "<=" | ">=" => return compare(op, l, r),
        _ => {}
    }

    match op {
        "&" | "|" | "^" | "<<" | ">>" => {
            let a = int_operand(l, op)?;
            let b = int_operand(r, op)?;
            return match op {
                "&" => Ok(Value::Int(a & b)),
                "|" => Ok(Value::Int(a | b)),
                "^" => Ok(Value::Int(a ^ b)),
                "<<" => u32::try_from(b)
                    .ok()
                    .and_then(|s| a.checked_shl(s))
                    .filter(|v| v >> b == a)
                    .map(Value::Int)
                    .ok_or_else(overflow),
                _ if b < 0 => Err("negative shift argument".to_string()),
                _ if b >= 64 => Ok(Value::Int(if a < 0 { -1 } else { 0 })),
                _ => Ok(Value::Int(a >> b)),
            };
        }
        _ => {}
    }

    let a = numeric(l, op)?;
    let b = numeric(r, op)?;
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => int_arith(op, x, y),
        _ => {
            let x = as_f64(a);
            let y = as_f64(b);
            let v = match op {
                "+" => x + y,
                "-" => x - y,
                "*" => x * y,
                "/" => {
                    if y == 0.0 {
                        return Err("divide by zero".to_string());
                    }
                    x / y
                }
                "%" => return Err("can't use floating-point value as operand of \"%\"".to_string()),
                "**" => x.powf(y),
                _ => return Err(format!("unknown operator \"{op}\"")),
            };
            Ok(Value::Float(v))
        }
    }
}

fn int_arith(op: &str, x: i64, y: i64) -> Result<Value, String> {
    let v = match op {
        "+" => x.checked_add(y),
        "-" => x.checked_sub(y),
        "*" => x.checked_mul(y),
        "/" => {
            if y == 0 {
                return Err("divide by zero".to_string());
            }
            // Integer division floors toward negative infinity.
            x.checked_div(y).map(|q| {
                if x % y != 0 && (x < 0) != (y < 0) {
                    q - 1
                } else {
                    q
                }
            })
        }
        "%" => {
            if y == 0 {
                return Err("divide by zero".to_string());
            }
            // Remainder takes the sign of the divisor.
            x.checked_rem(y).map(|m| if m != 0 && (m < 0) != (y < 0) { m + y } else { m })
        }
        "**" => {
            if y < 0 {
                return match x {
                    0 => Err("exponentiation of zero by negative power".to_string()),
                    1 => Ok(Value::Int(1)),
                    -1 => Ok(Value::Int(if y % 2 == 0 { 1 } else { -1 })),
                    _ => Ok(Value::Int(0)),
                };
            }
            u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
        }
        _ => return Err(format!("unknown operator \"{op}\"")),
    };
    v.map(Value::Int).ok_or_else(overflow)
}

fn as_f64(n: Number) -> f64 {
    match n {
        Number::Int(i) => i as f64,
        Number::Float(x) => x,
    }
}

fn compare(op: &str, l: &Value, r: &Value) -> Result<Value, String> {
    use std::cmp::Ordering;
    let ordering = match (l.as_number(), r.as_number()) {
        (Some(Number::Int(a)), Some(Number::Int(b))) => Some(a.cmp(&b)),
        (Some(a), Some(b)) => as_f64(a).partial_cmp(&as_f64(b)),
        _ => Some(l.as_str().cmp(&r.as_str())),
    };
    let result = match ordering {
        // NaN compares unequal to everything.
        None => op == "!=",
        Some(ord) => match op {
            "==" => ord == Ordering::Equal,
            "!=" => ord != Ordering::Equal,
            "<" => ord == Ordering::Less,
            ">" => ord == Ordering::Greater,
            "<=" => ord != Ordering::Greater,
            _ => ord != Ordering::Less,
        },
    };
    Ok(result.into())
}

fn call(name: &str, args: &[Value]) -> Result<Value, String> {
    let arity = |n: usize| -> Result<(), String> {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!(
                "wrong # args for math function \"{name}\": expected {n}, got {}",
                args.len()
            ))
        }
    };
    let float_arg = |i: usize| -> Result<f64, String> { args[i].as_float() };

    match name {
        "abs" => {
            arity(1)?;
            match numeric(&args[0], name)? {
                Number::Int(n) => n.checked_abs().map(Value::Int).ok_or_else(overflow),
                Number::Float(x) => Ok(Value::Float(x.abs())),
            }
        }
        "int" | "wide" | "entier" => {
            arity(1)?;
            match numeric(&args[0], name)? {
                Number::Int(n) => Ok(Value::Int(n)),
                Number::Float(x) => float_to_int(x.trunc()),
            }
        }
        "double" => {
            arity(1)?;
            Ok(Value::Float(float_arg(0)?))
        }
        "round" => {
            arity(1)?;
            match numeric(&args[0], name)? {
                Number::Int(n) => Ok(Value::Int(n)),
                Number::Float(x) => float_to_int(x.round()),
            }
        }
        "floor" => {
            arity(1)?;
            Ok(Value::Float(float_arg(0)?.floor()))
        }
        "ceil" => {
            arity(1)?;
            Ok(Value::Float(float_arg(0)?.ceil()))
        }
        "sqrt" => {
            arity(1)?;
            let x = float_arg(0)?;
            if x < 0.0 {
                return Err("domain error: argument not in valid range".to_string());
            }
            Ok(Value::Float(x.sqrt()))
        }
        "exp" => {
            arity(1)?;
            Ok(Value::Float(float_arg(0)?.exp()))
        }
        "log" => {
            arity(1)?;
            let x = float_arg(0)?;
            if x <= 0.0 {
                return Err("domain error: argument not in valid range".to_string());
            }
            Ok(Value::Float(x.ln()))
        }
        "pow" => {
            arity(2)?;
            Ok(Value::Float(float_arg(0)?.powf(float_arg(1)?)))
        }
        "fmod" => {
            arity(2)?;
            let y = float_arg(1)?;
            if y == 0.0 {
                return Err("domain error: argument not in valid range".to_string());
            }
            Ok(Value::Float(float_arg(0)? % y))
        }
        "min" | "max" => {
            if args.is_empty() {
                return Err(format!("too few arguments to math function \"{name}\""));
            }
            let mut best = numeric(&args[0], name)?;
            for arg in &args[1..] {
                let candidate = numeric(arg, name)?;
                let better = if name == "min" {
                    as_f64(candidate) < as_f64(best)
                } else {
                    as_f64(candidate) > as_f64(best)
                };
                if better {
                    best = candidate;
                }
            }
            Ok(best.into())
        }
        "bool" => {
            arity(1)?;
            Ok(args[0].as_bool()?.into())
        }
        _ => Err(format!("unknown math function \"{name}\"")),
    }
}

fn float_to_int(x: f64) -> Result<Value, String> {
    if x.is_finite() && x >= i64::MIN as f64 && x <= i64::MAX as f64 {
        Ok(Value::Int(x as i64))
    } else {
        Err(format!(
            "integer value too large to represent: {}",
            format_float(x)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Vars(HashMap<String, Value>);

    impl ExprHost for Vars {
        type Error = String;

        fn var(&mut self, name: &str) -> Result<Value, String> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| format!("can't read \"{name}\": no such variable"))
        }

        fn command(&mut self, script: &str) -> Result<Value, String> {
            Err(format!("commands unavailable: {script}"))
        }

        fn substitute(&mut self, text: &str) -> Result<Value, String> {
            Ok(Value::from(text))
        }

        fn fail(&self, message: String) -> String {
            message
        }
    }

    fn calc(src: &str) -> Result<Value, String> {
        let mut host = Vars(HashMap::from([
            ("x".to_string(), Value::from("10")),
            ("name".to_string(), Value::from("abc")),
        ]));
        eval(src, &mut host)
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(calc("1 + 1").unwrap(), Value::Int(2));
        assert_eq!(calc("2 + 3 * 4").unwrap(), Value::Int(14));
        assert_eq!(calc("(2 + 3) * 4").unwrap(), Value::Int(20));
        assert_eq!(calc("2 ** 3 ** 2").unwrap(), Value::Int(512));
        assert_eq!(calc("-7 / 2").unwrap(), Value::Int(-4));
        assert_eq!(calc("-7 % 2").unwrap(), Value::Int(1));
        assert_eq!(calc("7 / 2.0").unwrap(), Value::Float(3.5));
        assert_eq!(calc("$x * 2").unwrap(), Value::Int(20));
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(calc("$x > 5 && $x < 20").unwrap(), Value::Int(1));
        assert_eq!(calc("$name eq \"abc\"").unwrap(), Value::Int(1));
        assert_eq!(calc("\"b\" in {a b c}").unwrap(), Value::Int(1));
        assert_eq!(calc("$x == 10.0").unwrap(), Value::Int(1));
        assert_eq!(calc("0 && [boom]").unwrap(), Value::Int(0));
        assert_eq!(calc("1 ? 2 : [boom]").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_functions() {
        assert_eq!(calc("max(1, 7, 3)").unwrap(), Value::Int(7));
        assert_eq!(calc("round(2.5)").unwrap(), Value::Int(3));
        assert_eq!(calc("sqrt(16)").unwrap(), Value::Float(4.0));
        assert_eq!(calc("abs(-3)").unwrap(), Value::Int(3));
    }

    #[test]
    fn test_errors() {
        assert!(calc("1 / 0").unwrap_err().contains("divide by zero"));
        assert!(calc("9223372036854775807 + 1")
            .unwrap_err()
            .contains("overflow"));
        assert!(calc("$name + 1").unwrap_err().contains("non-numeric"));
        assert!(calc("1 +").is_err());
        assert!(calc("foo").unwrap_err().contains("bareword"));
    }

    #[test]
    fn test_deep_nesting_is_an_error() {
        let parens = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(calc(&parens).unwrap_err().contains("nested too deeply"));
        assert!(calc(&"-".repeat(10_000)).unwrap_err().contains("nested too deeply"));
        let chain = format!("{}0", "1 ? 1 : ".repeat(10_000));
        assert!(calc(&chain).unwrap_err().contains("nested too deeply"));
        assert_eq!(calc("((((1 + 2))))").unwrap().as_str(), "3");
    }
}
