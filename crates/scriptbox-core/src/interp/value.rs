//! Script values.
//!
//! Every value has a string form (the dialect is string-typed at the surface),
//! but values produced by arithmetic, list and dict commands keep their
//! structure so the output formatter can walk them without re-parsing.

use std::borrow::Cow;
use std::fmt;

/// A script value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<Value>),
    /// Insertion-ordered key/value pairs with unique keys.
    Dict(Vec<(String, Value)>),
}

impl Default for Value {
    fn default() -> Self {
        Value::Str(String::new())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        // Conditions yield 1/0 like the rest of the dialect.
        Value::Int(i64::from(b))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl Value {
    pub fn empty() -> Self {
        Value::Str(String::new())
    }

    /// String form of the value.
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            Value::Str(s) => Cow::Borrowed(s),
            Value::Int(n) => Cow::Owned(n.to_string()),
            Value::Float(x) => Cow::Owned(format_float(*x)),
            Value::Bool(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
            Value::List(items) => Cow::Owned(format_list(items.iter().map(|v| v.as_str()))),
            Value::Dict(pairs) => Cow::Owned(format_list(
                pairs
                    .iter()
                    .flat_map(|(k, v)| [Cow::Borrowed(k.as_str()), v.as_str()]),
            )),
        }
    }

    pub fn is_empty_string(&self) -> bool {
        matches!(self, Value::Str(s) if s.is_empty())
    }

    /// Interpret the value as a list.
    pub fn as_list(&self) -> Result<Vec<Value>, String> {
        match self {
            Value::List(items) => Ok(items.clone()),
            Value::Dict(pairs) => Ok(pairs
                .iter()
                .flat_map(|(k, v)| [Value::Str(k.clone()), v.clone()])
                .collect()),
            Value::Str(s) => Ok(parse_list(s)?.into_iter().map(Value::Str).collect()),
            scalar => Ok(vec![scalar.clone()]),
        }
    }

    /// Interpret the value as a dict (even-length list of key/value pairs).
    pub fn as_dict(&self) -> Result<Vec<(String, Value)>, String> {
        if let Value::Dict(pairs) = self {
            return Ok(pairs.clone());
        }
        let items = self.as_list()?;
        if items.len() % 2 != 0 {
            return Err("missing value to go with key".to_string());
        }
        let mut pairs: Vec<(String, Value)> = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            dict_put(&mut pairs, k.as_str().into_owned(), v);
        }
        Ok(pairs)
    }

    pub fn as_int(&self) -> Result<i64, String> {
        match self {
            Value::Int(n) => Ok(*n),
            Value::Bool(b) => Ok(i64::from(*b)),
            other => {
                let s = other.as_str();
                parse_int(s.trim()).ok_or_else(|| format!("expected integer but got \"{s}\""))
            }
        }
    }

    pub fn as_float(&self) -> Result<f64, String> {
        match self.as_number() {
            Some(Number::Int(n)) => Ok(n as f64),
            Some(Number::Float(x)) => Ok(x),
            None => Err(format!(
                "expected floating-point number but got \"{}\"",
                self.as_str()
            )),
        }
    }

    /// Numeric view, if the value looks like a number.
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Int(n) => Some(Number::Int(*n)),
            Value::Float(x) => Some(Number::Float(*x)),
            Value::Bool(b) => Some(Number::Int(i64::from(*b))),
            Value::List(_) | Value::Dict(_) => None,
            Value::Str(s) => parse_number(s.trim()),
        }
    }

    pub fn as_bool(&self) -> Result<bool, String> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(n) => Ok(*n != 0),
            Value::Float(x) => Ok(*x != 0.0),
            other => {
                let s = other.as_str();
                let trimmed = s.trim();
                match trimmed.to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => return Ok(true),
                    "0" | "false" | "no" | "off" => return Ok(false),
                    _ => {}
                }
                match parse_number(trimmed) {
                    Some(Number::Int(n)) => Ok(n != 0),
                    Some(Number::Float(x)) => Ok(x != 0.0),
                    None => Err(format!("expected boolean value but got \"{s}\"")),
                }
            }
        }
    }

    /// Rough heap footprint, used for memory accounting.
    pub fn approx_size(&self) -> usize {
        const OVERHEAD: usize = 24;
        match self {
            Value::Str(s) => OVERHEAD + s.len(),
            Value::Int(_) | Value::Float(_) | Value::Bool(_) => OVERHEAD,
            Value::List(items) => OVERHEAD + items.iter().map(Value::approx_size).sum::<usize>(),
            Value::Dict(pairs) => {
                OVERHEAD
                    + pairs
                        .iter()
                        .map(|(k, v)| OVERHEAD + k.len() + v.approx_size())
                        .sum::<usize>()
            }
        }
    }

    /// Structured JSON view.
    ///
    /// Strings stay strings except canonical integers ("42", "-7"), which
    /// become numbers; "007" or "1.0" are left untouched.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Str(s) => match s.parse::<i64>() {
                Ok(n) if n.to_string() == *s => J::from(n),
                _ => J::String(s.clone()),
            },
            Value::Int(n) => J::from(*n),
            Value::Float(x) => serde_json::Number::from_f64(*x)
                .map(J::Number)
                .unwrap_or_else(|| J::String(format_float(*x))),
            Value::Bool(b) => J::Bool(*b),
            Value::List(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Dict(pairs) => J::Object(
                pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => Value::empty(),
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            J::String(s) => Value::Str(s.clone()),
            J::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            J::Object(map) => Value::Dict(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

/// Numeric operand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl From<Number> for Value {
    fn from(n: Number) -> Self {
        match n {
            Number::Int(i) => Value::Int(i),
            Number::Float(x) => Value::Float(x),
        }
    }
}

/// Insert or replace `key` keeping first-insertion order.
pub fn dict_put(pairs: &mut Vec<(String, Value)>, key: String, value: Value) {
    match pairs.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = value,
        None => pairs.push((key, value)),
    }
}

pub fn dict_get<'a>(pairs: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        "NaN".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "Inf" } else { "-Inf" }.to_string()
    } else {
        // Debug keeps a trailing ".0" on integral floats.
        format!("{x:?}")
    }
}

pub fn parse_int(s: &str) -> Option<i64> {
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (radix, body) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if let Some(bin) = digits.strip_prefix("0b") {
        (2, bin)
    } else if let Some(oct) = digits.strip_prefix("0o") {
        (8, oct)
    } else {
        (10, digits)
    };
    if body.is_empty() || !body.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    let magnitude = i64::from_str_radix(body, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

pub fn parse_number(s: &str) -> Option<Number> {
    if let Some(n) = parse_int(s) {
        return Some(Number::Int(n));
    }
    let lower = s.to_ascii_lowercase();
    match lower.as_str() {
        "inf" | "+inf" => return Some(Number::Float(f64::INFINITY)),
        "-inf" => return Some(Number::Float(f64::NEG_INFINITY)),
        "nan" => return Some(Number::Float(f64::NAN)),
        _ => {}
    }
    let looks_numeric = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        && s.chars().any(|c| c.is_ascii_digit());
    if looks_numeric {
        s.parse::<f64>().ok().map(Number::Float)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// List string form
// ---------------------------------------------------------------------------

/// Split a list string into its elements.
pub fn parse_list(s: &str) -> Result<Vec<String>, String> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        match chars[i] {
            '{' => {
                let mut depth = 1;
                let start = i + 1;
                i += 1;
                while i < chars.len() && depth > 0 {
                    match chars[i] {
                        '\\' => i += 1,
                        '{' => depth += 1,
                        '}' => depth -= 1,
                        _ => {}
                    }
                    i += 1;
                }
                if depth != 0 {
                    return Err("unmatched open brace in list".to_string());
                }
                out.push(chars[start..i - 1].iter().collect());
                if i < chars.len() && !chars[i].is_whitespace() {
                    return Err("list element in braces followed by non-whitespace".to_string());
                }
            }
            '"' => {
                let mut elem = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '"' => {
                            closed = true;
                            i += 1;
                            break;
                        }
                        '\\' => {
                            let (c, used) = backslash(&chars[i..]);
                            elem.push_str(&c);
                            i += used;
                        }
                        c => {
                            elem.push(c);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err("unmatched open quote in list".to_string());
                }
                if i < chars.len() && !chars[i].is_whitespace() {
                    return Err("list element in quotes followed by non-whitespace".to_string());
                }
                out.push(elem);
            }
            _ => {
                let mut elem = String::new();
                while i < chars.len() && !chars[i].is_whitespace() {
                    if chars[i] == '\\' {
                        let (c, used) = backslash(&chars[i..]);
                        elem.push_str(&c);
                        i += used;
                    } else {
                        elem.push(chars[i]);
                        i += 1;
                    }
                }
                out.push(elem);
            }
        }
    }
    Ok(out)
}

/// Decode one backslash sequence starting at `chars[0] == '\\'`.
/// Returns the replacement text and how many chars were consumed.
pub fn backslash(chars: &[char]) -> (String, usize) {
    let Some(&c) = chars.get(1) else {
        return ("\\".to_string(), 1);
    };
    let simple = match c {
        'n' => Some('\n'),
        't' => Some('\t'),
        'r' => Some('\r'),
        'a' => Some('\u{7}'),
        'b' => Some('\u{8}'),
        'f' => Some('\u{c}'),
        'v' => Some('\u{b}'),
        _ => None,
    };
    if let Some(ch) = simple {
        return (ch.to_string(), 2);
    }
    match c {
        '\n' => {
            let mut used = 2;
            while chars.get(used).is_some_and(|c| *c == ' ' || *c == '\t') {
                used += 1;
            }
            (" ".to_string(), used)
        }
        'x' | 'u' => {
            let max = if c == 'x' { 2 } else { 4 };
            let digits: String = chars[2..]
                .iter()
                .take(max)
                .take_while(|d| d.is_ascii_hexdigit())
                .collect();
            match u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32) {
                Some(ch) if !digits.is_empty() => (ch.to_string(), 2 + digits.len()),
                _ => (c.to_string(), 2),
            }
        }
        other => (other.to_string(), 2),
    }
}

/// Quote one element so that `parse_list` yields it back unchanged.
pub fn quote_element(s: &str) -> Cow<'_, str> {
    if s.is_empty() {
        return Cow::Borrowed("{}");
    }
    let needs_quoting = s.starts_with('#')
        || s.chars().any(|c| {
            c.is_whitespace() || matches!(c, '{' | '}' | '[' | ']' | '$' | '"' | ';' | '\\')
        });
    if !needs_quoting {
        return Cow::Borrowed(s);
    }
    if braces_balanced(s) && !s.ends_with('\\') && !s.contains('\\') {
        return Cow::Owned(format!("{{{s}}}"));
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        match c {
            '{' | '}' | '[' | ']' | '$' | '"' | ';' | '\\' | ' ' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    if out.starts_with('#') {
        out.insert(0, '\\');
    }
    Cow::Owned(out)
}

fn braces_balanced(s: &str) -> bool {
    let mut depth: i64 = 0;
    for c in s.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

pub fn format_list<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = Cow<'a, str>>,
{
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&quote_element(&item));
    }
    out
}
