//! Core command set.
//!
//! Everything here is pure computation over interpreter state. Commands that
//! touch the host (files, processes, sessions) are installed per execution
//! through [`Bindings`](super::Bindings) instead.

use std::time::{Duration, Instant};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};

use super::machine::{error, Flow, Machine, Outcome, Proc, Step};
use super::value::{dict_get, dict_put, format_float, parse_int, parse_list, parse_number, Value};

/// Names answered by `info commands` in addition to procs and host commands.
pub(crate) const BUILTIN_NAMES: &[&str] = &[
    "after", "append", "break", "catch", "clock", "concat", "continue", "dict", "error", "eval",
    "expr", "for", "foreach", "format", "global", "if", "incr", "info", "join", "lappend",
    "lindex", "list", "llength", "lrange", "lreverse", "lsearch", "lsort", "package", "proc",
    "puts", "return", "set", "split", "string", "subst", "time", "unset", "while",
];

pub(crate) fn dispatch(m: &mut Machine<'_>, name: &str, argv: &[Value]) -> Option<Outcome> {
    let result = match name {
        "after" => cmd_after(m, argv),
        "append" => cmd_append(m, argv),
        "break" => cmd_break(argv),
        "catch" => cmd_catch(m, argv),
        "clock" => cmd_clock(argv),
        "concat" => Ok(Value::Str(concat(&argv[1..]))),
        "continue" => cmd_continue(argv),
        "dict" => cmd_dict(m, argv),
        "error" => cmd_error(argv),
        "eval" => cmd_eval(m, argv),
        "expr" => cmd_expr(m, argv),
        "for" => cmd_for(m, argv),
        "foreach" => cmd_foreach(m, argv),
        "format" => cmd_format(m, argv),
        "global" => cmd_global(m, argv),
        "if" => cmd_if(m, argv),
        "incr" => cmd_incr(m, argv),
        "info" => cmd_info(m, argv),
        "join" => cmd_join(argv),
        "lappend" => cmd_lappend(m, argv),
        "lindex" => cmd_lindex(argv),
        "list" => Ok(Value::List(argv[1..].to_vec())),
        "llength" => cmd_llength(argv),
        "lrange" => cmd_lrange(argv),
        "lreverse" => cmd_lreverse(argv),
        "lsearch" => cmd_lsearch(argv),
        "lsort" => cmd_lsort(argv),
        "package" => cmd_package(m, argv),
        "proc" => cmd_proc(m, argv),
        "puts" => cmd_puts(m, argv),
        "return" => cmd_return(m, argv),
        "set" => cmd_set(m, argv),
        "split" => cmd_split(argv),
        "string" => cmd_string(m, argv),
        "subst" => cmd_subst(m, argv),
        "time" => cmd_time(m, argv),
        "unset" => cmd_unset(m, argv),
        "while" => cmd_while(m, argv),
        _ => return None,
    };
    Some(result)
}

fn wrong_args(usage: &str) -> Flow {
    error(format!("wrong # args: should be \"{usage}\""))
}

fn text(v: &Value) -> String {
    v.as_str().into_owned()
}

fn int_arg(v: &Value) -> Result<i64, Flow> {
    v.as_int().map_err(error)
}

fn list_arg(v: &Value) -> Result<Vec<Value>, Flow> {
    v.as_list().map_err(error)
}

fn dict_arg(v: &Value) -> Result<Vec<(String, Value)>, Flow> {
    v.as_dict().map_err(error)
}

fn join_words(args: &[Value]) -> String {
    args.iter()
        .map(|v| v.as_str().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn concat(args: &[Value]) -> String {
    args.iter()
        .map(|v| v.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve `end`, `end-N`, `N`, `N+M` style indices against `len`.
fn parse_index(spec: &str, len: usize) -> Result<i64, Flow> {
    let bad = || {
        error(format!(
            "bad index \"{spec}\": must be integer?[+-]integer? or end?[+-]integer?"
        ))
    };
    let spec = spec.trim();
    let (base, rest) = match spec.strip_prefix("end") {
        Some(rest) => (len as i64 - 1, rest),
        None => {
            let split = spec
                .char_indices()
                .skip(1)
                .find(|(_, c)| *c == '+' || *c == '-')
                .map_or(spec.len(), |(i, _)| i);
            (parse_int(&spec[..split]).ok_or_else(bad)?, &spec[split..])
        }
    };
    if rest.is_empty() {
        return Ok(base);
    }
    let offset = parse_int(rest).ok_or_else(bad)?;
    Ok(base.saturating_add(offset))
}

// -- variables --------------------------------------------------------------

fn cmd_set(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    match argv {
        [_, name] => m.get_var(&name.as_str()),
        [_, name, value] => m.set_var(&name.as_str(), value.clone()),
        _ => Err(wrong_args("set varName ?newValue?")),
    }
}

fn cmd_unset(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let mut names = &argv[1..];
    let mut nocomplain = false;
    if names.first().is_some_and(|n| n.as_str() == "-nocomplain") {
        nocomplain = true;
        names = &names[1..];
    }
    if names.first().is_some_and(|n| n.as_str() == "--") {
        names = &names[1..];
    }
    for name in names {
        let name = name.as_str();
        if !m.unset_var(&name) && !nocomplain {
            return Err(error(format!("can't unset \"{name}\": no such variable")));
        }
    }
    Ok(Value::empty())
}

fn cmd_incr(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let (name, amount) = match argv {
        [_, name] => (name, 1),
        [_, name, amount] => (name, int_arg(amount)?),
        _ => return Err(wrong_args("incr varName ?increment?")),
    };
    let name = name.as_str();
    let current = if m.var_exists(&name) {
        int_arg(&m.get_var(&name)?)?
    } else {
        0
    };
    let next = current
        .checked_add(amount)
        .ok_or_else(|| error("integer overflow"))?;
    m.set_var(&name, Value::Int(next))
}

fn cmd_append(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let [_, name, values @ ..] = argv else {
        return Err(wrong_args("append varName ?value ...?"));
    };
    let name = name.as_str();
    let mut current = if m.var_exists(&name) {
        text(&m.get_var(&name)?)
    } else {
        String::new()
    };
    let extra: usize = values.iter().map(|v| v.as_str().len()).sum();
    m.ensure_room(extra)?;
    for value in values {
        current.push_str(&value.as_str());
    }
    m.set_var(&name, Value::Str(current))
}

fn cmd_lappend(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let [_, name, values @ ..] = argv else {
        return Err(wrong_args("lappend varName ?value ...?"));
    };
    let name = name.as_str();
    let mut items = if m.var_exists(&name) {
        list_arg(&m.get_var(&name)?)?
    } else {
        Vec::new()
    };
    items.extend(values.iter().cloned());
    m.set_var(&name, Value::List(items))
}

fn cmd_global(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    for name in &argv[1..] {
        m.link_global(&name.as_str());
    }
    Ok(Value::empty())
}

// -- control flow -----------------------------------------------------------

fn cmd_if(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    const USAGE: &str = "if expr ?then? body ?elseif expr body ...? ?else body?";
    let mut i = 1;
    loop {
        let cond = argv.get(i).ok_or_else(|| wrong_args(USAGE))?;
        i += 1;
        if argv.get(i).is_some_and(|w| w.as_str() == "then") {
            i += 1;
        }
        let body = argv
            .get(i)
            .ok_or_else(|| error(format!("wrong # args: no script following \"{}\" argument", cond.as_str())))?;
        i += 1;
        if m.eval_condition(&cond.as_str())? {
            return m.eval_text(&body.as_str());
        }
        match argv.get(i) {
            None => return Ok(Value::empty()),
            Some(word) if word.as_str() == "elseif" => i += 1,
            Some(word) if word.as_str() == "else" => {
                let body = argv
                    .get(i + 1)
                    .ok_or_else(|| error("wrong # args: no script following \"else\" argument"))?;
                return m.eval_text(&body.as_str());
            }
            Some(body) => return m.eval_text(&body.as_str()),
        }
    }
}

fn cmd_while(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let [_, cond, body] = argv else {
        return Err(wrong_args("while test command"));
    };
    let (cond, body) = (text(cond), text(body));
    loop {
        m.checkpoint()?;
        if !m.eval_condition(&cond)? {
            break;
        }
        if matches!(m.run_body(&body)?, Step::Stop) {
            break;
        }
    }
    Ok(Value::empty())
}

fn cmd_for(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let [_, start, test, next, body] = argv else {
        return Err(wrong_args("for start test next command"));
    };
    let (test, next, body) = (text(test), text(next), text(body));
    m.eval_text(&start.as_str())?;
    loop {
        m.checkpoint()?;
        if !m.eval_condition(&test)? {
            break;
        }
        if matches!(m.run_body(&body)?, Step::Stop) {
            break;
        }
        m.eval_text(&next)?;
    }
    Ok(Value::empty())
}

fn cmd_foreach(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    if argv.len() < 4 || argv.len() % 2 != 0 {
        return Err(wrong_args("foreach varList list ?varList list ...? command"));
    }
    let body = text(&argv[argv.len() - 1]);
    let mut groups = Vec::new();
    for pair in argv[1..argv.len() - 1].chunks(2) {
        let vars: Vec<String> = list_arg(&pair[0])?.iter().map(text).collect();
        if vars.is_empty() {
            return Err(error("foreach varlist is empty"));
        }
        groups.push((vars, list_arg(&pair[1])?));
    }
    let rounds = groups
        .iter()
        .map(|(vars, items)| items.len().div_ceil(vars.len()))
        .max()
        .unwrap_or(0);

    for round in 0..rounds {
        m.checkpoint()?;
        for (vars, items) in &groups {
            for (j, var) in vars.iter().enumerate() {
                let item = items
                    .get(round * vars.len() + j)
                    .cloned()
                    .unwrap_or_default();
                m.set_var(var, item)?;
            }
        }
        if matches!(m.run_body(&body)?, Step::Stop) {
            break;
        }
    }
    Ok(Value::empty())
}

fn cmd_break(argv: &[Value]) -> Outcome {
    match argv {
        [_] => Err(Flow::Break),
        _ => Err(wrong_args("break")),
    }
}

fn cmd_continue(argv: &[Value]) -> Outcome {
    match argv {
        [_] => Err(Flow::Continue),
        _ => Err(wrong_args("continue")),
    }
}

fn cmd_return(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let mut args = &argv[1..];
    let mut code = "ok".to_string();
    while args.len() >= 2 {
        match args[0].as_str().as_ref() {
            "-code" => code = text(&args[1]),
            "-level" | "-errorinfo" | "-errorcode" | "-options" => {}
            _ => break,
        }
        args = &args[2..];
    }
    // Several words are read as one expression: `return 1 + 1` yields 2.
    let value = match args {
        [] => Value::empty(),
        [single] => single.clone(),
        many => m.eval_expr(&join_words(many))?,
    };
    match code.as_str() {
        "ok" | "0" | "return" | "2" => Err(Flow::Return(value)),
        "error" | "1" => Err(Flow::Error(text(&value))),
        "break" | "3" => Err(Flow::Break),
        "continue" | "4" => Err(Flow::Continue),
        other => Err(error(format!(
            "bad completion code \"{other}\": must be ok, error, return, break, continue, or an integer"
        ))),
    }
}

fn cmd_error(argv: &[Value]) -> Outcome {
    match argv {
        [_, message] | [_, message, _] | [_, message, _, _] => Err(Flow::Error(text(message))),
        _ => Err(wrong_args("error message ?errorInfo? ?errorCode?")),
    }
}

fn cmd_catch(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let (script, result_var, options_var) = match argv {
        [_, s] => (s, None, None),
        [_, s, r] => (s, Some(r), None),
        [_, s, r, o] => (s, Some(r), Some(o)),
        _ => return Err(wrong_args("catch script ?resultVarName? ?optionVarName?")),
    };
    let (code, value) = match m.eval_text(&script.as_str()) {
        Ok(value) => (0, value),
        Err(Flow::Error(message)) => (1, Value::Str(message)),
        Err(Flow::Return(value)) => (2, value),
        Err(Flow::Break) => (3, Value::empty()),
        Err(Flow::Continue) => (4, Value::empty()),
        Err(abort @ Flow::Abort(_)) => return Err(abort),
    };
    if let Some(var) = result_var {
        m.set_var(&var.as_str(), value)?;
    }
    if let Some(var) = options_var {
        let options = Value::Dict(vec![
            ("-code".to_string(), Value::Int(code)),
            ("-level".to_string(), Value::Int(0)),
        ]);
        m.set_var(&var.as_str(), options)?;
    }
    Ok(Value::Int(code))
}

fn cmd_eval(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    match argv {
        [_] => Err(wrong_args("eval arg ?arg ...?")),
        [_, script] => m.eval_text(&script.as_str()),
        [_, args @ ..] => m.eval_text(&concat(args)),
        [] => Err(wrong_args("eval arg ?arg ...?")),
    }
}

fn cmd_expr(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    if argv.len() < 2 {
        return Err(wrong_args("expr arg ?arg ...?"));
    }
    m.eval_expr(&join_words(&argv[1..]))
}

fn cmd_subst(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    match argv {
        [_, source] => m.subst_text(&source.as_str()),
        _ => Err(wrong_args("subst string")),
    }
}

fn cmd_proc(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let [_, name, params, body] = argv else {
        return Err(wrong_args("proc name args body"));
    };
    let mut parsed = Vec::new();
    for spec in list_arg(params)? {
        let fields = list_arg(&spec)?;
        match fields.as_slice() {
            [param] => parsed.push((text(param), None)),
            [param, default] => parsed.push((text(param), Some(default.clone()))),
            [] => return Err(error("argument with no name")),
            _ => {
                return Err(error(format!(
                    "too many fields in argument specifier \"{}\"",
                    spec.as_str()
                )))
            }
        }
    }
    m.define_proc(
        text(name),
        Proc {
            params: parsed,
            body: text(body),
        },
    )?;
    Ok(Value::empty())
}

fn cmd_after(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let [_, ms, script @ ..] = argv else {
        return Err(wrong_args("after option ?arg ...?"));
    };
    let ms = ms.as_str();
    let millis = match parse_int(ms.trim()) {
        Some(n) => n.max(0) as u64,
        None => {
            return Err(error(format!(
                "bad argument \"{ms}\": must be an integer number of milliseconds"
            )))
        }
    };
    m.sleep(Duration::from_millis(millis))?;
    if script.is_empty() {
        Ok(Value::empty())
    } else {
        m.eval_text(&concat(script))
    }
}

fn cmd_time(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let (script, count) = match argv {
        [_, script] => (script, 1),
        [_, script, count] => (script, int_arg(count)?),
        _ => return Err(wrong_args("time command ?count?")),
    };
    let script = text(script);
    let started = Instant::now();
    for _ in 0..count.max(0) {
        m.eval_text(&script)?;
    }
    let per = if count > 0 {
        started.elapsed().as_micros() as f64 / count as f64
    } else {
        0.0
    };
    Ok(Value::Str(format!(
        "{} microseconds per iteration",
        per.round() as i64
    )))
}

// -- output -----------------------------------------------------------------

fn cmd_puts(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let (newline, channel, message) = match argv {
        [_, s] => (true, None, s),
        [_, flag, s] if flag.as_str() == "-nonewline" => (false, None, s),
        [_, channel, s] => (true, Some(channel), s),
        [_, flag, channel, s] if flag.as_str() == "-nonewline" => (false, Some(channel), s),
        _ => return Err(wrong_args("puts ?-nonewline? ?channelId? string")),
    };
    if let Some(channel) = channel {
        let channel = channel.as_str();
        if channel != "stdout" && channel != "stderr" {
            return Err(error(format!("can not find channel named \"{channel}\"")));
        }
    }
    let mut line = text(message);
    if newline {
        line.push('\n');
    }
    m.emit(&line)?;
    Ok(Value::empty())
}

/// Read a decimal field width or precision.
fn field_number(spec: &[char], i: &mut usize) -> Result<usize, Flow> {
    let mut n = 0usize;
    while let Some(d) = spec.get(*i).and_then(|c| c.to_digit(10)) {
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add(d as usize))
            .ok_or_else(|| error("field width or precision too large"))?;
        *i += 1;
    }
    Ok(n)
}

fn cmd_format(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let [_, spec, args @ ..] = argv else {
        return Err(wrong_args("format formatString ?arg ...?"));
    };
    let spec: Vec<char> = spec.as_str().chars().collect();
    let mut args = args.iter();
    let mut out = String::new();
    let mut i = 0;
    while i < spec.len() {
        let c = spec[i];
        i += 1;
        if c != '%' {
            out.push(c);
            continue;
        }
        if spec.get(i) == Some(&'%') {
            out.push('%');
            i += 1;
            continue;
        }

        let (mut left, mut zero, mut plus) = (false, false, false);
        while let Some(&flag) = spec.get(i) {
            match flag {
                '-' => left = true,
                '0' => zero = true,
                '+' => plus = true,
                ' ' | '#' => {}
                _ => break,
            }
            i += 1;
        }
        let width = field_number(&spec, &mut i)?;
        let mut precision = None;
        if spec.get(i) == Some(&'.') {
            i += 1;
            precision = Some(field_number(&spec, &mut i)?);
        }
        let Some(&conv) = spec.get(i) else {
            return Err(error("format string ended in middle of field specifier"));
        };
        i += 1;

        let arg = args
            .next()
            .ok_or_else(|| error("not enough arguments for all format specifiers"))?;
        let signed = |s: String, non_negative: bool| {
            if plus && non_negative {
                format!("+{s}")
            } else {
                s
            }
        };
        let body = match conv {
            's' => {
                let s = text(arg);
                match precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s,
                }
            }
            'd' | 'i' => {
                let n = int_arg(arg)?;
                signed(n.to_string(), n >= 0)
            }
            'x' => format!("{:x}", int_arg(arg)?),
            'X' => format!("{:X}", int_arg(arg)?),
            'o' => format!("{:o}", int_arg(arg)?),
            'c' => {
                let code = int_arg(arg)?;
                u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| error(format!("character code {code} out of range")))?
                    .to_string()
            }
            'f' => {
                let x = arg.as_float().map_err(error)?;
                let precision = precision.unwrap_or(6);
                m.ensure_room(precision)?;
                signed(format!("{:.*}", precision, x), x >= 0.0)
            }
            'g' => {
                let x = arg.as_float().map_err(error)?;
                signed(format_float(x), x >= 0.0)
            }
            other => return Err(error(format!("bad field specifier \"{other}\""))),
        };

        let len = body.chars().count();
        if len < width {
            m.ensure_room(out.len().saturating_add(width))?;
        }
        if len >= width {
            out.push_str(&body);
        } else if left {
            out.push_str(&body);
            out.extend(std::iter::repeat(' ').take(width - len));
        } else if zero && conv != 's' {
            let (sign, digits) = match body.chars().next() {
                Some(s @ ('-' | '+')) => (Some(s), &body[1..]),
                _ => (None, body.as_str()),
            };
            out.extend(sign);
            out.extend(std::iter::repeat('0').take(width - len));
            out.push_str(digits);
        } else {
            out.extend(std::iter::repeat(' ').take(width - len));
            out.push_str(&body);
        }
    }
    Ok(Value::Str(out))
}

// -- lists ------------------------------------------------------------------

fn cmd_llength(argv: &[Value]) -> Outcome {
    match argv {
        [_, list] => Ok(Value::Int(list_arg(list)?.len() as i64)),
        _ => Err(wrong_args("llength list")),
    }
}

fn cmd_lindex(argv: &[Value]) -> Outcome {
    let [_, list, indices @ ..] = argv else {
        return Err(wrong_args("lindex list ?index ...?"));
    };
    let mut current = list.clone();
    for index in indices {
        for spec in list_arg(index)? {
            let items = list_arg(&current)?;
            let i = parse_index(&spec.as_str(), items.len())?;
            match usize::try_from(i).ok().and_then(|i| items.get(i)) {
                Some(item) => current = item.clone(),
                None => return Ok(Value::empty()),
            }
        }
    }
    Ok(current)
}

fn cmd_lrange(argv: &[Value]) -> Outcome {
    let [_, list, first, last] = argv else {
        return Err(wrong_args("lrange list first last"));
    };
    let items = list_arg(list)?;
    let len = items.len() as i64;
    let first = parse_index(&first.as_str(), items.len())?.max(0);
    let last = parse_index(&last.as_str(), items.len())?.min(len - 1);
    if first > last {
        return Ok(Value::List(Vec::new()));
    }
    Ok(Value::List(items[first as usize..=last as usize].to_vec()))
}

fn cmd_lreverse(argv: &[Value]) -> Outcome {
    match argv {
        [_, list] => {
            let mut items = list_arg(list)?;
            items.reverse();
            Ok(Value::List(items))
        }
        _ => Err(wrong_args("lreverse list")),
    }
}

fn cmd_join(argv: &[Value]) -> Outcome {
    let (list, sep) = match argv {
        [_, list] => (list, " ".to_string()),
        [_, list, sep] => (list, text(sep)),
        _ => return Err(wrong_args("join list ?joinString?")),
    };
    let items: Vec<String> = list_arg(list)?.iter().map(text).collect();
    Ok(Value::Str(items.join(&sep)))
}

fn cmd_split(argv: &[Value]) -> Outcome {
    let (source, chars) = match argv {
        [_, s] => (text(s), " \t\n\r".to_string()),
        [_, s, chars] => (text(s), text(chars)),
        _ => return Err(wrong_args("split string ?splitChars?")),
    };
    if source.is_empty() {
        return Ok(Value::List(Vec::new()));
    }
    let items = if chars.is_empty() {
        source.chars().map(|c| Value::Str(c.to_string())).collect()
    } else {
        source
            .split(|c| chars.contains(c))
            .map(Value::from)
            .collect()
    };
    Ok(Value::List(items))
}

#[derive(Clone, Copy)]
enum SortMode {
    Ascii,
    Dictionary,
    Integer,
    Real,
}

fn cmd_lsort(argv: &[Value]) -> Outcome {
    let [_, options @ .., list] = argv else {
        return Err(wrong_args("lsort ?-option value ...? list"));
    };
    let mut mode = SortMode::Ascii;
    let (mut decreasing, mut unique) = (false, false);
    for option in options {
        match option.as_str().as_ref() {
            "-ascii" => mode = SortMode::Ascii,
            "-dictionary" => mode = SortMode::Dictionary,
            "-integer" => mode = SortMode::Integer,
            "-real" => mode = SortMode::Real,
            "-increasing" => decreasing = false,
            "-decreasing" => decreasing = true,
            "-unique" => unique = true,
            other => {
                return Err(error(format!(
                    "bad option \"{other}\": must be -ascii, -decreasing, -dictionary, -increasing, -integer, -real, or -unique"
                )))
            }
        }
    }

    let mut items = list_arg(list)?;
    match mode {
        SortMode::Ascii => items.sort_by(|a, b| a.as_str().cmp(&b.as_str())),
        SortMode::Dictionary => items.sort_by(|a, b| {
            let (a, b) = (a.as_str(), b.as_str());
            a.to_lowercase()
                .cmp(&b.to_lowercase())
                .then_with(|| a.cmp(&b))
        }),
        SortMode::Integer => {
            let mut keyed = items
                .into_iter()
                .map(|v| Ok((int_arg(&v)?, v)))
                .collect::<Result<Vec<_>, Flow>>()?;
            keyed.sort_by_key(|(k, _)| *k);
            items = keyed.into_iter().map(|(_, v)| v).collect();
        }
        SortMode::Real => {
            let mut keyed = items
                .into_iter()
                .map(|v| Ok((v.as_float().map_err(error)?, v)))
                .collect::<Result<Vec<_>, Flow>>()?;
            keyed.sort_by(|a, b| a.0.total_cmp(&b.0));
            items = keyed.into_iter().map(|(_, v)| v).collect();
        }
    }
    if decreasing {
        items.reverse();
    }
    if unique {
        items.dedup_by(|a, b| a.as_str() == b.as_str());
    }
    Ok(Value::List(items))
}

fn cmd_lsearch(argv: &[Value]) -> Outcome {
    let [_, options @ .., list, pattern] = argv else {
        return Err(wrong_args("lsearch ?-option ...? list pattern"));
    };
    let (mut exact, mut nocase) = (false, false);
    for option in options {
        match option.as_str().as_ref() {
            "-exact" => exact = true,
            "-glob" => exact = false,
            "-nocase" => nocase = true,
            other => {
                return Err(error(format!(
                    "bad option \"{other}\": must be -exact, -glob, or -nocase"
                )))
            }
        }
    }
    let pattern = pattern.as_str();
    let found = list_arg(list)?.iter().position(|item| {
        let item = item.as_str();
        match (exact, nocase) {
            (true, false) => item == pattern,
            (true, true) => item.to_lowercase() == pattern.to_lowercase(),
            (false, nocase) => glob_match(&pattern, &item, nocase),
        }
    });
    Ok(Value::Int(found.map_or(-1, |i| i as i64)))
}

// -- strings ----------------------------------------------------------------

/// Tcl `string match` glob semantics: `*`, `?`, `[a-z]`, `\x`.
pub(crate) fn glob_match(pattern: &str, candidate: &str, nocase: bool) -> bool {
    let (p, t): (Vec<char>, Vec<char>) = if nocase {
        (
            pattern.to_lowercase().chars().collect(),
            candidate.to_lowercase().chars().collect(),
        )
    } else {
        (pattern.chars().collect(), candidate.chars().collect())
    };
    glob_at(&p, &t)
}

fn glob_at(p: &[char], t: &[char]) -> bool {
    match p.split_first() {
        None => t.is_empty(),
        Some((&'*', rest)) => {
            let rest = trim_stars(rest);
            rest.is_empty() || (0..=t.len()).any(|i| glob_at(rest, &t[i..]))
        }
        Some((&'?', rest)) => !t.is_empty() && glob_at(rest, &t[1..]),
        Some((&'[', rest)) => match rest.iter().position(|&c| c == ']') {
            Some(close) => match t.split_first() {
                Some((&c, tail)) => class_contains(&rest[..close], c) && glob_at(&rest[close + 1..], tail),
                None => false,
            },
            None => t.first() == Some(&'[') && glob_at(rest, &t[1..]),
        },
        Some((&'\\', rest)) if !rest.is_empty() => {
            t.first() == Some(&rest[0]) && glob_at(&rest[1..], &t[1..])
        }
        Some((&c, rest)) => t.first() == Some(&c) && glob_at(rest, &t[1..]),
    }
}

fn trim_stars(p: &[char]) -> &[char] {
    let skip = p.iter().take_while(|&&c| c == '*').count();
    &p[skip..]
}

fn class_contains(set: &[char], c: char) -> bool {
    let mut i = 0;
    while i < set.len() {
        if i + 2 < set.len() && set[i + 1] == '-' {
            let (lo, hi) = if set[i] <= set[i + 2] {
                (set[i], set[i + 2])
            } else {
                (set[i + 2], set[i])
            };
            if (lo..=hi).contains(&c) {
                return true;
            }
            i += 3;
        } else {
            if set[i] == c {
                return true;
            }
            i += 1;
        }
    }
    false
}

fn find_chars(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || needle.len() > hay.len() {
        return None;
    }
    (from..=hay.len() - needle.len()).find(|&i| hay[i..i + needle.len()] == *needle)
}

fn rfind_chars(hay: &[char], needle: &[char], upto: usize) -> Option<usize> {
    if needle.is_empty() || needle.len() > hay.len() {
        return None;
    }
    let last_start = (hay.len() - needle.len()).min(upto);
    (0..=last_start)
        .rev()
        .find(|&i| hay[i..i + needle.len()] == *needle)
}

fn chars_match_at(chars: &[char], at: usize, key: &[char], nocase: bool) -> bool {
    if at + key.len() > chars.len() {
        return false;
    }
    chars[at..at + key.len()].iter().zip(key).all(|(a, b)| {
        if nocase {
            a.to_lowercase().eq(b.to_lowercase())
        } else {
            a == b
        }
    })
}

fn char_range(chars: &[char], first: &Value, last: &Value) -> Result<String, Flow> {
    let len = chars.len() as i64;
    let first = parse_index(&first.as_str(), chars.len())?.max(0);
    let last = parse_index(&last.as_str(), chars.len())?.min(len - 1);
    if first > last {
        return Ok(String::new());
    }
    Ok(chars[first as usize..=last as usize].iter().collect())
}

fn is_class(class: &str, s: &str) -> Result<bool, Flow> {
    const TRUE_WORDS: &[&str] = &["1", "true", "yes", "on"];
    const FALSE_WORDS: &[&str] = &["0", "false", "no", "off"];
    let lower = s.to_ascii_lowercase();
    Ok(match class {
        "integer" | "wideinteger" | "entier" => parse_int(s.trim()).is_some(),
        "double" => parse_number(s.trim()).is_some(),
        "boolean" => TRUE_WORDS.contains(&lower.as_str()) || FALSE_WORDS.contains(&lower.as_str()),
        "true" => TRUE_WORDS.contains(&lower.as_str()),
        "false" => FALSE_WORDS.contains(&lower.as_str()),
        "alpha" => s.chars().all(char::is_alphabetic),
        "alnum" => s.chars().all(char::is_alphanumeric),
        "digit" => s.chars().all(|c| c.is_ascii_digit()),
        "space" => s.chars().all(char::is_whitespace),
        "upper" => s.chars().all(char::is_uppercase),
        "lower" => s.chars().all(char::is_lowercase),
        "ascii" => s.is_ascii(),
        "wordchar" => s.chars().all(|c| c.is_alphanumeric() || c == '_'),
        "list" => parse_list(s).is_ok(),
        other => {
            return Err(error(format!(
                "bad class \"{other}\": must be alnum, alpha, ascii, boolean, digit, double, false, integer, list, lower, space, true, upper, or wordchar"
            )))
        }
    })
}

fn cmd_string(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let Some(sub) = argv.get(1) else {
        return Err(wrong_args("string subcommand ?arg ...?"));
    };
    let args = &argv[2..];
    match sub.as_str().as_ref() {
        "length" => match args {
            [s] => Ok(Value::Int(s.as_str().chars().count() as i64)),
            _ => Err(wrong_args("string length string")),
        },
        "index" => match args {
            [s, index] => {
                let chars: Vec<char> = s.as_str().chars().collect();
                let i = parse_index(&index.as_str(), chars.len())?;
                Ok(usize::try_from(i)
                    .ok()
                    .and_then(|i| chars.get(i))
                    .map_or_else(Value::empty, |c| Value::Str(c.to_string())))
            }
            _ => Err(wrong_args("string index string charIndex")),
        },
        "range" => match args {
            [s, first, last] => {
                let chars: Vec<char> = s.as_str().chars().collect();
                Ok(Value::Str(char_range(&chars, first, last)?))
            }
            _ => Err(wrong_args("string range string first last")),
        },
        "toupper" => match args {
            [s] => Ok(Value::Str(s.as_str().to_uppercase())),
            _ => Err(wrong_args("string toupper string")),
        },
        "tolower" => match args {
            [s] => Ok(Value::Str(s.as_str().to_lowercase())),
            _ => Err(wrong_args("string tolower string")),
        },
        "totitle" => match args {
            [s] => {
                let s = s.as_str();
                let mut chars = s.chars();
                let titled = match chars.next() {
                    Some(first) => first
                        .to_uppercase()
                        .chain(chars.as_str().to_lowercase().chars())
                        .collect(),
                    None => String::new(),
                };
                Ok(Value::Str(titled))
            }
            _ => Err(wrong_args("string totitle string")),
        },
        op @ ("trim" | "trimleft" | "trimright") => {
            let (s, set) = match args {
                [s] => (text(s), " \t\n\r".to_string()),
                [s, set] => (text(s), text(set)),
                _ => return Err(wrong_args(&format!("string {op} string ?chars?"))),
            };
            let matcher = |c: char| set.contains(c);
            let trimmed = match op {
                "trim" => s.trim_matches(matcher),
                "trimleft" => s.trim_start_matches(matcher),
                _ => s.trim_end_matches(matcher),
            };
            Ok(Value::Str(trimmed.to_string()))
        }
        op @ ("equal" | "compare") => {
            let usage = format!("string {op} ?-nocase? ?-length int? string1 string2");
            let [options @ .., a, b] = args else {
                return Err(wrong_args(&usage));
            };
            let mut nocase = false;
            let mut length: Option<usize> = None;
            let mut i = 0;
            while i < options.len() {
                match options[i].as_str().as_ref() {
                    "-nocase" => nocase = true,
                    "-length" => {
                        let n = options.get(i + 1).ok_or_else(|| wrong_args(&usage))?;
                        length = usize::try_from(int_arg(n)?).ok();
                        i += 1;
                    }
                    _ => return Err(wrong_args(&usage)),
                }
                i += 1;
            }
            let prepare = |v: &Value| {
                let s = v.as_str();
                let s: String = match length {
                    Some(n) => s.chars().take(n).collect(),
                    None => s.into_owned(),
                };
                if nocase {
                    s.to_lowercase()
                } else {
                    s
                }
            };
            let (a, b) = (prepare(a), prepare(b));
            if op == "equal" {
                Ok(Value::from(a == b))
            } else {
                Ok(Value::Int(a.cmp(&b) as i64))
            }
        }
        "first" => {
            let (needle, hay, start) = match args {
                [n, h] => (n, h, 0),
                [n, h, s] => (n, h, parse_index(&s.as_str(), h.as_str().chars().count())?.max(0)),
                _ => return Err(wrong_args("string first needleString haystackString ?startIndex?")),
            };
            let hay: Vec<char> = hay.as_str().chars().collect();
            let needle: Vec<char> = needle.as_str().chars().collect();
            let found = find_chars(&hay, &needle, start as usize);
            Ok(Value::Int(found.map_or(-1, |i| i as i64)))
        }
        "last" => {
            let (needle, hay, upto) = match args {
                [n, h] => (n, h, i64::MAX),
                [n, h, s] => (n, h, parse_index(&s.as_str(), h.as_str().chars().count())?),
                _ => return Err(wrong_args("string last needleString haystackString ?lastIndex?")),
            };
            if upto < 0 {
                return Ok(Value::Int(-1));
            }
            let hay: Vec<char> = hay.as_str().chars().collect();
            let needle: Vec<char> = needle.as_str().chars().collect();
            let upto = usize::try_from(upto).unwrap_or(usize::MAX);
            let found = rfind_chars(&hay, &needle, upto);
            Ok(Value::Int(found.map_or(-1, |i| i as i64)))
        }
        "repeat" => match args {
            [s, count] => {
                let s = s.as_str();
                let count = usize::try_from(int_arg(count)?).unwrap_or(0);
                m.ensure_room(s.len().saturating_mul(count))?;
                Ok(Value::Str(s.repeat(count)))
            }
            _ => Err(wrong_args("string repeat string count")),
        },
        "reverse" => match args {
            [s] => Ok(Value::Str(s.as_str().chars().rev().collect())),
            _ => Err(wrong_args("string reverse string")),
        },
        "cat" => Ok(Value::Str(args.iter().map(text).collect())),
        "match" => {
            let (nocase, pattern, s) = match args {
                [p, s] => (false, p, s),
                [flag, p, s] if flag.as_str() == "-nocase" => (true, p, s),
                _ => return Err(wrong_args("string match ?-nocase? pattern string")),
            };
            Ok(Value::from(glob_match(&pattern.as_str(), &s.as_str(), nocase)))
        }
        "map" => {
            let (nocase, mapping, s) = match args {
                [mapping, s] => (false, mapping, s),
                [flag, mapping, s] if flag.as_str() == "-nocase" => (true, mapping, s),
                _ => return Err(wrong_args("string map ?-nocase? charMap string")),
            };
            let flat = list_arg(mapping)?;
            if flat.len() % 2 != 0 {
                return Err(error("char map list unbalanced"));
            }
            let pairs: Vec<(Vec<char>, String)> = flat
                .chunks(2)
                .map(|kv| (kv[0].as_str().chars().collect(), text(&kv[1])))
                .collect();
            let chars: Vec<char> = s.as_str().chars().collect();
            let mut out = String::with_capacity(chars.len());
            let mut i = 0;
            'scan: while i < chars.len() {
                for (key, replacement) in &pairs {
                    if !key.is_empty() && chars_match_at(&chars, i, key, nocase) {
                        out.push_str(replacement);
                        i += key.len();
                        continue 'scan;
                    }
                }
                out.push(chars[i]);
                i += 1;
            }
            Ok(Value::Str(out))
        }
        "replace" => {
            let (s, first, last, replacement) = match args {
                [s, f, l] => (s, f, l, String::new()),
                [s, f, l, r] => (s, f, l, text(r)),
                _ => return Err(wrong_args("string replace string first last ?string?")),
            };
            let chars: Vec<char> = s.as_str().chars().collect();
            let len = chars.len() as i64;
            let first = parse_index(&first.as_str(), chars.len())?;
            let last = parse_index(&last.as_str(), chars.len())?.min(len - 1);
            if first > last || first >= len || last < 0 {
                return Ok(s.clone());
            }
            let first = first.max(0) as usize;
            let mut out: String = chars[..first].iter().collect();
            out.push_str(&replacement);
            out.extend(&chars[last as usize + 1..]);
            Ok(Value::Str(out))
        }
        "is" => {
            let (class, strict, s) = match args {
                [class, s] => (class, false, s),
                [class, flag, s] if flag.as_str() == "-strict" => (class, true, s),
                _ => return Err(wrong_args("string is class ?-strict? string")),
            };
            let s = s.as_str();
            if s.is_empty() {
                return Ok(Value::from(!strict));
            }
            Ok(Value::from(is_class(&class.as_str(), &s)?))
        }
        other => Err(error(format!(
            "unknown or ambiguous subcommand \"{other}\": must be cat, compare, equal, first, index, is, last, length, map, match, range, repeat, replace, reverse, tolower, totitle, toupper, trim, trimleft, or trimright"
        ))),
    }
}

// -- dicts ------------------------------------------------------------------

fn dict_set_path(current: &Value, path: &[Value], value: Value) -> Result<Value, Flow> {
    let mut pairs = dict_arg(current)?;
    let Some((key, rest)) = path.split_first() else {
        return Ok(value);
    };
    let key = text(key);
    let inner = if rest.is_empty() {
        value
    } else {
        let existing = dict_get(&pairs, &key)
            .cloned()
            .unwrap_or_else(|| Value::Dict(Vec::new()));
        dict_set_path(&existing, rest, value)?
    };
    dict_put(&mut pairs, key, inner);
    Ok(Value::Dict(pairs))
}

fn dict_unset_path(current: &Value, path: &[Value]) -> Result<Value, Flow> {
    let mut pairs = dict_arg(current)?;
    let Some((key, rest)) = path.split_first() else {
        return Ok(current.clone());
    };
    let key = text(key);
    if rest.is_empty() {
        pairs.retain(|(k, _)| *k != key);
    } else if let Some(existing) = dict_get(&pairs, &key).cloned() {
        let updated = dict_unset_path(&existing, rest)?;
        dict_put(&mut pairs, key, updated);
    }
    Ok(Value::Dict(pairs))
}

fn dict_lookup(dict: &Value, keys: &[Value]) -> Result<Option<Value>, Flow> {
    let mut current = dict.clone();
    for key in keys {
        let pairs = dict_arg(&current)?;
        match dict_get(&pairs, &key.as_str()) {
            Some(next) => current = next.clone(),
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn dict_var(m: &Machine<'_>, name: &str) -> Result<Value, Flow> {
    if m.var_exists(name) {
        m.get_var(name)
    } else {
        Ok(Value::Dict(Vec::new()))
    }
}

fn cmd_dict(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let Some(sub) = argv.get(1) else {
        return Err(wrong_args("dict subcommand ?arg ...?"));
    };
    let args = &argv[2..];
    match sub.as_str().as_ref() {
        "create" => {
            if args.len() % 2 != 0 {
                return Err(wrong_args("dict create ?key value ...?"));
            }
            let mut pairs = Vec::with_capacity(args.len() / 2);
            for kv in args.chunks(2) {
                dict_put(&mut pairs, text(&kv[0]), kv[1].clone());
            }
            Ok(Value::Dict(pairs))
        }
        "get" => {
            let [dict, keys @ ..] = args else {
                return Err(wrong_args("dict get dictionary ?key ...?"));
            };
            if keys.is_empty() {
                return Ok(Value::Dict(dict_arg(dict)?));
            }
            dict_lookup(dict, keys)?.ok_or_else(|| {
                error(format!(
                    "key \"{}\" not known in dictionary",
                    keys[keys.len() - 1].as_str()
                ))
            })
        }
        "exists" => {
            let [dict, keys @ ..] = args else {
                return Err(wrong_args("dict exists dictionary key ?key ...?"));
            };
            if keys.is_empty() {
                return Err(wrong_args("dict exists dictionary key ?key ...?"));
            }
            let found = dict_lookup(dict, keys).ok().flatten().is_some();
            Ok(Value::from(found))
        }
        "set" => {
            let [var, path @ .., value] = args else {
                return Err(wrong_args("dict set dictVarName key ?key ...? value"));
            };
            if path.is_empty() {
                return Err(wrong_args("dict set dictVarName key ?key ...? value"));
            }
            let name = text(var);
            let updated = dict_set_path(&dict_var(m, &name)?, path, value.clone())?;
            m.set_var(&name, updated)
        }
        "unset" => {
            let [var, path @ ..] = args else {
                return Err(wrong_args("dict unset dictVarName key ?key ...?"));
            };
            if path.is_empty() {
                return Err(wrong_args("dict unset dictVarName key ?key ...?"));
            }
            let name = text(var);
            let updated = dict_unset_path(&dict_var(m, &name)?, path)?;
            m.set_var(&name, updated)
        }
        "incr" => {
            let (var, key, amount) = match args {
                [var, key] => (var, key, 1),
                [var, key, amount] => (var, key, int_arg(amount)?),
                _ => return Err(wrong_args("dict incr dictVarName key ?increment?")),
            };
            let name = text(var);
            let current = dict_var(m, &name)?;
            let pairs = dict_arg(&current)?;
            let old = match dict_get(&pairs, &key.as_str()) {
                Some(v) => int_arg(v)?,
                None => 0,
            };
            let next = old
                .checked_add(amount)
                .ok_or_else(|| error("integer overflow"))?;
            let updated = dict_set_path(&current, std::slice::from_ref(key), Value::Int(next))?;
            m.set_var(&name, updated)
        }
        "lappend" => {
            let [var, key, values @ ..] = args else {
                return Err(wrong_args("dict lappend dictVarName key ?value ...?"));
            };
            let name = text(var);
            let current = dict_var(m, &name)?;
            let pairs = dict_arg(&current)?;
            let mut items = match dict_get(&pairs, &key.as_str()) {
                Some(v) => list_arg(v)?,
                None => Vec::new(),
            };
            items.extend(values.iter().cloned());
            let updated = dict_set_path(&current, std::slice::from_ref(key), Value::List(items))?;
            m.set_var(&name, updated)
        }
        op @ ("keys" | "values") => {
            let (dict, pattern) = match args {
                [dict] => (dict, None),
                [dict, pattern] => (dict, Some(text(pattern))),
                _ => return Err(wrong_args(&format!("dict {op} dictionary ?globPattern?"))),
            };
            let matches = |s: &str| pattern.as_deref().map_or(true, |p| glob_match(p, s, false));
            let items = dict_arg(dict)?
                .into_iter()
                .filter_map(|(k, v)| match op {
                    "keys" => matches(&k).then(|| Value::Str(k)),
                    _ => matches(&v.as_str()).then_some(v),
                })
                .collect();
            Ok(Value::List(items))
        }
        "size" => match args {
            [dict] => Ok(Value::Int(dict_arg(dict)?.len() as i64)),
            _ => Err(wrong_args("dict size dictionary")),
        },
        "remove" => {
            let [dict, keys @ ..] = args else {
                return Err(wrong_args("dict remove dictionary ?key ...?"));
            };
            let mut pairs = dict_arg(dict)?;
            for key in keys {
                let key = key.as_str();
                pairs.retain(|(k, _)| *k != key);
            }
            Ok(Value::Dict(pairs))
        }
        "merge" => {
            let mut pairs = Vec::new();
            for dict in args {
                for (k, v) in dict_arg(dict)? {
                    dict_put(&mut pairs, k, v);
                }
            }
            Ok(Value::Dict(pairs))
        }
        "for" => {
            let [vars, dict, body] = args else {
                return Err(wrong_args("dict for {keyVarName valueVarName} dictionary script"));
            };
            let vars = list_arg(vars)?;
            let [key_var, value_var] = vars.as_slice() else {
                return Err(error("must have exactly two variable names"));
            };
            let (key_var, value_var, body) = (text(key_var), text(value_var), text(body));
            for (k, v) in dict_arg(dict)? {
                m.checkpoint()?;
                m.set_var(&key_var, Value::Str(k))?;
                m.set_var(&value_var, v)?;
                if matches!(m.run_body(&body)?, Step::Stop) {
                    break;
                }
            }
            Ok(Value::empty())
        }
        other => Err(error(format!(
            "unknown or ambiguous subcommand \"{other}\": must be create, exists, for, get, incr, keys, lappend, merge, remove, set, size, unset, or values"
        ))),
    }
}

// -- introspection ----------------------------------------------------------

fn filtered(names: Vec<String>, pattern: Option<&Value>) -> Value {
    let pattern = pattern.map(text);
    Value::List(
        names
            .into_iter()
            .filter(|n| pattern.as_deref().map_or(true, |p| glob_match(p, n, false)))
            .map(Value::Str)
            .collect(),
    )
}

fn cmd_info(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let Some(sub) = argv.get(1) else {
        return Err(wrong_args("info subcommand ?arg ...?"));
    };
    let args = &argv[2..];
    match sub.as_str().as_ref() {
        "exists" => match args {
            [name] => Ok(Value::from(m.var_exists(&name.as_str()))),
            _ => Err(wrong_args("info exists varName")),
        },
        "commands" => {
            let mut names: Vec<String> = BUILTIN_NAMES.iter().map(|s| s.to_string()).collect();
            names.extend(m.proc_names());
            names.extend(m.host_command_names());
            names.sort();
            names.dedup();
            Ok(filtered(names, args.first()))
        }
        "procs" => Ok(filtered(m.proc_names(), args.first())),
        "vars" | "locals" => Ok(filtered(m.visible_vars(), args.first())),
        "globals" => Ok(filtered(m.global_names(), args.first())),
        "level" => Ok(Value::Int(m.depth() as i64)),
        op @ ("body" | "args") => {
            let [name] = args else {
                return Err(wrong_args(&format!("info {op} procname")));
            };
            let name = name.as_str();
            let proc_ = m
                .proc_named(&name)
                .ok_or_else(|| error(format!("\"{name}\" isn't a procedure")))?;
            if op == "body" {
                Ok(Value::Str(proc_.body.clone()))
            } else {
                Ok(Value::List(
                    proc_
                        .params
                        .iter()
                        .map(|(n, _)| Value::Str(n.clone()))
                        .collect(),
                ))
            }
        }
        other => Err(error(format!(
            "unknown or ambiguous subcommand \"{other}\": must be args, body, commands, exists, globals, level, locals, procs, or vars"
        ))),
    }
}

fn cmd_clock(argv: &[Value]) -> Outcome {
    let Some(sub) = argv.get(1) else {
        return Err(wrong_args("clock subcommand ?arg ...?"));
    };
    let now = Utc::now();
    match sub.as_str().as_ref() {
        "seconds" => Ok(Value::Int(now.timestamp())),
        "milliseconds" => Ok(Value::Int(now.timestamp_millis())),
        "microseconds" | "clicks" => Ok(Value::Int(now.timestamp_micros())),
        "format" => {
            let [_, _, seconds, options @ ..] = argv else {
                return Err(wrong_args("clock format clockval ?-format string? ?-gmt boolean?"));
            };
            let mut format = "%a %b %d %H:%M:%S UTC %Y".to_string();
            for pair in options.chunks(2) {
                match (pair[0].as_str().as_ref(), pair.get(1)) {
                    ("-format", Some(f)) => format = text(f),
                    // Times are always rendered in UTC.
                    ("-gmt", Some(_)) => {}
                    (other, _) => {
                        return Err(error(format!(
                            "bad option \"{other}\": must be -format or -gmt"
                        )))
                    }
                }
            }
            let items: Vec<Item<'_>> = StrftimeItems::new(&format).collect();
            if items.iter().any(|item| matches!(item, Item::Error)) {
                return Err(error(format!("bad format string \"{format}\"")));
            }
            let when = DateTime::<Utc>::from_timestamp(int_arg(seconds)?, 0)
                .ok_or_else(|| error("clock value out of range"))?;
            Ok(Value::Str(when.format_with_items(items.iter()).to_string()))
        }
        other => Err(error(format!(
            "unknown or ambiguous subcommand \"{other}\": must be clicks, format, microseconds, milliseconds, or seconds"
        ))),
    }
}

fn cmd_package(m: &mut Machine<'_>, argv: &[Value]) -> Outcome {
    let Some(sub) = argv.get(1) else {
        return Err(wrong_args("package subcommand ?arg ...?"));
    };
    let args: Vec<&Value> = argv[2..]
        .iter()
        .filter(|a| a.as_str() != "-exact")
        .collect();
    match sub.as_str().as_ref() {
        "require" | "present" => {
            let Some(name) = args.first() else {
                return Err(wrong_args("package require ?-exact? package ?version?"));
            };
            let name = name.as_str();
            m.package_version(&name)
                .map(Value::from)
                .ok_or_else(|| error(format!("can't find package {name}")))
        }
        "names" => Ok(Value::List(
            m.package_names().into_iter().map(Value::Str).collect(),
        )),
        "provide" => match args.as_slice() {
            [name] => Ok(m
                .package_version(&name.as_str())
                .map_or_else(Value::empty, Value::from)),
            _ => Err(error("packages cannot be provided from scripts")),
        },
        other => Err(error(format!(
            "unknown or ambiguous subcommand \"{other}\": must be names, present, provide, or require"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::interp::{
        Bindings, CancelToken, CommandGuard, Denial, EvalError, Interpreter, TclInterpreter, Value,
    };

    struct AllowAll;

    impl CommandGuard for AllowAll {
        fn check(&self, _command: &str) -> Result<(), Denial> {
            Ok(())
        }
    }

    fn run(script: &str) -> Result<Value, EvalError> {
        let bindings = Bindings::new(Arc::new(AllowAll), 16 * 1024 * 1024);
        TclInterpreter::new()
            .evaluate(script, &bindings, &CancelToken::new())
            .outcome
    }

    fn run_str(script: &str) -> String {
        run(script).unwrap().as_str().into_owned()
    }

    #[test]
    fn test_loops() {
        assert_eq!(
            run_str("set s 0; for {set i 1} {$i <= 10} {incr i} { incr s $i }; set s"),
            "55"
        );
        assert_eq!(
            run_str("set n 0; while 1 { incr n; if {$n >= 3} break }; set n"),
            "3"
        );
        assert_eq!(
            run_str("set out {}; foreach {a b} {1 2 3 4 5} { lappend out $a$b }; set out"),
            "12 34 5"
        );
        assert_eq!(
            run_str("set out {}; foreach x {1 2 3 4} { if {$x % 2} continue; lappend out $x }; set out"),
            "2 4"
        );
    }

    #[test]
    fn test_if_chain() {
        let script = "set x 5; if {$x < 3} { set r low } elseif {$x < 10} then { set r mid } else { set r high }";
        assert_eq!(run_str(script), "mid");
        assert_eq!(run_str("if 0 { set r a }"), "");
    }

    #[test]
    fn test_catch_codes() {
        assert_eq!(run_str("catch { error boom } msg; set msg"), "boom");
        assert_eq!(run_str("catch { error boom }"), "1");
        assert_eq!(run_str("catch { set x 1 }"), "0");
        assert_eq!(run_str("catch { return 7 } v; set v"), "7");
        assert_eq!(
            run_str("catch { error boom } msg opts; dict get $opts -code"),
            "1"
        );
    }

    #[test]
    fn test_list_commands() {
        assert_eq!(run_str("llength {a {b c} d}"), "3");
        assert_eq!(run_str("lindex {a {b c} d} 1 0"), "b");
        assert_eq!(run_str("lindex {a b c} end"), "c");
        assert_eq!(run_str("lindex {a b c} 7"), "");
        assert_eq!(run_str("lrange {a b c d e} 1 end-1"), "b c d");
        assert_eq!(run_str("lsort -integer {10 9 100 1}"), "1 9 10 100");
        assert_eq!(run_str("lsort -decreasing -unique {b a c a}"), "c b a");
        assert_eq!(run_str("lsearch {alpha beta gamma} g*"), "2");
        assert_eq!(run_str("lsearch -exact {alpha beta} gamma"), "-1");
        assert_eq!(run_str("join [lreverse {1 2 3}] ,"), "3,2,1");
        assert_eq!(run_str("split a,b,,c ,"), "a b {} c");
        assert_eq!(run_str("concat { a b } {} c"), "a b c");
        assert_eq!(run_str("set l [list 1 2]; lappend l {3 4}; llength $l"), "3");
    }

    #[test]
    fn test_list_structure_is_kept() {
        let value = run("list 1 [list 2 3]").unwrap();
        assert_eq!(
            value,
            Value::List(vec![
                Value::from("1"),
                Value::List(vec![Value::from("2"), Value::from("3")])
            ])
        );
    }

    #[test]
    fn test_string_commands() {
        assert_eq!(run_str("string length héllo"), "5");
        assert_eq!(run_str("string toupper abc"), "ABC");
        assert_eq!(run_str("string totitle hELLO"), "Hello");
        assert_eq!(run_str("string range abcdef 1 end-1"), "bcde");
        assert_eq!(run_str("string index abc end"), "c");
        assert_eq!(run_str("string trim {  x  }"), "x");
        assert_eq!(run_str("string trimright xxayy y"), "xxa");
        assert_eq!(run_str("string first b abcabc 2"), "4");
        assert_eq!(run_str("string last b abcabc"), "4");
        assert_eq!(run_str("string equal -nocase ABC abc"), "1");
        assert_eq!(run_str("string compare a b"), "-1");
        assert_eq!(run_str("string repeat ab 3"), "ababab");
        assert_eq!(run_str("string match {f*[0-9]?} foo7x"), "1");
        assert_eq!(run_str("string map {ab X b Y} abba"), "XYa");
        assert_eq!(run_str("string replace abcdef 1 2 XY"), "aXYdef");
        assert_eq!(run_str("string reverse abc"), "cba");
        assert_eq!(run_str("string is integer 0x1F"), "1");
        assert_eq!(run_str("string is integer -strict {}"), "0");
        assert_eq!(run_str("string is alpha {}"), "1");
    }

    #[test]
    fn test_dict_commands() {
        assert_eq!(run_str("dict get [dict create a 1 b 2] b"), "2");
        assert_eq!(
            run_str("dict set d x y 1; dict set d x z 2; dict get $d x"),
            "y 1 z 2"
        );
        assert_eq!(run_str("dict exists {a {b 1}} a b"), "1");
        assert_eq!(run_str("dict exists {a 1} b"), "0");
        assert_eq!(run_str("dict keys {a 1 b 2 ab 3} a*"), "a ab");
        assert_eq!(run_str("dict size [dict merge {a 1} {b 2 a 3}]"), "2");
        assert_eq!(run_str("dict get [dict remove {a 1 b 2} a]"), "b 2");
        assert_eq!(run_str("dict incr c hits; dict incr c hits; dict get $c hits"), "2");
        assert_eq!(
            run_str("set s 0; dict for {k v} {a 1 b 2} { incr s $v }; set s"),
            "3"
        );
        assert!(run("dict get {a 1} b").is_err());
    }

    #[test]
    fn test_format_and_subst() {
        assert_eq!(run_str("format {%05.2f|%-4s|%3d|%x} 3.14159 ab 7 255"), "03.14|ab  |  7|ff");
        assert_eq!(run_str("format %+d 5"), "+5");
        assert_eq!(run_str("format %-3d| 7"), "7  |");
        assert_eq!(run_str("set n 3; subst {n=$n [expr {$n * 2}]}"), "n=3 6");
    }

    #[test]
    fn test_format_field_sizes_are_bounded() {
        match run("format %99999999999d 1") {
            Err(EvalError::MemoryLimit { used, limit }) => assert!(used > limit),
            other => panic!("expected memory limit, got {other:?}"),
        }
        assert!(matches!(
            run("format %.99999999999f 1.5"),
            Err(EvalError::MemoryLimit { .. })
        ));
        match run("format %999999999999999999999999d 1") {
            Err(EvalError::Script { message }) => assert!(message.contains("too large")),
            other => panic!("expected script error, got {other:?}"),
        }
        assert_eq!(run_str("string length [format %1000d 1]"), "1000");
    }

    #[test]
    fn test_info_and_package() {
        assert_eq!(run_str("set a 1; info exists a"), "1");
        assert_eq!(run_str("info exists nope"), "0");
        assert_eq!(run_str("proc p {x y} {}; info args p"), "x y");
        assert_ne!(run_str("lsearch -exact [info commands] lsort"), "-1");
        assert!(run("package require Missing").is_err());
    }

    #[test]
    fn test_clock_format() {
        assert_eq!(
            run_str("clock format 0 -format {%Y-%m-%d %H:%M}"),
            "1970-01-01 00:00"
        );
        assert!(run("clock format 0 -format {%Q}").is_err());
    }

    #[test]
    fn test_after_then_script() {
        assert_eq!(run_str("after 1 set x done"), "done");
    }

    #[test]
    fn test_return_codes() {
        assert_eq!(run_str("proc p {} { return -code error bad }; catch p m; set m"), "bad");
        assert_eq!(
            run_str("set n 0; while 1 { incr n; if {$n > 2} { return -code break } }; set n"),
            "3"
        );
    }
}
