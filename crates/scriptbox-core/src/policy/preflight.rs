//! Static scan of a script for restricted command names.
//!
//! Runs before the first command executes so that a violation cannot leave
//! partial side effects. Only literal command names are visible here;
//! computed names are caught at dispatch by the guard.

use crate::interp::parser::{self, Command, Part, Script, Word};
use crate::interp::{CommandGuard, Denial};

const MAX_SCAN_DEPTH: usize = 64;

#[derive(Clone, Copy)]
enum Nested {
    /// Argument is a script body.
    Body,
    /// Argument is an expression or substitution template.
    Template,
}

/// Return every distinct denial found in `source`, in order of appearance.
/// A script that fails to parse yields no denials; evaluation reports the
/// parse error.
pub fn preflight(source: &str, guard: &dyn CommandGuard) -> Vec<Denial> {
    let mut found = Vec::new();
    if let Ok(script) = parser::parse(source) {
        scan_script(&script, guard, &mut found, 0);
    }
    found
}

fn scan_script(script: &Script, guard: &dyn CommandGuard, found: &mut Vec<Denial>, depth: usize) {
    if depth > MAX_SCAN_DEPTH {
        return;
    }
    for command in &script.commands {
        scan_command(command, guard, found, depth);
    }
}

fn scan_parts(parts: &[Part], guard: &dyn CommandGuard, found: &mut Vec<Denial>, depth: usize) {
    for part in parts {
        if let Part::Script(inner) = part {
            scan_script(inner, guard, found, depth + 1);
        }
    }
}

fn scan_command(command: &Command, guard: &dyn CommandGuard, found: &mut Vec<Denial>, depth: usize) {
    for word in &command.words {
        scan_parts(&word.parts, guard, found, depth);
    }
    let Some(name) = command.words.first().and_then(Word::literal) else {
        return;
    };
    if let Err(denial) = guard.check(name) {
        if !found.iter().any(|d| d.command == denial.command) {
            found.push(denial);
        }
    }
    for (index, kind) in nested_arguments(name, &command.words) {
        let Some(text) = command.words.get(index).and_then(Word::literal) else {
            continue;
        };
        match kind {
            Nested::Body => {
                if let Ok(body) = parser::parse(text) {
                    scan_script(&body, guard, found, depth + 1);
                }
            }
            Nested::Template => {
                if let Ok(parts) = parser::parse_template(text) {
                    scan_parts(&parts, guard, found, depth);
                }
            }
        }
    }
}

/// Positions of arguments that the named command evaluates.
fn nested_arguments(name: &str, words: &[Word]) -> Vec<(usize, Nested)> {
    use Nested::{Body, Template};
    let n = words.len();
    match name {
        "if" => {
            let mut out = Vec::new();
            let mut expect = Template;
            for (i, word) in words.iter().enumerate().skip(1) {
                match word.literal() {
                    Some("then") => continue,
                    Some("elseif") => {
                        expect = Template;
                        continue;
                    }
                    Some("else") => {
                        expect = Body;
                        continue;
                    }
                    _ => {}
                }
                out.push((i, expect));
                expect = Body;
            }
            out
        }
        "while" => vec![(1, Template), (2, Body)],
        "for" => vec![(1, Body), (2, Template), (3, Body), (4, Body)],
        "foreach" if n >= 4 => vec![(n - 1, Body)],
        "proc" => vec![(3, Body)],
        "catch" | "time" => vec![(1, Body)],
        "eval" => (1..n).map(|i| (i, Body)).collect(),
        "after" => (2..n).map(|i| (i, Body)).collect(),
        "expr" | "subst" => (1..n).map(|i| (i, Template)).collect(),
        "return" if n > 2 => (1..n).map(|i| (i, Template)).collect(),
        "dict" if words.get(1).and_then(Word::literal) == Some("for") => vec![(4, Body)],
        _ => Vec::new(),
    }
}
