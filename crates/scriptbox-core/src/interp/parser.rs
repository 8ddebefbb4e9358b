//! Script parser: turns source text into commands made of substitutable words.

use std::sync::Arc;

use super::value::backslash;

/// Deepest `[...]` nesting a single source text may contain.
pub const MAX_NESTING: usize = 200;

/// A parsed script.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub words: Vec<Word>,
    pub line: usize,
}

/// One word of a command. Braced words are a single literal part.
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub parts: Vec<Part>,
    /// `{*}` prefix: the word's value is spliced in as several words.
    pub expand: bool,
    pub braced: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    Text(String),
    Var(String),
    Script(Arc<Script>),
}

impl Word {
    /// The word's text if it needs no substitution.
    pub fn literal(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [] => Some(""),
            [Part::Text(s)] => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    Syntax,
    /// Command substitutions nested past [`MAX_NESTING`].
    TooDeep,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (line {line})")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub line: usize,
}

pub fn parse(source: &str) -> Result<Script, ParseError> {
    Parser::new(source).script(false)
}

/// Parse text that only carries substitutions, as inside double quotes.
pub fn parse_template(text: &str) -> Result<Vec<Part>, ParseError> {
    Parser::new(text).parts(|p| p.peek().is_none(), false)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    nesting: usize,
}

impl Parser {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            nesting: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            kind: ParseErrorKind::Syntax,
            message: message.into(),
            line: self.line,
        }
    }

    fn script(&mut self, in_bracket: bool) -> Result<Script, ParseError> {
        let mut commands = Vec::new();
        loop {
            // Skip blanks and command separators.
            while let Some(c) = self.peek() {
                if c == '\\' && self.peek_at(1) == Some('\n') {
                    self.bump();
                    self.bump();
                } else if c.is_whitespace() || c == ';' {
                    self.bump();
                } else {
                    break;
                }
            }
            match self.peek() {
                None if in_bracket => return Err(self.error("missing close-bracket")),
                None => break,
                Some(']') if in_bracket => {
                    self.bump();
                    break;
                }
                Some('#') => {
                    self.skip_comment();
                    continue;
                }
                Some(_) => {}
            }
            let line = self.line;
            let words = self.command(in_bracket)?;
            if !words.is_empty() {
                commands.push(Command { words, line });
            }
        }
        Ok(Script { commands })
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\\' {
                self.bump();
                self.bump();
                continue;
            }
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn command(&mut self, in_bracket: bool) -> Result<Vec<Word>, ParseError> {
        let mut words = Vec::new();
        loop {
            while let Some(c) = self.peek() {
                if c == '\\' && self.peek_at(1) == Some('\n') {
                    self.bump();
                    self.bump();
                } else if c == ' ' || c == '\t' || c == '\r' {
                    self.bump();
                } else {
                    break;
                }
            }
            match self.peek() {
                None | Some('\n') | Some(';') => break,
                Some(']') if in_bracket => break,
                Some(_) => words.push(self.word(in_bracket)?),
            }
        }
        Ok(words)
    }

    fn at_word_end(&self, in_bracket: bool) -> bool {
        match self.peek() {
            None => true,
            Some(c) => c.is_whitespace() || c == ';' || (in_bracket && c == ']'),
        }
    }

    fn word(&mut self, in_bracket: bool) -> Result<Word, ParseError> {
        let mut expand = false;
        if self.peek() == Some('{')
            && self.peek_at(1) == Some('*')
            && self.peek_at(2) == Some('}')
            && self
                .peek_at(3)
                .is_some_and(|c| !c.is_whitespace() && c != ';')
        {
            expand = true;
            self.pos += 3;
        }

        match self.peek() {
            Some('{') => {
                let text = self.braced()?;
                if !self.at_word_end(in_bracket) {
                    return Err(self.error("extra characters after close-brace"));
                }
                Ok(Word {
                    parts: vec![Part::Text(text)],
                    expand,
                    braced: true,
                })
            }
            Some('"') => {
                self.bump();
                let parts = self.parts(|p| p.peek() == Some('"'), true)?;
                if self.bump() != Some('"') {
                    return Err(self.error("missing \""));
                }
                if !self.at_word_end(in_bracket) {
                    return Err(self.error("extra characters after close-quote"));
                }
                Ok(Word {
                    parts,
                    expand,
                    braced: false,
                })
            }
            _ => {
                let parts = self.parts(|p| p.at_word_end(in_bracket), false)?;
                Ok(Word {
                    parts,
                    expand,
                    braced: false,
                })
            }
        }
    }

    /// Read a `{...}` body verbatim (outer braces stripped).
    fn braced(&mut self) -> Result<String, ParseError> {
        let start_line = self.line;
        self.bump();
        let mut depth = 1;
        let mut out = String::new();
        while let Some(c) = self.bump() {
            match c {
                '\\' => {
                    out.push('\\');
                    if let Some(next) = self.bump() {
                        out.push(next);
                    }
                }
                '{' => {
                    depth += 1;
                    out.push(c);
                }
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(out);
                    }
                    out.push(c);
                }
                _ => out.push(c),
            }
        }
        Err(ParseError {
            kind: ParseErrorKind::Syntax,
            message: "missing close-brace".to_string(),
            line: start_line,
        })
    }

    /// Read substitutable text until `stop` says so.
    fn parts(
        &mut self,
        stop: impl Fn(&Parser) -> bool,
        quoted: bool,
    ) -> Result<Vec<Part>, ParseError> {
        let mut parts = Vec::new();
        let mut text = String::new();
        loop {
            if stop(self) {
                break;
            }
            let Some(c) = self.peek() else {
                if quoted {
                    return Err(self.error("missing \""));
                }
                break;
            };
            match c {
                '\\' => {
                    let (decoded, used) = backslash(&self.chars[self.pos..]);
                    for _ in 0..used {
                        self.bump();
                    }
                    text.push_str(&decoded);
                }
                '$' => match self.variable()? {
                    Some(name) => {
                        if !text.is_empty() {
                            parts.push(Part::Text(std::mem::take(&mut text)));
                        }
                        parts.push(Part::Var(name));
                    }
                    None => text.push('$'),
                },
                '[' => {
                    if self.nesting >= MAX_NESTING {
                        return Err(ParseError {
                            kind: ParseErrorKind::TooDeep,
                            message: format!(
                                "command substitutions nested deeper than {MAX_NESTING} levels"
                            ),
                            line: self.line,
                        });
                    }
                    self.bump();
                    self.nesting += 1;
                    let nested = self.script(true);
                    self.nesting -= 1;
                    let nested = nested?;
                    if !text.is_empty() {
                        parts.push(Part::Text(std::mem::take(&mut text)));
                    }
                    parts.push(Part::Script(Arc::new(nested)));
                }
                _ => {
                    self.bump();
                    text.push(c);
                }
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(Part::Text(text));
        }
        Ok(parts)
    }

    /// Parse `$name` / `${name}`; `None` means a literal dollar sign.
    fn variable(&mut self) -> Result<Option<String>, ParseError> {
        self.bump();
        if self.peek() == Some('{') {
            self.bump();
            let mut name = String::new();
            loop {
                match self.bump() {
                    Some('}') => return Ok(Some(name)),
                    Some(c) => name.push(c),
                    None => return Err(self.error("missing close-brace for variable name")),
                }
            }
        }
        let mut name = String::new();
        loop {
            match self.peek() {
                Some(c) if c.is_alphanumeric() || c == '_' => {
                    name.push(c);
                    self.bump();
                }
                Some(':') if self.peek_at(1) == Some(':') => {
                    name.push_str("::");
                    self.bump();
                    self.bump();
                }
                _ => break,
            }
        }
        Ok(if name.is_empty() { None } else { Some(name) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_word_names(script: &Script) -> Vec<String> {
        script
            .commands
            .iter()
            .filter_map(|c| c.words[0].literal().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_separators_and_comments() {
        let script = parse("set a 1; set b 2\n# comment ; not a command\nputs $a").unwrap();
        assert_eq!(first_word_names(&script), vec!["set", "set", "puts"]);
        assert_eq!(script.commands[2].line, 3);
    }

    #[test]
    fn test_word_kinds() {
        let script = parse(r#"cmd {a $b} "x $y [z]" pre${v}post"#).unwrap();
        let words = &script.commands[0].words;
        assert_eq!(words[1].literal(), Some("a $b"));
        assert!(words[1].braced);
        assert_eq!(words[2].parts.len(), 4);
        assert!(matches!(&words[2].parts[3], Part::Script(_)));
        assert_eq!(
            words[3].parts,
            vec![
                Part::Text("pre".into()),
                Part::Var("v".into()),
                Part::Text("post".into())
            ]
        );
    }

    #[test]
    fn test_nested_brackets() {
        let script = parse("set x [list [llength {a b}] c]").unwrap();
        let Part::Script(inner) = &script.commands[0].words[2].parts[0] else {
            panic!("expected command substitution");
        };
        assert_eq!(first_word_names(inner), vec!["list"]);
    }

    #[test]
    fn test_lone_dollar_is_literal() {
        let script = parse("puts $").unwrap();
        assert_eq!(script.commands[0].words[1].literal(), Some("$"));
    }

    #[test]
    fn test_expansion_prefix() {
        let script = parse("list {*}$items {*}").unwrap();
        assert!(script.commands[0].words[1].expand);
        assert_eq!(script.commands[0].words[2].literal(), Some("*"));
    }

    #[test]
    fn test_template_keeps_spaces() {
        let parts = parse_template("a $b [c] d").unwrap();
        assert_eq!(parts[0], Part::Text("a ".into()));
        assert_eq!(parts[1], Part::Var("b".into()));
        assert_eq!(parts[3], Part::Text(" d".into()));
    }

    #[test]
    fn test_errors() {
        assert!(parse("set x {oops").is_err());
        assert!(parse("set x [oops").is_err());
        assert!(parse("set x \"oops").is_err());
        assert!(parse("set x {a}b").is_err());
        assert_eq!(
            parse("set x [oops").unwrap_err().kind,
            ParseErrorKind::Syntax
        );
    }

    #[test]
    fn test_nesting_cap() {
        let nested = |depth: usize| format!("set x {}1{}", "[".repeat(depth), "]".repeat(depth));
        assert!(parse(&nested(MAX_NESTING)).is_ok());

        let err = parse(&nested(MAX_NESTING + 1)).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooDeep);

        let err = parse(&nested(100_000)).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::TooDeep);

        // Sibling substitutions do not accumulate.
        let flat = format!("list {}", "[list a] ".repeat(MAX_NESTING * 2));
        assert!(parse(&flat).is_ok());
    }
}
