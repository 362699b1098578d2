//! Tokenizer for strategy source.
//!
//! Produces a flat token stream with explicit `Newline`, `Indent` and
//! `Dedent` tokens. Newlines inside brackets and after a backslash are
//! joined, blank and comment-only lines produce nothing.

use crate::domain::error::ParseError;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=",
    "/=", "%=", "->", "<<", ">>", ":=", "&=", "|=", "^=", "@=", "+", "-", "*", "/", "%", "<",
    ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~",
];

const TAB_WIDTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Keyword(&'static str),
    Int(i64),
    Float(f64),
    Str { value: String, fstring: bool },
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl Tok {
    pub fn describe(&self) -> String {
        match self {
            Tok::Name(n) => format!("name '{n}'"),
            Tok::Keyword(k) => format!("'{k}'"),
            Tok::Int(i) => format!("number {i}"),
            Tok::Float(f) => format!("number {f}"),
            Tok::Str { .. } => "string".to_string(),
            Tok::Op(op) => format!("'{op}'"),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "indent".to_string(),
            Tok::Dedent => "dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
    pub column: usize,
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
    line_start: usize,
    tokens: Vec<Token>,
    indents: Vec<usize>,
    brackets: Vec<(char, usize, usize)>,
    fragment: bool,
}

/// Tokenize a complete program.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    tokenize_from(input, 1, 1)
}

/// Tokenize a fragment that starts at `line`/`column` of an enclosing source,
/// as used for f-string replacement fields.
pub(crate) fn tokenize_fragment(input: &str, line: usize, column: usize) -> Result<Vec<Token>, ParseError> {
    tokenize_from(input, line, column)
}

fn tokenize_from(input: &str, line: usize, column: usize) -> Result<Vec<Token>, ParseError> {
    let mut lexer = Lexer {
        input,
        pos: 0,
        line,
        line_start: 0,
        tokens: Vec::new(),
        indents: vec![0],
        brackets: Vec::new(),
        fragment: column > 1,
    };
    lexer.run(column.saturating_sub(1))?;
    Ok(lexer.tokens)
}

impl<'a> Lexer<'a> {
    fn remaining(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.remaining().chars().nth(n)
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn column_at(&self, pos: usize, column_offset: usize) -> usize {
        let base = if self.line_start == 0 { column_offset } else { 0 };
        base + self.input[self.line_start..pos].chars().count() + 1
    }

    fn error(&self, message: impl Into<String>, pos: usize, column_offset: usize) -> ParseError {
        ParseError::new(message, self.line, self.column_at(pos, column_offset))
    }

    fn push(&mut self, tok: Tok, line: usize, column: usize) {
        self.tokens.push(Token { tok, line, column });
    }

    fn newline(&mut self) {
        self.line += 1;
        self.line_start = self.pos;
    }

    /// Whether physical newlines are currently insignificant.
    fn joined(&self) -> bool {
        self.fragment || !self.brackets.is_empty()
    }

    fn unterminated(&self, line: usize, start: usize, column_offset: usize) -> ParseError {
        ParseError::new("unterminated string literal", line, self.column_at(start, column_offset))
    }

    fn last_is_line_break(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.tok),
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent)
        )
    }

    fn run(&mut self, column_offset: usize) -> Result<(), ParseError> {
        let mut at_line_start = !self.joined();

        loop {
            if at_line_start && !self.joined() {
                at_line_start = false;
                if self.indentation(column_offset)? {
                    continue;
                }
            }

            let start = self.pos;
            let column = self.column_at(start, column_offset);
            let Some(ch) = self.peek() else {
                break;
            };

            match ch {
                ' ' | '\t' | '\x0c' | '\r' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    if !self.joined() && !self.last_is_line_break() {
                        self.push(Tok::Newline, self.line, column);
                    }
                    self.newline();
                    at_line_start = true;
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                '\\' => {
                    self.advance();
                    if self.peek() == Some('\r') {
                        self.advance();
                    }
                    if self.peek() != Some('\n') {
                        return Err(self.error("unexpected character after line continuation", start, column_offset));
                    }
                    self.advance();
                    self.newline();
                }
                '0'..='9' => {
                    let tok = self.number(column_offset)?;
                    self.push(tok, self.line, column);
                }
                '.' if self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) => {
                    let tok = self.number(column_offset)?;
                    self.push(tok, self.line, column);
                }
                '"' | '\'' => {
                    let line = self.line;
                    let tok = self.string(false, false, column_offset)?;
                    self.push(tok, line, column);
                }
                c if c.is_alphabetic() || c == '_' => {
                    let line = self.line;
                    let tok = self.word(column_offset)?;
                    self.push(tok, line, column);
                }
                _ => {
                    let tok = self.operator(column_offset)?;
                    self.push(tok, self.line, column);
                }
            }
        }

        if let Some(&(open, line, column)) = self.brackets.last() {
            return Err(ParseError::new(format!("'{open}' was never closed"), line, column));
        }

        let column = self.column_at(self.pos, column_offset);
        if !self.last_is_line_break() {
            self.push(Tok::Newline, self.line, column);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent, self.line, column);
        }
        self.push(Tok::Eof, self.line, column);
        Ok(())
    }

    /// Measure indentation at the start of a logical line. Returns true when
    /// the line was blank or a comment and has been consumed.
    fn indentation(&mut self, column_offset: usize) -> Result<bool, ParseError> {
        let mut width = 0usize;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / TAB_WIDTH + 1) * TAB_WIDTH,
                '\x0c' => width = 0,
                _ => break,
            }
            self.advance();
        }

        match self.peek() {
            None => return Ok(false),
            Some('\r') | Some('\n') | Some('#') => {
                while let Some(c) = self.peek() {
                    self.advance();
                    if c == '\n' {
                        self.newline();
                        return Ok(true);
                    }
                }
                return Ok(false);
            }
            _ => {}
        }

        let column = self.column_at(self.pos, column_offset);
        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Tok::Indent, self.line, column);
        } else if width < current {
            while self.indents.last().is_some_and(|&w| w > width) {
                self.indents.pop();
                self.push(Tok::Dedent, self.line, column);
            }
            if self.indents.last().copied().unwrap_or(0) != width {
                return Err(self.error(
                    "unindent does not match any outer indentation level",
                    self.pos,
                    column_offset,
                ));
            }
        }
        Ok(false)
    }

    fn word(&mut self, column_offset: usize) -> Result<Tok, ParseError> {
        let input = self.input;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
        let word = &input[start..self.pos];

        if matches!(self.peek(), Some('"') | Some('\'')) {
            let lower = word.to_ascii_lowercase();
            let (raw, fstring) = match lower.as_str() {
                "r" => (true, false),
                "f" => (false, true),
                "rf" | "fr" => (true, true),
                "u" => (false, false),
                "b" | "br" | "rb" => {
                    return Err(self.error("bytes literals are not supported", start, column_offset));
                }
                _ => return Ok(name_or_keyword(word)),
            };
            return self.string(raw, fstring, column_offset);
        }

        Ok(name_or_keyword(word))
    }

    fn number(&mut self, column_offset: usize) -> Result<Tok, ParseError> {
        let start = self.pos;
        let radix = match (self.peek(), self.peek_nth(1)) {
            (Some('0'), Some('x' | 'X')) => 16,
            (Some('0'), Some('o' | 'O')) => 8,
            (Some('0'), Some('b' | 'B')) => 2,
            _ => 10,
        };

        let tok = if radix != 10 {
            self.pos += 2;
            let digits_start = self.pos;
            while let Some(c) = self.peek() {
                if c.is_digit(radix) || c == '_' {
                    self.advance();
                } else {
                    break;
                }
            }
            let digits: String = self.input[digits_start..self.pos].chars().filter(|&c| c != '_').collect();
            let value = i64::from_str_radix(&digits, radix)
                .map_err(|_| self.error("invalid integer literal", start, column_offset))?;
            Tok::Int(value)
        } else {
            let mut is_float = false;
            self.digits();
            if self.peek() == Some('.') {
                is_float = true;
                self.advance();
                self.digits();
            }
            if matches!(self.peek(), Some('e' | 'E')) {
                let sign_offset = usize::from(matches!(self.peek_nth(1), Some('+' | '-')));
                if self.peek_nth(1 + sign_offset).is_some_and(|c| c.is_ascii_digit()) {
                    is_float = true;
                    self.advance();
                    if sign_offset == 1 {
                        self.advance();
                    }
                    self.digits();
                }
            }
            let text: String = self.input[start..self.pos].chars().filter(|&c| c != '_').collect();
            if is_float {
                let value = text
                    .parse::<f64>()
                    .map_err(|_| self.error(format!("invalid number literal '{text}'"), start, column_offset))?;
                Tok::Float(value)
            } else {
                let value = text
                    .parse::<i64>()
                    .map_err(|_| self.error(format!("integer literal '{text}' is too large"), start, column_offset))?;
                Tok::Int(value)
            }
        };

        if self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            return Err(self.error("invalid number literal", start, column_offset));
        }
        Ok(tok)
    }

    fn digits(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '_' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn string(&mut self, raw: bool, fstring: bool, column_offset: usize) -> Result<Tok, ParseError> {
        let start = self.pos;
        let start_line = self.line;
        let Some(quote) = self.advance() else {
            return Err(self.error("expected string", start, column_offset));
        };
        let triple = self.peek() == Some(quote) && self.peek_nth(1) == Some(quote);
        if triple {
            self.advance();
            self.advance();
        }

        let mut value = String::new();
        loop {
            let Some(c) = self.advance() else {
                return Err(self.unterminated(start_line, start, column_offset));
            };
            match c {
                '\\' => {
                    let Some(next) = self.advance() else {
                        return Err(self.unterminated(start_line, start, column_offset));
                    };
                    if raw {
                        value.push('\\');
                        value.push(next);
                        if next == '\n' {
                            self.newline();
                        }
                        continue;
                    }
                    match next {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        '0' => value.push('\0'),
                        '\\' => value.push('\\'),
                        '\'' => value.push('\''),
                        '"' => value.push('"'),
                        '\n' => self.newline(),
                        'x' => value.push(self.hex_escape(2, column_offset)?),
                        'u' => value.push(self.hex_escape(4, column_offset)?),
                        other => {
                            value.push('\\');
                            value.push(other);
                        }
                    }
                }
                c if c == quote => {
                    if !triple {
                        break;
                    }
                    if self.peek() == Some(quote) && self.peek_nth(1) == Some(quote) {
                        self.advance();
                        self.advance();
                        break;
                    }
                    value.push(c);
                }
                '\n' => {
                    if !triple {
                        return Err(self.unterminated(start_line, start, column_offset));
                    }
                    value.push('\n');
                    self.newline();
                }
                c => value.push(c),
            }
        }
        Ok(Tok::Str { value, fstring })
    }

    fn hex_escape(&mut self, len: usize, column_offset: usize) -> Result<char, ParseError> {
        let start = self.pos;
        for _ in 0..len {
            match self.peek() {
                Some(c) if c.is_ascii_hexdigit() => {
                    self.advance();
                }
                _ => return Err(self.error("truncated escape sequence", start, column_offset)),
            }
        }
        u32::from_str_radix(&self.input[start..self.pos], 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error("invalid escape sequence", start, column_offset))
    }

    fn operator(&mut self, column_offset: usize) -> Result<Tok, ParseError> {
        let start = self.pos;
        let column = self.column_at(start, column_offset);
        let Some(op) = OPERATORS.iter().copied().find(|op| self.remaining().starts_with(op)) else {
            let ch = self.peek().unwrap_or(' ');
            return Err(self.error(format!("unexpected character '{ch}'"), start, column_offset));
        };
        self.pos += op.len();

        match op {
            "(" | "[" | "{" => {
                let open = op.chars().next().unwrap_or('(');
                self.brackets.push((open, self.line, column));
            }
            ")" | "]" | "}" => {
                let close = op.chars().next().unwrap_or(')');
                let expected = match self.brackets.pop() {
                    Some(('(', ..)) => ')',
                    Some(('[', ..)) => ']',
                    Some(('{', ..)) => '}',
                    _ => {
                        return Err(self.error(format!("unmatched '{close}'"), start, column_offset));
                    }
                };
                if expected != close {
                    return Err(self.error(
                        format!("closing '{close}' does not match opening bracket"),
                        start,
                        column_offset,
                    ));
                }
            }
            _ => {}
        }
        Ok(Tok::Op(op))
    }
}

fn name_or_keyword(word: &str) -> Tok {
    match KEYWORDS.iter().copied().find(|&k| k == word) {
        Some(k) => Tok::Keyword(k),
        None => Tok::Name(word.to_string()),
    }
}
