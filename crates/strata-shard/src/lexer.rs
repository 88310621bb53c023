//! Lossless SQL token scanner.
//!
//! The scanner never fails: unterminated strings and comments run to the end
//! of input and are left for the engine to reject. Concatenating the text of
//! every token reproduces the input exactly.

/// Classification of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare identifier or keyword. May contain `$` after the first char.
    Word,
    /// `"x"`, `` `x` `` or `[x]`.
    Quoted,
    /// `'x'` string literal.
    String,
    /// `X'00ff'` blob literal.
    Blob,
    Number,
    /// `?`, `?NNN`, `:name`, `@name` or `$name`.
    Placeholder,
    Whitespace,
    Comment,
    Semicolon,
    /// Operators, parentheses, commas and dots.
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn word(text: impl Into<String>) -> Self {
        Self::new(TokenKind::Word, text)
    }

    pub fn punct(text: impl Into<String>) -> Self {
        Self::new(TokenKind::Punct, text)
    }

    pub fn space() -> Self {
        Self::new(TokenKind::Whitespace, " ")
    }

    /// Whitespace and comments.
    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    /// Case-insensitive keyword match on a bare word.
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    pub fn is_punct(&self, punct: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == punct
    }

    /// Identifier name with quoting removed, for words and quoted identifiers.
    pub fn ident(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.clone()),
            TokenKind::Quoted => Some(unquote_ident(&self.text)),
            _ => None,
        }
    }

    /// Case-insensitive identifier comparison.
    pub fn is_ident(&self, name: &str) -> bool {
        self.ident().is_some_and(|i| i.eq_ignore_ascii_case(name))
    }
}

impl AsRef<Token> for Token {
    fn as_ref(&self) -> &Token {
        self
    }
}

fn unquote_ident(text: &str) -> String {
    let mut chars = text.chars();
    let (Some(open), Some(close)) = (chars.next(), chars.next_back()) else {
        return text.to_string();
    };
    let inner: String = chars.collect();
    match open {
        '"' if close == '"' => inner.replace("\"\"", "\""),
        '`' if close == '`' => inner.replace("``", "`"),
        '[' if close == ']' => inner,
        _ => text.to_string(),
    }
}

/// Removes quoting from a `'...'` string literal.
pub fn unquote_string(text: &str) -> String {
    let inner = text
        .strip_prefix('\'')
        .map(|s| s.strip_suffix('\'').unwrap_or(s))
        .unwrap_or(text);
    inner.replace("''", "'")
}

/// Quotes `name` as an identifier when it is not a plain word.
pub fn quote_ident(name: &str) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || !c.is_ascii()
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

const TWO_CHAR_OPS: [&str; 8] = ["||", "<=", ">=", "<>", "!=", "==", "<<", ">>"];

/// Splits `sql` into tokens.
pub fn tokenize(sql: &str) -> Vec<Token> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        let start = i;

        let kind = if c.is_whitespace() {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            TokenKind::Whitespace
        } else if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            TokenKind::Comment
        } else if c == '/' && next == Some('*') {
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = (i + 2).min(chars.len());
            TokenKind::Comment
        } else if c == '\'' {
            i = scan_quoted(&chars, i, '\'');
            TokenKind::String
        } else if (c == 'x' || c == 'X') && next == Some('\'') {
            i = scan_quoted(&chars, i + 1, '\'');
            TokenKind::Blob
        } else if c == '"' || c == '`' {
            i = scan_quoted(&chars, i, c);
            TokenKind::Quoted
        } else if c == '[' {
            while i < chars.len() && chars[i] != ']' {
                i += 1;
            }
            i = (i + 1).min(chars.len());
            TokenKind::Quoted
        } else if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            i = scan_number(&chars, i);
            TokenKind::Number
        } else if c == '?' {
            i += 1;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            TokenKind::Placeholder
        } else if matches!(c, ':' | '@' | '$') && next.is_some_and(is_ident_continue) {
            i += 1;
            while i < chars.len() && is_ident_continue(chars[i]) {
                i += 1;
            }
            TokenKind::Placeholder
        } else if is_ident_start(c) {
            while i < chars.len() && is_ident_continue(chars[i]) {
                i += 1;
            }
            TokenKind::Word
        } else if c == ';' {
            i += 1;
            TokenKind::Semicolon
        } else {
            let pair: String = chars[i..(i + 2).min(chars.len())].iter().collect();
            i += if TWO_CHAR_OPS.contains(&pair.as_str()) { 2 } else { 1 };
            TokenKind::Punct
        };

        tokens.push(Token::new(kind, chars[start..i].iter().collect::<String>()));
    }

    tokens
}

/// Scans a quoted run starting at `start`, where a doubled quote escapes.
fn scan_quoted(chars: &[char], start: usize, quote: char) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

fn scan_number(chars: &[char], start: usize) -> usize {
    let mut i = start;
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x' | 'X')) {
        i += 2;
        while i < chars.len() && chars[i].is_ascii_hexdigit() {
            i += 1;
        }
        return i;
    }
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i < chars.len() && chars[i] == '.' {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
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
    i
}
