//! Batch splitting, directive extraction and statement classification.

use crate::config::ShardConfig;
use crate::error::{ShardError, ShardResult};
use crate::lexer::{Token, TokenKind};

/// Keyword opening a shard-configuration directive.
pub const DIRECTIVE_KEYWORD: &str = "SHARDCONFIG";

/// Statement classes the rewriter acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    ShardDirective,
    CreateTable,
    CreateIndex,
    /// `INSERT` or `REPLACE`.
    Insert,
    Select,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    /// Statements whose change count is reported as affected rows.
    pub fn counts_rows(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// One statement of a batch, without its terminating `;`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub tokens: Vec<Token>,
}

// ============================================================================
// Navigation helpers
// ============================================================================

/// Indices of the non-trivia tokens in `tokens`.
pub fn significant<T: AsRef<Token>>(tokens: &[T]) -> Vec<usize> {
    tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.as_ref().is_trivia())
        .map(|(i, _)| i)
        .collect()
}

/// Index of the `)` matching the `(` at `open`, if any.
pub fn matching_paren<T: AsRef<Token>>(tokens: &[T], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, t) in tokens.iter().enumerate().skip(open) {
        let t = t.as_ref();
        if t.is_punct("(") {
            depth += 1;
        } else if t.is_punct(")") {
            depth = depth.checked_sub(1)?;
            if depth == 0 {
                return Some(i);
            }
        }
    }
    None
}

/// Parenthesis depth before each token.
pub fn depths<T: AsRef<Token>>(tokens: &[T]) -> Vec<usize> {
    let mut depth = 0usize;
    tokens
        .iter()
        .map(|t| {
            let t = t.as_ref();
            if t.is_punct(")") {
                depth = depth.saturating_sub(1);
            }
            let here = depth;
            if t.is_punct("(") {
                depth += 1;
            }
            here
        })
        .collect()
}

/// Splits the inside of a parenthesized list at depth-zero commas.
///
/// `open` and `close` are the indices of the parentheses. Returns ranges of
/// token indices, excluding the commas.
pub fn split_list<T: AsRef<Token>>(
    tokens: &[T],
    open: usize,
    close: usize,
) -> Vec<std::ops::Range<usize>> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut start = open + 1;
    for i in open + 1..close {
        let t = tokens[i].as_ref();
        if t.is_punct("(") {
            depth += 1;
        } else if t.is_punct(")") {
            depth = depth.saturating_sub(1);
        } else if depth == 0 && t.is_punct(",") {
            items.push(start..i);
            start = i + 1;
        }
    }
    items.push(start..close);
    items
}

// ============================================================================
// Directive
// ============================================================================

/// Strips a leading `SHARDCONFIG` directive from a token stream.
///
/// The directive may end with `;` or run directly into the next statement.
pub fn take_directive(tokens: Vec<Token>) -> ShardResult<(Option<ShardConfig>, Vec<Token>)> {
    let sig = significant(&tokens);
    let Some(&first) = sig.first() else {
        return Ok((None, tokens));
    };
    if !tokens[first].is_keyword(DIRECTIVE_KEYWORD) {
        return Ok((None, tokens));
    }

    let args: Vec<&Token> = sig.iter().skip(1).take(4).map(|&i| &tokens[i]).collect();
    if args.len() < 4 {
        return Err(ShardError::InvalidDirective(
            "expected SHARDCONFIG <table> <column> <interval> <retention>".to_string(),
        ));
    }
    let table = args[0]
        .ident()
        .ok_or_else(|| ShardError::InvalidDirective(format!("bad table name {}", args[0].text)))?;
    let column = args[1]
        .ident()
        .ok_or_else(|| ShardError::InvalidDirective(format!("bad column name {}", args[1].text)))?;
    let interval = parse_seconds(args[2], "interval")?;
    let retention = parse_seconds(args[3], "retention")?;
    let config = ShardConfig::new(table, column, interval, retention)?;

    let mut rest_start = sig[4] + 1;
    if let Some(&next) = sig.get(5) {
        if tokens[next].kind == TokenKind::Semicolon {
            rest_start = next + 1;
        }
    }
    let rest = tokens.into_iter().skip(rest_start).collect();
    Ok((Some(config), rest))
}

fn parse_seconds(token: &Token, what: &str) -> ShardResult<u64> {
    if token.kind != TokenKind::Number {
        return Err(ShardError::InvalidDirective(format!(
            "{what} must be an integer, got {}",
            token.text
        )));
    }
    token
        .text
        .parse()
        .map_err(|_| ShardError::InvalidDirective(format!("{what} must be an integer, got {}", token.text)))
}

// ============================================================================
// Splitting
// ============================================================================

/// Splits a token stream at top-level `;`.
///
/// `CREATE TRIGGER ... BEGIN ... END` bodies stay whole. Statements made of
/// trivia only are dropped.
pub fn split(tokens: Vec<Token>) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut current: Vec<Token> = Vec::new();
    let mut in_trigger = false;
    let mut body_depth = 0usize;

    for token in tokens {
        if token.kind == TokenKind::Semicolon && body_depth == 0 {
            push_statement(&mut statements, std::mem::take(&mut current));
            in_trigger = false;
            continue;
        }

        if token.kind == TokenKind::Word {
            if !in_trigger && is_trigger_header(&current, &token) {
                in_trigger = true;
            } else if in_trigger {
                if token.is_keyword("BEGIN") || (body_depth > 0 && token.is_keyword("CASE")) {
                    body_depth += 1;
                } else if token.is_keyword("END") && body_depth > 0 {
                    body_depth -= 1;
                }
            }
        }
        current.push(token);
    }
    push_statement(&mut statements, current);
    statements
}

fn is_trigger_header(current: &[Token], token: &Token) -> bool {
    if !token.is_keyword("TRIGGER") {
        return false;
    }
    let words: Vec<&Token> = current.iter().filter(|t| !t.is_trivia()).collect();
    match words.as_slice() {
        [create] => create.is_keyword("CREATE"),
        [create, temp] => {
            create.is_keyword("CREATE") && (temp.is_keyword("TEMP") || temp.is_keyword("TEMPORARY"))
        }
        _ => false,
    }
}

fn push_statement(statements: &mut Vec<Statement>, tokens: Vec<Token>) {
    if tokens.iter().all(Token::is_trivia) {
        return;
    }
    let kind = classify(&tokens);
    statements.push(Statement { kind, tokens });
}

/// Tags a statement by its leading keywords.
pub fn classify(tokens: &[Token]) -> StatementKind {
    let words: Vec<&Token> = tokens.iter().filter(|t| !t.is_trivia()).take(3).collect();
    let Some(first) = words.first() else {
        return StatementKind::Other;
    };
    let kw = first.text.to_ascii_uppercase();
    if first.kind != TokenKind::Word {
        return StatementKind::Other;
    }
    match kw.as_str() {
        "SHARDCONFIG" => StatementKind::ShardDirective,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "SELECT" | "VALUES" => StatementKind::Select,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" => {
            let object = words
                .iter()
                .skip(1)
                .find(|t| {
                    !(t.is_keyword("TEMP") || t.is_keyword("TEMPORARY") || t.is_keyword("UNIQUE"))
                });
            match object {
                Some(t) if t.is_keyword("TABLE") => StatementKind::CreateTable,
                Some(t) if t.is_keyword("INDEX") => StatementKind::CreateIndex,
                _ => StatementKind::Other,
            }
        }
        _ => StatementKind::Other,
    }
}
