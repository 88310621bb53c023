//! Shard rewriter.
//!
//! Turns a caller batch into the physical statements the engine runs:
//!
//! 1. A leading `SHARDCONFIG` directive registers a [`ShardConfig`] and is
//!    stripped.
//! 2. Every placeholder is bound, so each physical statement carries its own
//!    ordered values.
//! 3. `CREATE TABLE`/`CREATE INDEX` naming `<t>$SHARD` become templates.
//! 4. `INSERT` rows are routed to bucket tables by their shard-column value,
//!    one physical `INSERT` per bucket.
//! 5. `SELECT`/`UPDATE`/`DELETE` are narrowed to one bucket by an equality
//!    predicate on the shard column, or handled by the
//!    [`UnresolvedTargetPolicy`].
//! 6. The first write to a bucket is preceded by its DDL.
//!
//! The rewriter mutates only the catalog it is given. Callers hand it a
//! snapshot and publish the snapshot after the engine commits.

use serde::{Deserialize, Serialize};
use strata_types::Value;
use tracing::debug;

use crate::catalog::{self, ShardCatalog, Template};
use crate::config::{ShardConfig, shard_seconds};
use crate::error::{ShardError, ShardResult};
use crate::lexer::{Token, TokenKind, quote_ident, tokenize, unquote_string};
use crate::params::{Binder, Params, Piece};
use crate::statement::{self, StatementKind, depths, matching_paren, significant, split_list};

/// Handling of statements on a sharded table without a bucket predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnresolvedTargetPolicy {
    /// Leave the logical name; the statement addresses the empty baseline.
    #[default]
    Baseline,
    /// Fail with [`ShardError::AmbiguousShardTarget`].
    Reject,
    /// One statement for the baseline and one per known bucket.
    FanOut,
}

/// Why a physical statement exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementRole {
    /// Catalog bookkeeping in the meta tables.
    Meta,
    /// Bucket DDL created from templates.
    AutoDdl,
    /// Caller work.
    Data,
}

/// A statement ready for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub role: StatementRole,
    pub kind: StatementKind,
    /// Index of the caller statement this came from.
    pub origin: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rewrite {
    pub statements: Vec<PhysicalStatement>,
    /// Some caller statement may expand to several data statements.
    pub fan_out: bool,
}

impl Rewrite {
    pub fn data(&self) -> impl Iterator<Item = &PhysicalStatement> {
        self.statements
            .iter()
            .filter(|s| s.role == StatementRole::Data)
    }

    fn push(
        &mut self,
        role: StatementRole,
        kind: StatementKind,
        origin: usize,
        (sql, params): (String, Vec<Value>),
    ) {
        self.statements.push(PhysicalStatement {
            sql,
            params,
            role,
            kind,
            origin,
        });
    }
}

pub struct Rewriter<'c> {
    catalog: &'c mut ShardCatalog,
    policy: UnresolvedTargetPolicy,
}

impl<'c> Rewriter<'c> {
    pub fn new(catalog: &'c mut ShardCatalog, policy: UnresolvedTargetPolicy) -> Self {
        Self { catalog, policy }
    }

    /// Rewrites `sql` with `params` bound.
    pub fn rewrite(&mut self, sql: &str, params: &Params) -> ShardResult<Rewrite> {
        self.rewrite_with(sql, Binder::new(params))
    }

    /// Rewrites `sql` with every placeholder bound to `0`, to inspect its
    /// shape before values exist.
    pub fn inspect(&mut self, sql: &str) -> ShardResult<Rewrite> {
        let params = Params::new();
        self.rewrite_with(sql, Binder::lenient(&params))
    }

    fn rewrite_with(&mut self, sql: &str, mut binder: Binder<'_>) -> ShardResult<Rewrite> {
        let (directive, rest) = statement::take_directive(tokenize(sql))?;
        let mut out = Rewrite::default();

        if let Some(config) = directive {
            if self.catalog.register(config.clone())? {
                debug!(table = %config.table, config = %config, "registered shard config");
                out.push(
                    StatementRole::Meta,
                    StatementKind::ShardDirective,
                    0,
                    catalog::config_insert(&config),
                );
            }
        }

        let mut bound = Vec::new();
        for stmt in statement::split(rest) {
            if stmt.kind == StatementKind::ShardDirective {
                return Err(ShardError::InvalidDirective(
                    "SHARDCONFIG must open the batch".to_string(),
                ));
            }
            bound.push((stmt.kind, binder.bind(stmt.tokens)?));
        }
        binder.finish()?;

        for (origin, (kind, pieces)) in bound.into_iter().enumerate() {
            match kind {
                StatementKind::CreateTable | StatementKind::CreateIndex => {
                    self.rewrite_ddl(&mut out, origin, kind, &pieces)?;
                }
                StatementKind::Insert => self.rewrite_insert(&mut out, origin, &pieces)?,
                StatementKind::Select | StatementKind::Update | StatementKind::Delete => {
                    self.rewrite_targeted(&mut out, origin, kind, &pieces)?;
                }
                StatementKind::ShardDirective | StatementKind::Other => {
                    out.push(StatementRole::Data, kind, origin, emit(&pieces, &[]));
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // DDL
    // ------------------------------------------------------------------------

    fn rewrite_ddl(
        &mut self,
        out: &mut Rewrite,
        origin: usize,
        kind: StatementKind,
        pieces: &[Piece],
    ) -> ShardResult<()> {
        let tokens: Vec<Token> = pieces.iter().map(|p| p.token.clone()).collect();
        let Some(template) = Template::from_tokens(kind, &tokens) else {
            out.push(StatementRole::Data, kind, origin, emit(pieces, &[]));
            return Ok(());
        };
        if self.catalog.config(&template.table).is_none() {
            return Err(ShardError::UnknownShardTable(template.table));
        }

        if self.catalog.add_template(template.clone())? {
            debug!(table = %template.table, name = %template.name, "recorded shard template");
            out.push(
                StatementRole::Meta,
                kind,
                origin,
                catalog::template_insert(&template),
            );
            // Buckets created before this template get it too
            for bucket in self.catalog.buckets(&template.table) {
                out.push(
                    StatementRole::AutoDdl,
                    kind,
                    origin,
                    (template.instantiate(bucket), Vec::new()),
                );
            }
        }
        if template.if_not_exists {
            out.push(
                StatementRole::Data,
                kind,
                origin,
                (template.baseline(), Vec::new()),
            );
        }
        Ok(())
    }

    /// Emits the DDL of a bucket the first time it is addressed.
    fn ensure_bucket(
        &mut self,
        out: &mut Rewrite,
        origin: usize,
        config: &ShardConfig,
        bucket: i64,
    ) -> ShardResult<()> {
        if self.catalog.has_bucket(&config.table, bucket) {
            return Ok(());
        }
        for sql in self.catalog.instantiate(&config.table, bucket)? {
            out.push(
                StatementRole::AutoDdl,
                StatementKind::CreateTable,
                origin,
                (sql, Vec::new()),
            );
        }
        self.catalog.add_bucket(&config.table, bucket);
        debug!(table = %config.table, bucket, "creating shard bucket");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // INSERT
    // ------------------------------------------------------------------------

    fn rewrite_insert(&mut self, out: &mut Rewrite, origin: usize, pieces: &[Piece]) -> ShardResult<()> {
        let sig = significant(pieces);
        let tok = |p: usize| sig.get(p).map(|&i| &pieces[i].token);

        let Some(into) = (0..sig.len()).find(|&p| tok(p).is_some_and(|t| t.is_keyword("INTO"))) else {
            out.push(StatementRole::Data, StatementKind::Insert, origin, emit(pieces, &[]));
            return Ok(());
        };
        let mut pos = into + 1;
        if tok(pos + 1).is_some_and(|t| t.is_punct(".")) {
            pos += 2;
        }
        let config = match tok(pos)
            .and_then(Token::ident)
            .and_then(|name| self.catalog.config(&name).cloned())
        {
            Some(config) => config,
            None => {
                out.push(StatementRole::Data, StatementKind::Insert, origin, emit(pieces, &[]));
                return Ok(());
            }
        };
        let table = config.table.as_str();
        pos += 1;
        if tok(pos).is_some_and(|t| t.is_keyword("AS")) {
            pos += 2;
        }

        let columns = if tok(pos).is_some_and(|t| t.is_punct("(")) {
            let open = sig[pos];
            let close = matching_paren(pieces, open)
                .ok_or_else(|| ShardError::ambiguous(table, "unbalanced column list"))?;
            let columns: Vec<String> = split_list(pieces, open, close)
                .into_iter()
                .filter_map(|r| {
                    pieces[r]
                        .iter()
                        .find(|p| !p.token.is_trivia())
                        .and_then(|p| p.token.ident())
                })
                .collect();
            pos = sig.iter().position(|&i| i > close).unwrap_or(sig.len());
            columns
        } else {
            self.catalog
                .columns(table)
                .ok_or_else(|| ShardError::ambiguous(table, "no column list and no schema template"))?
        };
        let shard_index = columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(&config.shard_column))
            .ok_or_else(|| {
                ShardError::ambiguous(table, format!("shard column {} is not inserted", config.shard_column))
            })?;

        if !tok(pos).is_some_and(|t| t.is_keyword("VALUES")) {
            return Err(ShardError::ambiguous(
                table,
                "only INSERT ... VALUES can be routed to a bucket",
            ));
        }

        // (open, close) of every VALUES row
        let mut rows: Vec<(usize, usize)> = Vec::new();
        let mut p = pos + 1;
        while tok(p).is_some_and(|t| t.is_punct("(")) {
            let open = sig[p];
            let close = matching_paren(pieces, open)
                .ok_or_else(|| ShardError::ambiguous(table, "unbalanced VALUES row"))?;
            rows.push((open, close));
            let next = sig.iter().position(|&i| i > close).unwrap_or(sig.len());
            if tok(next).is_some_and(|t| t.is_punct(",")) && tok(next + 1).is_some_and(|t| t.is_punct("(")) {
                p = next + 1;
            } else {
                break;
            }
        }
        let (Some(&(first_open, _)), Some(&(_, last_close))) = (rows.first(), rows.last()) else {
            return Err(ShardError::ambiguous(table, "INSERT has no VALUES rows"));
        };

        let mut groups: Vec<(i64, Vec<usize>)> = Vec::new();
        for (r, &(open, close)) in rows.iter().enumerate() {
            let items = split_list(pieces, open, close);
            let item = items
                .get(shard_index)
                .ok_or_else(|| ShardError::ambiguous(table, "row has fewer values than columns"))?;
            let operand: Vec<&Piece> = pieces[item.clone()].iter().collect();
            let value = literal_value(&operand).ok_or_else(|| {
                ShardError::ambiguous(table, "shard column value must be a literal or a parameter")
            })?;
            let bucket = config.bucket_start(shard_seconds(&value)?)?;
            match groups.iter_mut().find(|(b, _)| *b == bucket) {
                Some((_, members)) => members.push(r),
                None => groups.push((bucket, vec![r])),
            }
        }
        if groups.len() > 1 {
            out.fan_out = true;
        }

        let separator = Piece::plain(Token::punct(", "));
        for (bucket, members) in groups {
            self.ensure_bucket(out, origin, &config, bucket)?;
            let mut selected: Vec<&Piece> = pieces[..first_open].iter().collect();
            for (n, &r) in members.iter().enumerate() {
                if n > 0 {
                    selected.push(&separator);
                }
                let (open, close) = rows[r];
                selected.extend(&pieces[open..=close]);
            }
            selected.extend(&pieces[last_close + 1..]);
            let renames = [(config.table.clone(), config.shard_table_name(bucket))];
            out.push(
                StatementRole::Data,
                StatementKind::Insert,
                origin,
                emit(selected, &renames),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // SELECT / UPDATE / DELETE
    // ------------------------------------------------------------------------

    fn rewrite_targeted(
        &mut self,
        out: &mut Rewrite,
        origin: usize,
        kind: StatementKind,
        pieces: &[Piece],
    ) -> ShardResult<()> {
        let sig = significant(pieces);
        let tables = self.referenced_tables(pieces, &sig);
        if tables.is_empty() {
            out.push(StatementRole::Data, kind, origin, emit(pieces, &[]));
            return Ok(());
        }

        let conjuncts = where_conjuncts(pieces, &sig);
        let mut renames: Vec<(String, String)> = Vec::new();
        let mut unresolved: Vec<&ShardConfig> = Vec::new();
        for config in &tables {
            if kind == StatementKind::Update && assigns_column(pieces, &sig, &config.shard_column) {
                return Err(ShardError::ambiguous(
                    &config.table,
                    "UPDATE may not assign the shard column",
                ));
            }
            let alias = alias_of(pieces, &sig, &config.table);
            let target = Target {
                config,
                alias: alias.as_deref(),
                unqualified: tables.len() == 1,
            };
            let bucket = match &conjuncts {
                Some(conjuncts) => narrowing_bucket(pieces, conjuncts, &target)?,
                None => None,
            };
            match bucket {
                // Missing bucket tables leave the statement on the baseline
                Some(bucket) if self.catalog.has_bucket(&config.table, bucket) => {
                    renames.push((config.table.clone(), config.shard_table_name(bucket)));
                }
                Some(_) => {}
                None => unresolved.push(config),
            }
        }

        let Some(config) = unresolved.first() else {
            out.push(StatementRole::Data, kind, origin, emit(pieces, &renames));
            return Ok(());
        };
        match self.policy {
            UnresolvedTargetPolicy::Baseline => {
                out.push(StatementRole::Data, kind, origin, emit(pieces, &renames));
            }
            UnresolvedTargetPolicy::Reject => {
                return Err(ShardError::ambiguous(
                    &config.table,
                    "no equality predicate on the shard column",
                ));
            }
            UnresolvedTargetPolicy::FanOut => {
                if unresolved.len() > 1 {
                    return Err(ShardError::ambiguous(
                        &config.table,
                        "cannot fan out over several sharded tables",
                    ));
                }
                out.fan_out = true;
                out.push(StatementRole::Data, kind, origin, emit(pieces, &renames));
                for bucket in self.catalog.buckets(&config.table) {
                    let mut with_bucket = renames.clone();
                    with_bucket.push((config.table.clone(), config.shard_table_name(bucket)));
                    out.push(StatementRole::Data, kind, origin, emit(pieces, &with_bucket));
                }
            }
        }
        Ok(())
    }

    /// Sharded tables named by a statement, in order of first mention.
    fn referenced_tables(&self, pieces: &[Piece], sig: &[usize]) -> Vec<ShardConfig> {
        let mut found: Vec<ShardConfig> = Vec::new();
        for (p, &i) in sig.iter().enumerate() {
            let token = &pieces[i].token;
            let Some(name) = token.ident() else {
                continue;
            };
            let qualified_column = p > 0 && pieces[sig[p - 1]].token.is_punct(".");
            let function_call = sig.get(p + 1).is_some_and(|&j| pieces[j].token.is_punct("("));
            if qualified_column || function_call {
                continue;
            }
            if let Some(config) = self.catalog.config(&name) {
                if !found.iter().any(|c| c.key() == config.key()) {
                    found.push(config.clone());
                }
            }
        }
        found
    }
}

/// Binds a batch without any shard routing, for plain connections.
pub fn bind_batch(sql: &str, params: &Params) -> ShardResult<Rewrite> {
    let mut binder = Binder::new(params);
    let mut out = Rewrite::default();
    let mut bound = Vec::new();
    for stmt in statement::split(tokenize(sql)) {
        bound.push((stmt.kind, binder.bind(stmt.tokens)?));
    }
    binder.finish()?;
    for (origin, (kind, pieces)) in bound.into_iter().enumerate() {
        out.push(StatementRole::Data, kind, origin, emit(&pieces, &[]));
    }
    Ok(out)
}

// ============================================================================
// Emission
// ============================================================================

/// Concatenates pieces, renaming identifiers and collecting bound values.
fn emit<'p>(
    pieces: impl IntoIterator<Item = &'p Piece>,
    renames: &[(String, String)],
) -> (String, Vec<Value>) {
    let mut sql = String::new();
    let mut values = Vec::new();
    for piece in pieces {
        if let Some(value) = &piece.value {
            values.push(value.clone());
        }
        let renamed = renames
            .iter()
            .find(|(from, _)| catalog::names(&piece.token, from))
            .map(|(_, to)| quote_ident(to));
        match renamed {
            Some(name) => sql.push_str(&name),
            None => sql.push_str(&piece.token.text),
        }
    }
    (sql.trim().to_string(), values)
}

/// Value of a single literal or placeholder operand, with an optional sign.
fn literal_value(operand: &[&Piece]) -> Option<Value> {
    let sig: Vec<&Piece> = operand.iter().copied().filter(|p| !p.token.is_trivia()).collect();
    let (negative, atom) = match sig.as_slice() {
        [atom] => (false, *atom),
        [sign, atom] if sign.token.is_punct("-") => (true, *atom),
        [sign, atom] if sign.token.is_punct("+") => (false, *atom),
        _ => return None,
    };
    let value = match atom.token.kind {
        TokenKind::Placeholder => atom.value.clone()?,
        TokenKind::Number => parse_number(&atom.token.text)?,
        TokenKind::String => Value::Text(unquote_string(&atom.token.text)),
        TokenKind::Word if atom.token.is_keyword("NULL") => Value::Null,
        _ => return None,
    };
    if !negative {
        return Some(value);
    }
    match value {
        Value::Integer(v) => v.checked_neg().map(Value::Integer),
        Value::Real(v) => Some(Value::Real(-v)),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(Value::Integer);
    }
    if let Ok(v) = text.parse::<i64>() {
        return Some(Value::Integer(v));
    }
    text.parse::<f64>().ok().map(Value::Real)
}

// ============================================================================
// Predicate analysis
// ============================================================================

const CLAUSE_END: [&str; 6] = ["GROUP", "ORDER", "LIMIT", "HAVING", "WINDOW", "RETURNING"];
const COMPOUND: [&str; 3] = ["UNION", "INTERSECT", "EXCEPT"];
const NOT_ALIAS: [&str; 22] = [
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "NATURAL", "OUTER", "ON",
    "USING", "GROUP", "ORDER", "LIMIT", "SET", "INDEXED", "NOT", "UNION", "INTERSECT",
    "EXCEPT", "WINDOW", "RETURNING",
];

struct Target<'a> {
    config: &'a ShardConfig,
    alias: Option<&'a str>,
    /// Bare column names may refer to this table.
    unqualified: bool,
}

/// Depth-zero `AND` conjuncts of the top-level `WHERE`, as significant piece
/// indices. `None` if there is no such clause, or it contains a top-level
/// `OR`, or the statement is compound.
fn where_conjuncts(pieces: &[Piece], sig: &[usize]) -> Option<Vec<Vec<usize>>> {
    let depth = depths(pieces);
    let top = |i: usize, words: &[&str]| depth[i] == 0 && words.iter().any(|w| pieces[i].token.is_keyword(w));
    if sig.iter().any(|&i| top(i, &COMPOUND)) {
        return None;
    }
    let start = sig.iter().position(|&i| top(i, &["WHERE"]))?;

    let mut conjuncts = Vec::new();
    let mut current = Vec::new();
    let mut in_between = false;
    for &i in &sig[start + 1..] {
        if depth[i] == 0 {
            let token = &pieces[i].token;
            if top(i, &CLAUSE_END) {
                break;
            }
            if token.is_keyword("OR") {
                return None;
            }
            if token.is_keyword("BETWEEN") {
                in_between = true;
            } else if token.is_keyword("AND") {
                if in_between {
                    in_between = false;
                } else {
                    conjuncts.push(std::mem::take(&mut current));
                    continue;
                }
            }
        }
        current.push(i);
    }
    conjuncts.push(current);
    Some(conjuncts)
}

/// Bucket selected by a `<shard column> = <value>` conjunct, if any.
fn narrowing_bucket(
    pieces: &[Piece],
    conjuncts: &[Vec<usize>],
    target: &Target<'_>,
) -> ShardResult<Option<i64>> {
    for conjunct in conjuncts {
        let operands: Vec<&Piece> = conjunct.iter().map(|&i| &pieces[i]).collect();
        let Some(eq) = operands
            .iter()
            .position(|p| p.token.is_punct("=") || p.token.is_punct("=="))
        else {
            continue;
        };
        let (lhs, rhs) = (&operands[..eq], &operands[eq + 1..]);
        let value_side = if is_shard_column(lhs, target) {
            rhs
        } else if is_shard_column(rhs, target) {
            lhs
        } else {
            continue;
        };
        if let Some(value) = literal_value(value_side) {
            let seconds = shard_seconds(&value)?;
            return target.config.bucket_start(seconds).map(Some);
        }
    }
    Ok(None)
}

fn is_shard_column(side: &[&Piece], target: &Target<'_>) -> bool {
    let column = &target.config.shard_column;
    match side {
        [col] => target.unqualified && catalog::names(&col.token, column),
        [qualifier, dot, col] => {
            dot.token.is_punct(".")
                && catalog::names(&col.token, column)
                && (catalog::names(&qualifier.token, &target.config.table)
                    || target.alias.is_some_and(|a| catalog::names(&qualifier.token, a)))
        }
        _ => false,
    }
}

/// Alias given to `table` in a FROM/JOIN/UPDATE clause.
fn alias_of(pieces: &[Piece], sig: &[usize], table: &str) -> Option<String> {
    let tok = |p: usize| sig.get(p).map(|&i| &pieces[i].token);
    for p in 1..sig.len() {
        let introduces = tok(p - 1).is_some_and(|t| {
            t.is_keyword("FROM") || t.is_keyword("JOIN") || t.is_keyword("UPDATE") || t.is_punct(",")
        });
        if !introduces || !tok(p).is_some_and(|t| catalog::names(t, table)) {
            continue;
        }
        let next = tok(p + 1)?;
        if next.is_keyword("AS") {
            return tok(p + 2).and_then(Token::ident);
        }
        let bare_alias = (next.kind == TokenKind::Word && !NOT_ALIAS.iter().any(|k| next.is_keyword(k)))
            || next.kind == TokenKind::Quoted;
        return bare_alias.then(|| next.ident()).flatten();
    }
    None
}

/// Whether an `UPDATE ... SET` clause assigns `column`.
fn assigns_column(pieces: &[Piece], sig: &[usize], column: &str) -> bool {
    let depth = depths(pieces);
    let Some(set) = sig
        .iter()
        .position(|&i| depth[i] == 0 && pieces[i].token.is_keyword("SET"))
    else {
        return false;
    };
    let tok = |p: usize| sig.get(p).map(|&i| &pieces[i].token);
    let mut p = set + 1;
    while let Some(token) = tok(p) {
        let i = sig[p];
        if depth[i] == 0 && ["WHERE", "FROM", "RETURNING"].iter().any(|k| token.is_keyword(k)) {
            break;
        }
        if depth[i] == 0 && catalog::names(token, column) && tok(p + 1).is_some_and(|t| t.is_punct("=")) {
            return true;
        }
        // Row-value assignment: SET (a, b) = (...)
        if depth[i] == 0 && token.is_punct("(") {
            if let Some(close) = matching_paren(pieces, i) {
                let assigned = sig
                    .iter()
                    .position(|&j| j > close)
                    .and_then(tok)
                    .is_some_and(|t| t.is_punct("="));
                let names_column = (i + 1..close).any(|j| depth[j] == 1 && catalog::names(&pieces[j].token, column));
                if assigned && names_column {
                    return true;
                }
                p = sig.iter().position(|&j| j > close).unwrap_or(sig.len());
                continue;
            }
        }
        p += 1;
    }
    false
}
