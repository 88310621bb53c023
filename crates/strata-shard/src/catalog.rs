//! Shard catalog: configs, schema templates and known buckets.
//!
//! The catalog of a database persists in two meta tables written in the same
//! transaction as the batch that declared them. Known buckets are not stored;
//! they are recovered from the engine's table list on open.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use strata_types::Value;
use tracing::debug;

use crate::config::{ShardConfig, parse_shard_name, shard_name, strip_shard_token};
use crate::engine::Engine;
use crate::error::{DriverError, DriverResult, ShardError, ShardResult};
use crate::lexer::{Token, TokenKind, quote_ident, tokenize};
use crate::statement::{StatementKind, matching_paren, significant, split_list};

pub const CONFIG_TABLE: &str = "__strata_shard_config";
pub const TEMPLATE_TABLE: &str = "__strata_shard_template";

const CONFIG_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS __strata_shard_config (
    table_name TEXT NOT NULL PRIMARY KEY,
    shard_column TEXT NOT NULL,
    interval_secs INTEGER NOT NULL,
    retention_secs INTEGER NOT NULL
)";

const TEMPLATE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS __strata_shard_template (
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    sql TEXT NOT NULL,
    PRIMARY KEY (kind, name)
)";

// ============================================================================
// Templates
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    Table,
    Index,
}

impl TemplateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKind::Table => "table",
            TemplateKind::Index => "index",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "table" => Some(TemplateKind::Table),
            "index" => Some(TemplateKind::Index),
            _ => None,
        }
    }
}

/// `CREATE TABLE`/`CREATE INDEX` DDL with a shard token in its names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub kind: TemplateKind,
    /// Object name, shard token removed.
    pub name: String,
    /// Logical table the object belongs to.
    pub table: String,
    pub if_not_exists: bool,
    /// Original DDL text, shard token included.
    pub sql: String,
}

/// Positions of the names in a `CREATE TABLE`/`CREATE INDEX` statement.
struct DdlShape {
    keyword: usize,
    if_not_exists: bool,
    name: usize,
    /// `ON <table>` of an index.
    on_table: Option<usize>,
}

fn ddl_shape(tokens: &[Token]) -> Option<DdlShape> {
    let sig = significant(tokens);
    let k = sig
        .iter()
        .position(|&i| tokens[i].is_keyword("TABLE") || tokens[i].is_keyword("INDEX"))?;
    let mut p = k + 1;
    let if_not_exists = sig.get(p).is_some_and(|&i| tokens[i].is_keyword("IF"));
    if if_not_exists {
        p += 3;
    }
    if sig.get(p + 1).is_some_and(|&i| tokens[i].is_punct(".")) {
        p += 2;
    }
    let name = *sig.get(p)?;
    tokens[name].ident()?;
    let on_table = if tokens[sig[k]].is_keyword("INDEX") {
        let mut q = p + 1;
        if !sig.get(q).is_some_and(|&i| tokens[i].is_keyword("ON")) {
            return None;
        }
        q += 1;
        if sig.get(q + 1).is_some_and(|&i| tokens[i].is_punct(".")) {
            q += 2;
        }
        let table = *sig.get(q)?;
        tokens[table].ident()?;
        Some(table)
    } else {
        None
    };
    Some(DdlShape {
        keyword: sig[k],
        if_not_exists,
        name,
        on_table,
    })
}

fn ident_token(name: &str) -> Token {
    Token::word(quote_ident(name))
}

impl Template {
    /// Builds a template from a DDL statement, or `None` when the statement
    /// carries no shard token.
    pub fn from_tokens(kind: StatementKind, tokens: &[Token]) -> Option<Self> {
        let shape = ddl_shape(tokens)?;
        let name = tokens[shape.name].ident()?;
        let sql: String = tokens.iter().map(|t| t.text.as_str()).collect();
        let sql = sql.trim().to_string();
        match kind {
            StatementKind::CreateTable => {
                let table = strip_shard_token(&name)?.to_string();
                Some(Self {
                    kind: TemplateKind::Table,
                    name: table.clone(),
                    table,
                    if_not_exists: shape.if_not_exists,
                    sql,
                })
            }
            StatementKind::CreateIndex => {
                let on = tokens[shape.on_table?].ident()?;
                let table = strip_shard_token(&on)?.to_string();
                let name = strip_shard_token(&name).unwrap_or(&name).to_string();
                Some(Self {
                    kind: TemplateKind::Index,
                    name,
                    table,
                    if_not_exists: shape.if_not_exists,
                    sql,
                })
            }
            _ => None,
        }
    }

    /// DDL for one bucket, with `IF NOT EXISTS` forced.
    pub fn instantiate(&self, bucket_start: i64) -> String {
        self.render(Some(bucket_start), true)
    }

    /// DDL for the logical table itself.
    pub fn baseline(&self) -> String {
        self.render(None, false)
    }

    fn render(&self, bucket: Option<i64>, force_if_not_exists: bool) -> String {
        let mut tokens = tokenize(&self.sql);
        let Some(shape) = ddl_shape(&tokens) else {
            return self.sql.clone();
        };
        let named = |base: &str| match bucket {
            Some(b) => shard_name(base, b),
            None => base.to_string(),
        };
        tokens[shape.name] = ident_token(&named(&self.name));
        if let Some(on) = shape.on_table {
            tokens[on] = ident_token(&named(&self.table));
        }
        if force_if_not_exists && !shape.if_not_exists {
            let clause = [
                Token::space(),
                Token::word("IF"),
                Token::space(),
                Token::word("NOT"),
                Token::space(),
                Token::word("EXISTS"),
            ];
            tokens.splice(shape.keyword + 1..shape.keyword + 1, clause);
        }
        tokens.into_iter().map(|t| t.text).collect()
    }

    /// Column names declared by a table template.
    pub fn columns(&self) -> Vec<String> {
        const CONSTRAINTS: [&str; 5] = ["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"];
        if self.kind != TemplateKind::Table {
            return Vec::new();
        }
        let tokens = tokenize(&self.sql);
        let Some(shape) = ddl_shape(&tokens) else {
            return Vec::new();
        };
        let Some(open) = (shape.name + 1..tokens.len()).find(|&i| !tokens[i].is_trivia()) else {
            return Vec::new();
        };
        if !tokens[open].is_punct("(") {
            return Vec::new();
        }
        let Some(close) = matching_paren(&tokens, open) else {
            return Vec::new();
        };
        split_list(&tokens, open, close)
            .into_iter()
            .filter_map(|range| tokens[range].iter().find(|t| !t.is_trivia()).cloned())
            .filter(|t| !CONSTRAINTS.iter().any(|c| t.is_keyword(c)))
            .filter_map(|t| t.ident())
            .collect()
    }

    fn key(&self) -> (TemplateKind, String) {
        (self.kind, self.name.to_ascii_lowercase())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// Sharding state of one database.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardCatalog {
    configs: BTreeMap<String, ShardConfig>,
    templates: BTreeMap<String, Vec<Template>>,
    buckets: BTreeMap<String, BTreeSet<i64>>,
}

impl ShardCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self, table: &str) -> Option<&ShardConfig> {
        self.configs.get(&table.to_ascii_lowercase())
    }

    pub fn configs(&self) -> impl Iterator<Item = &ShardConfig> {
        self.configs.values()
    }

    /// Registers a config. Returns `true` if it was not known yet.
    pub fn register(&mut self, config: ShardConfig) -> ShardResult<bool> {
        let key = config.key();
        if let Some(existing) = self.configs.get(&key) {
            if existing.same_parameters(&config) {
                return Ok(false);
            }
            return Err(ShardError::ConfigConflict {
                table: config.table.clone(),
                existing: existing.to_string(),
                requested: config.to_string(),
            });
        }
        // A logical name must never look like a bucket of another table
        if let Some(other) = self.configs.values().find(|other| {
            parse_shard_name(&other.table, &config.table).is_some()
                || parse_shard_name(&config.table, &other.table).is_some()
        }) {
            return Err(ShardError::ConfigConflict {
                table: config.table.clone(),
                existing: other.to_string(),
                requested: config.to_string(),
            });
        }
        self.configs.insert(key, config);
        Ok(true)
    }

    pub fn templates(&self, table: &str) -> &[Template] {
        self.templates
            .get(&table.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Records a template. Returns `true` if it was not known yet.
    ///
    /// Redeclaring an object with different DDL fails unless the new
    /// statement is `IF NOT EXISTS`, in which case the first one wins.
    /// Bucket object names are global, so a name already used by another
    /// table's template is rejected.
    pub fn add_template(&mut self, template: Template) -> ShardResult<bool> {
        let table = template.table.to_ascii_lowercase();
        if let Some(taken) = self
            .templates
            .iter()
            .filter(|(owner, _)| **owner != table)
            .flat_map(|(_, list)| list.iter())
            .find(|t| t.key() == template.key())
        {
            return Err(ShardError::ConfigConflict {
                table: template.table.clone(),
                existing: taken.sql.clone(),
                requested: template.sql,
            });
        }
        let list = self.templates.entry(table).or_default();
        if let Some(existing) = list.iter().find(|t| t.key() == template.key()) {
            if existing.sql == template.sql || template.if_not_exists {
                return Ok(false);
            }
            return Err(ShardError::ConfigConflict {
                table: template.table.clone(),
                existing: existing.sql.clone(),
                requested: template.sql,
            });
        }
        list.push(template);
        Ok(true)
    }

    /// Columns of the table template of `table`.
    pub fn columns(&self, table: &str) -> Option<Vec<String>> {
        self.templates(table)
            .iter()
            .find(|t| t.kind == TemplateKind::Table)
            .map(Template::columns)
            .filter(|c| !c.is_empty())
    }

    pub fn buckets(&self, table: &str) -> Vec<i64> {
        self.buckets
            .get(&table.to_ascii_lowercase())
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_bucket(&self, table: &str, bucket_start: i64) -> bool {
        self.buckets
            .get(&table.to_ascii_lowercase())
            .is_some_and(|b| b.contains(&bucket_start))
    }

    pub fn add_bucket(&mut self, table: &str, bucket_start: i64) -> bool {
        self.buckets
            .entry(table.to_ascii_lowercase())
            .or_default()
            .insert(bucket_start)
    }

    /// DDL creating every object of `table` for one bucket, tables first.
    pub fn instantiate(&self, table: &str, bucket_start: i64) -> ShardResult<Vec<String>> {
        let templates = self.templates(table);
        if !templates.iter().any(|t| t.kind == TemplateKind::Table) {
            return Err(ShardError::UnknownShardTable(table.to_string()));
        }
        let tables = templates.iter().filter(|t| t.kind == TemplateKind::Table);
        let indexes = templates.iter().filter(|t| t.kind == TemplateKind::Index);
        Ok(tables
            .chain(indexes)
            .map(|t| t.instantiate(bucket_start))
            .collect())
    }

    /// Reads the persisted catalog of an engine.
    pub fn load(engine: &dyn Engine) -> DriverResult<Self> {
        let mut catalog = Self::new();
        let tables = engine.table_names()?;
        let has = |name: &str| tables.iter().any(|t| t.eq_ignore_ascii_case(name));

        if has(CONFIG_TABLE) {
            let set = engine.query(
                "SELECT table_name, shard_column, interval_secs, retention_secs \
                 FROM __strata_shard_config ORDER BY rowid",
                &[],
            )?;
            for row in set.rows {
                let (Some(table), Some(column), Some(interval), Some(retention)) = (
                    row.first().and_then(Value::as_str),
                    row.get(1).and_then(Value::as_str),
                    row.get(2).and_then(Value::as_i64),
                    row.get(3).and_then(Value::as_i64),
                ) else {
                    return Err(DriverError::internal("malformed shard config row"));
                };
                let config = ShardConfig::new(
                    table,
                    column,
                    u64::try_from(interval).unwrap_or_default(),
                    u64::try_from(retention).unwrap_or_default(),
                )?;
                catalog.register(config)?;
            }
        }

        if has(TEMPLATE_TABLE) {
            let set = engine.query(
                "SELECT kind, sql FROM __strata_shard_template ORDER BY rowid",
                &[],
            )?;
            for row in set.rows {
                let (Some(kind), Some(sql)) = (
                    row.first().and_then(Value::as_str).and_then(TemplateKind::parse),
                    row.get(1).and_then(Value::as_str),
                ) else {
                    return Err(DriverError::internal("malformed shard template row"));
                };
                let kind = match kind {
                    TemplateKind::Table => StatementKind::CreateTable,
                    TemplateKind::Index => StatementKind::CreateIndex,
                };
                let template = Template::from_tokens(kind, &tokenize(sql))
                    .ok_or_else(|| DriverError::internal("unparsable shard template"))?;
                catalog.add_template(template)?;
            }
        }

        let bases: Vec<String> = catalog.configs.values().map(|c| c.table.clone()).collect();
        for name in &tables {
            for base in &bases {
                if let Some(bucket) = parse_shard_name(base, name) {
                    catalog.add_bucket(base, bucket);
                }
            }
        }

        debug!(
            configs = catalog.configs.len(),
            buckets = catalog.buckets.values().map(BTreeSet::len).sum::<usize>(),
            "loaded shard catalog"
        );
        Ok(catalog)
    }
}

/// DDL of the meta tables.
pub fn meta_schema() -> [&'static str; 2] {
    [CONFIG_SCHEMA, TEMPLATE_SCHEMA]
}

pub(crate) fn config_insert(config: &ShardConfig) -> (String, Vec<Value>) {
    (
        format!(
            "INSERT INTO {CONFIG_TABLE} (table_name, shard_column, interval_secs, retention_secs) \
             VALUES (?, ?, ?, ?)"
        ),
        vec![
            Value::Text(config.table.clone()),
            Value::Text(config.shard_column.clone()),
            Value::Integer(config.interval_secs as i64),
            Value::Integer(config.retention_secs as i64),
        ],
    )
}

pub(crate) fn template_insert(template: &Template) -> (String, Vec<Value>) {
    (
        format!("INSERT INTO {TEMPLATE_TABLE} (kind, name, table_name, sql) VALUES (?, ?, ?, ?)"),
        vec![
            Value::Text(template.kind.as_str().to_string()),
            Value::Text(template.name.clone()),
            Value::Text(template.table.clone()),
            Value::Text(template.sql.clone()),
        ],
    )
}

/// Whether a token names a placeholder-free identifier equal to `name`.
pub(crate) fn names(token: &Token, name: &str) -> bool {
    matches!(token.kind, TokenKind::Word | TokenKind::Quoted) && token.is_ident(name)
}

// ============================================================================
// Shared store
// ============================================================================

/// Catalog shared by every connection of one database.
///
/// Connections rewrite against a snapshot and publish it back only after the
/// engine transaction commits.
#[derive(Debug, Clone, Default)]
pub struct ShardStore {
    inner: Arc<Mutex<ShardCatalog>>,
}

impl ShardStore {
    pub fn new(catalog: ShardCatalog) -> Self {
        Self {
            inner: Arc::new(Mutex::new(catalog)),
        }
    }

    pub fn snapshot(&self) -> DriverResult<ShardCatalog> {
        self.inner
            .lock()
            .map(|c| c.clone())
            .map_err(|_| DriverError::internal("shard catalog lock poisoned"))
    }

    pub fn publish(&self, catalog: ShardCatalog) -> DriverResult<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| DriverError::internal("shard catalog lock poisoned"))?;
        *guard = catalog;
        Ok(())
    }
}
