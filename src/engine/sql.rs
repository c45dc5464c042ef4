//! SQL statement builder shared by the relational adapters.
//!
//! Every builder returns parameterized SQL; values never get spliced into the
//! statement text. Identifiers are quoted per dialect.

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::{
    AlterIndexSpec, AlterRelationSpec, AlterTableSpec, ElementKind, FilterOperator, KeyValue,
    SelectOptions, SortDirection, Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    MySql,
    Sqlite,
}

/// A statement ready to be bound and executed
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Whether the statement produces a row set
    pub returns_rows: bool,
}

impl CompiledStatement {
    pub fn command(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            returns_rows: false,
        }
    }
}

const REFERENTIAL_ACTIONS: &[&str] = &["CASCADE", "SET NULL", "SET DEFAULT", "RESTRICT", "NO ACTION"];

impl SqlDialect {
    pub fn quote_ident(&self, ident: &str) -> String {
        match self {
            SqlDialect::MySql => format!("`{}`", ident.replace('`', "``")),
            SqlDialect::Postgres | SqlDialect::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    pub fn qualified(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) if !schema.is_empty() => {
                format!("{}.{}", self.quote_ident(schema), self.quote_ident(table))
            }
            _ => self.quote_ident(table),
        }
    }

    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", index),
            SqlDialect::MySql | SqlDialect::Sqlite => "?".to_string(),
        }
    }

    /// Bind parameter ceiling of the native protocol.
    pub fn max_params(&self) -> usize {
        match self {
            SqlDialect::Postgres | SqlDialect::MySql => 65_535,
            SqlDialect::Sqlite => 32_766,
        }
    }
}

/// Accumulates bound values and hands out matching placeholders.
struct Params {
    dialect: SqlDialect,
    values: Vec<Value>,
}

impl Params {
    fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            values: Vec::new(),
        }
    }

    fn push(&mut self, value: Value) -> String {
        self.values.push(value);
        self.dialect.placeholder(self.values.len())
    }
}

fn key_predicate(dialect: SqlDialect, keys: &[KeyValue], params: &mut Params) -> EngineResult<String> {
    if keys.is_empty() {
        return Err(EngineError::execution_error(
            "Primary key required for update and delete operations",
        ));
    }

    let clauses: Vec<String> = keys
        .iter()
        .map(|key| {
            let column = dialect.quote_ident(&key.column);
            if key.value.is_null() {
                format!("{} IS NULL", column)
            } else {
                format!("{} = {}", column, params.push(key.value.clone()))
            }
        })
        .collect();

    Ok(clauses.join(" AND "))
}

/// `INSERT INTO t (c1, c2) VALUES (..), (..)`; all rows share `columns`.
pub fn insert(
    dialect: SqlDialect,
    schema: Option<&str>,
    table: &str,
    columns: &[String],
    rows: &[Vec<Value>],
) -> CompiledStatement {
    let table_name = dialect.qualified(schema, table);

    if columns.is_empty() {
        return CompiledStatement::command(match dialect {
            SqlDialect::MySql => format!("INSERT INTO {} () VALUES ()", table_name),
            _ => format!("INSERT INTO {} DEFAULT VALUES", table_name),
        });
    }

    let mut params = Params::new(dialect);
    let cols_str = columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let tuples = rows
        .iter()
        .map(|row| {
            let placeholders = row
                .iter()
                .map(|v| params.push(v.clone()))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({})", placeholders)
        })
        .collect::<Vec<_>>()
        .join(", ");

    CompiledStatement {
        sql: format!("INSERT INTO {} ({}) VALUES {}", table_name, cols_str, tuples),
        params: params.values,
        returns_rows: false,
    }
}

/// `UPDATE t SET c = ? WHERE k1 = ? AND k2 = ?`
pub fn update(
    dialect: SqlDialect,
    schema: Option<&str>,
    table: &str,
    column: &str,
    value: Value,
    keys: &[KeyValue],
) -> EngineResult<CompiledStatement> {
    let mut params = Params::new(dialect);
    let set_clause = format!("{} = {}", dialect.quote_ident(column), params.push(value));
    let predicate = key_predicate(dialect, keys, &mut params)?;

    Ok(CompiledStatement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            dialect.qualified(schema, table),
            set_clause,
            predicate
        ),
        params: params.values,
        returns_rows: false,
    })
}

pub fn delete(
    dialect: SqlDialect,
    schema: Option<&str>,
    table: &str,
    keys: &[KeyValue],
) -> EngineResult<CompiledStatement> {
    let mut params = Params::new(dialect);
    let predicate = key_predicate(dialect, keys, &mut params)?;

    Ok(CompiledStatement {
        sql: format!("DELETE FROM {} WHERE {}", dialect.qualified(schema, table), predicate),
        params: params.values,
        returns_rows: false,
    })
}

pub fn select_by_key(
    dialect: SqlDialect,
    schema: Option<&str>,
    table: &str,
    keys: &[KeyValue],
) -> EngineResult<CompiledStatement> {
    let mut params = Params::new(dialect);
    let predicate = key_predicate(dialect, keys, &mut params)?;

    Ok(CompiledStatement {
        sql: format!("SELECT * FROM {} WHERE {}", dialect.qualified(schema, table), predicate),
        params: params.values,
        returns_rows: true,
    })
}

/// `SELECT * FROM t [WHERE ..] [ORDER BY ..] [LIMIT .. OFFSET ..]`
pub fn select_top(
    dialect: SqlDialect,
    schema: Option<&str>,
    table: &str,
    options: &SelectOptions,
) -> EngineResult<CompiledStatement> {
    let mut params = Params::new(dialect);
    let mut sql = format!("SELECT * FROM {}", dialect.qualified(schema, table));

    if !options.filters.is_empty() {
        let mut clauses = Vec::with_capacity(options.filters.len());
        for filter in &options.filters {
            let column = dialect.quote_ident(&filter.column);
            let clause = match filter.operator {
                FilterOperator::Equals => format!("{} = {}", column, params.push(filter.value.clone())),
                FilterOperator::NotEquals => format!("{} <> {}", column, params.push(filter.value.clone())),
                FilterOperator::GreaterThan => format!("{} > {}", column, params.push(filter.value.clone())),
                FilterOperator::GreaterOrEqual => format!("{} >= {}", column, params.push(filter.value.clone())),
                FilterOperator::LessThan => format!("{} < {}", column, params.push(filter.value.clone())),
                FilterOperator::LessOrEqual => format!("{} <= {}", column, params.push(filter.value.clone())),
                FilterOperator::Like => format!("{} LIKE {}", column, params.push(filter.value.clone())),
                FilterOperator::ILike => {
                    if dialect != SqlDialect::Postgres {
                        return Err(EngineError::not_supported("ILIKE filters require PostgreSQL"));
                    }
                    format!("{} ILIKE {}", column, params.push(filter.value.clone()))
                }
                FilterOperator::In => {
                    let items = match &filter.value {
                        Value::Array(items) if !items.is_empty() => items.clone(),
                        _ => {
                            return Err(EngineError::execution_error(format!(
                                "IN filter on '{}' requires a non-empty array",
                                filter.column
                            )))
                        }
                    };
                    let placeholders = items
                        .into_iter()
                        .map(|v| params.push(v))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{} IN ({})", column, placeholders)
                }
                FilterOperator::IsNull => format!("{} IS NULL", column),
                FilterOperator::IsNotNull => format!("{} IS NOT NULL", column),
            };
            clauses.push(clause);
        }
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !options.order_by.is_empty() {
        let order = options
            .order_by
            .iter()
            .map(|o| {
                let dir = match o.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("{} {}", dialect.quote_ident(&o.column), dir)
            })
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(" ORDER BY ");
        sql.push_str(&order);
    }

    sql.push_str(&limit_clause(dialect, options.offset, options.limit));

    Ok(CompiledStatement {
        sql,
        params: params.values,
        returns_rows: true,
    })
}

fn limit_clause(dialect: SqlDialect, offset: u64, limit: Option<u64>) -> String {
    match (limit, offset) {
        (Some(limit), 0) => format!(" LIMIT {}", limit),
        (Some(limit), offset) => format!(" LIMIT {} OFFSET {}", limit, offset),
        (None, 0) => String::new(),
        (None, offset) => match dialect {
            SqlDialect::Postgres => format!(" OFFSET {}", offset),
            SqlDialect::Sqlite => format!(" LIMIT -1 OFFSET {}", offset),
            SqlDialect::MySql => format!(" LIMIT 18446744073709551615 OFFSET {}", offset),
        },
    }
}

/// Wraps an arbitrary row-returning query into one page of itself.
pub fn paginate(base_sql: &str, offset: u64, limit: u64) -> String {
    let base = base_sql.trim().trim_end_matches(';').trim_end();
    format!("SELECT * FROM ({}) AS paged LIMIT {} OFFSET {}", base, limit, offset)
}

fn referential_action(action: &Option<String>, clause: &str) -> EngineResult<String> {
    match action {
        None => Ok(String::new()),
        Some(action) => {
            let normalized = action.trim().to_ascii_uppercase();
            if REFERENTIAL_ACTIONS.contains(&normalized.as_str()) {
                Ok(format!(" {} {}", clause, normalized))
            } else {
                Err(EngineError::execution_error(format!("Invalid referential action: {}", action)))
            }
        }
    }
}

pub fn alter_table(dialect: SqlDialect, spec: &AlterTableSpec) -> EngineResult<Vec<String>> {
    let table = dialect.qualified(spec.schema.as_deref(), &spec.table);
    let mut statements = Vec::new();

    for add in &spec.adds {
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table,
            dialect.quote_ident(&add.name),
            add.data_type
        );
        if !add.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &add.default_value {
            sql.push_str(&format!(" DEFAULT {}", default));
        }
        statements.push(sql);
    }

    for alteration in &spec.alterations {
        let column = dialect.quote_ident(&alteration.column);
        match dialect {
            SqlDialect::Postgres => {
                if let Some(new_type) = &alteration.new_type {
                    statements.push(format!(
                        "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                        table, column, new_type
                    ));
                }
                if let Some(nullable) = alteration.nullable {
                    let action = if nullable { "DROP NOT NULL" } else { "SET NOT NULL" };
                    statements.push(format!("ALTER TABLE {} ALTER COLUMN {} {}", table, column, action));
                }
            }
            SqlDialect::MySql => match (&alteration.new_type, alteration.nullable) {
                (Some(new_type), nullable) => {
                    let null_sql = match nullable {
                        Some(false) => " NOT NULL",
                        Some(true) => " NULL",
                        None => "",
                    };
                    statements.push(format!(
                        "ALTER TABLE {} MODIFY COLUMN {} {}{}",
                        table, column, new_type, null_sql
                    ));
                }
                (None, Some(_)) => {
                    return Err(EngineError::not_supported(
                        "MySQL requires the column type when changing nullability",
                    ))
                }
                (None, None) => {}
            },
            SqlDialect::Sqlite => {
                if alteration.new_type.is_some()
                    || alteration.nullable.is_some()
                    || alteration.default_value.is_some()
                {
                    return Err(EngineError::not_supported(
                        "SQLite cannot change column type, nullability, or default in place",
                    ));
                }
            }
        }

        if dialect != SqlDialect::Sqlite {
            match &alteration.default_value {
                Some(Some(default)) => statements.push(format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                    table, column, default
                )),
                Some(None) => statements.push(format!(
                    "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                    table, column
                )),
                None => {}
            }
        }

        if let Some(new_name) = &alteration.new_name {
            statements.push(format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table,
                column,
                dialect.quote_ident(new_name)
            ));
        }
    }

    for drop in &spec.drops {
        statements.push(format!("ALTER TABLE {} DROP COLUMN {}", table, dialect.quote_ident(drop)));
    }

    Ok(statements)
}

pub fn alter_index(dialect: SqlDialect, spec: &AlterIndexSpec) -> EngineResult<Vec<String>> {
    let table = dialect.qualified(spec.schema.as_deref(), &spec.table);
    let mut statements = Vec::new();

    for name in &spec.drops {
        statements.push(match dialect {
            SqlDialect::Postgres => format!("DROP INDEX {}", dialect.qualified(spec.schema.as_deref(), name)),
            SqlDialect::MySql => format!("DROP INDEX {} ON {}", dialect.quote_ident(name), table),
            SqlDialect::Sqlite => format!("DROP INDEX {}", dialect.quote_ident(name)),
        });
    }

    for index in &spec.additions {
        if index.columns.is_empty() {
            return Err(EngineError::execution_error(format!(
                "Index '{}' needs at least one column",
                index.name
            )));
        }
        let columns = index
            .columns
            .iter()
            .map(|c| {
                let dir = match c.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("{} {}", dialect.quote_ident(&c.column), dir)
            })
            .collect::<Vec<_>>()
            .join(", ");
        statements.push(format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            dialect.quote_ident(&index.name),
            table,
            columns
        ));
    }

    Ok(statements)
}

pub fn alter_relation(dialect: SqlDialect, spec: &AlterRelationSpec) -> EngineResult<Vec<String>> {
    if dialect == SqlDialect::Sqlite {
        return Err(EngineError::not_supported(
            "SQLite cannot add or drop foreign keys on an existing table",
        ));
    }

    let table = dialect.qualified(spec.schema.as_deref(), &spec.table);
    let mut statements = Vec::new();

    for name in &spec.drops {
        statements.push(match dialect {
            SqlDialect::MySql => format!("ALTER TABLE {} DROP FOREIGN KEY {}", table, dialect.quote_ident(name)),
            _ => format!("ALTER TABLE {} DROP CONSTRAINT {}", table, dialect.quote_ident(name)),
        });
    }

    for relation in &spec.additions {
        if relation.columns.is_empty() || relation.columns.len() != relation.to_columns.len() {
            return Err(EngineError::execution_error(
                "Foreign key column lists must be non-empty and of equal length",
            ));
        }
        let quote_all = |cols: &[String]| {
            cols.iter()
                .map(|c| dialect.quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let constraint = relation
            .name
            .as_ref()
            .map(|n| format!(" CONSTRAINT {}", dialect.quote_ident(n)))
            .unwrap_or_default();
        statements.push(format!(
            "ALTER TABLE {} ADD{} FOREIGN KEY ({}) REFERENCES {} ({}){}{}",
            table,
            constraint,
            quote_all(&relation.columns),
            dialect.qualified(relation.to_schema.as_deref(), &relation.to_table),
            quote_all(&relation.to_columns),
            referential_action(&relation.on_update, "ON UPDATE")?,
            referential_action(&relation.on_delete, "ON DELETE")?,
        ));
    }

    Ok(statements)
}

pub fn drop_element(
    dialect: SqlDialect,
    kind: ElementKind,
    schema: Option<&str>,
    name: &str,
) -> EngineResult<String> {
    let supported = match dialect {
        SqlDialect::Postgres => true,
        SqlDialect::MySql => kind != ElementKind::MaterializedView,
        SqlDialect::Sqlite => matches!(kind, ElementKind::Table | ElementKind::View),
    };
    if !supported {
        return Err(EngineError::not_supported(format!(
            "Dropping a {} is not supported by this driver",
            kind.sql_keyword().to_ascii_lowercase()
        )));
    }

    let target = match kind {
        ElementKind::Schema | ElementKind::Database => dialect.quote_ident(name),
        _ => dialect.qualified(schema, name),
    };
    Ok(format!("DROP {} IF EXISTS {}", kind.sql_keyword(), target))
}

pub fn truncate(dialect: SqlDialect, schema: Option<&str>, table: &str) -> String {
    let table = dialect.qualified(schema, table);
    match dialect {
        SqlDialect::Sqlite => format!("DELETE FROM {}", table),
        _ => format!("TRUNCATE TABLE {}", table),
    }
}

pub fn duplicate_table(
    dialect: SqlDialect,
    schema: Option<&str>,
    table: &str,
    new_name: &str,
) -> Vec<String> {
    let source = dialect.qualified(schema, table);
    let target = dialect.qualified(schema, new_name);
    match dialect {
        SqlDialect::Postgres => vec![
            format!("CREATE TABLE {} (LIKE {} INCLUDING ALL)", target, source),
            format!("INSERT INTO {} SELECT * FROM {}", target, source),
        ],
        SqlDialect::MySql => vec![
            format!("CREATE TABLE {} LIKE {}", target, source),
            format!("INSERT INTO {} SELECT * FROM {}", target, source),
        ],
        SqlDialect::Sqlite => vec![format!("CREATE TABLE {} AS SELECT * FROM {}", target, source)],
    }
}
