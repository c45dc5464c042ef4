//! Statement classification for read-only and production enforcement.
//!
//! Classification is best-effort and never fails: text the dialect parser
//! cannot handle is reported as [`CommandKind::Unknown`], which callers must
//! treat as a potential write.

use serde::Serialize;
use sqlparser::{
    ast::{Query, Select, SetExpr, Statement},
    dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect},
    parser::Parser,
};

/// Normalized command kind of one statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Create,
    Alter,
    Drop,
    Truncate,
    Transaction,
    Show,
    Explain,
    Set,
    Use,
    Grant,
    Call,
    Other,
    Unknown,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Select => "SELECT",
            CommandKind::Insert => "INSERT",
            CommandKind::Update => "UPDATE",
            CommandKind::Delete => "DELETE",
            CommandKind::Merge => "MERGE",
            CommandKind::Create => "CREATE",
            CommandKind::Alter => "ALTER",
            CommandKind::Drop => "DROP",
            CommandKind::Truncate => "TRUNCATE",
            CommandKind::Transaction => "TRANSACTION",
            CommandKind::Show => "SHOW",
            CommandKind::Explain => "EXPLAIN",
            CommandKind::Set => "SET",
            CommandKind::Use => "USE",
            CommandKind::Grant => "GRANT",
            CommandKind::Call => "CALL",
            CommandKind::Other => "OTHER",
            CommandKind::Unknown => "UNKNOWN",
        }
    }

    fn from_keyword(keyword: &str) -> Self {
        match keyword {
            "SELECT" | "WITH" | "VALUES" | "TABLE" => CommandKind::Select,
            "INSERT" | "REPLACE" | "COPY" | "LOAD" => CommandKind::Insert,
            "UPDATE" => CommandKind::Update,
            "DELETE" => CommandKind::Delete,
            "MERGE" => CommandKind::Merge,
            "CREATE" => CommandKind::Create,
            "ALTER" | "RENAME" | "COMMENT" => CommandKind::Alter,
            "DROP" => CommandKind::Drop,
            "TRUNCATE" => CommandKind::Truncate,
            "START" | "BEGIN" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "END" => {
                CommandKind::Transaction
            }
            "SHOW" | "DESCRIBE" | "DESC" => CommandKind::Show,
            "EXPLAIN" => CommandKind::Explain,
            "SET" | "RESET" => CommandKind::Set,
            "USE" => CommandKind::Use,
            "GRANT" | "REVOKE" => CommandKind::Grant,
            "CALL" | "EXEC" | "EXECUTE" => CommandKind::Call,
            _ => CommandKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassifiedStatement {
    pub kind: CommandKind,
    pub is_mutation: bool,
    pub is_dangerous: bool,
}

impl ClassifiedStatement {
    fn unknown() -> Self {
        Self {
            kind: CommandKind::Unknown,
            is_mutation: true,
            is_dangerous: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatementClassification {
    pub statements: Vec<ClassifiedStatement>,
    /// Parser diagnostic when classification fell back to `Unknown`
    pub parse_error: Option<String>,
}

impl StatementClassification {
    fn unknown(error: impl Into<String>) -> Self {
        Self {
            statements: vec![ClassifiedStatement::unknown()],
            parse_error: Some(error.into()),
        }
    }

    pub fn kinds(&self) -> Vec<CommandKind> {
        self.statements.iter().map(|s| s.kind).collect()
    }

    pub fn is_mutation(&self) -> bool {
        self.statements.iter().any(|s| s.is_mutation)
    }

    pub fn is_dangerous(&self) -> bool {
        self.statements.iter().any(|s| s.is_dangerous)
    }

    /// First statement that is not allowed in read-only mode.
    pub fn first_write(&self) -> Option<CommandKind> {
        self.statements.iter().find(|s| s.is_mutation).map(|s| s.kind)
    }
}

/// Classifies statement text using the rules of the given driver.
pub fn classify(driver_id: &str, text: &str) -> StatementClassification {
    if driver_id.eq_ignore_ascii_case("mongodb") {
        return classify_document_command(text);
    }
    classify_sql(driver_id, text)
}

fn classify_sql(driver_id: &str, sql: &str) -> StatementClassification {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return StatementClassification {
            statements: Vec::new(),
            parse_error: None,
        };
    }

    let dialect = dialect_for_driver(driver_id);
    let statements = match Parser::parse_sql(&*dialect, trimmed) {
        Ok(statements) => statements,
        Err(err) => return StatementClassification::unknown(err.to_string()),
    };

    let statements = statements
        .iter()
        .map(|statement| ClassifiedStatement {
            kind: statement_kind(statement),
            is_mutation: is_mutation_statement(statement),
            is_dangerous: is_dangerous_statement(statement),
        })
        .collect();

    StatementClassification {
        statements,
        parse_error: None,
    }
}

fn dialect_for_driver(driver_id: &str) -> Box<dyn Dialect> {
    if driver_id.eq_ignore_ascii_case("postgres") {
        Box::new(PostgreSqlDialect {})
    } else if driver_id.eq_ignore_ascii_case("mysql") {
        Box::new(MySqlDialect {})
    } else if driver_id.eq_ignore_ascii_case("sqlite") {
        Box::new(SQLiteDialect {})
    } else {
        Box::new(GenericDialect {})
    }
}

fn statement_kind(statement: &Statement) -> CommandKind {
    if let Statement::Query(query) = statement {
        if let Some(kind) = cte_write_kind(query) {
            return kind;
        }
        return if query_is_mutation(query) {
            CommandKind::Create
        } else {
            CommandKind::Select
        };
    }

    let rendered = statement.to_string();
    let keyword = rendered
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    CommandKind::from_keyword(&keyword)
}

fn is_mutation_statement(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => query_is_mutation(query),
        Statement::Explain {
            analyze,
            statement,
            ..
        } => {
            if *analyze {
                is_mutation_statement(statement)
            } else {
                false
            }
        }
        Statement::ExplainTable { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCharset(_)
        | Statement::ShowObjects(_)
        | Statement::ShowTables { .. }
        | Statement::ShowViews { .. }
        | Statement::ShowCollation { .. }
        | Statement::Set(_)
        | Statement::Use(_)
        | Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => false,
        _ => true,
    }
}

fn is_dangerous_statement(statement: &Statement) -> bool {
    match statement {
        Statement::Drop { .. }
        | Statement::DropFunction(_)
        | Statement::DropDomain(_)
        | Statement::DropProcedure { .. }
        | Statement::Truncate(_)
        | Statement::AlterTable(_)
        | Statement::AlterSchema(_)
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterType(_)
        | Statement::AlterRole { .. }
        | Statement::AlterPolicy { .. }
        | Statement::AlterConnector { .. }
        | Statement::AlterSession { .. }
        | Statement::AlterUser(_) => true,
        Statement::Update(update) => update.selection.is_none(),
        Statement::Delete(delete) => delete.selection.is_none(),
        Statement::Query(query) => query_is_dangerous(query),
        Statement::Explain {
            analyze,
            statement,
            ..
        } if *analyze => is_dangerous_statement(statement),
        _ => false,
    }
}

/// Postgres allows INSERT/UPDATE/DELETE inside WITH, so CTE bodies count.
fn query_is_mutation(query: &Query) -> bool {
    let writes_in_ctes = query
        .with
        .as_ref()
        .is_some_and(|with| with.cte_tables.iter().any(|cte| query_is_mutation(&cte.query)));
    writes_in_ctes || set_expr_is_mutation(&query.body)
}

fn cte_write_kind(query: &Query) -> Option<CommandKind> {
    query.with.as_ref()?.cte_tables.iter().find_map(|cte| {
        cte_write_kind(&cte.query).or_else(|| set_expr_write_kind(&cte.query.body))
    })
}

fn set_expr_write_kind(expr: &SetExpr) -> Option<CommandKind> {
    match expr {
        SetExpr::Insert(_) => Some(CommandKind::Insert),
        SetExpr::Update(_) => Some(CommandKind::Update),
        SetExpr::Delete(_) => Some(CommandKind::Delete),
        SetExpr::Merge(_) => Some(CommandKind::Merge),
        SetExpr::Query(query) => cte_write_kind(query).or_else(|| set_expr_write_kind(&query.body)),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_write_kind(left).or_else(|| set_expr_write_kind(right))
        }
        _ => None,
    }
}

fn query_is_dangerous(query: &Query) -> bool {
    let in_ctes = query
        .with
        .as_ref()
        .is_some_and(|with| with.cte_tables.iter().any(|cte| query_is_dangerous(&cte.query)));
    in_ctes || set_expr_is_dangerous(&query.body)
}

fn set_expr_is_dangerous(expr: &SetExpr) -> bool {
    match expr {
        SetExpr::Update(statement) | SetExpr::Delete(statement) => is_dangerous_statement(statement),
        SetExpr::Query(query) => query_is_dangerous(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_dangerous(left) || set_expr_is_dangerous(right)
        }
        _ => false,
    }
}

fn set_expr_is_mutation(expr: &SetExpr) -> bool {
    match expr {
        SetExpr::Select(select) => select_has_into(select),
        SetExpr::Query(query) => query_is_mutation(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_mutation(left) || set_expr_is_mutation(right)
        }
        SetExpr::Insert(_)
        | SetExpr::Update(_)
        | SetExpr::Delete(_)
        | SetExpr::Merge(_) => true,
        SetExpr::Values(_) | SetExpr::Table(_) => false,
    }
}

fn select_has_into(select: &Select) -> bool {
    select.into.is_some()
}

const DOCUMENT_READ_OPERATIONS: &[&str] = &["find", "find_one", "aggregate", "count", "count_documents", "distinct"];

/// Classifies a MongoDB command, either the JSON request format understood by
/// the MongoDB adapter or shell-style `db.coll.method(...)` text.
fn classify_document_command(query: &str) -> StatementClassification {
    let trimmed = query.trim();

    if trimmed.starts_with('{') {
        let parsed: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(err) => return StatementClassification::unknown(err.to_string()),
        };
        let operation = parsed
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("find")
            .to_ascii_lowercase();

        let writes_pipeline = operation == "aggregate"
            && parsed
                .get("pipeline")
                .and_then(|p| p.as_array())
                .map(|stages| {
                    stages.iter().any(|stage| {
                        stage.get("$out").is_some() || stage.get("$merge").is_some()
                    })
                })
                .unwrap_or(false);

        let kind = match operation.as_str() {
            op if DOCUMENT_READ_OPERATIONS.contains(&op) && !writes_pipeline => CommandKind::Select,
            "aggregate" => CommandKind::Insert,
            "insert_one" | "insert_many" => CommandKind::Insert,
            "update_one" | "update_many" | "replace_one" => CommandKind::Update,
            "delete_one" | "delete_many" => CommandKind::Delete,
            "create_collection" | "create_index" => CommandKind::Create,
            "drop_collection" | "drop_database" | "drop_index" => CommandKind::Drop,
            _ => CommandKind::Unknown,
        };
        let is_dangerous = matches!(operation.as_str(), "drop_collection" | "drop_database")
            || (matches!(operation.as_str(), "delete_many" | "update_many")
                && parsed
                    .get("filter")
                    .and_then(|f| f.as_object())
                    .map(|f| f.is_empty())
                    .unwrap_or(true));

        return StatementClassification {
            statements: vec![ClassifiedStatement {
                kind,
                is_mutation: kind != CommandKind::Select,
                is_dangerous,
            }],
            parse_error: None,
        };
    }

    if is_mongo_shell_mutation(trimmed) {
        return StatementClassification {
            statements: vec![ClassifiedStatement {
                kind: CommandKind::Other,
                is_mutation: true,
                is_dangerous: trimmed.to_ascii_lowercase().contains(".drop"),
            }],
            parse_error: None,
        };
    }

    let normalized = trimmed.to_ascii_lowercase();
    let is_read = [".find(", ".findone(", ".aggregate(", ".count(", ".countdocuments(", ".distinct("]
        .iter()
        .any(|pattern| normalized.contains(pattern));

    if is_read {
        StatementClassification {
            statements: vec![ClassifiedStatement {
                kind: CommandKind::Select,
                is_mutation: false,
                is_dangerous: false,
            }],
            parse_error: None,
        }
    } else {
        StatementClassification::unknown("Unrecognized document command")
    }
}

fn is_mongo_shell_mutation(query: &str) -> bool {
    let normalized = query.to_ascii_lowercase();

    let raw_patterns = [
        ".insert(",
        ".insertone(",
        ".insertmany(",
        ".update(",
        ".updateone(",
        ".updatemany(",
        ".replaceone(",
        ".delete(",
        ".deleteone(",
        ".deletemany(",
        ".remove(",
        ".createcollection(",
        ".drop(",
        ".dropdatabase(",
        ".bulkwrite(",
        ".findoneandupdate(",
        ".findoneanddelete(",
        ".findoneandreplace(",
    ];

    raw_patterns.iter().any(|pattern| normalized.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_cte_select_is_read_only() {
        let analysis = classify(
            "postgres",
            "WITH cte AS (SELECT * FROM users) SELECT * FROM cte",
        );

        assert_eq!(analysis.kinds(), vec![CommandKind::Select]);
        assert!(!analysis.is_mutation());
        assert!(!analysis.is_dangerous());
    }

    #[test]
    fn postgres_writing_cte_is_a_mutation() {
        let analysis = classify(
            "postgres",
            "WITH d AS (DELETE FROM users WHERE id = 1 RETURNING *) SELECT * FROM d",
        );

        assert_eq!(analysis.kinds(), vec![CommandKind::Delete]);
        assert_eq!(analysis.first_write(), Some(CommandKind::Delete));
        assert!(!analysis.is_dangerous());

        let analysis = classify(
            "postgres",
            "WITH d AS (DELETE FROM users RETURNING *) SELECT * FROM d",
        );
        assert!(analysis.is_mutation());
        assert!(analysis.is_dangerous());
    }

    #[test]
    fn postgres_nested_writing_cte_is_a_mutation() {
        let analysis = classify(
            "postgres",
            "WITH outer_cte AS (WITH u AS (UPDATE users SET name = 'x' WHERE id = 1 RETURNING id) SELECT * FROM u) \
             SELECT * FROM outer_cte",
        );

        assert_eq!(analysis.first_write(), Some(CommandKind::Update));
    }

    #[test]
    fn postgres_multi_statement_flags_mutation() {
        let analysis = classify(
            "postgres",
            "SELECT 1; UPDATE users SET name = 'x' WHERE id = 1;",
        );

        assert_eq!(analysis.kinds(), vec![CommandKind::Select, CommandKind::Update]);
        assert_eq!(analysis.first_write(), Some(CommandKind::Update));
        assert!(!analysis.is_dangerous());
    }

    #[test]
    fn postgres_update_without_where_is_dangerous() {
        let analysis = classify("postgres", "UPDATE users SET name = 'x'");

        assert!(analysis.is_mutation());
        assert!(analysis.is_dangerous());
    }

    #[test]
    fn mysql_delete_without_where_is_dangerous() {
        let analysis = classify("mysql", "DELETE FROM users");

        assert_eq!(analysis.kinds(), vec![CommandKind::Delete]);
        assert!(analysis.is_dangerous());
    }

    #[test]
    fn select_into_is_mutation() {
        let analysis = classify("postgres", "SELECT * INTO new_table FROM old_table");

        assert!(analysis.is_mutation());
        assert!(!analysis.is_dangerous());
    }

    #[test]
    fn alter_table_is_dangerous_ddl() {
        let analysis = classify("postgres", "ALTER TABLE users ADD COLUMN age INT");

        assert_eq!(analysis.kinds(), vec![CommandKind::Alter]);
        assert!(analysis.is_mutation());
        assert!(analysis.is_dangerous());
    }

    #[test]
    fn mysql_show_tables_is_read_only() {
        let analysis = classify("mysql", "SHOW TABLES");

        assert_eq!(analysis.kinds(), vec![CommandKind::Show]);
        assert!(!analysis.is_mutation());
    }

    #[test]
    fn sqlite_insert_is_write() {
        let analysis = classify("sqlite", "INSERT INTO people (id) VALUES (1)");

        assert_eq!(analysis.first_write(), Some(CommandKind::Insert));
    }

    #[test]
    fn transaction_control_is_allowed() {
        let analysis = classify("postgres", "BEGIN; SELECT 1; COMMIT");

        assert!(!analysis.is_mutation());
    }

    #[test]
    fn unparseable_text_is_unknown_write_risk() {
        let analysis = classify("postgres", "SELEC * FROMM");

        assert_eq!(analysis.kinds(), vec![CommandKind::Unknown]);
        assert!(analysis.is_mutation());
        assert!(analysis.parse_error.is_some());
    }

    #[test]
    fn mongo_json_find_is_read_only() {
        let analysis = classify(
            "mongodb",
            r#"{"database":"app","collection":"users","operation":"find","query":{}}"#,
        );

        assert_eq!(analysis.kinds(), vec![CommandKind::Select]);
        assert!(!analysis.is_mutation());
    }

    #[test]
    fn mongo_aggregate_with_out_stage_is_write() {
        let analysis = classify(
            "mongodb",
            r#"{"database":"app","collection":"users","operation":"aggregate","pipeline":[{"$out":"copy"}]}"#,
        );

        assert!(analysis.is_mutation());
    }

    #[test]
    fn mongo_shell_delete_many_is_write() {
        let analysis = classify("mongodb", "db.users.deleteMany({})");

        assert!(analysis.is_mutation());
    }
}
