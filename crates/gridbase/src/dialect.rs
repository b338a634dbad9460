//! SQL rendering for the supported engines
//!
//! Every statement the write path issues is produced here, so the batch,
//! field and op-log code stays engine-agnostic. Identifiers are always quoted;
//! values are always bound through placeholders.

use sea_orm::{DbBackend, Statement, Value};

use crate::error::{GridError, Result};
use crate::schema::{split_table_name, SchemaType};

pub const ID_COLUMN: &str = "__id";
pub const VERSION_COLUMN: &str = "__version";
pub const CREATED_TIME_COLUMN: &str = "__created_time";
pub const LAST_MODIFIED_TIME_COLUMN: &str = "__last_modified_time";
pub const CREATED_BY_COLUMN: &str = "__created_by";
pub const LAST_MODIFIED_BY_COLUMN: &str = "__last_modified_by";

/// Target engine of rendered SQL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

/// One column of a bulk-write shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub schema_type: SchemaType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, schema_type: SchemaType) -> Self {
        Self {
            name: name.into(),
            schema_type,
        }
    }
}

/// Column definition as reported by the SQLite catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableColumn {
    pub name: String,
    pub sql_type: String,
    pub not_null: bool,
    pub default: Option<String>,
    /// Position in the primary key, 0 when not part of it
    pub primary_key: i64,
}

impl From<DbBackend> for Dialect {
    fn from(backend: DbBackend) -> Self {
        match backend {
            DbBackend::Postgres => Dialect::Postgres,
            DbBackend::MySql => Dialect::MySql,
            DbBackend::Sqlite => Dialect::Sqlite,
        }
    }
}

impl Dialect {
    pub fn backend(&self) -> DbBackend {
        match self {
            Dialect::Postgres => DbBackend::Postgres,
            Dialect::MySql => DbBackend::MySql,
            Dialect::Sqlite => DbBackend::Sqlite,
        }
    }

    /// Wrap rendered SQL and its bound values into a statement for this engine
    pub fn statement(&self, sql: String, values: Vec<Value>) -> Statement {
        Statement::from_sql_and_values(self.backend(), sql, values)
    }

    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", ident.replace('`', "``")),
            Dialect::Postgres | Dialect::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Quote a possibly schema-qualified table name
    pub fn quote_table(&self, db_table_name: &str) -> String {
        match split_table_name(db_table_name) {
            (Some(schema), table) => format!("{}.{}", self.quote(schema), self.quote(table)),
            (None, table) => self.quote(table),
        }
    }

    /// Placeholder for the `index`-th bound value (1-based)
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::MySql | Dialect::Sqlite => "?".to_string(),
        }
    }

    fn placeholders(&self, start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| self.placeholder(i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn column_type(&self, schema_type: SchemaType) -> &'static str {
        match (self, schema_type) {
            (_, SchemaType::String) => "varchar(255)",
            (_, SchemaType::Text) => "text",
            (Dialect::Sqlite, SchemaType::Integer) => "integer",
            (_, SchemaType::Integer) => "bigint",
            (Dialect::Postgres, SchemaType::Double) => "double precision",
            (_, SchemaType::Double) => "double",
            (Dialect::Postgres, SchemaType::Datetime) => "timestamptz",
            (Dialect::MySql, SchemaType::Datetime) => "datetime(6)",
            (Dialect::Sqlite, SchemaType::Datetime) => "datetime",
            (_, SchemaType::Boolean) => "boolean",
            (Dialect::Postgres, SchemaType::Json) => "jsonb",
            (Dialect::MySql, SchemaType::Json) => "json",
            (Dialect::Sqlite, SchemaType::Json) => "text",
            (Dialect::Postgres, SchemaType::Binary) => "bytea",
            (_, SchemaType::Binary) => "blob",
        }
    }

    /// Physical table with the system columns every record carries
    pub fn create_physical_table(&self, db_table_name: &str) -> Vec<String> {
        let mut sqls = Vec::new();
        if let (Dialect::Postgres, (Some(schema), _)) = (self, split_table_name(db_table_name)) {
            sqls.push(format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote(schema)));
        }
        let datetime = self.column_type(SchemaType::Datetime);
        let string = self.column_type(SchemaType::String);
        sqls.push(format!(
            "CREATE TABLE {} ({} {} NOT NULL PRIMARY KEY, {} {} NOT NULL DEFAULT 0, {} {} NOT NULL DEFAULT CURRENT_TIMESTAMP, {} {} NULL, {} {} NULL, {} {} NULL)",
            self.quote_table(db_table_name),
            self.quote(ID_COLUMN),
            string,
            self.quote(VERSION_COLUMN),
            self.column_type(SchemaType::Integer),
            self.quote(CREATED_TIME_COLUMN),
            datetime,
            self.quote(LAST_MODIFIED_TIME_COLUMN),
            datetime,
            self.quote(CREATED_BY_COLUMN),
            string,
            self.quote(LAST_MODIFIED_BY_COLUMN),
            string,
        ));
        sqls
    }

    pub fn drop_table(&self, db_table_name: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_table(db_table_name))
    }

    pub fn add_column(&self, db_table_name: &str, column: &str, schema_type: SchemaType) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.quote_table(db_table_name),
            self.quote(column),
            self.column_type(schema_type)
        )
    }

    /// Drop a column together with the indexes that would block the drop
    pub fn drop_column(&self, db_table_name: &str, column: &str, indexes: &[String]) -> Vec<String> {
        let mut sqls = Vec::new();
        if *self == Dialect::Sqlite {
            for index in indexes {
                sqls.push(self.drop_index(db_table_name, index));
            }
        }
        sqls.push(format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_table(db_table_name),
            self.quote(column)
        ));
        sqls
    }

    pub fn rename_column(&self, db_table_name: &str, from: &str, to: &str) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.quote_table(db_table_name),
            self.quote(from),
            self.quote(to)
        )]
    }

    /// Change the storage type of a column whose values were already reset to null.
    ///
    /// SQLite columns have no enforced type, so nothing is issued there.
    pub fn modify_column_type(
        &self,
        db_table_name: &str,
        column: &str,
        schema_type: SchemaType,
    ) -> Vec<String> {
        let sql_type = self.column_type(schema_type);
        match self {
            Dialect::Postgres => vec![format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING NULL::{}",
                self.quote_table(db_table_name),
                self.quote(column),
                sql_type,
                sql_type
            )],
            Dialect::MySql => vec![format!(
                "ALTER TABLE {} MODIFY COLUMN {} {}",
                self.quote_table(db_table_name),
                self.quote(column),
                sql_type
            )],
            Dialect::Sqlite => Vec::new(),
        }
    }

    pub fn set_not_null(
        &self,
        db_table_name: &str,
        column: &str,
        schema_type: SchemaType,
        not_null: bool,
    ) -> Result<Vec<String>> {
        match self {
            Dialect::Postgres => Ok(vec![format!(
                "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL",
                self.quote_table(db_table_name),
                self.quote(column),
                if not_null { "SET" } else { "DROP" }
            )]),
            Dialect::MySql => Ok(vec![format!(
                "ALTER TABLE {} MODIFY COLUMN {} {} {}",
                self.quote_table(db_table_name),
                self.quote(column),
                self.column_type(schema_type),
                if not_null { "NOT NULL" } else { "NULL" }
            )]),
            Dialect::Sqlite => Err(GridError::Unsupported(format!(
                "sqlite changes nullability of {}.{} through a table rebuild",
                db_table_name, column
            ))),
        }
    }

    /// Recreate a SQLite table with new column definitions, keeping rows and indexes.
    ///
    /// `index_sqls` are the stored `CREATE INDEX` statements of the table; they
    /// are replayed after the rename since dropping the old table drops them.
    pub fn rebuild_table(&self, db_table_name: &str, columns: &[TableColumn], index_sqls: &[String]) -> Vec<String> {
        let (_, table) = split_table_name(db_table_name);
        let rebuilt = format!("_rebuild_{}", table);

        let mut definitions: Vec<String> = columns
            .iter()
            .map(|c| {
                let mut definition = format!("{} {}", self.quote(&c.name), c.sql_type);
                if c.not_null {
                    definition.push_str(" NOT NULL");
                }
                if let Some(default) = &c.default {
                    definition.push_str(&format!(" DEFAULT ({})", default));
                }
                definition
            })
            .collect();
        let mut key: Vec<&TableColumn> = columns.iter().filter(|c| c.primary_key > 0).collect();
        key.sort_by_key(|c| c.primary_key);
        if !key.is_empty() {
            definitions.push(format!(
                "PRIMARY KEY ({})",
                key.iter().map(|c| self.quote(&c.name)).collect::<Vec<_>>().join(", ")
            ));
        }
        let column_list = columns
            .iter()
            .map(|c| self.quote(&c.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sqls = vec![
            format!("CREATE TABLE {} ({})", self.quote(&rebuilt), definitions.join(", ")),
            format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                self.quote(&rebuilt),
                column_list,
                column_list,
                self.quote_table(db_table_name)
            ),
            format!("DROP TABLE {}", self.quote_table(db_table_name)),
            format!("ALTER TABLE {} RENAME TO {}", self.quote(&rebuilt), self.quote(table)),
        ];
        sqls.extend(index_sqls.iter().cloned());
        sqls
    }

    pub fn create_unique_index(&self, db_table_name: &str, column: &str, index_name: &str) -> String {
        format!(
            "CREATE UNIQUE INDEX {} ON {} ({})",
            self.quote(index_name),
            self.quote_table(db_table_name),
            self.quote(column)
        )
    }

    pub fn drop_index(&self, db_table_name: &str, index_name: &str) -> String {
        match self {
            Dialect::Postgres => match split_table_name(db_table_name) {
                (Some(schema), _) => format!(
                    "DROP INDEX IF EXISTS {}.{}",
                    self.quote(schema),
                    self.quote(index_name)
                ),
                (None, _) => format!("DROP INDEX IF EXISTS {}", self.quote(index_name)),
            },
            Dialect::MySql => format!(
                "DROP INDEX {} ON {}",
                self.quote(index_name),
                self.quote_table(db_table_name)
            ),
            Dialect::Sqlite => format!("DROP INDEX IF EXISTS {}", self.quote(index_name)),
        }
    }

    /// Staging table keyed by the id column, one column per written schema entry
    pub fn create_temp_table(&self, temp_table: &str, id_column: &str, schemas: &[ColumnSchema]) -> String {
        let mut columns = vec![format!(
            "{} {} PRIMARY KEY",
            self.quote(id_column),
            self.column_type(SchemaType::String)
        )];
        columns.extend(
            schemas
                .iter()
                .map(|s| format!("{} {}", self.quote(&s.name), self.column_type(s.schema_type))),
        );
        let keyword = match self {
            Dialect::Sqlite => "CREATE TEMP TABLE",
            Dialect::Postgres | Dialect::MySql => "CREATE TEMPORARY TABLE",
        };
        format!("{} {} ({})", keyword, self.quote(temp_table), columns.join(", "))
    }

    pub fn drop_temp_table(&self, temp_table: &str) -> String {
        match self {
            Dialect::MySql => format!("DROP TEMPORARY TABLE {}", self.quote(temp_table)),
            Dialect::Postgres | Dialect::Sqlite => format!("DROP TABLE {}", self.quote(temp_table)),
        }
    }

    /// Multi-row insert with `row_count` groups of placeholders
    pub fn insert_rows(&self, db_table_name: &str, columns: &[&str], row_count: usize) -> String {
        let column_list = columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ");
        let groups = (0..row_count)
            .map(|row| format!("({})", self.placeholders(row * columns.len() + 1, columns.len())))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.quote_table(db_table_name),
            column_list,
            groups
        )
    }

    /// Set-based update of the target from the staging table, joined on the id column
    pub fn update_from_temp(
        &self,
        db_table_name: &str,
        temp_table: &str,
        id_column: &str,
        columns: &[&str],
    ) -> String {
        let target = self.quote_table(db_table_name);
        let temp = self.quote(temp_table);
        let id = self.quote(id_column);
        match self {
            Dialect::MySql => {
                let sets = columns
                    .iter()
                    .map(|c| format!("{}.{} = {}.{}", target, self.quote(c), temp, self.quote(c)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "UPDATE {} INNER JOIN {} ON {}.{} = {}.{} SET {}",
                    target, temp, target, id, temp, id, sets
                )
            }
            Dialect::Postgres | Dialect::Sqlite => {
                let sets = columns
                    .iter()
                    .map(|c| format!("{} = {}.{}", self.quote(c), temp, self.quote(c)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!(
                    "UPDATE {} SET {} FROM {} WHERE {}.{} = {}.{}",
                    target, sets, temp, target, id, temp, id
                )
            }
        }
    }

    pub fn select_versions(&self, db_table_name: &str, id_count: usize) -> String {
        format!(
            "SELECT {}, {}, {}, {} FROM {} WHERE {} IN ({})",
            self.quote(ID_COLUMN),
            self.quote(VERSION_COLUMN),
            self.quote(LAST_MODIFIED_TIME_COLUMN),
            self.quote(LAST_MODIFIED_BY_COLUMN),
            self.quote_table(db_table_name),
            self.quote(ID_COLUMN),
            self.placeholders(1, id_count)
        )
    }

    pub fn delete_rows(&self, db_table_name: &str, id_count: usize) -> String {
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.quote_table(db_table_name),
            self.quote(ID_COLUMN),
            self.placeholders(1, id_count)
        )
    }

    pub fn reset_column(&self, db_table_name: &str, column: &str) -> String {
        format!(
            "UPDATE {} SET {} = NULL",
            self.quote_table(db_table_name),
            self.quote(column)
        )
    }

    /// Query listing the physical column names of a table, aliased `name`
    pub fn column_names_query(&self, db_table_name: &str) -> Statement {
        let (schema, table) = split_table_name(db_table_name);
        match self {
            Dialect::Postgres => self.statement(
                "SELECT column_name AS name FROM information_schema.columns WHERE table_schema = $1 AND table_name = $2".to_string(),
                vec![schema.unwrap_or("public").into(), table.into()],
            ),
            Dialect::MySql => self.statement(
                "SELECT COLUMN_NAME AS name FROM information_schema.columns WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?".to_string(),
                vec![schema.map(str::to_string).into(), table.into()],
            ),
            Dialect::Sqlite => self.statement(
                "SELECT name FROM pragma_table_info(?)".to_string(),
                vec![table.into()],
            ),
        }
    }

    /// SQLite column definitions of a table, in declaration order
    pub fn table_columns_query(&self, db_table_name: &str) -> Statement {
        let (_, table) = split_table_name(db_table_name);
        self.statement(
            "SELECT name, type, \"notnull\" AS not_null, dflt_value, pk FROM pragma_table_info(?) ORDER BY cid".to_string(),
            vec![table.into()],
        )
    }

    /// Stored SQLite `CREATE INDEX` statements of a table; implicit indexes have none
    pub fn index_definitions_query(&self, db_table_name: &str) -> Statement {
        let (_, table) = split_table_name(db_table_name);
        self.statement(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND tbl_name = ? AND sql IS NOT NULL".to_string(),
            vec![table.into()],
        )
    }

    /// Query listing the index names of a table, aliased `name`
    pub fn table_indexes_query(&self, db_table_name: &str) -> Statement {
        let (schema, table) = split_table_name(db_table_name);
        match self {
            Dialect::Postgres => self.statement(
                "SELECT indexname AS name FROM pg_indexes WHERE schemaname = $1 AND tablename = $2".to_string(),
                vec![schema.unwrap_or("public").into(), table.into()],
            ),
            Dialect::MySql => self.statement(
                "SELECT DISTINCT INDEX_NAME AS name FROM information_schema.statistics WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?".to_string(),
                vec![schema.map(str::to_string).into(), table.into()],
            ),
            Dialect::Sqlite => self.statement(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?".to_string(),
                vec![table.into()],
            ),
        }
    }
}
