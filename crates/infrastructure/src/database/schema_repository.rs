use async_trait::async_trait;
use domain::error::{IngestError, Result};
use domain::schema::{SchemaRepository, TableSchema};
use domain::value::{ColumnType, Row, Value};
use sqlx::postgres::PgPool;
use sqlx::Row as SqlxRow;
use std::collections::BTreeMap;

/// Quotes a SQL identifier, doubling any embedded quote. Table and column
/// names originate from [`domain::naming::sanitize_identifier`] or payload
/// field names, neither of which are trusted to be safe to interpolate raw.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn sql_type(t: ColumnType) -> &'static str {
    match t {
        ColumnType::Boolean => "boolean",
        ColumnType::Integer => "bigint",
        ColumnType::Float => "double precision",
        ColumnType::Text => "text",
        ColumnType::Json => "jsonb",
    }
}

fn pg_type_to_column_type(data_type: &str) -> ColumnType {
    match data_type {
        "boolean" => ColumnType::Boolean,
        "bigint" | "integer" | "smallint" => ColumnType::Integer,
        "double precision" | "real" | "numeric" => ColumnType::Float,
        "jsonb" | "json" => ColumnType::Json,
        _ => ColumnType::Text,
    }
}

fn db_err(e: sqlx::Error) -> IngestError {
    IngestError::Schema(e.to_string())
}

/// [`SchemaRepository`] backed by dynamic DDL/DML over a Postgres pool.
/// Every managed table's column set is runtime-determined, so this talks to
/// `information_schema` and builds statements at call time rather than going
/// through compile-time-checked queries.
pub struct PostgresSchemaRepository {
    pool: PgPool,
}

impl PostgresSchemaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SchemaRepository for PostgresSchemaRepository {
    async fn existing_tables(&self) -> Result<Vec<TableSchema>> {
        let rows = sqlx::query(
            "SELECT table_name, column_name, data_type FROM information_schema.columns \
             WHERE table_schema = 'public' ORDER BY table_name, ordinal_position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut tables: BTreeMap<String, BTreeMap<String, ColumnType>> = BTreeMap::new();
        for row in rows {
            let table: String = row.try_get("table_name").map_err(db_err)?;
            let column: String = row.try_get("column_name").map_err(db_err)?;
            let data_type: String = row.try_get("data_type").map_err(db_err)?;
            tables.entry(table).or_default().insert(column, pg_type_to_column_type(&data_type));
        }

        Ok(tables.into_iter().map(|(name, columns)| TableSchema { name, columns }).collect())
    }

    async fn create_table(&self, name: &str, columns: &BTreeMap<String, ColumnType>) -> Result<()> {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGSERIAL PRIMARY KEY, topic TEXT NOT NULL, ",
            quote_ident(name)
        );
        for (column, ty) in columns {
            sql.push_str(&format!("{} {}, ", quote_ident(column), sql_type(*ty)));
        }
        sql.push_str("ingested_at TIMESTAMPTZ NOT NULL DEFAULT now())");

        sqlx::query(&sql).execute(&self.pool).await.map_err(db_err)?;

        // §4.2: index DeviceID and ts when the shape carries them, plus
        // ingested_at unconditionally.
        for indexed_column in ["DeviceID", "ts"] {
            if columns.contains_key(indexed_column) {
                let idx_sql = format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    quote_ident(&format!("{name}_{}_idx", indexed_column.to_ascii_lowercase())),
                    quote_ident(name),
                    quote_ident(indexed_column),
                );
                sqlx::query(&idx_sql).execute(&self.pool).await.map_err(db_err)?;
            }
        }

        let idx_sql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (ingested_at)",
            quote_ident(&format!("{name}_ingested_at_idx")),
            quote_ident(name),
        );
        sqlx::query(&idx_sql).execute(&self.pool).await.map_err(db_err)?;

        Ok(())
    }

    async fn widen_columns(&self, name: &str, columns: &BTreeMap<String, ColumnType>) -> Result<()> {
        for (column, ty) in columns {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                quote_ident(name),
                quote_ident(column),
                sql_type(*ty)
            );
            sqlx::query(&sql).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }

    async fn insert_row(&self, table: &str, row: &Row) -> Result<()> {
        if row.is_empty() {
            return Ok(());
        }

        let columns: Vec<&String> = row.keys().collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            placeholders.join(", "),
        );

        let mut query = sqlx::query(&sql);
        for column in &columns {
            query = bind_value(query, &row[*column]);
        }
        query.execute(&self.pool).await.map_err(db_err)?;

        Ok(())
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s),
        Value::Json(j) => query.bind(j),
        Value::List(_) => query.bind(serde_json::to_value(value).unwrap_or(serde_json::Value::Null)),
    }
}
