//! The embedded relational substrate the suppression kernel runs against.
//!
//! Single connection, synchronous, no suspension points: every dataset in a
//! pipeline run executes strictly after the previous one finishes (see the
//! orchestrator). Transient tables are created with `CREATE OR REPLACE` so a
//! failed run leaves the catalog consistent for the next attempt.

use std::path::Path;

use serde_json::Map;

use crate::error::{Result, TesseraError};
use crate::identifier::quote_ident;
use crate::query_result::{duck_value_to_json, ColumnMeta, QueryResult};

pub struct Substrate {
    conn: duckdb::Connection,
}

impl Substrate {
    pub fn open_in_memory() -> Result<Self> {
        let conn = duckdb::Connection::open_in_memory()?;
        conn.execute_batch("INSTALL httpfs; LOAD httpfs;")?;
        Ok(Self { conn })
    }

    /// Run a statement that returns no rows (DDL, `CREATE OR REPLACE`, COPY).
    pub fn execute(&self, sql: &str) -> Result<()> {
        tracing::debug!(sql, "executing statement");
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Run a query and materialize every row as a JSON object keyed by
    /// column name.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        tracing::debug!(sql, "running query");
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows_iter = stmt.query([])?;
        let stmt_ref = rows_iter
            .as_ref()
            .ok_or_else(|| TesseraError::Substrate("statement missing".to_string()))?;
        let mut column_names = Vec::new();
        for idx in 0..stmt_ref.column_count() {
            column_names.push(stmt_ref.column_name(idx)?.to_string());
        }

        let mut rows = Vec::new();
        while let Some(row) = rows_iter.next()? {
            let mut map = Map::new();
            for (idx, name) in column_names.iter().enumerate() {
                let value = duck_value_to_json(row.get_ref(idx)?.to_owned());
                map.insert(name.clone(), value);
            }
            rows.push(map);
        }

        let columns = column_names
            .into_iter()
            .map(|name| ColumnMeta { name })
            .collect();
        Ok(QueryResult { columns, rows })
    }

    /// Load a CSV or Parquet file (local path or `s3://` URI) as a table,
    /// replacing any existing table of the same name.
    pub fn load_table_from_file(&self, table: &str, source: &str) -> Result<()> {
        let reader = reader_function_for(source)?;
        let sql = format!(
            "CREATE OR REPLACE TABLE {} AS SELECT * FROM {reader}('{source}')",
            quote_ident(table)
        );
        self.execute(&sql)
    }

    /// Create (or replace) a table from an arbitrary view definition, used
    /// for a dataset's optional `sql` field.
    pub fn create_table_as(&self, table: &str, select_sql: &str) -> Result<()> {
        let sql = format!(
            "CREATE OR REPLACE TABLE {} AS {select_sql}",
            quote_ident(table)
        );
        self.execute(&sql)
    }

    /// Write a table to CSV or Parquet based on the output path's suffix.
    pub fn write_table_to_file(&self, table: &str, destination: &str) -> Result<()> {
        let format = match Path::new(destination)
            .extension()
            .and_then(|e| e.to_str())
        {
            Some("parquet") => "(FORMAT PARQUET)",
            Some("csv") | _ => "(FORMAT CSV, HEADER)",
        };
        let sql = format!(
            "COPY {} TO '{destination}' {format}",
            quote_ident(table)
        );
        self.execute(&sql)
    }
}

fn reader_function_for(source: &str) -> Result<&'static str> {
    match Path::new(source).extension().and_then(|e| e.to_str()) {
        Some("parquet") => Ok("read_parquet"),
        Some("csv") => Ok("read_csv_auto"),
        other => Err(TesseraError::Source(format!(
            "unsupported source file extension: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executes_and_queries_in_memory() {
        let substrate = Substrate::open_in_memory().unwrap();
        substrate
            .execute("CREATE OR REPLACE TABLE t AS SELECT 1 AS a, 'x' AS b")
            .unwrap();
        let result = substrate.query("SELECT a, b FROM t").unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0]["a"], serde_json::json!(1));
        assert_eq!(result.rows[0]["b"], serde_json::json!("x"));
    }

    #[test]
    fn rejects_unknown_source_extension() {
        let substrate = Substrate::open_in_memory().unwrap();
        let err = substrate.load_table_from_file("t", "data.tsv").unwrap_err();
        assert!(matches!(err, TesseraError::Source(_)));
    }
}
