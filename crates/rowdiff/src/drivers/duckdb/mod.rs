//! Embedded DuckDB driver. Enabled with the `duckdb` feature.
//!
//! DuckDB's API is synchronous; every call runs under
//! `tokio::task::spawn_blocking`. Worker connections are clones of one
//! base connection so they share the same database instance, which is what
//! makes `duckdb://:memory:` usable at all.

pub mod dialect;

pub use dialect::DuckDbDialect;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duckdb::types::ValueRef;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::traits::Connection;
use crate::core::value::{DbValue, Row};
use crate::drivers::ConnectParams;
use crate::error::{DiffError, Result};

/// One DuckDB connection handle, owned by a runtime worker.
pub struct DuckDbConnection {
    conn: Arc<Mutex<duckdb::Connection>>,
}

impl DuckDbConnection {
    /// Open the database named by the URI path; `:memory:` or an empty
    /// path opens an in-memory database.
    pub fn open(params: &ConnectParams) -> Result<Self> {
        let path = params.database.as_deref().unwrap_or(":memory:");
        let conn = if path.is_empty() || path == ":memory:" {
            duckdb::Connection::open_in_memory()?
        } else {
            duckdb::Connection::open(path)?
        };
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A worker connection sharing this connection's database instance.
    pub fn fork(&self) -> Result<Self> {
        let base = self.conn.lock().expect("duckdb connection lock poisoned");
        Ok(Self {
            conn: Arc::new(Mutex::new(base.try_clone()?)),
        })
    }
}

fn decode_ref(value: ValueRef<'_>) -> Result<DbValue> {
    Ok(match value {
        ValueRef::Null => DbValue::Null,
        ValueRef::TinyInt(v) => DbValue::Int(v as i64),
        ValueRef::SmallInt(v) => DbValue::Int(v as i64),
        ValueRef::Int(v) => DbValue::Int(v as i64),
        ValueRef::BigInt(v) => DbValue::Int(v),
        ValueRef::UTinyInt(v) => DbValue::Int(v as i64),
        ValueRef::USmallInt(v) => DbValue::Int(v as i64),
        ValueRef::UInt(v) => DbValue::Int(v as i64),
        ValueRef::UBigInt(v) => DbValue::Int(v as i64),
        ValueRef::HugeInt(v) => {
            DbValue::Int(i64::try_from(v).map_err(|_| {
                DiffError::Overflow(format!("HUGEINT value {v} does not fit a 64-bit integer"))
            })?)
        }
        ValueRef::Text(bytes) => DbValue::Text(
            std::str::from_utf8(bytes)
                .map_err(|e| DiffError::query(format!("invalid UTF-8 from DuckDB: {e}")))?
                .to_string(),
        ),
        other => {
            return Err(DiffError::query(format!(
                "unexpected DuckDB value type in result: {other:?}"
            )))
        }
    })
}

fn run_fetch_all(conn: &duckdb::Connection, sql: &str) -> Result<Vec<Vec<DbValue>>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([])?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        // Column metadata is only available once the statement has run.
        let column_count = row.as_ref().column_count();
        let mut decoded = Vec::with_capacity(column_count);
        for i in 0..column_count {
            decoded.push(decode_ref(row.get_ref(i)?)?);
        }
        result.push(decoded);
    }
    Ok(result)
}

#[async_trait]
impl Connection for DuckDbConnection {
    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Vec<DbValue>>> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("duckdb connection lock poisoned");
            run_fetch_all(&conn, &sql)
        })
        .await
        .map_err(|e| DiffError::query(format!("blocking task failed: {e}")))?
    }

    async fn stream(
        &mut self,
        sql: &str,
        out: &mpsc::Sender<Result<Row>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let out = out.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.lock().expect("duckdb connection lock poisoned");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                if cancel.is_cancelled() {
                    return Err(DiffError::Cancelled);
                }
                let column_count = row.as_ref().column_count();
                let mut decoded: Row = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    decoded.push(decode_ref(row.get_ref(i)?)?.into_cell());
                }
                if out.blocking_send(Ok(decoded)).is_err() {
                    break;
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| DiffError::query(format!("blocking task failed: {e}")))?
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("duckdb connection lock poisoned");
            Ok(conn.execute(&sql, [])? as u64)
        })
        .await
        .map_err(|e| DiffError::query(format!("blocking task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checksum;
    use crate::core::traits::Dialect;

    fn fetch(conn: &duckdb::Connection, sql: &str) -> Vec<Vec<DbValue>> {
        run_fetch_all(conn, sql).unwrap()
    }

    #[test]
    fn test_hex_string_cast() {
        // The checksum rendering depends on DuckDB parsing '0x…' varchars.
        let conn = duckdb::Connection::open_in_memory().unwrap();
        let rows = fetch(&conn, "SELECT CAST('0x1f' AS BIGINT)");
        assert_eq!(rows[0][0], DbValue::Int(31));
    }

    #[test]
    fn test_sql_checksum_matches_reference() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        let serialised = "42|alice|2021-03-01 00:00:00.000000";
        let sql = format!(
            "SELECT {}",
            DuckDbDialect::new().render_checksum(&format!("'{serialised}'"))
        );
        let rows = fetch(&conn, &sql);
        assert_eq!(
            rows[0][0],
            DbValue::Int(checksum::row_checksum(serialised))
        );
    }

    #[test]
    fn test_xor_aggregate_composes_in_sql() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (v VARCHAR); INSERT INTO t VALUES ('a'), ('b'), ('c');",
        )
        .unwrap();
        let d = DuckDbDialect::new();
        let whole = fetch(&conn, &format!("SELECT {} FROM t", d.render_checksum("v")));
        let parts = fetch(
            &conn,
            &format!(
                "SELECT {} FROM t WHERE v = 'a'",
                d.render_checksum("v")
            ),
        );
        let rest = fetch(
            &conn,
            &format!(
                "SELECT {} FROM t WHERE v <> 'a'",
                d.render_checksum("v")
            ),
        );
        let (w, p, r) = (
            whole[0][0].as_int().unwrap(),
            parts[0][0].as_int().unwrap(),
            rest[0][0].as_int().unwrap(),
        );
        assert_eq!(w, p ^ r);
    }
}
