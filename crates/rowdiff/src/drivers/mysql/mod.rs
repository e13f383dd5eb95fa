//! MySQL driver backed by SQLx. Enabled with the `mysql` feature.

pub mod dialect;

pub use dialect::MysqlDialect;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{Column, ConnectOptions, Row as SqlxRow, TypeInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::traits::Connection;
use crate::core::value::{DbValue, Row};
use crate::drivers::ConnectParams;
use crate::error::{DiffError, Result};

/// One MySQL connection, owned by a runtime worker.
pub struct MysqlConnection {
    conn: sqlx::MySqlConnection,
}

impl MysqlConnection {
    pub async fn connect(params: &ConnectParams) -> Result<Self> {
        let mut options = MySqlConnectOptions::new()
            .host(params.host.as_deref().unwrap_or("localhost"))
            .port(params.port.unwrap_or(3306));
        if let Some(user) = &params.user {
            options = options.username(user);
        }
        if let Some(password) = &params.password {
            options = options.password(password);
        }
        if let Some(database) = &params.database {
            options = options.database(database);
        }
        let conn = options.connect().await?;
        Ok(Self { conn })
    }
}

fn is_integer_type(name: &str) -> bool {
    matches!(
        name,
        "TINYINT"
            | "SMALLINT"
            | "MEDIUMINT"
            | "INT"
            | "BIGINT"
            | "TINYINT UNSIGNED"
            | "SMALLINT UNSIGNED"
            | "MEDIUMINT UNSIGNED"
            | "INT UNSIGNED"
            | "BIGINT UNSIGNED"
    )
}

fn decode_value(row: &MySqlRow, idx: usize) -> Result<DbValue> {
    let type_name = row.column(idx).type_info().name().to_uppercase();
    let value = if is_integer_type(&type_name) {
        match row.try_get::<Option<i64>, _>(idx) {
            Ok(v) => v.map(DbValue::Int),
            // BIT_XOR returns BIGINT UNSIGNED; route through u64 when the
            // signed decode rejects it.
            Err(_) => row
                .try_get::<Option<u64>, _>(idx)?
                .map(|v| DbValue::Int(v as i64)),
        }
    } else {
        row.try_get::<Option<String>, _>(idx)?.map(DbValue::Text)
    };
    Ok(value.unwrap_or(DbValue::Null))
}

fn decode_row(row: &MySqlRow) -> Result<Row> {
    (0..row.len())
        .map(|i| Ok(decode_value(row, i)?.into_cell()))
        .collect()
}

#[async_trait]
impl Connection for MysqlConnection {
    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Vec<DbValue>>> {
        let rows = sqlx::query(sql).fetch_all(&mut self.conn).await?;
        rows.iter()
            .map(|row| (0..row.len()).map(|i| decode_value(row, i)).collect())
            .collect()
    }

    async fn stream(
        &mut self,
        sql: &str,
        out: &mpsc::Sender<Result<Row>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream = sqlx::query(sql).fetch(&mut self.conn);
        loop {
            let next = tokio::select! {
                row = stream.try_next() => row.map_err(DiffError::from)?,
                _ = cancel.cancelled() => return Err(DiffError::Cancelled),
            };
            let Some(row) = next else { break };
            if out.send(decode_row(&row)).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let result = sqlx::query(sql).execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }
}
