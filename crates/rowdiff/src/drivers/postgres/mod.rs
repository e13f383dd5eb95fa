//! PostgreSQL driver: native tokio-postgres connections.

pub mod dialect;

pub use dialect::PostgresDialect;

use async_trait::async_trait;
use futures_util::{pin_mut, TryStreamExt};
use tokio::sync::mpsc;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::traits::Connection;
use crate::core::value::{DbValue, Row};
use crate::drivers::ConnectParams;
use crate::error::{DiffError, Result};

/// One PostgreSQL connection, owned by a runtime worker.
pub struct PostgresConnection {
    client: tokio_postgres::Client,
    // Drives the connection; completes when the client is dropped.
    _io_task: tokio::task::JoinHandle<()>,
}

impl PostgresConnection {
    pub async fn connect(params: &ConnectParams) -> Result<Self> {
        let mut config = tokio_postgres::Config::new();
        config.host(params.host.as_deref().unwrap_or("localhost"));
        config.port(params.port.unwrap_or(5432));
        if let Some(user) = &params.user {
            config.user(user);
        }
        if let Some(password) = &params.password {
            config.password(password);
        }
        if let Some(database) = &params.database {
            config.dbname(database);
        }
        for (key, value) in &params.options {
            if key == "application_name" {
                config.application_name(value);
            }
        }

        let (client, connection) = config.connect(NoTls).await?;
        let io_task = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("postgres connection terminated: {err}");
            }
        });

        Ok(Self {
            client,
            _io_task: io_task,
        })
    }
}

fn decode_value(row: &tokio_postgres::Row, idx: usize) -> Result<DbValue> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?
            .map(|v| DbValue::Int(v as i64))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?
            .map(|v| DbValue::Int(v as i64))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(DbValue::Int)
    } else {
        row.try_get::<_, Option<String>>(idx)?.map(DbValue::Text)
    };
    Ok(value.unwrap_or(DbValue::Null))
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Row> {
    (0..row.len())
        .map(|i| Ok(decode_value(row, i)?.into_cell()))
        .collect()
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Vec<DbValue>>> {
        let rows = self.client.query(sql, &[]).await?;
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
        let params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        let stream = self.client.query_raw(sql, params).await?;
        pin_mut!(stream);

        loop {
            let next = tokio::select! {
                row = stream.try_next() => row?,
                _ = cancel.cancelled() => return Err(DiffError::Cancelled),
            };
            let Some(row) = next else { break };
            if out.send(decode_row(&row)).await.is_err() {
                // Receiver dropped: the consumer has all it wants.
                break;
            }
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        Ok(self.client.execute(sql, &[]).await?)
    }
}
