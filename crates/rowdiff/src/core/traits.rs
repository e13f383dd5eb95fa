//! Core traits: the SQL dialect strategy and the driver connection.
//!
//! [`Dialect`] is a Strategy: each database product renders the same
//! logical expressions (canonical casts, the checksum aggregate, quoting,
//! limits) in its own syntax, under one hard contract: identical
//! canonical serialisations must checksum to bit-identical integers on
//! every engine.
//!
//! [`Connection`] is the minimal surface the dispatch runtime needs from a
//! driver: buffered fetch for small result sets, a backpressured row
//! stream for downloads, and statement execution for materialisation.
//! Both traits are dispatched statically through enums in [`crate::drivers`].

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::schema::{ColumnType, TablePath};
use crate::core::value::{DbValue, Row};
use crate::error::Result;

/// SQL syntax strategy for one database product.
pub trait Dialect: Send + Sync {
    /// Dialect identifier (e.g. "postgresql").
    fn name(&self) -> &'static str;

    /// Quote an identifier. Identifiers are validated before they reach
    /// the dialect (see [`crate::core::identifier`]).
    fn quote_ident(&self, name: &str) -> String;

    /// Render a row limit clause.
    fn render_limit(&self, limit: u64) -> String {
        format!("LIMIT {limit}")
    }

    /// Render an offset/limit clause.
    fn render_offset_limit(&self, offset: u64, limit: u64) -> String {
        format!("LIMIT {limit} OFFSET {offset}")
    }

    /// The random-ordering function used for exclusive-row sampling.
    fn render_random(&self) -> &'static str;

    /// Concatenate string expressions with the checksum field separator.
    fn render_concat(&self, parts: &[String]) -> String;

    /// Render the segment checksum aggregate over a canonical row
    /// serialisation expression. See [`crate::core::checksum`] for the
    /// protocol the produced SQL must implement.
    fn render_checksum(&self, expr: &str) -> String;

    /// Coerce a column expression to its canonical string form for the
    /// given unified type.
    fn render_canonical(&self, expr: &str, col_type: &ColumnType, case_sensitive: bool) -> String;

    /// Null-safe inequality between two expressions.
    fn render_is_distinct(&self, a: &str, b: &str) -> String {
        format!("{a} IS DISTINCT FROM {b}")
    }

    /// `COUNT(DISTINCT …)` over one or more columns.
    fn render_count_distinct(&self, cols: &[String]) -> String;

    /// Map a canonical type name to this dialect's spelling.
    fn render_type(&self, name: &str) -> String {
        name.to_string()
    }

    /// Schema discovery query for a table path. Must return one row per
    /// column, in declaration order, with the columns
    /// `(column_name, data_type, numeric_scale, datetime_precision)`.
    fn schema_query(&self, path: &TablePath) -> String;

    // Capability flags.

    fn supports_approx_median(&self) -> bool {
        false
    }

    fn supports_tablesample(&self) -> bool {
        false
    }

    /// Materialised `CREATE TABLE … AS` support.
    fn supports_ctas(&self) -> bool {
        true
    }

    /// FULL OUTER JOIN support; gates JoinDiff eligibility.
    fn supports_full_outer_join(&self) -> bool;
}

/// One driver connection, owned by a single runtime worker.
#[async_trait]
pub trait Connection: Send {
    /// Run a query and buffer the full result. Used for scalar results
    /// (counts, checksums, key bounds, checkpoints) and schema discovery.
    async fn fetch_all(&mut self, sql: &str) -> Result<Vec<Vec<DbValue>>>;

    /// Run a query and stream its rows into `out`, observing backpressure
    /// from the bounded channel and stopping early when `cancel` fires or
    /// the receiver is dropped.
    async fn stream(
        &mut self,
        sql: &str,
        out: &mpsc::Sender<Result<Row>>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Execute a statement (DDL, CTAS); returns the affected row count
    /// when the driver reports one.
    async fn execute(&mut self, sql: &str) -> Result<u64>;
}
