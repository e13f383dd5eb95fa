//! TableSegment: an immutable slice of a table over a half-open key range.
//!
//! A segment describes a table, a key-column prefix, the projected
//! columns, and optional restrictions (key range, update-time range, a
//! caller `where` predicate). It renders and executes the four queries
//! the diff algorithms need: count, count+checksum, key bounds, and the
//! ordered row download. Segments are never mutated; bisection derives
//! child segments as new values.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::core::checksum::NULL_SENTINEL;
use crate::core::identifier::validate_identifier;
use crate::core::schema::{ColumnType, TablePath, TableSchema};
use crate::core::traits::Dialect;
use crate::core::value::{Key, KeyBound, KeyKind, KeyValue};
use crate::drivers::Database;
use crate::error::{DiffError, Result};
use crate::runtime::RowStream;

/// A checksum round slower than this logs a tuning warning.
const RECOMMENDED_CHECKSUM_SECS: u64 = 20;

/// Alias prefix for key columns in generated subqueries.
const KEY_ALIAS: &str = "__rd_k";

/// An immutable description of a table slice.
#[derive(Clone)]
pub struct TableSegment {
    database: Arc<Database>,
    path: TablePath,
    key_columns: Vec<String>,
    update_column: Option<String>,
    extra_columns: Vec<String>,
    transform_columns: BTreeMap<String, String>,
    min_key: Option<Key>,
    max_key: KeyBound,
    min_update: Option<NaiveDateTime>,
    max_update: Option<NaiveDateTime>,
    where_clause: Option<String>,
    case_sensitive: bool,
    schema: Option<TableSchema>,
}

impl TableSegment {
    /// Create an unbounded segment over the whole table.
    pub fn new(
        database: Arc<Database>,
        path: TablePath,
        key_columns: Vec<String>,
    ) -> Result<TableSegment> {
        if key_columns.is_empty() {
            return Err(DiffError::config("at least one key column is required"));
        }
        validate_identifier(&path.table)?;
        if let Some(schema) = &path.schema {
            validate_identifier(schema)?;
        }
        for col in &key_columns {
            validate_identifier(col)?;
        }
        Ok(TableSegment {
            database,
            path,
            key_columns,
            update_column: None,
            extra_columns: Vec::new(),
            transform_columns: BTreeMap::new(),
            min_key: None,
            max_key: KeyBound::Unbounded,
            min_update: None,
            max_update: None,
            where_clause: None,
            case_sensitive: true,
            schema: None,
        })
    }

    pub fn with_key_columns(mut self, key_columns: Vec<String>) -> Result<TableSegment> {
        if key_columns.is_empty() {
            return Err(DiffError::config("at least one key column is required"));
        }
        for col in &key_columns {
            validate_identifier(col)?;
        }
        self.key_columns = key_columns;
        Ok(self)
    }

    /// Set caller-supplied key bounds without the parent-range assertions
    /// of [`TableSegment::new_key_bounds`].
    pub fn with_key_range(mut self, min_key: Option<Key>, max_key: KeyBound) -> TableSegment {
        self.min_key = min_key;
        self.max_key = max_key;
        self
    }

    pub fn with_update_column(mut self, column: Option<String>) -> Result<TableSegment> {
        if let Some(col) = &column {
            validate_identifier(col)?;
        }
        self.update_column = column;
        Ok(self)
    }

    pub fn with_extra_columns(mut self, columns: Vec<String>) -> Result<TableSegment> {
        for col in &columns {
            validate_identifier(col)?;
        }
        self.extra_columns = columns;
        Ok(self)
    }

    pub fn with_where(mut self, clause: Option<String>) -> TableSegment {
        self.where_clause = clause;
        self
    }

    /// Map columns to SQL expressions that replace them in every
    /// comparison: key ranges, the checksum/download projection, key
    /// ordering and bounding. Useful for on-the-fly normalisation (type
    /// casts, timezone shifts) without staging views. The expression must
    /// stay within the column's declared type.
    pub fn with_transform_columns(
        mut self,
        transforms: BTreeMap<String, String>,
    ) -> TableSegment {
        self.transform_columns = transforms;
        self
    }

    pub fn with_case_sensitive(mut self, case_sensitive: bool) -> TableSegment {
        self.case_sensitive = case_sensitive;
        self
    }

    pub fn with_update_range(
        mut self,
        min_update: Option<NaiveDateTime>,
        max_update: Option<NaiveDateTime>,
    ) -> Result<TableSegment> {
        if (min_update.is_some() || max_update.is_some()) && self.update_column.is_none() {
            return Err(DiffError::config(
                "min_update/max_update require an update column",
            ));
        }
        if let (Some(min), Some(max)) = (&min_update, &max_update) {
            if min >= max {
                return Err(DiffError::config(format!(
                    "min_update must be smaller than max_update ({min} >= {max})"
                )));
            }
        }
        self.min_update = min_update;
        self.max_update = max_update;
        Ok(self)
    }

    /// Bind a discovered schema, resolving column spellings through it.
    pub fn with_bound_schema(mut self, schema: TableSchema) -> Result<TableSegment> {
        let case_sensitive = self.case_sensitive;
        let path = self.path.clone();
        let resolve = |name: &String| -> Result<String> {
            schema
                .resolve(name, case_sensitive)
                .map(|c| c.name.clone())
                .ok_or_else(|| {
                    DiffError::schema(format!("column '{name}' not found in table {path}"))
                })
        };
        let key_columns = self.key_columns.iter().map(&resolve).collect::<Result<Vec<_>>>()?;
        let update_column = self.update_column.as_ref().map(&resolve).transpose()?;
        let extra_columns = self
            .extra_columns
            .iter()
            .map(&resolve)
            .collect::<Result<Vec<_>>>()?;
        // Transform keys follow the schema spelling too; a transform for
        // a column outside the projection is kept verbatim and ignored.
        let transform_columns = self
            .transform_columns
            .iter()
            .map(|(name, expr)| {
                let resolved = schema
                    .resolve(name, case_sensitive)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| name.clone());
                (resolved, expr.clone())
            })
            .collect();
        self.key_columns = key_columns;
        self.update_column = update_column;
        self.extra_columns = extra_columns;
        self.transform_columns = transform_columns;
        self.schema = Some(schema);
        Ok(self)
    }

    /// Re-resolve column spellings against the already-bound schema,
    /// after columns were added post-binding.
    pub fn rebind_columns(self) -> Result<TableSegment> {
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| DiffError::schema("segment schema is not bound"))?;
        self.with_bound_schema(schema)
    }

    /// Query the table's schema and return a schema-bound copy.
    pub async fn with_schema(self) -> Result<TableSegment> {
        if self.schema.is_some() {
            return Ok(self);
        }
        let schema = self.database.select_table_schema(&self.path).await?;
        self.with_bound_schema(schema)
    }

    /// A copy restricted to a narrower key range.
    pub fn new_key_bounds(&self, min_key: Key, max_key: KeyBound) -> TableSegment {
        if let Some(current) = &self.min_key {
            debug_assert!(current <= &min_key);
        }
        if let Some(parent_max) = self.max_key.key() {
            debug_assert!(&min_key <= parent_max);
        }
        let mut seg = self.clone();
        seg.min_key = Some(min_key);
        seg.max_key = max_key;
        seg
    }

    // ===== Accessors =====

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn path(&self) -> &TablePath {
        &self.path
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn update_column(&self) -> Option<&str> {
        self.update_column.as_deref()
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    pub fn transform_columns(&self) -> &BTreeMap<String, String> {
        &self.transform_columns
    }

    pub fn min_key(&self) -> Option<&Key> {
        self.min_key.as_ref()
    }

    pub fn max_key(&self) -> &KeyBound {
        &self.max_key
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn schema(&self) -> Option<&TableSchema> {
        self.schema.as_ref()
    }

    pub fn is_bounded(&self) -> bool {
        self.min_key.is_some() && self.max_key.is_bounded()
    }

    /// The non-key columns whose values are compared: the update column,
    /// then the extra columns.
    pub fn compared_columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = Vec::new();
        if let Some(update) = &self.update_column {
            cols.push(update);
        }
        cols.extend(self.extra_columns.iter().map(String::as_str));
        cols
    }

    /// Key columns, then the update column, then the extra columns.
    pub fn relevant_columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = self.key_columns.iter().map(String::as_str).collect();
        if let Some(update) = &self.update_column {
            cols.push(update);
        }
        cols.extend(self.extra_columns.iter().map(String::as_str));
        cols
    }

    /// The classified type of a column. Requires a bound schema.
    pub fn column_type(&self, name: &str) -> Result<&ColumnType> {
        let schema = self
            .schema
            .as_ref()
            .ok_or_else(|| DiffError::schema("segment schema is not bound"))?;
        schema
            .resolve(name, true)
            .map(|c| &c.col_type)
            .ok_or_else(|| {
                DiffError::schema(format!("column '{name}' not found in table {}", self.path))
            })
    }

    /// Key domains, in key-column order.
    pub fn key_kinds(&self) -> Result<Vec<KeyKind>> {
        self.key_columns
            .iter()
            .map(|col| {
                let ty = self.column_type(col)?;
                ty.key_kind().ok_or_else(|| {
                    DiffError::schema(format!(
                        "column '{col}' of type {ty} cannot be used as a key"
                    ))
                })
            })
            .collect()
    }

    /// Size of the key space, when it can be computed without a query
    /// (single integer key with both bounds known).
    pub fn approximate_size(&self) -> Option<u128> {
        if self.key_columns.len() != 1 {
            return None;
        }
        let min = match self.min_key.as_ref()?.0.first()? {
            KeyValue::Int(v) => *v,
            KeyValue::Text(_) => return None,
        };
        match &self.max_key {
            KeyBound::Excluded(k) => match k.0.first()? {
                KeyValue::Int(max) => Some(max.saturating_sub(min).max(0) as u128),
                KeyValue::Text(_) => None,
            },
            KeyBound::Included(k) => match k.0.first()? {
                KeyValue::Int(max) => Some((max.saturating_sub(min).max(-1) + 1) as u128),
                KeyValue::Text(_) => None,
            },
            KeyBound::Unbounded => None,
        }
    }

    // ===== SQL rendering =====

    fn dialect(&self) -> &crate::drivers::DialectImpl {
        self.database.dialect()
    }

    fn quoted_table(&self) -> String {
        let d = self.dialect();
        match &self.path.schema {
            Some(schema) => format!("{}.{}", d.quote_ident(schema), d.quote_ident(&self.path.table)),
            None => d.quote_ident(&self.path.table),
        }
    }

    /// The SQL expression a column enters comparisons as: its transform
    /// expression when one is configured, else the quoted column.
    fn column_expr(&self, column: &str) -> String {
        match self.transform_columns.get(column) {
            Some(expr) => format!("({expr})"),
            None => self.dialect().quote_ident(column),
        }
    }

    /// Canonicalised expression for a column, suitable for hashing,
    /// downloading, and equality comparison.
    pub fn canonical_expr(&self, column: &str) -> Result<String> {
        let expr = self.column_expr(column);
        let col_type = self.column_type(column)?;
        Ok(self
            .dialect()
            .render_canonical(&expr, col_type, self.case_sensitive))
    }

    fn key_tuple_sql(&self) -> String {
        let exprs: Vec<String> = self.key_columns.iter().map(|k| self.column_expr(k)).collect();
        if exprs.len() == 1 {
            exprs.into_iter().next().expect("one key column")
        } else {
            format!("({})", exprs.join(", "))
        }
    }

    fn key_literal_sql(&self, key: &Key) -> String {
        let literals: Vec<String> = key.0.iter().map(KeyValue::to_sql_literal).collect();
        if literals.len() == 1 {
            literals.into_iter().next().expect("one key value")
        } else {
            format!("({})", literals.join(", "))
        }
    }

    /// ORDER BY expressions establishing the key order: the (possibly
    /// transformed) column for integer keys, canonical expressions for
    /// text keys (so ordering matches the downloaded, possibly
    /// lowercased, values).
    fn order_exprs(&self) -> Result<Vec<String>> {
        self.key_columns
            .iter()
            .map(|col| match self.column_type(col)?.key_kind() {
                Some(KeyKind::Int) => Ok(self.column_expr(col)),
                _ => self.canonical_expr(col),
            })
            .collect()
    }

    fn order_by_sql(&self) -> Result<String> {
        Ok(self.order_exprs()?.join(", "))
    }

    fn where_sql(&self) -> Result<String> {
        let mut conditions = Vec::new();

        if let Some(min) = &self.min_key {
            conditions.push(format!(
                "{} >= {}",
                self.key_tuple_sql(),
                self.key_literal_sql(min)
            ));
        }
        match &self.max_key {
            KeyBound::Unbounded => {}
            KeyBound::Excluded(max) => conditions.push(format!(
                "{} < {}",
                self.key_tuple_sql(),
                self.key_literal_sql(max)
            )),
            KeyBound::Included(max) => conditions.push(format!(
                "{} <= {}",
                self.key_tuple_sql(),
                self.key_literal_sql(max)
            )),
        }

        if let Some(update) = &self.update_column {
            let quoted = self.dialect().quote_ident(update);
            if let Some(min) = &self.min_update {
                conditions.push(format!("{quoted} >= '{}'", min.format("%Y-%m-%d %H:%M:%S%.6f")));
            }
            if let Some(max) = &self.max_update {
                conditions.push(format!("{quoted} < '{}'", max.format("%Y-%m-%d %H:%M:%S%.6f")));
            }
        }

        if let Some(clause) = &self.where_clause {
            conditions.push(format!("({clause})"));
        }

        Ok(if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        })
    }

    /// Canonical projection of all relevant columns.
    fn projection_sql(&self) -> Result<Vec<String>> {
        self.relevant_columns()
            .iter()
            .map(|col| self.canonical_expr(col))
            .collect()
    }

    fn count_sql(&self) -> Result<String> {
        Ok(format!(
            "SELECT COUNT(*) FROM {}{}",
            self.quoted_table(),
            self.where_sql()?
        ))
    }

    fn count_and_checksum_sql(&self) -> Result<String> {
        let parts: Vec<String> = self
            .projection_sql()?
            .into_iter()
            .map(|expr| format!("COALESCE({expr}, '{NULL_SENTINEL}')"))
            .collect();
        let concat = self.dialect().render_concat(&parts);
        let checksum = self.dialect().render_checksum(&concat);
        Ok(format!(
            "SELECT COUNT(*), {checksum} FROM {}{}",
            self.quoted_table(),
            self.where_sql()?
        ))
    }

    /// Subquery projecting raw key columns as `__rd_k{i}` and canonical
    /// compared columns as `__rd_c{j}`, under the segment's restrictions.
    /// Used by the join differ to compose both sides into one query.
    pub(crate) fn aliased_select_sql(&self) -> Result<String> {
        let d = self.dialect();
        let mut cols = Vec::with_capacity(self.key_columns.len() + self.extra_columns.len() + 1);
        for (i, key) in self.key_columns.iter().enumerate() {
            cols.push(format!(
                "{} AS {}",
                self.column_expr(key),
                d.quote_ident(&format!("{KEY_ALIAS}{i}"))
            ));
        }
        for (j, col) in self.compared_columns().iter().enumerate() {
            cols.push(format!(
                "{} AS {}",
                self.canonical_expr(col)?,
                d.quote_ident(&format!("__rd_c{j}"))
            ));
        }
        Ok(format!(
            "SELECT {} FROM {}{}",
            cols.join(", "),
            self.quoted_table(),
            self.where_sql()?
        ))
    }

    fn values_sql(&self) -> Result<String> {
        Ok(format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            self.projection_sql()?.join(", "),
            self.quoted_table(),
            self.where_sql()?,
            self.order_by_sql()?,
        ))
    }

    // ===== Query execution =====

    /// Count the rows in the segment.
    pub async fn count(&self, cancel: CancellationToken) -> Result<i64> {
        let rows = self.database.fetch_all(self.count_sql()?, cancel).await?;
        decode_count(&rows)
    }

    /// Count and checksum the rows in the segment, in one pass.
    pub async fn count_and_checksum(
        &self,
        cancel: CancellationToken,
    ) -> Result<(i64, Option<i64>)> {
        let started = Instant::now();
        let rows = self
            .database
            .fetch_all(self.count_and_checksum_sql()?, cancel)
            .await?;
        let elapsed = started.elapsed();
        if elapsed.as_secs() > RECOMMENDED_CHECKSUM_SECS {
            warn!(
                "checksum is taking longer than expected ({:.2}s); consider increasing \
                 --bisection-factor or decreasing --threads",
                elapsed.as_secs_f64()
            );
        }

        let row = rows
            .first()
            .ok_or_else(|| DiffError::query("count_and_checksum returned no rows"))?;
        let count = row
            .first()
            .and_then(|v| v.as_int())
            .ok_or_else(|| DiffError::query("count_and_checksum returned a NULL count"))?;
        // MySQL's BIT_XOR yields 0 rather than NULL over an empty set;
        // normalise to None whenever the segment is empty.
        let checksum = if count == 0 {
            None
        } else {
            row.get(1).and_then(|v| v.as_int())
        };
        Ok((count, checksum))
    }

    /// Verify key uniqueness: `COUNT(*) == COUNT(DISTINCT key)`.
    pub async fn ensure_unique_key(&self, cancel: CancellationToken) -> Result<()> {
        let d = self.dialect();
        let key_exprs: Vec<String> = self.key_columns.iter().map(|k| self.column_expr(k)).collect();
        let sql = format!(
            "SELECT COUNT(*), {} FROM {}{}",
            d.render_count_distinct(&key_exprs),
            self.quoted_table(),
            self.where_sql()?
        );
        let rows = self.database.fetch_all(sql, cancel).await?;
        let row = rows
            .first()
            .ok_or_else(|| DiffError::query("uniqueness check returned no rows"))?;
        let total = row.first().and_then(|v| v.as_int()).unwrap_or(0);
        let distinct = row.get(1).and_then(|v| v.as_int()).unwrap_or(0);
        if total != distinct {
            return Err(DiffError::UniqueKey {
                table: self.path.to_string(),
                total,
                distinct,
            });
        }
        Ok(())
    }

    /// Query the minimum and maximum key. Returns `None` when the segment
    /// has no rows.
    pub async fn query_key_range(
        &self,
        cancel: CancellationToken,
    ) -> Result<Option<(Key, Key)>> {
        let kinds = self.key_kinds()?;
        if self.key_columns.len() == 1 {
            let col = &self.key_columns[0];
            let expr = match kinds[0] {
                KeyKind::Int => self.column_expr(col),
                KeyKind::Text => self.canonical_expr(col)?,
            };
            let sql = format!(
                "SELECT MIN({expr}), MAX({expr}) FROM {}{}",
                self.quoted_table(),
                self.where_sql()?
            );
            let rows = self.database.fetch_all(sql, cancel).await?;
            let row = rows
                .first()
                .ok_or_else(|| DiffError::query("key range query returned no rows"))?;
            let (min, max) = (decode_key_cell(&row[0], kinds[0]), decode_key_cell(&row[1], kinds[0]));
            return Ok(match (min?, max?) {
                (Some(min), Some(max)) => Some((Key::single(min), Key::single(max))),
                _ => None,
            });
        }

        // Compound keys: lexicographic extrema via ordered single-row scans.
        let min = self.query_key_extreme(false, &kinds, cancel.clone()).await?;
        let max = self.query_key_extreme(true, &kinds, cancel).await?;
        Ok(min.zip(max))
    }

    async fn query_key_extreme(
        &self,
        descending: bool,
        kinds: &[KeyKind],
        cancel: CancellationToken,
    ) -> Result<Option<Key>> {
        let projection: Vec<String> = self
            .key_columns
            .iter()
            .map(|col| self.canonical_expr(col))
            .collect::<Result<_>>()?;
        let direction = if descending { " DESC" } else { "" };
        let order: Vec<String> = self
            .order_exprs()?
            .into_iter()
            .map(|e| format!("{e}{direction}"))
            .collect();
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY {} {}",
            projection.join(", "),
            self.quoted_table(),
            self.where_sql()?,
            order.join(", "),
            self.dialect().render_limit(1),
        );
        let rows = self.database.fetch_all(sql, cancel).await?;
        match rows.first() {
            None => Ok(None),
            Some(row) => {
                let mut values = Vec::with_capacity(kinds.len());
                for (cell, kind) in row.iter().zip(kinds) {
                    match decode_key_cell(cell, *kind)? {
                        Some(v) => values.push(v),
                        None => return Ok(None),
                    }
                }
                Ok(Some(Key(values)))
            }
        }
    }

    /// Download every row of the segment, in key order, as a lazy stream.
    pub async fn get_values(&self, cancel: CancellationToken) -> Result<RowStream> {
        self.database.stream(self.values_sql()?, cancel).await
    }

    /// Choose up to `count - 1` interior checkpoints that split the
    /// segment into `count` roughly equal children.
    ///
    /// Single integer keys split arithmetically; text and compound keys
    /// are sampled in SQL with ROW_NUMBER over the key order.
    pub async fn choose_checkpoints(
        &self,
        count: usize,
        approx_rows: i64,
        cancel: CancellationToken,
    ) -> Result<Vec<Key>> {
        debug_assert!(self.is_bounded());
        let kinds = self.key_kinds()?;

        if kinds.len() == 1 && kinds[0] == KeyKind::Int {
            let min = match self.min_key.as_ref().and_then(|k| k.0.first()) {
                Some(KeyValue::Int(v)) => *v,
                _ => return Err(DiffError::query("integer segment without integer bounds")),
            };
            let max_excl = match &self.max_key {
                KeyBound::Excluded(k) => match k.0.first() {
                    Some(KeyValue::Int(v)) => *v,
                    _ => return Err(DiffError::query("integer segment without integer bounds")),
                },
                KeyBound::Included(k) => match k.0.first() {
                    Some(KeyValue::Int(v)) => *v + 1,
                    _ => return Err(DiffError::query("integer segment without integer bounds")),
                },
                KeyBound::Unbounded => {
                    return Err(DiffError::query("cannot split an unbounded segment"))
                }
            };
            return Ok(split_int_space(min, max_excl, count)
                .into_iter()
                .map(|v| Key::single(KeyValue::Int(v)))
                .collect());
        }

        self.sample_checkpoints(count, approx_rows, &kinds, cancel).await
    }

    async fn sample_checkpoints(
        &self,
        count: usize,
        approx_rows: i64,
        kinds: &[KeyKind],
        cancel: CancellationToken,
    ) -> Result<Vec<Key>> {
        let d = self.dialect();
        let step = (approx_rows / count as i64).max(1);

        let inner_cols: Vec<String> = self
            .key_columns
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} AS {KEY_ALIAS}{i}", self.column_expr(col)))
            .collect();
        let outer_projection: Vec<String> = self
            .key_columns
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let alias = d.quote_ident(&format!("{KEY_ALIAS}{i}"));
                Ok(d.render_canonical(&alias, self.column_type(col)?, self.case_sensitive))
            })
            .collect::<Result<_>>()?;

        let sql = format!(
            "SELECT {projection} FROM (SELECT {inner}, ROW_NUMBER() OVER (ORDER BY {order}) AS {rn} \
             FROM {table}{where_sql}) AS __rd_ranked WHERE {rn} % {step} = 0 ORDER BY {rn} {limit}",
            projection = outer_projection.join(", "),
            inner = inner_cols.join(", "),
            order = self.order_by_sql()?,
            rn = d.quote_ident("__rd_rn"),
            table = self.quoted_table(),
            where_sql = self.where_sql()?,
            limit = d.render_limit(count.saturating_sub(1) as u64),
        );

        let rows = self.database.fetch_all(sql, cancel).await?;
        let mut checkpoints = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(kinds.len());
            for (cell, kind) in row.iter().zip(kinds) {
                match decode_key_cell(cell, *kind)? {
                    Some(v) => values.push(v),
                    None => return Err(DiffError::schema("NULL in key column during sampling")),
                }
            }
            checkpoints.push(Key(values));
        }

        checkpoints.sort();
        checkpoints.dedup();
        checkpoints.retain(|cp| {
            self.min_key.as_ref().is_some_and(|min| cp > min)
                && match &self.max_key {
                    KeyBound::Unbounded => true,
                    KeyBound::Excluded(max) | KeyBound::Included(max) => cp < max,
                }
        });
        Ok(checkpoints)
    }

    /// Split the segment into children separated by the checkpoints.
    /// Children have adjacent half-open ranges that exactly cover the
    /// parent's range; the last child inherits the parent's upper bound.
    pub fn segment_by_checkpoints(&self, checkpoints: &[Key]) -> Vec<TableSegment> {
        debug_assert!(self.is_bounded());
        debug_assert!(checkpoints.windows(2).all(|w| w[0] < w[1]));

        let mut children = Vec::with_capacity(checkpoints.len() + 1);
        let mut lower = self.min_key.clone().expect("bounded segment");
        for cp in checkpoints {
            children.push(self.new_key_bounds(lower.clone(), KeyBound::Excluded(cp.clone())));
            lower = cp.clone();
        }
        children.push(self.new_key_bounds(lower, self.max_key.clone()));
        children
    }
}

impl std::fmt::Debug for TableSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableSegment")
            .field("path", &self.path.to_string())
            .field("key_columns", &self.key_columns)
            .field("min_key", &self.min_key)
            .field("max_key", &self.max_key)
            .finish_non_exhaustive()
    }
}

fn decode_count(rows: &[Vec<crate::core::value::DbValue>]) -> Result<i64> {
    rows.first()
        .and_then(|r| r.first())
        .and_then(|v| v.as_int())
        .ok_or_else(|| DiffError::query("count query returned no value"))
}

fn decode_key_cell(
    cell: &crate::core::value::DbValue,
    kind: KeyKind,
) -> Result<Option<KeyValue>> {
    use crate::core::value::DbValue;
    match cell {
        DbValue::Null => Ok(None),
        DbValue::Int(v) => Ok(Some(KeyValue::Int(*v as i128))),
        DbValue::Text(s) => KeyValue::parse(s, kind).map(Some),
    }
}

/// Evenly spaced interior points of `[min, max_excl)`, deduplicated and
/// strictly inside the range. Returns fewer than `count - 1` points (or
/// none) when the space is too small to split.
pub fn split_int_space(min: i128, max_excl: i128, count: usize) -> Vec<i128> {
    debug_assert!(min < max_excl);
    let count = count.max(2) as i128;
    let space = max_excl - min;
    let step = space / count;
    if step == 0 {
        // Fewer key values than requested children: one checkpoint per
        // interior value.
        return ((min + 1)..max_excl).collect();
    }
    (1..count).map(|i| min + i * step).collect()
}


#[cfg(all(test, feature = "duckdb"))]
mod duckdb_tests {
    use super::*;

    async fn test_db() -> Arc<Database> {
        let db = Database::connect("duckdb://:memory:", 1).await.unwrap();
        db.execute(
            "CREATE TABLE rating (id BIGINT PRIMARY KEY, userid BIGINT, movieid BIGINT, \
             rating DOUBLE, ts TIMESTAMP)"
                .to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        db.execute(
            "INSERT INTO rating \
             SELECT i, i % 100, i % 31, (i % 50) / 10.0, \
             TIMESTAMP '2021-01-01 00:00:00' + INTERVAL (i) SECOND \
             FROM range(1, 1001) t(i)"
                .to_string(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        db
    }

    async fn segment(db: &Arc<Database>) -> TableSegment {
        TableSegment::new(
            Arc::clone(db),
            TablePath::parse("rating").unwrap(),
            vec!["id".to_string()],
        )
        .unwrap()
        .with_update_column(Some("ts".to_string()))
        .unwrap()
        .with_extra_columns(vec!["rating".to_string()])
        .unwrap()
        .with_schema()
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_count_and_key_range() {
        let db = test_db().await;
        let seg = segment(&db).await;
        assert_eq!(seg.count(CancellationToken::new()).await.unwrap(), 1000);

        let (min, max) = seg
            .query_key_range(CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(min, Key::single(KeyValue::Int(1)));
        assert_eq!(max, Key::single(KeyValue::Int(1000)));
    }

    #[tokio::test]
    async fn test_checksum_composes_across_children() {
        let db = test_db().await;
        let seg = segment(&db).await;
        let bounded = seg.new_key_bounds(
            Key::single(KeyValue::Int(1)),
            KeyBound::Excluded(Key::single(KeyValue::Int(1001))),
        );

        let (count, checksum) = bounded
            .count_and_checksum(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(count, 1000);
        let parent = checksum.unwrap();

        let checkpoints = bounded
            .choose_checkpoints(4, count, CancellationToken::new())
            .await
            .unwrap();
        let children = bounded.segment_by_checkpoints(&checkpoints);
        assert_eq!(children.len(), 4);

        let mut composed = 0i64;
        let mut total = 0i64;
        for child in &children {
            let (c, sum) = child
                .count_and_checksum(CancellationToken::new())
                .await
                .unwrap();
            total += c;
            composed ^= sum.unwrap();
        }
        assert_eq!(total, 1000);
        assert_eq!(composed, parent);
    }

    #[tokio::test]
    async fn test_children_partition_parent_exactly() {
        let db = test_db().await;
        let seg = segment(&db).await;
        let bounded = seg.new_key_bounds(
            Key::single(KeyValue::Int(1)),
            KeyBound::Excluded(Key::single(KeyValue::Int(1001))),
        );
        let checkpoints = bounded
            .choose_checkpoints(8, 1000, CancellationToken::new())
            .await
            .unwrap();
        let children = bounded.segment_by_checkpoints(&checkpoints);

        // Adjacent, no gaps, first/last match the parent bounds.
        assert_eq!(children.first().unwrap().min_key(), bounded.min_key());
        assert_eq!(children.last().unwrap().max_key(), bounded.max_key());
        for pair in children.windows(2) {
            assert_eq!(
                pair[0].max_key().key().unwrap(),
                pair[1].min_key().unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_get_values_in_key_order() {
        let db = test_db().await;
        let seg = segment(&db).await;
        let bounded = seg.new_key_bounds(
            Key::single(KeyValue::Int(5)),
            KeyBound::Excluded(Key::single(KeyValue::Int(8))),
        );
        let rows = bounded
            .get_values(CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0][0].as_deref(), Some("5"));
        assert_eq!(rows[2][0].as_deref(), Some("7"));
        // projection: id, ts, rating
        assert_eq!(rows[0].len(), 3);
    }

    #[tokio::test]
    async fn test_uniqueness_check() {
        let db = test_db().await;
        let seg = segment(&db).await;
        seg.ensure_unique_key(CancellationToken::new())
            .await
            .unwrap();

        let by_user = TableSegment::new(
            Arc::clone(&db),
            TablePath::parse("rating").unwrap(),
            vec!["userid".to_string()],
        )
        .unwrap()
        .with_schema()
        .await
        .unwrap();
        let err = by_user
            .ensure_unique_key(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiffError::UniqueKey { .. }));
    }

    #[tokio::test]
    async fn test_transform_columns_rewrite_comparisons() {
        let db = test_db().await;
        let base = TableSegment::new(
            Arc::clone(&db),
            TablePath::parse("rating").unwrap(),
            vec!["id".to_string()],
        )
        .unwrap()
        .with_extra_columns(vec!["rating".to_string()])
        .unwrap();

        let plain = base.clone().with_schema().await.unwrap();
        let transformed = base
            .with_transform_columns(BTreeMap::from([(
                "rating".to_string(),
                "\"rating\" * 2".to_string(),
            )]))
            .with_schema()
            .await
            .unwrap();

        // The transform replaces the column inside the canonical form.
        assert_eq!(transformed.transform_columns().len(), 1);
        let expr = transformed.canonical_expr("rating").unwrap();
        assert!(expr.contains("(\"rating\" * 2)"), "got: {expr}");

        // Same rows, different canonical values: counts agree, checksums
        // diverge.
        let bounds = |seg: &TableSegment| {
            seg.new_key_bounds(
                Key::single(KeyValue::Int(1)),
                KeyBound::Excluded(Key::single(KeyValue::Int(1001))),
            )
        };
        let (count_plain, sum_plain) = bounds(&plain)
            .count_and_checksum(CancellationToken::new())
            .await
            .unwrap();
        let (count_tf, sum_tf) = bounds(&transformed)
            .count_and_checksum(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(count_plain, count_tf);
        assert_ne!(sum_plain, sum_tf);

        // Downloads carry the transformed values.
        let rows = bounds(&transformed)
            .new_key_bounds(
                Key::single(KeyValue::Int(1)),
                KeyBound::Excluded(Key::single(KeyValue::Int(2))),
            )
            .get_values(CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1].as_deref(), Some("0.2"));
    }

    #[tokio::test]
    async fn test_where_clause_and_update_range_restrict() {
        let db = test_db().await;
        let seg = segment(&db).await.with_where(Some("userid = 0".to_string()));
        let seg = seg.with_schema().await.unwrap();
        assert_eq!(seg.count(CancellationToken::new()).await.unwrap(), 10);

        let until = chrono::NaiveDate::from_ymd_opt(2021, 1, 1)
            .unwrap()
            .and_hms_opt(0, 1, 41)
            .unwrap();
        let seg2 = segment(&db)
            .await
            .with_update_range(None, Some(until))
            .unwrap();
        // ids 1..=100 have ts strictly before 00:01:41.
        assert_eq!(seg2.count(CancellationToken::new()).await.unwrap(), 100);
    }
}
