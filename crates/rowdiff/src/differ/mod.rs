//! Differ façade: input validation, algorithm selection, and the
//! streaming result wrapper.
//!
//! The façade binds schemas on both sides, unifies column precision so
//! both dialects canonicalise to the coarser representation, picks the
//! algorithm (outer join within one database, checksum bisection across
//! two), and exposes the diff as a pull-based stream with aggregate
//! statistics.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::schema::{like_match, unify_types};
use crate::core::value::{Key, KeyBound, Row};
use crate::error::{DiffError, Result};
use crate::hashdiff::HashDiffer;
use crate::joindiff::JoinDiffer;
use crate::segment::TableSegment;

/// Buffered diff records between the algorithm and the consumer.
const RESULT_BUFFER: usize = 1024;

/// Which side of the diff a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sign {
    /// Present in (or different in) the left table.
    Minus,
    /// Present in (or different in) the right table.
    Plus,
}

impl Sign {
    pub fn as_char(self) -> char {
        match self {
            Sign::Minus => '-',
            Sign::Plus => '+',
        }
    }
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One row-level difference.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffRecord {
    pub sign: Sign,
    pub row: Row,
}

/// Diff algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    #[default]
    Auto,
    HashDiff,
    JoinDiff,
}

impl FromStr for Algorithm {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Algorithm> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Algorithm::Auto),
            "hashdiff" => Ok(Algorithm::HashDiff),
            "joindiff" => Ok(Algorithm::JoinDiff),
            other => Err(DiffError::config(format!(
                "unknown algorithm '{other}' (expected auto, joindiff or hashdiff)"
            ))),
        }
    }
}

/// Options for a diff run. Field semantics follow the CLI surface.
#[derive(Debug, Clone)]
pub struct DiffOptions {
    pub key_columns: Vec<String>,
    pub update_column: Option<String>,
    /// Extra columns to compare; entries may be SQL LIKE patterns, which
    /// are expanded against the discovered schema.
    pub extra_columns: Vec<String>,
    pub min_key: Option<Key>,
    pub max_key: Option<Key>,
    pub min_update: Option<NaiveDateTime>,
    pub max_update: Option<NaiveDateTime>,
    pub min_age: Option<Duration>,
    pub max_age: Option<Duration>,
    pub where_clause: Option<String>,
    pub algorithm: Algorithm,
    pub bisection_factor: usize,
    pub bisection_threshold: i64,
    pub limit: Option<u64>,
    pub assume_unique_key: bool,
    pub allow_empty_tables: bool,
    pub case_sensitive: bool,
    pub materialize: Option<String>,
    pub materialize_all_rows: bool,
    pub sample_exclusive_rows: bool,
    pub sample_size: u64,
    pub table_write_limit: Option<u64>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            key_columns: vec!["id".to_string()],
            update_column: None,
            extra_columns: Vec::new(),
            min_key: None,
            max_key: None,
            min_update: None,
            max_update: None,
            min_age: None,
            max_age: None,
            where_clause: None,
            algorithm: Algorithm::Auto,
            bisection_factor: 32,
            bisection_threshold: 16384,
            limit: None,
            assume_unique_key: false,
            allow_empty_tables: false,
            case_sensitive: true,
            materialize: None,
            materialize_all_rows: false,
            sample_exclusive_rows: false,
            sample_size: 10,
            table_write_limit: None,
        }
    }
}

/// Shared mutable state the algorithms report into.
#[derive(Default)]
pub(crate) struct StatsCollector {
    pub rows_downloaded: AtomicU64,
    pub exclusive_samples: Mutex<Option<serde_json::Value>>,
}

/// The emitting end of the diff stream, cloned into every producing task.
#[derive(Clone)]
pub(crate) struct DiffSink {
    tx: mpsc::Sender<Result<DiffRecord>>,
    emitted: Arc<AtomicU64>,
    limit: Option<u64>,
    pub cancel: CancellationToken,
    pub stats: Arc<StatsCollector>,
}

impl DiffSink {
    /// Emit one record. Fails with `Cancelled` once the limit is reached
    /// or the consumer has gone away.
    pub async fn send(&self, record: DiffRecord) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(DiffError::Cancelled);
        }
        if let Some(limit) = self.limit {
            if self.emitted.load(Ordering::SeqCst) >= limit {
                self.cancel.cancel();
                return Err(DiffError::Cancelled);
            }
        }
        self.tx
            .send(Ok(record))
            .await
            .map_err(|_| DiffError::Cancelled)?;
        let emitted = self.emitted.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit.is_some_and(|limit| emitted >= limit) {
            self.cancel.cancel();
        }
        Ok(())
    }
}

/// Streaming diff result.
///
/// Records are replayed from a buffer on re-iteration; a failure is
/// sticky and replays on every subsequent poll.
pub struct DiffResult {
    rx: mpsc::Receiver<Result<DiffRecord>>,
    cancel: CancellationToken,
    replay: Vec<DiffRecord>,
    delivered: usize,
    error: Option<Arc<DiffError>>,
    exhausted: bool,
    limit: Option<u64>,
    stats: Arc<StatsCollector>,
    driver: Option<tokio::task::JoinHandle<()>>,
    left: TableSegment,
    right: TableSegment,
}

impl DiffResult {
    /// Pull the next diff record.
    pub async fn next(&mut self) -> Option<Result<DiffRecord>> {
        if let Some(err) = &self.error {
            return Some(Err(err.clone_for_replay()));
        }
        if self.delivered < self.replay.len() {
            let record = self.replay[self.delivered].clone();
            self.delivered += 1;
            return Some(Ok(record));
        }
        if self.exhausted || self.limit_reached() {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(record)) => {
                self.replay.push(record.clone());
                self.delivered += 1;
                Some(Ok(record))
            }
            Some(Err(err)) => {
                let err = Arc::new(err);
                self.error = Some(Arc::clone(&err));
                self.cancel.cancel();
                Some(Err(err.clone_for_replay()))
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.replay.len() as u64 >= limit)
    }

    /// Restart iteration from the first record (already-fetched records
    /// are replayed without re-querying).
    pub fn rewind(&mut self) {
        self.delivered = 0;
    }

    /// Cancel outstanding work and wait for every query worker to settle.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        // Drain so producers blocked on the channel can observe the token.
        while self.rx.recv().await.is_some() {}
        self.exhausted = true;
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }

    /// Consume the remaining records into the replay buffer.
    async fn consume(&mut self) -> Result<()> {
        loop {
            match self.next().await {
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err),
                None => return Ok(()),
            }
        }
    }

    /// Aggregate statistics. Consumes the remaining stream.
    pub async fn stats(&mut self) -> Result<DiffStats> {
        self.consume().await?;

        let key_len = self.left.key_columns().len();
        let mut by_key: std::collections::HashMap<&[Option<String>], u8> =
            std::collections::HashMap::new();
        for record in &self.replay {
            let key = &record.row[..key_len.min(record.row.len())];
            let bit = match record.sign {
                Sign::Minus => 1u8,
                Sign::Plus => 2u8,
            };
            *by_key.entry(key).or_insert(0) |= bit;
        }
        let mut exclusive_a = 0u64;
        let mut exclusive_b = 0u64;
        let mut updated = 0u64;
        for flags in by_key.values() {
            match flags {
                1 => exclusive_a += 1,
                2 => exclusive_b += 1,
                _ => updated += 1,
            }
        }

        let cancel = CancellationToken::new();
        let (rows_a, rows_b) = tokio::join!(
            self.left.count(cancel.clone()),
            self.right.count(cancel.clone())
        );
        let (rows_a, rows_b) = (rows_a?, rows_b?);

        let unchanged = rows_a - exclusive_a as i64 - updated as i64;
        let diff_percent = 1.0 - unchanged as f64 / rows_a.max(rows_b).max(1) as f64;

        Ok(DiffStats {
            rows_a,
            rows_b,
            exclusive_a,
            exclusive_b,
            updated,
            unchanged,
            diff_percent,
            rows_downloaded: self.stats.rows_downloaded.load(Ordering::Relaxed),
            exclusive_samples: self
                .stats
                .exclusive_samples
                .lock()
                .expect("stats lock poisoned")
                .clone(),
        })
    }
}

/// Aggregate statistics of a completed diff.
#[derive(Debug, Clone)]
pub struct DiffStats {
    pub rows_a: i64,
    pub rows_b: i64,
    pub exclusive_a: u64,
    pub exclusive_b: u64,
    pub updated: u64,
    pub unchanged: i64,
    pub diff_percent: f64,
    pub rows_downloaded: u64,
    pub exclusive_samples: Option<serde_json::Value>,
}

impl DiffStats {
    /// Human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{} rows in table A\n", self.rows_a));
        out.push_str(&format!("{} rows in table B\n", self.rows_b));
        out.push_str(&format!(
            "{} rows exclusive to table A (not present in B)\n",
            self.exclusive_a
        ));
        out.push_str(&format!(
            "{} rows exclusive to table B (not present in A)\n",
            self.exclusive_b
        ));
        out.push_str(&format!("{} rows updated\n", self.updated));
        out.push_str(&format!("{} rows unchanged\n", self.unchanged));
        out.push_str(&format!("{:.2}% difference score\n", 100.0 * self.diff_percent));
        out
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "rows_A": self.rows_a,
            "rows_B": self.rows_b,
            "exclusive_A": self.exclusive_a,
            "exclusive_B": self.exclusive_b,
            "updated": self.updated,
            "unchanged": self.unchanged,
            "total": self.exclusive_a + self.exclusive_b + 2 * self.updated,
            "stats": { "rows_downloaded": self.rows_downloaded },
        });
        if let Some(samples) = &self.exclusive_samples {
            value["stats"]["exclusive_samples"] = samples.clone();
        }
        value
    }
}

/// Diff two table segments.
///
/// Validates schemas, unifies precision, picks the algorithm, and starts
/// the diff; the returned wrapper streams `(sign, row)` records.
pub async fn diff_tables(
    left: TableSegment,
    right: TableSegment,
    options: DiffOptions,
) -> Result<DiffResult> {
    if options.bisection_factor < 2 {
        return Err(DiffError::config(
            "bisection_factor must be at least 2",
        ));
    }
    if (options.bisection_factor as i64) >= options.bisection_threshold {
        return Err(DiffError::config(
            "bisection_factor must be lower than bisection_threshold",
        ));
    }
    if (options.min_age.is_some() || options.max_age.is_some()) && options.update_column.is_none() {
        return Err(DiffError::config(
            "--min-age/--max-age require an update column (-t)",
        ));
    }

    let (left, right) = configure_segments(&left, &right, &options).await?;

    let algorithm = select_algorithm(&left, &right, &options)?;
    if algorithm != Algorithm::JoinDiff
        && (options.materialize.is_some()
            || options.materialize_all_rows
            || options.sample_exclusive_rows)
    {
        return Err(DiffError::config(
            "materialisation and exclusive-row sampling are joindiff features; \
             both tables must share a connection",
        ));
    }
    info!(
        "diffing {} and {} with {:?}",
        left.path(),
        right.path(),
        algorithm
    );

    let cancel = CancellationToken::new();
    let stats = Arc::new(StatsCollector::default());
    let limit = options.limit;
    let (tx, rx) = mpsc::channel(RESULT_BUFFER);
    let sink = DiffSink {
        tx: tx.clone(),
        emitted: Arc::new(AtomicU64::new(0)),
        limit,
        cancel: cancel.clone(),
        stats: Arc::clone(&stats),
    };

    // Construct the differ up front so option validation fails fast.
    enum Differ {
        Hash(HashDiffer),
        Join(JoinDiffer),
    }
    let differ = match algorithm {
        Algorithm::JoinDiff => Differ::Join(JoinDiffer::from_options(&options)),
        _ => Differ::Hash(HashDiffer::from_options(&options)?),
    };

    let driver_left = left.clone();
    let driver_right = right.clone();
    let driver = tokio::spawn(async move {
        let outcome = match differ {
            Differ::Hash(d) => d.diff_into(driver_left, driver_right, sink).await,
            Differ::Join(d) => d.diff_into(driver_left, driver_right, sink).await,
        };
        match outcome {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => debug!("diff cancelled"),
            Err(err) => {
                let _ = tx.send(Err(err)).await;
            }
        }
    });

    Ok(DiffResult {
        rx,
        cancel,
        replay: Vec::new(),
        delivered: 0,
        error: None,
        exhausted: false,
        limit,
        stats,
        driver: Some(driver),
        left,
        right,
    })
}

/// Bind schemas, expand column patterns, and unify types on both sides.
async fn configure_segments(
    left: &TableSegment,
    right: &TableSegment,
    options: &DiffOptions,
) -> Result<(TableSegment, TableSegment)> {
    let prepare = |seg: &TableSegment| -> Result<TableSegment> {
        let mut seg = seg
            .clone()
            .with_case_sensitive(options.case_sensitive)
            .with_where(options.where_clause.clone())
            .with_update_column(options.update_column.clone())?;
        if !options.key_columns.is_empty() {
            seg = seg.with_key_columns(options.key_columns.clone())?;
        }
        if options.min_key.is_some() || options.max_key.is_some() {
            seg = seg.with_key_range(
                options.min_key.clone(),
                match &options.max_key {
                    Some(max) => KeyBound::Excluded(max.clone()),
                    None => KeyBound::Unbounded,
                },
            );
        }
        Ok(seg)
    };

    let left = prepare(left)?;
    let right = prepare(right)?;
    let (left, right) = tokio::join!(left.with_schema(), right.with_schema());
    let (mut left, mut right) = (left?, right?);

    // Expand -c patterns against the left schema, preserving declaration
    // order; the right side must resolve the same columns.
    let extra = expand_column_patterns(&left, &options.extra_columns)?;
    left = left.with_extra_columns(extra.clone())?.rebind_columns()?;
    right = right.with_extra_columns(extra)?.rebind_columns()?;

    if left.key_columns().len() != right.key_columns().len() {
        return Err(DiffError::schema(
            "tables must have the same number of key columns",
        ));
    }

    // Unify precision pair-wise: both sides canonicalise to the coarser
    // declared type before any checksum or comparison runs.
    let pairs: Vec<(String, String)> = left
        .relevant_columns()
        .iter()
        .zip(right.relevant_columns())
        .map(|(l, r)| (l.to_string(), r.to_string()))
        .collect();
    let mut left_schema = left.schema().expect("schema bound").clone();
    let mut right_schema = right.schema().expect("schema bound").clone();
    for (lcol, rcol) in &pairs {
        let unified = unify_types(lcol, left.column_type(lcol)?, right.column_type(rcol)?)?;
        left_schema.override_type(lcol, unified.clone());
        right_schema.override_type(rcol, unified);
    }
    let left = left.with_bound_schema(left_schema)?;
    let right = right.with_bound_schema(right_schema)?;

    // Key columns must be usable as keys on both sides, in equal domains.
    let (lk, rk) = (left.key_kinds()?, right.key_kinds()?);
    if lk != rk {
        return Err(DiffError::schema(format!(
            "incompatible key domains: {lk:?} <-> {rk:?}"
        )));
    }

    // min/max age resolve against the current UTC time, once per diff.
    if options.min_age.is_some() || options.max_age.is_some() {
        let now = Utc::now().naive_utc();
        let max_update = options.min_age.map(|age| now - age).or(options.max_update);
        let min_update = options.max_age.map(|age| now - age).or(options.min_update);
        let left2 = left.with_update_range(min_update, max_update)?;
        let right2 = right.with_update_range(min_update, max_update)?;
        return Ok((left2, right2));
    }
    if options.min_update.is_some() || options.max_update.is_some() {
        let left = left.with_update_range(options.min_update, options.max_update)?;
        let right = right.with_update_range(options.min_update, options.max_update)?;
        return Ok((left, right));
    }

    Ok((left, right))
}

/// Expand `-c/--columns` LIKE patterns against a discovered schema.
/// Key and update columns never match; an exact column name matches
/// itself through the same path.
fn expand_column_patterns(segment: &TableSegment, patterns: &[String]) -> Result<Vec<String>> {
    let schema = segment.schema().expect("schema bound");
    let mut expanded: Vec<String> = Vec::new();
    for pattern in patterns {
        let mut matched = false;
        for col in schema.columns() {
            if like_match(pattern, &col.name)
                && !segment.key_columns().contains(&col.name)
                && segment.update_column() != Some(col.name.as_str())
            {
                matched = true;
                if !expanded.contains(&col.name) {
                    expanded.push(col.name.clone());
                }
            }
        }
        if !matched {
            return Err(DiffError::config(format!(
                "column pattern '{pattern}' matched nothing in {}",
                segment.path()
            )));
        }
    }
    Ok(expanded)
}

fn select_algorithm(
    left: &TableSegment,
    right: &TableSegment,
    options: &DiffOptions,
) -> Result<Algorithm> {
    use crate::core::traits::Dialect;

    let same_db = left.database().same_connection(right.database());
    let join_capable = same_db && left.database().dialect().supports_full_outer_join();

    match options.algorithm {
        Algorithm::Auto => Ok(if join_capable {
            Algorithm::JoinDiff
        } else {
            Algorithm::HashDiff
        }),
        Algorithm::JoinDiff if !same_db => Err(DiffError::config(
            "joindiff requires both tables on the same connection",
        )),
        Algorithm::JoinDiff if !join_capable => Err(DiffError::config(format!(
            "the {} dialect does not support FULL OUTER JOIN; use hashdiff",
            left.database().dialect().name()
        ))),
        forced => Ok(forced),
    }
}
