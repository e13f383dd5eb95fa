//! HashDiff: cross-database checksum bisection.
//!
//! The algorithm checksums both segments in one aggregate query per side;
//! when the checksums disagree it splits the key range into
//! `bisection_factor` children and recurses, and below
//! `bisection_threshold` rows it downloads both sides and merge-joins
//! them locally. Checksum work runs inside the databases, so only
//! disagreeing segments are ever transferred.

use std::cmp::Ordering;
use std::sync::atomic;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::core::value::{Key, KeyBound, KeyKind, KeyValue, Row};
use crate::differ::{DiffOptions, DiffRecord, DiffSink, Sign};
use crate::error::{DiffError, Result};
use crate::segment::TableSegment;

/// Cross-database checksum-bisection differ.
pub struct HashDiffer {
    bisection_factor: usize,
    bisection_threshold: i64,
    assume_unique_key: bool,
    allow_empty_tables: bool,
}

struct Ctx {
    factor: usize,
    threshold: i64,
    sink: DiffSink,
}

impl HashDiffer {
    pub fn new(bisection_factor: usize, bisection_threshold: i64) -> Result<HashDiffer> {
        if bisection_factor < 2 {
            return Err(DiffError::config(
                "bisection_factor must be at least 2",
            ));
        }
        if bisection_factor as i64 >= bisection_threshold {
            return Err(DiffError::config(
                "bisection_factor must be lower than bisection_threshold",
            ));
        }
        Ok(HashDiffer {
            bisection_factor,
            bisection_threshold,
            assume_unique_key: false,
            allow_empty_tables: false,
        })
    }

    pub fn assume_unique_key(mut self, assume: bool) -> HashDiffer {
        self.assume_unique_key = assume;
        self
    }

    pub fn allow_empty_tables(mut self, allow: bool) -> HashDiffer {
        self.allow_empty_tables = allow;
        self
    }

    pub(crate) fn from_options(options: &DiffOptions) -> Result<HashDiffer> {
        Ok(
            HashDiffer::new(options.bisection_factor, options.bisection_threshold)?
                .assume_unique_key(options.assume_unique_key)
                .allow_empty_tables(options.allow_empty_tables),
        )
    }

    pub(crate) async fn diff_into(
        self,
        left: TableSegment,
        right: TableSegment,
        sink: DiffSink,
    ) -> Result<()> {
        let cancel = sink.cancel.clone();

        // Bounding: min/max key on both sides in parallel, united into one
        // range applied to both segments.
        let (left_range, right_range) = tokio::join!(
            left.query_key_range(cancel.clone()),
            right.query_key_range(cancel.clone())
        );
        let (left_range, right_range) = (left_range?, right_range?);

        let range = match (left_range, right_range) {
            (None, None) => return Ok(()),
            (Some(range), None) => {
                if !self.allow_empty_tables {
                    return Err(DiffError::EmptyTable(right.path().to_string()));
                }
                range
            }
            (None, Some(range)) => {
                if !self.allow_empty_tables {
                    return Err(DiffError::EmptyTable(left.path().to_string()));
                }
                range
            }
            (Some((lmin, lmax)), Some((rmin, rmax))) => (lmin.min(rmin), lmax.max(rmax)),
        };
        let (min_key, max_key) = range;
        let upper = exclusive_upper_bound(max_key, &left.key_kinds()?);

        let left = left.new_key_bounds(min_key.clone(), upper.clone());
        let right = right.new_key_bounds(min_key.clone(), upper.clone());
        info!(
            "diffing key range {}..{:?}, size: left <= {:?}, right <= {:?}",
            min_key,
            upper.key(),
            left.approximate_size(),
            right.approximate_size()
        );

        if !self.assume_unique_key {
            let (lu, ru) = tokio::join!(
                left.ensure_unique_key(cancel.clone()),
                right.ensure_unique_key(cancel.clone())
            );
            lu?;
            ru?;
        }

        let ctx = Arc::new(Ctx {
            factor: self.bisection_factor,
            threshold: self.bisection_threshold,
            sink,
        });
        diff_segments(ctx, left, right, 0, None, 1, 1).await
    }
}

/// The upper bound for the united key range: exclusive `max+1` when the
/// trailing key component is an integer, inclusive otherwise (strings
/// have no cheap successor).
fn exclusive_upper_bound(max_key: Key, kinds: &[KeyKind]) -> KeyBound {
    if kinds.last() == Some(&KeyKind::Int) {
        let mut values = max_key.0;
        if let Some(KeyValue::Int(last)) = values.last_mut() {
            *last += 1;
        }
        KeyBound::Excluded(Key(values))
    } else {
        KeyBound::Included(max_key)
    }
}

/// Checksum one segment pair; recurse on disagreement.
fn diff_segments(
    ctx: Arc<Ctx>,
    left: TableSegment,
    right: TableSegment,
    level: usize,
    max_rows: Option<i64>,
    index: usize,
    total: usize,
) -> BoxFuture<'static, Result<()>> {
    async move {
        if ctx.sink.cancel.is_cancelled() {
            return Err(DiffError::Cancelled);
        }
        info!(
            "{}diffing segment {index}/{total}, key range {:?}..{:?}, size <= {}",
            ". ".repeat(level),
            left.min_key(),
            left.max_key().key(),
            max_rows.map(|v| v.to_string()).unwrap_or_else(|| "?".into()),
        );

        let cancel = ctx.sink.cancel.clone();
        let (left_result, right_result) = tokio::join!(
            left.count_and_checksum(cancel.clone()),
            right.count_and_checksum(cancel)
        );
        let (count1, checksum1) = left_result?;
        let (count2, checksum2) = right_result?;

        if count1 == 0 && count2 == 0 {
            debug!(
                "uneven distribution of keys in segment {:?}..{:?} (gaps in the key column); \
                 consider increasing the bisection threshold",
                left.min_key(),
                left.max_key().key(),
            );
            return Ok(());
        }

        if count1 == count2 && checksum1 == checksum2 {
            return Ok(());
        }

        bisect_and_diff(ctx, left, right, level, (count1, count2)).await
    }
    .boxed()
}

/// Split a mismatching pair into children, or download it when small.
fn bisect_and_diff(
    ctx: Arc<Ctx>,
    left: TableSegment,
    right: TableSegment,
    level: usize,
    counts: (i64, i64),
) -> BoxFuture<'static, Result<()>> {
    async move {
        debug_assert!(left.is_bounded() && right.is_bounded());
        let max_rows = counts.0.max(counts.1);
        let max_space = match (left.approximate_size(), right.approximate_size()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        // Small segments are cheaper to download than to keep bisecting.
        let too_small_to_split =
            max_space.is_some_and(|space| space < (ctx.factor as u128) * 2);
        if max_rows < ctx.threshold || too_small_to_split {
            return download_and_diff(ctx, left, right, level).await;
        }

        // Checkpoints come from the side with the larger count; the same
        // checkpoints are applied to both sides so children align.
        let base = if counts.1 > counts.0 { &right } else { &left };
        let checkpoints = base
            .choose_checkpoints(ctx.factor, max_rows, ctx.sink.cancel.clone())
            .await?;
        if checkpoints.is_empty() {
            return download_and_diff(ctx, left, right, level).await;
        }

        let left_children = left.segment_by_checkpoints(&checkpoints);
        let right_children = right.segment_by_checkpoints(&checkpoints);
        let total = left_children.len();

        let mut tasks = JoinSet::new();
        for (index, (l, r)) in left_children
            .into_iter()
            .zip(right_children)
            .enumerate()
        {
            let ctx = Arc::clone(&ctx);
            tasks.spawn(diff_segments(
                ctx,
                l,
                r,
                level + 1,
                Some(max_rows),
                index + 1,
                total,
            ));
        }

        let mut first_error: Option<DiffError> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| DiffError::query(format!("diff task failed: {e}")))?;
            if let Err(err) = result {
                if first_error.is_none() || first_error.as_ref().is_some_and(|f| f.is_cancelled())
                {
                    if !err.is_cancelled() {
                        ctx.sink.cancel.cancel();
                    }
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
    .boxed()
}

/// Download both sides and emit their row-level differences.
async fn download_and_diff(
    ctx: Arc<Ctx>,
    left: TableSegment,
    right: TableSegment,
    level: usize,
) -> Result<()> {
    let cancel = ctx.sink.cancel.clone();
    let (left_stream, right_stream) = tokio::join!(
        left.get_values(cancel.clone()),
        right.get_values(cancel.clone())
    );
    let (left_rows, right_rows) = tokio::join!(left_stream?.collect(), right_stream?.collect());
    let (left_rows, right_rows) = (left_rows?, right_rows?);

    ctx.sink.stats.rows_downloaded.fetch_add(
        left_rows.len().max(right_rows.len()) as u64,
        atomic::Ordering::Relaxed,
    );

    let kinds = left.key_kinds()?;
    let diff = diff_downloaded_rows(
        keyed_rows(left_rows, &kinds)?,
        keyed_rows(right_rows, &kinds)?,
    );
    info!("{}diff found {} different rows", ". ".repeat(level), diff.len());

    for record in diff {
        ctx.sink.send(record).await?;
    }
    Ok(())
}

fn keyed_rows(rows: Vec<Row>, kinds: &[KeyKind]) -> Result<Vec<(Key, Row)>> {
    let mut keyed = rows
        .into_iter()
        .map(|row| Ok((Key::from_row(&row, kinds)?, row)))
        .collect::<Result<Vec<_>>>()?;
    // Database collation may not match the local key order; the merge
    // join below requires the local order.
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed)
}

/// Merge-join two key-sorted row sets into diff records, in key order.
/// A key on one side only yields one record; a key with differing rows
/// yields a `-`/`+` pair, left first.
fn diff_downloaded_rows(
    left: Vec<(Key, Row)>,
    right: Vec<(Key, Row)>,
) -> Vec<DiffRecord> {
    let mut diff = Vec::new();
    let mut left_iter = left.into_iter().peekable();
    let mut right_iter = right.into_iter().peekable();

    loop {
        match (left_iter.peek(), right_iter.peek()) {
            (Some((lk, _)), Some((rk, _))) => match lk.cmp(rk) {
                Ordering::Less => {
                    let (_, row) = left_iter.next().expect("peeked");
                    diff.push(DiffRecord { sign: Sign::Minus, row });
                }
                Ordering::Greater => {
                    let (_, row) = right_iter.next().expect("peeked");
                    diff.push(DiffRecord { sign: Sign::Plus, row });
                }
                Ordering::Equal => {
                    let (_, left_row) = left_iter.next().expect("peeked");
                    let (_, right_row) = right_iter.next().expect("peeked");
                    if left_row != right_row {
                        diff.push(DiffRecord { sign: Sign::Minus, row: left_row });
                        diff.push(DiffRecord { sign: Sign::Plus, row: right_row });
                    }
                }
            },
            (Some(_), None) => {
                let (_, row) = left_iter.next().expect("peeked");
                diff.push(DiffRecord { sign: Sign::Minus, row });
            }
            (None, Some(_)) => {
                let (_, row) = right_iter.next().expect("peeked");
                diff.push(DiffRecord { sign: Sign::Plus, row });
            }
            (None, None) => break,
        }
    }
    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(v: i128) -> Key {
        Key::single(KeyValue::Int(v))
    }

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|c| Some(c.to_string())).collect()
    }

    #[test]
    fn test_identical_rows_no_diff() {
        let a = vec![(key(1), row(&["1", "x"])), (key(2), row(&["2", "y"]))];
        assert!(diff_downloaded_rows(a.clone(), a).is_empty());
    }

    #[test]
    fn test_exclusive_rows() {
        let a = vec![(key(1), row(&["1", "x"])), (key(2), row(&["2", "y"]))];
        let b = vec![(key(2), row(&["2", "y"])), (key(3), row(&["3", "z"]))];
        let diff = diff_downloaded_rows(a, b);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[0].sign, Sign::Minus);
        assert_eq!(diff[0].row[0].as_deref(), Some("1"));
        assert_eq!(diff[1].sign, Sign::Plus);
        assert_eq!(diff[1].row[0].as_deref(), Some("3"));
    }

    #[test]
    fn test_modified_row_emits_pair_in_order() {
        let a = vec![(key(5), row(&["5", "old"]))];
        let b = vec![(key(5), row(&["5", "new"]))];
        let diff = diff_downloaded_rows(a, b);
        assert_eq!(diff.len(), 2);
        assert_eq!(diff[0].sign, Sign::Minus);
        assert_eq!(diff[0].row[1].as_deref(), Some("old"));
        assert_eq!(diff[1].sign, Sign::Plus);
        assert_eq!(diff[1].row[1].as_deref(), Some("new"));
    }

    #[test]
    fn test_null_cells_compare() {
        let a = vec![(key(1), vec![Some("1".into()), None])];
        let b = vec![(key(1), vec![Some("1".into()), Some("x".into())])];
        let diff = diff_downloaded_rows(a, b);
        assert_eq!(diff.len(), 2);
    }

    #[test]
    fn test_output_is_in_key_order() {
        let a = vec![
            (key(1), row(&["1"])),
            (key(3), row(&["3"])),
            (key(9), row(&["9"])),
        ];
        let b = vec![(key(2), row(&["2"])), (key(3), row(&["3"]))];
        let diff = diff_downloaded_rows(a, b);
        let keys: Vec<&str> = diff.iter().map(|d| d.row[0].as_deref().unwrap()).collect();
        assert_eq!(keys, vec!["1", "2", "9"]);
    }

    #[test]
    fn test_keyed_rows_sorts_numerically() {
        let rows = vec![row(&["10", "a"]), row(&["9", "b"])];
        let keyed = keyed_rows(rows, &[KeyKind::Int]).unwrap();
        assert_eq!(keyed[0].0, key(9));
        assert_eq!(keyed[1].0, key(10));
    }

    #[test]
    fn test_exclusive_upper_bound_int_is_exclusive() {
        let bound = exclusive_upper_bound(key(10), &[KeyKind::Int]);
        assert_eq!(bound, KeyBound::Excluded(key(11)));
    }

    #[test]
    fn test_exclusive_upper_bound_text_is_inclusive() {
        let bound = exclusive_upper_bound(
            Key::single(KeyValue::Text("zz".into())),
            &[KeyKind::Text],
        );
        assert_eq!(
            bound,
            KeyBound::Included(Key::single(KeyValue::Text("zz".into())))
        );
    }

    #[test]
    fn test_differ_validates_factor() {
        assert!(HashDiffer::new(1, 1000).is_err());
        assert!(HashDiffer::new(32, 16).is_err());
        assert!(HashDiffer::new(32, 16384).is_ok());
    }
}
