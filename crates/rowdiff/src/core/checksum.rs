//! The cross-database checksum protocol.
//!
//! Every dialect renders a SQL expression that computes, per row:
//!
//! 1. the canonical row serialisation: canonicalised column expressions,
//!    each wrapped `COALESCE(expr, 'NULL')`, joined with `'|'`;
//! 2. the lowercase MD5 hex digest of that string;
//! 3. the last [`CHECKSUM_HEX_DIGITS`] hex digits parsed as a base-16
//!    integer (60 bits, so every engine's BIGINT cast agrees);
//! 4. reduction modulo [`CHECKSUM_MODULUS`], a Mersenne prime that fits a
//!    signed 64-bit integer.
//!
//! Segment checksums are the bitwise-XOR aggregate of row checksums. XOR
//! makes the checksum order-independent and composable: for disjoint row
//! sets A and B, `checksum(A ∪ B) = checksum(A) ^ checksum(B)`.
//!
//! This module is the protocol's reference implementation; the dialect
//! adapters must produce bit-identical integers in SQL.

/// Number of trailing hex digits of the MD5 digest that enter the checksum.
pub const CHECKSUM_HEX_DIGITS: usize = 15;

/// 1-based character offset of the first checksum digit inside the
/// 32-digit MD5 hex string, for SQL `SUBSTRING` rendering.
pub const CHECKSUM_HEX_OFFSET: usize = 33 - CHECKSUM_HEX_DIGITS;

/// Checksum modulus: the Mersenne prime 2^61 - 1.
pub const CHECKSUM_MODULUS: i64 = 2_305_843_009_213_693_951;

/// Sentinel for NULL cells inside the canonical serialisation.
pub const NULL_SENTINEL: &str = "NULL";

/// Separator between cells of the canonical serialisation.
pub const FIELD_SEPARATOR: char = '|';

/// Serialise a row of canonicalised cells.
pub fn canonical_serialisation(cells: &[Option<String>]) -> String {
    cells
        .iter()
        .map(|c| c.as_deref().unwrap_or(NULL_SENTINEL))
        .collect::<Vec<_>>()
        .join(&FIELD_SEPARATOR.to_string())
}

/// Checksum of a single canonical serialisation.
pub fn row_checksum(serialised: &str) -> i64 {
    let digest = format!("{:x}", md5::compute(serialised.as_bytes()));
    checksum_from_hex(&digest)
}

/// Parse a full lowercase MD5 hex digest into a row checksum.
pub fn checksum_from_hex(digest: &str) -> i64 {
    debug_assert_eq!(digest.len(), 32);
    let tail = &digest[digest.len() - CHECKSUM_HEX_DIGITS..];
    let value = i64::from_str_radix(tail, 16).expect("md5 digest is valid hex");
    value % CHECKSUM_MODULUS
}

/// XOR-aggregate row checksums into a segment checksum.
/// Returns `None` for an empty segment, matching SQL's NULL aggregate.
pub fn aggregate(rows: impl IntoIterator<Item = i64>) -> Option<i64> {
    let mut acc: Option<i64> = None;
    for v in rows {
        acc = Some(acc.unwrap_or(0) ^ v);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_checksum_is_deterministic_and_bounded() {
        let a = row_checksum("1|alice|2021-03-01 00:00:00.000000");
        let b = row_checksum("1|alice|2021-03-01 00:00:00.000000");
        assert_eq!(a, b);
        assert!(a >= 0);
        assert!(a < CHECKSUM_MODULUS);
    }

    #[test]
    fn test_known_digest_parse() {
        // md5("") = d41d8cd98f00b204e9800998ecf8427e; tail 15 digits.
        let digest = format!("{:x}", md5::compute(b""));
        assert_eq!(digest, "d41d8cd98f00b204e9800998ecf8427e");
        let expected = i64::from_str_radix("9800998ecf8427e", 16).unwrap() % CHECKSUM_MODULUS;
        assert_eq!(checksum_from_hex(&digest), expected);
    }

    #[test]
    fn test_substring_offset_matches_digit_count() {
        // SQL SUBSTRING(digest, CHECKSUM_HEX_OFFSET) must yield exactly the
        // trailing CHECKSUM_HEX_DIGITS characters of a 32-char digest.
        assert_eq!(32 - (CHECKSUM_HEX_OFFSET - 1), CHECKSUM_HEX_DIGITS);
    }

    #[test]
    fn test_null_sentinel_in_serialisation() {
        let cells = vec![Some("1".to_string()), None, Some("x".to_string())];
        assert_eq!(canonical_serialisation(&cells), "1|NULL|x");
    }

    #[test]
    fn test_xor_aggregate_composes() {
        let rows: Vec<i64> = (0..100)
            .map(|i| row_checksum(&format!("{i}|value-{i}")))
            .collect();
        let (left, right) = rows.split_at(37);
        let whole = aggregate(rows.iter().copied()).unwrap();
        let composed = aggregate(left.iter().copied()).unwrap()
            ^ aggregate(right.iter().copied()).unwrap();
        assert_eq!(whole, composed);
    }

    #[test]
    fn test_xor_aggregate_is_order_independent() {
        let rows: Vec<i64> = (0..50).map(|i| row_checksum(&i.to_string())).collect();
        let mut reversed = rows.clone();
        reversed.reverse();
        assert_eq!(aggregate(rows), aggregate(reversed));
    }

    #[test]
    fn test_empty_aggregate_is_none() {
        assert_eq!(aggregate(std::iter::empty()), None);
    }
}
