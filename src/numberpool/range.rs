//! Range Search
//!
//! Lowest free integer at or above a rotating offset inside `[start, end]`,
//! wrapping around to `start` when the top of the range is exhausted.

use crate::error::{Error, Result};

/// Find a free number given the ascending list of occupied numbers
///
/// Searches `[offset, end]` first, then `[start, offset - 1]`. An offset
/// outside the range is treated as `start`. Fails with
/// [`Error::ExhaustedPool`] iff every number in `[start, end]` is occupied.
pub fn get_free_number(occupied: &[i32], offset: i32, start: i32, end: i32) -> Result<i32> {
    let exhausted = || Error::ExhaustedPool {
        pool: "range".into(),
        start,
        end,
    };
    if start > end {
        return Err(exhausted());
    }

    let offset = if (start..=end).contains(&offset) {
        offset
    } else {
        start
    };

    if let Some(free) = first_gap(occupied, offset, end) {
        return Ok(free);
    }
    if offset > start {
        if let Some(free) = first_gap(occupied, start, offset - 1) {
            return Ok(free);
        }
    }
    Err(exhausted())
}

/// First number in `[from, to]` missing from `occupied`
fn first_gap(occupied: &[i32], from: i32, to: i32) -> Option<i32> {
    // i64 so that a candidate past i32::MAX terminates the walk
    let mut candidate = from as i64;
    let mut idx = occupied.partition_point(|&nr| (nr as i64) < candidate);

    while candidate <= to as i64 {
        match occupied.get(idx) {
            Some(&nr) if nr as i64 == candidate => {
                candidate += 1;
                // skip duplicates
                idx += occupied[idx..].partition_point(|&nr| (nr as i64) < candidate);
            }
            _ => return Some(candidate as i32),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_empty_pool() {
        assert_eq!(get_free_number(&[], 100, 100, 1000).unwrap(), 100);
    }

    #[test]
    fn test_gap_at_offset() {
        let occupied = [103, 104, 105, 110, 111, 112, 113, 120];
        assert_eq!(get_free_number(&occupied, 100, 100, 1000).unwrap(), 100);
    }

    #[test]
    fn test_walks_over_occupied_run() {
        let occupied = [101, 102, 104, 108, 111, 132, 133, 134, 135];
        assert_eq!(get_free_number(&occupied, 132, 100, 1000).unwrap(), 136);
    }

    #[test]
    fn test_wraparound() {
        let occupied = [102, 103, 104, 105, 106, 997, 998, 999, 1000];
        assert_eq!(get_free_number(&occupied, 998, 100, 1000).unwrap(), 100);
    }

    #[test]
    fn test_exhausted() {
        let occupied: Vec<i32> = (100..=110).collect();
        assert_matches!(
            get_free_number(&occupied, 105, 100, 110),
            Err(Error::ExhaustedPool { start: 100, end: 110, .. })
        );
    }

    #[test]
    fn test_wraparound_finds_gap_below_offset() {
        let occupied = [100, 101, 103, 104, 105];
        assert_eq!(get_free_number(&occupied, 103, 100, 105).unwrap(), 102);
    }

    #[test]
    fn test_occupied_outside_range_ignored() {
        let occupied = [1, 2, 3, 5000];
        assert_eq!(get_free_number(&occupied, 0, 1, 10).unwrap(), 4);
    }

    #[test]
    fn test_duplicates_and_upper_bound() {
        let occupied = [i32::MAX - 1, i32::MAX - 1, i32::MAX];
        assert_matches!(
            get_free_number(&occupied, i32::MAX - 1, i32::MAX - 1, i32::MAX),
            Err(Error::ExhaustedPool { .. })
        );
        assert_eq!(
            get_free_number(&occupied, i32::MAX - 1, i32::MAX - 2, i32::MAX).unwrap(),
            i32::MAX - 2
        );
    }
}
