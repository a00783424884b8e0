//! Extent model and validation.
//!
//! An extent describes a run of either allocated ("data") or unallocated
//! ("hole") bytes on a disk. A well-formed extent list is sorted, covers
//! `[0, virtual_size)` with no gaps, and has no two adjacent entries sharing
//! the same `data` flag (those would always have been merged).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single run of allocated or unallocated bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
    pub data: bool,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Validates that `extents` are sorted, contiguous, and cover exactly
/// `[0, virtual_size)`.
pub fn validate(extents: &[Extent], virtual_size: u64) -> Result<()> {
    if extents.is_empty() {
        if virtual_size == 0 {
            return Ok(());
        }
        return Err(Error::stream_format("empty extent list for non-empty disk"));
    }

    if extents[0].offset != 0 {
        return Err(Error::stream_format("extent list does not start at offset 0"));
    }

    for pair in extents.windows(2) {
        if pair[0].end() != pair[1].offset {
            return Err(Error::stream_format(format!(
                "extent gap or overlap between {:?} and {:?}",
                pair[0], pair[1]
            )));
        }
    }

    let last = extents.last().expect("checked non-empty above");
    if last.end() != virtual_size {
        return Err(Error::stream_format(format!(
            "extent list covers up to {} but virtual size is {}",
            last.end(),
            virtual_size
        )));
    }

    Ok(())
}

/// Merges adjacent extents that share the same `data` flag. Used after
/// intersecting a dirty bitmap with the base allocation map, which can
/// otherwise yield spurious boundaries.
pub fn merge_adjacent(extents: Vec<Extent>) -> Vec<Extent> {
    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents {
        if let Some(last) = merged.last_mut() {
            if last.data == extent.data && last.end() == extent.offset {
                last.length += extent.length;
                continue;
            }
        }
        merged.push(extent);
    }
    merged
}

/// Only the `data` extents, used by the backup pipeline to skip holes when
/// writing a sparse stream.
pub fn data_extents(extents: &[Extent]) -> impl Iterator<Item = &Extent> {
    extents.iter().filter(|e| e.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_full_coverage() {
        let extents = vec![
            Extent { offset: 0, length: 100, data: true },
            Extent { offset: 100, length: 50, data: false },
        ];
        assert!(validate(&extents, 150).is_ok());
    }

    #[test]
    fn validate_rejects_gap() {
        let extents = vec![
            Extent { offset: 0, length: 100, data: true },
            Extent { offset: 150, length: 50, data: false },
        ];
        assert!(validate(&extents, 200).is_err());
    }

    #[test]
    fn validate_rejects_short_coverage() {
        let extents = vec![Extent { offset: 0, length: 100, data: true }];
        assert!(validate(&extents, 200).is_err());
    }

    #[test]
    fn validate_accepts_empty_disk() {
        assert!(validate(&[], 0).is_ok());
    }

    #[test]
    fn merge_adjacent_combines_same_flag_runs() {
        let extents = vec![
            Extent { offset: 0, length: 10, data: true },
            Extent { offset: 10, length: 10, data: true },
            Extent { offset: 20, length: 5, data: false },
        ];
        let merged = merge_adjacent(extents);
        assert_eq!(
            merged,
            vec![
                Extent { offset: 0, length: 20, data: true },
                Extent { offset: 20, length: 5, data: false },
            ]
        );
    }

    #[test]
    fn data_extents_filters_holes() {
        let extents = vec![
            Extent { offset: 0, length: 10, data: true },
            Extent { offset: 10, length: 10, data: false },
        ];
        let data: Vec<_> = data_extents(&extents).collect();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].offset, 0);
    }
}
