//! Composite keys packed into a single ordered integer.

use pasha_common::{Key, PashaError, Result};

/// Mixed-radix packing of multi-column keys.
///
/// Column `i` takes values in `0..=max[i]`, so the packed key is
/// `((c0 * (max1 + 1)) + c1) * (max2 + 1) + c2 ...`. Packed keys compare in
/// the same order as the column tuples, which keeps range scans over a key
/// prefix contiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPacker {
    max: Vec<u64>,
}

impl KeyPacker {
    pub fn new(max: Vec<u64>) -> Result<Self> {
        if max.is_empty() {
            return Err(PashaError::ConfigError("key has no columns".to_string()));
        }
        // Packed keys stay below u64::MAX, the ordered-table placeholder.
        let mut span: u64 = 1;
        for m in &max {
            span = m
                .checked_add(1)
                .and_then(|r| span.checked_mul(r))
                .ok_or_else(|| PashaError::InvalidParameter {
                    name: "key column bounds".to_string(),
                    value: format!("{max:?}"),
                })?;
        }
        Ok(Self { max })
    }

    pub fn columns(&self) -> usize {
        self.max.len()
    }

    pub fn pack(&self, cols: &[u64]) -> Key {
        assert_eq!(cols.len(), self.max.len(), "key column count");
        let mut key = 0u64;
        for (c, m) in cols.iter().zip(&self.max) {
            assert!(c <= m, "key column {c} above bound {m}");
            key = key * (m + 1) + c;
        }
        key
    }

    pub fn unpack(&self, mut key: Key) -> Vec<u64> {
        let mut cols = vec![0; self.max.len()];
        for (slot, m) in cols.iter_mut().zip(&self.max).rev() {
            *slot = key % (m + 1);
            key /= m + 1;
        }
        cols
    }

    /// Smallest and largest packed keys sharing the leading `prefix`
    /// columns. The upper bound is exclusive.
    pub fn prefix_range(&self, prefix: &[u64]) -> (Key, Key) {
        assert!(prefix.len() <= self.max.len(), "prefix longer than key");
        let mut lo = prefix.to_vec();
        lo.resize(self.max.len(), 0);
        let mut hi = prefix.to_vec();
        hi.extend_from_slice(&self.max[prefix.len()..]);
        (self.pack(&lo), self.pack(&hi) + 1)
    }
}
