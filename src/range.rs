//! Byte-range parsing and arithmetic.
//!
//! A client `Range` header is first parsed into a [`StorageRange`], the
//! descriptor handed to storage backends (offset + optional length, or a
//! trailing suffix). Resolving a descriptor against the object size yields
//! the inclusive [`RangeSpec`] used for slicing and for `Content-Range`.

/// Store-native range descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRange {
    /// Start at `offset`; read `length` bytes, or to the end when `None`.
    Offset { offset: u64, length: Option<u64> },
    /// The last `n` bytes of the object.
    Suffix(u64),
}

/// A resolved, inclusive byte range within an object of `total_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start_inclusive: u64,
    pub end_inclusive: u64,
    pub total_size: u64,
}

impl RangeSpec {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start_inclusive + 1
    }

    /// `Content-Range` header value, e.g. `bytes 900-999/1000`.
    pub fn content_range(&self) -> String {
        format!(
            "bytes {}-{}/{}",
            self.start_inclusive, self.end_inclusive, self.total_size
        )
    }

    /// The covered positions as a `usize` slice range.
    pub fn as_slice_range(&self) -> std::ops::Range<usize> {
        self.start_inclusive as usize..(self.end_inclusive + 1) as usize
    }
}

impl StorageRange {
    /// Resolve the descriptor against an object of `total` bytes.
    ///
    /// Ends past the object are clamped to the last byte. Returns `None`
    /// when nothing can be served: an empty object, a start at or past the
    /// end, or a zero length.
    pub fn resolve(&self, total: u64) -> Option<RangeSpec> {
        if total == 0 {
            return None;
        }
        let (start, end) = match *self {
            StorageRange::Offset { offset, length } => {
                if offset >= total {
                    return None;
                }
                let end = match length {
                    Some(0) => return None,
                    Some(len) => offset.saturating_add(len - 1).min(total - 1),
                    None => total - 1,
                };
                (offset, end)
            }
            StorageRange::Suffix(n) => {
                if n == 0 {
                    return None;
                }
                (total.saturating_sub(n), total - 1)
            }
        };
        Some(RangeSpec {
            start_inclusive: start,
            end_inclusive: end,
            total_size: total,
        })
    }
}

/// Parse a Range header value like "bytes=0-4", "bytes=5-", "bytes=-3".
/// Returns None if the header is not a valid single bytes range.
pub fn parse_range_header(range_str: &str) -> Option<StorageRange> {
    let spec = range_str.trim().strip_prefix("bytes=")?;

    // Only support a single range (no multi-range).
    if spec.contains(',') {
        return None;
    }

    if let Some(suffix) = spec.strip_prefix('-') {
        let n: u64 = suffix.trim().parse().ok()?;
        if n == 0 {
            return None;
        }
        Some(StorageRange::Suffix(n))
    } else if let Some(stripped) = spec.strip_suffix('-') {
        let offset: u64 = stripped.trim().parse().ok()?;
        Some(StorageRange::Offset {
            offset,
            length: None,
        })
    } else if let Some((start_s, end_s)) = spec.split_once('-') {
        let start: u64 = start_s.trim().parse().ok()?;
        let end: u64 = end_s.trim().parse().ok()?;
        if start > end {
            return None;
        }
        Some(StorageRange::Offset {
            offset: start,
            length: Some(end - start + 1),
        })
    } else {
        None
    }
}
