//! Layout segment arithmetic
//!
//! Ranges are half-open `[offset, offset + length)`; a length of
//! `u64::MAX` means "to the end of the file". Segments of one layout state
//! are kept so that no two segments of the same type and iomode overlap.

use super::{LayoutIoMode, LayoutType};

/// Byte range of a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutRange {
    /// Offset
    pub offset: u64,
    /// Length; `u64::MAX` extends to end of file
    pub length: u64,
}

impl LayoutRange {
    /// Create a range
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// The whole file
    pub fn whole() -> Self {
        Self {
            offset: 0,
            length: u64::MAX,
        }
    }

    /// Build from half-open bounds
    pub fn from_bounds(start: u64, end: u64) -> Self {
        let length = if end == u64::MAX {
            u64::MAX
        } else {
            end.saturating_sub(start)
        };
        Self {
            offset: start,
            length,
        }
    }

    /// Exclusive end offset, saturating at `u64::MAX`
    pub fn end(&self) -> u64 {
        if self.length == u64::MAX {
            u64::MAX
        } else {
            self.offset.saturating_add(self.length)
        }
    }

    /// Zero-length range
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Ranges share at least one byte
    pub fn overlaps(&self, other: &LayoutRange) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Ranges overlap or touch end to start
    pub fn touches(&self, other: &LayoutRange) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }

    /// `other` lies entirely within `self`
    pub fn contains(&self, other: &LayoutRange) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    /// Smallest range covering both
    pub fn union(&self, other: &LayoutRange) -> LayoutRange {
        LayoutRange::from_bounds(self.offset.min(other.offset), self.end().max(other.end()))
    }

    /// Bytes common to both, if any
    pub fn intersection(&self, other: &LayoutRange) -> Option<LayoutRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(LayoutRange::from_bounds(
            self.offset.max(other.offset),
            self.end().min(other.end()),
        ))
    }
}

/// A layout segment held by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Layout type
    pub layout_type: LayoutType,
    /// I/O mode
    pub iomode: LayoutIoMode,
    /// Range held
    pub range: LayoutRange,
    /// Returned implicitly when the last open is closed
    pub return_on_close: bool,
}

impl Layout {
    fn same_kind(&self, other: &Layout) -> bool {
        self.layout_type == other.layout_type && self.iomode == other.iomode
    }
}

/// What a return did to one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trim {
    /// No overlap
    Untouched,
    /// Returned range covers the segment
    Removed,
    /// Returned range is strictly inside; the segment is not split
    Retained,
    /// Returned range covers one edge; the segment now has this range
    Shrunk(LayoutRange),
}

/// Apply a returned range to a held range
pub fn trim(held: &LayoutRange, returned: &LayoutRange) -> Trim {
    if !held.overlaps(returned) {
        return Trim::Untouched;
    }
    if returned.contains(held) {
        return Trim::Removed;
    }
    if held.offset < returned.offset && returned.end() < held.end() {
        return Trim::Retained;
    }
    if held.offset < returned.offset {
        Trim::Shrunk(LayoutRange::from_bounds(held.offset, returned.offset))
    } else {
        Trim::Shrunk(LayoutRange::from_bounds(returned.end(), held.end()))
    }
}

/// Insert a granted segment
///
/// Overlapping segments of the same type and iomode are always coalesced;
/// merely adjacent ones only when `merge_adjacent` is set.
pub fn insert(segments: &mut Vec<Layout>, granted: Layout, merge_adjacent: bool) -> Layout {
    let mut merged = granted;
    loop {
        let position = segments.iter().position(|s| {
            s.same_kind(&merged)
                && (s.range.overlaps(&merged.range)
                    || (merge_adjacent && s.range.touches(&merged.range)))
        });
        match position {
            Some(index) => {
                let absorbed = segments.swap_remove(index);
                merged.range = merged.range.union(&absorbed.range);
                merged.return_on_close |= absorbed.return_on_close;
            }
            None => break,
        }
    }
    segments.push(merged);
    segments.sort_by_key(|s| (s.layout_type as u32, s.iomode as u32, s.range.offset));
    merged
}

/// A range released from one segment by a return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    /// Layout type of the segment
    pub layout_type: LayoutType,
    /// I/O mode of the segment
    pub iomode: LayoutIoMode,
    /// Bytes the client gave up
    pub range: LayoutRange,
}

/// Trim every matching segment by `returned`
///
/// Returns the ranges actually released; a retained segment releases nothing.
pub fn release(
    segments: &mut Vec<Layout>,
    layout_type: LayoutType,
    iomode: LayoutIoMode,
    returned: &LayoutRange,
) -> Vec<Released> {
    let mut released = Vec::new();
    segments.retain_mut(|segment| {
        if segment.layout_type != layout_type || !iomode.covers(segment.iomode) {
            return true;
        }
        match trim(&segment.range, returned) {
            Trim::Untouched | Trim::Retained => true,
            Trim::Removed => {
                released.push(Released {
                    layout_type: segment.layout_type,
                    iomode: segment.iomode,
                    range: segment.range,
                });
                false
            }
            Trim::Shrunk(range) => {
                if let Some(gone) = segment.range.intersection(returned) {
                    released.push(Released {
                        layout_type: segment.layout_type,
                        iomode: segment.iomode,
                        range: gone,
                    });
                }
                segment.range = range;
                !range.is_empty()
            }
        }
    });
    released
}

/// Whether any segment matches a type, iomode and range
pub fn any_matching(
    segments: &[Layout],
    layout_type: LayoutType,
    iomode: LayoutIoMode,
    range: &LayoutRange,
) -> bool {
    segments.iter().any(|s| {
        s.layout_type == layout_type && iomode.covers(s.iomode) && s.range.overlaps(range)
    })
}
